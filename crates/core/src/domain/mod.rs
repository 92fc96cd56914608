pub mod action;
pub mod conversation;
pub mod envelope;
pub mod ledger;
pub mod policy;
