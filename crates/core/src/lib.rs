pub mod audit;
pub mod catalog;
pub mod config;
pub mod dedup;
pub mod domain;
pub mod errors;
pub mod ledger;
pub mod policy;

pub use audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink};
pub use catalog::{ActionCatalog, ValidationReport};
pub use dedup::{DedupClaim, DedupError, DedupState, DedupStore, InMemoryDedupCache};
pub use domain::action::{
    ActionCategory, ActionContext, ActionDefinition, ActionErrorKind, ActionExecutionResult,
    ActionRequest, ActionType, DecisionLevel, DecisionResult, ExcludedAction, ExclusionReason,
    ParameterKind, ParameterSpec, Priority,
};
pub use domain::envelope::{Envelope, EnvelopePayload, EnvelopeType, MessageContext, MessageId};
pub use domain::ledger::{
    AccountKey, DebitOutcome, LedgerAccount, MonthlyFeeOutcome, OperationType, UsageLogEntry,
};
pub use domain::policy::{PolicyDocument, PolicyEntry};
pub use errors::{ApplicationError, DomainError, InterfaceError};
pub use ledger::{
    DebitRequest, InMemoryLedgerStore, LedgerError, LedgerStore, OperationCostTable,
    ResourceLedger,
};
pub use policy::{PolicyStore, RateLimitDecision};
