//! Decision and execution half of the frontdesk pipeline.
//!
//! - `decision` asks the language model which catalog actions fit an inbound
//!   message and screens every proposal against permissions, policy and budget.
//! - `dispatcher` runs accepted actions through `handlers` and bills the tenant
//!   ledger once a handler has succeeded.
//!
//! The model only proposes. Whether an action is allowed, affordable and well formed
//! is always decided here, deterministically.

pub mod authz;
pub mod decision;
pub mod dispatcher;
pub mod guardrails;
pub mod handlers;
pub mod llm;
pub mod prompt;

pub use authz::{AuthzError, PermissionResolver, StaticPermissionResolver};
pub use decision::{DecisionEngine, DecisionError, DecisionInput};
pub use dispatcher::ActionDispatcher;
pub use guardrails::{GuardrailDecision, PolicyGuardrail};
pub use handlers::{ActionHandler, HandlerError, HandlerRegistry};
pub use llm::{HttpLlmClient, LlmClient, LlmError, ScriptedLlmClient};
pub use prompt::{PromptBuilder, PromptError};
