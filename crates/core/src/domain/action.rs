use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::domain::ledger::OperationType;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActionType(pub String);

impl ActionType {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionCategory {
    Communication,
    ResourceManagement,
    Coordination,
}

impl ActionCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Communication => "communication",
            Self::ResourceManagement => "resource_management",
            Self::Coordination => "coordination",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "communication" => Some(Self::Communication),
            "resource_management" => Some(Self::ResourceManagement),
            "coordination" => Some(Self::Coordination),
            _ => None,
        }
    }
}

/// Required human involvement, ordered from least to most restrictive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionLevel {
    Automatic,
    Suggestion,
    Consultation,
    ApprovalRequired,
}

impl DecisionLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Automatic => "AUTOMATIC",
            Self::Suggestion => "SUGGESTION",
            Self::Consultation => "CONSULTATION",
            Self::ApprovalRequired => "APPROVAL_REQUIRED",
        }
    }

    /// Suggestion-class actions are the ones subject to the per-tenant rate cap.
    pub fn is_suggestion_class(&self) -> bool {
        matches!(self, Self::Automatic | Self::Suggestion)
    }

    /// Most restrictive level among `levels`, `Automatic` when empty.
    pub fn aggregate<I>(levels: I) -> Self
    where
        I: IntoIterator<Item = DecisionLevel>,
    {
        levels.into_iter().max().unwrap_or(Self::Automatic)
    }
}

#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Urgent,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Urgent => "urgent",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "low" => Some(Self::Low),
            "medium" | "normal" => Some(Self::Medium),
            "high" => Some(Self::High),
            "urgent" | "critical" => Some(Self::Urgent),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterKind {
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
}

impl ParameterKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::Object => "object",
            Self::Array => "array",
        }
    }

    pub fn matches(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    pub kind: ParameterKind,
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl ParameterSpec {
    pub fn required(name: impl Into<String>, kind: ParameterKind) -> Self {
        Self { name: name.into(), kind, required: true, default: None }
    }

    pub fn optional(name: impl Into<String>, kind: ParameterKind) -> Self {
        Self { name: name.into(), kind, required: false, default: None }
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActionDefinition {
    pub action_type: ActionType,
    pub category: ActionCategory,
    pub description: String,
    pub permissions: Vec<String>,
    pub parameters: Vec<ParameterSpec>,
    pub token_cost: u64,
    pub operation: OperationType,
    pub default_level: DecisionLevel,
    pub requires_approval: bool,
}

impl ActionDefinition {
    pub fn parameter(&self, name: &str) -> Option<&ParameterSpec> {
        self.parameters.iter().find(|spec| spec.name == name)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionContext {
    pub tenant_id: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionRequest {
    #[serde(rename = "type")]
    pub action_type: ActionType,
    pub context: ActionContext,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionErrorKind {
    UnknownAction,
    Validation,
    Authorization,
    ResourceExhausted,
    ExternalCollaborator,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionExecutionResult {
    #[serde(rename = "type")]
    pub action_type: ActionType,
    pub success: bool,
    pub result: Option<Value>,
    pub tokens_used: u64,
    pub charged: bool,
    pub execution_time_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ActionErrorKind>,
}

impl ActionExecutionResult {
    pub fn failure(
        action_type: ActionType,
        kind: ActionErrorKind,
        error: impl Into<String>,
        execution_time_ms: u64,
    ) -> Self {
        Self {
            action_type,
            success: false,
            result: None,
            tokens_used: 0,
            charged: false,
            execution_time_ms,
            error: Some(error.into()),
            error_kind: Some(kind),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExclusionReason {
    UnknownAction,
    NotPermitted,
    InvalidParameters,
    PolicyDenied,
    RateLimited,
    InsufficientTokens,
    LedgerUnavailable,
}

impl ExclusionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UnknownAction => "unknown_action",
            Self::NotPermitted => "not_permitted",
            Self::InvalidParameters => "invalid_parameters",
            Self::PolicyDenied => "policy_denied",
            Self::RateLimited => "rate_limited",
            Self::InsufficientTokens => "insufficient_tokens",
            Self::LedgerUnavailable => "ledger_unavailable",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExcludedAction {
    #[serde(rename = "type")]
    pub action_type: ActionType,
    pub reason: ExclusionReason,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionResult {
    pub actions: Vec<ActionRequest>,
    pub decision_level: DecisionLevel,
    pub reasoning: String,
    pub confidence: u8,
    pub requires_human_input: bool,
    #[serde(default)]
    pub excluded: Vec<ExcludedAction>,
}

impl DecisionResult {
    pub const PARSE_FAILURE: &'static str = "parse failure";

    pub fn parse_failure() -> Self {
        Self {
            actions: Vec::new(),
            decision_level: DecisionLevel::Automatic,
            reasoning: Self::PARSE_FAILURE.to_string(),
            confidence: 0,
            requires_human_input: false,
            excluded: Vec::new(),
        }
    }
}
