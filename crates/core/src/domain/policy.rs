use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Tenant key whose policies apply to tenants without their own entries.
pub const DEFAULT_TENANT: &str = "default";

pub const WILDCARD: &str = "*";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    pub max_actions: u32,
    pub window_secs: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyConditions {
    #[serde(default)]
    pub suggestion_rate_limit: Option<RateLimit>,
    #[serde(default)]
    pub allowed_models: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyEntry {
    pub actions: Vec<String>,
    pub resources: Vec<String>,
    #[serde(default)]
    pub conditions: PolicyConditions,
}

impl PolicyEntry {
    pub fn allow_all() -> Self {
        Self {
            actions: vec![WILDCARD.to_owned()],
            resources: vec![WILDCARD.to_owned()],
            conditions: PolicyConditions::default(),
        }
    }

    pub fn with_rate_limit(mut self, max_actions: u32, window_secs: u64) -> Self {
        self.conditions.suggestion_rate_limit = Some(RateLimit { max_actions, window_secs });
        self
    }

    pub fn grants(&self, action: &str, resource: &str) -> bool {
        matches_any(&self.actions, action) && matches_any(&self.resources, resource)
    }
}

fn matches_any(patterns: &[String], value: &str) -> bool {
    patterns.iter().any(|pattern| pattern == WILDCARD || pattern == value)
}

/// On-disk policy file: `[[tenants.<tenant_id>]]` tables of `PolicyEntry`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDocument {
    #[serde(default)]
    pub tenants: BTreeMap<String, Vec<PolicyEntry>>,
}
