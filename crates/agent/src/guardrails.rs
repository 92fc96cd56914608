use std::sync::Arc;

use chrono::{DateTime, Utc};

use frontdesk_core::domain::action::{ActionDefinition, ExclusionReason};
use frontdesk_core::policy::{PolicyStore, RateLimitDecision};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GuardrailDecision {
    Allow,
    Deny { reason: ExclusionReason, detail: String },
}

impl GuardrailDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// Tenant policy checks applied to every proposed action before it is returned.
#[derive(Clone)]
pub struct PolicyGuardrail {
    policies: Arc<PolicyStore>,
}

impl PolicyGuardrail {
    pub fn new(policies: Arc<PolicyStore>) -> Self {
        Self { policies }
    }

    pub fn policies(&self) -> &PolicyStore {
        &self.policies
    }

    /// The action's category is the policy resource it touches.
    pub fn evaluate_access(
        &self,
        tenant_id: &str,
        definition: &ActionDefinition,
    ) -> GuardrailDecision {
        let action = definition.action_type.as_str();
        let resource = definition.category.as_str();
        if self.policies.can(tenant_id, action, resource) {
            return GuardrailDecision::Allow;
        }
        GuardrailDecision::Deny {
            reason: ExclusionReason::PolicyDenied,
            detail: format!("tenant policy does not grant `{action}` on `{resource}`"),
        }
    }

    pub fn evaluate_rate(
        &self,
        tenant_id: &str,
        definition: &ActionDefinition,
    ) -> GuardrailDecision {
        self.evaluate_rate_at(tenant_id, definition, Utc::now())
    }

    pub fn evaluate_rate_at(
        &self,
        tenant_id: &str,
        definition: &ActionDefinition,
        now: DateTime<Utc>,
    ) -> GuardrailDecision {
        match self.policies.check_rate_limit_at(tenant_id, definition.default_level, now) {
            RateLimitDecision::Allowed { .. } | RateLimitDecision::Unlimited => {
                GuardrailDecision::Allow
            }
            RateLimitDecision::Limited { retry_after_secs } => GuardrailDecision::Deny {
                reason: ExclusionReason::RateLimited,
                detail: format!("suggestion rate cap reached, retry in {retry_after_secs}s"),
            },
        }
    }

    pub fn model_allowed(&self, tenant_id: &str, model: &str) -> bool {
        self.policies.model_allowed(tenant_id, model)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{Duration, TimeZone, Utc};

    use frontdesk_core::catalog::ActionCatalog;
    use frontdesk_core::domain::action::{ActionType, ExclusionReason};
    use frontdesk_core::domain::policy::PolicyEntry;
    use frontdesk_core::ledger::OperationCostTable;
    use frontdesk_core::policy::PolicyStore;

    use super::{GuardrailDecision, PolicyGuardrail};

    fn catalog() -> ActionCatalog {
        ActionCatalog::standard(&OperationCostTable::default())
    }

    #[test]
    fn access_follows_tenant_policy_over_default() {
        let store = PolicyStore::with_default(PolicyEntry::allow_all());
        store.add_policy(
            "dental-1",
            PolicyEntry {
                actions: vec!["send_sms".to_owned()],
                resources: vec!["communication".to_owned()],
                conditions: Default::default(),
            },
        );
        let guardrail = PolicyGuardrail::new(Arc::new(store));
        let catalog = catalog();
        let sms = catalog.get(&ActionType::new("send_sms")).expect("sms");
        let delete = catalog.get(&ActionType::new("delete_resource")).expect("delete");

        assert!(guardrail.evaluate_access("dental-1", sms).is_allowed());
        match guardrail.evaluate_access("dental-1", delete) {
            GuardrailDecision::Deny { reason, .. } => {
                assert_eq!(reason, ExclusionReason::PolicyDenied);
                assert_eq!(reason.as_str(), "policy_denied");
            }
            GuardrailDecision::Allow => panic!("delete should be denied for dental-1"),
        }
        assert!(guardrail.evaluate_access("gym-9", delete).is_allowed());
    }

    #[test]
    fn rate_cap_only_counts_suggestion_class_actions() {
        let store = PolicyStore::with_default(PolicyEntry::allow_all().with_rate_limit(1, 60));
        let guardrail = PolicyGuardrail::new(Arc::new(store));
        let catalog = catalog();
        let email = catalog.get(&ActionType::new("send_email")).expect("email");
        let approval = catalog.get(&ActionType::new("request_approval")).expect("approval");
        let now = Utc.with_ymd_and_hms(2026, 6, 1, 8, 0, 0).single().expect("time");

        assert!(guardrail.evaluate_rate_at("hotel-1", email, now).is_allowed());
        match guardrail.evaluate_rate_at("hotel-1", email, now) {
            GuardrailDecision::Deny { reason, .. } => {
                assert_eq!(reason, ExclusionReason::RateLimited);
            }
            GuardrailDecision::Allow => panic!("second email should hit the cap"),
        }
        assert!(guardrail.evaluate_rate_at("hotel-1", approval, now).is_allowed());
        assert!(guardrail
            .evaluate_rate_at("hotel-1", email, now + Duration::seconds(61))
            .is_allowed());
    }
}
