//! Per-tenant allow-lists and the suggestion-class rate cap.

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use chrono::{DateTime, Duration, Utc};

use crate::domain::action::DecisionLevel;
use crate::domain::policy::{PolicyDocument, PolicyEntry, RateLimit, DEFAULT_TENANT};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed { remaining: u32 },
    /// The level is not suggestion-class, or no cap is configured for the tenant.
    Unlimited,
    Limited { retry_after_secs: u64 },
}

impl RateLimitDecision {
    pub fn is_allowed(&self) -> bool {
        !matches!(self, Self::Limited { .. })
    }
}

#[derive(Clone, Copy, Debug)]
struct RateWindow {
    started_at: DateTime<Utc>,
    count: u32,
}

#[derive(Debug, Default)]
pub struct PolicyStore {
    entries: RwLock<HashMap<String, Vec<PolicyEntry>>>,
    windows: Mutex<HashMap<String, RateWindow>>,
}

impl PolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store whose `default` tenant holds `entry`.
    pub fn with_default(entry: PolicyEntry) -> Self {
        let store = Self::new();
        store.add_policy(DEFAULT_TENANT, entry);
        store
    }

    /// Loads every tenant list from `document`; `fallback` becomes the default
    /// policy when the document does not define one.
    pub fn from_document(document: PolicyDocument, fallback: PolicyEntry) -> Self {
        let mut entries: HashMap<String, Vec<PolicyEntry>> =
            document.tenants.into_iter().collect();
        entries
            .entry(DEFAULT_TENANT.to_owned())
            .and_modify(|list| {
                if list.is_empty() {
                    list.push(fallback.clone());
                }
            })
            .or_insert_with(|| vec![fallback]);

        Self { entries: RwLock::new(entries), windows: Mutex::new(HashMap::new()) }
    }

    pub fn add_policy(&self, tenant_id: &str, entry: PolicyEntry) {
        self.write_entries(|entries| {
            entries.entry(tenant_id.to_owned()).or_default().push(entry);
        });
    }

    /// Removes the entry at `index` of the tenant's own list. Out of range is a no-op.
    pub fn remove_policy(&self, tenant_id: &str, index: usize) -> Option<PolicyEntry> {
        self.write_entries(|entries| {
            let list = entries.get_mut(tenant_id)?;
            (index < list.len()).then(|| list.remove(index))
        })
    }

    pub fn policies(&self, tenant_id: &str) -> Vec<PolicyEntry> {
        self.read_entries(|entries| entries.get(tenant_id).cloned().unwrap_or_default())
    }

    /// Tenant entries, or the default tenant's when the tenant has none.
    pub fn effective_policies(&self, tenant_id: &str) -> Vec<PolicyEntry> {
        self.read_entries(|entries| {
            entries
                .get(tenant_id)
                .filter(|list| !list.is_empty())
                .or_else(|| entries.get(DEFAULT_TENANT))
                .cloned()
                .unwrap_or_default()
        })
    }

    pub fn can(&self, tenant_id: &str, action: &str, resource: &str) -> bool {
        self.effective_policies(tenant_id).iter().any(|entry| entry.grants(action, resource))
    }

    /// Empty allow-lists admit any model; otherwise some effective entry must list it.
    pub fn model_allowed(&self, tenant_id: &str, model: &str) -> bool {
        let policies = self.effective_policies(tenant_id);
        let lists: Vec<&Vec<String>> = policies
            .iter()
            .map(|entry| &entry.conditions.allowed_models)
            .filter(|models| !models.is_empty())
            .collect();

        lists.is_empty() || lists.iter().any(|models| models.iter().any(|value| value == model))
    }

    pub fn rate_limit(&self, tenant_id: &str) -> Option<RateLimit> {
        self.effective_policies(tenant_id)
            .into_iter()
            .find_map(|entry| entry.conditions.suggestion_rate_limit)
    }

    pub fn check_rate_limit(&self, tenant_id: &str, level: DecisionLevel) -> RateLimitDecision {
        self.check_rate_limit_at(tenant_id, level, Utc::now())
    }

    /// Fixed-window cap on suggestion-class actions. An allowed check consumes one unit.
    pub fn check_rate_limit_at(
        &self,
        tenant_id: &str,
        level: DecisionLevel,
        now: DateTime<Utc>,
    ) -> RateLimitDecision {
        if !level.is_suggestion_class() {
            return RateLimitDecision::Unlimited;
        }
        let Some(limit) = self.rate_limit(tenant_id) else {
            return RateLimitDecision::Unlimited;
        };

        let window_len = Duration::seconds(i64::try_from(limit.window_secs).unwrap_or(i64::MAX));
        let mut windows = match self.windows.lock() {
            Ok(windows) => windows,
            Err(poisoned) => poisoned.into_inner(),
        };
        let window = windows
            .entry(tenant_id.to_owned())
            .or_insert(RateWindow { started_at: now, count: 0 });

        if now - window.started_at >= window_len {
            *window = RateWindow { started_at: now, count: 0 };
        }

        if window.count >= limit.max_actions {
            let elapsed = (now - window.started_at).num_seconds().max(0) as u64;
            return RateLimitDecision::Limited {
                retry_after_secs: limit.window_secs.saturating_sub(elapsed),
            };
        }

        window.count += 1;
        RateLimitDecision::Allowed { remaining: limit.max_actions - window.count }
    }

    fn read_entries<T>(&self, read: impl FnOnce(&HashMap<String, Vec<PolicyEntry>>) -> T) -> T {
        match self.entries.read() {
            Ok(entries) => read(&entries),
            Err(poisoned) => read(&poisoned.into_inner()),
        }
    }

    fn write_entries<T>(
        &self,
        write: impl FnOnce(&mut HashMap<String, Vec<PolicyEntry>>) -> T,
    ) -> T {
        match self.entries.write() {
            Ok(mut entries) => write(&mut entries),
            Err(poisoned) => write(&mut poisoned.into_inner()),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};

    use super::{PolicyStore, RateLimitDecision};
    use crate::domain::action::DecisionLevel;
    use crate::domain::policy::{PolicyConditions, PolicyDocument, PolicyEntry};

    fn scoped(actions: &[&str], resources: &[&str]) -> PolicyEntry {
        PolicyEntry {
            actions: actions.iter().map(|value| (*value).to_owned()).collect(),
            resources: resources.iter().map(|value| (*value).to_owned()).collect(),
            conditions: PolicyConditions::default(),
        }
    }

    #[test]
    fn tenant_without_policies_falls_back_to_default() {
        let store = PolicyStore::with_default(scoped(&["send_email"], &["communication"]));

        assert!(store.can("hotel-1", "send_email", "communication"));
        assert!(!store.can("hotel-1", "send_sms", "communication"));
    }

    #[test]
    fn tenant_policies_replace_the_default_entirely() {
        let store = PolicyStore::with_default(PolicyEntry::allow_all());
        store.add_policy("gym-3", scoped(&["send_sms"], &["*"]));

        assert!(store.can("gym-3", "send_sms", "communication"));
        assert!(!store.can("gym-3", "delete_resource", "resource_management"));
        assert!(store.can("dental-1", "delete_resource", "resource_management"));
    }

    #[test]
    fn removal_is_index_addressed_and_restores_fallback() {
        let store = PolicyStore::with_default(PolicyEntry::allow_all());
        store.add_policy("gym-3", scoped(&["send_sms"], &["*"]));
        store.add_policy("gym-3", scoped(&["send_email"], &["*"]));

        assert!(store.remove_policy("gym-3", 5).is_none());
        let removed = store.remove_policy("gym-3", 0).expect("first entry");
        assert_eq!(removed.actions, vec!["send_sms".to_owned()]);
        assert_eq!(store.policies("gym-3").len(), 1);
        assert!(!store.can("gym-3", "send_sms", "communication"));

        store.remove_policy("gym-3", 0);
        assert!(store.can("gym-3", "send_sms", "communication"));
    }

    #[test]
    fn rate_limit_denies_after_cap_until_window_resets() {
        let store = PolicyStore::with_default(PolicyEntry::allow_all().with_rate_limit(2, 60));
        let start = Utc.with_ymd_and_hms(2026, 6, 1, 8, 0, 0).single().expect("time");

        assert_eq!(
            store.check_rate_limit_at("t-1", DecisionLevel::Automatic, start),
            RateLimitDecision::Allowed { remaining: 1 }
        );
        assert!(store.check_rate_limit_at("t-1", DecisionLevel::Suggestion, start).is_allowed());
        let later = start + Duration::seconds(10);
        let limited = store.check_rate_limit_at("t-1", DecisionLevel::Automatic, later);
        assert_eq!(limited, RateLimitDecision::Limited { retry_after_secs: 50 });

        assert_eq!(
            store.check_rate_limit_at("t-1", DecisionLevel::ApprovalRequired, start),
            RateLimitDecision::Unlimited
        );
        assert!(store.check_rate_limit_at("t-2", DecisionLevel::Automatic, start).is_allowed());
        assert!(store
            .check_rate_limit_at("t-1", DecisionLevel::Automatic, start + Duration::seconds(60))
            .is_allowed());
    }

    #[test]
    fn model_allow_list_is_optional() {
        let store = PolicyStore::with_default(PolicyEntry::allow_all());
        assert!(store.model_allowed("t-1", "anything"));

        let mut restricted = PolicyEntry::allow_all();
        restricted.conditions.allowed_models = vec!["llama3.1".to_owned()];
        store.add_policy("t-2", restricted);
        assert!(store.model_allowed("t-2", "llama3.1"));
        assert!(!store.model_allowed("t-2", "gpt-4o"));
    }

    #[test]
    fn document_without_default_gets_fallback() {
        let mut document = PolicyDocument::default();
        document.tenants.insert("hotel-1".to_owned(), vec![scoped(&["send_email"], &["*"])]);

        let store = PolicyStore::from_document(document, PolicyEntry::allow_all());

        assert!(!store.can("hotel-1", "send_sms", "communication"));
        assert!(store.can("other", "send_sms", "communication"));
    }
}
