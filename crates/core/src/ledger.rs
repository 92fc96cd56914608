//! Per-tenant metered token ledger.
//!
//! Balances are keyed by tenant and location. All mutations go through a
//! [`LedgerStore`], which owns the atomicity guarantee: a debit re-checks the
//! balance, moves the counters and appends the usage entry as one unit, or does
//! nothing at all. [`ResourceLedger`] prices operations and exposes the
//! tenant-facing operations on top of a store.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::ledger::{
    AccountKey, DebitOutcome, FeePeriod, LedgerAccount, MonthlyFeeOutcome, OperationType,
    UsageDraft, UsageLogEntry,
};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("ledger storage failure: {0}")]
    Storage(String),
    #[error("operation `{0}` has no configured token cost")]
    UnpricedOperation(OperationType),
    #[error("balance overflow on account {0}")]
    Overflow(AccountKey),
}

/// Fixed token cost per billable operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperationCostTable {
    costs: BTreeMap<OperationType, u64>,
}

impl Default for OperationCostTable {
    fn default() -> Self {
        Self::empty()
            .with_cost(OperationType::EMAIL_SEND, 2)
            .with_cost(OperationType::SMS_SEND, 3)
            .with_cost(OperationType::CALL_SCHEDULE, 5)
            .with_cost(OperationType::RESOURCE_WRITE, 1)
            .with_cost(OperationType::COORDINATION, 0)
            .with_cost(OperationType::MONTHLY_FEE, 100)
    }
}

impl OperationCostTable {
    pub fn empty() -> Self {
        Self { costs: BTreeMap::new() }
    }

    pub fn with_cost(mut self, operation: impl Into<String>, tokens: u64) -> Self {
        self.set_cost(operation, tokens);
        self
    }

    pub fn set_cost(&mut self, operation: impl Into<String>, tokens: u64) {
        self.costs.insert(OperationType::new(operation), tokens);
    }

    pub fn cost(&self, operation: &OperationType) -> Option<u64> {
        self.costs.get(operation).copied()
    }

    pub fn price(&self, operation: &OperationType) -> Result<u64, LedgerError> {
        self.cost(operation).ok_or_else(|| LedgerError::UnpricedOperation(operation.clone()))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&OperationType, u64)> {
        self.costs.iter().map(|(operation, tokens)| (operation, *tokens))
    }
}

/// Storage port for ledger accounts. Implementations must make `debit`,
/// `credit` and `charge_monthly_fee` atomic per account, including across
/// processes when the store is shared.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn find(&self, key: &AccountKey) -> Result<Option<LedgerAccount>, LedgerError>;

    async fn get_or_create(&self, key: &AccountKey) -> Result<LedgerAccount, LedgerError>;

    async fn debit(&self, key: &AccountKey, draft: UsageDraft)
        -> Result<DebitOutcome, LedgerError>;

    async fn credit(&self, key: &AccountKey, tokens: u64) -> Result<LedgerAccount, LedgerError>;

    async fn charge_monthly_fee(
        &self,
        key: &AccountKey,
        draft: UsageDraft,
        now: DateTime<Utc>,
    ) -> Result<MonthlyFeeOutcome, LedgerError>;

    async fn usage_log(&self, key: &AccountKey) -> Result<Vec<UsageLogEntry>, LedgerError>;
}

#[derive(Default)]
struct InMemoryLedgerState {
    accounts: HashMap<AccountKey, LedgerAccount>,
    usage: Vec<UsageLogEntry>,
}

impl InMemoryLedgerState {
    fn account_mut(&mut self, key: &AccountKey, now: DateTime<Utc>) -> &mut LedgerAccount {
        self.accounts
            .entry(key.clone())
            .or_insert_with(|| LedgerAccount::empty(key.clone(), now))
    }

    fn apply_debit(
        &mut self,
        key: &AccountKey,
        draft: UsageDraft,
        now: DateTime<Utc>,
    ) -> DebitOutcome {
        let account = self.account_mut(key, now);
        if account.available < draft.tokens {
            return DebitOutcome::Insufficient {
                required: draft.tokens,
                available: account.available,
            };
        }

        account.available -= draft.tokens;
        account.lifetime_used += draft.tokens;
        account.updated_at = now;
        let account = account.clone();

        let entry = usage_entry(key, draft, now);
        self.usage.push(entry.clone());
        DebitOutcome::Charged { account, entry }
    }
}

/// Process-local store. One mutex guards every account, so concurrent
/// mutations are fully serialized.
#[derive(Clone, Default)]
pub struct InMemoryLedgerStore {
    state: Arc<Mutex<InMemoryLedgerState>>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, apply: impl FnOnce(&mut InMemoryLedgerState) -> T) -> T {
        match self.state.lock() {
            Ok(mut state) => apply(&mut state),
            Err(poisoned) => apply(&mut poisoned.into_inner()),
        }
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn find(&self, key: &AccountKey) -> Result<Option<LedgerAccount>, LedgerError> {
        Ok(self.with_state(|state| state.accounts.get(key).cloned()))
    }

    async fn get_or_create(&self, key: &AccountKey) -> Result<LedgerAccount, LedgerError> {
        Ok(self.with_state(|state| state.account_mut(key, Utc::now()).clone()))
    }

    async fn debit(
        &self,
        key: &AccountKey,
        draft: UsageDraft,
    ) -> Result<DebitOutcome, LedgerError> {
        Ok(self.with_state(|state| state.apply_debit(key, draft, Utc::now())))
    }

    async fn credit(&self, key: &AccountKey, tokens: u64) -> Result<LedgerAccount, LedgerError> {
        self.with_state(|state| {
            let account = state.account_mut(key, Utc::now());
            let available = account.available.checked_add(tokens);
            let purchased = account.lifetime_purchased.checked_add(tokens);
            let (Some(available), Some(purchased)) = (available, purchased) else {
                return Err(LedgerError::Overflow(key.clone()));
            };
            account.available = available;
            account.lifetime_purchased = purchased;
            account.updated_at = Utc::now();
            Ok(account.clone())
        })
    }

    async fn charge_monthly_fee(
        &self,
        key: &AccountKey,
        draft: UsageDraft,
        now: DateTime<Utc>,
    ) -> Result<MonthlyFeeOutcome, LedgerError> {
        Ok(self.with_state(|state| {
            let period = FeePeriod::of(now);
            if state.account_mut(key, now).fee_recorded_for(period) {
                return MonthlyFeeOutcome::AlreadyCharged { period };
            }

            match state.apply_debit(key, draft, now) {
                DebitOutcome::Charged { mut account, entry } => {
                    let stored = state.account_mut(key, now);
                    stored.last_monthly_fee = Some(now.date_naive());
                    account.last_monthly_fee = stored.last_monthly_fee;
                    MonthlyFeeOutcome::Charged { account, entry }
                }
                DebitOutcome::Insufficient { required, available } => {
                    MonthlyFeeOutcome::Insufficient { required, available }
                }
            }
        }))
    }

    async fn usage_log(&self, key: &AccountKey) -> Result<Vec<UsageLogEntry>, LedgerError> {
        Ok(self.with_state(|state| {
            state
                .usage
                .iter()
                .filter(|entry| {
                    entry.tenant_id == key.tenant_id && entry.location_id == key.location_id
                })
                .cloned()
                .collect()
        }))
    }
}

pub fn usage_entry(key: &AccountKey, draft: UsageDraft, now: DateTime<Utc>) -> UsageLogEntry {
    UsageLogEntry {
        entry_id: Uuid::new_v4().to_string(),
        tenant_id: key.tenant_id.clone(),
        location_id: key.location_id.clone(),
        user_id: draft.user_id,
        session_id: draft.session_id,
        operation: draft.operation,
        tokens: draft.tokens,
        description: draft.description,
        metadata: draft.metadata,
        recorded_at: now,
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Availability {
    pub sufficient: bool,
    pub required: u64,
    pub available: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DebitRequest {
    pub tenant_id: String,
    pub location_id: Option<String>,
    pub operation: OperationType,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub description: String,
    pub metadata: Value,
}

#[derive(Clone)]
pub struct ResourceLedger {
    store: Arc<dyn LedgerStore>,
    costs: OperationCostTable,
}

impl ResourceLedger {
    pub fn new(store: Arc<dyn LedgerStore>, costs: OperationCostTable) -> Self {
        Self { store, costs }
    }

    pub fn in_memory(costs: OperationCostTable) -> Self {
        Self::new(Arc::new(InMemoryLedgerStore::new()), costs)
    }

    pub fn costs(&self) -> &OperationCostTable {
        &self.costs
    }

    pub async fn get_or_create(
        &self,
        tenant_id: &str,
        location_id: Option<&str>,
    ) -> Result<LedgerAccount, LedgerError> {
        self.store.get_or_create(&AccountKey::new(tenant_id, location_id)).await
    }

    /// Read-only check; never reserves tokens, so a later debit may still fail.
    pub async fn check_availability(
        &self,
        tenant_id: &str,
        location_id: Option<&str>,
        operation: &OperationType,
    ) -> Result<Availability, LedgerError> {
        let required = self.costs.price(operation)?;
        let key = AccountKey::new(tenant_id, location_id);
        let available =
            self.store.find(&key).await?.map(|account| account.available).unwrap_or(0);
        Ok(Availability { sufficient: available >= required, required, available })
    }

    /// Charges the operation's cost. `DebitOutcome::Insufficient` means nothing
    /// was charged and the underlying action must not be treated as billed.
    pub async fn debit(&self, request: DebitRequest) -> Result<DebitOutcome, LedgerError> {
        let tokens = self.costs.price(&request.operation)?;
        let key = AccountKey::new(request.tenant_id, request.location_id.as_deref());
        let draft = UsageDraft {
            operation: request.operation,
            tokens,
            user_id: request.user_id,
            session_id: request.session_id,
            description: request.description,
            metadata: request.metadata,
        };
        self.store.debit(&key, draft).await
    }

    pub async fn credit(
        &self,
        tenant_id: &str,
        location_id: Option<&str>,
        tokens: u64,
    ) -> Result<LedgerAccount, LedgerError> {
        self.store.credit(&AccountKey::new(tenant_id, location_id), tokens).await
    }

    pub async fn monthly_fee(
        &self,
        tenant_id: &str,
        location_id: Option<&str>,
    ) -> Result<MonthlyFeeOutcome, LedgerError> {
        self.monthly_fee_at(tenant_id, location_id, Utc::now()).await
    }

    /// At most one fee per calendar month; the fee date moves only when the debit succeeds.
    pub async fn monthly_fee_at(
        &self,
        tenant_id: &str,
        location_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<MonthlyFeeOutcome, LedgerError> {
        let operation = OperationType::monthly_fee();
        let tokens = self.costs.price(&operation)?;
        let period = FeePeriod::of(now);
        let draft = UsageDraft {
            operation,
            tokens,
            user_id: None,
            session_id: None,
            description: format!("monthly fee {}-{:02}", period.year, period.month),
            metadata: serde_json::json!({ "year": period.year, "month": period.month }),
        };
        self.store.charge_monthly_fee(&AccountKey::new(tenant_id, location_id), draft, now).await
    }

    pub async fn usage_log(
        &self,
        tenant_id: &str,
        location_id: Option<&str>,
    ) -> Result<Vec<UsageLogEntry>, LedgerError> {
        self.store.usage_log(&AccountKey::new(tenant_id, location_id)).await
    }
}
