use std::fmt;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Location used when a tenant has no per-location accounts.
pub const DEFAULT_LOCATION: &str = "default";

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccountKey {
    pub tenant_id: String,
    pub location_id: String,
}

impl AccountKey {
    pub fn new(tenant_id: impl Into<String>, location_id: Option<&str>) -> Self {
        let location_id = location_id
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(DEFAULT_LOCATION)
            .to_owned();
        Self { tenant_id: tenant_id.into(), location_id }
    }
}

impl fmt::Display for AccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tenant_id, self.location_id)
    }
}

/// Billable operation kind; each has a fixed token cost in the metering table.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OperationType(pub String);

impl OperationType {
    pub const EMAIL_SEND: &'static str = "email_send";
    pub const SMS_SEND: &'static str = "sms_send";
    pub const CALL_SCHEDULE: &'static str = "call_schedule";
    pub const RESOURCE_WRITE: &'static str = "resource_write";
    pub const COORDINATION: &'static str = "coordination";
    pub const MONTHLY_FEE: &'static str = "monthly_fee";

    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn monthly_fee() -> Self {
        Self::new(Self::MONTHLY_FEE)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerAccount {
    pub key: AccountKey,
    pub available: u64,
    pub lifetime_purchased: u64,
    pub lifetime_used: u64,
    pub last_monthly_fee: Option<NaiveDate>,
    pub updated_at: DateTime<Utc>,
}

impl LedgerAccount {
    pub fn empty(key: AccountKey, now: DateTime<Utc>) -> Self {
        Self {
            key,
            available: 0,
            lifetime_purchased: 0,
            lifetime_used: 0,
            last_monthly_fee: None,
            updated_at: now,
        }
    }

    pub fn is_balanced(&self) -> bool {
        self.lifetime_purchased.checked_sub(self.lifetime_used) == Some(self.available)
    }

    pub fn fee_recorded_for(&self, period: FeePeriod) -> bool {
        self.last_monthly_fee.map(FeePeriod::of_date) == Some(period)
    }
}

/// Calendar month a monthly fee belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FeePeriod {
    pub year: i32,
    pub month: u32,
}

impl FeePeriod {
    pub fn of(at: DateTime<Utc>) -> Self {
        Self::of_date(at.date_naive())
    }

    pub fn of_date(date: NaiveDate) -> Self {
        Self { year: date.year(), month: date.month() }
    }
}

/// Debit request handed to a ledger store; becomes a `UsageLogEntry` when charged.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UsageDraft {
    pub operation: OperationType,
    pub tokens: u64,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub description: String,
    pub metadata: Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UsageLogEntry {
    pub entry_id: String,
    pub tenant_id: String,
    pub location_id: String,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub operation: OperationType,
    pub tokens: u64,
    pub description: String,
    pub metadata: Value,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum DebitOutcome {
    Charged { account: LedgerAccount, entry: UsageLogEntry },
    Insufficient { required: u64, available: u64 },
}

impl DebitOutcome {
    pub fn is_charged(&self) -> bool {
        matches!(self, Self::Charged { .. })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum MonthlyFeeOutcome {
    Charged { account: LedgerAccount, entry: UsageLogEntry },
    AlreadyCharged { period: FeePeriod },
    Insufficient { required: u64, available: u64 },
}
