use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, Transaction};

use frontdesk_core::domain::ledger::{
    AccountKey, DebitOutcome, FeePeriod, LedgerAccount, MonthlyFeeOutcome, OperationType,
    UsageDraft, UsageLogEntry,
};
use frontdesk_core::ledger::{usage_entry, LedgerError, LedgerStore};

use super::{from_db_int, parse_timestamp, timestamp, to_db_int, RepositoryError};
use crate::DbPool;

/// Ledger backed by the shared SQL store. Debits are a conditional update plus
/// the usage insert inside one transaction, so two processes can never both
/// spend the last tokens of an account.
#[derive(Clone)]
pub struct SqlLedgerStore {
    pool: DbPool,
}

impl SqlLedgerStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

const ACCOUNT_COLUMNS: &str = "tenant_id, location_id, available, lifetime_purchased, \
                               lifetime_used, last_monthly_fee, updated_at";

fn account_from_row(row: &SqliteRow) -> Result<LedgerAccount, RepositoryError> {
    let last_monthly_fee: Option<String> = row.try_get("last_monthly_fee")?;
    let last_monthly_fee = last_monthly_fee
        .map(|value| {
            NaiveDate::parse_from_str(&value, "%Y-%m-%d").map_err(|error| {
                RepositoryError::Decode(format!("invalid fee date `{value}`: {error}"))
            })
        })
        .transpose()?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(LedgerAccount {
        key: AccountKey {
            tenant_id: row.try_get("tenant_id")?,
            location_id: row.try_get("location_id")?,
        },
        available: from_db_int(row.try_get("available")?)?,
        lifetime_purchased: from_db_int(row.try_get("lifetime_purchased")?)?,
        lifetime_used: from_db_int(row.try_get("lifetime_used")?)?,
        last_monthly_fee,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

fn usage_from_row(row: &SqliteRow) -> Result<UsageLogEntry, RepositoryError> {
    let metadata_json: String = row.try_get("metadata_json")?;
    let recorded_at: String = row.try_get("recorded_at")?;
    let operation: String = row.try_get("operation")?;

    Ok(UsageLogEntry {
        entry_id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        location_id: row.try_get("location_id")?,
        user_id: row.try_get("user_id")?,
        session_id: row.try_get("session_id")?,
        operation: OperationType::new(operation),
        tokens: from_db_int(row.try_get("tokens")?)?,
        description: row.try_get("description")?,
        metadata: serde_json::from_str(&metadata_json)
            .map_err(|error| RepositoryError::Decode(error.to_string()))?,
        recorded_at: parse_timestamp(&recorded_at)?,
    })
}

async fn ensure_account(
    tx: &mut Transaction<'_, Sqlite>,
    key: &AccountKey,
    now: DateTime<Utc>,
) -> Result<(), RepositoryError> {
    sqlx::query(
        "INSERT INTO ledger_account (tenant_id, location_id, updated_at)
         VALUES (?, ?, ?)
         ON CONFLICT(tenant_id, location_id) DO NOTHING",
    )
    .bind(&key.tenant_id)
    .bind(&key.location_id)
    .bind(timestamp(now))
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn load_account(
    tx: &mut Transaction<'_, Sqlite>,
    key: &AccountKey,
) -> Result<LedgerAccount, RepositoryError> {
    let row = sqlx::query(&format!(
        "SELECT {ACCOUNT_COLUMNS} FROM ledger_account WHERE tenant_id = ? AND location_id = ?"
    ))
    .bind(&key.tenant_id)
    .bind(&key.location_id)
    .fetch_one(&mut **tx)
    .await?;
    account_from_row(&row)
}

async fn insert_usage(
    tx: &mut Transaction<'_, Sqlite>,
    entry: &UsageLogEntry,
) -> Result<(), RepositoryError> {
    let metadata_json = serde_json::to_string(&entry.metadata)
        .map_err(|error| RepositoryError::Decode(error.to_string()))?;

    sqlx::query(
        "INSERT INTO usage_log (id, tenant_id, location_id, user_id, session_id, operation,
                                tokens, description, metadata_json, recorded_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&entry.entry_id)
    .bind(&entry.tenant_id)
    .bind(&entry.location_id)
    .bind(&entry.user_id)
    .bind(&entry.session_id)
    .bind(entry.operation.as_str())
    .bind(to_db_int(entry.tokens)?)
    .bind(&entry.description)
    .bind(metadata_json)
    .bind(timestamp(entry.recorded_at))
    .execute(&mut **tx)
    .await?;
    Ok(())
}

impl SqlLedgerStore {
    async fn debit_inner(
        &self,
        key: &AccountKey,
        draft: UsageDraft,
    ) -> Result<DebitOutcome, RepositoryError> {
        let now = Utc::now();
        let tokens = to_db_int(draft.tokens)?;
        let mut tx = self.pool.begin().await?;
        ensure_account(&mut tx, key, now).await?;

        let updated = sqlx::query(
            "UPDATE ledger_account
             SET available = available - ?, lifetime_used = lifetime_used + ?, updated_at = ?
             WHERE tenant_id = ? AND location_id = ? AND available >= ?",
        )
        .bind(tokens)
        .bind(tokens)
        .bind(timestamp(now))
        .bind(&key.tenant_id)
        .bind(&key.location_id)
        .bind(tokens)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            let account = load_account(&mut tx, key).await?;
            tx.commit().await?;
            return Ok(DebitOutcome::Insufficient {
                required: draft.tokens,
                available: account.available,
            });
        }

        let entry = usage_entry(key, draft, now);
        insert_usage(&mut tx, &entry).await?;
        let account = load_account(&mut tx, key).await?;
        tx.commit().await?;

        Ok(DebitOutcome::Charged { account, entry })
    }

    async fn credit_inner(
        &self,
        key: &AccountKey,
        tokens: u64,
    ) -> Result<Result<LedgerAccount, LedgerError>, RepositoryError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        ensure_account(&mut tx, key, now).await?;

        let current = load_account(&mut tx, key).await?;
        let fits = current
            .available
            .checked_add(tokens)
            .zip(current.lifetime_purchased.checked_add(tokens))
            .map(|(available, purchased)| {
                available <= i64::MAX as u64 && purchased <= i64::MAX as u64
            })
            .unwrap_or(false);
        if !fits {
            return Ok(Err(LedgerError::Overflow(key.clone())));
        }

        let delta = to_db_int(tokens)?;
        sqlx::query(
            "UPDATE ledger_account
             SET available = available + ?, lifetime_purchased = lifetime_purchased + ?,
                 updated_at = ?
             WHERE tenant_id = ? AND location_id = ?",
        )
        .bind(delta)
        .bind(delta)
        .bind(timestamp(now))
        .bind(&key.tenant_id)
        .bind(&key.location_id)
        .execute(&mut *tx)
        .await?;

        let account = load_account(&mut tx, key).await?;
        tx.commit().await?;
        Ok(Ok(account))
    }

    async fn monthly_fee_inner(
        &self,
        key: &AccountKey,
        draft: UsageDraft,
        now: DateTime<Utc>,
    ) -> Result<MonthlyFeeOutcome, RepositoryError> {
        let period = FeePeriod::of(now);
        let month_prefix = format!("{:04}-{:02}", period.year, period.month);
        let tokens = to_db_int(draft.tokens)?;
        let mut tx = self.pool.begin().await?;
        ensure_account(&mut tx, key, now).await?;

        let updated = sqlx::query(
            "UPDATE ledger_account
             SET available = available - ?, lifetime_used = lifetime_used + ?,
                 last_monthly_fee = ?, updated_at = ?
             WHERE tenant_id = ? AND location_id = ? AND available >= ?
               AND (last_monthly_fee IS NULL OR substr(last_monthly_fee, 1, 7) <> ?)",
        )
        .bind(tokens)
        .bind(tokens)
        .bind(now.date_naive().format("%Y-%m-%d").to_string())
        .bind(timestamp(now))
        .bind(&key.tenant_id)
        .bind(&key.location_id)
        .bind(tokens)
        .bind(&month_prefix)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            let account = load_account(&mut tx, key).await?;
            tx.commit().await?;
            if account.fee_recorded_for(period) {
                return Ok(MonthlyFeeOutcome::AlreadyCharged { period });
            }
            return Ok(MonthlyFeeOutcome::Insufficient {
                required: draft.tokens,
                available: account.available,
            });
        }

        let entry = usage_entry(key, draft, now);
        insert_usage(&mut tx, &entry).await?;
        let account = load_account(&mut tx, key).await?;
        tx.commit().await?;

        Ok(MonthlyFeeOutcome::Charged { account, entry })
    }
}

#[async_trait]
impl LedgerStore for SqlLedgerStore {
    async fn find(&self, key: &AccountKey) -> Result<Option<LedgerAccount>, LedgerError> {
        let row = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM ledger_account WHERE tenant_id = ? AND location_id = ?"
        ))
        .bind(&key.tenant_id)
        .bind(&key.location_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        Ok(row.as_ref().map(account_from_row).transpose()?)
    }

    async fn get_or_create(&self, key: &AccountKey) -> Result<LedgerAccount, LedgerError> {
        let mut tx = self.pool.begin().await.map_err(RepositoryError::from)?;
        ensure_account(&mut tx, key, Utc::now()).await?;
        let account = load_account(&mut tx, key).await?;
        tx.commit().await.map_err(RepositoryError::from)?;
        Ok(account)
    }

    async fn debit(
        &self,
        key: &AccountKey,
        draft: UsageDraft,
    ) -> Result<DebitOutcome, LedgerError> {
        Ok(self.debit_inner(key, draft).await?)
    }

    async fn credit(&self, key: &AccountKey, tokens: u64) -> Result<LedgerAccount, LedgerError> {
        self.credit_inner(key, tokens).await?
    }

    async fn charge_monthly_fee(
        &self,
        key: &AccountKey,
        draft: UsageDraft,
        now: DateTime<Utc>,
    ) -> Result<MonthlyFeeOutcome, LedgerError> {
        Ok(self.monthly_fee_inner(key, draft, now).await?)
    }

    async fn usage_log(&self, key: &AccountKey) -> Result<Vec<UsageLogEntry>, LedgerError> {
        let rows = sqlx::query(
            "SELECT id, tenant_id, location_id, user_id, session_id, operation, tokens,
                    description, metadata_json, recorded_at
             FROM usage_log
             WHERE tenant_id = ? AND location_id = ?
             ORDER BY recorded_at ASC",
        )
        .bind(&key.tenant_id)
        .bind(&key.location_id)
        .fetch_all(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        Ok(rows.iter().map(usage_from_row).collect::<Result<Vec<_>, _>>()?)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{TimeZone, Utc};
    use serde_json::json;

    use frontdesk_core::domain::ledger::{DebitOutcome, MonthlyFeeOutcome, OperationType};
    use frontdesk_core::ledger::{DebitRequest, OperationCostTable, ResourceLedger};

    use super::SqlLedgerStore;
    use crate::{connect_with_settings, migrations, DbPool};

    async fn pool(max_connections: u32) -> DbPool {
        let pool =
            connect_with_settings("sqlite::memory:", max_connections, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        pool
    }

    fn ledger(pool: DbPool) -> ResourceLedger {
        ResourceLedger::new(Arc::new(SqlLedgerStore::new(pool)), OperationCostTable::default())
    }

    fn sms_debit(tenant_id: &str) -> DebitRequest {
        DebitRequest {
            tenant_id: tenant_id.to_owned(),
            location_id: Some("north".to_owned()),
            operation: OperationType::new(OperationType::SMS_SEND),
            user_id: Some("u-1".to_owned()),
            session_id: None,
            description: "sms reminder".to_owned(),
            metadata: json!({ "to": "+15550100" }),
        }
    }

    #[tokio::test]
    async fn debit_and_credit_keep_account_balanced() {
        let ledger = ledger(pool(1).await);
        ledger.credit("gym-1", Some("north"), 10).await.expect("credit");

        let outcome = ledger.debit(sms_debit("gym-1")).await.expect("debit");
        let DebitOutcome::Charged { account, entry } = outcome else {
            panic!("debit should be charged");
        };
        assert_eq!(account.available, 7);
        assert!(account.is_balanced());
        assert_eq!(entry.metadata["to"], "+15550100");

        let log = ledger.usage_log("gym-1", Some("north")).await.expect("usage log");
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].entry_id, entry.entry_id);
        assert_eq!(log[0].operation.as_str(), OperationType::SMS_SEND);
    }

    #[tokio::test]
    async fn insufficient_debit_writes_nothing() {
        let ledger = ledger(pool(1).await);
        ledger.credit("gym-1", Some("north"), 2).await.expect("credit");

        let outcome = ledger.debit(sms_debit("gym-1")).await.expect("debit");

        assert_eq!(outcome, DebitOutcome::Insufficient { required: 3, available: 2 });
        assert!(ledger.usage_log("gym-1", Some("north")).await.expect("log").is_empty());
        let account = ledger.get_or_create("gym-1", Some("north")).await.expect("account");
        assert_eq!(account.lifetime_used, 0);
    }

    #[tokio::test]
    async fn monthly_fee_is_recorded_once_per_month() {
        let ledger = ledger(pool(1).await);
        ledger.credit("hotel-1", None, 150).await.expect("credit");
        let june = Utc.with_ymd_and_hms(2026, 6, 3, 0, 0, 0).single().expect("time");
        let late_june = Utc.with_ymd_and_hms(2026, 6, 29, 0, 0, 0).single().expect("time");

        let first = ledger.monthly_fee_at("hotel-1", None, june).await.expect("fee");
        assert!(matches!(first, MonthlyFeeOutcome::Charged { .. }));
        let second = ledger.monthly_fee_at("hotel-1", None, late_june).await.expect("fee");
        assert!(matches!(second, MonthlyFeeOutcome::AlreadyCharged { .. }));

        let account = ledger.get_or_create("hotel-1", None).await.expect("account");
        assert_eq!(account.available, 50);
        assert_eq!(account.last_monthly_fee, Some(june.date_naive()));

        let july = Utc.with_ymd_and_hms(2026, 7, 1, 0, 0, 0).single().expect("time");
        let third = ledger.monthly_fee_at("hotel-1", None, july).await.expect("fee");
        assert_eq!(third, MonthlyFeeOutcome::Insufficient { required: 100, available: 50 });
        let account = ledger.get_or_create("hotel-1", None).await.expect("account");
        assert_eq!(account.last_monthly_fee, Some(june.date_naive()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_sql_debits_and_credits_conserve_tokens() {
        let dir = tempfile::TempDir::new().expect("temp dir");
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("ledger.db").display());
        let pool = connect_with_settings(&url, 4, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        let ledger = Arc::new(ledger(pool));
        ledger.credit("race", Some("north"), 10).await.expect("credit");

        let mut debits = Vec::new();
        let mut credits = Vec::new();
        for round in 0..12 {
            let debit_ledger = ledger.clone();
            debits.push(tokio::spawn(async move { debit_ledger.debit(sms_debit("race")).await }));
            if round % 4 == 0 {
                let ledger = ledger.clone();
                credits.push(tokio::spawn(async move {
                    ledger.credit("race", Some("north"), 5).await
                }));
            }
        }

        let credited = credits.len() as u64 * 5;
        for handle in credits {
            handle.await.expect("join").expect("credit");
        }
        let mut charged = 0u64;
        for handle in debits {
            if handle.await.expect("join").expect("debit").is_charged() {
                charged += 1;
            }
        }

        let account = ledger.get_or_create("race", Some("north")).await.expect("account");
        assert!((3..=(10 + credited) / 3).contains(&charged));
        assert_eq!(account.available, 10 + credited - charged * 3);
        assert_eq!(account.lifetime_purchased, 10 + credited);
        assert_eq!(account.lifetime_used, charged * 3);
        assert!(account.is_balanced());
        let log = ledger.usage_log("race", Some("north")).await.expect("usage log");
        assert_eq!(log.len() as u64, charged);
    }
}
