use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::Row;

use frontdesk_core::dedup::{DedupClaim, DedupError, DedupState, DedupStore};
use frontdesk_core::domain::envelope::MessageId;

use super::{timestamp, RepositoryError};
use crate::DbPool;

/// Dedup set shared by every consumer instance pointed at the same database.
#[derive(Clone)]
pub struct SqlDedupStore {
    pool: DbPool,
    ttl: Duration,
}

impl SqlDedupStore {
    pub fn new(pool: DbPool, ttl_secs: u64) -> Self {
        Self { pool, ttl: Duration::seconds(i64::try_from(ttl_secs).unwrap_or(i64::MAX)) }
    }

    pub async fn claim_at(
        &self,
        message_id: &MessageId,
        now: DateTime<Utc>,
    ) -> Result<DedupClaim, RepositoryError> {
        let cutoff = timestamp(now - self.ttl);
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM processed_message WHERE message_id = ? AND claimed_at <= ?")
            .bind(message_id.as_str())
            .bind(&cutoff)
            .execute(&mut *tx)
            .await?;

        let inserted = sqlx::query(
            "INSERT INTO processed_message (message_id, state, claimed_at, updated_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(message_id) DO NOTHING",
        )
        .bind(message_id.as_str())
        .bind(DedupState::Processing.as_str())
        .bind(timestamp(now))
        .bind(timestamp(now))
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 1 {
            tx.commit().await?;
            return Ok(DedupClaim::Claimed);
        }

        let state: String =
            sqlx::query("SELECT state FROM processed_message WHERE message_id = ?")
                .bind(message_id.as_str())
                .fetch_one(&mut *tx)
                .await?
                .try_get("state")?;
        tx.commit().await?;

        DedupState::parse(&state)
            .map(DedupClaim::Duplicate)
            .ok_or_else(|| RepositoryError::Decode(format!("unknown dedup state `{state}`")))
    }

    pub async fn evict_expired_at(&self, now: DateTime<Utc>) -> Result<usize, RepositoryError> {
        let removed = sqlx::query("DELETE FROM processed_message WHERE claimed_at <= ?")
            .bind(timestamp(now - self.ttl))
            .execute(&self.pool)
            .await?;
        Ok(removed.rows_affected() as usize)
    }
}

#[async_trait]
impl DedupStore for SqlDedupStore {
    async fn claim(&self, message_id: &MessageId) -> Result<DedupClaim, DedupError> {
        Ok(self.claim_at(message_id, Utc::now()).await?)
    }

    async fn mark(&self, message_id: &MessageId, state: DedupState) -> Result<(), DedupError> {
        sqlx::query("UPDATE processed_message SET state = ?, updated_at = ? WHERE message_id = ?")
            .bind(state.as_str())
            .bind(timestamp(Utc::now()))
            .bind(message_id.as_str())
            .execute(&self.pool)
            .await
            .map_err(RepositoryError::from)?;
        Ok(())
    }

    async fn release(&self, message_id: &MessageId) -> Result<(), DedupError> {
        sqlx::query("DELETE FROM processed_message WHERE message_id = ?")
            .bind(message_id.as_str())
            .execute(&self.pool)
            .await
            .map_err(RepositoryError::from)?;
        Ok(())
    }

    async fn evict_expired(&self) -> Result<usize, DedupError> {
        Ok(self.evict_expired_at(Utc::now()).await?)
    }
}
