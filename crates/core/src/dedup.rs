//! Message-id dedup set with a bounded time-to-live.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::envelope::MessageId;

pub const DEFAULT_DEDUP_TTL_SECS: u64 = 300;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupState {
    Processing,
    Responded,
    Failed,
}

impl DedupState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processing => "processing",
            Self::Responded => "responded",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "processing" => Some(Self::Processing),
            "responded" => Some(Self::Responded),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DedupClaim {
    /// The caller now owns the message id in state `Processing`.
    Claimed,
    Duplicate(DedupState),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DedupError {
    #[error("dedup storage failure: {0}")]
    Storage(String),
}

#[async_trait]
pub trait DedupStore: Send + Sync {
    /// Atomically claims `message_id` unless a live entry already exists.
    async fn claim(&self, message_id: &MessageId) -> Result<DedupClaim, DedupError>;

    async fn mark(&self, message_id: &MessageId, state: DedupState) -> Result<(), DedupError>;

    /// Forgets the id so a redelivery is processed again.
    async fn release(&self, message_id: &MessageId) -> Result<(), DedupError>;

    /// Drops entries older than the TTL and returns how many were removed.
    async fn evict_expired(&self) -> Result<usize, DedupError>;
}

#[derive(Clone, Copy, Debug)]
struct DedupEntry {
    state: DedupState,
    claimed_at: DateTime<Utc>,
}

/// Single-process dedup set. Expired entries are evicted lazily on claim.
#[derive(Clone)]
pub struct InMemoryDedupCache {
    ttl: Duration,
    entries: Arc<Mutex<HashMap<MessageId, DedupEntry>>>,
}

impl Default for InMemoryDedupCache {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_TTL_SECS)
    }
}

impl InMemoryDedupCache {
    pub fn new(ttl_secs: u64) -> Self {
        Self {
            ttl: Duration::seconds(i64::try_from(ttl_secs).unwrap_or(i64::MAX)),
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn claim_at(&self, message_id: &MessageId, now: DateTime<Utc>) -> DedupClaim {
        self.with_entries(|entries| {
            let ttl = self.ttl;
            entries.retain(|_, entry| now - entry.claimed_at < ttl);

            if let Some(entry) = entries.get(message_id) {
                return DedupClaim::Duplicate(entry.state);
            }
            entries.insert(
                message_id.clone(),
                DedupEntry { state: DedupState::Processing, claimed_at: now },
            );
            DedupClaim::Claimed
        })
    }

    pub fn evict_expired_at(&self, now: DateTime<Utc>) -> usize {
        self.with_entries(|entries| {
            let before = entries.len();
            let ttl = self.ttl;
            entries.retain(|_, entry| now - entry.claimed_at < ttl);
            before - entries.len()
        })
    }

    pub fn state(&self, message_id: &MessageId) -> Option<DedupState> {
        self.with_entries(|entries| entries.get(message_id).map(|entry| entry.state))
    }

    pub fn len(&self) -> usize {
        self.with_entries(|entries| entries.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn with_entries<T>(&self, apply: impl FnOnce(&mut HashMap<MessageId, DedupEntry>) -> T) -> T {
        match self.entries.lock() {
            Ok(mut entries) => apply(&mut entries),
            Err(poisoned) => apply(&mut poisoned.into_inner()),
        }
    }
}

#[async_trait]
impl DedupStore for InMemoryDedupCache {
    async fn claim(&self, message_id: &MessageId) -> Result<DedupClaim, DedupError> {
        Ok(self.claim_at(message_id, Utc::now()))
    }

    async fn mark(&self, message_id: &MessageId, state: DedupState) -> Result<(), DedupError> {
        self.with_entries(|entries| {
            if let Some(entry) = entries.get_mut(message_id) {
                entry.state = state;
            }
        });
        Ok(())
    }

    async fn release(&self, message_id: &MessageId) -> Result<(), DedupError> {
        self.with_entries(|entries| entries.remove(message_id));
        Ok(())
    }

    async fn evict_expired(&self) -> Result<usize, DedupError> {
        Ok(self.evict_expired_at(Utc::now()))
    }
}
