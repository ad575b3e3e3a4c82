// ABOUTME: Capability traits the publisher needs from the pub/sub backend
// ABOUTME: Dedupe markers, checkpoint storage, and channel publishing

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::oplog::OpTimestamp;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend could not be reached or rejected the command.
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    /// A stored checkpoint could not be decoded.
    #[error("invalid checkpoint stored at {key}: {reason}")]
    InvalidCheckpoint { key: String, reason: String },
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

/// Expiring "already published" markers shared by every instance.
#[async_trait]
pub trait DedupeStore: Send + Sync {
    /// Atomically create `key` with the given lifetime. Returns `true` when this
    /// call created it, `false` when it already existed. Backend failures are
    /// errors, never `false`.
    async fn create_if_absent(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;
}

/// Durable slot for the newest flushed oplog timestamp.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<OpTimestamp>, StoreError>;

    async fn set(&self, key: &str, timestamp: OpTimestamp) -> Result<(), StoreError>;
}

/// Fire-and-forget channel publishing.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<(), StoreError>;
}
