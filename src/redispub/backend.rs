// ABOUTME: RedisBackend - the dedupe, checkpoint and sink traits over Redis
// ABOUTME: Uses a reconnecting ConnectionManager shared by all commands

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;

use super::store::{CheckpointStore, DedupeStore, Sink, StoreError};
use crate::oplog::OpTimestamp;

#[derive(Clone)]
pub struct RedisBackend {
    conn: ConnectionManager,
}

impl RedisBackend {
    /// Connect and verify the connection with a `PING`.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).context("Failed to parse Redis URL")?;
        let mut conn = ConnectionManager::new(client)
            .await
            .context("Failed to connect to Redis")?;

        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .context("Redis ping failed")?;
        if pong != "PONG" {
            bail!("Unexpected Redis ping reply: {}", pong);
        }

        Ok(Self { conn })
    }
}

#[async_trait]
impl DedupeStore for RedisBackend {
    async fn create_if_absent(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        // SET NX replies nil when the key already exists
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(1)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis().max(1) as u64)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }
}

#[async_trait]
impl CheckpointStore for RedisBackend {
    async fn get(&self, key: &str) -> Result<Option<OpTimestamp>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        match raw {
            Some(raw) => raw
                .parse()
                .map(Some)
                .map_err(|e: anyhow::Error| StoreError::InvalidCheckpoint {
                    key: key.to_string(),
                    reason: e.to_string(),
                }),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, timestamp: OpTimestamp) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(timestamp.to_string())
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Sink for RedisBackend {
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _receivers: i64 = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}
