// ABOUTME: In-process backend and change source for tests and local runs
// ABOUTME: Implements dedupe, checkpoint and sink traits with fault injection

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::Instant;

use crate::oplog::{ChangeEntry, ChangeSource, OpTimestamp, SourceError};
use crate::redispub::{CheckpointStore, DedupeStore, Sink, StoreError};

#[derive(Default)]
struct State {
    markers: HashMap<String, Instant>,
    values: HashMap<String, String>,
    published: Vec<(String, Vec<u8>)>,
    checkpoint_history: Vec<OpTimestamp>,
    dedupe_failures: u32,
    fail_publishes: bool,
    fail_checkpoint_writes: bool,
}

/// Shared in-memory stand-in for Redis. Clones share the same state, so two
/// publishers built from clones behave like two instances on one Redis.
#[derive(Clone)]
pub struct MemoryBackend {
    state: Arc<Mutex<State>>,
    sink_open: Arc<watch::Sender<bool>>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (sink_open, _) = watch::channel(true);
        Self {
            state: Arc::new(Mutex::new(State::default())),
            sink_open: Arc::new(sink_open),
        }
    }

    /// Every (channel, payload) published so far, in order.
    pub async fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.state.lock().await.published.clone()
    }

    pub async fn published_channels(&self) -> Vec<String> {
        let state = self.state.lock().await;
        state.published.iter().map(|(c, _)| c.clone()).collect()
    }

    /// Every checkpoint value written, in write order.
    pub async fn checkpoint_history(&self) -> Vec<OpTimestamp> {
        self.state.lock().await.checkpoint_history.clone()
    }

    /// Store an arbitrary string, bypassing checkpoint encoding.
    pub async fn set_raw(&self, key: &str, value: &str) {
        let mut state = self.state.lock().await;
        state.values.insert(key.to_string(), value.to_string());
    }

    /// Make the next `count` dedupe calls fail as if the backend were down.
    pub async fn fail_next_dedupes(&self, count: u32) {
        self.state.lock().await.dedupe_failures = count;
    }

    pub async fn set_fail_publishes(&self, fail: bool) {
        self.state.lock().await.fail_publishes = fail;
    }

    pub async fn set_fail_checkpoint_writes(&self, fail: bool) {
        self.state.lock().await.fail_checkpoint_writes = fail;
    }

    /// Block publishes until [`MemoryBackend::resume_sink`] is called.
    pub fn pause_sink(&self) {
        self.sink_open.send_replace(false);
    }

    pub fn resume_sink(&self) {
        self.sink_open.send_replace(true);
    }
}

#[async_trait]
impl DedupeStore for MemoryBackend {
    async fn create_if_absent(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        if state.dedupe_failures > 0 {
            state.dedupe_failures -= 1;
            return Err(StoreError::Unavailable("injected dedupe failure".to_string()));
        }
        let now = Instant::now();
        match state.markers.get(key) {
            Some(expires) if *expires > now => Ok(false),
            _ => {
                state.markers.insert(key.to_string(), now + ttl);
                Ok(true)
            }
        }
    }
}

#[async_trait]
impl CheckpointStore for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<OpTimestamp>, StoreError> {
        let state = self.state.lock().await;
        match state.values.get(key) {
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
        let mut state = self.state.lock().await;
        if state.fail_checkpoint_writes {
            return Err(StoreError::Unavailable("injected checkpoint failure".to_string()));
        }
        state.values.insert(key.to_string(), timestamp.to_string());
        state.checkpoint_history.push(timestamp);
        Ok(())
    }
}

#[async_trait]
impl Sink for MemoryBackend {
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<(), StoreError> {
        let mut open = self.sink_open.subscribe();
        // The sender lives as long as self, so this only ends once the gate opens
        let _ = open.wait_for(|open| *open).await;

        let mut state = self.state.lock().await;
        if state.fail_publishes {
            return Err(StoreError::Unavailable("injected publish failure".to_string()));
        }
        state.published.push((channel.to_string(), payload.to_vec()));
        Ok(())
    }
}

/// A [`ChangeSource`] fed through an unbounded channel. The stream ends when
/// every sender is dropped.
pub struct ChannelSource {
    rx: mpsc::UnboundedReceiver<Result<ChangeEntry, SourceError>>,
}

impl ChannelSource {
    pub fn channel() -> (
        mpsc::UnboundedSender<Result<ChangeEntry, SourceError>>,
        Self,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx })
    }
}

#[async_trait]
impl ChangeSource for ChannelSource {
    async fn next_entry(&mut self) -> Result<Option<ChangeEntry>, SourceError> {
        match self.rx.recv().await {
            Some(Ok(entry)) => Ok(Some(entry)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }
}
