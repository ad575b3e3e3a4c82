// ABOUTME: OplogTailer - turns change entries into queued publications
// ABOUTME: Chooses the start position from the checkpoint and max catch-up window

use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc};

use super::source::{ChangeSource, StartPosition};
use crate::redispub::{publications_for, CheckpointStore, Publication};

/// Counters reported when the tailer returns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TailStats {
    pub entries_read: u64,
    pub publications_queued: u64,
    pub source_errors: u64,
}

/// Decide where to start reading the oplog.
///
/// Resumes from the stored checkpoint when it is no older than `max_catch_up`,
/// otherwise starts from the live tail. A checkpoint that cannot be read counts
/// as absent: losing the replay window is preferable to refusing to start.
pub async fn resolve_start_position<S>(
    store: &S,
    checkpoint_key: &str,
    max_catch_up: Duration,
    now: DateTime<Utc>,
) -> StartPosition
where
    S: CheckpointStore + ?Sized,
{
    let checkpoint = match store.get(checkpoint_key).await {
        Ok(Some(ts)) => ts,
        Ok(None) => {
            tracing::info!("No checkpoint found at {}, starting from oplog tail", checkpoint_key);
            return StartPosition::Tail;
        }
        Err(e) => {
            tracing::warn!(
                "Failed to read checkpoint at {}: {}. Starting from oplog tail",
                checkpoint_key,
                e
            );
            return StartPosition::Tail;
        }
    };

    let age = checkpoint.age(now);
    if age > max_catch_up {
        tracing::warn!(
            checkpoint = %checkpoint,
            age_secs = age.as_secs(),
            max_catch_up_secs = max_catch_up.as_secs(),
            "Checkpoint is older than max catch-up, skipping replay and starting from oplog tail"
        );
        StartPosition::Tail
    } else {
        tracing::info!(
            checkpoint = %checkpoint,
            age_secs = age.as_secs(),
            "Resuming from checkpoint"
        );
        StartPosition::Resume(checkpoint)
    }
}

/// Reads a [`ChangeSource`] and feeds the bounded publication queue.
pub struct OplogTailer<S> {
    source: S,
    queue: mpsc::Sender<Publication>,
}

impl<S: ChangeSource> OplogTailer<S> {
    pub fn new(source: S, queue: mpsc::Sender<Publication>) -> Self {
        Self { source, queue }
    }

    /// Run until shutdown, end of stream, or a fatal source error.
    ///
    /// Shutdown is only observed between entries: once an entry is read, all of
    /// its publications are queued (waiting for capacity if need be) before the
    /// tailer looks at the signal again.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> Result<TailStats> {
        let mut stats = TailStats::default();
        tracing::info!("Oplog tailer started");

        loop {
            let next = tokio::select! {
                biased;

                _ = shutdown.recv() => {
                    tracing::info!("Shutdown signal received, stopping oplog tailer");
                    break;
                }
                next = self.source.next_entry() => next,
            };

            let entry = match next {
                Ok(Some(entry)) => entry,
                Ok(None) => {
                    tracing::info!("Change source ended, stopping oplog tailer");
                    break;
                }
                Err(e) if e.is_fatal() => {
                    tracing::error!("Oplog tailer stopping: {}", e);
                    return Err(anyhow!(e));
                }
                Err(e) => {
                    stats.source_errors += 1;
                    tracing::warn!("Error tailing oplog: {}", e);
                    continue;
                }
            };
            stats.entries_read += 1;

            let publications = match publications_for(&entry) {
                Ok(publications) => publications,
                Err(e) => {
                    tracing::error!(
                        "Dropping {} on {} at {}: {:?}",
                        entry.operation,
                        entry.namespace,
                        entry.timestamp,
                        e
                    );
                    continue;
                }
            };

            for publication in publications {
                if self.queue.send(publication).await.is_err() {
                    tracing::warn!("Publication queue closed, stopping oplog tailer");
                    return Ok(stats);
                }
                stats.publications_queued += 1;
            }
        }

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{ChannelSource, MemoryBackend};
    use crate::oplog::{ChangeEntry, Namespace, OpTimestamp, Operation, SourceError};
    use chrono::TimeZone;

    fn insert(seconds: u32, id: &str) -> ChangeEntry {
        ChangeEntry::new(
            Namespace::new("app", "users"),
            Operation::Insert,
            OpTimestamp::new(seconds, 1),
        )
        .with_document_id(id)
    }

    #[tokio::test]
    async fn test_start_from_tail_without_checkpoint() {
        let store = MemoryBackend::new();
        let now = Utc.timestamp_opt(1_000, 0).unwrap();
        let pos = resolve_start_position(&store, "cp", Duration::from_secs(60), now).await;
        assert_eq!(pos, StartPosition::Tail);
    }

    #[tokio::test]
    async fn test_resume_within_catch_up_window() {
        let store = MemoryBackend::new();
        store.set("cp", OpTimestamp::new(950, 3)).await.unwrap();
        let now = Utc.timestamp_opt(1_000, 0).unwrap();
        let pos = resolve_start_position(&store, "cp", Duration::from_secs(60), now).await;
        assert_eq!(pos, StartPosition::Resume(OpTimestamp::new(950, 3)));
    }

    #[tokio::test]
    async fn test_stale_checkpoint_starts_from_tail() {
        let store = MemoryBackend::new();
        store.set("cp", OpTimestamp::new(900, 0)).await.unwrap();
        let now = Utc.timestamp_opt(1_000, 0).unwrap();
        let pos = resolve_start_position(&store, "cp", Duration::from_secs(60), now).await;
        assert_eq!(pos, StartPosition::Tail);
    }

    #[tokio::test]
    async fn test_unreadable_checkpoint_starts_from_tail() {
        let store = MemoryBackend::new();
        store.set_raw("cp", "not-a-timestamp").await;
        let now = Utc.timestamp_opt(1_000, 0).unwrap();
        let pos = resolve_start_position(&store, "cp", Duration::from_secs(60), now).await;
        assert_eq!(pos, StartPosition::Tail);
    }

    #[tokio::test]
    async fn test_queues_publications_in_order() {
        let (feed, source) = ChannelSource::channel();
        let (tx, mut rx) = mpsc::channel(16);
        let (_stop_tx, stop_rx) = broadcast::channel(1);

        feed.send(Ok(insert(1, "a"))).unwrap();
        feed.send(Ok(ChangeEntry::new(
            Namespace::new("app", "users"),
            Operation::Drop,
            OpTimestamp::new(2, 1),
        )))
        .unwrap();
        drop(feed);

        let stats = OplogTailer::new(source, tx).run(stop_rx).await.unwrap();
        assert_eq!(stats.entries_read, 2);
        assert_eq!(stats.publications_queued, 3);

        let mut channels = Vec::new();
        while let Some(p) = rx.recv().await {
            channels.push(p.channel);
        }
        assert_eq!(channels, vec!["app.users", "app.users::a", "app.users"]);
    }

    #[tokio::test]
    async fn test_transient_errors_do_not_stop_tailer() {
        let (feed, source) = ChannelSource::channel();
        let (tx, mut rx) = mpsc::channel(16);
        let (_stop_tx, stop_rx) = broadcast::channel(1);

        feed.send(Err(SourceError::Transient("socket reset".into())))
            .unwrap();
        feed.send(Ok(insert(1, "a"))).unwrap();
        drop(feed);

        let stats = OplogTailer::new(source, tx).run(stop_rx).await.unwrap();
        assert_eq!(stats.source_errors, 1);
        assert_eq!(stats.entries_read, 1);
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_fatal_error_stops_tailer() {
        let (feed, source) = ChannelSource::channel();
        let (tx, _rx) = mpsc::channel(16);
        let (_stop_tx, stop_rx) = broadcast::channel(1);

        feed.send(Err(SourceError::Fatal("oplog gone".into()))).unwrap();
        let result = OplogTailer::new(source, tx).run(stop_rx).await;
        assert!(result.is_err());
        drop(feed);
    }

    #[tokio::test]
    async fn test_stops_on_shutdown_signal() {
        let (_feed, source) = ChannelSource::channel();
        let (tx, _rx) = mpsc::channel(16);
        let (stop_tx, stop_rx) = broadcast::channel(1);

        let handle = tokio::spawn(OplogTailer::new(source, tx).run(stop_rx));
        stop_tx.send(()).unwrap();
        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats.entries_read, 0);
    }

    #[tokio::test]
    async fn test_stops_when_queue_receiver_dropped() {
        let (feed, source) = ChannelSource::channel();
        let (tx, rx) = mpsc::channel(1);
        let (_stop_tx, stop_rx) = broadcast::channel(1);
        drop(rx);

        feed.send(Ok(insert(1, "a"))).unwrap();
        let stats = OplogTailer::new(source, tx).run(stop_rx).await.unwrap();
        assert_eq!(stats.entries_read, 1);
        assert_eq!(stats.publications_queued, 0);
    }
}
