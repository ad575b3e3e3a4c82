// ABOUTME: Pipeline - wires the oplog tailer to the publisher through a bounded queue
// ABOUTME: Owns task startup and the ordered shutdown of both halves

use anyhow::{Context, Result};
use tokio::sync::{broadcast, mpsc};

use crate::oplog::{ChangeSource, OplogTailer, TailStats};
use crate::redispub::{CheckpointStore, DedupeStore, PublishOptions, PublishStats, Publisher, Sink};

/// Combined counters from both tasks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub tail: TailStats,
    pub publish: PublishStats,
}

pub struct Pipeline {
    buffer_size: usize,
    options: PublishOptions,
}

impl Pipeline {
    pub fn new(buffer_size: usize, options: PublishOptions) -> Self {
        Self {
            buffer_size: buffer_size.max(1),
            options,
        }
    }

    /// Run the tailer and publisher until `shutdown` fires or the tailer ends.
    ///
    /// The tailer is stopped first so nothing new enters the queue; the
    /// publisher then drains what is queued and writes a final checkpoint. A
    /// fatal tailer error is returned only after that drain completes.
    pub async fn run<C, S>(
        &self,
        source: C,
        store: S,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<PipelineStats>
    where
        C: ChangeSource + 'static,
        S: DedupeStore + CheckpointStore + Sink + 'static,
    {
        let (queue_tx, queue_rx) = mpsc::channel(self.buffer_size);
        let (tail_stop_tx, tail_stop_rx) = broadcast::channel::<()>(1);
        let (publish_stop_tx, publish_stop_rx) = broadcast::channel::<()>(1);

        tracing::info!(buffer_size = self.buffer_size, "Starting relay pipeline");

        let mut tailer = tokio::spawn(OplogTailer::new(source, queue_tx).run(tail_stop_rx));
        let publisher = tokio::spawn(
            Publisher::new(store, self.options.clone()).run(queue_rx, publish_stop_rx),
        );

        let finished = tokio::select! {
            biased;

            // A closed channel means no one can ask for shutdown, not a request
            Ok(()) = shutdown.recv() => None,
            result = &mut tailer => Some(result),
        };
        let tail_result = match finished {
            Some(result) => result,
            None => {
                tracing::info!("Stopping oplog tailer");
                let _ = tail_stop_tx.send(());
                tailer.await
            }
        };

        tracing::info!("Stopping publisher");
        let _ = publish_stop_tx.send(());
        let publish = publisher.await.context("publisher task panicked")??;

        let tail = tail_result.context("oplog tailer task panicked")??;
        Ok(PipelineStats { tail, publish })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{ChannelSource, MemoryBackend};
    use crate::oplog::{ChangeEntry, Namespace, OpTimestamp, Operation, SourceError};
    use std::time::Duration;

    fn options() -> PublishOptions {
        PublishOptions {
            flush_interval: Duration::from_millis(10),
            dedupe_expiration: Duration::from_secs(120),
            metadata_prefix: "pipe::".to_string(),
        }
    }

    fn insert(seconds: u32, id: &str) -> ChangeEntry {
        ChangeEntry::new(
            Namespace::new("shop", "orders"),
            Operation::Insert,
            OpTimestamp::new(seconds, 0),
        )
        .with_document_id(id)
    }

    #[tokio::test]
    async fn test_runs_until_source_ends() {
        let backend = MemoryBackend::new();
        let (feed, source) = ChannelSource::channel();
        let (_stop_tx, stop_rx) = broadcast::channel(1);

        feed.send(Ok(insert(5, "o1"))).unwrap();
        feed.send(Ok(insert(6, "o2"))).unwrap();
        drop(feed);

        let stats = Pipeline::new(4, options())
            .run(source, backend.clone(), stop_rx)
            .await
            .unwrap();
        assert_eq!(stats.tail.entries_read, 2);
        assert_eq!(stats.publish.published, 4);
        assert_eq!(
            backend.get("pipe::lastProcessedEntry").await.unwrap(),
            Some(OpTimestamp::new(6, 0))
        );
    }

    #[tokio::test]
    async fn test_shutdown_signal_stops_both_tasks() {
        let backend = MemoryBackend::new();
        let (feed, source) = ChannelSource::channel();
        let (stop_tx, stop_rx) = broadcast::channel(1);

        feed.send(Ok(insert(5, "o1"))).unwrap();
        let handle = tokio::spawn({
            let backend = backend.clone();
            async move { Pipeline::new(4, options()).run(source, backend, stop_rx).await }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        stop_tx.send(()).unwrap();
        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats.publish.published, 2);
        assert_eq!(stats.publish.last_checkpoint, Some(OpTimestamp::new(5, 0)));
        drop(feed);
    }

    #[tokio::test]
    async fn test_dropped_shutdown_sender_does_not_stop_pipeline() {
        let backend = MemoryBackend::new();
        let (feed, source) = ChannelSource::channel();
        let (stop_tx, stop_rx) = broadcast::channel::<()>(1);
        drop(stop_tx);

        feed.send(Ok(insert(5, "o1"))).unwrap();
        feed.send(Ok(insert(6, "o2"))).unwrap();
        drop(feed);

        let stats = Pipeline::new(4, options())
            .run(source, backend.clone(), stop_rx)
            .await
            .unwrap();
        assert_eq!(stats.tail.entries_read, 2);
        assert_eq!(stats.publish.published, 4);
    }

    #[tokio::test]
    async fn test_fatal_source_error_is_returned_after_drain() {
        let backend = MemoryBackend::new();
        let (feed, source) = ChannelSource::channel();
        let (_stop_tx, stop_rx) = broadcast::channel(1);

        feed.send(Ok(insert(5, "o1"))).unwrap();
        feed.send(Err(SourceError::Fatal("oplog rolled over".into())))
            .unwrap();

        let result = Pipeline::new(4, options())
            .run(source, backend.clone(), stop_rx)
            .await;
        assert!(result.is_err());
        assert_eq!(backend.published_channels().await.len(), 2);
        assert_eq!(
            backend.checkpoint_history().await,
            vec![OpTimestamp::new(5, 0)]
        );
        drop(feed);
    }
}
