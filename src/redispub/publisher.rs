// ABOUTME: Publisher - drains the publication queue into Redis pub/sub
// ABOUTME: Dedupes across instances, publishes, and periodically flushes the checkpoint

use std::time::Duration;

use anyhow::Result;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, sleep, MissedTickBehavior};

use super::publication::Publication;
use super::store::{CheckpointStore, DedupeStore, Sink};
use crate::oplog::OpTimestamp;

/// Dedupe attempts a record still gets once shutdown has been requested.
pub const SHUTDOWN_DEDUPE_ATTEMPTS: u32 = 3;

const DEDUPE_RETRY_INITIAL: Duration = Duration::from_millis(100);
const DEDUPE_RETRY_MAX: Duration = Duration::from_secs(5);

/// Redis key holding the checkpoint for a deployment group.
pub fn checkpoint_key(metadata_prefix: &str) -> String {
    format!("{}lastProcessedEntry", metadata_prefix)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishOptions {
    /// How often the high-water mark is written to the checkpoint key
    pub flush_interval: Duration,
    /// Lifetime of dedupe markers
    pub dedupe_expiration: Duration,
    /// Prefix for checkpoint and dedupe keys; shared by cooperating instances
    pub metadata_prefix: String,
}

impl PublishOptions {
    pub fn checkpoint_key(&self) -> String {
        checkpoint_key(&self.metadata_prefix)
    }
}

/// Counters reported when the publisher returns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishStats {
    pub received: u64,
    pub published: u64,
    pub duplicates: u64,
    pub publish_failures: u64,
    pub dedupe_errors: u64,
    pub abandoned: u64,
    pub checkpoints_written: u64,
    pub last_checkpoint: Option<OpTimestamp>,
}

enum Claim {
    Created,
    Duplicate,
    Abandoned,
}

/// Single consumer of the publication queue.
///
/// Records are handled strictly in queue order, so publishes on any one
/// channel follow oplog order. The checkpoint is written from an in-memory
/// high-water mark that only ever moves forward.
pub struct Publisher<S> {
    store: S,
    options: PublishOptions,
    checkpoint_key: String,
    high_water: Option<OpTimestamp>,
    /// Timestamp of the first record given up on; the mark never passes it
    abandoned_at: Option<OpTimestamp>,
    flushed: Option<OpTimestamp>,
    stopping: bool,
    stats: PublishStats,
}

impl<S> Publisher<S>
where
    S: DedupeStore + CheckpointStore + Sink,
{
    pub fn new(store: S, options: PublishOptions) -> Self {
        let checkpoint_key = options.checkpoint_key();
        Self {
            store,
            options,
            checkpoint_key,
            high_water: None,
            abandoned_at: None,
            flushed: None,
            stopping: false,
            stats: PublishStats::default(),
        }
    }

    /// Run until shutdown or until the queue closes, then drain whatever is
    /// still queued and flush the checkpoint one last time.
    pub async fn run(
        mut self,
        mut queue: mpsc::Receiver<Publication>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<PublishStats> {
        let mut flush = interval(self.options.flush_interval);
        flush.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            flush_interval = ?self.options.flush_interval,
            dedupe_expiration = ?self.options.dedupe_expiration,
            checkpoint_key = %self.checkpoint_key,
            "Publisher started"
        );

        while !self.stopping {
            tokio::select! {
                biased;

                _ = shutdown.recv() => {
                    tracing::info!("Shutdown signal received, draining publication queue");
                    self.stopping = true;
                }
                _ = flush.tick() => {
                    self.flush().await;
                }
                next = queue.recv() => match next {
                    Some(publication) => self.process(publication, &mut shutdown).await,
                    None => {
                        tracing::info!("Publication queue closed, stopping publisher");
                        self.stopping = true;
                    }
                },
            }
        }

        queue.close();
        let mut drained = 0u64;
        while let Some(publication) = queue.recv().await {
            self.process(publication, &mut shutdown).await;
            drained += 1;
        }
        if drained > 0 {
            tracing::info!("Drained {} queued publications", drained);
        }

        self.flush().await;
        tracing::info!(
            published = self.stats.published,
            duplicates = self.stats.duplicates,
            publish_failures = self.stats.publish_failures,
            abandoned = self.stats.abandoned,
            "Publisher stopped"
        );
        Ok(self.stats)
    }

    async fn process(&mut self, publication: Publication, shutdown: &mut broadcast::Receiver<()>) {
        self.stats.received += 1;
        let key = publication.dedupe_key(&self.options.metadata_prefix);

        match self.claim(&key, shutdown).await {
            Claim::Created => {
                match self
                    .store
                    .publish(&publication.channel, &publication.payload)
                    .await
                {
                    Ok(()) => {
                        self.stats.published += 1;
                        tracing::trace!(channel = %publication.channel, "Published");
                    }
                    Err(e) => {
                        self.stats.publish_failures += 1;
                        tracing::error!(
                            channel = %publication.channel,
                            timestamp = %publication.timestamp,
                            "Failed to publish, dropping message: {}",
                            e
                        );
                    }
                }
            }
            Claim::Duplicate => {
                self.stats.duplicates += 1;
                tracing::debug!(
                    channel = %publication.channel,
                    "Already published by another instance, skipping"
                );
            }
            Claim::Abandoned => {
                self.stats.abandoned += 1;
                tracing::error!(
                    channel = %publication.channel,
                    timestamp = %publication.timestamp,
                    "Dedupe store unreachable during shutdown, message not published"
                );
                if self.abandoned_at.is_none() {
                    self.abandoned_at = Some(publication.timestamp);
                }
                return;
            }
        }

        self.advance(publication.timestamp);
    }

    /// Move the high-water mark forward, but never beyond an abandoned record.
    /// Resume is inclusive, so a checkpoint equal to that record's timestamp
    /// still replays it.
    fn advance(&mut self, timestamp: OpTimestamp) {
        if self.abandoned_at.is_some_and(|cap| timestamp > cap) {
            return;
        }
        if self.high_water.map_or(true, |hw| timestamp > hw) {
            self.high_water = Some(timestamp);
        }
    }

    /// Create the dedupe marker, retrying backend failures. A failure is never
    /// taken to mean "already published".
    async fn claim(&mut self, key: &str, shutdown: &mut broadcast::Receiver<()>) -> Claim {
        let mut delay = DEDUPE_RETRY_INITIAL;
        let mut attempts_while_stopping = 0u32;

        loop {
            let err = match self
                .store
                .create_if_absent(key, self.options.dedupe_expiration)
                .await
            {
                Ok(true) => return Claim::Created,
                Ok(false) => return Claim::Duplicate,
                Err(e) => e,
            };
            self.stats.dedupe_errors += 1;

            if self.stopping {
                attempts_while_stopping += 1;
                if attempts_while_stopping >= SHUTDOWN_DEDUPE_ATTEMPTS {
                    return Claim::Abandoned;
                }
            }
            tracing::warn!("Dedupe check for {} failed, retrying in {:?}: {}", key, delay, err);

            if self.stopping {
                sleep(delay).await;
            } else {
                tokio::select! {
                    biased;
                    _ = shutdown.recv() => {
                        tracing::info!("Shutdown signal received while retrying dedupe check");
                        self.stopping = true;
                    }
                    _ = sleep(delay) => {}
                }
            }
            delay = (delay * 2).min(DEDUPE_RETRY_MAX);
        }
    }

    async fn flush(&mut self) {
        let high_water = match self.high_water {
            Some(hw) => hw,
            None => return,
        };
        if self.flushed.is_some_and(|flushed| flushed >= high_water) {
            return;
        }

        match self.store.set(&self.checkpoint_key, high_water).await {
            Ok(()) => {
                self.flushed = Some(high_water);
                self.stats.checkpoints_written += 1;
                self.stats.last_checkpoint = Some(high_water);
                tracing::debug!(
                    checkpoint = %high_water,
                    received = self.stats.received,
                    published = self.stats.published,
                    duplicates = self.stats.duplicates,
                    "Flushed checkpoint"
                );
            }
            Err(e) => {
                tracing::warn!(
                    "Failed to flush checkpoint {} to {}: {}",
                    high_water,
                    self.checkpoint_key,
                    e
                );
            }
        }
    }
}
