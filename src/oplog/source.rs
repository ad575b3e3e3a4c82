// ABOUTME: ChangeSource trait - the sequential stream of oplog changes
// ABOUTME: Separates transient read failures from fatal ones

use async_trait::async_trait;
use thiserror::Error;

use super::entry::ChangeEntry;
use super::timestamp::OpTimestamp;

/// Where a source begins reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPosition {
    /// Only entries written after the source opens
    Tail,
    /// Every entry at or after this timestamp. The boundary is inclusive, so the
    /// checkpointed entry itself may be read again; dedupe absorbs it.
    Resume(OpTimestamp),
}

#[derive(Debug, Error)]
pub enum SourceError {
    /// The stream hiccupped; reading may continue.
    #[error("transient source error: {0}")]
    Transient(String),
    /// The stream cannot continue.
    #[error("fatal source error: {0}")]
    Fatal(String),
}

impl SourceError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, SourceError::Fatal(_))
    }
}

/// A forward-only stream of change entries in non-decreasing timestamp order.
#[async_trait]
pub trait ChangeSource: Send {
    /// Next entry; `Ok(None)` once the stream has ended for good.
    async fn next_entry(&mut self) -> Result<Option<ChangeEntry>, SourceError>;
}
