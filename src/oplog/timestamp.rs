// ABOUTME: OpTimestamp - the totally ordered (seconds, ordinal) oplog position
// ABOUTME: Doubles as checkpoint cursor and dedupe token component

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};

/// Logical timestamp assigned by MongoDB to every oplog entry.
///
/// Entries written within the same second are distinguished by `ordinal`, so
/// the derived ordering (seconds first, then ordinal) is total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OpTimestamp {
    /// Wall-clock seconds since the Unix epoch
    pub seconds: u32,
    /// Position of the write within that second
    pub ordinal: u32,
}

impl OpTimestamp {
    pub fn new(seconds: u32, ordinal: u32) -> Self {
        Self { seconds, ordinal }
    }

    /// Pack into the 64-bit layout MongoDB uses internally (`seconds << 32 | ordinal`).
    pub fn as_u64(&self) -> u64 {
        (u64::from(self.seconds) << 32) | u64::from(self.ordinal)
    }

    pub fn from_u64(value: u64) -> Self {
        Self {
            seconds: (value >> 32) as u32,
            ordinal: (value & 0xFFFF_FFFF) as u32,
        }
    }

    /// How far behind `now` this timestamp is. Timestamps from the future
    /// (clock skew between hosts) report zero.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        let now_secs = now.timestamp();
        let delta = now_secs - i64::from(self.seconds);
        if delta <= 0 {
            Duration::ZERO
        } else {
            Duration::from_secs(delta as u64)
        }
    }
}

impl From<bson::Timestamp> for OpTimestamp {
    fn from(ts: bson::Timestamp) -> Self {
        Self {
            seconds: ts.time,
            ordinal: ts.increment,
        }
    }
}

impl From<OpTimestamp> for bson::Timestamp {
    fn from(ts: OpTimestamp) -> Self {
        bson::Timestamp {
            time: ts.seconds,
            increment: ts.ordinal,
        }
    }
}

/// The external (checkpoint) representation: the packed value in decimal.
impl fmt::Display for OpTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u64())
    }
}

impl FromStr for OpTimestamp {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            bail!("timestamp value is empty");
        }
        let packed: u64 = trimmed
            .parse()
            .with_context(|| format!("invalid timestamp value '{}'", trimmed))?;
        Ok(Self::from_u64(packed))
    }
}
