// ABOUTME: Command-line and environment configuration for oplog-relay
// ABOUTME: Parses OTR_* settings once into an immutable, validated Config

use std::time::Duration;

use anyhow::{bail, Result};
use clap::Parser;

use crate::redispub::{checkpoint_key, PublishOptions};
use crate::utils::{parse_duration, validate_url_scheme};

/// Command-line interface definition. Every flag can also be set through its
/// `OTR_*` environment variable.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "oplog-relay",
    version,
    about = "Tails the MongoDB oplog and republishes changes on Redis pub/sub.",
    long_about = None
)]
pub struct Cli {
    /// MongoDB connection string (must point at a replica set member).
    #[arg(long = "mongo-url", env = "OTR_MONGO_URL", value_name = "URL")]
    pub mongo_url: String,

    /// Redis connection string.
    #[arg(long = "redis-url", env = "OTR_REDIS_URL", value_name = "URL")]
    pub redis_url: String,

    /// Capacity of the queue between the oplog tailer and the publisher.
    #[arg(
        long = "buffer-size",
        env = "OTR_BUFFER_SIZE",
        default_value_t = 10_000,
        value_parser = clap::value_parser!(u64).range(1..=1_000_000)
    )]
    pub buffer_size: u64,

    /// How often the timestamp of the last processed entry is written to Redis.
    #[arg(
        long = "timestamp-flush-interval",
        env = "OTR_TIMESTAMP_FLUSH_INTERVAL",
        default_value = "1s",
        value_parser = parse_duration_arg
    )]
    pub timestamp_flush_interval: Duration,

    /// Oldest checkpoint that is still replayed on startup; older ones start
    /// from the oplog tail.
    #[arg(
        long = "max-catch-up",
        env = "OTR_MAX_CATCH_UP",
        default_value = "60s",
        value_parser = parse_duration_arg
    )]
    pub max_catch_up: Duration,

    /// Lifetime of the keys that stop two instances publishing the same entry.
    #[arg(
        long = "redis-dedupe-expiration",
        env = "OTR_REDIS_DEDUPE_EXPIRATION",
        default_value = "120s",
        value_parser = parse_duration_arg
    )]
    pub redis_dedupe_expiration: Duration,

    /// Prefix for checkpoint and dedupe keys. Instances tailing the same
    /// MongoDB must share it; instances tailing different ones must not.
    #[arg(
        long = "redis-metadata-prefix",
        env = "OTR_REDIS_METADATA_PREFIX",
        default_value = "oplogtoredis::"
    )]
    pub redis_metadata_prefix: String,

    /// Connection attempts after the first before giving up at startup.
    #[arg(long = "connect-retries", env = "OTR_CONNECT_RETRIES", default_value_t = 3)]
    pub connect_retries: u32,

    /// Tracing filter (info,warn,debug,trace).
    #[arg(
        long = "log-level",
        value_name = "FILTER",
        default_value = "info",
        env = "OTR_LOG"
    )]
    pub log_filter: String,
}

fn parse_duration_arg(value: &str) -> std::result::Result<Duration, String> {
    parse_duration(value).map_err(|e| e.to_string())
}

/// Validated runtime configuration, built once at startup and handed to each
/// component by reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub mongo_url: String,
    pub redis_url: String,
    pub buffer_size: usize,
    pub timestamp_flush_interval: Duration,
    pub max_catch_up: Duration,
    pub redis_dedupe_expiration: Duration,
    pub redis_metadata_prefix: String,
    pub connect_retries: u32,
}

impl Config {
    pub fn publish_options(&self) -> PublishOptions {
        PublishOptions {
            flush_interval: self.timestamp_flush_interval,
            dedupe_expiration: self.redis_dedupe_expiration,
            metadata_prefix: self.redis_metadata_prefix.clone(),
        }
    }

    pub fn checkpoint_key(&self) -> String {
        checkpoint_key(&self.redis_metadata_prefix)
    }
}

impl TryFrom<Cli> for Config {
    type Error = anyhow::Error;

    fn try_from(args: Cli) -> Result<Self> {
        let mongo_url = args.mongo_url.trim().to_string();
        let redis_url = args.redis_url.trim().to_string();
        validate_url_scheme(&mongo_url, &["mongodb", "mongodb+srv"], "MongoDB")?;
        validate_url_scheme(&redis_url, &["redis", "rediss", "unix"], "Redis")?;

        if args.timestamp_flush_interval.is_zero() {
            bail!("timestamp flush interval must be greater than zero");
        }
        if args.max_catch_up.is_zero() {
            bail!("max catch-up must be greater than zero");
        }
        if args.redis_dedupe_expiration <= args.timestamp_flush_interval {
            bail!(
                "redis dedupe expiration ({:?}) must be longer than the timestamp flush interval ({:?}), \
                 otherwise entries replayed after a restart are published twice",
                args.redis_dedupe_expiration,
                args.timestamp_flush_interval
            );
        }
        if args.redis_metadata_prefix.is_empty() {
            bail!("redis metadata prefix cannot be empty");
        }

        Ok(Self {
            mongo_url,
            redis_url,
            buffer_size: args.buffer_size as usize,
            timestamp_flush_interval: args.timestamp_flush_interval,
            max_catch_up: args.max_catch_up,
            redis_dedupe_expiration: args.redis_dedupe_expiration,
            redis_metadata_prefix: args.redis_metadata_prefix,
            connect_retries: args.connect_retries,
        })
    }
}
