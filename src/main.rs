// ABOUTME: CLI entry point for oplog-relay
// ABOUTME: Connects to MongoDB and Redis, then runs the relay until interrupted

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use clap::Parser;
use oplog_relay::oplog::{mongo, resolve_start_position, MongoOplogSource};
use oplog_relay::redispub::RedisBackend;
use oplog_relay::utils::{retry_with_backoff, sanitize_url};
use oplog_relay::{Cli, Config, Pipeline};
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(1);

fn init_tracing(filter: &str) -> Result<()> {
    let env_filter = EnvFilter::try_new(filter).or_else(|_| EnvFilter::try_new("info"))?;
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .try_init()
        .map_err(|err| anyhow!("failed to init tracing subscriber: {err}"))
}

/// First interrupt starts a graceful shutdown; a second one exits immediately.
fn spawn_signal_handler(shutdown_tx: broadcast::Sender<()>) {
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C, graceful shutdown unavailable: {}", e);
            // Dropping the sender would read as a shutdown request
            let _held = shutdown_tx;
            std::future::pending::<()>().await;
            return;
        }
        tracing::warn!("Interrupt received, shutting down gracefully. Interrupt again to force unclean shutdown");
        let _ = shutdown_tx.send(());

        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::error!("Second interrupt received, forcing exit");
            std::process::exit(130);
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_filter)?;
    let config = Config::try_from(cli)?;

    tracing::info!(
        mongo_url = %sanitize_url(&config.mongo_url),
        redis_url = %sanitize_url(&config.redis_url),
        "Starting oplog-relay"
    );

    let redis_url = config.redis_url.clone();
    let backend = retry_with_backoff(
        || RedisBackend::connect(&redis_url),
        config.connect_retries,
        CONNECT_RETRY_DELAY,
    )
    .await
    .context("Failed to connect to Redis")?;
    tracing::info!("Connected to Redis");

    let mongo_url = config.mongo_url.clone();
    let client = retry_with_backoff(
        || mongo::connect(&mongo_url),
        config.connect_retries,
        CONNECT_RETRY_DELAY,
    )
    .await
    .context("Failed to connect to MongoDB")?;
    tracing::info!("Connected to MongoDB");

    let position = resolve_start_position(
        &backend,
        &config.checkpoint_key(),
        config.max_catch_up,
        Utc::now(),
    )
    .await;
    let source = MongoOplogSource::open(&client, position)
        .await
        .context("Failed to open the oplog")?;

    let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
    spawn_signal_handler(shutdown_tx);

    let stats = Pipeline::new(config.buffer_size, config.publish_options())
        .run(source, backend, shutdown_rx)
        .await?;

    tracing::info!(
        entries_read = stats.tail.entries_read,
        publications_queued = stats.tail.publications_queued,
        source_errors = stats.tail.source_errors,
        published = stats.publish.published,
        duplicates = stats.publish.duplicates,
        publish_failures = stats.publish.publish_failures,
        abandoned = stats.publish.abandoned,
        last_checkpoint = ?stats.publish.last_checkpoint.map(|ts| ts.to_string()),
        "oplog-relay stopped"
    );

    client.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_tracing_falls_back_on_bad_filter() {
        // A second init in the same process fails, which is all we can observe.
        let first = init_tracing("not[a valid filter");
        let second = init_tracing("info");
        assert!(first.is_ok());
        assert!(second.is_err());
    }
}
