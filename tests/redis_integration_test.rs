// ABOUTME: Integration tests for the Redis backend
// ABOUTME: Requires a running Redis at TEST_REDIS_URL; run with --ignored

use std::env;
use std::time::Duration;

use futures::StreamExt;
use oplog_relay::memory::ChannelSource;
use oplog_relay::oplog::{ChangeEntry, Namespace, OpTimestamp, Operation};
use oplog_relay::redispub::{
    checkpoint_key, CheckpointStore, DedupeStore, PublishOptions, RedisBackend, Sink,
};
use oplog_relay::Pipeline;
use tokio::sync::broadcast;

fn get_test_url() -> Option<String> {
    env::var("TEST_REDIS_URL").ok()
}

/// Per-run key prefix so repeated runs do not see each other's markers
fn unique_prefix(test: &str) -> String {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    format!("otr-test::{}::{}::{}::", test, std::process::id(), nanos)
}

#[tokio::test]
#[ignore]
async fn test_dedupe_marker_is_created_once() {
    let url = get_test_url().expect("TEST_REDIS_URL must be set");
    let backend = RedisBackend::connect(&url)
        .await
        .expect("Failed to connect to Redis");

    let key = format!("{}processed::abc", unique_prefix("dedupe"));
    let ttl = Duration::from_secs(5);
    assert!(backend.create_if_absent(&key, ttl).await.unwrap());
    assert!(!backend.create_if_absent(&key, ttl).await.unwrap());
}

#[tokio::test]
#[ignore]
async fn test_dedupe_marker_expires() {
    let url = get_test_url().expect("TEST_REDIS_URL must be set");
    let backend = RedisBackend::connect(&url)
        .await
        .expect("Failed to connect to Redis");

    let key = format!("{}processed::short", unique_prefix("expiry"));
    assert!(backend
        .create_if_absent(&key, Duration::from_millis(100))
        .await
        .unwrap());
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(backend
        .create_if_absent(&key, Duration::from_millis(100))
        .await
        .unwrap());
}

#[tokio::test]
#[ignore]
async fn test_checkpoint_roundtrip() {
    let url = get_test_url().expect("TEST_REDIS_URL must be set");
    let backend = RedisBackend::connect(&url)
        .await
        .expect("Failed to connect to Redis");

    let key = checkpoint_key(&unique_prefix("checkpoint"));
    assert_eq!(backend.get(&key).await.unwrap(), None);

    let ts = OpTimestamp::new(1_700_000_000, 7);
    backend.set(&key, ts).await.unwrap();
    assert_eq!(backend.get(&key).await.unwrap(), Some(ts));
}

#[tokio::test]
#[ignore]
async fn test_pipeline_publishes_to_subscribers() {
    let url = get_test_url().expect("TEST_REDIS_URL must be set");
    let prefix = unique_prefix("pubsub");
    let database = format!("db{}", std::process::id());

    let client = redis::Client::open(url.as_str()).unwrap();
    let mut pubsub = client.get_async_pubsub().await.unwrap();
    pubsub
        .subscribe(format!("{}.widgets::w1", database))
        .await
        .unwrap();

    let backend = RedisBackend::connect(&url)
        .await
        .expect("Failed to connect to Redis");
    backend.publish("warmup", b"ignored").await.unwrap();

    let (feed, source) = ChannelSource::channel();
    let (_stop_tx, stop_rx) = broadcast::channel(1);
    feed.send(Ok(ChangeEntry::new(
        Namespace::new(database.clone(), "widgets"),
        Operation::Insert,
        OpTimestamp::new(1_700_000_000, 1),
    )
    .with_document_id("w1")))
        .unwrap();
    drop(feed);

    let options = PublishOptions {
        flush_interval: Duration::from_millis(50),
        dedupe_expiration: Duration::from_secs(10),
        metadata_prefix: prefix.clone(),
    };
    let stats = Pipeline::new(16, options)
        .run(source, backend.clone(), stop_rx)
        .await
        .unwrap();
    assert_eq!(stats.publish.published, 2);

    let mut messages = Box::pin(pubsub.on_message());
    let message = tokio::time::timeout(Duration::from_secs(5), messages.next())
        .await
        .expect("no message received")
        .expect("subscription closed");
    let payload: String = message.get_payload().unwrap();
    let value: serde_json::Value = serde_json::from_str(&payload).unwrap();
    assert_eq!(value["op"], "insert");
    assert_eq!(value["id"], "w1");

    assert_eq!(
        backend.get(&checkpoint_key(&prefix)).await.unwrap(),
        Some(OpTimestamp::new(1_700_000_000, 1))
    );
}
