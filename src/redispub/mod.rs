// ABOUTME: Redis publishing side of the relay
// ABOUTME: Publications, backend traits, the Redis adapter and the publisher loop

pub mod backend;
pub mod publication;
pub mod publisher;
pub mod store;

pub use backend::RedisBackend;
pub use publication::{publications_for, Publication};
pub use publisher::{checkpoint_key, PublishOptions, PublishStats, Publisher};
pub use store::{CheckpointStore, DedupeStore, Sink, StoreError};
