// ABOUTME: Oplog side of the relay
// ABOUTME: Timestamps, change entries, the source trait, MongoDB adapter and tailer

pub mod entry;
pub mod mongo;
pub mod source;
pub mod tailer;
pub mod timestamp;

pub use entry::{document_id_key, ChangeEntry, Namespace, Operation};
pub use mongo::MongoOplogSource;
pub use source::{ChangeSource, SourceError, StartPosition};
pub use tailer::{resolve_start_position, OplogTailer, TailStats};
pub use timestamp::OpTimestamp;
