// ABOUTME: Library root for oplog-relay
// ABOUTME: Exports the oplog tailer, Redis publisher, pipeline and configuration

pub mod config;
pub mod memory;
pub mod oplog;
pub mod pipeline;
pub mod redispub;
pub mod utils;

pub use config::{Cli, Config};
pub use pipeline::{Pipeline, PipelineStats};
