//! Client Module
//!
//! Async client for a shard gateway. Used by tooling and by the integration
//! tests to talk to a running shard.

pub mod connection;

pub use connection::ShardClient;

use thiserror::Error;

/// Errors that can occur when talking to a shard
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Shard is not reachable at {0}")]
    ShardNotRunning(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("A request with seq {0} is already in flight")]
    DuplicateSeq(i64),

    #[error("Connection closed before a response arrived")]
    Closed,

    #[error("Shard error: {0}")]
    Remote(String),
}
