//! Per-shard configuration

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One entry of the `shards` table in the config file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardEntry {
    /// Interface the shard listens on
    pub host: String,
    /// TCP port the shard listens on
    pub port: u16,
    /// Whether this shard runs as a replica
    #[serde(default)]
    pub slave: bool,
}

/// Resolved options for the shard this process owns.
///
/// Built once during bootstrap and never mutated afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct ShardConfig {
    pub shard_id: String,
    pub host: String,
    pub port: u16,
    pub redis: Value,
    pub backend: Value,
    pub slave: bool,
    pub collections: Value,
}

impl ShardConfig {
    /// `host:port` listen address
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
