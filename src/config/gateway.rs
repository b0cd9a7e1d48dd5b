//! RPC gateway configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default maximum frame size accepted from a client (16 MiB)
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 16 * 1024 * 1024;

/// Gateway configuration (the `gateway` section of the config file)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Upper bound for a single database operation. Unset means operations may
    /// run indefinitely.
    #[serde(default)]
    pub request_timeout_ms: Option<u64>,
    /// Maximum accepted frame payload in bytes
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
}

fn default_max_message_bytes() -> usize {
    DEFAULT_MAX_MESSAGE_BYTES
}

impl GatewayConfig {
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: None,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
        }
    }
}
