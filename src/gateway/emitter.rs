//! Response Emitter
//!
//! Hands finished responses to the session they came from and logs the
//! outcome. A session that has already gone away simply loses the response.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::database::ConnectionId;

use super::metrics::GatewayMetrics;
use super::protocol::Response;

/// Sending side of one session's outbound queue
#[derive(Debug, Clone)]
pub struct SessionHandle {
    conn_id: ConnectionId,
    remote_addr: SocketAddr,
    outbound: mpsc::UnboundedSender<Response>,
}

impl SessionHandle {
    pub fn new(
        conn_id: ConnectionId,
        remote_addr: SocketAddr,
        outbound: mpsc::UnboundedSender<Response>,
    ) -> Self {
        Self {
            conn_id,
            remote_addr,
            outbound,
        }
    }

    pub fn conn_id(&self) -> ConnectionId {
        self.conn_id
    }
}

/// Delivers responses and records their outcome
#[derive(Debug, Clone)]
pub struct ResponseEmitter {
    metrics: Arc<GatewayMetrics>,
}

impl ResponseEmitter {
    pub fn new(metrics: Arc<GatewayMetrics>) -> Self {
        Self { metrics }
    }

    /// Queue `response` on `session`.
    ///
    /// Returns `false` when the session can no longer write; the response is
    /// dropped and the failure only logged. Write failures after queuing are
    /// recorded by the session writer.
    pub fn emit(&self, session: &SessionHandle, response: Response) -> bool {
        let envelope = serde_json::to_string(&response)
            .unwrap_or_else(|e| format!("<unserializable response seq={}: {}>", response.seq, e));
        let seq = response.seq;
        let is_error = response.is_error();

        if let Err(e) = session.outbound.send(response) {
            self.metrics.responses_undelivered.inc();
            warn!(
                "[{}] {} response seq={} undeliverable, session closed: {}",
                session.conn_id, session.remote_addr, seq, e
            );
            return false;
        }

        if is_error {
            warn!("[{}] {} <= {}", session.conn_id, session.remote_addr, envelope);
        } else {
            info!("[{}] {} <= {}", session.conn_id, session.remote_addr, envelope);
        }
        true
    }
}
