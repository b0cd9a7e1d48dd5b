//! Connection Registry
//!
//! Maps every accepted transport session to the connection id handed out by
//! the database, and tells the database when the session is gone.

use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{error, info};

use crate::database::{ConnectionId, Database};

use super::metrics::GatewayMetrics;

/// Metadata kept for a live session
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub remote_addr: SocketAddr,
    pub connected_at: DateTime<Utc>,
}

/// Live connection ids and the sessions they belong to
pub struct ConnectionRegistry<D: Database> {
    db: Arc<D>,
    sessions: DashMap<ConnectionId, SessionInfo>,
    metrics: Arc<GatewayMetrics>,
}

impl<D: Database> ConnectionRegistry<D> {
    pub fn new(db: Arc<D>, metrics: Arc<GatewayMetrics>) -> Self {
        Self {
            db,
            sessions: DashMap::new(),
            metrics,
        }
    }

    /// Register a freshly accepted session.
    ///
    /// The returned guard closes the registration when dropped, so the
    /// database hears about the session ending exactly once no matter how the
    /// session task exits.
    pub fn on_accept(self: &Arc<Self>, remote_addr: SocketAddr) -> SessionGuard<D> {
        let conn_id = self.db.connect();
        let info = SessionInfo {
            remote_addr,
            connected_at: Utc::now(),
        };
        if self.sessions.insert(conn_id, info).is_some() {
            error!("[{}] database reissued a live connection id", conn_id);
        }

        self.metrics.connections_accepted.inc();
        self.metrics.active_connections.inc();
        info!("[{}] {} connected", conn_id, remote_addr);

        SessionGuard {
            conn_id,
            registry: Arc::clone(self),
        }
    }

    /// Invalidate `conn_id` and notify the database.
    ///
    /// Returns `false` if the id was not live; repeated calls are no-ops.
    pub fn on_close(&self, conn_id: &ConnectionId) -> bool {
        let Some((_, info)) = self.sessions.remove(conn_id) else {
            return false;
        };

        self.db.disconnect(conn_id);
        self.metrics.connections_closed.inc();
        self.metrics.active_connections.dec();
        info!("[{}] {} disconnected", conn_id, info.remote_addr);
        true
    }

    pub fn is_live(&self, conn_id: &ConnectionId) -> bool {
        self.sessions.contains_key(conn_id)
    }

    pub fn session(&self, conn_id: &ConnectionId) -> Option<SessionInfo> {
        self.sessions.get(conn_id).map(|entry| entry.clone())
    }

    pub fn active_count(&self) -> usize {
        self.sessions.len()
    }
}

/// Registration of one live session; closes it on drop
pub struct SessionGuard<D: Database> {
    conn_id: ConnectionId,
    registry: Arc<ConnectionRegistry<D>>,
}

impl<D: Database> SessionGuard<D> {
    pub fn conn_id(&self) -> ConnectionId {
        self.conn_id
    }
}

impl<D: Database> Drop for SessionGuard<D> {
    fn drop(&mut self) {
        self.registry.on_close(&self.conn_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::MemoryDatabase;

    fn registry() -> (Arc<MemoryDatabase>, Arc<ConnectionRegistry<MemoryDatabase>>) {
        let db = Arc::new(MemoryDatabase::new("s1"));
        let registry = Arc::new(ConnectionRegistry::new(db.clone(), GatewayMetrics::shared()));
        (db, registry)
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_accept_assigns_distinct_ids() {
        let (db, registry) = registry();
        let a = registry.on_accept(addr(5001));
        let b = registry.on_accept(addr(5002));

        assert_ne!(a.conn_id(), b.conn_id());
        assert_eq!(registry.active_count(), 2);
        assert_eq!(db.session_count(), 2);
        assert_eq!(registry.session(&b.conn_id()).unwrap().remote_addr, addr(5002));
    }

    #[test]
    fn test_guard_drop_disconnects_once() {
        let (db, registry) = registry();
        let guard = registry.on_accept(addr(5001));
        let conn_id = guard.conn_id();

        drop(guard);
        assert!(!registry.is_live(&conn_id));
        assert_eq!(db.session_count(), 0);

        assert!(!registry.on_close(&conn_id));
        assert_eq!(registry.metrics.connections_closed.get(), 1);
        assert_eq!(registry.metrics.active_connections.get(), 0);
    }

    #[test]
    fn test_explicit_close_then_drop() {
        let (_db, registry) = registry();
        let guard = registry.on_accept(addr(5001));

        assert!(registry.on_close(&guard.conn_id()));
        drop(guard);
        assert_eq!(registry.metrics.connections_closed.get(), 1);
    }
}
