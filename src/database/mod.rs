//! Database facade
//!
//! The gateway never touches storage directly. Everything it needs from the
//! shard-local engine goes through the [`Database`] trait: lifecycle
//! (`start`/`stop`), session bookkeeping (`connect`/`disconnect`), and a
//! [`MethodTable`] naming every operation a client may invoke.
//!
//! [`MemoryDatabase`] is an in-process implementation used by the binary and
//! by the test suite.

pub mod memory;
pub mod methods;

pub use memory::MemoryDatabase;
pub use methods::{Args, MethodFuture, MethodHandler, MethodTable};

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Opaque token correlating a transport session with facade-side session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Generate a fresh random identifier
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors reported by a database facade
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DatabaseError {
    #[error("database is not running")]
    NotRunning,

    #[error("database already started")]
    AlreadyStarted,

    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("document {id} already exists in {collection}")]
    DuplicateKey { collection: String, id: String },

    #[error("document {id} not found in {collection}")]
    NotFound { collection: String, id: String },

    #[error("{0}")]
    Other(String),
}

/// Shard-local database as seen by the gateway
#[async_trait]
pub trait Database: Send + Sync + 'static {
    /// Bring the database online. Must complete before sessions are accepted.
    async fn start(&self) -> Result<(), DatabaseError>;

    /// Flush and take the database offline
    async fn stop(&self) -> Result<(), DatabaseError>;

    /// Open a session and return its identifier. Identifiers of live sessions
    /// are unique.
    fn connect(&self) -> ConnectionId;

    /// Discard all state held for a session
    fn disconnect(&self, conn_id: &ConnectionId);

    /// Operations clients may invoke by name
    fn methods() -> MethodTable<Self>
    where
        Self: Sized;
}
