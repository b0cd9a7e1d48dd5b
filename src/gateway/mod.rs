//! Shard Gateway
//!
//! Front door of one memdb shard: accepts client sessions over TCP, routes
//! each request to a named database operation, and returns a response
//! correlated by the client's `seq`.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                ShardLifecycleController                     │
//! │   Bootstrapping -> Running -> ShuttingDown -> Stopped       │
//! │                                                             │
//! │  ┌──────────────┐   accept   ┌──────────────────────────┐   │
//! │  │ GatewayServer│──────────▶│   ConnectionRegistry      │   │
//! │  │ (TcpListener)│            │  session <-> conn id      │   │
//! │  └──────┬───────┘            └──────────────────────────┘   │
//! │         │ frame                                             │
//! │  ┌──────▼───────────┐  call  ┌──────────────────────────┐   │
//! │  │ RequestDispatcher│──────▶│   Database (MethodTable)  │   │
//! │  └──────┬───────────┘        └──────────────────────────┘   │
//! │         │ Response                                          │
//! │  ┌──────▼───────────┐                                       │
//! │  │ ResponseEmitter  │──▶ originating session                │
//! │  └──────────────────┘                                       │
//! └────────────────────────────────────────────────────────────┘
//! ```

pub mod emitter;
pub mod handler;
pub mod lifecycle;
pub mod metrics;
pub mod protocol;
pub mod registry;
pub mod server;

pub use emitter::{ResponseEmitter, SessionHandle};
pub use handler::{DispatchError, RequestDispatcher};
pub use lifecycle::{LifecycleState, ShardLifecycleController, ShutdownHandle, SHUTDOWN_GRACE};
pub use metrics::{GatewayMetrics, MetricsSnapshot};
pub use protocol::{
    decode_request, encode_frame, read_frame, write_frame, MalformedRequest, ProtocolError,
    Request, Response,
};
pub use registry::{ConnectionRegistry, SessionGuard, SessionInfo};
pub use server::{Gateway, GatewayServer};
