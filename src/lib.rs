//! memdb shard gateway
//!
//! The front-door process for one shard of a distributed document store:
//! - TCP sessions carrying length-prefixed JSON request/response envelopes
//! - Dynamic dispatch of named operations onto a shard-local database facade
//! - Responses correlated to requests by a client-chosen `seq`
//! - Graceful startup, shutdown and optional background supervision

pub mod client;
pub mod config;
pub mod daemon;
pub mod database;
pub mod gateway;
pub mod logging;

pub use config::Config;
pub use database::{ConnectionId, Database, DatabaseError, MemoryDatabase};
pub use gateway::{Request, Response, ShardLifecycleController};
