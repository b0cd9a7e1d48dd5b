//! Request Dispatcher
//!
//! Turns one inbound [`Request`] into exactly one [`Response`]. Whatever goes
//! wrong inside the database call (unknown method, bad arguments, an error,
//! a panic, a timeout) ends up in `Response.err`; nothing escapes to the
//! session task.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::database::{Args, ConnectionId, Database, DatabaseError, MethodTable};

use super::metrics::{GatewayMetrics, Timer};
use super::protocol::{Request, Response};

/// Per-request failure, reported to the client as `Response.err`
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("unknown method '{0}'")]
    UnknownMethod(String),

    #[error("{method}: invalid arguments: {reason}")]
    InvalidArguments { method: String, reason: String },

    #[error("{method}: {source}")]
    Operation {
        method: String,
        #[source]
        source: DatabaseError,
    },

    #[error("{method}: operation panicked: {message}")]
    Panicked { method: String, message: String },

    #[error("{method}: operation timed out after {}ms", .timeout.as_millis())]
    TimedOut { method: String, timeout: Duration },
}

/// Routes requests to the operations of a database
pub struct RequestDispatcher<D: Database> {
    db: Arc<D>,
    methods: MethodTable<D>,
    timeout: Option<Duration>,
    metrics: Arc<GatewayMetrics>,
}

impl<D: Database> RequestDispatcher<D> {
    /// Dispatcher over the operations the database type declares
    pub fn new(db: Arc<D>, metrics: Arc<GatewayMetrics>) -> Self {
        Self::with_methods(db, D::methods(), metrics)
    }

    pub fn with_methods(db: Arc<D>, methods: MethodTable<D>, metrics: Arc<GatewayMetrics>) -> Self {
        debug!("dispatcher exposes {} operations: {:?}", methods.len(), methods);
        Self {
            db,
            methods,
            timeout: None,
            metrics,
        }
    }

    /// Bound every operation by `timeout`; `None` leaves operations unbounded
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Handle one request on behalf of `conn_id`.
    ///
    /// `Response.seq` always echoes `request.seq`.
    pub async fn handle(&self, conn_id: ConnectionId, request: Request) -> Response {
        let Request { method, args, seq } = request;

        self.metrics.requests_total.inc();
        let timer = Timer::start();
        let result = self.dispatch(conn_id, &method, args).await;
        timer.record(&self.metrics.dispatch_latency);

        match result {
            Ok(data) => Response::ok(seq, data),
            Err(e) => {
                self.metrics.requests_failed.inc();
                Response::error(seq, e.to_string())
            }
        }
    }

    /// Invoke `method` with `conn_id` prepended to `args`
    pub async fn dispatch(
        &self,
        conn_id: ConnectionId,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, DispatchError> {
        let handler = self
            .methods
            .get(method)
            .ok_or_else(|| DispatchError::UnknownMethod(method.to_string()))?;

        let db = Arc::clone(&self.db);
        // The handler is invoked inside the future so a panic while building
        // the operation is contained the same way as one while running it.
        let call = AssertUnwindSafe(async move { handler(db, conn_id, Args::new(args)).await })
            .catch_unwind();

        let outcome = match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, call)
                .await
                .map_err(|_| DispatchError::TimedOut {
                    method: method.to_string(),
                    timeout,
                })?,
            None => call.await,
        };

        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(DatabaseError::InvalidArgument(reason))) => Err(DispatchError::InvalidArguments {
                method: method.to_string(),
                reason,
            }),
            Ok(Err(source)) => Err(DispatchError::Operation {
                method: method.to_string(),
                source,
            }),
            Err(panic) => Err(DispatchError::Panicked {
                method: method.to_string(),
                message: panic_message(panic.as_ref()),
            }),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
