//! Shard Lifecycle Management
//!
//! Drives one shard process through `Bootstrapping -> Running ->
//! ShuttingDown -> Stopped`. The current state lives in a watch channel owned
//! by the controller; the listener subscribes to it instead of consulting any
//! global flag.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::signal;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::{GatewayConfig, ShardConfig};
use crate::database::Database;

use super::metrics::GatewayMetrics;
use super::server::{Gateway, GatewayServer};

/// Delay between the end of shutdown and process exit, so buffered log
/// output reaches its sink
pub const SHUTDOWN_GRACE: Duration = Duration::from_millis(200);

/// How long the listener task may take to wind down before it is aborted
const LISTENER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Process-level state of a shard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Bootstrapping,
    Running,
    ShuttingDown,
    Stopped,
}

impl LifecycleState {
    /// Whether new client sessions may be accepted
    pub fn accepts_sessions(&self) -> bool {
        matches!(self, Self::Running)
    }
}

/// Requests a graceful shutdown from outside the controller
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    notify: Arc<Notify>,
}

impl ShutdownHandle {
    pub fn trigger(&self) {
        self.notify.notify_one();
    }
}

/// Owns the database and the listener of one shard
pub struct ShardLifecycleController<D: Database> {
    shard: ShardConfig,
    gateway_config: GatewayConfig,
    db: Arc<D>,
    metrics: Arc<GatewayMetrics>,
    state: watch::Sender<LifecycleState>,
    shutdown_requested: Arc<Notify>,
    listener: Mutex<Option<JoinHandle<Result<()>>>>,
    local_addr: OnceLock<SocketAddr>,
    start_claimed: AtomicBool,
}

impl<D: Database> ShardLifecycleController<D> {
    pub fn new(shard: ShardConfig, gateway_config: GatewayConfig, db: Arc<D>) -> Self {
        let (state, _) = watch::channel(LifecycleState::Bootstrapping);
        Self {
            shard,
            gateway_config,
            db,
            metrics: GatewayMetrics::shared(),
            state,
            shutdown_requested: Arc::new(Notify::new()),
            listener: Mutex::new(None),
            local_addr: OnceLock::new(),
            start_claimed: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    /// Observe state transitions
    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            notify: self.shutdown_requested.clone(),
        }
    }

    pub fn metrics(&self) -> &Arc<GatewayMetrics> {
        &self.metrics
    }

    /// Address the listener is bound to, once running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    /// Start the database, then begin accepting sessions.
    ///
    /// The listener is only bound after `Database::start` resolved. If either
    /// step fails the shard ends up `Stopped` and the error is returned.
    pub async fn start(&self) -> Result<SocketAddr> {
        let claimed = self
            .start_claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if !claimed {
            anyhow::bail!(
                "Shard {} already started ({:?})",
                self.shard.shard_id,
                self.state()
            );
        }

        info!("Starting shard {} on {}", self.shard.shard_id, self.shard.listen_addr());

        if let Err(e) = self.db.start().await {
            self.state.send_replace(LifecycleState::Stopped);
            return Err(e).with_context(|| {
                format!("Failed to start database for shard {}", self.shard.shard_id)
            });
        }

        let gateway = Arc::new(Gateway::new(
            self.db.clone(),
            &self.gateway_config,
            self.metrics.clone(),
        ));
        let bound = match GatewayServer::bind(&self.shard.listen_addr(), gateway).await {
            Ok(server) => server.local_addr().map(|addr| (server, addr)),
            Err(e) => Err(e),
        };
        let (server, addr) = match bound {
            Ok(bound) => bound,
            Err(e) => {
                if let Err(stop_err) = self.db.stop().await {
                    warn!("Failed to stop database after bind failure: {}", stop_err);
                }
                self.state.send_replace(LifecycleState::Stopped);
                return Err(e);
            }
        };

        // Running must be visible before the listener looks at the state
        self.state.send_replace(LifecycleState::Running);
        let handle = tokio::spawn(server.run(self.state.subscribe()));
        *self.listener.lock() = Some(handle);
        let _ = self.local_addr.set(addr);

        warn!("server started");
        Ok(addr)
    }

    /// Gracefully shut the shard down.
    ///
    /// Only the first call while `Running` does anything; it returns `true`.
    /// Every later call returns `false` immediately.
    pub async fn shutdown(&self) -> bool {
        let initiated = self.state.send_if_modified(|state| {
            if *state == LifecycleState::Running {
                *state = LifecycleState::ShuttingDown;
                true
            } else {
                false
            }
        });
        if !initiated {
            return false;
        }

        info!("Shutting down shard {}", self.shard.shard_id);

        // Stop accepting sessions
        let listener = self.listener.lock().take();
        if let Some(handle) = listener {
            let abort = handle.abort_handle();
            match tokio::time::timeout(LISTENER_DRAIN_TIMEOUT, handle).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => warn!("Gateway listener failed: {}", e),
                Ok(Err(e)) => warn!("Gateway listener task ended abnormally: {}", e),
                Err(_) => {
                    warn!(
                        "Gateway listener did not close within {}s, aborting",
                        LISTENER_DRAIN_TIMEOUT.as_secs()
                    );
                    abort.abort();
                }
            }
        }

        if let Err(e) = self.db.stop().await {
            error!("Failed to stop database: {}", e);
        }

        let snapshot = self.metrics.snapshot();
        info!(
            "Gateway totals: {} sessions accepted, {} requests ({} failed), \
             {} responses undeliverable, mean dispatch {:.2}ms",
            snapshot.connections_accepted,
            snapshot.requests_total,
            snapshot.requests_failed,
            snapshot.responses_undelivered,
            snapshot.dispatch_latency_ms
        );

        self.state.send_replace(LifecycleState::Stopped);
        warn!("server closed");
        true
    }

    /// Start, serve until SIGINT, SIGTERM or a [`ShutdownHandle`] trigger,
    /// shut down, then wait out [`SHUTDOWN_GRACE`].
    ///
    /// Signal handlers are in place before the database starts; a signal that
    /// arrives during startup shuts the shard down as soon as it is running.
    pub async fn run(&self) -> Result<()> {
        let mut signals = ShutdownSignals::register()?;
        self.start().await?;

        tokio::select! {
            name = signals.recv() => {
                info!("Received {}, shutting down", name);
            }
            _ = self.shutdown_requested.notified() => {
                info!("Shutdown requested");
            }
        }

        self.shutdown().await;
        tokio::time::sleep(SHUTDOWN_GRACE).await;
        Ok(())
    }
}

/// Process termination signals, registered up front
struct ShutdownSignals {
    #[cfg(unix)]
    interrupt: signal::unix::Signal,
    #[cfg(unix)]
    terminate: signal::unix::Signal,
}

impl ShutdownSignals {
    #[cfg(unix)]
    fn register() -> Result<Self> {
        use signal::unix::{signal, SignalKind};
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())
                .context("Failed to register SIGINT handler")?,
            terminate: signal(SignalKind::terminate())
                .context("Failed to register SIGTERM handler")?,
        })
    }

    #[cfg(not(unix))]
    fn register() -> Result<Self> {
        Ok(Self {})
    }

    /// Wait for the next signal and return its name
    #[cfg(unix)]
    async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.interrupt.recv() => "SIGINT",
            _ = self.terminate.recv() => "SIGTERM",
        }
    }

    #[cfg(not(unix))]
    async fn recv(&mut self) -> &'static str {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
        "Ctrl-C"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{ConnectionId, DatabaseError, MemoryDatabase, MethodTable};
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn shard(port: u16) -> ShardConfig {
        ShardConfig {
            shard_id: "s1".to_string(),
            host: "127.0.0.1".to_string(),
            port,
            redis: Value::Null,
            backend: Value::Null,
            slave: false,
            collections: Value::Null,
        }
    }

    fn controller_for(port: u16, db: Arc<Recorder>) -> ShardLifecycleController<Recorder> {
        ShardLifecycleController::new(shard(port), GatewayConfig::default(), db)
    }

    /// Counts lifecycle calls; optionally fails them
    #[derive(Default)]
    struct Recorder {
        fail_start: bool,
        fail_stop: bool,
        starts: AtomicUsize,
        stops: AtomicUsize,
    }

    #[async_trait]
    impl Database for Recorder {
        async fn start(&self) -> Result<(), DatabaseError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            if self.fail_start {
                return Err(DatabaseError::Other("backend unreachable".into()));
            }
            Ok(())
        }

        async fn stop(&self) -> Result<(), DatabaseError> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            if self.fail_stop {
                return Err(DatabaseError::Other("flush failed".into()));
            }
            Ok(())
        }

        fn connect(&self) -> ConnectionId {
            ConnectionId::new()
        }

        fn disconnect(&self, _conn_id: &ConnectionId) {}

        fn methods() -> MethodTable<Self> {
            MethodTable::new()
        }
    }

    #[tokio::test]
    async fn test_start_then_shutdown_is_idempotent() {
        let db = Arc::new(Recorder::default());
        let controller = controller_for(0, db.clone());
        assert_eq!(controller.state(), LifecycleState::Bootstrapping);

        let addr = controller.start().await.unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(controller.local_addr(), Some(addr));
        assert_eq!(controller.state(), LifecycleState::Running);

        assert!(controller.shutdown().await);
        assert!(!controller.shutdown().await);
        assert_eq!(db.stops.load(Ordering::SeqCst), 1);
        assert_eq!(controller.state(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn test_listener_closes_on_shutdown() {
        let db = Arc::new(MemoryDatabase::new("s1"));
        let controller = ShardLifecycleController::new(shard(0), GatewayConfig::default(), db);
        let addr = controller.start().await.unwrap();

        tokio::net::TcpStream::connect(addr).await.unwrap();
        controller.shutdown().await;

        assert!(tokio::net::TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_start_failure_does_not_listen() {
        let db = Arc::new(Recorder {
            fail_start: true,
            ..Default::default()
        });
        let controller = controller_for(0, db.clone());

        let err = controller.start().await.unwrap_err();
        assert!(format!("{:#}", err).contains("backend unreachable"));
        assert_eq!(controller.state(), LifecycleState::Stopped);
        assert!(controller.local_addr().is_none());

        // Nothing to shut down
        assert!(!controller.shutdown().await);
        assert_eq!(db.stops.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_bind_failure_stops_database() {
        let occupied = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = occupied.local_addr().unwrap().port();

        let db = Arc::new(Recorder::default());
        let controller = controller_for(port, db.clone());

        assert!(controller.start().await.is_err());
        assert_eq!(db.stops.load(Ordering::SeqCst), 1);
        assert_eq!(controller.state(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_failure_still_completes_shutdown() {
        let db = Arc::new(Recorder {
            fail_stop: true,
            ..Default::default()
        });
        let controller = controller_for(0, db.clone());
        controller.start().await.unwrap();

        assert!(controller.shutdown().await);
        assert_eq!(controller.state(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn test_run_exits_on_shutdown_handle() {
        let db = Arc::new(Recorder::default());
        let controller = Arc::new(controller_for(0, db.clone()));
        let mut state = controller.subscribe();

        let runner = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.run().await })
        };

        state.wait_for(|s| *s == LifecycleState::Running).await.unwrap();
        controller.shutdown_handle().trigger();
        controller.shutdown_handle().trigger();

        runner.await.unwrap().unwrap();
        assert_eq!(controller.state(), LifecycleState::Stopped);
        assert_eq!(db.starts.load(Ordering::SeqCst), 1);
        assert_eq!(db.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_starts_start_database_once() {
        let db = Arc::new(Recorder::default());
        let controller = controller_for(0, db.clone());

        let (first, second) = tokio::join!(controller.start(), controller.start());
        assert!(first.is_ok() ^ second.is_ok());
        assert_eq!(db.starts.load(Ordering::SeqCst), 1);
        assert_eq!(controller.state(), LifecycleState::Running);

        controller.shutdown().await;
    }

    #[tokio::test]
    async fn test_second_start_rejected() {
        let controller = ShardLifecycleController::new(
            shard(0),
            GatewayConfig::default(),
            Arc::new(Recorder::default()),
        );
        controller.start().await.unwrap();
        assert!(controller.start().await.is_err());
        controller.shutdown().await;
    }
}
