//! Gateway Server
//!
//! TCP listener for client sessions. Each accepted socket gets a reader loop
//! that decodes requests in arrival order and spawns one dispatch task per
//! request, plus a writer task that serializes responses back onto the socket
//! in completion order.

use std::net::SocketAddr;
use std::pin::pin;
use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::poll;
use tokio::io::AsyncWrite;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::config::GatewayConfig;
use crate::database::{ConnectionId, Database};

use super::emitter::{ResponseEmitter, SessionHandle};
use super::handler::RequestDispatcher;
use super::lifecycle::LifecycleState;
use super::metrics::GatewayMetrics;
use super::protocol::{decode_request, read_frame, write_frame, ProtocolError, Response};
use super::registry::ConnectionRegistry;

/// Back-off after a failed `accept`, so a persistent error (e.g. fd
/// exhaustion) does not spin the event loop
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Components shared by every session of one shard
pub struct Gateway<D: Database> {
    pub registry: Arc<ConnectionRegistry<D>>,
    pub dispatcher: RequestDispatcher<D>,
    pub emitter: ResponseEmitter,
    pub metrics: Arc<GatewayMetrics>,
    pub max_message_bytes: usize,
}

impl<D: Database> Gateway<D> {
    pub fn new(db: Arc<D>, config: &GatewayConfig, metrics: Arc<GatewayMetrics>) -> Self {
        Self {
            registry: Arc::new(ConnectionRegistry::new(db.clone(), metrics.clone())),
            dispatcher: RequestDispatcher::new(db, metrics.clone())
                .with_timeout(config.request_timeout()),
            emitter: ResponseEmitter::new(metrics.clone()),
            metrics,
            max_message_bytes: config.max_message_bytes,
        }
    }
}

/// Listening socket bound to the shard's address
pub struct GatewayServer<D: Database> {
    listener: TcpListener,
    gateway: Arc<Gateway<D>>,
}

impl<D: Database> GatewayServer<D> {
    /// Bind the listener. Sessions are not accepted until [`run`](Self::run).
    pub async fn bind(addr: &str, gateway: Arc<Gateway<D>>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind gateway listener on {}", addr))?;
        Ok(Self { listener, gateway })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("Failed to read listener address")
    }

    /// Accept sessions until the lifecycle leaves `Running`.
    ///
    /// The listener is closed when this returns; sessions that are already
    /// open keep running.
    pub async fn run(self, mut state: watch::Receiver<LifecycleState>) -> Result<()> {
        if let Ok(addr) = self.listener.local_addr() {
            info!("Gateway listening on {}", addr);
        }

        loop {
            if !state.borrow_and_update().accepts_sessions() {
                break;
            }

            tokio::select! {
                biased;

                changed = state.changed() => {
                    if changed.is_err() {
                        // Controller dropped; nothing left to serve for
                        break;
                    }
                }
                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((stream, remote_addr)) => {
                            let gateway = self.gateway.clone();
                            tokio::spawn(handle_session(gateway, stream, remote_addr));
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                            tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                        }
                    }
                }
            }
        }

        info!("Gateway listener closed");
        Ok(())
    }
}

/// Serve one client session until it closes
async fn handle_session<D: Database>(
    gateway: Arc<Gateway<D>>,
    stream: TcpStream,
    remote_addr: SocketAddr,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("{}: failed to set TCP_NODELAY: {}", remote_addr, e);
    }

    let guard = gateway.registry.on_accept(remote_addr);
    let conn_id = guard.conn_id();
    let limit = gateway.max_message_bytes;

    let (mut reader, writer) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel::<Response>();
    let session = SessionHandle::new(conn_id, remote_addr, tx);

    // Ends once every holder of a SessionHandle is gone
    tokio::spawn(write_responses(
        writer,
        rx,
        conn_id,
        remote_addr,
        limit,
        gateway.metrics.clone(),
    ));

    // Each dispatch task holds a sender until its operation has been polled
    // once; `recv` returning `None` means all of them reached the database.
    let (dispatched_tx, mut dispatched_rx) = mpsc::channel::<()>(1);

    loop {
        let payload = match read_frame(&mut reader, limit).await {
            Ok(Some(payload)) => payload,
            Ok(None) => break,
            Err(e) => {
                warn!("[{}] {} closing session: {}", conn_id, remote_addr, e);
                break;
            }
        };

        match decode_request(&payload) {
            Ok(request) => {
                info!(
                    "[{}] {} => {}",
                    conn_id,
                    remote_addr,
                    String::from_utf8_lossy(&payload)
                );
                let gateway = gateway.clone();
                let session = session.clone();
                let dispatched = dispatched_tx.clone();
                tokio::spawn(async move {
                    let mut call = pin!(gateway.dispatcher.handle(session.conn_id(), request));
                    let first = poll!(call.as_mut());
                    drop(dispatched);
                    let response = match first {
                        Poll::Ready(response) => response,
                        Poll::Pending => call.await,
                    };
                    gateway.emitter.emit(&session, response);
                });
            }
            Err(malformed) => match malformed.seq {
                Some(seq) => {
                    warn!(
                        "[{}] {} rejected request seq={}: {}",
                        conn_id, remote_addr, seq, malformed
                    );
                    gateway
                        .emitter
                        .emit(&session, Response::error(seq, malformed.to_string()));
                }
                None => {
                    warn!(
                        "[{}] {} dropped message without a usable seq: {}",
                        conn_id, remote_addr, malformed
                    );
                }
            },
        }
    }

    // Requests already read reach the database before it hears about the
    // close. Their responses still go out if the peer only half-closed.
    drop(session);
    drop(dispatched_tx);
    let _ = dispatched_rx.recv().await;
    drop(guard);
}

/// Serialize responses onto the socket in completion order
async fn write_responses<W>(
    mut writer: W,
    mut rx: mpsc::UnboundedReceiver<Response>,
    conn_id: ConnectionId,
    remote_addr: SocketAddr,
    limit: usize,
    metrics: Arc<GatewayMetrics>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(response) = rx.recv().await {
        let seq = response.seq;
        let sent = match write_frame(&mut writer, &response, limit).await {
            Err(e @ ProtocolError::FrameTooLarge { .. }) | Err(e @ ProtocolError::Encode(_)) => {
                // Nothing was written, the stream is still in sync
                warn!(
                    "[{}] {} response seq={} not sendable: {}",
                    conn_id, remote_addr, seq, e
                );
                write_frame(&mut writer, &Response::error(seq, e.to_string()), limit).await
            }
            other => other,
        };

        if let Err(e) = sent {
            metrics.responses_undelivered.inc();
            warn!(
                "[{}] {} response seq={} undeliverable: {}",
                conn_id, remote_addr, seq, e
            );
            break;
        }
    }

    // Whatever is still queued can no longer be written
    rx.close();
    while let Ok(response) = rx.try_recv() {
        metrics.responses_undelivered.inc();
        warn!(
            "[{}] {} response seq={} undeliverable: session closed",
            conn_id, remote_addr, response.seq
        );
    }
}
