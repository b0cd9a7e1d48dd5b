//! Client Connection
//!
//! One TCP session to a shard gateway. Requests may be issued concurrently;
//! a background reader matches every response to its waiter by `seq`, so
//! responses completing out of order are handled.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::DEFAULT_MAX_MESSAGE_BYTES;
use crate::gateway::protocol::{read_frame, write_frame, Request, Response};

use super::ClientError;

type Pending = Arc<Mutex<HashMap<i64, oneshot::Sender<Response>>>>;

/// Client session to a shard
pub struct ShardClient {
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    pending: Pending,
    next_seq: AtomicI64,
    reader: JoinHandle<()>,
}

impl ShardClient {
    /// Connect to the shard listening on `addr`
    pub async fn connect<A>(addr: A) -> Result<Self, ClientError>
    where
        A: ToSocketAddrs + std::fmt::Debug,
    {
        debug!("Connecting to shard at {:?}", addr);

        let stream = TcpStream::connect(&addr).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::ConnectionRefused {
                ClientError::ShardNotRunning(format!("{:?}", addr))
            } else {
                ClientError::ConnectionFailed(e.to_string())
            }
        })?;
        let peer_addr = stream
            .peer_addr()
            .map_err(|e| ClientError::ConnectionFailed(e.to_string()))?;
        let _ = stream.set_nodelay(true);

        let (reader, writer) = stream.into_split();
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let reader = tokio::spawn(read_responses(reader, pending.clone()));

        debug!("Connected to shard at {}", peer_addr);
        Ok(Self {
            writer: tokio::sync::Mutex::new(writer),
            pending,
            next_seq: AtomicI64::new(1),
            reader,
        })
    }

    /// Invoke `method` and return its result, mapping `err` to [`ClientError::Remote`]
    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value, ClientError> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let response = self.send(Request::new(method, args, seq)).await?;
        match response.err {
            Some(err) => Err(ClientError::Remote(err)),
            None => Ok(response.data.unwrap_or(Value::Null)),
        }
    }

    /// Send a request with a caller-chosen `seq` and wait for its response
    pub async fn send(&self, request: Request) -> Result<Response, ClientError> {
        let seq = request.seq;
        let rx = {
            let mut pending = self.pending.lock();
            if pending.contains_key(&seq) {
                return Err(ClientError::DuplicateSeq(seq));
            }
            let (tx, rx) = oneshot::channel();
            pending.insert(seq, tx);
            rx
        };

        let written = {
            let mut writer = self.writer.lock().await;
            write_frame(&mut *writer, &request, DEFAULT_MAX_MESSAGE_BYTES).await
        };
        if let Err(e) = written {
            self.pending.lock().remove(&seq);
            return Err(ClientError::RequestFailed(format!("Failed to send request: {}", e)));
        }

        rx.await.map_err(|_| ClientError::Closed)
    }

    /// Number of requests still waiting for a response
    pub fn in_flight(&self) -> usize {
        self.pending.lock().len()
    }
}

impl Drop for ShardClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Route responses to their waiters until the connection ends
async fn read_responses(mut reader: OwnedReadHalf, pending: Pending) {
    loop {
        match read_frame(&mut reader, DEFAULT_MAX_MESSAGE_BYTES).await {
            Ok(Some(payload)) => match serde_json::from_slice::<Response>(&payload) {
                Ok(response) => {
                    let waiter = pending.lock().remove(&response.seq);
                    match waiter {
                        Some(tx) => {
                            let _ = tx.send(response);
                        }
                        None => debug!("Dropping response for unknown seq {}", response.seq),
                    }
                }
                Err(e) => debug!("Dropping undecodable response: {}", e),
            },
            Ok(None) => break,
            Err(e) => {
                debug!("Shard connection failed: {}", e);
                break;
            }
        }
    }

    // Waking every waiter with a closed channel
    pending.lock().clear();
}
