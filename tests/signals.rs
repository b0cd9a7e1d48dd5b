//! Signal handling during startup. In its own test binary because it
//! signals the whole process.

#![cfg(unix)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use memdb::{
    config::{GatewayConfig, ShardConfig},
    database::{ConnectionId, Database, DatabaseError, MethodTable},
    gateway::{LifecycleState, ShardLifecycleController},
};
use serde_json::Value;
use tokio::sync::Notify;

/// Database whose startup blocks until released
#[derive(Default)]
struct SlowStart {
    release: Notify,
    starts: AtomicUsize,
    stops: AtomicUsize,
}

#[async_trait]
impl Database for SlowStart {
    async fn start(&self) -> Result<(), DatabaseError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.release.notified().await;
        Ok(())
    }

    async fn stop(&self) -> Result<(), DatabaseError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
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
async fn test_sigterm_during_startup_shuts_down() {
    let db = Arc::new(SlowStart::default());
    let shard = ShardConfig {
        shard_id: "s1".to_string(),
        host: "127.0.0.1".to_string(),
        port: 0,
        redis: Value::Null,
        backend: Value::Null,
        slave: false,
        collections: Value::Null,
    };
    let controller = Arc::new(ShardLifecycleController::new(
        shard,
        GatewayConfig::default(),
        db.clone(),
    ));

    let runner = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.run().await })
    };

    tokio::time::timeout(Duration::from_secs(5), async {
        while db.starts.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let status = std::process::Command::new("kill")
        .args(["-TERM", &std::process::id().to_string()])
        .status()
        .unwrap();
    assert!(status.success());
    tokio::time::sleep(Duration::from_millis(100)).await;

    db.release.notify_one();
    tokio::time::timeout(Duration::from_secs(5), runner)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert_eq!(controller.state(), LifecycleState::Stopped);
    assert_eq!(db.stops.load(Ordering::SeqCst), 1);
}
