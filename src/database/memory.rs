//! In-memory database
//!
//! Documents live in per-collection maps keyed by `_id`. Every connection
//! stages its writes privately: they are visible to that connection at once
//! and to everyone else after `commit`. `rollback` and `disconnect` discard
//! staged writes. Concurrent commits are last-writer-wins.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::config::ShardConfig;

use super::methods::{Args, MethodTable};
use super::{ConnectionId, Database, DatabaseError};

type Collection = BTreeMap<String, Value>;

/// Staged change: `Some(doc)` is an upsert, `None` a removal
type Staged = BTreeMap<(String, String), Option<Value>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Idle,
    Running,
    Stopped,
}

/// In-process database facade
pub struct MemoryDatabase {
    shard_id: String,
    slave: bool,
    state: RwLock<RunState>,
    committed: RwLock<HashMap<String, Collection>>,
    sessions: DashMap<ConnectionId, Staged>,
}

impl MemoryDatabase {
    pub fn new(shard_id: impl Into<String>) -> Self {
        Self {
            shard_id: shard_id.into(),
            slave: false,
            state: RwLock::new(RunState::Idle),
            committed: RwLock::new(HashMap::new()),
            sessions: DashMap::new(),
        }
    }

    /// Build from resolved shard options
    pub fn from_config(config: &ShardConfig) -> Self {
        Self {
            slave: config.slave,
            ..Self::new(config.shard_id.clone())
        }
    }

    /// Number of open sessions
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    fn ensure_running(&self) -> Result<(), DatabaseError> {
        if *self.state.read() == RunState::Running {
            Ok(())
        } else {
            Err(DatabaseError::NotRunning)
        }
    }

    fn ensure_session(&self, conn_id: &ConnectionId) -> Result<(), DatabaseError> {
        self.ensure_running()?;
        if self.sessions.contains_key(conn_id) {
            Ok(())
        } else {
            Err(DatabaseError::UnknownConnection(*conn_id))
        }
    }

    /// Document as seen by `conn_id`: its own staged change first, then committed data
    fn visible(&self, conn_id: &ConnectionId, collection: &str, id: &str) -> Option<Value> {
        let key = (collection.to_string(), id.to_string());
        if let Some(staged) = self.sessions.get(conn_id) {
            if let Some(change) = staged.get(&key) {
                return change.clone();
            }
        }
        self.committed
            .read()
            .get(collection)
            .and_then(|docs| docs.get(id))
            .cloned()
    }

    fn stage(
        &self,
        conn_id: &ConnectionId,
        collection: &str,
        id: &str,
        doc: Option<Value>,
    ) -> Result<(), DatabaseError> {
        let mut staged = self
            .sessions
            .get_mut(conn_id)
            .ok_or(DatabaseError::UnknownConnection(*conn_id))?;
        staged.insert((collection.to_string(), id.to_string()), doc);
        Ok(())
    }

    pub fn find(
        &self,
        conn_id: &ConnectionId,
        collection: &str,
        id: &str,
    ) -> Result<Value, DatabaseError> {
        self.ensure_session(conn_id)?;
        Ok(self.visible(conn_id, collection, id).unwrap_or(Value::Null))
    }

    /// All visible documents of `collection` whose `field` equals `value`, ordered by id
    pub fn find_by_index(
        &self,
        conn_id: &ConnectionId,
        collection: &str,
        field: &str,
        value: &Value,
    ) -> Result<Vec<Value>, DatabaseError> {
        self.ensure_session(conn_id)?;

        let mut view: Collection = self
            .committed
            .read()
            .get(collection)
            .cloned()
            .unwrap_or_default();
        if let Some(staged) = self.sessions.get(conn_id) {
            for ((coll, id), change) in staged.iter() {
                if coll != collection {
                    continue;
                }
                match change {
                    Some(doc) => {
                        view.insert(id.clone(), doc.clone());
                    }
                    None => {
                        view.remove(id);
                    }
                }
            }
        }

        Ok(view
            .into_values()
            .filter(|doc| doc.get(field) == Some(value))
            .collect())
    }

    pub fn insert(
        &self,
        conn_id: &ConnectionId,
        collection: &str,
        id: &str,
        doc: Value,
    ) -> Result<(), DatabaseError> {
        self.ensure_session(conn_id)?;
        let mut doc = into_object(doc)?;
        if self.visible(conn_id, collection, id).is_some() {
            return Err(DatabaseError::DuplicateKey {
                collection: collection.to_string(),
                id: id.to_string(),
            });
        }
        doc.insert("_id".to_string(), Value::String(id.to_string()));
        self.stage(conn_id, collection, id, Some(Value::Object(doc)))
    }

    /// Shallow-merge `fields` into an existing document
    pub fn update(
        &self,
        conn_id: &ConnectionId,
        collection: &str,
        id: &str,
        fields: Value,
    ) -> Result<(), DatabaseError> {
        self.ensure_session(conn_id)?;
        let fields = into_object(fields)?;
        let current = self
            .visible(conn_id, collection, id)
            .ok_or_else(|| DatabaseError::NotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            })?;

        let mut doc = into_object(current)?;
        for (key, value) in fields {
            if key != "_id" {
                doc.insert(key, value);
            }
        }
        self.stage(conn_id, collection, id, Some(Value::Object(doc)))
    }

    pub fn remove(
        &self,
        conn_id: &ConnectionId,
        collection: &str,
        id: &str,
    ) -> Result<(), DatabaseError> {
        self.ensure_session(conn_id)?;
        if self.visible(conn_id, collection, id).is_none() {
            return Err(DatabaseError::NotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            });
        }
        self.stage(conn_id, collection, id, None)
    }

    /// Publish staged writes, returning how many were applied
    pub fn commit(&self, conn_id: &ConnectionId) -> Result<usize, DatabaseError> {
        self.ensure_session(conn_id)?;
        let staged = match self.sessions.get_mut(conn_id) {
            Some(mut staged) => std::mem::take(&mut *staged),
            None => return Err(DatabaseError::UnknownConnection(*conn_id)),
        };

        let count = staged.len();
        let mut committed = self.committed.write();
        for ((collection, id), change) in staged {
            let docs = committed.entry(collection).or_default();
            match change {
                Some(doc) => {
                    docs.insert(id, doc);
                }
                None => {
                    docs.remove(&id);
                }
            }
        }
        debug!("[{}] committed {} changes", conn_id, count);
        Ok(count)
    }

    /// Discard staged writes, returning how many were dropped
    pub fn rollback(&self, conn_id: &ConnectionId) -> Result<usize, DatabaseError> {
        self.ensure_session(conn_id)?;
        let mut staged = self
            .sessions
            .get_mut(conn_id)
            .ok_or(DatabaseError::UnknownConnection(*conn_id))?;
        let count = staged.len();
        staged.clear();
        Ok(count)
    }

    pub fn info(&self, conn_id: &ConnectionId) -> Result<Value, DatabaseError> {
        self.ensure_session(conn_id)?;
        let committed = self.committed.read();
        Ok(json!({
            "shard": self.shard_id,
            "slave": self.slave,
            "collections": committed.len(),
            "documents": committed.values().map(BTreeMap::len).sum::<usize>(),
            "connections": self.sessions.len(),
        }))
    }
}

fn into_object(value: Value) -> Result<Map<String, Value>, DatabaseError> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(DatabaseError::InvalidArgument(format!(
            "expected an object, got {}",
            other
        ))),
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    async fn start(&self) -> Result<(), DatabaseError> {
        let mut state = self.state.write();
        if *state == RunState::Running {
            return Err(DatabaseError::AlreadyStarted);
        }
        *state = RunState::Running;
        info!("memory database for shard {} started", self.shard_id);
        Ok(())
    }

    async fn stop(&self) -> Result<(), DatabaseError> {
        *self.state.write() = RunState::Stopped;
        let dropped = self.sessions.len();
        self.sessions.clear();
        info!(
            "memory database for shard {} stopped ({} open sessions dropped)",
            self.shard_id, dropped
        );
        Ok(())
    }

    fn connect(&self) -> ConnectionId {
        loop {
            let conn_id = ConnectionId::new();
            if let dashmap::mapref::entry::Entry::Vacant(entry) = self.sessions.entry(conn_id) {
                entry.insert(Staged::new());
                return conn_id;
            }
        }
    }

    fn disconnect(&self, conn_id: &ConnectionId) {
        if let Some((_, staged)) = self.sessions.remove(conn_id) {
            if !staged.is_empty() {
                debug!("[{}] discarded {} uncommitted changes", conn_id, staged.len());
            }
        }
    }

    fn methods() -> MethodTable<Self> {
        MethodTable::new()
            .register("find", |db: Arc<Self>, conn, args: Args| async move {
                let collection: String = args.required(0, "collection")?;
                let id: String = args.required(1, "id")?;
                db.find(&conn, &collection, &id)
            })
            .register("findByIndex", |db: Arc<Self>, conn, args: Args| async move {
                let collection: String = args.required(0, "collection")?;
                let field: String = args.required(1, "field")?;
                let value: Value = args.required(2, "value")?;
                db.find_by_index(&conn, &collection, &field, &value)
                    .map(Value::Array)
            })
            .register("insert", |db: Arc<Self>, conn, args: Args| async move {
                let collection: String = args.required(0, "collection")?;
                let id: String = args.required(1, "id")?;
                let doc: Value = args.required(2, "doc")?;
                db.insert(&conn, &collection, &id, doc).map(|_| Value::Null)
            })
            .register("update", |db: Arc<Self>, conn, args: Args| async move {
                let collection: String = args.required(0, "collection")?;
                let id: String = args.required(1, "id")?;
                let fields: Value = args.required(2, "fields")?;
                db.update(&conn, &collection, &id, fields).map(|_| Value::Null)
            })
            .register("remove", |db: Arc<Self>, conn, args: Args| async move {
                let collection: String = args.required(0, "collection")?;
                let id: String = args.required(1, "id")?;
                db.remove(&conn, &collection, &id).map(|_| Value::Null)
            })
            .register("commit", |db: Arc<Self>, conn, _args: Args| async move {
                db.commit(&conn).map(Value::from)
            })
            .register("rollback", |db: Arc<Self>, conn, _args: Args| async move {
                db.rollback(&conn).map(Value::from)
            })
            .register("info", |db: Arc<Self>, conn, _args: Args| async move { db.info(&conn) })
    }
}
