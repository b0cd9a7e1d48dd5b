//! Named operation registry
//!
//! Clients address operations by name. A [`MethodTable`] maps each name to a
//! handler that receives the shared database, the caller's connection id and
//! the remaining positional arguments.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::{ConnectionId, DatabaseError};

/// Boxed result of a named operation
pub type MethodFuture = BoxFuture<'static, Result<Value, DatabaseError>>;

/// Type-erased operation handler
pub type MethodHandler<D> = Arc<dyn Fn(Arc<D>, ConnectionId, Args) -> MethodFuture + Send + Sync>;

/// Registry of operations exposed by a database
pub struct MethodTable<D> {
    handlers: BTreeMap<String, MethodHandler<D>>,
}

impl<D: Send + Sync + 'static> MethodTable<D> {
    pub fn new() -> Self {
        Self {
            handlers: BTreeMap::new(),
        }
    }

    /// Register an operation under `name`, replacing any previous handler
    pub fn register<F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Arc<D>, ConnectionId, Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, DatabaseError>> + Send + 'static,
    {
        let handler: MethodHandler<D> =
            Arc::new(move |db, conn_id, args| handler(db, conn_id, args).boxed());
        self.handlers.insert(name.into(), handler);
        self
    }

    /// Look up a handler by operation name
    pub fn get(&self, name: &str) -> Option<MethodHandler<D>> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered operation names, sorted
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl<D: Send + Sync + 'static> Default for MethodTable<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D> fmt::Debug for MethodTable<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.handlers.keys()).finish()
    }
}

/// Positional arguments of a request, minus the connection id
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Args(Vec<Value>);

impl Args {
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Deserialize the required argument at `index`
    pub fn required<T: DeserializeOwned>(
        &self,
        index: usize,
        name: &str,
    ) -> Result<T, DatabaseError> {
        let value = self.0.get(index).ok_or_else(|| {
            DatabaseError::InvalidArgument(format!("missing argument #{} ({})", index, name))
        })?;
        serde_json::from_value(value.clone()).map_err(|e| {
            DatabaseError::InvalidArgument(format!("argument #{} ({}): {}", index, name, e))
        })
    }

    /// Deserialize the argument at `index`, treating absence and `null` as `None`
    pub fn optional<T: DeserializeOwned>(
        &self,
        index: usize,
        name: &str,
    ) -> Result<Option<T>, DatabaseError> {
        match self.0.get(index) {
            None | Some(Value::Null) => Ok(None),
            Some(_) => self.required(index, name).map(Some),
        }
    }

    pub fn into_inner(self) -> Vec<Value> {
        self.0
    }
}

impl From<Vec<Value>> for Args {
    fn from(values: Vec<Value>) -> Self {
        Self(values)
    }
}
