use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;

use crate::model::{validate_name, DataKey};

/// Errors produced by data key store implementations.
///
/// Backend error types never cross this boundary; they are flattened into `reason`.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DataKeyStoreError {
    /// No active key exists under the requested name.
    #[error("data key not found: {name}")]
    NotFound { name: String },
    /// Precondition failed before any I/O was attempted.
    #[error("invalid argument: {reason}")]
    InvalidArgument { reason: String },
    /// A key with the same name already exists.
    #[error("data key already exists: {name}")]
    Conflict { name: String },
    /// Underlying storage failure.
    #[error("storage failure in {op}{}: {reason}", name_suffix(.name))]
    Storage {
        op: &'static str,
        name: Option<String>,
        reason: String,
    },
    /// The operation was interrupted before the backend finished.
    #[error("{op} cancelled")]
    Cancelled { op: &'static str },
}

impl DataKeyStoreError {
    pub fn storage(op: &'static str, name: Option<&str>, reason: impl ToString) -> Self {
        Self::Storage {
            op,
            name: name.map(str::to_string),
            reason: reason.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

fn name_suffix(name: &Option<String>) -> String {
    name.as_ref()
        .map(|n| format!(" (name: {n})"))
        .unwrap_or_default()
}

/// Durable, name-addressed storage of data keys.
///
/// `get_by_name` only sees active keys; `get_all` and `delete` ignore the flag.
/// There is no update: rotate by deleting and recreating.
#[async_trait]
pub trait DataKeyStore: Send + Sync {
    /// Caller-managed transaction that `create` can join.
    type Scope: Send;

    /// Fetch the active key stored under `name`.
    async fn get_by_name(&self, name: &str) -> Result<DataKey, DataKeyStoreError>;

    /// Every stored key, active or not, in backend order.
    async fn get_all(&self) -> Result<Vec<DataKey>, DataKeyStoreError>;

    /// Insert an active key, stamping `created` and `updated` with the same instant.
    ///
    /// With `Some(scope)` the insert joins the caller's transaction; the store never
    /// commits or rolls it back.
    async fn create(
        &self,
        key: DataKey,
        scope: Option<&mut Self::Scope>,
    ) -> Result<(), DataKeyStoreError>;

    /// Remove every key named `name` (idempotent).
    async fn delete(&self, name: &str) -> Result<(), DataKeyStoreError>;
}

/// In-memory store for tests and consumers that need a double.
/// Applies the same validation and filtering rules as the SQLite backend.
#[derive(Debug, Default, Clone)]
pub struct InMemoryDataKeyStore {
    inner: Arc<Mutex<BTreeMap<String, DataKey>>>,
}

/// Buffered inserts applied atomically by [`InMemoryDataKeyStore::commit`].
#[derive(Debug, Default)]
pub struct MemoryScope {
    pending: Vec<DataKey>,
}

impl InMemoryDataKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self) -> MemoryScope {
        MemoryScope::default()
    }

    /// Apply every buffered insert, or none if any name is already taken.
    pub fn commit(&self, scope: MemoryScope) -> Result<(), DataKeyStoreError> {
        let mut map = self.lock("commit")?;
        if let Some(taken) = scope.pending.iter().find(|k| map.contains_key(&k.name)) {
            return Err(DataKeyStoreError::Conflict {
                name: taken.name.clone(),
            });
        }
        for key in scope.pending {
            map.insert(key.name.clone(), key);
        }
        Ok(())
    }

    fn lock(
        &self,
        op: &'static str,
    ) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, DataKey>>, DataKeyStoreError> {
        self.inner
            .lock()
            .map_err(|err| DataKeyStoreError::storage(op, None, format!("lock poisoned: {err}")))
    }
}

#[async_trait]
impl DataKeyStore for InMemoryDataKeyStore {
    type Scope = MemoryScope;

    async fn get_by_name(&self, name: &str) -> Result<DataKey, DataKeyStoreError> {
        validate_name(name)?;
        let map = self.lock("get_by_name")?;
        map.get(name)
            .filter(|k| k.active)
            .cloned()
            .ok_or_else(|| DataKeyStoreError::NotFound {
                name: name.to_string(),
            })
    }

    async fn get_all(&self) -> Result<Vec<DataKey>, DataKeyStoreError> {
        let map = self.lock("get_all")?;
        Ok(map.values().cloned().collect())
    }

    async fn create(
        &self,
        key: DataKey,
        scope: Option<&mut MemoryScope>,
    ) -> Result<(), DataKeyStoreError> {
        let key = key.prepare_for_create(Utc::now())?;
        let mut map = self.lock("create")?;
        let pending_clash = scope
            .as_ref()
            .is_some_and(|s| s.pending.iter().any(|k| k.name == key.name));
        if pending_clash || map.contains_key(&key.name) {
            return Err(DataKeyStoreError::Conflict { name: key.name });
        }

        match scope {
            Some(scope) => scope.pending.push(key),
            None => {
                map.insert(key.name.clone(), key);
            }
        }
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), DataKeyStoreError> {
        validate_name(name)?;
        let mut map = self.lock("delete")?;
        map.remove(name);
        Ok(())
    }
}
