use async_trait::async_trait;
use chrono::Utc;
use datakeys_core::{
    model::validate_name,
    store::{DataKeyStore, DataKeyStoreError},
    DataKey,
};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, error, info_span, instrument, warn, Span};

use crate::{
    backend::{SqliteBackend, TxScope},
    error::BackendError,
};

const SELECT_ACTIVE_BY_NAME: &str = "SELECT name, active, provider, encrypted_data, created, updated
     FROM data_keys WHERE name = ?1 AND active = 1";
const SELECT_ALL: &str =
    "SELECT name, active, provider, encrypted_data, created, updated FROM data_keys";
const INSERT: &str = "INSERT INTO data_keys
        (name, active, provider, encrypted_data, created, updated)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6)";
const DELETE_BY_NAME: &str = "DELETE FROM data_keys WHERE name = ?1";

/// `DataKeyStore` over the `data_keys` table of a [`SqliteBackend`].
///
/// Stateless apart from the backend handle and the span its events attach to, so
/// one instance can be shared across tasks.
#[derive(Debug, Clone)]
pub struct SqliteDataKeyStore {
    backend: SqliteBackend,
    span: Span,
}

impl SqliteDataKeyStore {
    pub fn new(backend: SqliteBackend) -> Self {
        Self::with_span(backend, info_span!("data_key_store"))
    }

    /// Attach the store's events to a caller-provided span.
    pub fn with_span(backend: SqliteBackend, span: Span) -> Self {
        Self { backend, span }
    }

    pub fn backend(&self) -> &SqliteBackend {
        &self.backend
    }

    fn fail(&self, op: &'static str, name: Option<&str>, err: BackendError) -> DataKeyStoreError {
        let err = err.into_store_error(op, name);
        match &err {
            DataKeyStoreError::Conflict { .. } => debug!(op, ?name, "data key already exists"),
            DataKeyStoreError::Cancelled { .. } => warn!(op, ?name, "data key operation cancelled"),
            _ => error!(op, ?name, error = %err, "data key operation failed"),
        }
        err
    }
}

#[async_trait]
impl DataKeyStore for SqliteDataKeyStore {
    type Scope = TxScope;

    #[instrument(parent = &self.span, skip_all, fields(name = %name))]
    async fn get_by_name(&self, name: &str) -> Result<DataKey, DataKeyStoreError> {
        validate_name(name)?;
        let lookup = name.to_string();
        let found = self
            .backend
            .with_session(move |conn| {
                conn.query_row(SELECT_ACTIVE_BY_NAME, params![lookup], row_to_data_key)
                    .optional()
            })
            .await
            .map_err(|err| self.fail("get_by_name", Some(name), err))?;

        found.ok_or_else(|| DataKeyStoreError::NotFound {
            name: name.to_string(),
        })
    }

    #[instrument(parent = &self.span, skip_all)]
    async fn get_all(&self) -> Result<Vec<DataKey>, DataKeyStoreError> {
        self.backend
            .with_session(|conn| {
                let mut stmt = conn.prepare(SELECT_ALL)?;
                let rows = stmt.query_map([], row_to_data_key)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()
            })
            .await
            .map_err(|err| self.fail("get_all", None, err))
    }

    #[instrument(parent = &self.span, skip_all, fields(name = %key.name, scoped = scope.is_some()))]
    async fn create(
        &self,
        key: DataKey,
        scope: Option<&mut TxScope>,
    ) -> Result<(), DataKeyStoreError> {
        let key = key.prepare_for_create(Utc::now())?;
        let name = key.name.clone();
        let insert = move |conn: &Connection| insert_data_key(conn, &key);

        let result = match scope {
            Some(scope) => scope.run(insert).await,
            None => self.backend.with_session(insert).await,
        };
        result.map_err(|err| self.fail("create", Some(&name), err))?;

        debug!("data key created");
        Ok(())
    }

    #[instrument(parent = &self.span, skip_all, fields(name = %name))]
    async fn delete(&self, name: &str) -> Result<(), DataKeyStoreError> {
        validate_name(name)?;
        let target = name.to_string();
        let removed = self
            .backend
            .with_session(move |conn| conn.execute(DELETE_BY_NAME, params![target]))
            .await
            .map_err(|err| self.fail("delete", Some(name), err))?;

        debug!(removed, "data key delete finished");
        Ok(())
    }
}

fn insert_data_key(conn: &Connection, key: &DataKey) -> rusqlite::Result<()> {
    conn.execute(
        INSERT,
        params![
            key.name,
            key.active,
            key.provider,
            key.encrypted_data,
            key.created,
            key.updated,
        ],
    )?;
    Ok(())
}

fn row_to_data_key(row: &rusqlite::Row<'_>) -> rusqlite::Result<DataKey> {
    Ok(DataKey {
        name: row.get(0)?,
        active: row.get(1)?,
        provider: row.get(2)?,
        encrypted_data: row.get(3)?,
        created: row.get(4)?,
        updated: row.get(5)?,
    })
}
