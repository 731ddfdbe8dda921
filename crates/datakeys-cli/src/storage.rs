use std::path::Path;

use crate::config::Config;
use color_eyre::Result;
use datakeys_storage::{BackendOptions, SqliteBackend, SqliteDataKeyStore};
use tracing::{debug, info_span};

/// Open the data key store described by the config.
pub fn store_from_config(config: &Config) -> Result<SqliteDataKeyStore> {
    let path = config.resolve_database_path()?;
    debug!(?path, "opening data key store");
    open_store(&path, config)
}

fn open_store(path: &Path, config: &Config) -> Result<SqliteDataKeyStore> {
    let backend = SqliteBackend::open(
        path,
        BackendOptions {
            busy_timeout: config.busy_timeout(),
        },
    )?;
    let span = info_span!("data_key_store", db = %path.display());
    Ok(SqliteDataKeyStore::with_span(backend, span))
}

/// Helper for tests to construct a store in a temp dir with default settings.
#[cfg(test)]
pub fn test_store(root: &Path) -> SqliteDataKeyStore {
    open_store(&root.join("data_keys.db"), &Config::default()).expect("open test store")
}
