//! SQLite-backed implementation of the data key store.
//! Every unit of work runs on its own connection on the blocking pool.

pub mod backend;
pub mod error;
pub mod sqlite_store;

pub use backend::{BackendOptions, SqliteBackend, TxScope};
pub use error::BackendError;
pub use sqlite_store::SqliteDataKeyStore;
