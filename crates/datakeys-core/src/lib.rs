//! Core abstractions for datakeys: the data-key model and the store contract.
//! Backends live in `datakeys-storage`; this crate stays free of I/O.

pub mod model;
pub mod store;

pub use model::DataKey;
pub use store::{DataKeyStore, DataKeyStoreError, InMemoryDataKeyStore, MemoryScope};
