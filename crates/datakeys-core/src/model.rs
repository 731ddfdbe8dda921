use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::DataKeyStoreError;

/// A provider-wrapped data key as persisted in the `data_keys` table.
///
/// `encrypted_data` is opaque to the store: only the provider named in
/// `provider` knows how to unwrap it.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataKey {
    pub name: String,
    pub active: bool,
    pub provider: String,
    pub encrypted_data: Vec<u8>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl DataKey {
    /// Build an active key. Timestamps are placeholders until the store stamps them on create.
    pub fn new(
        name: impl Into<String>,
        provider: impl Into<String>,
        encrypted_data: impl Into<Vec<u8>>,
    ) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            active: true,
            provider: provider.into(),
            encrypted_data: encrypted_data.into(),
            created: now,
            updated: now,
        }
    }

    /// Validate the key for insertion and stamp both timestamps with `now`.
    ///
    /// Shared by every backend so direct and transactional creates behave the same.
    pub fn prepare_for_create(mut self, now: DateTime<Utc>) -> Result<Self, DataKeyStoreError> {
        validate_name(&self.name)?;
        if !self.active {
            return Err(DataKeyStoreError::InvalidArgument {
                reason: format!("cannot insert deactivated data key {:?}", self.name),
            });
        }
        self.created = now;
        self.updated = now;
        Ok(self)
    }
}

// Key material stays out of logs and panic messages.
impl fmt::Debug for DataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataKey")
            .field("name", &self.name)
            .field("active", &self.active)
            .field("provider", &self.provider)
            .field(
                "encrypted_data",
                &format_args!("<{} bytes>", self.encrypted_data.len()),
            )
            .field("created", &self.created)
            .field("updated", &self.updated)
            .finish()
    }
}

/// Reject empty names before any I/O happens.
pub fn validate_name(name: &str) -> Result<(), DataKeyStoreError> {
    if name.is_empty() {
        return Err(DataKeyStoreError::InvalidArgument {
            reason: "data key name must not be empty".to_string(),
        });
    }
    Ok(())
}
