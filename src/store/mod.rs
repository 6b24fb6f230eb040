//! Durable key-value persistence for network and endpoint records
//!
//! Keys are `/` separated and namespaced by record kind:
//! - `networks/<network id>` holds a [`NetworkConfig`](crate::types::NetworkConfig)
//! - `endpoints/<network id>/<endpoint id>` holds an [`Endpoint`](crate::types::Endpoint)

mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub const NETWORKS_PREFIX: &str = "networks/";
pub const ENDPOINTS_PREFIX: &str = "endpoints/";

/// Errors raised by a store backend
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to encode record {key}: {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("corrupt record {key}: {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid key {0:?}")]
    InvalidKey(String),

    #[error("{0}")]
    Unavailable(String),
}

/// A key and its stored value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvPair {
    pub key: String,
    pub value: Vec<u8>,
}

/// Key-value store backing the registries
///
/// Implementations must be safe to call from several request threads at once.
pub trait Store: Send + Sync {
    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Delete a key; deleting an absent key succeeds
    fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Every pair whose key starts with `prefix`, ordered by key
    fn list(&self, prefix: &str) -> Result<Vec<KvPair>, StoreError>;
}

pub fn network_key(network_id: &str) -> String {
    format!("{}{}", NETWORKS_PREFIX, network_id)
}

pub fn endpoints_prefix(network_id: &str) -> String {
    format!("{}{}/", ENDPOINTS_PREFIX, network_id)
}

pub fn endpoint_key(network_id: &str, endpoint_id: &str) -> String {
    format!("{}{}", endpoints_prefix(network_id), endpoint_id)
}

/// Whether `id` can be used as one component of a key
///
/// Names starting with `.` are reserved for the file store's temporary files.
pub(crate) fn valid_id(id: &str) -> bool {
    !id.is_empty() && !id.contains('/') && !id.starts_with('.')
}

/// Reject keys that could escape their namespace or collide with temporary files
pub(crate) fn check_key(key: &str) -> Result<(), StoreError> {
    let bad = key.is_empty() || !key.split('/').all(valid_id);
    if bad {
        return Err(StoreError::InvalidKey(key.to_string()));
    }
    Ok(())
}

/// Serialize and write a record
pub fn put_record<T: Serialize>(
    store: &dyn Store,
    key: &str,
    record: &T,
) -> Result<(), StoreError> {
    let value = serde_json::to_vec(record).map_err(|source| StoreError::Encode {
        key: key.to_string(),
        source,
    })?;
    store.put(key, &value)
}

/// Decode a listed record
pub fn decode_record<T: DeserializeOwned>(pair: &KvPair) -> Result<T, StoreError> {
    serde_json::from_slice(&pair.value).map_err(|source| StoreError::Decode {
        key: pair.key.clone(),
        source,
    })
}
