//! Durable versioned state store for p2p sessions.
//!
//! Session state is kept as [`PersistedState`] records: an opaque payload, a
//! store-assigned version and a metadata map that can be searched with
//! [`MetadataFilter`]s. Every mutation is checked against the caller's view
//! of the version (optimistic concurrency); conflicting keys are reported
//! back per key instead of failing the whole batch.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;

/// State store errors
#[derive(Error, Debug)]
pub enum StateError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Data corruption detected
    #[error("Data corruption: {0}")]
    Corruption(String),
    /// Invalid operation
    #[error("Invalid operation: {0}")]
    Invalid(String),
    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Searchable metadata attached to a state
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata(BTreeMap<String, Value>);

impl Metadata {
    /// Create empty metadata
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Builder-style insert
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    /// Insert or replace a value
    pub fn insert(&mut self, key: &str, value: impl Into<Value>) {
        self.0.insert(key.to_string(), value.into());
    }

    /// Raw value
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// String value
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    /// Unsigned integer value
    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.0.get(key).and_then(Value::as_u64)
    }

    /// Boolean value
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.0.get(key).and_then(Value::as_bool)
    }

    /// Whether `filter` matches this metadata
    pub fn matches(&self, filter: &MetadataFilter) -> bool {
        self.0.get(&filter.key) == Some(&filter.value)
    }
}

/// Equality filter on one metadata key
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetadataFilter {
    /// Metadata key
    pub key: String,
    /// Required value
    pub value: Value,
}

impl MetadataFilter {
    /// Create an equality filter
    pub fn equals(key: &str, value: impl Into<Value>) -> Self {
        Self {
            key: key.to_string(),
            value: value.into(),
        }
    }
}

/// A versioned record in the store
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    /// Record key
    pub key: String,
    /// Opaque payload
    pub value: Vec<u8>,
    /// Version, 0 on create and +1 per update
    pub version: u32,
    /// Searchable metadata
    pub metadata: Metadata,
}

impl PersistedState {
    /// New record at version 0
    pub fn new(key: impl Into<String>, value: Vec<u8>, metadata: Metadata) -> Self {
        Self {
            key: key.into(),
            value,
            version: 0,
            metadata,
        }
    }
}

/// Versioned key-value store contract
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Fetch the states stored under `keys`; missing keys are absent from the result
    async fn get(&self, keys: &[String]) -> Result<HashMap<String, PersistedState>, StateError>;

    /// Fetch every state whose metadata matches at least one filter
    async fn find_by_metadata_matching_any(
        &self,
        filters: &[MetadataFilter],
    ) -> Result<HashMap<String, PersistedState>, StateError>;

    /// Create new states; returns the keys that already existed
    async fn create(&self, states: Vec<PersistedState>) -> Result<HashSet<String>, StateError>;

    /// Update states whose version matches the stored one; returns failed
    /// keys with the currently stored state (if any)
    async fn update(
        &self,
        states: Vec<PersistedState>,
    ) -> Result<HashMap<String, Option<PersistedState>>, StateError>;

    /// Delete states whose version matches the stored one; returns failed
    /// keys with the currently stored state (if any)
    async fn delete(
        &self,
        states: Vec<PersistedState>,
    ) -> Result<HashMap<String, Option<PersistedState>>, StateError>;
}

/// Store backend configuration
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum StoreMode {
    /// In-memory store (dev/tests only)
    #[default]
    InMemory,
    /// Append-only file store
    File {
        /// Data directory path
        data_dir: String,
        /// Fsync frequency (1 = every write, N = every N writes)
        fsync_every: u32,
    },
}

// Re-export backend implementations
pub use backend::file::{FileStateStore, FileStoreConfig};
pub use backend::mem::MemoryStateStore;

/// Open the store described by `mode`
pub async fn open_store(mode: StoreMode) -> Result<Arc<dyn StateStore>, StateError> {
    match mode {
        StoreMode::InMemory => Ok(Arc::new(MemoryStateStore::new())),
        StoreMode::File {
            data_dir,
            fsync_every,
        } => {
            let config = FileStoreConfig {
                data_dir: data_dir.into(),
                fsync_every,
                ..FileStoreConfig::default()
            };
            Ok(Arc::new(FileStateStore::open(config).await?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_filter() {
        let metadata = Metadata::new()
            .with("status", "SessionReady")
            .with("serial", 3u64);

        assert!(metadata.matches(&MetadataFilter::equals("status", "SessionReady")));
        assert!(!metadata.matches(&MetadataFilter::equals("status", "SentInitiatorHello")));
        assert!(!metadata.matches(&MetadataFilter::equals("missing", 1u64)));
        assert_eq!(metadata.get_u64("serial"), Some(3));
    }

    #[tokio::test]
    async fn test_open_in_memory() {
        let store = open_store(StoreMode::InMemory).await.unwrap();
        let failed = store
            .create(vec![PersistedState::new("k", vec![1], Metadata::new())])
            .await
            .unwrap();
        assert!(failed.is_empty());
        assert_eq!(store.get(&["k".to_string()]).await.unwrap().len(), 1);
    }
}
