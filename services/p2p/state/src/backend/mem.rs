//! In-memory store backend for development and testing

use crate::{MetadataFilter, PersistedState, StateError, StateStore};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

/// In-memory versioned store
pub struct MemoryStateStore {
    /// key -> current state
    states: Arc<DashMap<String, PersistedState>>,
}

impl MemoryStateStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            states: Arc::new(DashMap::new()),
        }
    }

    /// Number of stored states
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

impl Default for MemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, keys: &[String]) -> Result<HashMap<String, PersistedState>, StateError> {
        Ok(keys
            .iter()
            .filter_map(|key| self.states.get(key).map(|s| (key.clone(), s.clone())))
            .collect())
    }

    async fn find_by_metadata_matching_any(
        &self,
        filters: &[MetadataFilter],
    ) -> Result<HashMap<String, PersistedState>, StateError> {
        Ok(self
            .states
            .iter()
            .filter(|entry| filters.iter().any(|f| entry.metadata.matches(f)))
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect())
    }

    async fn create(&self, states: Vec<PersistedState>) -> Result<HashSet<String>, StateError> {
        let mut failed = HashSet::new();
        for mut state in states {
            match self.states.entry(state.key.clone()) {
                Entry::Occupied(_) => {
                    debug!("Store create conflict key={}", state.key);
                    failed.insert(state.key);
                }
                Entry::Vacant(slot) => {
                    state.version = 0;
                    slot.insert(state);
                }
            }
        }
        Ok(failed)
    }

    async fn update(
        &self,
        states: Vec<PersistedState>,
    ) -> Result<HashMap<String, Option<PersistedState>>, StateError> {
        let mut failed = HashMap::new();
        for mut state in states {
            match self.states.entry(state.key.clone()) {
                Entry::Occupied(mut current) if current.get().version == state.version => {
                    state.version += 1;
                    current.insert(state);
                }
                Entry::Occupied(current) => {
                    debug!(
                        "Store update conflict key={} expected={} actual={}",
                        state.key,
                        state.version,
                        current.get().version
                    );
                    failed.insert(state.key, Some(current.get().clone()));
                }
                Entry::Vacant(_) => {
                    failed.insert(state.key, None);
                }
            }
        }
        Ok(failed)
    }

    async fn delete(
        &self,
        states: Vec<PersistedState>,
    ) -> Result<HashMap<String, Option<PersistedState>>, StateError> {
        let mut failed = HashMap::new();
        for state in states {
            match self.states.entry(state.key.clone()) {
                Entry::Occupied(current) if current.get().version == state.version => {
                    current.remove();
                }
                Entry::Occupied(current) => {
                    failed.insert(state.key, Some(current.get().clone()));
                }
                Entry::Vacant(_) => {
                    failed.insert(state.key, None);
                }
            }
        }
        Ok(failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Metadata;

    fn state(key: &str, status: &str) -> PersistedState {
        PersistedState::new(key, b"payload".to_vec(), Metadata::new().with("status", status))
    }

    #[tokio::test]
    async fn test_memory_store_versioning() {
        let store = MemoryStateStore::new();

        assert!(store.create(vec![state("a", "one")]).await.unwrap().is_empty());
        let failed = store.create(vec![state("a", "two")]).await.unwrap();
        assert!(failed.contains("a"));

        // Update at version 0 bumps to 1
        let mut current = store.get(&["a".to_string()]).await.unwrap()["a"].clone();
        current.metadata.insert("status", "two");
        assert!(store.update(vec![current.clone()]).await.unwrap().is_empty());

        // Stale version is rejected and the stored state handed back
        let failed = store.update(vec![current]).await.unwrap();
        let stored = failed["a"].clone().unwrap();
        assert_eq!(stored.version, 1);
        assert_eq!(stored.metadata.get_str("status"), Some("two"));

        // Updating a missing key fails with no current state
        let failed = store.update(vec![state("missing", "x")]).await.unwrap();
        assert_eq!(failed.get("missing"), Some(&None));
    }

    #[tokio::test]
    async fn test_memory_store_delete_and_find() {
        let store = MemoryStateStore::new();
        store
            .create(vec![state("a", "ready"), state("b", "hello"), state("c", "ready")])
            .await
            .unwrap();

        let found = store
            .find_by_metadata_matching_any(&[MetadataFilter::equals("status", "ready")])
            .await
            .unwrap();
        assert_eq!(found.len(), 2);
        assert!(found.contains_key("a") && found.contains_key("c"));

        // Wrong version is not deleted
        let mut stale = found["a"].clone();
        stale.version = 5;
        assert!(store.delete(vec![stale]).await.unwrap().contains_key("a"));

        assert!(store.delete(vec![found["a"].clone()]).await.unwrap().is_empty());
        assert_eq!(store.len(), 2);
    }
}
