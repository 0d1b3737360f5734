//! Single write path to the state store, with expiry filtering.

use crate::expiry::SessionExpiryScheduler;
use p2p_state::{MetadataFilter, PersistedState, StateError, StateStore};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// One write of an upsert batch
#[derive(Clone, Debug)]
pub enum UpsertAction {
    /// Create a new state
    Create(PersistedState),
    /// Update a state read at `version`
    Update(PersistedState),
}

impl UpsertAction {
    fn key(&self) -> &str {
        match self {
            UpsertAction::Create(s) | UpsertAction::Update(s) => &s.key,
        }
    }
}

/// Store facade: every read is validated against expiry, every write is
/// version checked
#[derive(Clone)]
pub struct StateStoreWrapper {
    store: Arc<dyn StateStore>,
    scheduler: SessionExpiryScheduler,
}

impl StateStoreWrapper {
    /// Wrap `store`
    pub fn new(store: Arc<dyn StateStore>, scheduler: SessionExpiryScheduler) -> Self {
        Self { store, scheduler }
    }

    /// Expiry scheduler shared with the caches
    pub fn scheduler(&self) -> &SessionExpiryScheduler {
        &self.scheduler
    }

    /// Fetch non-expired states
    pub async fn get(&self, keys: &[String]) -> Result<HashMap<String, PersistedState>, StateError> {
        let states = self.store.get(keys).await?;
        Ok(self.scheduler.validate_states_and_schedule_expiry(states))
    }

    /// Fetch non-expired states matching any filter
    pub async fn find_by_metadata_matching_any(
        &self,
        filters: &[MetadataFilter],
    ) -> Result<HashMap<String, PersistedState>, StateError> {
        let states = self.store.find_by_metadata_matching_any(filters).await?;
        Ok(self.scheduler.validate_states_and_schedule_expiry(states))
    }

    /// Apply creates and updates. Expired writes are skipped without touching
    /// the store. Returns, for every write the store rejected, the currently
    /// stored state (or none if absent or expired).
    pub async fn upsert(
        &self,
        actions: Vec<UpsertAction>,
    ) -> Result<HashMap<String, Option<PersistedState>>, StateError> {
        let mut creates = Vec::new();
        let mut updates = Vec::new();

        for action in actions {
            let key = action.key().to_string();
            match action {
                UpsertAction::Create(state) => {
                    match self.scheduler.validate_state_and_schedule_expiry(state, false) {
                        Some(state) => creates.push(state),
                        None => debug!("Skipping create of expired state {}", key),
                    }
                }
                UpsertAction::Update(state) => {
                    match self.scheduler.validate_state_and_schedule_expiry(state, true) {
                        Some(state) => updates.push(state),
                        None => debug!("Skipping update of expired state {}", key),
                    }
                }
            }
        }

        let mut failures = HashMap::new();

        if !creates.is_empty() {
            let existing: Vec<String> = self.store.create(creates).await?.into_iter().collect();
            if !existing.is_empty() {
                let current = self.get(&existing).await?;
                for key in existing {
                    let state = current.get(&key).cloned();
                    failures.insert(key, state);
                }
            }
        }

        if !updates.is_empty() {
            for (key, current) in self.store.update(updates).await? {
                let current = current
                    .and_then(|s| self.scheduler.validate_state_and_schedule_expiry(s, false));
                failures.insert(key, current);
            }
        }

        if !failures.is_empty() {
            debug!("Upsert conflicts on {} key(s)", failures.len());
        }
        Ok(failures)
    }

    /// Delete states at their versions, cancel their timers and invalidate
    /// every cache for their keys. Returns the store's per-key failures.
    pub async fn delete(
        &self,
        states: Vec<PersistedState>,
    ) -> Result<HashMap<String, Option<PersistedState>>, StateError> {
        let keys: Vec<String> = states.iter().map(|s| s.key.clone()).collect();
        let failed = self.store.delete(states).await?;
        for key in &keys {
            if !failed.contains_key(key) {
                self.scheduler.forget(key);
            }
            self.scheduler.invalidate(key);
        }
        Ok(failed)
    }
}
