//! Expiry scheduling for persisted session state.
//!
//! Expiry is enforced twice: every read filters out states whose `expiry` has
//! passed, and every valid state read or written gets a deletion timer so a
//! state nobody reads again is still purged. A key has at most one timer,
//! tagged with the `(version, expiry)` it was scheduled for.

use crate::clock::Clock;
use crate::config::SessionManagerConfig;
use crate::state::metadata_keys;
use dashmap::DashMap;
use p2p_state::{Metadata, PersistedState, StateStore};
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// An in-memory cache that must forget a key once its state is deleted
pub trait CacheInvalidation: Send + Sync {
    /// Drop anything cached for `key`
    fn invalidate(&self, key: &str);
}

/// Timer state of one key
#[derive(Debug)]
enum TimerState {
    NoTimer,
    Scheduled {
        version: u32,
        expiry: u64,
        handle: JoinHandle<()>,
    },
}

struct SchedulerInner {
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    config: watch::Receiver<SessionManagerConfig>,
    timers: DashMap<String, TimerState>,
    caches: RwLock<Vec<Arc<dyn CacheInvalidation>>>,
    scheduled: AtomicU64,
    cancelled: AtomicU64,
}

impl SchedulerInner {
    fn invalidate(&self, key: &str) {
        let caches = self.caches.read().unwrap_or_else(PoisonError::into_inner);
        for cache in caches.iter() {
            cache.invalidate(key);
        }
    }

    async fn delete_expired(&self, key: String, version: u32, expiry: u64) {
        let target = PersistedState {
            key: key.clone(),
            value: Vec::new(),
            version,
            metadata: Metadata::new(),
        };
        match self.store.delete(vec![target]).await {
            Ok(failed) if failed.is_empty() => {
                debug!("Deleted expired state {} v{}", key, version);
            }
            Ok(_) => {
                debug!("Expired state {} v{} already replaced or gone", key, version);
            }
            Err(e) => {
                warn!("Failed to delete expired state {} v{}: {}", key, version, e);
            }
        }

        self.timers.remove_if(&key, |_, timer| {
            matches!(timer, TimerState::Scheduled { version: v, expiry: e, .. } if *v == version && *e == expiry)
        });
        self.invalidate(&key);
    }
}

/// Validates states against their expiry and schedules their deletion
#[derive(Clone)]
pub struct SessionExpiryScheduler {
    inner: Arc<SchedulerInner>,
}

impl SessionExpiryScheduler {
    /// Create a scheduler deleting through `store`
    pub fn new(
        store: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
        config: watch::Receiver<SessionManagerConfig>,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                store,
                clock,
                config,
                timers: DashMap::new(),
                caches: RwLock::new(Vec::new()),
                scheduled: AtomicU64::new(0),
                cancelled: AtomicU64::new(0),
            }),
        }
    }

    /// Register a cache to be invalidated on deletion
    pub fn register_cache(&self, cache: Arc<dyn CacheInvalidation>) {
        self.inner
            .caches
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(cache);
    }

    /// Return `state` if it has not expired, making sure exactly one deletion
    /// timer exists for it. With `before_update` the timer targets the version
    /// the pending write will produce.
    pub fn validate_state_and_schedule_expiry(
        &self,
        state: PersistedState,
        before_update: bool,
    ) -> Option<PersistedState> {
        let expiry = match state.metadata.get_u64(metadata_keys::EXPIRY) {
            Some(expiry) => expiry,
            None => {
                warn!("State {} has no expiry, treating as expired", state.key);
                return None;
            }
        };

        let now = self.inner.clock.now_millis();
        if expiry <= now {
            debug!("State {} expired at {} (now {})", state.key, expiry, now);
            return None;
        }

        let version = if before_update {
            state.version + 1
        } else {
            state.version
        };
        self.schedule(&state.key, version, expiry, now);
        Some(state)
    }

    /// Validate every state, returning the ones that have not expired
    pub fn validate_states_and_schedule_expiry(
        &self,
        states: HashMap<String, PersistedState>,
    ) -> HashMap<String, PersistedState> {
        states
            .into_iter()
            .filter_map(|(key, state)| {
                self.validate_state_and_schedule_expiry(state, false)
                    .map(|s| (key, s))
            })
            .collect()
    }

    fn schedule(&self, key: &str, version: u32, expiry: u64, now: u64) {
        let mut timer = self
            .inner
            .timers
            .entry(key.to_string())
            .or_insert(TimerState::NoTimer);

        if let TimerState::Scheduled {
            version: v,
            expiry: e,
            ..
        } = &*timer
        {
            if *v == version && *e == expiry {
                return;
            }
        }

        if let TimerState::Scheduled { handle, .. } =
            std::mem::replace(&mut *timer, TimerState::NoTimer)
        {
            handle.abort();
            self.inner.cancelled.fetch_add(1, Ordering::Relaxed);
        }

        let jitter = self.inner.config.borrow().expiry_jitter.as_millis() as u64;
        let jitter = if jitter == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter)
        };
        let delay = Duration::from_millis(expiry.saturating_sub(now) + jitter);

        let inner = self.inner.clone();
        let key = key.to_string();
        debug!(
            "Scheduling deletion of {} v{} in {:?}",
            key, version, delay
        );
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.delete_expired(key, version, expiry).await;
        });

        *timer = TimerState::Scheduled {
            version,
            expiry,
            handle,
        };
        self.inner.scheduled.fetch_add(1, Ordering::Relaxed);
    }

    /// Cancel the timer of `key`, if any
    pub fn forget(&self, key: &str) {
        if let Some((_, TimerState::Scheduled { handle, .. })) = self.inner.timers.remove(key) {
            handle.abort();
            self.inner.cancelled.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Invalidate `key` in every registered cache
    pub fn invalidate(&self, key: &str) {
        self.inner.invalidate(key);
    }

    /// Timers scheduled since creation
    pub fn scheduled_count(&self) -> u64 {
        self.inner.scheduled.load(Ordering::Relaxed)
    }

    /// Timers cancelled since creation
    pub fn cancelled_count(&self) -> u64 {
        self.inner.cancelled.load(Ordering::Relaxed)
    }

    /// Keys with an outstanding timer
    pub fn pending_timers(&self) -> usize {
        self.inner
            .timers
            .iter()
            .filter(|t| matches!(t.value(), TimerState::Scheduled { .. }))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use p2p_state::MemoryStateStore;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingCache {
        invalidated: Mutex<Vec<String>>,
    }

    impl CacheInvalidation for RecordingCache {
        fn invalidate(&self, key: &str) {
            self.invalidated.lock().unwrap().push(key.to_string());
        }
    }

    fn state(key: &str, expiry: u64) -> PersistedState {
        PersistedState::new(
            key,
            vec![1],
            Metadata::new().with(metadata_keys::EXPIRY, expiry),
        )
    }

    fn scheduler(
        store: Arc<MemoryStateStore>,
        clock: Arc<ManualClock>,
    ) -> (SessionExpiryScheduler, watch::Sender<SessionManagerConfig>) {
        let config = SessionManagerConfig {
            expiry_jitter: Duration::ZERO,
            ..SessionManagerConfig::default()
        };
        let (tx, rx) = watch::channel(config);
        (SessionExpiryScheduler::new(store, clock, rx), tx)
    }

    #[tokio::test]
    async fn test_expired_state_is_dropped_without_timer() {
        let store = Arc::new(MemoryStateStore::new());
        let clock = Arc::new(ManualClock::new(10_000));
        let (scheduler, _tx) = scheduler(store, clock);

        assert!(scheduler
            .validate_state_and_schedule_expiry(state("a", 10_000), false)
            .is_none());
        assert!(scheduler
            .validate_state_and_schedule_expiry(state("b", 5_000), false)
            .is_none());
        assert_eq!(scheduler.scheduled_count(), 0);
        assert_eq!(scheduler.pending_timers(), 0);
    }

    #[tokio::test]
    async fn test_timer_scheduled_once_per_version_and_expiry() {
        let store = Arc::new(MemoryStateStore::new());
        let clock = Arc::new(ManualClock::new(10_000));
        let (scheduler, _tx) = scheduler(store, clock);

        assert!(scheduler
            .validate_state_and_schedule_expiry(state("a", 20_000), false)
            .is_some());
        assert_eq!(scheduler.scheduled_count(), 1);

        // Same version and expiry: no new timer
        scheduler.validate_state_and_schedule_expiry(state("a", 20_000), false);
        assert_eq!(scheduler.scheduled_count(), 1);
        assert_eq!(scheduler.cancelled_count(), 0);

        // New expiry: prior timer cancelled, one new timer
        scheduler.validate_state_and_schedule_expiry(state("a", 30_000), false);
        assert_eq!(scheduler.scheduled_count(), 2);
        assert_eq!(scheduler.cancelled_count(), 1);

        // Anticipated update targets the next version
        scheduler.validate_state_and_schedule_expiry(state("a", 30_000), true);
        assert_eq!(scheduler.scheduled_count(), 3);
        assert_eq!(scheduler.pending_timers(), 1);
    }

    #[tokio::test]
    async fn test_validate_states_filters_expired() {
        let store = Arc::new(MemoryStateStore::new());
        let clock = Arc::new(ManualClock::new(10_000));
        let (scheduler, _tx) = scheduler(store, clock);

        let mut states = HashMap::new();
        states.insert("live".to_string(), state("live", 20_000));
        states.insert("dead".to_string(), state("dead", 9_000));

        let valid = scheduler.validate_states_and_schedule_expiry(states);
        assert_eq!(valid.len(), 1);
        assert!(valid.contains_key("live"));
        assert_eq!(scheduler.pending_timers(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_deletes_and_invalidates() {
        let store = Arc::new(MemoryStateStore::new());
        let clock = Arc::new(ManualClock::new(10_000));
        let (scheduler, _tx) = scheduler(store.clone(), clock);
        let cache = Arc::new(RecordingCache::default());
        scheduler.register_cache(cache.clone());

        store.create(vec![state("a", 11_000)]).await.unwrap();
        // A key whose store delete fails is still invalidated
        scheduler.validate_state_and_schedule_expiry(state("a", 11_000), false);
        scheduler.validate_state_and_schedule_expiry(state("ghost", 11_000), false);

        tokio::time::sleep(Duration::from_secs(2)).await;
        tokio::task::yield_now().await;

        assert!(store.is_empty());
        let mut invalidated = cache.invalidated.lock().unwrap().clone();
        invalidated.sort();
        assert_eq!(invalidated, vec!["a".to_string(), "ghost".to_string()]);
        assert_eq!(scheduler.pending_timers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forget_cancels_timer() {
        let store = Arc::new(MemoryStateStore::new());
        let clock = Arc::new(ManualClock::new(10_000));
        let (scheduler, _tx) = scheduler(store.clone(), clock);

        store.create(vec![state("a", 11_000)]).await.unwrap();
        scheduler.validate_state_and_schedule_expiry(state("a", 11_000), false);
        scheduler.forget("a");
        assert_eq!(scheduler.cancelled_count(), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_entries_released() {
        let store = Arc::new(MemoryStateStore::new());
        let clock = Arc::new(ManualClock::new(10_000));
        let (scheduler, _tx) = scheduler(store, clock);

        for n in 0..20 {
            let key = format!("k-{}", n);
            scheduler.validate_state_and_schedule_expiry(state(&key, 11_000), false);
            if n % 2 == 0 {
                scheduler.forget(&key);
            }
        }
        assert_eq!(scheduler.inner.timers.len(), 10);

        tokio::time::sleep(Duration::from_secs(2)).await;
        tokio::task::yield_now().await;
        assert!(scheduler.inner.timers.is_empty());
    }
}
