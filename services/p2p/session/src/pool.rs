//! Outbound session pool.
//!
//! Each counterparty pair owns a fixed arena of slots, each empty, pending a
//! handshake, or holding an active session. Slots are addressed by index so
//! round-robin selection is a cursor increment; a session-id index gives O(1)
//! lookup across all pairs. Reads take the per-pair read lock, mutations the
//! write lock.

use crate::expiry::CacheInvalidation;
use crate::handshake::HandshakeInitiator;
use crate::session::{Session, SessionDirection};
use crate::state::parse_state_key;
use crate::types::SessionCounterparties;
use dashmap::DashMap;
use p2p_wire::SessionId;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// One position of a pair's arena
#[derive(Clone, Debug)]
pub enum PoolSlot {
    /// Nothing negotiated or negotiating
    Empty,
    /// Negotiation in flight
    Pending {
        /// Handshake engine
        initiator: HandshakeInitiator,
        /// When the negotiation was installed
        started_at: Instant,
    },
    /// Negotiated session
    Active(Arc<Session>),
}

impl PoolSlot {
    /// Pending slot started now
    pub fn pending(initiator: HandshakeInitiator) -> Self {
        PoolSlot::Pending {
            initiator,
            started_at: Instant::now(),
        }
    }

    fn session_id(&self) -> Option<&SessionId> {
        match self {
            PoolSlot::Empty => None,
            PoolSlot::Pending { initiator, .. } => Some(initiator.session_id()),
            PoolSlot::Active(session) => Some(session.id()),
        }
    }
}

/// Result of [`OutboundSessionPool::get_session`]
#[derive(Clone, Debug)]
pub enum PoolLookup {
    /// Negotiation in flight
    Pending(HandshakeInitiator),
    /// Negotiated session
    Active(Arc<Session>),
    /// Not in the pool
    Unknown,
}

/// Result of [`OutboundSessionPool::get_next_session`]
#[derive(Clone, Debug)]
pub enum NextSession {
    /// Nothing negotiated or negotiating for the pair
    NoSessionsPending,
    /// Only negotiations in flight
    SessionPending,
    /// Session picked by round robin
    SessionActive(Arc<Session>),
}

struct PoolEntry {
    slots: RwLock<Vec<PoolSlot>>,
    cursor: AtomicUsize,
}

impl PoolEntry {
    fn new(capacity: usize) -> Self {
        Self {
            slots: RwLock::new(vec![PoolSlot::Empty; capacity]),
            cursor: AtomicUsize::new(0),
        }
    }
}

/// Bounded set of outbound sessions per counterparty pair
pub struct OutboundSessionPool {
    capacity: AtomicUsize,
    entries: DashMap<SessionCounterparties, Arc<PoolEntry>>,
    index: DashMap<SessionId, SessionCounterparties>,
}

impl OutboundSessionPool {
    /// Create a pool with `capacity` slots per pair
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: AtomicUsize::new(capacity.max(1)),
            entries: DashMap::new(),
            index: DashMap::new(),
        }
    }

    /// Capacity used for pairs seen from now on
    pub fn set_capacity(&self, capacity: usize) {
        self.capacity.store(capacity.max(1), Ordering::Relaxed);
    }

    fn entry(&self, counterparties: &SessionCounterparties) -> Arc<PoolEntry> {
        self.entries
            .entry(counterparties.clone())
            .or_insert_with(|| Arc::new(PoolEntry::new(self.capacity.load(Ordering::Relaxed))))
            .clone()
    }

    fn existing(&self, counterparties: &SessionCounterparties) -> Option<Arc<PoolEntry>> {
        self.entries.get(counterparties).map(|e| e.clone())
    }

    /// Install pending handshakes into empty slots. Active and pending slots
    /// are never replaced and an id already in the pool is skipped. Returns
    /// the ids actually installed.
    pub fn add_pending_sessions(
        &self,
        counterparties: &SessionCounterparties,
        initiators: Vec<HandshakeInitiator>,
    ) -> Vec<SessionId> {
        self.restore_sessions(
            counterparties,
            initiators.into_iter().map(PoolSlot::pending).collect(),
        )
    }

    /// Fill empty slots with pending or active entries rebuilt from persisted
    /// state. Returns the ids installed.
    pub fn restore_sessions(
        &self,
        counterparties: &SessionCounterparties,
        candidates: Vec<PoolSlot>,
    ) -> Vec<SessionId> {
        let entry = self.entry(counterparties);
        let mut slots = entry.slots.write().unwrap_or_else(PoisonError::into_inner);
        let mut installed = Vec::new();
        let mut candidates = candidates.into_iter();

        for slot in slots.iter_mut().filter(|s| matches!(s, PoolSlot::Empty)) {
            let candidate = loop {
                match candidates.next() {
                    Some(c) => {
                        let Some(id) = c.session_id() else { continue };
                        if self.index.contains_key(id) || installed.contains(id) {
                            continue;
                        }
                        break Some(c);
                    }
                    None => break None,
                }
            };
            let Some(candidate) = candidate else { break };
            if let Some(id) = candidate.session_id() {
                self.index.insert(id.clone(), counterparties.clone());
                installed.push(id.clone());
            }
            *slot = candidate;
        }

        if !installed.is_empty() {
            debug!(
                "Pool {}: installed {} session(s)",
                counterparties,
                installed.len()
            );
        }
        installed
    }

    /// Look up a session by id
    pub fn get_session(&self, session_id: &SessionId) -> PoolLookup {
        let Some(counterparties) = self.index.get(session_id).map(|c| c.clone()) else {
            return PoolLookup::Unknown;
        };
        let Some(entry) = self.existing(&counterparties) else {
            return PoolLookup::Unknown;
        };
        let slots = entry.slots.read().unwrap_or_else(PoisonError::into_inner);
        slots
            .iter()
            .find_map(|slot| match slot {
                PoolSlot::Pending { initiator, .. } if initiator.session_id() == session_id => {
                    Some(PoolLookup::Pending(initiator.clone()))
                }
                PoolSlot::Active(session) if session.id() == session_id => {
                    Some(PoolLookup::Active(session.clone()))
                }
                _ => None,
            })
            .unwrap_or(PoolLookup::Unknown)
    }

    /// Counterparties a pooled session belongs to
    pub fn counterparties_for(&self, session_id: &SessionId) -> Option<SessionCounterparties> {
        self.index.get(session_id).map(|c| c.clone())
    }

    /// Pick an active session by round robin, skipping non-active slots
    pub fn get_next_session(&self, counterparties: &SessionCounterparties) -> NextSession {
        let Some(entry) = self.existing(counterparties) else {
            return NextSession::NoSessionsPending;
        };
        let slots = entry.slots.read().unwrap_or_else(PoisonError::into_inner);
        if slots.is_empty() {
            return NextSession::NoSessionsPending;
        }

        let start = entry.cursor.fetch_add(1, Ordering::Relaxed);
        let len = slots.len();
        for offset in 0..len {
            if let PoolSlot::Active(session) = &slots[start.wrapping_add(offset) % len] {
                return NextSession::SessionActive(session.clone());
            }
        }

        if slots.iter().any(|s| matches!(s, PoolSlot::Pending { .. })) {
            NextSession::SessionPending
        } else {
            NextSession::NoSessionsPending
        }
    }

    /// Promote the pending slot with the same id to active; no-op (false) if
    /// there is none
    pub fn add_session(&self, session: Arc<Session>) -> bool {
        let Some(counterparties) = self.counterparties_for(session.id()) else {
            debug!("No pending slot for session {}", session.id());
            return false;
        };
        let Some(entry) = self.existing(&counterparties) else {
            return false;
        };
        let mut slots = entry.slots.write().unwrap_or_else(PoisonError::into_inner);
        for slot in slots.iter_mut() {
            if let PoolSlot::Pending { initiator, .. } = slot {
                if initiator.session_id() == session.id() {
                    info!("Session {} to {} is active", session.id(), counterparties);
                    *slot = PoolSlot::Active(session);
                    return true;
                }
            }
        }
        false
    }

    /// Store the progressed engine of a pending slot
    pub fn replace_pending(&self, initiator: HandshakeInitiator) -> bool {
        let Some(counterparties) = self.counterparties_for(initiator.session_id()) else {
            return false;
        };
        let Some(entry) = self.existing(&counterparties) else {
            return false;
        };
        let mut slots = entry.slots.write().unwrap_or_else(PoisonError::into_inner);
        for slot in slots.iter_mut() {
            if let PoolSlot::Pending { initiator: current, .. } = slot {
                if current.session_id() == initiator.session_id() {
                    *current = initiator;
                    return true;
                }
            }
        }
        false
    }

    /// Replace the slot holding `old` (pending or active) with a fresh
    /// negotiation. Returns false if `old` is not pooled.
    pub fn timeout_session(&self, old: &SessionId, replacement: HandshakeInitiator) -> bool {
        let Some(counterparties) = self.counterparties_for(old) else {
            return false;
        };
        let Some(entry) = self.existing(&counterparties) else {
            return false;
        };
        let mut slots = entry.slots.write().unwrap_or_else(PoisonError::into_inner);
        let Some(slot) = slots.iter_mut().find(|s| s.session_id() == Some(old)) else {
            return false;
        };

        info!(
            "Replacing session {} with {} for {}",
            old,
            replacement.session_id(),
            counterparties
        );
        self.index.remove(old);
        self.index
            .insert(replacement.session_id().clone(), counterparties.clone());
        *slot = PoolSlot::pending(replacement);
        true
    }

    /// Empty the slot holding `session_id`
    pub fn remove_session(&self, session_id: &SessionId) -> bool {
        let Some((_, counterparties)) = self.index.remove(session_id) else {
            return false;
        };
        let Some(entry) = self.existing(&counterparties) else {
            return false;
        };
        let mut slots = entry.slots.write().unwrap_or_else(PoisonError::into_inner);
        match slots.iter_mut().find(|s| s.session_id() == Some(session_id)) {
            Some(slot) => {
                debug!("Removed session {} from pool {}", session_id, counterparties);
                *slot = PoolSlot::Empty;
                true
            }
            None => false,
        }
    }

    /// Pending negotiations older than `timeout`
    pub fn stale_pending(
        &self,
        counterparties: &SessionCounterparties,
        timeout: Duration,
    ) -> Vec<SessionId> {
        let Some(entry) = self.existing(counterparties) else {
            return Vec::new();
        };
        let slots = entry.slots.read().unwrap_or_else(PoisonError::into_inner);
        slots
            .iter()
            .filter_map(|slot| match slot {
                PoolSlot::Pending {
                    initiator,
                    started_at,
                } if started_at.elapsed() >= timeout => Some(initiator.session_id().clone()),
                _ => None,
            })
            .collect()
    }

    /// Number of empty slots of a pair
    pub fn free_slots(&self, counterparties: &SessionCounterparties) -> usize {
        match self.existing(counterparties) {
            Some(entry) => entry
                .slots
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .filter(|s| matches!(s, PoolSlot::Empty))
                .count(),
            None => self.capacity.load(Ordering::Relaxed),
        }
    }
}

impl CacheInvalidation for OutboundSessionPool {
    fn invalidate(&self, key: &str) {
        if let Some((SessionDirection::Outbound, session_id)) = parse_state_key(key) {
            self.remove_session(&session_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionSnapshot;
    use p2p_wire::{HoldingIdentity, ProtocolMode};
    use std::collections::HashMap;

    fn counterparties(peer: &str) -> SessionCounterparties {
        SessionCounterparties::new(
            HoldingIdentity::new("O=Alice", "group-1"),
            HoldingIdentity::new(peer, "group-1"),
        )
    }

    fn initiator(c: &SessionCounterparties) -> HandshakeInitiator {
        HandshakeInitiator::new(
            SessionId::random(),
            c.our_id.clone(),
            c.counterparty_id.clone(),
            vec![ProtocolMode::AuthenticatedEncryption],
        )
    }

    fn session(id: &SessionId) -> Arc<Session> {
        Arc::new(Session::from_snapshot(SessionSnapshot {
            session_id: id.clone(),
            direction: SessionDirection::Outbound,
            our_identity: HoldingIdentity::new("O=A", "G"),
            peer_identity: HoldingIdentity::new("O=B", "G"),
            mode: ProtocolMode::AuthenticatedEncryption,
            send_key: [1u8; 32],
            receive_key: [2u8; 32],
        }))
    }

    fn fill(pool: &OutboundSessionPool, c: &SessionCounterparties, n: usize) -> Vec<SessionId> {
        let initiators = (0..n).map(|_| initiator(c)).collect();
        pool.add_pending_sessions(c, initiators)
    }

    #[test]
    fn test_round_robin_is_exact() {
        let pool = OutboundSessionPool::new(4);
        let c = counterparties("O=Bob");
        let ids = fill(&pool, &c, 4);
        assert_eq!(ids.len(), 4);
        assert!(matches!(pool.get_next_session(&c), NextSession::SessionPending));

        for id in &ids {
            assert!(pool.add_session(session(id)));
        }

        let mut counts: HashMap<SessionId, usize> = HashMap::new();
        for _ in 0..8 {
            match pool.get_next_session(&c) {
                NextSession::SessionActive(s) => *counts.entry(s.id().clone()).or_default() += 1,
                other => panic!("expected active session, got {:?}", other),
            }
        }
        assert_eq!(counts.len(), 4);
        assert!(counts.values().all(|&n| n == 2));
    }

    #[test]
    fn test_partial_activation_only_returns_active() {
        let pool = OutboundSessionPool::new(4);
        let c = counterparties("O=Bob");
        let ids = fill(&pool, &c, 4);
        pool.add_session(session(&ids[1]));
        pool.add_session(session(&ids[3]));

        for _ in 0..20 {
            match pool.get_next_session(&c) {
                NextSession::SessionActive(s) => {
                    assert!(s.id() == &ids[1] || s.id() == &ids[3]);
                }
                other => panic!("expected active session, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_cursor_wraps_at_usize_max() {
        let pool = OutboundSessionPool::new(3);
        let c = counterparties("O=Bob");
        let ids = fill(&pool, &c, 3);
        pool.add_session(session(&ids[2]));

        pool.existing(&c)
            .unwrap()
            .cursor
            .store(usize::MAX - 1, Ordering::Relaxed);
        for _ in 0..4 {
            match pool.get_next_session(&c) {
                NextSession::SessionActive(s) => assert_eq!(s.id(), &ids[2]),
                other => panic!("expected active session, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_add_pending_is_bounded_and_idempotent() {
        let pool = OutboundSessionPool::new(2);
        let c = counterparties("O=Bob");
        let first = initiator(&c);
        let installed = pool.add_pending_sessions(&c, vec![first.clone(), first.clone()]);
        assert_eq!(installed.len(), 1);
        assert_eq!(pool.free_slots(&c), 1);

        // Re-adding the same id installs nothing
        assert!(pool.add_pending_sessions(&c, vec![first]).is_empty());

        // Only one slot left
        let installed = pool.add_pending_sessions(&c, vec![initiator(&c), initiator(&c)]);
        assert_eq!(installed.len(), 1);
        assert_eq!(pool.free_slots(&c), 0);
    }

    #[test]
    fn test_add_session_without_pending_is_noop() {
        let pool = OutboundSessionPool::new(2);
        let c = counterparties("O=Bob");
        fill(&pool, &c, 1);
        assert!(!pool.add_session(session(&SessionId::random())));
        assert!(matches!(pool.get_next_session(&c), NextSession::SessionPending));
    }

    #[test]
    fn test_timeout_and_restore_rotation() {
        let pool = OutboundSessionPool::new(2);
        let c = counterparties("O=Bob");
        let ids = fill(&pool, &c, 2);
        for id in &ids {
            pool.add_session(session(id));
        }

        let replacement = initiator(&c);
        let new_id = replacement.session_id().clone();
        assert!(pool.timeout_session(&ids[0], replacement));
        assert!(matches!(pool.get_session(&ids[0]), PoolLookup::Unknown));
        assert!(matches!(pool.get_session(&new_id), PoolLookup::Pending(_)));

        // Old session is out of rotation immediately
        for _ in 0..6 {
            match pool.get_next_session(&c) {
                NextSession::SessionActive(s) => assert_eq!(s.id(), &ids[1]),
                other => panic!("expected active session, got {:?}", other),
            }
        }

        // Completing the replacement restores full rotation
        assert!(pool.add_session(session(&new_id)));
        let mut seen = std::collections::HashSet::new();
        for _ in 0..4 {
            if let NextSession::SessionActive(s) = pool.get_next_session(&c) {
                seen.insert(s.id().clone());
            }
        }
        assert_eq!(seen.len(), 2);
        assert!(seen.contains(&new_id));
    }

    #[test]
    fn test_remove_and_invalidate() {
        let pool = OutboundSessionPool::new(2);
        let c = counterparties("O=Bob");
        let ids = fill(&pool, &c, 2);
        pool.add_session(session(&ids[0]));

        pool.invalidate(&format!("outbound:{}", ids[0]));
        assert!(matches!(pool.get_session(&ids[0]), PoolLookup::Unknown));
        assert!(matches!(pool.get_next_session(&c), NextSession::SessionPending));

        // Inbound keys are ignored
        pool.invalidate(&format!("inbound:{}", ids[1]));
        assert!(matches!(pool.get_session(&ids[1]), PoolLookup::Pending(_)));

        assert!(pool.remove_session(&ids[1]));
        assert!(matches!(
            pool.get_next_session(&c),
            NextSession::NoSessionsPending
        ));
        assert_eq!(pool.free_slots(&c), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_pending() {
        let pool = OutboundSessionPool::new(2);
        let c = counterparties("O=Bob");
        let ids = fill(&pool, &c, 1);
        assert!(pool.stale_pending(&c, Duration::from_secs(10)).is_empty());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(pool.stale_pending(&c, Duration::from_secs(10)), ids);
    }

    #[test]
    fn test_pairs_are_isolated() {
        let pool = OutboundSessionPool::new(2);
        let bob = counterparties("O=Bob");
        let carol = counterparties("O=Carol");
        let ids = fill(&pool, &bob, 1);
        pool.add_session(session(&ids[0]));

        assert!(matches!(
            pool.get_next_session(&carol),
            NextSession::NoSessionsPending
        ));
        assert_eq!(pool.counterparties_for(&ids[0]), Some(bob));
    }
}
