//! Cache of negotiated inbound sessions.

use crate::expiry::CacheInvalidation;
use crate::session::{Session, SessionDirection};
use crate::state::parse_state_key;
use dashmap::DashMap;
use p2p_wire::SessionId;
use std::sync::Arc;
use tracing::debug;

/// Inbound sessions by id, emptied by the expiry scheduler
#[derive(Default)]
pub struct SessionCache {
    sessions: DashMap<SessionId, Arc<Session>>,
}

impl SessionCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached session
    pub fn get(&self, session_id: &SessionId) -> Option<Arc<Session>> {
        self.sessions.get(session_id).map(|s| s.clone())
    }

    /// Cache `session`, replacing any previous entry for its id
    pub fn insert(&self, session: Arc<Session>) {
        self.sessions.insert(session.id().clone(), session);
    }

    /// Drop the session, if cached
    pub fn remove(&self, session_id: &SessionId) -> Option<Arc<Session>> {
        self.sessions.remove(session_id).map(|(_, s)| s)
    }

    /// Number of cached sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl CacheInvalidation for SessionCache {
    fn invalidate(&self, key: &str) {
        if let Some((SessionDirection::Inbound, session_id)) = parse_state_key(key) {
            if self.remove(&session_id).is_some() {
                debug!("Evicted inbound session {}", session_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionSnapshot;
    use crate::state::state_key;
    use p2p_wire::{HoldingIdentity, ProtocolMode};

    fn inbound(id: &SessionId) -> Arc<Session> {
        Arc::new(Session::from_snapshot(SessionSnapshot {
            session_id: id.clone(),
            direction: SessionDirection::Inbound,
            our_identity: HoldingIdentity::new("O=Bob", "group-1"),
            peer_identity: HoldingIdentity::new("O=Alice", "group-1"),
            mode: ProtocolMode::AuthenticatedEncryption,
            send_key: [3u8; 32],
            receive_key: [4u8; 32],
        }))
    }

    #[test]
    fn test_invalidation_only_touches_inbound_keys() {
        let cache = SessionCache::new();
        let id = SessionId::random();
        cache.insert(inbound(&id));

        cache.invalidate(&state_key(SessionDirection::Outbound, &id));
        assert!(cache.get(&id).is_some());

        cache.invalidate(&state_key(SessionDirection::Inbound, &id));
        assert!(cache.get(&id).is_none());
        assert!(cache.is_empty());
    }
}
