//! Deadlines for outbound negotiations.
//!
//! Every negotiation installed in the pool gets one timer. Completing or
//! abandoning the negotiation disarms it; a timer that fires reports the
//! session id on the channel returned by [`HandshakeTimeouts::new`] so the
//! slot can be renegotiated without waiting for the next send.

use dashmap::DashMap;
use p2p_wire::SessionId;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

struct TimeoutsInner {
    tasks: DashMap<SessionId, (u64, JoinHandle<()>)>,
    generation: AtomicU64,
    expired_tx: mpsc::UnboundedSender<SessionId>,
}

/// Handshake deadline timers
#[derive(Clone)]
pub struct HandshakeTimeouts {
    inner: Arc<TimeoutsInner>,
}

impl HandshakeTimeouts {
    /// Create the timers and the receiver of expired negotiations
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SessionId>) {
        let (expired_tx, expired_rx) = mpsc::unbounded_channel();
        let timeouts = Self {
            inner: Arc::new(TimeoutsInner {
                tasks: DashMap::new(),
                generation: AtomicU64::new(0),
                expired_tx,
            }),
        };
        (timeouts, expired_rx)
    }

    /// Start the deadline of `session_id`, replacing any earlier one
    pub fn arm(&self, session_id: &SessionId, timeout: Duration) {
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
        let inner = self.inner.clone();
        let id = session_id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let fired = inner
                .tasks
                .remove_if(&id, |_, (g, _)| *g == generation)
                .is_some();
            if fired {
                info!("Negotiation {} not finished after {:?}", id, timeout);
                if inner.expired_tx.send(id).is_err() {
                    debug!("Handshake timeout receiver dropped");
                }
            }
        });

        if let Some((_, handle)) = self.inner.tasks.insert(session_id.clone(), (generation, handle)) {
            handle.abort();
        }
    }

    /// The negotiation of `session_id` finished or was abandoned
    pub fn disarm(&self, session_id: &SessionId) {
        if let Some((_, (_, handle))) = self.inner.tasks.remove(session_id) {
            handle.abort();
            debug!("Disarmed handshake timer for {}", session_id);
        }
    }

    /// Negotiations with a running deadline
    pub fn armed(&self) -> usize {
        self.inner.tasks.len()
    }
}
