//! Liveness tracking for sessions with unacknowledged traffic.
//!
//! The first unacknowledged send on a session arms a timer; an ack or the
//! removal of the session disarms it. A timer that fires reports the session
//! id on the channel returned by [`DeadSessionMonitor::new`].

use crate::error::MonitorError;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use p2p_wire::SessionId;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

struct MonitorInner {
    timeout: watch::Sender<Option<Duration>>,
    tasks: DashMap<SessionId, (u64, JoinHandle<()>)>,
    generation: AtomicU64,
    dead_tx: mpsc::UnboundedSender<SessionId>,
    scheduled: AtomicU64,
}

/// Dead session monitor
#[derive(Clone)]
pub struct DeadSessionMonitor {
    inner: Arc<MonitorInner>,
}

impl DeadSessionMonitor {
    /// Create an unconfigured monitor and the receiver of dead session ids
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SessionId>) {
        let (dead_tx, dead_rx) = mpsc::unbounded_channel();
        let (timeout, _) = watch::channel(None);
        let monitor = Self {
            inner: Arc::new(MonitorInner {
                timeout,
                tasks: DashMap::new(),
                generation: AtomicU64::new(0),
                dead_tx,
                scheduled: AtomicU64::new(0),
            }),
        };
        (monitor, dead_rx)
    }

    /// Set the silence timeout. Timers already armed keep their deadline.
    pub fn configure(&self, timeout: Duration) {
        self.inner.timeout.send_replace(Some(timeout));
        debug!("Dead session timeout set to {:?}", timeout);
    }

    fn timeout(&self) -> Result<Duration, MonitorError> {
        (*self.inner.timeout.borrow()).ok_or(MonitorError::NotConfigured)
    }

    /// A message went out on `session_id`; arms a timer unless one is armed
    pub fn message_sent(&self, session_id: &SessionId) -> Result<(), MonitorError> {
        let timeout = self.timeout()?;

        match self.inner.tasks.entry(session_id.clone()) {
            Entry::Occupied(_) => Ok(()),
            Entry::Vacant(vacant) => {
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
                        warn!("Session {} unacknowledged for {:?}, treating as dead", id, timeout);
                        if inner.dead_tx.send(id).is_err() {
                            debug!("Dead session receiver dropped");
                        }
                    }
                });
                vacant.insert((generation, handle));
                self.inner.scheduled.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
        }
    }

    /// The peer acknowledged traffic on `session_id`
    pub fn ack_received(&self, session_id: &SessionId) -> Result<(), MonitorError> {
        self.timeout()?;
        self.cancel(session_id);
        Ok(())
    }

    /// `session_id` is gone; any armed timer is disarmed
    pub fn session_removed(&self, session_id: &SessionId) {
        self.cancel(session_id);
    }

    fn cancel(&self, session_id: &SessionId) {
        if let Some((_, (_, handle))) = self.inner.tasks.remove(session_id) {
            handle.abort();
            debug!("Disarmed dead session timer for {}", session_id);
        }
    }

    /// Sessions with an armed timer
    pub fn armed(&self) -> usize {
        self.inner.tasks.len()
    }

    /// Timers armed since creation
    pub fn scheduled_count(&self) -> u64 {
        self.inner.scheduled.load(Ordering::Relaxed)
    }
}
