//! Stateful session manager.
//!
//! Resolves sessions for outbound and inbound traffic, drives the four-message
//! handshake for both roles and keeps the outbound pool, the inbound cache and
//! the store in step. The store is the source of truth: every handshake step
//! is persisted before its reply goes out, and a write that loses a version
//! race replays whatever the winner stored.

use crate::cache::SessionCache;
use crate::clock::Clock;
use crate::config::SessionManagerConfig;
use crate::convertor::{
    RuntimeSession, RuntimeSessionState, SessionSecret, SessionStateSnapshot, StateConvertor,
};
use crate::dead_session::DeadSessionMonitor;
use crate::error::{HandshakeError, SessionManagerError};
use crate::expiry::SessionExpiryScheduler;
use crate::handshake::{HandshakeInitiator, HandshakeResponder};
use crate::handshake_timeout::HandshakeTimeouts;
use crate::keys::{IdentityKeyPair, KeyManagement, LocalIdentities};
use crate::membership::{
    validate_peer, BoundedRevocationChecker, MembershipDirectory, RevocationChecker,
};
use crate::pending::{MessageRecorder, PendingMessageQueue};
use crate::pool::{NextSession, OutboundSessionPool, PoolLookup, PoolSlot};
use crate::publisher::WirePublisher;
use crate::session::{Session, SessionDirection};
use crate::state::{
    counterparties_filter, parse_state_key, state_key, SessionMetadata, SessionStatus,
};
use crate::types::{MembershipStatusFilter, OutboundMessage, SessionCounterparties};
use crate::wrapper::{StateStoreWrapper, UpsertAction};
use async_trait::async_trait;
use p2p_state::{PersistedState, StateStore};
use p2p_wire::{
    AckMessage, DataMessage, HandshakeCiphertext, HoldingIdentity, InitiatorHelloMessage,
    LinkHeader, LinkMessage, ResponderHelloMessage, SessionId, WireRecord,
};
use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Collaborators of the session manager
pub struct SessionManagerDeps {
    /// Durable versioned store
    pub store: Arc<dyn StateStore>,
    /// Protects persisted secrets
    pub kms: Arc<dyn KeyManagement>,
    /// Membership lookups
    pub membership: Arc<dyn MembershipDirectory>,
    /// Revocation checks, bounded by the configured timeout
    pub revocation: Arc<dyn RevocationChecker>,
    /// Outbound records
    pub publisher: Arc<dyn WirePublisher>,
    /// Identities hosted on this node
    pub identities: Arc<LocalIdentities>,
    /// Time source for expiry
    pub clock: Arc<dyn Clock>,
}

/// Result of looking a session up by id
#[derive(Clone, Debug)]
pub enum SessionLookup {
    /// Negotiated session initiated by the peer
    Inbound(Arc<Session>),
    /// Negotiated session initiated by us
    Outbound(Arc<Session>),
    /// Negotiation in flight
    Pending,
    /// Neither cached nor stored
    Unknown,
}

/// How an outbound message can proceed
#[derive(Clone, Debug)]
pub enum OutboundResolution {
    /// Send on this session
    Established(Arc<Session>),
    /// Wait for a negotiation already in flight
    Pending,
    /// Negotiations were started; these hellos must be published
    NewSessionsNeeded(Vec<WireRecord>),
    /// No session can be negotiated
    CannotEstablish(String),
}

/// Outcome of [`StatefulSessionManager::send_messages`]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SendReport {
    /// Sealed and published
    pub published: usize,
    /// Waiting for a negotiation
    pub queued: usize,
    /// No session could be negotiated
    pub dropped: usize,
}

/// Application payload received on a session
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundPayload {
    /// Header of the carrying record
    pub header: LinkHeader,
    /// Application message id
    pub message_id: String,
    /// Decrypted or verified payload
    pub payload: Vec<u8>,
}

enum PersistOutcome {
    Written,
    Conflict(Option<PersistedState>),
}

struct ManagerInner {
    config: watch::Sender<SessionManagerConfig>,
    wrapper: StateStoreWrapper,
    convertor: StateConvertor,
    pool: Arc<OutboundSessionPool>,
    inbound: Arc<SessionCache>,
    pending: PendingMessageQueue,
    monitor: DeadSessionMonitor,
    dead_rx: Mutex<Option<mpsc::UnboundedReceiver<SessionId>>>,
    timeouts: HandshakeTimeouts,
    expired_rx: Mutex<Option<mpsc::UnboundedReceiver<SessionId>>>,
    membership: Arc<dyn MembershipDirectory>,
    revocation: Arc<dyn RevocationChecker>,
    publisher: Arc<dyn WirePublisher>,
    identities: Arc<LocalIdentities>,
    clock: Arc<dyn Clock>,
}

#[async_trait]
impl MessageRecorder for ManagerInner {
    async fn record_message(
        &self,
        message: &OutboundMessage,
        session: &Session,
    ) -> Result<WireRecord, SessionManagerError> {
        let data = session.seal(&message.message_id, &message.payload)?;
        self.monitor.message_sent(session.id())?;
        let header = LinkHeader {
            source: message.counterparties.our_id.clone(),
            destination: message.counterparties.counterparty_id.clone(),
            session_id: session.id().clone(),
        };
        Ok(WireRecord::new(header, LinkMessage::Data(data)))
    }
}

/// Entry point of the session layer
#[derive(Clone)]
pub struct StatefulSessionManager {
    inner: Arc<ManagerInner>,
}

impl StatefulSessionManager {
    /// Create a manager; call [`StatefulSessionManager::start`] to run the
    /// timer loop
    pub fn new(config: SessionManagerConfig, deps: SessionManagerDeps) -> Self {
        let (config_tx, config_rx) = watch::channel(config.clone());
        let scheduler =
            SessionExpiryScheduler::new(deps.store.clone(), deps.clock.clone(), config_rx);

        let pool = Arc::new(OutboundSessionPool::new(config.sessions_per_peer));
        let inbound = Arc::new(SessionCache::new());
        scheduler.register_cache(pool.clone());
        scheduler.register_cache(inbound.clone());

        let (monitor, dead_rx) = DeadSessionMonitor::new();
        monitor.configure(config.dead_session_timeout);
        let (timeouts, expired_rx) = HandshakeTimeouts::new();

        info!("Session manager configured: {}", config);

        Self {
            inner: Arc::new(ManagerInner {
                config: config_tx,
                wrapper: StateStoreWrapper::new(deps.store, scheduler),
                convertor: StateConvertor::new(deps.kms),
                pool,
                inbound,
                pending: PendingMessageQueue::new(),
                monitor,
                dead_rx: Mutex::new(Some(dead_rx)),
                timeouts,
                expired_rx: Mutex::new(Some(expired_rx)),
                membership: deps.membership,
                revocation: deps.revocation,
                publisher: deps.publisher,
                identities: deps.identities,
                clock: deps.clock,
            }),
        }
    }

    /// Spawn the loop renegotiating sessions reported dead and negotiations
    /// past their deadline. Returns `None` if it is already running.
    pub fn start(&self) -> Option<JoinHandle<()>> {
        let mut dead_rx = self
            .inner
            .dead_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()?;
        let mut expired_rx = self
            .inner
            .expired_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()?;

        let manager = self.clone();
        Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(session_id) = dead_rx.recv() => {
                        if let Err(e) = manager.dead_session(&session_id).await {
                            error!("Handling dead session {} failed: {}", session_id, e);
                        }
                    }
                    Some(session_id) = expired_rx.recv() => {
                        if let Err(e) = manager.handshake_expired(&session_id).await {
                            error!("Handling expired negotiation {} failed: {}", session_id, e);
                        }
                    }
                    else => break,
                }
            }
            debug!("Session timer loop stopped");
        }))
    }

    /// Current configuration snapshot
    pub fn config(&self) -> SessionManagerConfig {
        self.inner.config.borrow().clone()
    }

    /// Publish a new configuration; only work scheduled afterwards sees it
    pub fn reconfigure(&self, config: SessionManagerConfig) {
        self.inner.pool.set_capacity(config.sessions_per_peer);
        self.inner.monitor.configure(config.dead_session_timeout);
        info!("Session manager reconfigured: {}", config);
        self.inner.config.send_replace(config);
    }

    /// Outbound session pool
    pub fn pool(&self) -> &OutboundSessionPool {
        &self.inner.pool
    }

    /// Inbound session cache
    pub fn inbound_cache(&self) -> &SessionCache {
        &self.inner.inbound
    }

    /// Messages waiting for negotiation
    pub fn pending_queue(&self) -> &PendingMessageQueue {
        &self.inner.pending
    }

    /// Dead session monitor
    pub fn monitor(&self) -> &DeadSessionMonitor {
        &self.inner.monitor
    }

    /// Deadlines of negotiations in flight
    pub fn handshake_timeouts(&self) -> &HandshakeTimeouts {
        &self.inner.timeouts
    }

    /// Expiry scheduler shared by the caches
    pub fn scheduler(&self) -> &SessionExpiryScheduler {
        self.inner.wrapper.scheduler()
    }

    fn now(&self) -> u64 {
        self.inner.clock.now_millis()
    }

    fn revocation(&self) -> BoundedRevocationChecker {
        BoundedRevocationChecker::new(
            self.inner.revocation.clone(),
            self.config().revocation_check_timeout,
        )
    }

    fn local_keys(&self, identity: &HoldingIdentity) -> Result<Arc<IdentityKeyPair>, HandshakeError> {
        self.inner
            .identities
            .get(identity)
            .ok_or_else(|| HandshakeError::NotLocal(identity.to_string()))
    }

    async fn publish(&self, records: Vec<WireRecord>) -> Result<(), SessionManagerError> {
        if records.is_empty() {
            return Ok(());
        }
        self.inner.publisher.publish(records).await?;
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Option<RuntimeSessionState>, SessionManagerError> {
        let key = key.to_string();
        let mut states = self.inner.wrapper.get(std::slice::from_ref(&key)).await?;
        let Some(state) = states.remove(&key) else {
            return Ok(None);
        };
        Ok(self
            .inner
            .convertor
            .to_runtime_session(&state, &self.revocation())
            .await)
    }

    async fn persist(
        &self,
        metadata: &SessionMetadata,
        message: Option<WireRecord>,
        secret: SessionSecret,
        read_version: Option<u32>,
    ) -> Result<PersistOutcome, SessionManagerError> {
        let key = metadata.state_key();
        let snapshot = SessionStateSnapshot { message, secret };
        let value = self
            .inner
            .convertor
            .to_persisted_bytes(&snapshot, &self.config().key_alias)
            .await?;

        let mut state = PersistedState::new(key.clone(), value, metadata.to_metadata());
        let action = match read_version {
            Some(version) => {
                state.version = version;
                UpsertAction::Update(state)
            }
            None => UpsertAction::Create(state),
        };

        let mut failures = self.inner.wrapper.upsert(vec![action]).await?;
        Ok(match failures.remove(&key) {
            Some(current) => PersistOutcome::Conflict(current),
            None => PersistOutcome::Written,
        })
    }

    async fn delete_state(&self, key: &str) -> Result<(), SessionManagerError> {
        let key = key.to_string();
        let states = self.inner.wrapper.get(std::slice::from_ref(&key)).await?;
        if states.is_empty() {
            return Ok(());
        }
        let failed = self
            .inner
            .wrapper
            .delete(states.into_values().collect())
            .await?;
        if !failed.is_empty() {
            debug!("State {} changed before it could be deleted", key);
        }
        Ok(())
    }

    async fn replay(&self, state: &RuntimeSessionState) -> Result<(), SessionManagerError> {
        match &state.message {
            Some(record) => {
                debug!(
                    "Replaying {} for session {}",
                    record.message.kind(),
                    state.metadata.session_id
                );
                self.publish(vec![record.clone()]).await
            }
            None => Ok(()),
        }
    }

    async fn replay_current(
        &self,
        current: Option<PersistedState>,
    ) -> Result<(), SessionManagerError> {
        let Some(current) = current else {
            return Ok(());
        };
        match self
            .inner
            .convertor
            .to_runtime_session(&current, &self.revocation())
            .await
        {
            Some(runtime) => self.replay(&runtime).await,
            None => Ok(()),
        }
    }

    /// Resolve each item's session id to a cached, pooled or stored session
    pub async fn get_sessions_by_id<T, F>(
        &self,
        items: Vec<T>,
        id_fn: F,
    ) -> Result<Vec<(T, SessionLookup)>, SessionManagerError>
    where
        F: Fn(&T) -> SessionId,
    {
        let mut resolved = Vec::with_capacity(items.len());
        let mut missing = Vec::new();

        for item in items {
            let session_id = id_fn(&item);
            let found = match self.inner.inbound.get(&session_id) {
                Some(session) => Some(SessionLookup::Inbound(session)),
                None => match self.inner.pool.get_session(&session_id) {
                    PoolLookup::Active(session) => Some(SessionLookup::Outbound(session)),
                    PoolLookup::Pending(_) => Some(SessionLookup::Pending),
                    PoolLookup::Unknown => {
                        missing.push(state_key(SessionDirection::Inbound, &session_id));
                        missing.push(state_key(SessionDirection::Outbound, &session_id));
                        None
                    }
                },
            };
            resolved.push((item, session_id, found));
        }

        let mut loaded: HashMap<SessionId, SessionLookup> = HashMap::new();
        if !missing.is_empty() {
            let states = self.inner.wrapper.get(&missing).await?;
            let revocation = self.revocation();
            for state in states.values() {
                let Some(runtime) = self
                    .inner
                    .convertor
                    .to_runtime_session(state, &revocation)
                    .await
                else {
                    continue;
                };

                let direction = runtime.metadata.direction;
                let lookup = match runtime.session {
                    RuntimeSession::Established(session) => match direction {
                        SessionDirection::Inbound => {
                            self.inner.inbound.insert(session.clone());
                            SessionLookup::Inbound(session)
                        }
                        SessionDirection::Outbound => {
                            self.inner.pool.restore_sessions(
                                &runtime.metadata.counterparties(),
                                vec![PoolSlot::Active(session.clone())],
                            );
                            SessionLookup::Outbound(session)
                        }
                    },
                    RuntimeSession::Initiator(_) | RuntimeSession::Responder(_) => {
                        SessionLookup::Pending
                    }
                };

                // The inbound side wins when both directions share an id
                let session_id = runtime.metadata.session_id;
                if direction == SessionDirection::Inbound || !loaded.contains_key(&session_id) {
                    loaded.insert(session_id, lookup);
                }
            }
        }

        Ok(resolved
            .into_iter()
            .map(|(item, session_id, found)| {
                let lookup = found.unwrap_or_else(|| {
                    loaded
                        .get(&session_id)
                        .cloned()
                        .unwrap_or(SessionLookup::Unknown)
                });
                (item, lookup)
            })
            .collect())
    }

    /// Resolve how each item can be sent: pool first, then persisted states,
    /// then fresh negotiations
    pub async fn process_outbound_messages<T, F>(
        &self,
        items: Vec<T>,
        counterparties_fn: F,
    ) -> Result<Vec<(T, OutboundResolution)>, SessionManagerError>
    where
        F: Fn(&T) -> SessionCounterparties,
    {
        let mut resolved = Vec::with_capacity(items.len());
        for item in items {
            let counterparties = counterparties_fn(&item);
            let resolution = self.resolve_outbound(&counterparties).await?;
            resolved.push((item, resolution));
        }
        Ok(resolved)
    }

    async fn resolve_outbound(
        &self,
        counterparties: &SessionCounterparties,
    ) -> Result<OutboundResolution, SessionManagerError> {
        self.renegotiate_stale(counterparties).await?;

        match self.inner.pool.get_next_session(counterparties) {
            NextSession::SessionActive(session) => return Ok(OutboundResolution::Established(session)),
            NextSession::SessionPending => return Ok(OutboundResolution::Pending),
            NextSession::NoSessionsPending => {}
        }

        if self.restore_outbound(counterparties).await? > 0 {
            match self.inner.pool.get_next_session(counterparties) {
                NextSession::SessionActive(session) => {
                    return Ok(OutboundResolution::Established(session))
                }
                NextSession::SessionPending => return Ok(OutboundResolution::Pending),
                NextSession::NoSessionsPending => {}
            }
        }

        self.initiate(counterparties).await
    }

    async fn restore_outbound(
        &self,
        counterparties: &SessionCounterparties,
    ) -> Result<usize, SessionManagerError> {
        let states = self
            .inner
            .wrapper
            .find_by_metadata_matching_any(&[counterparties_filter(counterparties)])
            .await?;
        if states.is_empty() {
            return Ok(0);
        }

        let revocation = self.revocation();
        let mut candidates = Vec::new();
        for state in states.values() {
            if !matches!(
                parse_state_key(&state.key),
                Some((SessionDirection::Outbound, _))
            ) {
                continue;
            }
            if let Some(runtime) = self
                .inner
                .convertor
                .to_runtime_session(state, &revocation)
                .await
            {
                candidates.push(runtime);
            }
        }

        // Negotiated sessions first, newest first
        candidates.sort_by_key(|r| {
            (
                r.metadata.status != SessionStatus::SessionReady,
                Reverse(r.metadata.initiated_at),
            )
        });
        let slots = candidates
            .into_iter()
            .filter_map(|r| match r.session {
                RuntimeSession::Established(session) => Some(PoolSlot::Active(session)),
                RuntimeSession::Initiator(initiator) => Some(PoolSlot::pending(initiator)),
                RuntimeSession::Responder(_) => None,
            })
            .collect();

        let installed = self.inner.pool.restore_sessions(counterparties, slots);
        let handshake_timeout = self.config().handshake_timeout;
        for session_id in &installed {
            if matches!(self.inner.pool.get_session(session_id), PoolLookup::Pending(_)) {
                self.inner.timeouts.arm(session_id, handshake_timeout);
            }
        }
        let restored = installed.len();
        if restored > 0 {
            info!(
                "Restored {} session(s) for {} from the store",
                restored, counterparties
            );
        }
        Ok(restored)
    }

    fn new_initiator(&self, counterparties: &SessionCounterparties) -> HandshakeInitiator {
        HandshakeInitiator::new(
            SessionId::random(),
            counterparties.our_id.clone(),
            counterparties.counterparty_id.clone(),
            self.config().protocol_modes,
        )
    }

    async fn initiate(
        &self,
        counterparties: &SessionCounterparties,
    ) -> Result<OutboundResolution, SessionManagerError> {
        if self.inner.identities.get(&counterparties.our_id).is_none() {
            return Ok(OutboundResolution::CannotEstablish(format!(
                "{} is not hosted locally",
                counterparties.our_id
            )));
        }
        if self
            .inner
            .membership
            .lookup(
                &counterparties.our_id,
                &counterparties.counterparty_id,
                counterparties.status,
            )
            .is_none()
        {
            return Ok(OutboundResolution::CannotEstablish(format!(
                "{} is not a visible member",
                counterparties.counterparty_id
            )));
        }

        let initiators: Vec<HandshakeInitiator> = (0..self.inner.pool.free_slots(counterparties))
            .map(|_| self.new_initiator(counterparties))
            .collect();
        let installed = self
            .inner
            .pool
            .add_pending_sessions(counterparties, initiators.clone());
        if installed.is_empty() {
            return Ok(OutboundResolution::Pending);
        }

        let accepted = initiators
            .into_iter()
            .filter(|i| installed.contains(i.session_id()))
            .collect();
        let hellos = self.start_negotiations(counterparties, accepted).await?;
        if hellos.is_empty() {
            return Ok(OutboundResolution::CannotEstablish(
                "no negotiation could be persisted".to_string(),
            ));
        }

        info!(
            "Initiating {} session(s) with {}",
            hellos.len(),
            counterparties.counterparty_id
        );
        Ok(OutboundResolution::NewSessionsNeeded(hellos))
    }

    /// Persist the first step of each negotiation and build its hello.
    /// Negotiations that cannot be persisted leave the pool.
    async fn start_negotiations(
        &self,
        counterparties: &SessionCounterparties,
        initiators: Vec<HandshakeInitiator>,
    ) -> Result<Vec<WireRecord>, SessionManagerError> {
        let ttl = self.config().session_ttl;
        let now = self.now();
        let mut hellos = Vec::with_capacity(initiators.len());

        for initiator in initiators {
            let session_id = initiator.session_id().clone();
            let header = LinkHeader {
                source: counterparties.our_id.clone(),
                destination: counterparties.counterparty_id.clone(),
                session_id: session_id.clone(),
            };
            let hello = WireRecord::new(header, LinkMessage::InitiatorHello(initiator.hello_message()));
            let metadata = SessionMetadata::new(
                SessionDirection::Outbound,
                session_id.clone(),
                counterparties,
                SessionStatus::SentInitiatorHello,
                now,
                ttl,
            );

            match self
                .persist(&metadata, Some(hello.clone()), SessionSecret::Initiator(initiator), None)
                .await
            {
                Ok(PersistOutcome::Written) => {
                    self.inner
                        .timeouts
                        .arm(&session_id, self.config().handshake_timeout);
                    hellos.push(hello);
                }
                Ok(PersistOutcome::Conflict(_)) => {
                    warn!("Session id {} already stored, abandoning it", session_id);
                    self.inner.pool.remove_session(&session_id);
                }
                Err(e) => {
                    self.inner.pool.remove_session(&session_id);
                    return Err(e);
                }
            }
        }
        Ok(hellos)
    }

    /// Put a fresh negotiation in the slot of `old` and persist it
    async fn renegotiate(
        &self,
        old: &SessionId,
        counterparties: &SessionCounterparties,
    ) -> Result<Vec<WireRecord>, SessionManagerError> {
        let replacement = self.new_initiator(counterparties);
        let installed = self.inner.pool.timeout_session(old, replacement.clone())
            || !self
                .inner
                .pool
                .add_pending_sessions(counterparties, vec![replacement.clone()])
                .is_empty();
        self.inner.monitor.session_removed(old);
        self.inner.timeouts.disarm(old);

        if !installed {
            debug!("No free slot to renegotiate {} for {}", old, counterparties);
            return Ok(Vec::new());
        }
        self.start_negotiations(counterparties, vec![replacement]).await
    }

    async fn renegotiate_stale(
        &self,
        counterparties: &SessionCounterparties,
    ) -> Result<(), SessionManagerError> {
        let stale = self
            .inner
            .pool
            .stale_pending(counterparties, self.config().handshake_timeout);
        if stale.is_empty() {
            return Ok(());
        }

        let mut hellos = Vec::new();
        for old in stale {
            info!(
                "Negotiation {} with {} timed out",
                old, counterparties.counterparty_id
            );
            hellos.extend(self.renegotiate(&old, counterparties).await?);
            self.delete_state(&state_key(SessionDirection::Outbound, &old))
                .await?;
        }
        self.publish(hellos).await
    }

    async fn flush(
        &self,
        counterparties: &SessionCounterparties,
        session: &Session,
    ) -> Result<usize, SessionManagerError> {
        let flushed = self
            .inner
            .pending
            .session_negotiated(
                &*self.inner,
                self.inner.publisher.as_ref(),
                counterparties,
                session,
            )
            .await?;
        if flushed > 0 {
            debug!(
                "Flushed {} queued message(s) to {} on {}",
                flushed,
                counterparties.counterparty_id,
                session.id()
            );
        }
        Ok(flushed)
    }

    /// Seal and publish messages on established sessions, queue the rest
    /// behind their negotiations
    pub async fn send_messages(
        &self,
        messages: Vec<OutboundMessage>,
    ) -> Result<SendReport, SessionManagerError> {
        let resolved = self
            .process_outbound_messages(messages, |m| m.counterparties.clone())
            .await?;

        let mut report = SendReport::default();
        let mut records = Vec::new();

        for (message, resolution) in resolved {
            let counterparties = message.counterparties.clone();
            match resolution {
                OutboundResolution::Established(session) => {
                    match self
                        .inner
                        .pending
                        .queue_if_pending(&counterparties, message)
                        .await
                    {
                        Some(message) => {
                            records.push(self.inner.record_message(&message, &session).await?);
                            report.published += 1;
                        }
                        None => {
                            // Queued behind earlier messages of the pair
                            report.queued += 1;
                            self.publish(std::mem::take(&mut records)).await?;
                            self.flush(&counterparties, &session).await?;
                        }
                    }
                }
                OutboundResolution::Pending => {
                    self.inner
                        .pending
                        .queue_message(&counterparties, message)
                        .await;
                    report.queued += 1;

                    // The negotiation may have finished since resolution
                    if let NextSession::SessionActive(session) =
                        self.inner.pool.get_next_session(&counterparties)
                    {
                        self.publish(std::mem::take(&mut records)).await?;
                        self.flush(&counterparties, &session).await?;
                    }
                }
                OutboundResolution::NewSessionsNeeded(hellos) => {
                    self.inner
                        .pending
                        .queue_message(&counterparties, message)
                        .await;
                    report.queued += 1;
                    records.extend(hellos);
                }
                OutboundResolution::CannotEstablish(reason) => {
                    warn!(
                        "Dropping message {} to {}: {}",
                        message.message_id, counterparties.counterparty_id, reason
                    );
                    report.dropped += 1;
                }
            }
        }

        self.publish(records).await?;
        Ok(report)
    }

    /// Route any received record to its handler
    pub async fn process_inbound(
        &self,
        record: WireRecord,
    ) -> Result<Option<InboundPayload>, SessionManagerError> {
        if record.message.is_handshake() {
            self.process_handshake_message(record).await?;
            return Ok(None);
        }
        match record.message {
            LinkMessage::Data(_) => self.process_inbound_data(record).await,
            LinkMessage::Ack(_) => {
                self.process_ack(&record)?;
                Ok(None)
            }
            LinkMessage::SessionNotFound => {
                self.process_session_not_found(&record).await?;
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    /// Advance a negotiation with one handshake record. Handshake failures
    /// drop the record; only store and publisher failures are returned.
    pub async fn process_handshake_message(
        &self,
        record: WireRecord,
    ) -> Result<(), SessionManagerError> {
        let header = &record.header;
        let outcome = match &record.message {
            LinkMessage::InitiatorHello(hello) => self.on_initiator_hello(header, hello).await,
            LinkMessage::ResponderHello(hello) => self.on_responder_hello(header, hello).await,
            LinkMessage::InitiatorHandshake(message) => {
                self.on_initiator_handshake(header, message).await
            }
            LinkMessage::ResponderHandshake(message) => {
                self.on_responder_handshake(header, message).await
            }
            other => {
                debug!("Ignoring {} passed as a handshake message", other.kind());
                return Ok(());
            }
        };

        match outcome {
            Err(SessionManagerError::Handshake(e)) => {
                warn!(
                    "Dropping {} from {} for session {}: {}",
                    record.message.kind(),
                    header.source,
                    header.session_id,
                    e
                );
                Ok(())
            }
            other => other,
        }
    }

    async fn on_initiator_hello(
        &self,
        header: &LinkHeader,
        hello: &InitiatorHelloMessage,
    ) -> Result<(), SessionManagerError> {
        let (our, peer) = (&header.destination, &header.source);
        self.local_keys(our)?;

        let key = state_key(SessionDirection::Inbound, &header.session_id);
        if let Some(existing) = self.load(&key).await? {
            debug!("Duplicate initiator hello for {}", header.session_id);
            return self.replay(&existing).await;
        }

        let info = self
            .inner
            .membership
            .lookup(our, peer, MembershipStatusFilter::Active)
            .ok_or_else(|| HandshakeError::PeerNotFound(peer.to_string()))?;

        let config = self.config();
        let responder = HandshakeResponder::new(
            header.session_id.clone(),
            our.clone(),
            peer.clone(),
            hello,
            &config.protocol_modes,
        )?;
        let reply = WireRecord::new(
            header.reversed(),
            LinkMessage::ResponderHello(responder.hello_message()),
        );

        let now = self.now();
        let counterparties = SessionCounterparties {
            serial: info.serial,
            initiation_timestamp: now,
            ..SessionCounterparties::new(our.clone(), peer.clone())
        };
        let metadata = SessionMetadata::new(
            SessionDirection::Inbound,
            header.session_id.clone(),
            &counterparties,
            SessionStatus::SentResponderHello,
            now,
            config.session_ttl,
        );

        match self
            .persist(&metadata, Some(reply.clone()), SessionSecret::Responder(responder), None)
            .await?
        {
            PersistOutcome::Written => {
                debug!("Answering hello for {} from {}", header.session_id, peer);
                self.publish(vec![reply]).await
            }
            PersistOutcome::Conflict(current) => self.replay_current(current).await,
        }
    }

    async fn on_responder_hello(
        &self,
        header: &LinkHeader,
        hello: &ResponderHelloMessage,
    ) -> Result<(), SessionManagerError> {
        let key = state_key(SessionDirection::Outbound, &header.session_id);
        let Some(state) = self.load(&key).await? else {
            debug!("Responder hello for unknown session {}", header.session_id);
            return Ok(());
        };
        if state.metadata.status != SessionStatus::SentInitiatorHello {
            debug!("Duplicate responder hello for {}", header.session_id);
            return self.replay(&state).await;
        }
        let RuntimeSession::Initiator(mut initiator) = state.session else {
            return Err(HandshakeError::UnexpectedMessage("responder-hello").into());
        };
        check_sender(header, initiator.peer_identity())?;

        let keys = self.local_keys(initiator.our_identity())?;
        let info = self
            .inner
            .membership
            .lookup(
                initiator.our_identity(),
                initiator.peer_identity(),
                state.metadata.membership_status,
            )
            .ok_or_else(|| HandshakeError::PeerNotFound(initiator.peer_identity().to_string()))?;

        let message = initiator.receive_responder_hello(hello, info.static_public, &keys)?;
        let reply = WireRecord::new(header.reversed(), LinkMessage::InitiatorHandshake(message));
        let metadata = state.metadata.advance(
            SessionStatus::SentInitiatorHandshake,
            self.now(),
            self.config().session_ttl,
        );

        match self
            .persist(
                &metadata,
                Some(reply.clone()),
                SessionSecret::Initiator(initiator.clone()),
                Some(state.version),
            )
            .await?
        {
            PersistOutcome::Written => {
                self.inner.pool.replace_pending(initiator);
                self.publish(vec![reply]).await
            }
            PersistOutcome::Conflict(current) => self.replay_current(current).await,
        }
    }

    async fn on_initiator_handshake(
        &self,
        header: &LinkHeader,
        message: &HandshakeCiphertext,
    ) -> Result<(), SessionManagerError> {
        let key = state_key(SessionDirection::Inbound, &header.session_id);
        let Some(state) = self.load(&key).await? else {
            debug!("Initiator handshake for unknown session {}", header.session_id);
            return Ok(());
        };
        if state.metadata.status == SessionStatus::SessionReady {
            debug!("Duplicate initiator handshake for {}", header.session_id);
            return self.replay(&state).await;
        }
        let RuntimeSession::Responder(responder) = state.session else {
            return Err(HandshakeError::UnexpectedMessage("initiator-handshake").into());
        };
        check_sender(header, responder.peer_identity())?;

        let keys = self.local_keys(responder.our_identity())?;
        let proof = responder.read_initiator_handshake(message, &keys)?;
        validate_peer(
            &proof,
            responder.our_identity(),
            state.metadata.membership_status,
            self.inner.membership.as_ref(),
            &self.revocation(),
        )
        .await?;

        let (message, session) = responder.complete(&proof, &keys)?;
        let reply = WireRecord::new(header.reversed(), LinkMessage::ResponderHandshake(message));
        let metadata = state.metadata.advance(
            SessionStatus::SessionReady,
            self.now(),
            self.config().session_ttl,
        );

        match self
            .persist(
                &metadata,
                Some(reply.clone()),
                SessionSecret::Established(session.snapshot()),
                Some(state.version),
            )
            .await?
        {
            PersistOutcome::Written => {
                info!(
                    "Inbound session {} with {} is ready",
                    header.session_id, proof.identity
                );
                self.inner.inbound.insert(Arc::new(session));
                self.publish(vec![reply]).await
            }
            PersistOutcome::Conflict(current) => self.replay_current(current).await,
        }
    }

    async fn on_responder_handshake(
        &self,
        header: &LinkHeader,
        message: &HandshakeCiphertext,
    ) -> Result<(), SessionManagerError> {
        let key = state_key(SessionDirection::Outbound, &header.session_id);
        let Some(state) = self.load(&key).await? else {
            debug!("Responder handshake for unknown session {}", header.session_id);
            return Ok(());
        };
        match state.metadata.status {
            SessionStatus::SessionReady => {
                debug!("Duplicate responder handshake for {}", header.session_id);
                return Ok(());
            }
            SessionStatus::SentInitiatorHandshake => {}
            _ => return Err(HandshakeError::UnexpectedMessage("responder-handshake").into()),
        }
        let RuntimeSession::Initiator(initiator) = state.session else {
            return Err(HandshakeError::UnexpectedMessage("responder-handshake").into());
        };
        check_sender(header, initiator.peer_identity())?;

        let keys = self.local_keys(initiator.our_identity())?;
        let (proof, session) = initiator.read_responder_handshake(message, &keys)?;
        validate_peer(
            &proof,
            initiator.our_identity(),
            state.metadata.membership_status,
            self.inner.membership.as_ref(),
            &self.revocation(),
        )
        .await?;

        let metadata = state.metadata.advance(
            SessionStatus::SessionReady,
            self.now(),
            self.config().session_ttl,
        );
        match self
            .persist(
                &metadata,
                None,
                SessionSecret::Established(session.snapshot()),
                Some(state.version),
            )
            .await?
        {
            PersistOutcome::Written => {
                self.inner.timeouts.disarm(&header.session_id);
                let session = Arc::new(session);
                let counterparties = metadata.counterparties();
                if !self.inner.pool.add_session(session.clone()) {
                    self.inner.pool.restore_sessions(
                        &counterparties,
                        vec![PoolSlot::Active(session.clone())],
                    );
                }
                info!(
                    "Outbound session {} with {} is ready",
                    header.session_id, counterparties.counterparty_id
                );
                self.flush(&counterparties, &session).await?;
                Ok(())
            }
            PersistOutcome::Conflict(_) => {
                debug!("Session {} was completed concurrently", header.session_id);
                Ok(())
            }
        }
    }

    /// Open session traffic, acknowledge it and hand the payload back. Data
    /// on an unknown session is answered with `SessionNotFound`.
    pub async fn process_inbound_data(
        &self,
        record: WireRecord,
    ) -> Result<Option<InboundPayload>, SessionManagerError> {
        let LinkMessage::Data(data) = &record.message else {
            return Ok(None);
        };
        let session_id = record.session_id().clone();

        let lookup = self
            .get_sessions_by_id(vec![session_id.clone()], |id| id.clone())
            .await?
            .pop()
            .map(|(_, lookup)| lookup)
            .unwrap_or(SessionLookup::Unknown);

        let session = match lookup {
            SessionLookup::Inbound(session) | SessionLookup::Outbound(session) => session,
            SessionLookup::Pending => {
                debug!("Data on session {} before negotiation finished", session_id);
                return Ok(None);
            }
            SessionLookup::Unknown => {
                info!(
                    "Data from {} on unknown session {}, reporting it missing",
                    record.header.source, session_id
                );
                let reply = WireRecord::new(record.header.reversed(), LinkMessage::SessionNotFound);
                self.publish(vec![reply]).await?;
                return Ok(None);
            }
        };

        if &record.header.source != session.peer_identity()
            || &record.header.destination != session.our_identity()
        {
            warn!(
                "Dropping message {} on session {}: sent as {} -> {}, session is {} -> {}",
                data.message_id,
                session_id,
                record.header.source,
                record.header.destination,
                session.peer_identity(),
                session.our_identity()
            );
            return Ok(None);
        }

        let payload = match open(&session, data) {
            Some(payload) => payload,
            None => return Ok(None),
        };

        let ack = WireRecord::new(
            record.header.reversed(),
            LinkMessage::Ack(AckMessage {
                message_id: data.message_id.clone(),
            }),
        );
        self.publish(vec![ack]).await?;

        Ok(Some(InboundPayload {
            header: record.header.clone(),
            message_id: data.message_id.clone(),
            payload,
        }))
    }

    /// Disarm the dead session timer of the acknowledged session
    pub fn process_ack(&self, record: &WireRecord) -> Result<(), SessionManagerError> {
        if let LinkMessage::Ack(ack) = &record.message {
            debug!(
                "Ack for {} on session {}",
                ack.message_id,
                record.session_id()
            );
            self.inner.monitor.ack_received(record.session_id())?;
        }
        Ok(())
    }

    /// The peer lost one of our outbound sessions: drop it and negotiate a
    /// replacement in its slot
    pub async fn process_session_not_found(
        &self,
        record: &WireRecord,
    ) -> Result<(), SessionManagerError> {
        let old = record.session_id().clone();
        let key = state_key(SessionDirection::Outbound, &old);

        let counterparties = match self.inner.pool.counterparties_for(&old) {
            Some(counterparties) => Some(counterparties),
            None => self
                .load(&key)
                .await?
                .map(|state| state.metadata.counterparties()),
        };
        let Some(counterparties) = counterparties else {
            debug!("Peer reported session {} which is not ours", old);
            return Ok(());
        };
        if record.header.source != counterparties.counterparty_id {
            warn!(
                "{} reported session {} belonging to {}",
                record.header.source, old, counterparties.counterparty_id
            );
            return Ok(());
        }

        info!(
            "{} lost session {}, re-establishing",
            counterparties.counterparty_id, old
        );
        let hellos = self.renegotiate(&old, &counterparties).await?;
        self.delete_state(&key).await?;
        self.publish(hellos).await
    }

    async fn dead_session(&self, session_id: &SessionId) -> Result<(), SessionManagerError> {
        match self.inner.pool.counterparties_for(session_id) {
            Some(counterparties) => {
                info!(
                    "Session {} with {} is dead, renegotiating",
                    session_id, counterparties.counterparty_id
                );
                let hellos = self.renegotiate(session_id, &counterparties).await?;
                self.delete_state(&state_key(SessionDirection::Outbound, session_id))
                    .await?;
                self.publish(hellos).await
            }
            None => {
                self.inner.inbound.remove(session_id);
                Ok(())
            }
        }
    }

    async fn handshake_expired(&self, session_id: &SessionId) -> Result<(), SessionManagerError> {
        if !matches!(self.inner.pool.get_session(session_id), PoolLookup::Pending(_)) {
            debug!("Negotiation {} already left the pool", session_id);
            return Ok(());
        }
        let Some(counterparties) = self.inner.pool.counterparties_for(session_id) else {
            return Ok(());
        };

        info!(
            "Negotiation {} with {} timed out",
            session_id, counterparties.counterparty_id
        );
        let hellos = self.renegotiate(session_id, &counterparties).await?;
        self.delete_state(&state_key(SessionDirection::Outbound, session_id))
            .await?;
        self.publish(hellos).await
    }
}

fn check_sender(header: &LinkHeader, expected: &HoldingIdentity) -> Result<(), HandshakeError> {
    if &header.source != expected {
        return Err(HandshakeError::IdentityMismatch {
            expected: expected.to_string(),
            actual: header.source.to_string(),
        });
    }
    Ok(())
}

fn open(session: &Session, data: &DataMessage) -> Option<Vec<u8>> {
    match session.open(data) {
        Ok(payload) => Some(payload),
        Err(e) => {
            warn!(
                "Dropping message {} on session {}: {}",
                data.message_id,
                session.id(),
                e
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::keys::LocalKeyManagement;
    use crate::membership::{AllowAll, InMemoryMembership, MemberInfo, MemberStatus};
    use crate::publisher::ChannelPublisher;
    use bytes::Bytes;
    use p2p_state::MemoryStateStore;
    use std::time::Duration;

    struct Node {
        manager: StatefulSessionManager,
        rx: mpsc::UnboundedReceiver<WireRecord>,
        identity: HoldingIdentity,
        store: Arc<MemoryStateStore>,
        kms: Arc<LocalKeyManagement>,
        identities: Arc<LocalIdentities>,
    }

    fn config() -> SessionManagerConfig {
        SessionManagerConfig {
            sessions_per_peer: 2,
            expiry_jitter: Duration::ZERO,
            ..Default::default()
        }
    }

    fn manager(
        store: Arc<MemoryStateStore>,
        kms: Arc<LocalKeyManagement>,
        identities: Arc<LocalIdentities>,
        membership: Arc<InMemoryMembership>,
    ) -> (StatefulSessionManager, mpsc::UnboundedReceiver<WireRecord>) {
        let (publisher, rx) = ChannelPublisher::new();
        let manager = StatefulSessionManager::new(
            config(),
            SessionManagerDeps {
                store,
                kms,
                membership,
                revocation: Arc::new(AllowAll),
                publisher: Arc::new(publisher),
                identities,
                clock: Arc::new(ManualClock::new(1_000_000)),
            },
        );
        (manager, rx)
    }

    fn node(name: &str, membership: &Arc<InMemoryMembership>) -> Node {
        let identity = HoldingIdentity::new(name, "group-1");
        let keys = IdentityKeyPair::generate(identity.clone());
        membership.upsert(MemberInfo {
            identity: identity.clone(),
            static_public: keys.public(),
            status: MemberStatus::Active,
            serial: 1,
        });
        let identities = Arc::new(LocalIdentities::new());
        identities.add(keys);

        let store = Arc::new(MemoryStateStore::new());
        let kms = Arc::new(LocalKeyManagement::new().with_key("p2p-session-state", [9u8; 32]));
        let (manager, rx) = manager(
            store.clone(),
            kms.clone(),
            identities.clone(),
            membership.clone(),
        );
        Node {
            manager,
            rx,
            identity,
            store,
            kms,
            identities,
        }
    }

    /// Deliver records both ways until neither side has anything to send
    async fn pump(a: &mut Node, b: &mut Node) -> Vec<InboundPayload> {
        let mut delivered = Vec::new();
        loop {
            let mut progressed = false;
            while let Ok(record) = a.rx.try_recv() {
                progressed = true;
                delivered.extend(b.manager.process_inbound(record).await.unwrap());
            }
            while let Ok(record) = b.rx.try_recv() {
                progressed = true;
                delivered.extend(a.manager.process_inbound(record).await.unwrap());
            }
            if !progressed {
                return delivered;
            }
        }
    }

    fn message(id: &str, payload: &'static [u8], to: &Node, from: &Node) -> OutboundMessage {
        OutboundMessage::new(
            id,
            Bytes::from_static(payload),
            SessionCounterparties::new(from.identity.clone(), to.identity.clone()),
        )
    }

    #[tokio::test]
    async fn test_negotiate_and_deliver() {
        let membership = Arc::new(InMemoryMembership::new());
        let mut alice = node("O=Alice", &membership);
        let mut bob = node("O=Bob", &membership);

        let report = alice
            .manager
            .send_messages(vec![message("m-1", b"hello", &bob, &alice)])
            .await
            .unwrap();
        assert_eq!(
            report,
            SendReport {
                published: 0,
                queued: 1,
                dropped: 0
            }
        );

        let delivered = pump(&mut alice, &mut bob).await;
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].payload, b"hello");
        assert_eq!(delivered[0].header.source, alice.identity);
        assert_eq!(bob.manager.inbound_cache().len(), 2);
        assert_eq!(alice.manager.monitor().armed(), 0);

        // Established now: published straight away
        let report = alice
            .manager
            .send_messages(vec![message("m-2", b"again", &bob, &alice)])
            .await
            .unwrap();
        assert_eq!(report.published, 1);
        let delivered = pump(&mut alice, &mut bob).await;
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].message_id, "m-2");
    }

    #[tokio::test]
    async fn test_queued_messages_keep_order() {
        let membership = Arc::new(InMemoryMembership::new());
        let mut alice = node("O=Alice", &membership);
        let mut bob = node("O=Bob", &membership);

        let messages = (0..5)
            .map(|i| message(&format!("m-{}", i), b"payload", &bob, &alice))
            .collect();
        let report = alice.manager.send_messages(messages).await.unwrap();
        assert_eq!(report.queued, 5);

        let delivered = pump(&mut alice, &mut bob).await;
        let ids: Vec<&str> = delivered.iter().map(|p| p.message_id.as_str()).collect();
        assert_eq!(ids, ["m-0", "m-1", "m-2", "m-3", "m-4"]);
    }

    #[tokio::test]
    async fn test_duplicate_hello_replays_stored_reply() {
        let membership = Arc::new(InMemoryMembership::new());
        let alice = node("O=Alice", &membership);
        let mut bob = node("O=Bob", &membership);

        let c = SessionCounterparties::new(alice.identity.clone(), bob.identity.clone());
        let resolved = alice
            .manager
            .process_outbound_messages(vec![c], |c| c.clone())
            .await
            .unwrap();
        let hellos = match &resolved[0].1 {
            OutboundResolution::NewSessionsNeeded(hellos) => hellos.clone(),
            other => panic!("expected new sessions, got {:?}", other),
        };
        assert_eq!(hellos.len(), 2);

        bob.manager.process_inbound(hellos[0].clone()).await.unwrap();
        bob.manager.process_inbound(hellos[0].clone()).await.unwrap();

        let first = bob.rx.try_recv().unwrap();
        let second = bob.rx.try_recv().unwrap();
        assert!(matches!(first.message, LinkMessage::ResponderHello(_)));
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_unknown_peer_cannot_establish() {
        let membership = Arc::new(InMemoryMembership::new());
        let mut alice = node("O=Alice", &membership);
        let carol = OutboundMessage::new(
            "m-1",
            Bytes::from_static(b"hi"),
            SessionCounterparties::new(
                alice.identity.clone(),
                HoldingIdentity::new("O=Carol", "group-1"),
            ),
        );

        let report = alice.manager.send_messages(vec![carol]).await.unwrap();
        assert_eq!(report.dropped, 1);
        assert!(alice.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_session_not_found_renegotiates() {
        let membership = Arc::new(InMemoryMembership::new());
        let mut alice = node("O=Alice", &membership);
        let mut bob = node("O=Bob", &membership);

        alice
            .manager
            .send_messages(vec![message("m-1", b"hello", &bob, &alice)])
            .await
            .unwrap();
        assert_eq!(pump(&mut alice, &mut bob).await.len(), 1);

        // Bob comes back with no state and a new key
        let mut bob = node("O=Bob", &membership);
        alice
            .manager
            .send_messages(vec![message("m-2", b"lost", &bob, &alice)])
            .await
            .unwrap();
        let record = alice.rx.try_recv().unwrap();
        let lost = record.session_id().clone();
        assert!(bob.manager.process_inbound(record).await.unwrap().is_none());

        pump(&mut alice, &mut bob).await;

        assert!(matches!(
            alice.manager.pool().get_session(&lost),
            PoolLookup::Unknown
        ));
        let stored = alice
            .store
            .get(&[state_key(SessionDirection::Outbound, &lost)])
            .await
            .unwrap();
        assert!(stored.is_empty());
        assert_eq!(bob.manager.inbound_cache().len(), 1);
    }

    #[tokio::test]
    async fn test_restart_restores_sessions_from_store() {
        let membership = Arc::new(InMemoryMembership::new());
        let mut alice = node("O=Alice", &membership);
        let mut bob = node("O=Bob", &membership);

        alice
            .manager
            .send_messages(vec![message("m-1", b"hello", &bob, &alice)])
            .await
            .unwrap();
        let delivered = pump(&mut alice, &mut bob).await;
        let session_id = delivered[0].header.session_id.clone();

        let (restarted, _rx) = manager(
            alice.store.clone(),
            alice.kms.clone(),
            alice.identities.clone(),
            membership.clone(),
        );
        let found = restarted
            .get_sessions_by_id(vec![session_id.clone()], |id| id.clone())
            .await
            .unwrap();
        match &found[0].1 {
            SessionLookup::Outbound(session) => assert_eq!(session.id(), &session_id),
            other => panic!("expected outbound session, got {:?}", other),
        }

        let (restarted, _rx) = manager(
            alice.store.clone(),
            alice.kms.clone(),
            alice.identities.clone(),
            membership.clone(),
        );
        let c = SessionCounterparties::new(alice.identity.clone(), bob.identity.clone());
        let resolved = restarted
            .process_outbound_messages(vec![c], |c| c.clone())
            .await
            .unwrap();
        assert!(matches!(resolved[0].1, OutboundResolution::Established(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_session_is_renegotiated() {
        let membership = Arc::new(InMemoryMembership::new());
        let mut alice = node("O=Alice", &membership);
        let mut bob = node("O=Bob", &membership);
        let _loop = alice.manager.start();
        assert!(alice.manager.start().is_none());

        alice
            .manager
            .send_messages(vec![message("m-1", b"hello", &bob, &alice)])
            .await
            .unwrap();
        pump(&mut alice, &mut bob).await;

        // Sent but never acknowledged
        alice
            .manager
            .send_messages(vec![message("m-2", b"void", &bob, &alice)])
            .await
            .unwrap();
        let record = alice.rx.try_recv().unwrap();
        let silent = record.session_id().clone();
        assert_eq!(alice.manager.monitor().armed(), 1);

        tokio::time::sleep(Duration::from_secs(31)).await;

        assert!(matches!(
            alice.manager.pool().get_session(&silent),
            PoolLookup::Unknown
        ));
        let hello = alice.rx.try_recv().unwrap();
        assert!(matches!(hello.message, LinkMessage::InitiatorHello(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_session_is_not_restored() {
        let membership = Arc::new(InMemoryMembership::new());
        let mut alice = node("O=Alice", &membership);
        let mut bob = node("O=Bob", &membership);
        let _loop = alice.manager.start();

        alice
            .manager
            .send_messages(vec![message("m-1", b"hello", &bob, &alice)])
            .await
            .unwrap();
        pump(&mut alice, &mut bob).await;

        alice
            .manager
            .send_messages(vec![message("m-2", b"void", &bob, &alice)])
            .await
            .unwrap();
        let silent = alice.rx.try_recv().unwrap().session_id().clone();

        tokio::time::sleep(Duration::from_secs(31)).await;

        let stored = alice
            .store
            .get(&[state_key(SessionDirection::Outbound, &silent)])
            .await
            .unwrap();
        assert!(stored.is_empty());

        let found = alice
            .manager
            .get_sessions_by_id(vec![silent.clone()], |id| id.clone())
            .await
            .unwrap();
        assert!(matches!(found[0].1, SessionLookup::Unknown));
        assert!(matches!(
            alice.manager.pool().get_session(&silent),
            PoolLookup::Unknown
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_negotiation_is_replaced() {
        let membership = Arc::new(InMemoryMembership::new());
        let mut alice = node("O=Alice", &membership);
        let mut bob = node("O=Bob", &membership);
        let _loop = alice.manager.start();

        alice
            .manager
            .send_messages(vec![message("m-1", b"hello", &bob, &alice)])
            .await
            .unwrap();

        // Both hellos are lost on the way
        let mut lost = Vec::new();
        while let Ok(record) = alice.rx.try_recv() {
            lost.push(record.session_id().clone());
        }
        assert_eq!(lost.len(), 2);
        assert_eq!(alice.manager.handshake_timeouts().armed(), 2);

        tokio::time::sleep(config().handshake_timeout + Duration::from_secs(1)).await;

        let mut resent = Vec::new();
        while let Ok(record) = alice.rx.try_recv() {
            assert!(matches!(record.message, LinkMessage::InitiatorHello(_)));
            assert!(!lost.contains(record.session_id()));
            resent.push(record);
        }
        assert_eq!(resent.len(), 2);
        assert_eq!(alice.manager.handshake_timeouts().armed(), 2);

        let c = SessionCounterparties::new(alice.identity.clone(), bob.identity.clone());
        assert_eq!(alice.manager.pending_queue().pending_count(&c).await, 1);
        for id in &lost {
            assert!(matches!(
                alice.manager.pool().get_session(id),
                PoolLookup::Unknown
            ));
        }

        for record in resent {
            bob.manager.process_inbound(record).await.unwrap();
        }
        let delivered = pump(&mut alice, &mut bob).await;
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].message_id, "m-1");
        assert_eq!(alice.manager.handshake_timeouts().armed(), 0);
    }

    #[tokio::test]
    async fn test_rewritten_sender_is_dropped() {
        let membership = Arc::new(InMemoryMembership::new());
        let mut alice = node("O=Alice", &membership);
        let mut bob = node("O=Bob", &membership);

        alice
            .manager
            .send_messages(vec![message("m-1", b"hello", &bob, &alice)])
            .await
            .unwrap();
        pump(&mut alice, &mut bob).await;

        alice
            .manager
            .send_messages(vec![message("m-2", b"from alice", &bob, &alice)])
            .await
            .unwrap();
        let mut record = alice.rx.try_recv().unwrap();
        assert!(matches!(record.message, LinkMessage::Data(_)));
        record.header.source = HoldingIdentity::new("O=Carol", "group-1");

        assert!(bob.manager.process_inbound(record).await.unwrap().is_none());
        assert!(bob.rx.try_recv().is_err());
    }
}
