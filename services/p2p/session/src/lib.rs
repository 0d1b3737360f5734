//! Stateful session management for p2p links.
//!
//! This crate negotiates, pools, persists and expires the authenticated
//! sessions two members use to exchange messages.
//!
//! ## Features
//!
//! - **Outbound Pool**: fixed number of sessions per counterparty pair, round-robin selection
//! - **Pending Queue**: messages wait, in order, for a negotiation to finish
//! - **Persistence**: every handshake step and session lands in a versioned store, secrets encrypted
//! - **Expiry**: one deletion timer per stored state, caches invalidated on deletion
//! - **Liveness**: sessions whose traffic goes unacknowledged are renegotiated
//! - **Handshake Deadlines**: negotiations that stall are replaced on a timer
//! - **Re-establishment**: a peer reporting an unknown session triggers a fresh negotiation
//!
//! ## Example
//!
//! ```rust,no_run
//! use p2p_session::{
//!     ChannelPublisher, LocalIdentities, LocalKeyManagement, InMemoryMembership, AllowAll,
//!     OutboundMessage, SessionCounterparties, SessionManagerConfig, SessionManagerDeps,
//!     StatefulSessionManager, SystemClock,
//! };
//! use p2p_state::MemoryStateStore;
//! use p2p_wire::HoldingIdentity;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let (publisher, mut outbound) = ChannelPublisher::new();
//! let kms = LocalKeyManagement::new();
//! kms.ensure_key("p2p-session-state");
//!
//! let manager = StatefulSessionManager::new(
//!     SessionManagerConfig::default(),
//!     SessionManagerDeps {
//!         store: Arc::new(MemoryStateStore::new()),
//!         kms: Arc::new(kms),
//!         membership: Arc::new(InMemoryMembership::new()),
//!         revocation: Arc::new(AllowAll),
//!         publisher: Arc::new(publisher),
//!         identities: Arc::new(LocalIdentities::new()),
//!         clock: Arc::new(SystemClock),
//!     },
//! );
//! manager.start();
//!
//! let counterparties = SessionCounterparties::new(
//!     HoldingIdentity::new("O=Alice", "group-1"),
//!     HoldingIdentity::new("O=Bob", "group-1"),
//! );
//! manager
//!     .send_messages(vec![OutboundMessage::new("m-1", &b"hello"[..], counterparties)])
//!     .await?;
//!
//! while let Some(record) = outbound.recv().await {
//!     println!("{} for {}", record.message.kind(), record.header.destination);
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cache;
pub mod clock;
pub mod config;
pub mod convertor;
pub mod dead_session;
pub mod error;
pub mod expiry;
pub mod handshake;
pub mod handshake_timeout;
pub mod keys;
pub mod manager;
pub mod membership;
pub mod pending;
pub mod pool;
pub mod publisher;
pub mod session;
pub mod state;
pub mod types;
pub mod wrapper;

// Re-export main types
pub use cache::SessionCache;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::SessionManagerConfig;
pub use convertor::{RuntimeSession, RuntimeSessionState, SessionSecret, StateConvertor};
pub use dead_session::DeadSessionMonitor;
pub use error::{
    ConvertError, HandshakeError, KeyError, MonitorError, PublishError, SessionError,
    SessionManagerError,
};
pub use expiry::{CacheInvalidation, SessionExpiryScheduler};
pub use handshake_timeout::HandshakeTimeouts;
pub use keys::{IdentityKeyPair, KeyManagement, LocalIdentities, LocalKeyManagement};
pub use manager::{
    InboundPayload, OutboundResolution, SendReport, SessionLookup, SessionManagerDeps,
    StatefulSessionManager,
};
pub use membership::{
    AllowAll, BoundedRevocationChecker, InMemoryMembership, MemberInfo, MemberStatus,
    MembershipDirectory, RevocationChecker, RevocationList, RevocationStatus,
};
pub use pending::PendingMessageQueue;
pub use pool::{NextSession, OutboundSessionPool, PoolLookup};
pub use publisher::{ChannelPublisher, WirePublisher};
pub use session::{Session, SessionDirection};
pub use state::{SessionMetadata, SessionStatus};
pub use types::{MembershipStatusFilter, OutboundMessage, SessionCounterparties};
pub use wrapper::StateStoreWrapper;
