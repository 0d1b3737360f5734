//! Session manager configuration.

use p2p_wire::ProtocolMode;
use std::fmt;
use std::time::Duration;

/// Tunables of the session manager; published as snapshots, so a change only
/// affects work scheduled after it
#[derive(Clone, Debug, PartialEq)]
pub struct SessionManagerConfig {
    /// Pool capacity per counterparty pair
    pub sessions_per_peer: usize,
    /// Lifetime of a session after its last write
    pub session_ttl: Duration,
    /// Time a pending negotiation may take before it is replaced
    pub handshake_timeout: Duration,
    /// Silence after a send before a session is treated as dead
    pub dead_session_timeout: Duration,
    /// Upper bound of the random delay added to expiry deletions
    pub expiry_jitter: Duration,
    /// Revocation checks slower than this count as revoked
    pub revocation_check_timeout: Duration,
    /// Key-management alias protecting persisted secrets
    pub key_alias: String,
    /// Protocol modes offered or accepted, in preference order
    pub protocol_modes: Vec<ProtocolMode>,
}

impl Default for SessionManagerConfig {
    fn default() -> Self {
        Self {
            sessions_per_peer: 4,
            session_ttl: Duration::from_secs(12 * 60 * 60),
            handshake_timeout: Duration::from_secs(10),
            dead_session_timeout: Duration::from_secs(30),
            expiry_jitter: Duration::from_secs(5),
            revocation_check_timeout: Duration::from_secs(5),
            key_alias: "p2p-session-state".to_string(),
            protocol_modes: vec![
                ProtocolMode::AuthenticatedEncryption,
                ProtocolMode::AuthenticationOnly,
            ],
        }
    }
}

impl fmt::Display for SessionManagerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sessions_per_peer={} ttl={} handshake_timeout={} dead_session_timeout={} jitter={} revocation_timeout={}",
            self.sessions_per_peer,
            humantime::format_duration(self.session_ttl),
            humantime::format_duration(self.handshake_timeout),
            humantime::format_duration(self.dead_session_timeout),
            humantime::format_duration(self.expiry_jitter),
            humantime::format_duration(self.revocation_check_timeout),
        )
    }
}
