//! Error types for the session layer.

use p2p_state::StateError;
use p2p_wire::WireError;
use thiserror::Error;

/// Handshake failures; the negotiation is dropped, never retried in place
#[derive(Error, Debug)]
pub enum HandshakeError {
    /// Peer missing from the membership directory
    #[error("peer not found: {0}")]
    PeerNotFound(String),
    /// Static key does not match the one published for the member
    #[error("static key mismatch for {0}")]
    KeyMismatch(String),
    /// Identity inside the handshake differs from the header identity
    #[error("identity mismatch: expected {expected}, got {actual}")]
    IdentityMismatch {
        /// Identity from the record header
        expected: String,
        /// Identity claimed in the handshake
        actual: String,
    },
    /// Peer certificate or key has been revoked
    #[error("peer revoked: {0}")]
    Revoked(String),
    /// AEAD open failed
    #[error("handshake decryption failed")]
    Decryption,
    /// Key agreement produced a low-order result
    #[error("non-contributory key agreement")]
    InvalidKey,
    /// Key schedule failure
    #[error("key derivation failed")]
    KeyDerivation,
    /// No protocol mode in common
    #[error("no supported protocol mode")]
    UnsupportedMode,
    /// Message not valid for the current handshake step
    #[error("unexpected {0} at this handshake step")]
    UnexpectedMessage(&'static str),
    /// Our identity is not hosted on this node
    #[error("identity not hosted locally: {0}")]
    NotLocal(String),
    /// Encoding of the identity proof failed
    #[error("wire error: {0}")]
    Wire(#[from] WireError),
}

/// Session traffic protection failures
#[derive(Error, Debug)]
pub enum SessionError {
    /// Sealing failed
    #[error("encryption failed")]
    Encryption,
    /// Tag verification failed
    #[error("decryption failed")]
    Decryption,
}

/// Key management failures
#[derive(Error, Debug)]
pub enum KeyError {
    /// No key registered under the alias
    #[error("unknown key alias: {0}")]
    UnknownAlias(String),
    /// Encryption failed
    #[error("encryption failed")]
    Encrypt,
    /// Decryption or authentication failed
    #[error("decryption failed")]
    Decrypt,
    /// Ciphertext too short to carry a nonce
    #[error("malformed ciphertext")]
    Malformed,
}

/// Conversion between persisted and runtime state
#[derive(Error, Debug)]
pub enum ConvertError {
    /// Secret could not be protected or unprotected
    #[error("key management: {0}")]
    Key(#[from] KeyError),
    /// Envelope or snapshot encoding
    #[error("encoding: {0}")]
    Wire(#[from] WireError),
    /// Missing or malformed metadata
    #[error("metadata: {0}")]
    Metadata(String),
}

/// Dead session monitor misuse
#[derive(Error, Debug, PartialEq, Eq)]
pub enum MonitorError {
    /// Used before a timeout was configured
    #[error("dead session monitor used before configuration")]
    NotConfigured,
}

/// Wire publisher failures
#[derive(Error, Debug)]
pub enum PublishError {
    /// Receiving side has gone away
    #[error("publisher channel closed")]
    Closed,
    /// Transport-specific failure
    #[error("transport error: {0}")]
    Transport(String),
}

/// Errors surfaced by the session manager
#[derive(Error, Debug)]
pub enum SessionManagerError {
    /// Store I/O
    #[error("state store: {0}")]
    State(#[from] StateError),
    /// Publishing records
    #[error("publish: {0}")]
    Publish(#[from] PublishError),
    /// Dead session monitor misuse
    #[error("monitor: {0}")]
    Monitor(#[from] MonitorError),
    /// Persisting state
    #[error("convert: {0}")]
    Convert(#[from] ConvertError),
    /// Sealing session traffic
    #[error("session: {0}")]
    Session(#[from] SessionError),
    /// Negotiation failure; dropped by the manager, never returned
    #[error("handshake: {0}")]
    Handshake(#[from] HandshakeError),
}
