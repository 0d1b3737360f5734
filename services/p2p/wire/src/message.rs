//! Link messages and records.

use crate::identity::{HoldingIdentity, SessionId};
use serde::{Deserialize, Serialize};

/// X25519 public key length
pub const PUBLIC_KEY_LEN: usize = 32;

/// ChaCha20-Poly1305 nonce length
pub const NONCE_LEN: usize = 12;

/// Protection applied to session traffic
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolMode {
    /// Payload encrypted and authenticated
    AuthenticatedEncryption,
    /// Payload in the clear, authenticated by a tag
    AuthenticationOnly,
}

/// First handshake message, sent by the initiator
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitiatorHelloMessage {
    /// Initiator ephemeral X25519 public key
    pub ephemeral_public: [u8; PUBLIC_KEY_LEN],
    /// Modes the initiator accepts, in preference order
    pub supported_modes: Vec<ProtocolMode>,
}

/// Responder answer to [`InitiatorHelloMessage`]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponderHelloMessage {
    /// Responder ephemeral X25519 public key
    pub ephemeral_public: [u8; PUBLIC_KEY_LEN],
    /// Mode picked by the responder
    pub selected_mode: ProtocolMode,
}

/// Encrypted identity proof carried by the last two handshake messages
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeCiphertext {
    /// AEAD nonce
    pub nonce: [u8; NONCE_LEN],
    /// AEAD ciphertext (with tag)
    pub ciphertext: Vec<u8>,
}

/// Application payload sent over an established session
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataMessage {
    /// Application message id, echoed back in the ack
    pub message_id: String,
    /// AEAD nonce
    pub nonce: [u8; NONCE_LEN],
    /// Ciphertext, or cleartext in authentication-only mode
    pub payload: Vec<u8>,
    /// Detached authentication tag
    pub tag: Vec<u8>,
}

/// Acknowledgement of a [`DataMessage`]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckMessage {
    /// Acknowledged message id
    pub message_id: String,
}

/// One message on the link
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkMessage {
    /// Handshake step 1
    InitiatorHello(InitiatorHelloMessage),
    /// Handshake step 2
    ResponderHello(ResponderHelloMessage),
    /// Handshake step 3
    InitiatorHandshake(HandshakeCiphertext),
    /// Handshake step 4
    ResponderHandshake(HandshakeCiphertext),
    /// Session traffic
    Data(DataMessage),
    /// Acknowledgement of session traffic
    Ack(AckMessage),
    /// The receiver does not know the session in the header
    SessionNotFound,
}

impl LinkMessage {
    /// Short name used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            LinkMessage::InitiatorHello(_) => "initiator-hello",
            LinkMessage::ResponderHello(_) => "responder-hello",
            LinkMessage::InitiatorHandshake(_) => "initiator-handshake",
            LinkMessage::ResponderHandshake(_) => "responder-handshake",
            LinkMessage::Data(_) => "data",
            LinkMessage::Ack(_) => "ack",
            LinkMessage::SessionNotFound => "session-not-found",
        }
    }

    /// Whether this is one of the four handshake messages
    pub fn is_handshake(&self) -> bool {
        matches!(
            self,
            LinkMessage::InitiatorHello(_)
                | LinkMessage::ResponderHello(_)
                | LinkMessage::InitiatorHandshake(_)
                | LinkMessage::ResponderHandshake(_)
        )
    }
}

/// Routing header of a record
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkHeader {
    /// Sender
    pub source: HoldingIdentity,
    /// Receiver
    pub destination: HoldingIdentity,
    /// Session the message belongs to
    pub session_id: SessionId,
}

impl LinkHeader {
    /// Header for the opposite direction on the same session
    pub fn reversed(&self) -> Self {
        Self {
            source: self.destination.clone(),
            destination: self.source.clone(),
            session_id: self.session_id.clone(),
        }
    }
}

/// A header plus message, the unit handed to the wire publisher
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireRecord {
    /// Routing header
    pub header: LinkHeader,
    /// Message body
    pub message: LinkMessage,
}

impl WireRecord {
    /// Create a record
    pub fn new(header: LinkHeader, message: LinkMessage) -> Self {
        Self { header, message }
    }

    /// Session id from the header
    pub fn session_id(&self) -> &SessionId {
        &self.header.session_id
    }
}
