//! Link-layer identities, messages and encoding for p2p sessions.
//!
//! Every record exchanged between two members carries a [`LinkHeader`]
//! (source, destination, session id) and one [`LinkMessage`]: one of the four
//! handshake messages, an encrypted data message, an acknowledgement, or a
//! session-not-found notification.
//!
//! ## Handshake
//!
//! ```text
//! initiator                                   responder
//!     | --- InitiatorHello (eph, modes) --------> |
//!     | <-- ResponderHello (eph, mode) ---------- |
//!     | --- InitiatorHandshake (AEAD identity) -> |
//!     | <-- ResponderHandshake (AEAD identity) -- |
//! ```
//!
//! Records are encoded as CBOR.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod error;
pub mod identity;
pub mod message;

// Re-export main types
pub use codec::{decode_record, encode_record, from_cbor, to_cbor};
pub use error::WireError;
pub use identity::{HoldingIdentity, SessionId};
pub use message::{
    AckMessage, DataMessage, HandshakeCiphertext, InitiatorHelloMessage, LinkHeader, LinkMessage,
    ProtocolMode, ResponderHelloMessage, WireRecord, NONCE_LEN, PUBLIC_KEY_LEN,
};
