//! Established sessions and traffic protection.

use crate::error::SessionError;
use chacha20poly1305::aead::{AeadInPlace, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce, Tag};
use p2p_wire::{DataMessage, HoldingIdentity, ProtocolMode, SessionId, NONCE_LEN};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;

/// AEAD used for session traffic
pub const ALGORITHM: &str = "ChaCha20-Poly1305";

const TAG_LEN: usize = 16;

/// Which side of the handshake produced the session
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionDirection {
    /// We answered the handshake
    Inbound,
    /// We initiated the handshake
    Outbound,
}

impl SessionDirection {
    /// Stable string form
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionDirection::Inbound => "INBOUND",
            SessionDirection::Outbound => "OUTBOUND",
        }
    }
}

/// Serializable form of a session's negotiated material
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// Session id
    pub session_id: SessionId,
    /// Direction
    pub direction: SessionDirection,
    /// Local end of the session
    pub our_identity: HoldingIdentity,
    /// Remote end of the session
    pub peer_identity: HoldingIdentity,
    /// Traffic protection mode
    pub mode: ProtocolMode,
    /// Key for traffic we send
    pub send_key: [u8; 32],
    /// Key for traffic we receive
    pub receive_key: [u8; 32],
}

impl fmt::Debug for SessionSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionSnapshot")
            .field("session_id", &self.session_id)
            .field("direction", &self.direction)
            .field("our_identity", &self.our_identity)
            .field("peer_identity", &self.peer_identity)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

/// A negotiated session. Never mutated; renegotiation replaces it.
#[derive(Clone)]
pub struct Session {
    snapshot: SessionSnapshot,
    send_cipher: ChaCha20Poly1305,
    receive_cipher: ChaCha20Poly1305,
}

impl Session {
    /// Rebuild a session from its snapshot
    pub fn from_snapshot(snapshot: SessionSnapshot) -> Self {
        let send_cipher = ChaCha20Poly1305::new(Key::from_slice(&snapshot.send_key));
        let receive_cipher = ChaCha20Poly1305::new(Key::from_slice(&snapshot.receive_key));
        Self {
            snapshot,
            send_cipher,
            receive_cipher,
        }
    }

    /// Session id
    pub fn id(&self) -> &SessionId {
        &self.snapshot.session_id
    }

    /// Direction
    pub fn direction(&self) -> SessionDirection {
        self.snapshot.direction
    }

    /// Local end of the session
    pub fn our_identity(&self) -> &HoldingIdentity {
        &self.snapshot.our_identity
    }

    /// Remote end of the session
    pub fn peer_identity(&self) -> &HoldingIdentity {
        &self.snapshot.peer_identity
    }

    /// Traffic protection mode
    pub fn mode(&self) -> ProtocolMode {
        self.snapshot.mode
    }

    /// AEAD algorithm name
    pub fn algorithm(&self) -> &'static str {
        ALGORITHM
    }

    /// Key for traffic we send
    pub fn send_key(&self) -> &[u8; 32] {
        &self.snapshot.send_key
    }

    /// Key for traffic we receive
    pub fn receive_key(&self) -> &[u8; 32] {
        &self.snapshot.receive_key
    }

    /// Snapshot for persistence
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.clone()
    }

    /// Binds the session, both ends and the message id
    fn aad(
        &self,
        source: &HoldingIdentity,
        destination: &HoldingIdentity,
        message_id: &str,
    ) -> Vec<u8> {
        let mut aad = Vec::with_capacity(128 + message_id.len());
        aad.extend_from_slice(self.snapshot.session_id.as_bytes());
        for identity in [source, destination] {
            aad.push(0);
            aad.extend_from_slice(identity.name.as_bytes());
            aad.push(0);
            aad.extend_from_slice(identity.group_id.as_bytes());
        }
        aad.push(0);
        aad.extend_from_slice(message_id.as_bytes());
        aad
    }

    /// Protect an outgoing payload
    pub fn seal(&self, message_id: &str, payload: &[u8]) -> Result<DataMessage, SessionError> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let mut aad = self.aad(self.our_identity(), self.peer_identity(), message_id);
        let (body, tag) = match self.snapshot.mode {
            ProtocolMode::AuthenticatedEncryption => {
                let mut buffer = payload.to_vec();
                let tag = self
                    .send_cipher
                    .encrypt_in_place_detached(Nonce::from_slice(&nonce), &aad, &mut buffer)
                    .map_err(|_| SessionError::Encryption)?;
                (buffer, tag)
            }
            ProtocolMode::AuthenticationOnly => {
                aad.extend_from_slice(payload);
                let tag = self
                    .send_cipher
                    .encrypt_in_place_detached(Nonce::from_slice(&nonce), &aad, &mut [0u8; 0])
                    .map_err(|_| SessionError::Encryption)?;
                (payload.to_vec(), tag)
            }
        };

        Ok(DataMessage {
            message_id: message_id.to_string(),
            nonce,
            payload: body,
            tag: tag.to_vec(),
        })
    }

    /// Verify (and decrypt) an incoming data message
    pub fn open(&self, message: &DataMessage) -> Result<Vec<u8>, SessionError> {
        if message.tag.len() != TAG_LEN {
            return Err(SessionError::Decryption);
        }
        let tag = Tag::from_slice(&message.tag);
        let nonce = Nonce::from_slice(&message.nonce);

        let mut aad = self.aad(self.peer_identity(), self.our_identity(), &message.message_id);
        match self.snapshot.mode {
            ProtocolMode::AuthenticatedEncryption => {
                let mut buffer = message.payload.clone();
                self.receive_cipher
                    .decrypt_in_place_detached(nonce, &aad, &mut buffer, tag)
                    .map_err(|_| SessionError::Decryption)?;
                Ok(buffer)
            }
            ProtocolMode::AuthenticationOnly => {
                aad.extend_from_slice(&message.payload);
                self.receive_cipher
                    .decrypt_in_place_detached(nonce, &aad, &mut [0u8; 0], tag)
                    .map_err(|_| SessionError::Decryption)?;
                Ok(message.payload.clone())
            }
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.snapshot.session_id)
            .field("direction", &self.snapshot.direction)
            .field("peer", &self.snapshot.peer_identity)
            .field("mode", &self.snapshot.mode)
            .field("algorithm", &ALGORITHM)
            .finish()
    }
}
