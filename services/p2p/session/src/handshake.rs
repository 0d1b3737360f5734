//! Four-message session handshake.
//!
//! The initiator and responder exchange ephemeral X25519 keys in the two
//! hello messages, then each proves its identity with an AEAD-protected
//! [`PeerProof`]. Keys come from HKDF-SHA256 salted with the session id:
//!
//! ```text
//! k_init  = HKDF(ee || es,       "initiator handshake")
//! k_resp  = HKDF(ee || es || se, "responder handshake")
//! k_i2r   = HKDF(ee || es || se, "initiator to responder")
//! k_r2i   = HKDF(ee || es || se, "responder to initiator")
//! ```
//!
//! Both engine types are plain data so a negotiation in flight can be
//! persisted and resumed after a restart.

use crate::error::HandshakeError;
use crate::keys::IdentityKeyPair;
use crate::session::{Session, SessionDirection, SessionSnapshot};
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use p2p_wire::{
    from_cbor, to_cbor, HandshakeCiphertext, HoldingIdentity, InitiatorHelloMessage,
    ProtocolMode, ResponderHelloMessage, SessionId, NONCE_LEN, PUBLIC_KEY_LEN,
};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use x25519_dalek::{PublicKey, StaticSecret};

const INFO_INITIATOR_HANDSHAKE: &[u8] = b"p2p-session initiator handshake";
const INFO_RESPONDER_HANDSHAKE: &[u8] = b"p2p-session responder handshake";
const INFO_INITIATOR_TO_RESPONDER: &[u8] = b"p2p-session initiator to responder";
const INFO_RESPONDER_TO_INITIATOR: &[u8] = b"p2p-session responder to initiator";

/// Identity proof carried inside the encrypted handshake messages
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerProof {
    /// Claimed identity
    pub identity: HoldingIdentity,
    /// Static public key of that identity
    pub static_public: [u8; PUBLIC_KEY_LEN],
}

fn random_secret() -> [u8; 32] {
    let mut secret = [0u8; 32];
    OsRng.fill_bytes(&mut secret);
    secret
}

fn public_of(secret: &[u8; 32]) -> [u8; PUBLIC_KEY_LEN] {
    PublicKey::from(&StaticSecret::from(*secret)).to_bytes()
}

fn dh(secret: &[u8; 32], public: &[u8; PUBLIC_KEY_LEN]) -> Result<[u8; 32], HandshakeError> {
    let shared = StaticSecret::from(*secret).diffie_hellman(&PublicKey::from(*public));
    if !shared.was_contributory() {
        return Err(HandshakeError::InvalidKey);
    }
    Ok(*shared.as_bytes())
}

fn derive_key(
    session_id: &SessionId,
    secrets: &[[u8; 32]],
    info: &[u8],
) -> Result<[u8; 32], HandshakeError> {
    let ikm = secrets.concat();
    let hk = Hkdf::<Sha256>::new(Some(session_id.as_bytes()), &ikm);
    let mut okm = [0u8; 32];
    hk.expand(info, &mut okm)
        .map_err(|_| HandshakeError::KeyDerivation)?;
    Ok(okm)
}

fn transcript(
    session_id: &SessionId,
    initiator_ephemeral: &[u8; PUBLIC_KEY_LEN],
    responder_ephemeral: &[u8; PUBLIC_KEY_LEN],
) -> Vec<u8> {
    [
        session_id.as_bytes(),
        &initiator_ephemeral[..],
        &responder_ephemeral[..],
    ]
    .concat()
}

fn seal_proof(
    key: &[u8; 32],
    aad: &[u8],
    proof: &PeerProof,
) -> Result<HandshakeCiphertext, HandshakeError> {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let plaintext = to_cbor(proof)?;
    let ciphertext = ChaCha20Poly1305::new(Key::from_slice(key))
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: &plaintext,
                aad,
            },
        )
        .map_err(|_| HandshakeError::KeyDerivation)?;
    Ok(HandshakeCiphertext { nonce, ciphertext })
}

fn open_proof(
    key: &[u8; 32],
    aad: &[u8],
    message: &HandshakeCiphertext,
) -> Result<PeerProof, HandshakeError> {
    let plaintext = ChaCha20Poly1305::new(Key::from_slice(key))
        .decrypt(
            Nonce::from_slice(&message.nonce),
            Payload {
                msg: &message.ciphertext,
                aad,
            },
        )
        .map_err(|_| HandshakeError::Decryption)?;
    Ok(from_cbor(&plaintext)?)
}

fn traffic_keys(
    session_id: &SessionId,
    secrets: &[[u8; 32]],
) -> Result<([u8; 32], [u8; 32]), HandshakeError> {
    Ok((
        derive_key(session_id, secrets, INFO_INITIATOR_TO_RESPONDER)?,
        derive_key(session_id, secrets, INFO_RESPONDER_TO_INITIATOR)?,
    ))
}

fn check_identity(expected: &HoldingIdentity, proof: &PeerProof) -> Result<(), HandshakeError> {
    if &proof.identity != expected {
        return Err(HandshakeError::IdentityMismatch {
            expected: expected.to_string(),
            actual: proof.identity.to_string(),
        });
    }
    Ok(())
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
enum InitiatorStep {
    SentHello,
    SentHandshake {
        responder_ephemeral: [u8; PUBLIC_KEY_LEN],
        selected_mode: ProtocolMode,
        peer_static: [u8; PUBLIC_KEY_LEN],
    },
}

/// Initiator side of a negotiation
#[derive(Clone, Serialize, Deserialize)]
pub struct HandshakeInitiator {
    session_id: SessionId,
    our_identity: HoldingIdentity,
    peer_identity: HoldingIdentity,
    supported_modes: Vec<ProtocolMode>,
    ephemeral_secret: [u8; 32],
    step: InitiatorStep,
}

impl HandshakeInitiator {
    /// Start a negotiation under `session_id`
    pub fn new(
        session_id: SessionId,
        our_identity: HoldingIdentity,
        peer_identity: HoldingIdentity,
        supported_modes: Vec<ProtocolMode>,
    ) -> Self {
        Self {
            session_id,
            our_identity,
            peer_identity,
            supported_modes,
            ephemeral_secret: random_secret(),
            step: InitiatorStep::SentHello,
        }
    }

    /// Provisional session id
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Local identity
    pub fn our_identity(&self) -> &HoldingIdentity {
        &self.our_identity
    }

    /// Remote identity
    pub fn peer_identity(&self) -> &HoldingIdentity {
        &self.peer_identity
    }

    /// Whether the responder hello is still outstanding
    pub fn awaiting_responder_hello(&self) -> bool {
        self.step == InitiatorStep::SentHello
    }

    /// First handshake message
    pub fn hello_message(&self) -> InitiatorHelloMessage {
        InitiatorHelloMessage {
            ephemeral_public: public_of(&self.ephemeral_secret),
            supported_modes: self.supported_modes.clone(),
        }
    }

    /// Consume the responder hello and produce the initiator handshake.
    /// `peer_static` is the responder's published static key.
    pub fn receive_responder_hello(
        &mut self,
        hello: &ResponderHelloMessage,
        peer_static: [u8; PUBLIC_KEY_LEN],
        our_keys: &IdentityKeyPair,
    ) -> Result<HandshakeCiphertext, HandshakeError> {
        if !self.awaiting_responder_hello() {
            return Err(HandshakeError::UnexpectedMessage("responder-hello"));
        }
        if !self.supported_modes.contains(&hello.selected_mode) {
            return Err(HandshakeError::UnsupportedMode);
        }

        let ee = dh(&self.ephemeral_secret, &hello.ephemeral_public)?;
        let es = dh(&self.ephemeral_secret, &peer_static)?;
        let key = derive_key(&self.session_id, &[ee, es], INFO_INITIATOR_HANDSHAKE)?;

        let aad = transcript(
            &self.session_id,
            &public_of(&self.ephemeral_secret),
            &hello.ephemeral_public,
        );
        let proof = PeerProof {
            identity: self.our_identity.clone(),
            static_public: our_keys.public(),
        };
        let message = seal_proof(&key, &aad, &proof)?;

        self.step = InitiatorStep::SentHandshake {
            responder_ephemeral: hello.ephemeral_public,
            selected_mode: hello.selected_mode,
            peer_static,
        };
        Ok(message)
    }

    /// Consume the responder handshake; yields the responder's proof and the
    /// outbound session
    pub fn read_responder_handshake(
        &self,
        message: &HandshakeCiphertext,
        our_keys: &IdentityKeyPair,
    ) -> Result<(PeerProof, Session), HandshakeError> {
        let (responder_ephemeral, selected_mode, peer_static) = match &self.step {
            InitiatorStep::SentHandshake {
                responder_ephemeral,
                selected_mode,
                peer_static,
            } => (responder_ephemeral, *selected_mode, peer_static),
            InitiatorStep::SentHello => {
                return Err(HandshakeError::UnexpectedMessage("responder-handshake"))
            }
        };

        let ee = dh(&self.ephemeral_secret, responder_ephemeral)?;
        let es = dh(&self.ephemeral_secret, peer_static)?;
        let se = dh(our_keys.secret(), responder_ephemeral)?;
        let secrets = [ee, es, se];

        let key = derive_key(&self.session_id, &secrets, INFO_RESPONDER_HANDSHAKE)?;
        let aad = transcript(
            &self.session_id,
            &public_of(&self.ephemeral_secret),
            responder_ephemeral,
        );
        let proof = open_proof(&key, &aad, message)?;

        check_identity(&self.peer_identity, &proof)?;
        if &proof.static_public != peer_static {
            return Err(HandshakeError::KeyMismatch(proof.identity.to_string()));
        }

        let (i2r, r2i) = traffic_keys(&self.session_id, &secrets)?;
        let session = Session::from_snapshot(SessionSnapshot {
            session_id: self.session_id.clone(),
            direction: SessionDirection::Outbound,
            our_identity: self.our_identity.clone(),
            peer_identity: self.peer_identity.clone(),
            mode: selected_mode,
            send_key: i2r,
            receive_key: r2i,
        });
        Ok((proof, session))
    }
}

impl fmt::Debug for HandshakeInitiator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandshakeInitiator")
            .field("session_id", &self.session_id)
            .field("our_identity", &self.our_identity)
            .field("peer_identity", &self.peer_identity)
            .field("awaiting_responder_hello", &self.awaiting_responder_hello())
            .finish_non_exhaustive()
    }
}

/// Responder side of a negotiation
#[derive(Clone, Serialize, Deserialize)]
pub struct HandshakeResponder {
    session_id: SessionId,
    our_identity: HoldingIdentity,
    peer_identity: HoldingIdentity,
    selected_mode: ProtocolMode,
    ephemeral_secret: [u8; 32],
    initiator_ephemeral: [u8; PUBLIC_KEY_LEN],
}

impl HandshakeResponder {
    /// Answer an initiator hello, picking the initiator's most preferred mode
    /// we also accept
    pub fn new(
        session_id: SessionId,
        our_identity: HoldingIdentity,
        peer_identity: HoldingIdentity,
        hello: &InitiatorHelloMessage,
        accepted_modes: &[ProtocolMode],
    ) -> Result<Self, HandshakeError> {
        let selected_mode = hello
            .supported_modes
            .iter()
            .copied()
            .find(|mode| accepted_modes.contains(mode))
            .ok_or(HandshakeError::UnsupportedMode)?;

        Ok(Self {
            session_id,
            our_identity,
            peer_identity,
            selected_mode,
            ephemeral_secret: random_secret(),
            initiator_ephemeral: hello.ephemeral_public,
        })
    }

    /// Session id
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Local identity
    pub fn our_identity(&self) -> &HoldingIdentity {
        &self.our_identity
    }

    /// Remote identity
    pub fn peer_identity(&self) -> &HoldingIdentity {
        &self.peer_identity
    }

    /// Second handshake message
    pub fn hello_message(&self) -> ResponderHelloMessage {
        ResponderHelloMessage {
            ephemeral_public: public_of(&self.ephemeral_secret),
            selected_mode: self.selected_mode,
        }
    }

    fn aad(&self) -> Vec<u8> {
        transcript(
            &self.session_id,
            &self.initiator_ephemeral,
            &public_of(&self.ephemeral_secret),
        )
    }

    /// Decrypt the initiator's identity proof
    pub fn read_initiator_handshake(
        &self,
        message: &HandshakeCiphertext,
        our_keys: &IdentityKeyPair,
    ) -> Result<PeerProof, HandshakeError> {
        let ee = dh(&self.ephemeral_secret, &self.initiator_ephemeral)?;
        let es = dh(our_keys.secret(), &self.initiator_ephemeral)?;
        let key = derive_key(&self.session_id, &[ee, es], INFO_INITIATOR_HANDSHAKE)?;

        let proof = open_proof(&key, &self.aad(), message)?;
        check_identity(&self.peer_identity, &proof)?;
        Ok(proof)
    }

    /// Finish the negotiation for a validated proof; yields the responder
    /// handshake and the inbound session
    pub fn complete(
        &self,
        proof: &PeerProof,
        our_keys: &IdentityKeyPair,
    ) -> Result<(HandshakeCiphertext, Session), HandshakeError> {
        let ee = dh(&self.ephemeral_secret, &self.initiator_ephemeral)?;
        let es = dh(our_keys.secret(), &self.initiator_ephemeral)?;
        let se = dh(&self.ephemeral_secret, &proof.static_public)?;
        let secrets = [ee, es, se];

        let key = derive_key(&self.session_id, &secrets, INFO_RESPONDER_HANDSHAKE)?;
        let ours = PeerProof {
            identity: self.our_identity.clone(),
            static_public: our_keys.public(),
        };
        let message = seal_proof(&key, &self.aad(), &ours)?;

        let (i2r, r2i) = traffic_keys(&self.session_id, &secrets)?;
        let session = Session::from_snapshot(SessionSnapshot {
            session_id: self.session_id.clone(),
            direction: SessionDirection::Inbound,
            our_identity: self.our_identity.clone(),
            peer_identity: self.peer_identity.clone(),
            mode: self.selected_mode,
            send_key: r2i,
            receive_key: i2r,
        });
        Ok((message, session))
    }
}

impl fmt::Debug for HandshakeResponder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandshakeResponder")
            .field("session_id", &self.session_id)
            .field("our_identity", &self.our_identity)
            .field("peer_identity", &self.peer_identity)
            .field("selected_mode", &self.selected_mode)
            .finish_non_exhaustive()
    }
}
