//! Conversion between persisted session state and runtime objects.
//!
//! The persisted payload is a CBOR envelope holding the last handshake record
//! we sent (replayed when the peer retransmits) and the session secret,
//! encrypted by the key-management collaborator.

use crate::error::ConvertError;
use crate::handshake::{HandshakeInitiator, HandshakeResponder};
use crate::keys::KeyManagement;
use crate::membership::{RevocationChecker, RevocationStatus};
use crate::session::{Session, SessionSnapshot};
use crate::state::SessionMetadata;
use p2p_state::PersistedState;
use p2p_wire::{from_cbor, to_cbor, WireRecord};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

/// Secret material of a session state
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum SessionSecret {
    /// Outbound negotiation in flight
    Initiator(HandshakeInitiator),
    /// Inbound negotiation in flight
    Responder(HandshakeResponder),
    /// Negotiated session
    Established(SessionSnapshot),
}

/// In-memory form of what gets persisted
#[derive(Clone, Debug)]
pub struct SessionStateSnapshot {
    /// Last handshake record sent
    pub message: Option<WireRecord>,
    /// Secret material, in the clear
    pub secret: SessionSecret,
}

#[derive(Serialize, Deserialize)]
struct PersistedEnvelope {
    message: Option<WireRecord>,
    key_alias: String,
    secret: Vec<u8>,
}

/// Live object rebuilt from a state
#[derive(Clone, Debug)]
pub enum RuntimeSession {
    /// Outbound negotiation in flight
    Initiator(HandshakeInitiator),
    /// Inbound negotiation in flight
    Responder(HandshakeResponder),
    /// Negotiated session
    Established(Arc<Session>),
}

/// A persisted state rebuilt into runtime form
#[derive(Clone, Debug)]
pub struct RuntimeSessionState {
    /// Typed metadata
    pub metadata: SessionMetadata,
    /// Last handshake record sent
    pub message: Option<WireRecord>,
    /// Session or negotiation
    pub session: RuntimeSession,
    /// Store version the state was read at
    pub version: u32,
}

/// Encrypts and decrypts persisted session payloads
#[derive(Clone)]
pub struct StateConvertor {
    kms: Arc<dyn KeyManagement>,
}

impl StateConvertor {
    /// Create a convertor over `kms`
    pub fn new(kms: Arc<dyn KeyManagement>) -> Self {
        Self { kms }
    }

    /// Serialize a snapshot, encrypting the secret under `key_alias`
    pub async fn to_persisted_bytes(
        &self,
        snapshot: &SessionStateSnapshot,
        key_alias: &str,
    ) -> Result<Vec<u8>, ConvertError> {
        let secret = to_cbor(&snapshot.secret)?;
        let secret = self.kms.encrypt(&secret, key_alias).await?;
        let envelope = PersistedEnvelope {
            message: snapshot.message.clone(),
            key_alias: key_alias.to_string(),
            secret,
        };
        Ok(to_cbor(&envelope)?)
    }

    /// Rebuild a runtime session. Any decryption, decoding or metadata
    /// failure, or a revoked counterparty, yields `None`.
    pub async fn to_runtime_session(
        &self,
        state: &PersistedState,
        revocation: &dyn RevocationChecker,
    ) -> Option<RuntimeSessionState> {
        match self.convert(state).await {
            Ok(runtime) => {
                let peer = &runtime.metadata.counterparty_id;
                if revocation.check(peer).await == RevocationStatus::Revoked {
                    warn!("Discarding state {}: {} is revoked", state.key, peer);
                    return None;
                }
                Some(runtime)
            }
            Err(e) => {
                warn!("Discarding unreadable state {}: {}", state.key, e);
                None
            }
        }
    }

    async fn convert(&self, state: &PersistedState) -> Result<RuntimeSessionState, ConvertError> {
        let metadata = SessionMetadata::from_metadata(&state.metadata)?;
        let envelope: PersistedEnvelope = from_cbor(&state.value)?;
        let secret = self
            .kms
            .decrypt(&envelope.secret, &envelope.key_alias)
            .await?;

        let session = match from_cbor::<SessionSecret>(&secret)? {
            SessionSecret::Initiator(initiator) => RuntimeSession::Initiator(initiator),
            SessionSecret::Responder(responder) => RuntimeSession::Responder(responder),
            SessionSecret::Established(snapshot) => {
                if snapshot.session_id != metadata.session_id {
                    return Err(ConvertError::Metadata(format!(
                        "secret for {} stored under {}",
                        snapshot.session_id, metadata.session_id
                    )));
                }
                if snapshot.our_identity != metadata.our_id
                    || snapshot.peer_identity != metadata.counterparty_id
                {
                    return Err(ConvertError::Metadata(format!(
                        "session {} between {} and {} stored for {} and {}",
                        snapshot.session_id,
                        snapshot.our_identity,
                        snapshot.peer_identity,
                        metadata.our_id,
                        metadata.counterparty_id
                    )));
                }
                RuntimeSession::Established(Arc::new(Session::from_snapshot(snapshot)))
            }
        };

        Ok(RuntimeSessionState {
            metadata,
            message: envelope.message,
            session,
            version: state.version,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KeyError;
    use crate::keys::LocalKeyManagement;
    use crate::membership::{AllowAll, RevocationList};
    use crate::session::SessionDirection;
    use crate::state::SessionStatus;
    use crate::types::SessionCounterparties;
    use async_trait::async_trait;
    use p2p_wire::{HoldingIdentity, ProtocolMode, SessionId};
    use std::time::Duration;

    struct BrokenKms;

    #[async_trait]
    impl KeyManagement for BrokenKms {
        async fn encrypt(&self, plaintext: &[u8], _alias: &str) -> Result<Vec<u8>, KeyError> {
            Ok(plaintext.to_vec())
        }

        async fn decrypt(&self, _ciphertext: &[u8], _alias: &str) -> Result<Vec<u8>, KeyError> {
            Err(KeyError::Decrypt)
        }
    }

    fn counterparties() -> SessionCounterparties {
        SessionCounterparties::new(
            HoldingIdentity::new("O=Alice", "group-1"),
            HoldingIdentity::new("O=Bob", "group-1"),
        )
    }

    fn established(id: &SessionId) -> SessionSnapshot {
        SessionSnapshot {
            session_id: id.clone(),
            direction: SessionDirection::Outbound,
            our_identity: HoldingIdentity::new("O=Alice", "group-1"),
            peer_identity: HoldingIdentity::new("O=Bob", "group-1"),
            mode: ProtocolMode::AuthenticatedEncryption,
            send_key: [7u8; 32],
            receive_key: [8u8; 32],
        }
    }

    fn persisted(id: &SessionId, value: Vec<u8>) -> PersistedState {
        let metadata = SessionMetadata::new(
            SessionDirection::Outbound,
            id.clone(),
            &counterparties(),
            SessionStatus::SessionReady,
            1_000,
            Duration::from_secs(60),
        );
        PersistedState::new(metadata.state_key(), value, metadata.to_metadata())
    }

    #[tokio::test]
    async fn test_round_trip_keeps_keys() {
        let kms = Arc::new(LocalKeyManagement::new().with_key("state", [1u8; 32]));
        let convertor = StateConvertor::new(kms);
        let id = SessionId::random();

        let snapshot = SessionStateSnapshot {
            message: None,
            secret: SessionSecret::Established(established(&id)),
        };
        let bytes = convertor.to_persisted_bytes(&snapshot, "state").await.unwrap();
        let runtime = convertor
            .to_runtime_session(&persisted(&id, bytes), &AllowAll)
            .await
            .unwrap();

        match runtime.session {
            RuntimeSession::Established(session) => {
                assert_eq!(session.send_key(), &[7u8; 32]);
                assert_eq!(session.receive_key(), &[8u8; 32]);
                assert_eq!(session.id(), &id);
            }
            other => panic!("expected established session, got {:?}", other),
        }
        assert_eq!(runtime.metadata.status, SessionStatus::SessionReady);
    }

    #[tokio::test]
    async fn test_pending_handshake_round_trip() {
        let kms = Arc::new(LocalKeyManagement::new().with_key("state", [1u8; 32]));
        let convertor = StateConvertor::new(kms);
        let c = counterparties();
        let initiator = HandshakeInitiator::new(
            SessionId::random(),
            c.our_id.clone(),
            c.counterparty_id.clone(),
            vec![ProtocolMode::AuthenticatedEncryption],
        );
        let id = initiator.session_id().clone();
        let hello = initiator.hello_message();

        let snapshot = SessionStateSnapshot {
            message: None,
            secret: SessionSecret::Initiator(initiator),
        };
        let bytes = convertor.to_persisted_bytes(&snapshot, "state").await.unwrap();
        let runtime = convertor
            .to_runtime_session(&persisted(&id, bytes), &AllowAll)
            .await
            .unwrap();
        match runtime.session {
            RuntimeSession::Initiator(restored) => assert_eq!(restored.hello_message(), hello),
            other => panic!("expected initiator, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_failing_decrypt_yields_none() {
        let convertor = StateConvertor::new(Arc::new(BrokenKms));
        let id = SessionId::random();
        let snapshot = SessionStateSnapshot {
            message: None,
            secret: SessionSecret::Established(established(&id)),
        };
        let bytes = convertor.to_persisted_bytes(&snapshot, "state").await.unwrap();
        assert!(convertor
            .to_runtime_session(&persisted(&id, bytes), &AllowAll)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_garbage_and_revoked_yield_none() {
        let kms = Arc::new(LocalKeyManagement::new().with_key("state", [1u8; 32]));
        let convertor = StateConvertor::new(kms);
        let id = SessionId::random();

        assert!(convertor
            .to_runtime_session(&persisted(&id, vec![0xde, 0xad]), &AllowAll)
            .await
            .is_none());

        let snapshot = SessionStateSnapshot {
            message: None,
            secret: SessionSecret::Established(established(&id)),
        };
        let bytes = convertor.to_persisted_bytes(&snapshot, "state").await.unwrap();
        let revoked = RevocationList::new();
        revoked.revoke(counterparties().counterparty_id);
        assert!(convertor
            .to_runtime_session(&persisted(&id, bytes), &revoked)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_session_stored_for_other_members_yields_none() {
        let kms = Arc::new(LocalKeyManagement::new().with_key("state", [1u8; 32]));
        let convertor = StateConvertor::new(kms);
        let id = SessionId::random();

        let snapshot = SessionStateSnapshot {
            message: None,
            secret: SessionSecret::Established(SessionSnapshot {
                peer_identity: HoldingIdentity::new("O=Carol", "group-1"),
                ..established(&id)
            }),
        };
        let bytes = convertor.to_persisted_bytes(&snapshot, "state").await.unwrap();
        assert!(convertor
            .to_runtime_session(&persisted(&id, bytes), &AllowAll)
            .await
            .is_none());
    }
}
