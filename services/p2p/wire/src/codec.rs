//! CBOR encoding for records and persisted snapshots.

use crate::error::WireError;
use crate::message::WireRecord;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Encode any serializable value as CBOR
pub fn to_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>, WireError> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| WireError::Encode(e.to_string()))?;
    Ok(buf)
}

/// Decode a CBOR value
pub fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, WireError> {
    if bytes.is_empty() {
        return Err(WireError::Empty);
    }
    ciborium::from_reader(bytes).map_err(|e| WireError::Decode(e.to_string()))
}

/// Encode a record for transport
pub fn encode_record(record: &WireRecord) -> Result<Bytes, WireError> {
    to_cbor(record).map(Bytes::from)
}

/// Decode a record received from transport
pub fn decode_record(bytes: &[u8]) -> Result<WireRecord, WireError> {
    from_cbor(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{HoldingIdentity, SessionId};
    use crate::message::{InitiatorHelloMessage, LinkHeader, LinkMessage, ProtocolMode};

    fn header() -> LinkHeader {
        LinkHeader {
            source: HoldingIdentity::new("O=Alice", "group-1"),
            destination: HoldingIdentity::new("O=Bob", "group-1"),
            session_id: SessionId::random(),
        }
    }

    #[test]
    fn test_record_encoding() {
        let record = WireRecord::new(
            header(),
            LinkMessage::InitiatorHello(InitiatorHelloMessage {
                ephemeral_public: [7u8; 32],
                supported_modes: vec![
                    ProtocolMode::AuthenticatedEncryption,
                    ProtocolMode::AuthenticationOnly,
                ],
            }),
        );

        let bytes = encode_record(&record).unwrap();
        let decoded = decode_record(&bytes).unwrap();
        assert_eq!(decoded, record);
        assert!(decoded.message.is_handshake());
    }

    #[test]
    fn test_decode_garbage() {
        assert!(matches!(decode_record(&[]), Err(WireError::Empty)));
        assert!(matches!(
            decode_record(&[0xff, 0x00, 0x13]),
            Err(WireError::Decode(_))
        ));
    }

    #[test]
    fn test_reversed_header() {
        let h = header();
        let r = h.reversed();
        assert_eq!(r.source, h.destination);
        assert_eq!(r.destination, h.source);
        assert_eq!(r.session_id, h.session_id);
    }
}
