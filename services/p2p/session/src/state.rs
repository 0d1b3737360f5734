//! Persisted session state: keys, statuses and metadata.

use crate::error::ConvertError;
use crate::session::SessionDirection;
use crate::types::{MembershipStatusFilter, SessionCounterparties};
use p2p_state::{Metadata, MetadataFilter};
use p2p_wire::{HoldingIdentity, SessionId};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Metadata keys of a persisted session state
pub mod metadata_keys {
    /// Session id
    pub const SESSION_ID: &str = "sessionId";
    /// `INBOUND` or `OUTBOUND`
    pub const DIRECTION: &str = "direction";
    /// Local member name
    pub const SOURCE: &str = "source";
    /// Remote member name
    pub const DESTINATION: &str = "destination";
    /// Group of both members
    pub const GROUP_ID: &str = "groupId";
    /// Epoch millis of the last write
    pub const LAST_SEND_TIMESTAMP: &str = "lastSendTimestamp";
    /// Epoch millis after which the state is invalid
    pub const EXPIRY: &str = "expiry";
    /// Handshake status
    pub const STATUS: &str = "status";
    /// Membership serial
    pub const SERIAL: &str = "serial";
    /// Membership status filter
    pub const MEMBERSHIP_STATUS: &str = "membershipStatus";
    /// Whether the peer is the membership manager
    pub const COMMUNICATING_WITH_MGM: &str = "communicatingWithMgm";
    /// Counterparties lookup key
    pub const COUNTERPARTIES_KEY: &str = "counterpartiesKey";
    /// Epoch millis of the first handshake message
    pub const INITIATED_AT: &str = "initiatedAt";
}

use metadata_keys as keys;

/// Handshake progress recorded in the store
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SessionStatus {
    /// Outbound: hello sent, waiting for the responder hello
    SentInitiatorHello,
    /// Outbound: handshake sent, waiting for the responder handshake
    SentInitiatorHandshake,
    /// Inbound: hello answered, waiting for the initiator handshake
    SentResponderHello,
    /// Negotiated
    SessionReady,
}

impl SessionStatus {
    /// Stable string form
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::SentInitiatorHello => "SentInitiatorHello",
            SessionStatus::SentInitiatorHandshake => "SentInitiatorHandshake",
            SessionStatus::SentResponderHello => "SentResponderHello",
            SessionStatus::SessionReady => "SessionReady",
        }
    }
}

impl FromStr for SessionStatus {
    type Err = ConvertError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SentInitiatorHello" => Ok(SessionStatus::SentInitiatorHello),
            "SentInitiatorHandshake" => Ok(SessionStatus::SentInitiatorHandshake),
            "SentResponderHello" => Ok(SessionStatus::SentResponderHello),
            "SessionReady" => Ok(SessionStatus::SessionReady),
            other => Err(ConvertError::Metadata(format!("unknown status {}", other))),
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Store key of a session state
pub fn state_key(direction: SessionDirection, session_id: &SessionId) -> String {
    match direction {
        SessionDirection::Outbound => format!("outbound:{}", session_id),
        SessionDirection::Inbound => format!("inbound:{}", session_id),
    }
}

/// Split a store key into direction and session id
pub fn parse_state_key(key: &str) -> Option<(SessionDirection, SessionId)> {
    let (direction, id) = key.split_once(':')?;
    let direction = match direction {
        "outbound" => SessionDirection::Outbound,
        "inbound" => SessionDirection::Inbound,
        _ => return None,
    };
    id.parse().ok().map(|id| (direction, id))
}

/// Filter selecting every state of a counterparty pair
pub fn counterparties_filter(counterparties: &SessionCounterparties) -> MetadataFilter {
    MetadataFilter::equals(keys::COUNTERPARTIES_KEY, counterparties.counterparties_key())
}

/// Typed view of a session state's metadata
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionMetadata {
    /// Session id
    pub session_id: SessionId,
    /// Direction
    pub direction: SessionDirection,
    /// Local identity
    pub our_id: HoldingIdentity,
    /// Remote identity
    pub counterparty_id: HoldingIdentity,
    /// Epoch millis of the last write
    pub last_send_timestamp: u64,
    /// `last_send_timestamp + ttl`
    pub expiry: u64,
    /// Handshake status
    pub status: SessionStatus,
    /// Membership serial
    pub serial: u64,
    /// Membership status filter
    pub membership_status: MembershipStatusFilter,
    /// Whether the peer is the membership manager
    pub communicating_with_mgm: bool,
    /// Epoch millis of the first handshake message
    pub initiated_at: u64,
}

impl SessionMetadata {
    /// Metadata for a freshly started negotiation
    pub fn new(
        direction: SessionDirection,
        session_id: SessionId,
        counterparties: &SessionCounterparties,
        status: SessionStatus,
        now: u64,
        ttl: Duration,
    ) -> Self {
        Self {
            session_id,
            direction,
            our_id: counterparties.our_id.clone(),
            counterparty_id: counterparties.counterparty_id.clone(),
            last_send_timestamp: now,
            expiry: now.saturating_add(ttl.as_millis() as u64),
            status,
            serial: counterparties.serial,
            membership_status: counterparties.status,
            communicating_with_mgm: counterparties.communicating_with_mgm,
            initiated_at: now,
        }
    }

    /// Move to `status`, refreshing the send timestamp and expiry
    pub fn advance(&self, status: SessionStatus, now: u64, ttl: Duration) -> Self {
        Self {
            status,
            last_send_timestamp: now,
            expiry: now.saturating_add(ttl.as_millis() as u64),
            ..self.clone()
        }
    }

    /// Whether the state is past its expiry
    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expiry
    }

    /// Store key of this state
    pub fn state_key(&self) -> String {
        state_key(self.direction, &self.session_id)
    }

    /// Counterparties the session belongs to
    pub fn counterparties(&self) -> SessionCounterparties {
        SessionCounterparties {
            our_id: self.our_id.clone(),
            counterparty_id: self.counterparty_id.clone(),
            status: self.membership_status,
            serial: self.serial,
            communicating_with_mgm: self.communicating_with_mgm,
            initiation_timestamp: self.initiated_at,
        }
    }

    /// Store representation
    pub fn to_metadata(&self) -> Metadata {
        Metadata::new()
            .with(keys::SESSION_ID, self.session_id.as_str())
            .with(keys::DIRECTION, self.direction.as_str())
            .with(keys::SOURCE, self.our_id.name.as_str())
            .with(keys::DESTINATION, self.counterparty_id.name.as_str())
            .with(keys::GROUP_ID, self.our_id.group_id.as_str())
            .with(keys::LAST_SEND_TIMESTAMP, self.last_send_timestamp)
            .with(keys::EXPIRY, self.expiry)
            .with(keys::STATUS, self.status.as_str())
            .with(keys::SERIAL, self.serial)
            .with(keys::MEMBERSHIP_STATUS, self.membership_status.as_str())
            .with(keys::COMMUNICATING_WITH_MGM, self.communicating_with_mgm)
            .with(
                keys::COUNTERPARTIES_KEY,
                self.counterparties().counterparties_key(),
            )
            .with(keys::INITIATED_AT, self.initiated_at)
    }

    /// Parse the store representation
    pub fn from_metadata(metadata: &Metadata) -> Result<Self, ConvertError> {
        let text = |key: &str| {
            metadata
                .get_str(key)
                .ok_or_else(|| ConvertError::Metadata(format!("missing {}", key)))
        };
        let number = |key: &str| {
            metadata
                .get_u64(key)
                .ok_or_else(|| ConvertError::Metadata(format!("missing {}", key)))
        };

        let direction = match text(keys::DIRECTION)? {
            "INBOUND" => SessionDirection::Inbound,
            "OUTBOUND" => SessionDirection::Outbound,
            other => {
                return Err(ConvertError::Metadata(format!(
                    "unknown direction {}",
                    other
                )))
            }
        };
        let group_id = text(keys::GROUP_ID)?;

        Ok(Self {
            session_id: text(keys::SESSION_ID)?.parse()?,
            direction,
            our_id: HoldingIdentity::new(text(keys::SOURCE)?, group_id),
            counterparty_id: HoldingIdentity::new(text(keys::DESTINATION)?, group_id),
            last_send_timestamp: number(keys::LAST_SEND_TIMESTAMP)?,
            expiry: number(keys::EXPIRY)?,
            status: text(keys::STATUS)?.parse()?,
            serial: number(keys::SERIAL)?,
            membership_status: text(keys::MEMBERSHIP_STATUS)?
                .parse()
                .map_err(ConvertError::Metadata)?,
            communicating_with_mgm: metadata
                .get_bool(keys::COMMUNICATING_WITH_MGM)
                .unwrap_or(false),
            initiated_at: number(keys::INITIATED_AT)?,
        })
    }
}
