//! Counterparty pairs and outbound message types.

use bytes::Bytes;
use p2p_wire::HoldingIdentity;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

/// Which membership states of the peer are acceptable
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub enum MembershipStatusFilter {
    /// Only active members
    Active,
    /// Active or suspended members
    ActiveOrSuspended,
    /// Active members, or pending ones when talking to the membership manager
    ActiveIfPresentOrPending,
}

impl MembershipStatusFilter {
    /// Stable string form
    pub fn as_str(&self) -> &'static str {
        match self {
            MembershipStatusFilter::Active => "ACTIVE",
            MembershipStatusFilter::ActiveOrSuspended => "ACTIVE_OR_SUSPENDED",
            MembershipStatusFilter::ActiveIfPresentOrPending => "ACTIVE_IF_PRESENT_OR_PENDING",
        }
    }
}

impl FromStr for MembershipStatusFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACTIVE" => Ok(MembershipStatusFilter::Active),
            "ACTIVE_OR_SUSPENDED" => Ok(MembershipStatusFilter::ActiveOrSuspended),
            "ACTIVE_IF_PRESENT_OR_PENDING" => Ok(MembershipStatusFilter::ActiveIfPresentOrPending),
            other => Err(format!("unknown membership status filter: {}", other)),
        }
    }
}

/// The relationship a session is negotiated for.
///
/// Equality and hashing ignore `initiation_timestamp`: it records when the
/// relationship was first used, so two sends to the same peer at different
/// times still land on the same pool and queue entry.
#[derive(Clone, Debug)]
pub struct SessionCounterparties {
    /// Local identity
    pub our_id: HoldingIdentity,
    /// Remote identity
    pub counterparty_id: HoldingIdentity,
    /// Acceptable membership states of the peer
    pub status: MembershipStatusFilter,
    /// Membership serial the relationship was resolved against
    pub serial: u64,
    /// Whether the peer is the membership manager
    pub communicating_with_mgm: bool,
    /// First use, epoch millis
    pub initiation_timestamp: u64,
}

impl SessionCounterparties {
    /// Counterparties with default filter and serial
    pub fn new(our_id: HoldingIdentity, counterparty_id: HoldingIdentity) -> Self {
        Self {
            our_id,
            counterparty_id,
            status: MembershipStatusFilter::Active,
            serial: 1,
            communicating_with_mgm: false,
            initiation_timestamp: 0,
        }
    }

    /// Group both identities belong to
    pub fn group_id(&self) -> &str {
        &self.our_id.group_id
    }

    /// Stable string form, stored in metadata for lookups
    pub fn counterparties_key(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}",
            self.our_id,
            self.counterparty_id,
            self.status.as_str(),
            self.serial,
            self.communicating_with_mgm
        )
    }
}

impl PartialEq for SessionCounterparties {
    fn eq(&self, other: &Self) -> bool {
        self.our_id == other.our_id
            && self.counterparty_id == other.counterparty_id
            && self.status == other.status
            && self.serial == other.serial
            && self.communicating_with_mgm == other.communicating_with_mgm
    }
}

impl Eq for SessionCounterparties {}

impl Hash for SessionCounterparties {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.our_id.hash(state);
        self.counterparty_id.hash(state);
        self.status.hash(state);
        self.serial.hash(state);
        self.communicating_with_mgm.hash(state);
    }
}

impl fmt::Display for SessionCounterparties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.our_id, self.counterparty_id)
    }
}

/// Application message waiting to be sent to a counterparty
#[derive(Clone, Debug)]
pub struct OutboundMessage {
    /// Application message id
    pub message_id: String,
    /// Payload bytes
    pub payload: Bytes,
    /// Relationship the message travels on
    pub counterparties: SessionCounterparties,
}

impl OutboundMessage {
    /// Create a new outbound message
    pub fn new(
        message_id: impl Into<String>,
        payload: impl Into<Bytes>,
        counterparties: SessionCounterparties,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            payload: payload.into(),
            counterparties,
        }
    }
}
