//! Membership directory and revocation checking.

use crate::error::HandshakeError;
use crate::handshake::PeerProof;
use crate::types::MembershipStatusFilter;
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use p2p_wire::HoldingIdentity;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Membership state of a member
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemberStatus {
    /// Full member
    Active,
    /// Temporarily suspended
    Suspended,
    /// Registration pending approval
    Pending,
}

/// Published information about a member
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemberInfo {
    /// Member identity
    pub identity: HoldingIdentity,
    /// Static X25519 session-initiation key
    pub static_public: [u8; 32],
    /// Membership state
    pub status: MemberStatus,
    /// Membership serial
    pub serial: u64,
}

impl MemberInfo {
    /// Whether the member passes `filter`
    pub fn accepted_by(&self, filter: MembershipStatusFilter) -> bool {
        match filter {
            MembershipStatusFilter::Active => self.status == MemberStatus::Active,
            MembershipStatusFilter::ActiveOrSuspended => {
                matches!(self.status, MemberStatus::Active | MemberStatus::Suspended)
            }
            MembershipStatusFilter::ActiveIfPresentOrPending => {
                matches!(self.status, MemberStatus::Active | MemberStatus::Pending)
            }
        }
    }
}

/// Membership lookup contract
pub trait MembershipDirectory: Send + Sync {
    /// Look up `member` as seen by `viewer`, honouring `filter`
    fn lookup(
        &self,
        viewer: &HoldingIdentity,
        member: &HoldingIdentity,
        filter: MembershipStatusFilter,
    ) -> Option<MemberInfo>;
}

/// Membership directory held in memory
#[derive(Default)]
pub struct InMemoryMembership {
    members: DashMap<HoldingIdentity, MemberInfo>,
}

impl InMemoryMembership {
    /// Create an empty directory
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a member
    pub fn upsert(&self, info: MemberInfo) {
        self.members.insert(info.identity.clone(), info);
    }

    /// Remove a member
    pub fn remove(&self, identity: &HoldingIdentity) {
        self.members.remove(identity);
    }
}

impl MembershipDirectory for InMemoryMembership {
    fn lookup(
        &self,
        viewer: &HoldingIdentity,
        member: &HoldingIdentity,
        filter: MembershipStatusFilter,
    ) -> Option<MemberInfo> {
        // Members only see their own group
        if viewer.group_id != member.group_id {
            return None;
        }
        self.members
            .get(member)
            .map(|m| m.clone())
            .filter(|m| m.accepted_by(filter))
    }
}

/// Outcome of a revocation check
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RevocationStatus {
    /// Keys are valid
    Active,
    /// Keys have been revoked
    Revoked,
}

/// Revocation checking contract
#[async_trait]
pub trait RevocationChecker: Send + Sync {
    /// Check the session keys of `member`
    async fn check(&self, member: &HoldingIdentity) -> RevocationStatus;
}

/// Accepts everyone
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

#[async_trait]
impl RevocationChecker for AllowAll {
    async fn check(&self, _member: &HoldingIdentity) -> RevocationStatus {
        RevocationStatus::Active
    }
}

/// Explicit list of revoked members
#[derive(Debug, Default)]
pub struct RevocationList {
    revoked: DashSet<HoldingIdentity>,
}

impl RevocationList {
    /// Create an empty list
    pub fn new() -> Self {
        Self::default()
    }

    /// Revoke a member
    pub fn revoke(&self, member: HoldingIdentity) {
        self.revoked.insert(member);
    }
}

#[async_trait]
impl RevocationChecker for RevocationList {
    async fn check(&self, member: &HoldingIdentity) -> RevocationStatus {
        if self.revoked.contains(member) {
            RevocationStatus::Revoked
        } else {
            RevocationStatus::Active
        }
    }
}

/// Wraps a checker with a deadline; a late answer counts as revoked
#[derive(Clone)]
pub struct BoundedRevocationChecker {
    inner: Arc<dyn RevocationChecker>,
    timeout: Duration,
}

impl BoundedRevocationChecker {
    /// Bound `inner` by `timeout`
    pub fn new(inner: Arc<dyn RevocationChecker>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }
}

#[async_trait]
impl RevocationChecker for BoundedRevocationChecker {
    async fn check(&self, member: &HoldingIdentity) -> RevocationStatus {
        match tokio::time::timeout(self.timeout, self.inner.check(member)).await {
            Ok(status) => status,
            Err(_) => {
                warn!(
                    "Revocation check for {} timed out after {:?}, treating as revoked",
                    member, self.timeout
                );
                RevocationStatus::Revoked
            }
        }
    }
}

/// Validate the identity proof a peer sent during the handshake
pub async fn validate_peer(
    proof: &PeerProof,
    viewer: &HoldingIdentity,
    filter: MembershipStatusFilter,
    membership: &dyn MembershipDirectory,
    revocation: &dyn RevocationChecker,
) -> Result<MemberInfo, HandshakeError> {
    let info = membership
        .lookup(viewer, &proof.identity, filter)
        .ok_or_else(|| HandshakeError::PeerNotFound(proof.identity.to_string()))?;

    if info.static_public != proof.static_public {
        return Err(HandshakeError::KeyMismatch(proof.identity.to_string()));
    }

    if revocation.check(&proof.identity).await == RevocationStatus::Revoked {
        return Err(HandshakeError::Revoked(proof.identity.to_string()));
    }

    Ok(info)
}
