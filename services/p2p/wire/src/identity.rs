//! Member identities and session identifiers.

use crate::error::WireError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// A member identity inside a membership group
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HoldingIdentity {
    /// Member name (e.g. `O=Alice, L=London, C=GB`)
    pub name: String,
    /// Group the member belongs to
    pub group_id: String,
}

impl HoldingIdentity {
    /// Create a new identity
    pub fn new(name: impl Into<String>, group_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            group_id: group_id.into(),
        }
    }
}

impl fmt::Display for HoldingIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.group_id)
    }
}

/// Session identifier, a UUID in its hyphenated string form
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a fresh random session id
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Borrow the string form
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Raw bytes, used as key-derivation salt
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl FromStr for SessionId {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(|u| Self(u.to_string()))
            .map_err(|e| WireError::SessionId(format!("{}: {}", s, e)))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
