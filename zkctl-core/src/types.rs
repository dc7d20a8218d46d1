//! # Core Types
//!
//! Identifiers and small enums shared by every zkctl component.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifier of a unit (one ZooKeeper server process) in the ensemble.
///
/// Units are numbered by the orchestration platform starting at zero. The
/// ZooKeeper `myid` of a unit is its ordinal plus one.
///
/// # Examples
///
/// ```rust
/// use zkctl_core::UnitId;
///
/// let unit = UnitId::new(2);
/// assert_eq!(unit.server_id(), 3);
/// assert_eq!(unit.to_string(), "unit/2");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnitId(pub u32);

impl UnitId {
    pub fn new(ordinal: u32) -> Self {
        Self(ordinal)
    }

    pub fn ordinal(&self) -> u32 {
        self.0
    }

    /// The `myid` this unit's server uses inside the ensemble.
    pub fn server_id(&self) -> u32 {
        self.0 + 1
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unit/{}", self.0)
    }
}

impl From<u32> for UnitId {
    fn from(ordinal: u32) -> Self {
        Self(ordinal)
    }
}

/// Monotonic counter identifying a membership/configuration snapshot.
///
/// # Examples
///
/// ```rust
/// use zkctl_core::ConfigVersion;
///
/// let v1 = ConfigVersion::new(1);
/// assert!(v1.next() > v1);
/// ```
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ConfigVersion(pub u64);

impl ConfigVersion {
    pub fn new(version: u64) -> Self {
        Self(version)
    }

    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConfigVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Monotonic counter identifying a secret generation of one credential.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct CredentialEpoch(pub u64);

impl CredentialEpoch {
    pub fn new(epoch: u64) -> Self {
        Self(epoch)
    }

    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for CredentialEpoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "epoch {}", self.0)
    }
}

/// Token identifying one rolling operation.
///
/// Tokens are random so that two units requesting the same operation kind
/// concurrently never collide; deduplication works on the operation kind,
/// not on the token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OpToken(pub Uuid);

impl OpToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for OpToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OpToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of an outstanding certificate signing request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role of a unit in the ensemble configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Full participant whose vote counts toward quorum
    Voter,
    /// Non-voting member that follows the leader
    Observer,
    /// Being added as a voter; not yet counted toward quorum
    Joining,
    /// Removed from the voter set; waiting to depart
    Leaving,
}

impl Role {
    /// Whether the unit appears as `participant` in the dynamic config.
    pub fn is_participant(&self) -> bool {
        matches!(self, Role::Voter | Role::Joining)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Voter => write!(f, "voter"),
            Role::Observer => write!(f, "observer"),
            Role::Joining => write!(f, "joining"),
            Role::Leaving => write!(f, "leaving"),
        }
    }
}

/// Health of a unit as last reported through the peer state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// No heartbeat received yet
    #[default]
    Unknown,
    /// Process up but not serving requests
    Syncing,
    /// Answering `ruok` and serving requests
    Serving,
    /// Heartbeat missing past the unreachable deadline
    Unreachable,
}

impl HealthStatus {
    pub fn is_serving(&self) -> bool {
        matches!(self, HealthStatus::Serving)
    }

    /// Whether the unit has reported at least once and is still heard from.
    pub fn is_known(&self) -> bool {
        matches!(self, HealthStatus::Syncing | HealthStatus::Serving)
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Unknown => write!(f, "unknown"),
            HealthStatus::Syncing => write!(f, "syncing"),
            HealthStatus::Serving => write!(f, "serving"),
            HealthStatus::Unreachable => write!(f, "unreachable"),
        }
    }
}
