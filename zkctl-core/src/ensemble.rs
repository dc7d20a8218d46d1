//! # Ensemble Model
//!
//! The observed ensemble: units, their roles at the current config version,
//! and the quorum arithmetic the planner relies on.

use crate::{ConfigVersion, HealthStatus, Role, UnitId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Minimum number of voters that must agree for a write to commit.
///
/// # Examples
///
/// ```rust
/// use zkctl_core::quorum_size;
///
/// assert_eq!(quorum_size(3), 2);
/// assert_eq!(quorum_size(4), 3);
/// assert_eq!(quorum_size(5), 3);
/// ```
pub fn quorum_size(voters: usize) -> usize {
    voters / 2 + 1
}

/// Whether two voter sets share at least one member.
pub fn voters_overlap(before: &BTreeSet<UnitId>, after: &BTreeSet<UnitId>) -> bool {
    before.intersection(after).next().is_some()
}

/// Whether moving from `before` to `after` keeps a majority of `before`.
///
/// The initial configuration (empty `before`) is always allowed. Otherwise
/// the members kept from `before` must form a quorum of `before`, which
/// implies the two sets overlap.
pub fn transition_preserves_quorum(before: &BTreeSet<UnitId>, after: &BTreeSet<UnitId>) -> bool {
    if before.is_empty() {
        return !after.is_empty();
    }
    let kept = before.intersection(after).count();
    kept >= quorum_size(before.len()) && voters_overlap(before, after)
}

/// One unit as seen by the local controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Unit {
    pub id: UnitId,

    /// Host the unit registered; `None` until it reports
    pub address: Option<String>,

    /// Role in the committed configuration; `None` when not a member
    pub role: Option<Role>,

    /// Config version the unit's server last acknowledged
    pub acked_config_version: ConfigVersion,

    pub health: HealthStatus,

    /// Whether the unit's server reports leader mode
    pub is_leader: bool,

    /// When the unit first registered, in milliseconds since the epoch
    pub joined_at_ms: u64,

    /// Last heartbeat, in milliseconds since the epoch
    pub last_heartbeat_ms: Option<u64>,

    /// Whether the unit's controller heartbeat is fresh, regardless of
    /// whether its server is up
    pub reporting: bool,

    /// TLS generation the unit's server is running with
    pub tls_generation: u64,
}

impl Unit {
    pub fn new(id: UnitId) -> Self {
        Self {
            id,
            address: None,
            role: None,
            acked_config_version: ConfigVersion::default(),
            health: HealthStatus::Unknown,
            is_leader: false,
            joined_at_ms: 0,
            last_heartbeat_ms: None,
            reporting: false,
            tls_generation: 0,
        }
    }

    pub fn is_voter(&self) -> bool {
        self.role == Some(Role::Voter)
    }

    pub fn is_member(&self) -> bool {
        self.role.is_some()
    }

    /// Heartbeat age at `now_ms`; `None` before the first heartbeat.
    pub fn heartbeat_age_ms(&self, now_ms: u64) -> Option<u64> {
        self.last_heartbeat_ms
            .map(|heartbeat| now_ms.saturating_sub(heartbeat))
    }

    /// Units that have not reported yet never count toward quorum.
    pub fn counts_toward_quorum(&self) -> bool {
        self.is_voter() && self.health.is_serving()
    }
}

/// Observed ensemble: ordered units plus the committed config version.
#[derive(Debug, Clone, PartialEq)]
pub struct Ensemble {
    /// Identity of the unit that built this view
    pub local: UnitId,

    pub config_version: ConfigVersion,

    pub units: BTreeMap<UnitId, Unit>,
}

impl Ensemble {
    pub fn new(local: UnitId, config_version: ConfigVersion) -> Self {
        Self {
            local,
            config_version,
            units: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, unit: Unit) {
        self.units.insert(unit.id, unit);
    }

    pub fn unit(&self, id: UnitId) -> Option<&Unit> {
        self.units.get(&id)
    }

    pub fn local_unit(&self) -> Option<&Unit> {
        self.units.get(&self.local)
    }

    fn with_role(&self, role: Role) -> BTreeSet<UnitId> {
        self.units
            .values()
            .filter(|unit| unit.role == Some(role))
            .map(|unit| unit.id)
            .collect()
    }

    pub fn voters(&self) -> BTreeSet<UnitId> {
        self.with_role(Role::Voter)
    }

    pub fn observers(&self) -> BTreeSet<UnitId> {
        self.with_role(Role::Observer)
    }

    pub fn joining(&self) -> BTreeSet<UnitId> {
        self.with_role(Role::Joining)
    }

    pub fn leaving(&self) -> BTreeSet<UnitId> {
        self.with_role(Role::Leaving)
    }

    /// Members listed as participants in the dynamic config.
    pub fn participants(&self) -> BTreeSet<UnitId> {
        self.units
            .values()
            .filter(|unit| unit.role.map(|role| role.is_participant()).unwrap_or(false))
            .map(|unit| unit.id)
            .collect()
    }

    /// Units holding any role in the committed configuration.
    pub fn members(&self) -> BTreeSet<UnitId> {
        self.units
            .values()
            .filter(|unit| unit.is_member())
            .map(|unit| unit.id)
            .collect()
    }

    pub fn quorum_size(&self) -> usize {
        quorum_size(self.voters().len())
    }

    pub fn serving_voters(&self) -> usize {
        self.units
            .values()
            .filter(|unit| unit.counts_toward_quorum())
            .count()
    }

    pub fn has_quorum(&self) -> bool {
        let voters = self.voters().len();
        voters > 0 && self.serving_voters() >= quorum_size(voters)
    }

    /// The unit whose server reports leader mode, if reachable.
    pub fn leader(&self) -> Option<UnitId> {
        self.units
            .values()
            .find(|unit| unit.is_leader && unit.health.is_serving())
            .map(|unit| unit.id)
    }

    /// A membership step is in flight until joining units are promoted and
    /// leaving units dropped.
    pub fn is_transitioning(&self) -> bool {
        self.units
            .values()
            .any(|unit| matches!(unit.role, Some(Role::Joining | Role::Leaving)))
    }
}
