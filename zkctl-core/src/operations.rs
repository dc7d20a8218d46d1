//! # Rolling Operations
//!
//! Configuration changes and the rolling operations that apply them one unit
//! at a time.

use crate::{transition_preserves_quorum, ConfigVersion, OpToken, UnitId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use std::fmt;

/// What a single configuration step does to the membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChangeKind {
    /// First member of an empty ensemble
    Bootstrap,
    AddVoter,
    AddObserver,
    RemoveVoter,
    /// Voter kept as an observer
    DemoteVoter,
    RemoveObserver,
}

impl ChangeKind {
    pub fn is_addition(&self) -> bool {
        matches!(
            self,
            ChangeKind::Bootstrap | ChangeKind::AddVoter | ChangeKind::AddObserver
        )
    }
}

/// One quorum-safe membership step from `from_version` to `to_version`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigChange {
    pub kind: ChangeKind,
    pub unit: UnitId,
    pub from_version: ConfigVersion,
    pub to_version: ConfigVersion,
    /// Participants (voting members) at `from_version`
    pub voters_before: BTreeSet<UnitId>,
    /// Participants (voting members) at `to_version`
    pub voters_after: BTreeSet<UnitId>,
}

impl ConfigChange {
    /// Whether the step, applied in isolation, keeps a majority of the
    /// previous voters.
    pub fn is_quorum_safe(&self) -> bool {
        if self.to_version != self.from_version.next() {
            return false;
        }
        if self.voters_before == self.voters_after {
            return !self.voters_after.is_empty();
        }
        transition_preserves_quorum(&self.voters_before, &self.voters_after)
    }

    pub fn changes_voters(&self) -> bool {
        self.voters_before != self.voters_after
    }
}

impl fmt::Display for ConfigChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} {} ({} -> {}, voters {} -> {})",
            self.kind,
            self.unit,
            self.from_version,
            self.to_version,
            self.voters_before.len(),
            self.voters_after.len()
        )
    }
}

/// The work a rolling operation performs on each target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum OpKind {
    /// Rewrite the dynamic config and restart at the new version
    Reconfigure { change: ConfigChange },
    /// Restart with re-rendered properties
    Restart { reason: String },
    /// Activate staged TLS material of the given generation
    TlsCutover { generation: u64 },
    /// Restart the leader so that leadership moves elsewhere
    LeadershipHandoff { leader: UnitId },
    /// Restart on a new server version; a target passes once it serves on it
    Upgrade { version: String },
}

impl OpKind {
    /// Two requests with the same intent collapse into one queued op.
    pub fn same_intent(&self, other: &OpKind) -> bool {
        match (self, other) {
            (OpKind::Reconfigure { change: a }, OpKind::Reconfigure { change: b }) => {
                a.to_version == b.to_version
            }
            (OpKind::Restart { .. }, OpKind::Restart { .. }) => true,
            (OpKind::TlsCutover { generation: a }, OpKind::TlsCutover { generation: b }) => a == b,
            (
                OpKind::LeadershipHandoff { leader: a },
                OpKind::LeadershipHandoff { leader: b },
            ) => a == b,
            (OpKind::Upgrade { version: a }, OpKind::Upgrade { version: b }) => a == b,
            _ => false,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            OpKind::Reconfigure { .. } => "reconfigure",
            OpKind::Restart { .. } => "restart",
            OpKind::TlsCutover { .. } => "tls-cutover",
            OpKind::LeadershipHandoff { .. } => "leadership-handoff",
            OpKind::Upgrade { .. } => "upgrade",
        }
    }
}

/// Phase of a rolling operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpPhase {
    /// Waiting for the next target to take the lock
    Pending,
    /// The holder is rewriting config and restarting
    Applying,
    /// The holder is waiting to come back serving
    Verifying,
    Done,
    /// The current attempt failed; retried after backoff or escalated
    Failed,
}

impl fmt::Display for OpPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OpPhase::Pending => "pending",
            OpPhase::Applying => "applying",
            OpPhase::Verifying => "verifying",
            OpPhase::Done => "done",
            OpPhase::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

/// Shared lock field. At most one lease exists across the ensemble.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockLease {
    pub token: OpToken,
    pub holder: UnitId,
    pub acquired_ms: u64,
}

/// A rolling operation and its progress through the target queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollingOp {
    pub token: OpToken,
    pub kind: OpKind,
    /// Targets still to be applied, in application order
    pub queue: VecDeque<UnitId>,
    pub completed: Vec<UnitId>,
    /// Unit currently applying the op, at most one
    pub holder: Option<UnitId>,
    pub phase: OpPhase,
    /// Failed attempts on the current target
    pub attempts: u32,
    pub phase_changed_ms: u64,
    pub requested_by: UnitId,
    /// Config version a target must acknowledge to pass verification
    pub required_config_version: ConfigVersion,
    pub last_error: Option<String>,
}

impl RollingOp {
    pub fn new(
        kind: OpKind,
        targets: impl IntoIterator<Item = UnitId>,
        requested_by: UnitId,
        required_config_version: ConfigVersion,
        now_ms: u64,
    ) -> Self {
        Self {
            token: OpToken::new(),
            kind,
            queue: targets.into_iter().collect(),
            completed: Vec::new(),
            holder: None,
            phase: OpPhase::Pending,
            attempts: 0,
            phase_changed_ms: now_ms,
            requested_by,
            required_config_version,
            last_error: None,
        }
    }

    pub fn next_target(&self) -> Option<UnitId> {
        self.queue.front().copied()
    }

    pub fn targets(&self) -> impl Iterator<Item = &UnitId> {
        self.completed.iter().chain(self.queue.iter())
    }

    pub fn touches(&self, unit: UnitId) -> bool {
        self.queue.contains(&unit) || self.holder == Some(unit)
    }

    pub fn set_phase(&mut self, phase: OpPhase, now_ms: u64) {
        self.phase = phase;
        self.phase_changed_ms = now_ms;
    }

    pub fn is_finished(&self) -> bool {
        self.queue.is_empty() && self.holder.is_none()
    }
}
