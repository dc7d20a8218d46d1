//! Operator-visible unit status.

use crate::provider::ServiceEndpoint;
use crate::rolling::StepOutcome;
use serde::{Deserialize, Serialize};
use std::fmt;
use zkctl_core::{ConfigVersion, PeerState, Role, UnitId};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "message", rename_all = "lowercase")]
pub enum UnitStatus {
    #[default]
    Active,
    /// A rolling operation is in flight
    Maintenance(String),
    /// Progress depends on other units or the platform
    Waiting(String),
    /// Operator intervention required
    Blocked(String),
}

impl UnitStatus {
    pub fn is_blocked(&self) -> bool {
        matches!(self, UnitStatus::Blocked(_))
    }

    pub fn message(&self) -> &str {
        match self {
            UnitStatus::Active => "",
            UnitStatus::Maintenance(message)
            | UnitStatus::Waiting(message)
            | UnitStatus::Blocked(message) => message,
        }
    }
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitStatus::Active => write!(f, "active"),
            UnitStatus::Maintenance(message) => write!(f, "maintenance: {}", message),
            UnitStatus::Waiting(message) => write!(f, "waiting: {}", message),
            UnitStatus::Blocked(message) => write!(f, "blocked: {}", message),
        }
    }
}

/// Conditions noticed during a pass that the shared state does not show.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassNotes {
    pub blocked: Option<String>,
    pub waiting: Option<String>,
}

impl PassNotes {
    pub fn block(&mut self, reason: impl Into<String>) {
        self.blocked.get_or_insert_with(|| reason.into());
    }

    pub fn wait(&mut self, reason: impl Into<String>) {
        self.waiting.get_or_insert_with(|| reason.into());
    }
}

/// Status of `local` given the shared state after a pass.
pub fn assess(state: &PeerState, local: UnitId, notes: &PassNotes) -> UnitStatus {
    let ensemble = &state.ensemble;

    if let Some(fatal) = &ensemble.fatal {
        return UnitStatus::Blocked(format!(
            "{}; resolve and release op {}",
            fatal.reason, fatal.token
        ));
    }
    if let Some(reason) = &notes.blocked {
        return UnitStatus::Blocked(reason.clone());
    }
    if let Some(op) = ensemble.head_op() {
        let holder = op
            .holder
            .map(|unit| format!(" on {}", unit))
            .unwrap_or_default();
        return UnitStatus::Maintenance(format!(
            "{} {}{} ({} of {} units done)",
            op.kind.name(),
            op.phase,
            holder,
            op.completed.len(),
            op.completed.len() + op.queue.len()
        ));
    }
    if let Some(reason) = &notes.waiting {
        return UnitStatus::Waiting(reason.clone());
    }
    match ensemble.members.get(&local) {
        None => UnitStatus::Waiting("waiting to join the ensemble".to_string()),
        Some(Role::Leaving) => UnitStatus::Waiting("leaving the ensemble".to_string()),
        Some(_) => UnitStatus::Active,
    }
}

/// Snapshot of a controller for operators and tests.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ControllerStatus {
    pub unit: Option<UnitId>,
    pub status: UnitStatus,
    pub config_version: ConfigVersion,
    pub is_planner: bool,
    pub last_step: Option<StepOutcome>,
    pub endpoint: Option<ServiceEndpoint>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use zkctl_core::{FatalCondition, OpKind, OpToken, RollingOp};

    fn member_state() -> PeerState {
        let mut state = PeerState::default();
        state.ensemble.members.insert(UnitId::new(0), Role::Voter);
        state
    }

    #[test]
    fn test_precedence() {
        let local = UnitId::new(0);
        let mut state = member_state();
        let mut notes = PassNotes::default();
        assert_eq!(assess(&state, local, &notes), UnitStatus::Active);

        notes.wait("quorum unavailable");
        assert_eq!(
            assess(&state, local, &notes),
            UnitStatus::Waiting("quorum unavailable".to_string())
        );

        state.ensemble.ops.push_back(RollingOp::new(
            OpKind::Restart {
                reason: "tick-time".to_string(),
            },
            [local],
            local,
            Default::default(),
            0,
        ));
        assert!(matches!(assess(&state, local, &notes), UnitStatus::Maintenance(_)));

        state.ensemble.fatal = Some(FatalCondition {
            token: OpToken::new(),
            reason: "retries exhausted".to_string(),
            since_ms: 0,
        });
        assert!(assess(&state, local, &notes).is_blocked());
    }

    #[test]
    fn test_non_member_waits() {
        let status = assess(&PeerState::default(), UnitId::new(3), &PassNotes::default());
        assert_eq!(status.message(), "waiting to join the ensemble");
    }
}
