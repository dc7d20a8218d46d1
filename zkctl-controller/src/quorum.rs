//! Quorum-safe membership planning.
//!
//! The planner turns the difference between the observed and the desired
//! membership into at most one configuration step per pass. Every returned
//! step keeps a majority of the previous voters.

use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;
use zkctl_core::{
    quorum_size, transition_preserves_quorum, ChangeKind, ConfigChange, ControllerError,
    Ensemble, Result, Role, UnitId,
};

/// Membership the platform asks for.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DesiredMembership {
    pub voters: BTreeSet<UnitId>,
    pub observers: BTreeSet<UnitId>,
}

impl DesiredMembership {
    pub fn voters(ids: impl IntoIterator<Item = u32>) -> Self {
        Self {
            voters: ids.into_iter().map(UnitId::new).collect(),
            observers: BTreeSet::new(),
        }
    }

    pub fn with_observers(mut self, ids: impl IntoIterator<Item = u32>) -> Self {
        self.observers = ids.into_iter().map(UnitId::new).collect();
        self
    }

    /// Observers that are not also requested as voters.
    pub fn effective_observers(&self) -> BTreeSet<UnitId> {
        self.observers.difference(&self.voters).copied().collect()
    }

    pub fn remove(&mut self, unit: UnitId) -> bool {
        let voter = self.voters.remove(&unit);
        let observer = self.observers.remove(&unit);
        voter || observer
    }

    pub fn contains(&self, unit: UnitId) -> bool {
        self.voters.contains(&unit) || self.observers.contains(&unit)
    }
}

/// Result of one planning pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Plan {
    NoOp,
    Change(ConfigChange),
    /// Restart the leader first; the removal is planned on a later pass
    HandOffLeadership { leader: UnitId },
    /// A change is wanted but cannot be planned yet
    Defer { reason: String },
}

impl Plan {
    fn defer(reason: impl Into<String>) -> Self {
        Plan::Defer {
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct QuorumConfigBuilder;

impl QuorumConfigBuilder {
    pub fn new() -> Self {
        Self
    }

    /// Plan the next membership step.
    ///
    /// Additions come before removals, voters before observers, and removals
    /// take one member per step. Returns `QuorumRisk` when the only possible
    /// next step would lose the majority of the current voters.
    pub fn plan(&self, observed: &Ensemble, desired: &DesiredMembership) -> Result<Plan> {
        let voters = observed.participants();
        let observers = observed.observers();
        let members = observed.members();
        let desired_observers = desired.effective_observers();

        let add_voters: BTreeSet<UnitId> = desired.voters.difference(&voters).copied().collect();
        let remove_voters: BTreeSet<UnitId> =
            voters.difference(&desired.voters).copied().collect();
        let add_observers: BTreeSet<UnitId> = desired_observers
            .iter()
            .filter(|id| !members.contains(id))
            .copied()
            .collect();
        let remove_observers: BTreeSet<UnitId> = observers
            .iter()
            .filter(|id| !desired.contains(**id))
            .copied()
            .collect();

        if add_voters.is_empty()
            && remove_voters.is_empty()
            && add_observers.is_empty()
            && remove_observers.is_empty()
        {
            return Ok(Plan::NoOp);
        }

        if observed.is_transitioning() {
            return Ok(Plan::defer("a membership step is still in flight"));
        }

        let reporting = |id: &&UnitId| {
            observed
                .unit(**id)
                .map(|unit| unit.reporting)
                .unwrap_or(false)
        };

        if voters.is_empty() {
            return Ok(match add_voters.iter().find(reporting) {
                Some(&first) => Plan::Change(self.change(
                    observed,
                    ChangeKind::Bootstrap,
                    first,
                    &voters,
                    BTreeSet::from([first]),
                )),
                None => Plan::defer("waiting for a unit to report before bootstrapping"),
            });
        }

        if !observed.has_quorum() {
            return Ok(Plan::defer(format!(
                "quorum unavailable: {} of {} voters serving",
                observed.serving_voters(),
                voters.len()
            )));
        }

        if !add_voters.is_empty() {
            return Ok(match add_voters.iter().find(reporting) {
                Some(&unit) => {
                    let mut after = voters.clone();
                    after.insert(unit);
                    Plan::Change(self.change(observed, ChangeKind::AddVoter, unit, &voters, after))
                }
                None => Plan::defer(format!(
                    "waiting for {} to report before adding",
                    join_ids(&add_voters)
                )),
            });
        }

        if !add_observers.is_empty() {
            return Ok(match add_observers.iter().find(reporting) {
                Some(&unit) => Plan::Change(self.change(
                    observed,
                    ChangeKind::AddObserver,
                    unit,
                    &voters,
                    voters.clone(),
                )),
                None => Plan::defer(format!(
                    "waiting for {} to report before adding",
                    join_ids(&add_observers)
                )),
            });
        }

        if let Some(unit) = self.removal_candidate(observed, &remove_voters) {
            let mut after = voters.clone();
            after.remove(&unit);

            if !transition_preserves_quorum(&voters, &after) {
                return Err(ControllerError::quorum_risk(format!(
                    "removing {} would leave {} of {} voters, below the quorum of {}",
                    unit,
                    after.len(),
                    voters.len(),
                    quorum_size(voters.len())
                )));
            }

            if observed.leader() == Some(unit)
                && quorum_size(after.len()) < quorum_size(voters.len())
            {
                debug!(
                    "Removal of leader {} would shrink the quorum; handing off leadership first",
                    unit
                );
                return Ok(Plan::HandOffLeadership { leader: unit });
            }

            let kind = if desired_observers.contains(&unit) {
                ChangeKind::DemoteVoter
            } else {
                ChangeKind::RemoveVoter
            };
            return Ok(Plan::Change(self.change(observed, kind, unit, &voters, after)));
        }

        if let Some(&unit) = remove_observers.iter().next_back() {
            return Ok(Plan::Change(self.change(
                observed,
                ChangeKind::RemoveObserver,
                unit,
                &voters,
                voters.clone(),
            )));
        }

        Ok(Plan::NoOp)
    }

    /// Most recently joined non-leader first; the leader only when nothing
    /// else is left.
    fn removal_candidate(&self, observed: &Ensemble, candidates: &BTreeSet<UnitId>) -> Option<UnitId> {
        let leader = observed.leader();
        candidates
            .iter()
            .copied()
            .max_by_key(|id| {
                let joined = observed.unit(*id).map(|unit| unit.joined_at_ms).unwrap_or(0);
                (leader != Some(*id), joined, id.ordinal())
            })
    }

    fn change(
        &self,
        observed: &Ensemble,
        kind: ChangeKind,
        unit: UnitId,
        before: &BTreeSet<UnitId>,
        after: BTreeSet<UnitId>,
    ) -> ConfigChange {
        ConfigChange {
            kind,
            unit,
            from_version: observed.config_version,
            to_version: observed.config_version.next(),
            voters_before: before.clone(),
            voters_after: after,
        }
    }

    /// Membership committed by `change`, before its rollout completes.
    pub fn apply(
        &self,
        members: &BTreeMap<UnitId, Role>,
        change: &ConfigChange,
    ) -> BTreeMap<UnitId, Role> {
        let mut next = members.clone();
        let role = match change.kind {
            ChangeKind::Bootstrap | ChangeKind::AddVoter => Role::Joining,
            ChangeKind::AddObserver | ChangeKind::DemoteVoter => Role::Observer,
            ChangeKind::RemoveVoter | ChangeKind::RemoveObserver => Role::Leaving,
        };
        next.insert(change.unit, role);
        next
    }

    /// Membership once the rollout of a change has completed.
    pub fn settle(&self, members: &BTreeMap<UnitId, Role>) -> BTreeMap<UnitId, Role> {
        members
            .iter()
            .filter(|(_, role)| **role != Role::Leaving)
            .map(|(id, role)| {
                let role = if *role == Role::Joining {
                    Role::Voter
                } else {
                    *role
                };
                (*id, role)
            })
            .collect()
    }
}

fn join_ids(ids: &BTreeSet<UnitId>) -> String {
    ids.iter()
        .map(UnitId::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use zkctl_core::{ConfigVersion, HealthStatus, Unit};

    fn ensemble(members: &[(u32, Role)], leader: Option<u32>, extra: &[u32]) -> Ensemble {
        let mut ensemble = Ensemble::new(UnitId::new(0), ConfigVersion::new(10));
        for &(id, role) in members {
            ensemble.insert(Unit {
                role: Some(role),
                health: HealthStatus::Serving,
                reporting: true,
                is_leader: leader == Some(id),
                joined_at_ms: id as u64 * 100,
                last_heartbeat_ms: Some(0),
                ..Unit::new(UnitId::new(id))
            });
        }
        for &id in extra {
            ensemble.insert(Unit {
                reporting: true,
                health: HealthStatus::Unreachable,
                last_heartbeat_ms: Some(0),
                joined_at_ms: id as u64 * 100,
                ..Unit::new(UnitId::new(id))
            });
        }
        ensemble
    }

    fn voters(ids: &[u32]) -> Vec<(u32, Role)> {
        ids.iter().map(|&id| (id, Role::Voter)).collect()
    }

    fn expect_change(plan: Plan) -> ConfigChange {
        match plan {
            Plan::Change(change) => change,
            other => panic!("expected a change, got {:?}", other),
        }
    }

    #[test]
    fn test_converged_membership_is_noop() {
        let observed = ensemble(&voters(&[0, 1, 2]), Some(0), &[]);
        let plan = QuorumConfigBuilder::new()
            .plan(&observed, &DesiredMembership::voters([0, 1, 2]))
            .unwrap();
        assert_eq!(plan, Plan::NoOp);
    }

    #[test]
    fn test_scale_up_adds_one_member() {
        let observed = ensemble(&voters(&[0, 1, 2]), Some(0), &[3, 4]);
        let change = expect_change(
            QuorumConfigBuilder::new()
                .plan(&observed, &DesiredMembership::voters(0..5))
                .unwrap(),
        );

        assert_eq!(change.kind, ChangeKind::AddVoter);
        assert_eq!(change.unit, UnitId::new(3));
        assert_eq!(change.voters_after.len(), 4);
        assert_eq!(change.to_version, ConfigVersion::new(11));
        assert!(change.is_quorum_safe());
    }

    #[test]
    fn test_additions_before_removals() {
        let observed = ensemble(&voters(&[0, 1, 2]), Some(0), &[3]);
        let change = expect_change(
            QuorumConfigBuilder::new()
                .plan(&observed, &DesiredMembership::voters([0, 1, 3]))
                .unwrap(),
        );
        assert_eq!(change.kind, ChangeKind::AddVoter);
        assert_eq!(change.unit, UnitId::new(3));
    }

    #[test]
    fn test_defers_while_joining() {
        let mut members = voters(&[0, 1, 2]);
        members.push((3, Role::Joining));
        let observed = ensemble(&members, Some(0), &[4]);
        let plan = QuorumConfigBuilder::new()
            .plan(&observed, &DesiredMembership::voters(0..5))
            .unwrap();
        assert!(matches!(plan, Plan::Defer { .. }));
    }

    #[test]
    fn test_unreported_units_are_not_added() {
        let mut observed = ensemble(&voters(&[0, 1, 2]), Some(0), &[]);
        observed.insert(Unit::new(UnitId::new(3)));
        let plan = QuorumConfigBuilder::new()
            .plan(&observed, &DesiredMembership::voters(0..4))
            .unwrap();
        assert!(matches!(plan, Plan::Defer { .. }));
    }

    #[test]
    fn test_removal_prefers_most_recent_non_leader() {
        let observed = ensemble(&voters(&[0, 1, 2, 3, 4]), Some(4), &[]);
        let change = expect_change(
            QuorumConfigBuilder::new()
                .plan(&observed, &DesiredMembership::voters([0, 1]))
                .unwrap(),
        );
        assert_eq!(change.kind, ChangeKind::RemoveVoter);
        assert_eq!(change.unit, UnitId::new(3));
        assert_eq!(change.voters_after.len(), 4);
    }

    #[test]
    fn test_leader_removal_that_shrinks_quorum_hands_off() {
        let observed = ensemble(&voters(&[0, 1, 2, 3]), Some(3), &[]);
        let plan = QuorumConfigBuilder::new()
            .plan(&observed, &DesiredMembership::voters([0, 1, 2]))
            .unwrap();
        assert_eq!(
            plan,
            Plan::HandOffLeadership {
                leader: UnitId::new(3)
            }
        );

        // Same quorum size after removal: the leader can go directly
        let observed = ensemble(&voters(&[0, 1, 2, 3, 4]), Some(4), &[]);
        let change = expect_change(
            QuorumConfigBuilder::new()
                .plan(&observed, &DesiredMembership::voters(0..4))
                .unwrap(),
        );
        assert_eq!(change.unit, UnitId::new(4));
    }

    #[test]
    fn test_unsafe_removal_is_rejected() {
        let observed = ensemble(&voters(&[0, 1]), Some(0), &[]);
        let err = QuorumConfigBuilder::new()
            .plan(&observed, &DesiredMembership::voters([0]))
            .unwrap_err();
        assert!(matches!(err, ControllerError::QuorumRisk { .. }));
    }

    #[test]
    fn test_bootstrap_picks_lowest_reporting_unit() {
        let observed = ensemble(&[], None, &[2, 1]);
        let change = expect_change(
            QuorumConfigBuilder::new()
                .plan(&observed, &DesiredMembership::voters([1, 2]))
                .unwrap(),
        );
        assert_eq!(change.kind, ChangeKind::Bootstrap);
        assert_eq!(change.unit, UnitId::new(1));
        assert!(change.is_quorum_safe());
    }

    #[test]
    fn test_observer_changes() {
        let builder = QuorumConfigBuilder::new();
        let observed = ensemble(&voters(&[0, 1, 2]), Some(0), &[5]);
        let change = expect_change(
            builder
                .plan(
                    &observed,
                    &DesiredMembership::voters([0, 1, 2]).with_observers([5]),
                )
                .unwrap(),
        );
        assert_eq!(change.kind, ChangeKind::AddObserver);
        assert_eq!(change.voters_before, change.voters_after);

        let members = builder.apply(&BTreeMap::new(), &change);
        assert_eq!(members.get(&UnitId::new(5)), Some(&Role::Observer));

        let mut with_observer = voters(&[0, 1, 2]);
        with_observer.push((5, Role::Observer));
        let observed = ensemble(&with_observer, Some(0), &[]);
        let change = expect_change(
            builder
                .plan(&observed, &DesiredMembership::voters([0, 1, 2]))
                .unwrap(),
        );
        assert_eq!(change.kind, ChangeKind::RemoveObserver);
    }

    #[test]
    fn test_settle_promotes_and_drops() {
        let builder = QuorumConfigBuilder::new();
        let mut members = BTreeMap::new();
        members.insert(UnitId::new(0), Role::Voter);
        members.insert(UnitId::new(1), Role::Joining);
        members.insert(UnitId::new(2), Role::Leaving);

        let settled = builder.settle(&members);
        assert_eq!(settled.get(&UnitId::new(1)), Some(&Role::Voter));
        assert!(!settled.contains_key(&UnitId::new(2)));
    }

    /// Drive the planner to convergence, settling each step as if its
    /// rollout finished, and collect every committed voter set.
    fn converge(
        start: &[u32],
        desired: &DesiredMembership,
        pool: u32,
    ) -> (Vec<BTreeSet<UnitId>>, bool) {
        let builder = QuorumConfigBuilder::new();
        let mut members: BTreeMap<UnitId, Role> =
            start.iter().map(|&id| (UnitId::new(id), Role::Voter)).collect();
        let mut version = ConfigVersion::new(1);
        let mut leader = start.first().copied();
        let mut history = vec![members.keys().copied().collect::<BTreeSet<_>>()];

        for _ in 0..64 {
            let mut observed = Ensemble::new(UnitId::new(0), version);
            for id in 0..pool {
                let role = members.get(&UnitId::new(id)).copied();
                observed.insert(Unit {
                    role,
                    health: HealthStatus::Serving,
                    reporting: true,
                    is_leader: leader == Some(id),
                    joined_at_ms: id as u64,
                    last_heartbeat_ms: Some(0),
                    ..Unit::new(UnitId::new(id))
                });
            }

            match builder.plan(&observed, desired) {
                Ok(Plan::Change(change)) => {
                    assert!(change.is_quorum_safe(), "unsafe step {}", change);
                    members = builder.settle(&builder.apply(&members, &change));
                    version = change.to_version;
                    history.push(change.voters_after.clone());
                    if leader.map(|id| !members.contains_key(&UnitId::new(id))).unwrap_or(true) {
                        leader = members.keys().next().map(|id| id.ordinal());
                    }
                }
                Ok(Plan::HandOffLeadership { leader: current }) => {
                    leader = members
                        .iter()
                        .find(|(id, role)| **id != current && **role == Role::Voter)
                        .map(|(id, _)| id.ordinal());
                }
                Ok(Plan::NoOp) => return (history, true),
                Ok(Plan::Defer { reason }) => panic!("unexpected deferral: {}", reason),
                Err(_) => return (history, false),
            }
        }
        (history, false)
    }

    #[test]
    fn test_five_to_three_steps_one_at_a_time() {
        let (history, converged) =
            converge(&[0, 1, 2, 3, 4], &DesiredMembership::voters([0, 1, 2]), 5);
        assert!(converged);
        let sizes: Vec<usize> = history.iter().map(BTreeSet::len).collect();
        assert_eq!(sizes, vec![5, 4, 3]);
    }

    proptest! {
        #[test]
        fn prop_consecutive_voter_sets_overlap(
            start in proptest::collection::btree_set(0u32..7, 1..7),
            target in proptest::collection::btree_set(0u32..7, 1..7),
        ) {
            let start: Vec<u32> = start.into_iter().collect();
            let desired = DesiredMembership::voters(target.iter().copied());
            let (history, converged) = converge(&start, &desired, 7);

            for pair in history.windows(2) {
                prop_assert!(pair[0].intersection(&pair[1]).next().is_some());
                prop_assert!(transition_preserves_quorum(&pair[0], &pair[1]));
                let added = pair[1].difference(&pair[0]).count();
                let removed = pair[0].difference(&pair[1]).count();
                prop_assert!(added + removed <= 1);
            }

            if converged {
                let last = history.last().cloned().unwrap_or_default();
                prop_assert_eq!(last, desired.voters.clone());
            }
        }
    }
}
