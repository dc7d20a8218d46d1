//! Observed ensemble derived from the shared peer state.

use std::time::Duration;
use zkctl_core::{Ensemble, HealthStatus, PeerState, Unit, UnitId};

/// Reconstructs the ensemble as seen from one unit.
///
/// Pure: reads the peer state, never writes it, and never fails. Units
/// without a record show up with `Unknown` health and do not count toward
/// quorum until their first heartbeat.
#[derive(Debug, Clone)]
pub struct ClusterView {
    local: UnitId,
    unreachable_after: Duration,
}

impl ClusterView {
    pub fn new(local: UnitId, unreachable_after: Duration) -> Self {
        Self {
            local,
            unreachable_after,
        }
    }

    pub fn local(&self) -> UnitId {
        self.local
    }

    pub fn observe(&self, state: &PeerState, now_ms: u64) -> Ensemble {
        let record = &state.ensemble;
        let mut ensemble = Ensemble::new(self.local, record.config_version);
        let unreachable_after_ms = self.unreachable_after.as_millis() as u64;

        let ids = state
            .units
            .keys()
            .chain(record.members.keys())
            .copied()
            .collect::<std::collections::BTreeSet<_>>();

        for id in ids {
            let mut unit = Unit::new(id);
            unit.role = record.members.get(&id).copied();

            if let Some(peer) = state.units.get(&id) {
                unit.address = peer.address.clone();
                unit.acked_config_version = peer.acked_config_version;
                unit.joined_at_ms = peer.joined_at_ms;
                unit.last_heartbeat_ms = peer.heartbeat_ms;
                unit.tls_generation = peer.tls_generation;

                match peer.heartbeat_ms {
                    None => unit.health = HealthStatus::Unknown,
                    Some(heartbeat) if now_ms.saturating_sub(heartbeat) > unreachable_after_ms => {
                        unit.health = HealthStatus::Unreachable;
                    }
                    Some(_) => {
                        unit.reporting = true;
                        unit.health = peer.health;
                        unit.is_leader = peer.is_leader && peer.health.is_serving();
                    }
                }
            }

            ensemble.insert(unit);
        }

        ensemble
    }

    /// The unit that plans ensemble-wide changes this pass.
    ///
    /// Lowest-ordinal serving member, else the lowest-ordinal reporting
    /// unit, else the local unit. Two units may briefly disagree; their
    /// conflicting writes are resolved by compare-and-write.
    pub fn planner(&self, ensemble: &Ensemble) -> UnitId {
        ensemble
            .units
            .values()
            .find(|unit| unit.is_member() && unit.reporting && unit.health.is_serving())
            .or_else(|| ensemble.units.values().find(|unit| unit.reporting))
            .map(|unit| unit.id)
            .unwrap_or(self.local)
    }

    pub fn is_planner(&self, ensemble: &Ensemble) -> bool {
        self.planner(ensemble) == self.local
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zkctl_core::{ConfigVersion, Role, UnitRecord};

    fn record(health: HealthStatus, heartbeat_ms: Option<u64>) -> UnitRecord {
        UnitRecord {
            address: Some("zk".to_string()),
            health,
            heartbeat_ms,
            is_leader: true,
            ..UnitRecord::default()
        }
    }

    #[test]
    fn test_partial_data_is_tolerated() {
        let mut state = PeerState::default();
        state.ensemble.config_version = ConfigVersion::new(3);
        state.ensemble.members.insert(UnitId::new(0), Role::Voter);
        state.ensemble.members.insert(UnitId::new(1), Role::Voter);
        state.ensemble.members.insert(UnitId::new(2), Role::Voter);
        state
            .units
            .insert(UnitId::new(0), record(HealthStatus::Serving, Some(1_000)));
        state
            .units
            .insert(UnitId::new(1), record(HealthStatus::Serving, None));

        let view = ClusterView::new(UnitId::new(0), Duration::from_secs(30));
        let ensemble = view.observe(&state, 2_000);

        assert_eq!(ensemble.config_version, ConfigVersion::new(3));
        assert_eq!(ensemble.units.len(), 3);
        assert_eq!(ensemble.unit(UnitId::new(1)).unwrap().health, HealthStatus::Unknown);
        assert_eq!(ensemble.unit(UnitId::new(2)).unwrap().health, HealthStatus::Unknown);
        assert_eq!(ensemble.serving_voters(), 1);
        assert!(!ensemble.has_quorum());
    }

    #[test]
    fn test_stale_heartbeat_is_unreachable() {
        let mut state = PeerState::default();
        state.ensemble.members.insert(UnitId::new(0), Role::Voter);
        state
            .units
            .insert(UnitId::new(0), record(HealthStatus::Serving, Some(0)));

        let view = ClusterView::new(UnitId::new(1), Duration::from_secs(30));
        let fresh = view.observe(&state, 30_000);
        assert_eq!(fresh.leader(), Some(UnitId::new(0)));

        let stale = view.observe(&state, 30_001);
        let unit = stale.unit(UnitId::new(0)).unwrap();
        assert_eq!(unit.health, HealthStatus::Unreachable);
        assert!(!unit.reporting);
        assert_eq!(stale.leader(), None);
    }

    #[test]
    fn test_planner_selection() {
        let mut state = PeerState::default();
        state
            .units
            .insert(UnitId::new(2), record(HealthStatus::Syncing, Some(100)));
        state
            .units
            .insert(UnitId::new(4), record(HealthStatus::Syncing, Some(100)));

        let view = ClusterView::new(UnitId::new(4), Duration::from_secs(30));
        assert_eq!(view.planner(&view.observe(&state, 100)), UnitId::new(2));

        state.ensemble.members.insert(UnitId::new(4), Role::Voter);
        state.unit_mut(UnitId::new(4)).health = HealthStatus::Serving;
        assert!(view.is_planner(&view.observe(&state, 100)));

        let lonely = ClusterView::new(UnitId::new(7), Duration::from_secs(30));
        assert_eq!(lonely.planner(&lonely.observe(&PeerState::default(), 0)), UnitId::new(7));
    }
}
