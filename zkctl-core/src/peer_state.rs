//! # Peer State
//!
//! The single shared, versioned blob every unit reads and writes.
//!
//! Writes are conditional on the version previously read. A writer that
//! loses the race re-reads on its next pass; nothing in this module blocks.

use crate::operations::{LockLease, RollingOp};
use crate::{
    Certificate, ConfigVersion, ControllerError, Credential, CredentialEpoch, HealthStatus,
    OpToken, RequestId, Result, Role, TlsState, UnitId,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// Number of committed configurations kept for auditing.
pub const CONFIG_HISTORY_LIMIT: usize = 64;

/// Outstanding signing request of one unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateRequest {
    pub request_id: RequestId,
    pub generation: u64,
    pub submitted_ms: u64,
    /// Key the request was signed with, PEM
    pub private_key: String,
}

/// TLS material owned by one unit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitTlsRecord {
    /// Operator-provided or generated key, PEM
    pub private_key: Option<String>,
    pub request: Option<CertificateRequest>,
    /// Signed but not yet serving
    pub staged: Option<Certificate>,
    /// Material the server currently runs with
    pub active: Option<Certificate>,
}

impl UnitTlsRecord {
    pub fn staged_generation(&self) -> Option<u64> {
        self.staged.as_ref().map(|cert| cert.generation)
    }
}

/// Record written by a unit about itself.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnitRecord {
    pub address: Option<String>,
    pub health: HealthStatus,
    pub is_leader: bool,
    pub acked_config_version: ConfigVersion,
    /// Credential epoch installed locally, per username
    pub acked_credentials: BTreeMap<String, CredentialEpoch>,
    /// TLS generation the server runs with
    pub tls_generation: u64,
    pub tls: UnitTlsRecord,
    pub joined_at_ms: u64,
    pub heartbeat_ms: Option<u64>,
    /// Server version verified by the last upgrade applied here
    pub version: Option<String>,
}

impl UnitRecord {
    pub fn acked_epoch(&self, username: &str) -> CredentialEpoch {
        self.acked_credentials
            .get(username)
            .copied()
            .unwrap_or_default()
    }
}

/// Participants committed at one config version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    pub version: ConfigVersion,
    pub voters: BTreeSet<UnitId>,
}

/// Server properties that require a rolling restart when changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSettings {
    pub init_limit: u32,
    pub sync_limit: u32,
    pub tick_time: u32,
}

impl From<&crate::ControllerConfig> for ServerSettings {
    fn from(config: &crate::ControllerConfig) -> Self {
        Self {
            init_limit: config.init_limit,
            sync_limit: config.sync_limit,
            tick_time: config.tick_time,
        }
    }
}

/// Ensemble-wide TLS record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsRecord {
    pub enabled: bool,
    pub state: TlsState,
    /// Generation units are converging on
    pub generation: u64,
    /// Generation every unit has cut over to
    pub active_generation: u64,
    /// CA of the active generation, kept in the trust bundle during cutover
    pub active_ca: Option<String>,
}

impl TlsRecord {
    pub fn is_converged(&self) -> bool {
        self.generation == self.active_generation
    }
}

/// Escalated failure that needs an operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FatalCondition {
    pub token: OpToken,
    pub reason: String,
    pub since_ms: u64,
}

/// Ensemble-wide fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnsembleRecord {
    pub config_version: ConfigVersion,
    /// Committed membership at `config_version`
    pub members: BTreeMap<UnitId, Role>,
    pub config_history: Vec<ConfigSnapshot>,
    pub settings: Option<ServerSettings>,
    /// Rolling operations in request order; only the head is applied
    pub ops: VecDeque<RollingOp>,
    pub lock: Option<LockLease>,
    pub fatal: Option<FatalCondition>,
    pub credentials: BTreeMap<String, Credential>,
    pub tls: TlsRecord,
    /// Server version every member was last upgraded to
    pub version: Option<String>,
}

impl EnsembleRecord {
    pub fn voters(&self) -> BTreeSet<UnitId> {
        self.members
            .iter()
            .filter(|(_, role)| role.is_participant())
            .map(|(id, _)| *id)
            .collect()
    }

    /// Commit a new membership and record it in the history.
    pub fn commit_members(&mut self, version: ConfigVersion, members: BTreeMap<UnitId, Role>) {
        self.config_version = version;
        self.members = members;
        let voters = self.voters();
        self.config_history.push(ConfigSnapshot { version, voters });
        if self.config_history.len() > CONFIG_HISTORY_LIMIT {
            let excess = self.config_history.len() - CONFIG_HISTORY_LIMIT;
            self.config_history.drain(..excess);
        }
    }

    pub fn op(&self, token: OpToken) -> Option<&RollingOp> {
        self.ops.iter().find(|op| op.token == token)
    }

    pub fn op_mut(&mut self, token: OpToken) -> Option<&mut RollingOp> {
        self.ops.iter_mut().find(|op| op.token == token)
    }

    pub fn head_op(&self) -> Option<&RollingOp> {
        self.ops.front()
    }
}

/// The shared blob.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PeerState {
    pub units: BTreeMap<UnitId, UnitRecord>,
    pub ensemble: EnsembleRecord,
}

impl PeerState {
    pub fn unit(&self, id: UnitId) -> Option<&UnitRecord> {
        self.units.get(&id)
    }

    pub fn unit_mut(&mut self, id: UnitId) -> &mut UnitRecord {
        self.units.entry(id).or_default()
    }
}

/// A read of the shared blob together with the version it was read at.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub version: u64,
    pub state: PeerState,
}

/// Result of a conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    Written { version: u64 },
    /// Another writer got there first
    Conflict { actual: u64 },
}

impl CasOutcome {
    pub fn is_written(&self) -> bool {
        matches!(self, CasOutcome::Written { .. })
    }
}

/// Versioned key-value store holding the peer state.
///
/// `compare_and_write` succeeds only if the stored version still equals
/// `expected`; the version then advances by one.
#[async_trait]
pub trait PeerStateStore: Send + Sync {
    async fn read(&self) -> Result<Snapshot>;

    async fn compare_and_write(&self, expected: u64, state: &PeerState) -> Result<CasOutcome>;
}

/// Outcome of [`mutate`].
#[derive(Debug)]
pub enum Mutation<T> {
    /// The closure left the state untouched; nothing was written
    Unchanged(T),
    Written(Snapshot, T),
    Conflict { expected: u64, actual: u64 },
}

impl<T> Mutation<T> {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Mutation::Conflict { .. })
    }

    pub fn into_contention(self) -> Result<(Option<Snapshot>, T)> {
        match self {
            Mutation::Unchanged(value) => Ok((None, value)),
            Mutation::Written(snapshot, value) => Ok((Some(snapshot), value)),
            Mutation::Conflict { expected, actual } => {
                Err(ControllerError::LockContention { expected, actual })
            }
        }
    }
}

/// Apply `change` to a copy of `snapshot` and write it back conditionally.
///
/// A closure that produces an identical state results in no write, so
/// replaying a pass with no new input performs no mutation.
pub async fn mutate<S, F, T>(store: &S, snapshot: &Snapshot, change: F) -> Result<Mutation<T>>
where
    S: PeerStateStore + ?Sized,
    F: FnOnce(&mut PeerState) -> T,
{
    let mut next = snapshot.state.clone();
    let value = change(&mut next);
    if next == snapshot.state {
        return Ok(Mutation::Unchanged(value));
    }

    match store.compare_and_write(snapshot.version, &next).await? {
        CasOutcome::Written { version } => Ok(Mutation::Written(
            Snapshot {
                version,
                state: next,
            },
            value,
        )),
        CasOutcome::Conflict { actual } => Ok(Mutation::Conflict {
            expected: snapshot.version,
            actual,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct CountingStore {
        inner: Mutex<Snapshot>,
        writes: Mutex<u32>,
    }

    #[async_trait]
    impl PeerStateStore for CountingStore {
        async fn read(&self) -> Result<Snapshot> {
            Ok(self.inner.lock().clone())
        }

        async fn compare_and_write(&self, expected: u64, state: &PeerState) -> Result<CasOutcome> {
            let mut inner = self.inner.lock();
            if inner.version != expected {
                return Ok(CasOutcome::Conflict {
                    actual: inner.version,
                });
            }
            inner.version += 1;
            inner.state = state.clone();
            *self.writes.lock() += 1;
            Ok(CasOutcome::Written {
                version: inner.version,
            })
        }
    }

    #[tokio::test]
    async fn test_unchanged_state_is_not_written() {
        let store = CountingStore::default();
        let snapshot = store.read().await.unwrap();

        let result = mutate(&store, &snapshot, |_| 7).await.unwrap();
        assert!(matches!(result, Mutation::Unchanged(7)));
        assert_eq!(*store.writes.lock(), 0);
    }

    #[tokio::test]
    async fn test_stale_snapshot_conflicts() {
        let store = CountingStore::default();
        let stale = store.read().await.unwrap();

        let written = mutate(&store, &stale, |state| {
            state.unit_mut(UnitId::new(0)).address = Some("10.0.0.1".to_string());
        })
        .await
        .unwrap();
        assert!(matches!(written, Mutation::Written(ref s, ()) if s.version == 1));

        let lost = mutate(&store, &stale, |state| {
            state.unit_mut(UnitId::new(1)).address = Some("10.0.0.2".to_string());
        })
        .await
        .unwrap();
        assert!(lost.is_conflict());
        assert!(matches!(
            lost.into_contention(),
            Err(ControllerError::LockContention {
                expected: 0,
                actual: 1
            })
        ));
    }

    #[test]
    fn test_commit_members_records_history() {
        let mut record = EnsembleRecord::default();
        for version in 1..=(CONFIG_HISTORY_LIMIT as u64 + 5) {
            let mut members = BTreeMap::new();
            members.insert(UnitId::new(0), Role::Voter);
            members.insert(UnitId::new(1), Role::Joining);
            members.insert(UnitId::new(2), Role::Observer);
            record.commit_members(ConfigVersion::new(version), members);
        }

        assert_eq!(record.config_history.len(), CONFIG_HISTORY_LIMIT);
        let last = record.config_history.last().unwrap();
        assert_eq!(last.version, record.config_version);
        assert_eq!(last.voters.len(), 2);
    }

    #[test]
    fn test_peer_state_json_shape() {
        let mut state = PeerState::default();
        state.unit_mut(UnitId::new(3)).health = HealthStatus::Serving;
        state
            .ensemble
            .members
            .insert(UnitId::new(3), Role::Voter);

        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["units"]["3"]["health"], "serving");
        assert_eq!(json["ensemble"]["members"]["3"], "voter");

        let decoded: PeerState = serde_json::from_value(json).unwrap();
        assert_eq!(decoded, state);
    }
}
