//! Deterministic multi-unit harness.
//!
//! Controllers run their passes one after another against one in-memory
//! peer state and a manual clock, so every interleaving is reproducible.
//! The invariants the controller promises are checked after every pass and
//! collected in [`Observations`].

use crate::authority::MockAuthority;
use crate::fault_injection::FaultType;
use crate::workload_sim::{SimulatedCluster, SimulatedWorkload};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use zkctl_controller::{
    ActionOutput, ControllerStatus, DesiredMembership, Event, OperatorAction, PassReport,
    Reconciler,
};
use zkctl_core::{
    ControllerConfig, ControllerError, LockLease, ManualClock, OpToken, PeerState, PeerStateStore,
    Result, UnitId,
};
use zkctl_store::{DataVolume, InMemoryPeerStore};

/// A rolling op as seen across every observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedOp {
    pub token: OpToken,
    pub kind: &'static str,
    /// Every unit the op ever listed as a target
    pub targets: BTreeSet<UnitId>,
}

#[derive(Debug, Clone, Default)]
pub struct Observations {
    pub passes: u64,
    /// Largest number of ops with a holder at the same time
    pub max_concurrent_holders: usize,
    /// Ops in the order they were first seen
    pub ops: Vec<ObservedOp>,
    /// `(by, from)` for every lock takeover
    pub takeovers: Vec<(UnitId, UnitId)>,
    pub escalations: Vec<OpToken>,
    /// Servers rejecting a credential clients were told to use
    pub auth_violations: Vec<String>,
    /// TLS servers that do not trust each other
    pub trust_violations: Vec<String>,
}

impl Observations {
    pub fn ops_of(&self, kind: &str) -> Vec<&ObservedOp> {
        self.ops.iter().filter(|op| op.kind == kind).collect()
    }
}

struct HarnessUnit {
    reconciler: Reconciler,
    frozen: bool,
}

pub struct EnsembleHarness {
    config: ControllerConfig,
    store: Arc<InMemoryPeerStore>,
    clock: ManualClock,
    cluster: Arc<SimulatedCluster>,
    authority: Arc<MockAuthority>,
    volumes: Option<PathBuf>,
    units: BTreeMap<UnitId, HarnessUnit>,
    observations: Observations,
    /// Lock as of the previous observation
    last_lock: Option<LockLease>,
    step: Duration,
}

impl EnsembleHarness {
    pub fn new(config: ControllerConfig) -> Result<Self> {
        config.validate()?;
        let clock = ManualClock::new(1_700_000_000_000);
        let authority = Arc::new(MockAuthority::new(
            Arc::new(clock.clone()),
            Duration::from_secs(90 * 24 * 3600),
        )?);

        Ok(Self {
            step: config.tick_interval,
            config,
            store: Arc::new(InMemoryPeerStore::new()),
            clock,
            cluster: Arc::new(SimulatedCluster::new()),
            authority,
            volumes: None,
            units: BTreeMap::new(),
            observations: Observations::default(),
            last_lock: None,
        })
    }

    /// Timings scaled down for simulation.
    pub fn default_config() -> ControllerConfig {
        ControllerConfig::new()
            .with_app_name("zookeeper")
            .with_heartbeat_interval(Duration::from_secs(5))
            .with_unreachable_after(Duration::from_secs(30))
            .with_lock_stale_after(Duration::from_secs(60))
            .with_verification_timeout(Duration::from_secs(10))
            .with_verify_polling(Duration::from_millis(5), 2)
            .with_retry_budget(2)
            .with_backoff(Duration::from_secs(1), Duration::from_secs(4))
            .with_credential_ack_timeout(Duration::from_secs(60))
            .with_tick_interval(Duration::from_secs(1))
    }

    /// Write every unit's rendered files below `root`.
    pub fn with_volumes(mut self, root: impl Into<PathBuf>) -> Self {
        self.volumes = Some(root.into());
        self
    }

    pub fn store(&self) -> &InMemoryPeerStore {
        &self.store
    }

    pub fn clock(&self) -> &ManualClock {
        &self.clock
    }

    pub fn cluster(&self) -> &SimulatedCluster {
        &self.cluster
    }

    pub fn authority(&self) -> &MockAuthority {
        &self.authority
    }

    pub fn observations(&self) -> &Observations {
        &self.observations
    }

    pub fn state(&self) -> PeerState {
        self.store.state()
    }

    pub fn units(&self) -> Vec<UnitId> {
        self.units.keys().copied().collect()
    }

    pub fn status(&self, ordinal: u32) -> Option<ControllerStatus> {
        self.units
            .get(&UnitId::new(ordinal))
            .map(|unit| unit.reconciler.status().clone())
    }

    pub fn add_unit(&mut self, ordinal: u32) {
        let id = UnitId::new(ordinal);
        if self.units.contains_key(&id) {
            return;
        }

        let mut workload = SimulatedWorkload::new(id, self.cluster.clone());
        let mut config = self.config.clone();
        if let Some(root) = &self.volumes {
            let dir = root.join(format!("unit-{}", ordinal));
            workload = workload.with_volume(DataVolume::new(&dir));
            config = config.with_data_dir(dir);
        }

        let reconciler = Reconciler::new(
            id,
            format!("{}-{}.{}-endpoints", config.app_name, ordinal, config.app_name),
            config,
            self.store.clone(),
            Arc::new(workload),
            self.authority.clone(),
            Arc::new(self.clock.clone()),
        );
        self.units.insert(
            id,
            HarnessUnit {
                reconciler,
                frozen: false,
            },
        );
        info!("Harness added {}", id);
    }

    /// Add any missing units and ask every controller for `desired`.
    pub async fn scale_to(&mut self, desired: DesiredMembership) {
        for id in desired.voters.iter().chain(desired.observers.iter()) {
            self.add_unit(id.ordinal());
        }
        self.deliver(Event::MembershipChanged(desired)).await;
    }

    /// Take a unit off the platform; the rest are told it departed.
    pub async fn remove_unit(&mut self, ordinal: u32) {
        let id = UnitId::new(ordinal);
        if self.units.remove(&id).is_none() {
            return;
        }
        self.cluster.remove(id);
        self.deliver(Event::RelationBroken { unit: id }).await;
    }

    /// Hand `event` to every running controller, in ordinal order.
    pub async fn deliver(&mut self, event: Event) {
        let ids = self.units();
        for id in ids {
            self.deliver_to(id.ordinal(), event.clone()).await;
        }
    }

    pub async fn deliver_to(&mut self, ordinal: u32, event: Event) -> Option<PassReport> {
        let id = UnitId::new(ordinal);
        let unit = self.units.get_mut(&id)?;
        if unit.frozen {
            return None;
        }
        let report = match unit.reconciler.handle_event(event).await {
            Ok(report) => Some(report),
            Err(e) => {
                warn!("Pass on {} failed: {}", id, e);
                None
            }
        };
        self.observe(id, true);
        report
    }

    pub async fn action(&mut self, ordinal: u32, action: OperatorAction) -> Result<ActionOutput> {
        let id = UnitId::new(ordinal);
        let unit = self
            .units
            .get_mut(&id)
            .ok_or(ControllerError::UnitNotFound { unit: id })?;
        let output = unit.reconciler.handle_action(action).await;
        self.observe(id, false);
        output
    }

    pub fn advance(&self, by: Duration) {
        self.clock.advance(by);
    }

    /// Advance the clock one step and deliver a health tick.
    pub async fn tick(&mut self) {
        self.clock.advance(self.step);
        self.deliver(Event::HealthTick).await;
    }

    /// Tick until nothing but heartbeats changes and no op is queued.
    /// Returns the number of rounds, or `None` if `max_rounds` ran out.
    pub async fn settle(&mut self, max_rounds: usize) -> Option<usize> {
        for round in 1..=max_rounds {
            let before = fingerprint(self.store.state());
            self.tick().await;
            let after = fingerprint(self.store.state());
            if before == after && after.ensemble.ops.is_empty() && after.ensemble.lock.is_none() {
                return Some(round);
            }
        }
        None
    }

    /// Tick until `done` holds for the peer state.
    pub async fn run_until<F>(&mut self, max_rounds: usize, done: F) -> bool
    where
        F: Fn(&PeerState) -> bool,
    {
        for _ in 0..max_rounds {
            if done(&self.store.state()) {
                return true;
            }
            self.tick().await;
        }
        done(&self.store.state())
    }

    pub async fn inject(&mut self, fault: FaultType) {
        info!("Injecting fault: {}", fault);
        let id = fault.unit();
        match fault {
            FaultType::ServerCrash { .. } => self.cluster.crash(id),
            FaultType::ServerRecover { .. } => self.cluster.recover(id),
            FaultType::FailingRestarts { count, .. } => self.cluster.fail_restarts(id, count),
            FaultType::ControllerFreeze { .. } => {
                if let Some(unit) = self.units.get_mut(&id) {
                    unit.frozen = true;
                }
            }
            FaultType::ControllerThaw { .. } => {
                if let Some(unit) = self.units.get_mut(&id) {
                    unit.frozen = false;
                }
            }
            FaultType::UnitLost { .. } => {
                self.units.remove(&id);
                self.cluster.remove(id);
            }
        }
    }

    /// Record what the pass on `unit` left behind. Takeovers are only
    /// attributed to passes, not to operator actions.
    fn observe(&mut self, unit: UnitId, pass: bool) {
        let state = self.store.state();
        let previous_lock = std::mem::replace(&mut self.last_lock, state.ensemble.lock.clone());
        let observations = &mut self.observations;
        observations.passes += 1;

        let holders = state
            .ensemble
            .ops
            .iter()
            .filter(|op| op.holder.is_some())
            .count();
        observations.max_concurrent_holders = observations.max_concurrent_holders.max(holders);

        for op in &state.ensemble.ops {
            let targets = op.targets().copied().chain(op.completed.iter().copied());
            match observations.ops.iter_mut().find(|seen| seen.token == op.token) {
                Some(seen) => seen.targets.extend(targets),
                None => observations.ops.push(ObservedOp {
                    token: op.token,
                    kind: op.kind.name(),
                    targets: targets.collect(),
                }),
            }
        }

        // A lease that vanished while its holder is still queued on the op
        // was reclaimed by someone else.
        if let Some(lease) = previous_lock {
            let reclaimed = pass
                && lease.holder != unit
                && state.ensemble.lock.as_ref() != Some(&lease)
                && state
                    .ensemble
                    .op(lease.token)
                    .map(|op| op.queue.contains(&lease.holder))
                    .unwrap_or(false);
            if reclaimed {
                observations.takeovers.push((unit, lease.holder));
            }
        }

        if let Some(fatal) = &state.ensemble.fatal {
            if !observations.escalations.contains(&fatal.token) {
                observations.escalations.push(fatal.token);
            }
        }

        let servers = self.cluster.servers();
        for (username, credential) in &state.ensemble.credentials {
            for (id, server) in &servers {
                if server.is_up()
                    && !server.credentials.is_empty()
                    && !server.authenticates(username, &credential.current)
                {
                    observations.auth_violations.push(format!(
                        "{} rejects the current {} secret after a pass on {}",
                        id, username, unit
                    ));
                }
            }
        }

        let presenting: Vec<(UnitId, &String)> = servers
            .iter()
            .filter(|(_, server)| server.is_up())
            .filter_map(|(id, server)| server.serving_ca.as_ref().map(|ca| (*id, ca)))
            .collect();
        for (a, _) in &presenting {
            for (b, ca) in &presenting {
                if a != b && !servers[a].trusts(ca) {
                    observations.trust_violations.push(format!(
                        "{} does not trust the CA presented by {} after a pass on {}",
                        a, b, unit
                    ));
                }
            }
        }
    }
}

/// State without heartbeats, to tell progress from liveness.
fn fingerprint(mut state: PeerState) -> PeerState {
    for record in state.units.values_mut() {
        record.heartbeat_ms = None;
    }
    state
}

/// Read through the store trait, as a controller would.
pub async fn read_state(store: &dyn PeerStateStore) -> Result<PeerState> {
    Ok(store.read().await?.state)
}
