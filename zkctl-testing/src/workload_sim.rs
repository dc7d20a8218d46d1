//! Simulated ZooKeeper servers.
//!
//! Every unit's [`SimulatedWorkload`] drives one server of a shared
//! [`SimulatedCluster`]. A restart adopts whatever configuration and TLS
//! material were written before it; leadership moves off a restarted
//! leader. Faults make servers unreachable or fail their restarts, and a
//! rejected version never comes up serving.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::debug;
use zkctl_core::{
    ConfigVersion, ControllerError, Credential, HealthStatus, RenderedConfig, Result, TlsMaterial,
    UnitId, Workload, WorkloadProbe,
};
use zkctl_store::DataVolume;

/// State of one simulated server.
#[derive(Debug, Clone, Default)]
pub struct ServerState {
    pub running: bool,
    pub serving: bool,
    /// Unreachable regardless of the process state
    pub crashed: bool,
    pub written: Option<RenderedConfig>,
    pub config_version: ConfigVersion,
    /// Material installed for the next restart
    pub staged_tls: Option<(Option<TlsMaterial>, u64)>,
    pub tls_generation: u64,
    /// CA of the certificate the server presents, if any
    pub serving_ca: Option<String>,
    pub trust_bundle: Vec<String>,
    pub credentials: Vec<Credential>,
    pub restarts: u32,
    /// Upcoming restarts that come back not serving
    pub failing_restarts: u32,
    /// Version of the running binaries
    pub version: Option<String>,
    pub staged_version: Option<String>,
}

impl ServerState {
    pub fn is_up(&self) -> bool {
        self.running && !self.crashed
    }

    /// Whether `secret` logs in as `username` on this server.
    pub fn authenticates(&self, username: &str, secret: &str) -> bool {
        self.credentials
            .iter()
            .any(|c| c.username == username && c.authenticates(secret))
    }

    pub fn trusts(&self, ca: &str) -> bool {
        self.trust_bundle.iter().any(|trusted| trusted == ca)
    }
}

/// Servers of one simulated ensemble.
#[derive(Debug, Default)]
pub struct SimulatedCluster {
    servers: DashMap<UnitId, ServerState>,
    leader: Mutex<Option<UnitId>>,
    restart_log: Mutex<Vec<UnitId>>,
    rejected_versions: Mutex<BTreeSet<String>>,
}

impl SimulatedCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn server(&self, unit: UnitId) -> Option<ServerState> {
        self.servers.get(&unit).map(|entry| entry.clone())
    }

    pub fn servers(&self) -> BTreeMap<UnitId, ServerState> {
        self.servers
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }

    pub fn leader(&self) -> Option<UnitId> {
        *self.leader.lock()
    }

    /// Units in restart order.
    pub fn restart_log(&self) -> Vec<UnitId> {
        self.restart_log.lock().clone()
    }

    pub fn crash(&self, unit: UnitId) {
        self.servers.entry(unit).or_default().crashed = true;
        self.elect(Some(unit));
    }

    pub fn recover(&self, unit: UnitId) {
        self.servers.entry(unit).or_default().crashed = false;
        self.elect(None);
    }

    pub fn fail_restarts(&self, unit: UnitId, count: u32) {
        self.servers.entry(unit).or_default().failing_restarts = count;
    }

    /// Servers started on `version` come back not serving.
    pub fn reject_version(&self, version: impl Into<String>) {
        self.rejected_versions.lock().insert(version.into());
    }

    pub fn remove(&self, unit: UnitId) {
        self.servers.remove(&unit);
        self.elect(Some(unit));
    }

    fn restart(&self, unit: UnitId) {
        {
            let mut server = self.servers.entry(unit).or_default();
            server.restarts += 1;
            server.running = true;

            if let Some((material, generation)) = server.staged_tls.take() {
                server.tls_generation = generation;
                server.serving_ca = material.as_ref().and_then(|m| m.chain.first().cloned());
                if let Some(material) = material {
                    server.trust_bundle = material.trust_bundle;
                }
            }

            if let Some(version) = server.staged_version.take() {
                server.version = Some(version);
            }
            let rejected = server
                .version
                .as_ref()
                .is_some_and(|version| self.rejected_versions.lock().contains(version));

            if server.failing_restarts > 0 {
                server.failing_restarts -= 1;
                server.serving = false;
            } else if rejected {
                server.serving = false;
            } else {
                server.serving = true;
                if let Some(written) = &server.written {
                    server.config_version = written.config_version;
                }
            }
        }
        self.restart_log.lock().push(unit);
        self.elect(Some(unit));
        debug!("Simulated server {} restarted", unit);
    }

    /// Keep the leader unless it is `displaced` or down; otherwise the
    /// lowest-ordinal serving server takes over.
    fn elect(&self, displaced: Option<UnitId>) {
        let mut leader = self.leader.lock();
        let healthy = |id: &UnitId| {
            self.servers
                .get(id)
                .map(|s| s.is_up() && s.serving)
                .unwrap_or(false)
        };
        if let Some(current) = *leader {
            if Some(current) != displaced && healthy(&current) {
                return;
            }
        }

        let mut candidates: Vec<UnitId> = self
            .servers
            .iter()
            .filter(|entry| entry.is_up() && entry.serving)
            .map(|entry| *entry.key())
            .collect();
        candidates.sort();
        let next = candidates
            .iter()
            .copied()
            .find(|id| Some(*id) != displaced)
            .or_else(|| candidates.first().copied());
        *leader = next;
    }
}

/// The [`Workload`] of one unit, backed by a [`SimulatedCluster`].
///
/// With a data volume attached, rendered files are also written to disk.
pub struct SimulatedWorkload {
    unit: UnitId,
    cluster: Arc<SimulatedCluster>,
    volume: Option<DataVolume>,
}

impl SimulatedWorkload {
    pub fn new(unit: UnitId, cluster: Arc<SimulatedCluster>) -> Self {
        cluster.servers.entry(unit).or_default();
        Self {
            unit,
            cluster,
            volume: None,
        }
    }

    pub fn with_volume(mut self, volume: DataVolume) -> Self {
        self.volume = Some(volume);
        self
    }

    fn reachable(&self) -> Result<()> {
        match self.cluster.servers.get(&self.unit) {
            Some(server) if !server.crashed => Ok(()),
            _ => Err(ControllerError::workload(format!(
                "server {} is unreachable",
                self.unit
            ))),
        }
    }
}

#[async_trait]
impl Workload for SimulatedWorkload {
    async fn write_config(&self, config: &RenderedConfig) -> Result<()> {
        self.reachable()?;
        if let Some(volume) = &self.volume {
            volume.write_config(config).await?;
        }
        self.cluster.servers.entry(self.unit).or_default().written = Some(config.clone());
        Ok(())
    }

    async fn restart(&self) -> Result<()> {
        self.reachable()?;
        self.cluster.restart(self.unit);
        Ok(())
    }

    async fn probe(&self) -> Result<WorkloadProbe> {
        let Some(server) = self.cluster.server(self.unit) else {
            return Ok(WorkloadProbe::unreachable());
        };
        if !server.is_up() {
            return Ok(WorkloadProbe::unreachable());
        }
        Ok(WorkloadProbe {
            health: if server.serving {
                HealthStatus::Serving
            } else {
                HealthStatus::Syncing
            },
            is_leader: self.cluster.leader() == Some(self.unit),
            config_version: server.config_version,
            tls_generation: server.tls_generation,
        })
    }

    async fn install_credentials(&self, credentials: &[Credential]) -> Result<()> {
        self.reachable()?;
        self.cluster.servers.entry(self.unit).or_default().credentials = credentials.to_vec();
        Ok(())
    }

    async fn install_tls(&self, material: Option<&TlsMaterial>, generation: u64) -> Result<()> {
        self.reachable()?;
        if let Some(volume) = &self.volume {
            volume.write_tls(material).await?;
        }
        self.cluster.servers.entry(self.unit).or_default().staged_tls =
            Some((material.cloned(), generation));
        Ok(())
    }

    async fn update_trust_bundle(&self, bundle: &[String]) -> Result<()> {
        self.reachable()?;
        let mut server = self.cluster.servers.entry(self.unit).or_default();
        for ca in bundle {
            if !server.trusts(ca) {
                server.trust_bundle.push(ca.clone());
            }
        }
        Ok(())
    }

    async fn install_version(&self, version: &str) -> Result<()> {
        self.reachable()?;
        self.cluster.servers.entry(self.unit).or_default().staged_version = Some(version.to_string());
        Ok(())
    }

    async fn running_version(&self) -> Result<Option<String>> {
        self.reachable()?;
        Ok(self.cluster.server(self.unit).and_then(|server| server.version))
    }
}
