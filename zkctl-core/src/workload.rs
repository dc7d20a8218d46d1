//! # Workload
//!
//! Control surface of the ZooKeeper server process on one unit.

use crate::{ConfigVersion, Credential, HealthStatus, RenderedConfig, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Reply marker of a healthy `ruok` probe.
pub const RUOK_HEALTHY: &str = "imok";
/// Fragment of a `srvr` reply from a server that is up but not serving.
pub const SRVR_NOT_SERVING: &str = "not currently serving requests";

/// What the local server reports about itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadProbe {
    pub health: HealthStatus,
    pub is_leader: bool,
    /// Config version of the dynamic file the process runs with
    pub config_version: ConfigVersion,
    pub tls_generation: u64,
}

impl WorkloadProbe {
    pub fn unreachable() -> Self {
        Self {
            health: HealthStatus::Unreachable,
            is_leader: false,
            config_version: ConfigVersion::default(),
            tls_generation: 0,
        }
    }
}

/// Classify the replies to the `ruok` and `srvr` four-letter commands.
///
/// Returns the health and whether the server runs in leader mode.
///
/// ```rust
/// use zkctl_core::{classify_probe, HealthStatus};
///
/// let (health, leader) = classify_probe("imok", "Zookeeper version: 3.8\nMode: leader\n");
/// assert_eq!(health, HealthStatus::Serving);
/// assert!(leader);
/// ```
pub fn classify_probe(ruok: &str, srvr: &str) -> (HealthStatus, bool) {
    if ruok.trim() != RUOK_HEALTHY {
        return (HealthStatus::Unreachable, false);
    }
    if srvr.contains(SRVR_NOT_SERVING) {
        return (HealthStatus::Syncing, false);
    }
    let is_leader = srvr
        .lines()
        .filter_map(|line| line.strip_prefix("Mode:"))
        .any(|mode| matches!(mode.trim(), "leader" | "standalone"));
    (HealthStatus::Serving, is_leader)
}

/// Certificate material handed to the server.
#[derive(Clone, PartialEq, Eq)]
pub struct TlsMaterial {
    pub certificate: String,
    pub private_key: String,
    pub chain: Vec<String>,
    /// CAs accepted from peers, newest first
    pub trust_bundle: Vec<String>,
}

impl std::fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("trust_bundle", &self.trust_bundle.len())
            .finish_non_exhaustive()
    }
}

/// The server process.
///
/// Implementations must be idempotent: writing the same config or
/// installing the same credentials twice has no further effect.
#[async_trait]
pub trait Workload: Send + Sync {
    async fn write_config(&self, config: &RenderedConfig) -> Result<()>;

    async fn restart(&self) -> Result<()>;

    async fn probe(&self) -> Result<WorkloadProbe>;

    /// Replace the local authentication store; every listed secret is valid.
    async fn install_credentials(&self, credentials: &[Credential]) -> Result<()>;

    /// Stage TLS material (or its removal) for the next restart.
    async fn install_tls(&self, material: Option<&TlsMaterial>, generation: u64) -> Result<()>;

    /// Replace the trusted CAs of the running server. The server reloads its
    /// trust store on change, no restart needed.
    async fn update_trust_bundle(&self, bundle: &[String]) -> Result<()>;

    /// Stage server binaries of `version` for the next restart.
    async fn install_version(&self, version: &str) -> Result<()>;

    /// Version of the running server, if known.
    async fn running_version(&self) -> Result<Option<String>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_classification() {
        assert_eq!(
            classify_probe("", "Mode: follower"),
            (HealthStatus::Unreachable, false)
        );
        assert_eq!(
            classify_probe(
                "imok",
                "This ZooKeeper instance is not currently serving requests"
            ),
            (HealthStatus::Syncing, false)
        );
        assert_eq!(
            classify_probe("imok\n", "Latency min/avg/max: 0/0/0\nMode: follower\n"),
            (HealthStatus::Serving, false)
        );
    }
}
