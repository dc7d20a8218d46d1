//! Two-phase rotation of the internal account secrets.
//!
//! Phase one announces a pending secret next to the current one. Every unit
//! installs both and acknowledges the pending epoch in its own record. Phase
//! two, the cutover, happens only after every unit has acknowledged; until
//! then both secrets stay valid, however long that takes.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use zkctl_core::config::MANAGED_USERS;
use zkctl_core::{
    generate_secret, ControllerError, Credential, CredentialEpoch, EnsembleRecord, PeerState,
    Result, UnitId, Workload,
};

/// Installed view of one credential: current epoch and pending epoch.
type Installed = BTreeMap<String, (CredentialEpoch, Option<CredentialEpoch>)>;

/// Outcome of a planner check of outstanding rotations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RotationProgress {
    /// Users whose pending secret became current
    pub cut_over: Vec<String>,
    /// Users still in phase one past the acknowledgment timeout
    pub stalled: Vec<(String, Vec<UnitId>)>,
}

impl RotationProgress {
    pub fn is_stalled(&self) -> bool {
        !self.stalled.is_empty()
    }
}

pub struct CredentialManager {
    local: UnitId,
    ack_timeout: Duration,
    workload: Arc<dyn Workload>,
    installed: Mutex<Option<Installed>>,
}

impl CredentialManager {
    pub fn new(local: UnitId, ack_timeout: Duration, workload: Arc<dyn Workload>) -> Self {
        Self {
            local,
            ack_timeout,
            workload,
            installed: Mutex::new(None),
        }
    }

    /// Create the managed users that do not exist yet. Returns true if any
    /// user was created.
    pub fn ensure_users(&self, record: &mut EnsembleRecord) -> bool {
        let mut created = false;
        for username in MANAGED_USERS {
            if !record.credentials.contains_key(username) {
                record
                    .credentials
                    .insert(username.to_string(), Credential::new(username, generate_secret()));
                info!("{} initialised credential for {}", self.local, username);
                created = true;
            }
        }
        created
    }

    /// Start phase one for `username`.
    ///
    /// Without a secret, an outstanding pending secret is announced again
    /// and a fresh one is generated otherwise. An explicit secret replaces
    /// any pending one under a new epoch.
    pub fn rotate(
        &self,
        record: &mut EnsembleRecord,
        username: &str,
        secret: Option<String>,
        now_ms: u64,
    ) -> Result<Credential> {
        if !MANAGED_USERS.contains(&username) {
            return Err(ControllerError::invalid_config(format!(
                "{} is not a managed user",
                username
            )));
        }
        if matches!(&secret, Some(s) if s.is_empty()) {
            return Err(ControllerError::invalid_config("password must not be empty"));
        }

        let credential = record
            .credentials
            .entry(username.to_string())
            .or_insert_with(|| Credential::new(username, generate_secret()));

        match secret {
            None if credential.reannounce(now_ms) => {
                info!("{} re-announced pending secret for {}", self.local, username);
            }
            secret => {
                let epoch = credential.announce(secret.unwrap_or_else(generate_secret), now_ms);
                info!(
                    "{} announced new secret for {} at epoch {}",
                    self.local, username, epoch
                );
            }
        }
        Ok(credential.clone())
    }

    /// Install every valid secret locally when the announced set changed,
    /// then acknowledge the required epochs in the local record.
    ///
    /// Returns true when `state` was changed.
    pub async fn install_and_acknowledge(&self, state: &mut PeerState) -> Result<bool> {
        let credentials = &state.ensemble.credentials;
        if credentials.is_empty() {
            return Ok(false);
        }

        let wanted: Installed = credentials
            .iter()
            .map(|(name, c)| (name.clone(), (c.epoch, c.pending.as_ref().map(|p| p.epoch))))
            .collect();

        let stale = self.installed.lock().as_ref() != Some(&wanted);
        if stale {
            let all: Vec<Credential> = credentials.values().cloned().collect();
            self.workload.install_credentials(&all).await?;
            debug!("{} installed {} credentials", self.local, all.len());
            *self.installed.lock() = Some(wanted);
        }

        let required: Vec<(String, CredentialEpoch)> = credentials
            .iter()
            .map(|(name, c)| (name.clone(), c.required_epoch()))
            .collect();
        let record = state.unit_mut(self.local);
        let mut changed = false;
        for (name, epoch) in required {
            if record.acked_epoch(&name) != epoch {
                record.acked_credentials.insert(name, epoch);
                changed = true;
            }
        }
        Ok(changed)
    }

    /// Units that have not acknowledged `credential`'s pending epoch.
    pub fn awaiting(state: &PeerState, credential: &Credential) -> Vec<UnitId> {
        let Some(pending) = &credential.pending else {
            return Vec::new();
        };
        state
            .units
            .iter()
            .filter(|(_, record)| record.acked_epoch(&credential.username) < pending.epoch)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Cut over every rotation all units have acknowledged.
    ///
    /// Rotations still waiting past the acknowledgment timeout are reported
    /// as stalled and left in phase one.
    pub fn advance(&self, state: &mut PeerState, now_ms: u64) -> RotationProgress {
        let mut progress = RotationProgress::default();
        let timeout_ms = self.ack_timeout.as_millis() as u64;

        let rotating: Vec<Credential> = state
            .ensemble
            .credentials
            .values()
            .filter(|c| c.is_rotating())
            .cloned()
            .collect();

        for credential in rotating {
            let waiting_on = Self::awaiting(state, &credential);
            if waiting_on.is_empty() {
                if let Some(entry) = state.ensemble.credentials.get_mut(&credential.username) {
                    entry.cut_over();
                    info!(
                        "{} cut over credential {} to epoch {}",
                        self.local, entry.username, entry.epoch
                    );
                    progress.cut_over.push(entry.username.clone());
                }
                continue;
            }

            let announced = credential
                .pending
                .as_ref()
                .map(|p| p.announced_ms)
                .unwrap_or(now_ms);
            if now_ms.saturating_sub(announced) > timeout_ms {
                let stall = ControllerError::RotationStalled {
                    subject: credential.username.clone(),
                    waiting_on: waiting_on.clone(),
                };
                warn!("{}; both secrets remain valid", stall);
                progress.stalled.push((credential.username.clone(), waiting_on));
            }
        }
        progress
    }

    /// Current secret of `username`, if initialised.
    pub fn current_secret(record: &EnsembleRecord, username: &str) -> Option<String> {
        record
            .credentials
            .get(username)
            .map(|credential| credential.current.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use zkctl_core::config::{SUPER_USER, SYNC_USER};
    use zkctl_core::{RenderedConfig, TlsMaterial, WorkloadProbe};

    #[derive(Default)]
    struct AuthStore {
        installs: Mutex<u32>,
        secrets: Mutex<BTreeMap<String, Vec<String>>>,
    }

    #[async_trait]
    impl Workload for AuthStore {
        async fn write_config(&self, _config: &RenderedConfig) -> Result<()> {
            Ok(())
        }

        async fn restart(&self) -> Result<()> {
            Ok(())
        }

        async fn probe(&self) -> Result<WorkloadProbe> {
            Ok(WorkloadProbe::unreachable())
        }

        async fn install_credentials(&self, credentials: &[Credential]) -> Result<()> {
            *self.installs.lock() += 1;
            *self.secrets.lock() = credentials
                .iter()
                .map(|c| {
                    (
                        c.username.clone(),
                        c.valid_secrets().into_iter().map(String::from).collect(),
                    )
                })
                .collect();
            Ok(())
        }

        async fn install_tls(&self, _material: Option<&TlsMaterial>, _generation: u64) -> Result<()> {
            Ok(())
        }

        async fn update_trust_bundle(&self, _bundle: &[String]) -> Result<()> {
            Ok(())
        }

        async fn install_version(&self, _version: &str) -> Result<()> {
            Ok(())
        }

        async fn running_version(&self) -> Result<Option<String>> {
            Ok(None)
        }
    }

    fn managers(count: u32) -> (Vec<Arc<AuthStore>>, Vec<CredentialManager>) {
        let stores: Vec<Arc<AuthStore>> = (0..count).map(|_| Arc::new(AuthStore::default())).collect();
        let managers = stores
            .iter()
            .enumerate()
            .map(|(i, store)| {
                CredentialManager::new(UnitId::new(i as u32), Duration::from_secs(300), store.clone())
            })
            .collect();
        (stores, managers)
    }

    #[test]
    fn test_users_are_initialised_once() {
        let (_, managers) = managers(1);
        let mut record = EnsembleRecord::default();
        assert!(managers[0].ensure_users(&mut record));
        let secret = CredentialManager::current_secret(&record, SUPER_USER).unwrap();
        assert_eq!(secret.len(), zkctl_core::SECRET_LENGTH);
        assert!(record.credentials.contains_key(SYNC_USER));

        assert!(!managers[0].ensure_users(&mut record));
        assert_eq!(CredentialManager::current_secret(&record, SUPER_USER), Some(secret));
    }

    #[test]
    fn test_rotate_rejects_unknown_users() {
        let (_, managers) = managers(1);
        let mut record = EnsembleRecord::default();
        assert!(managers[0].rotate(&mut record, "guest", None, 0).is_err());
        assert!(managers[0]
            .rotate(&mut record, SUPER_USER, Some(String::new()), 0)
            .is_err());
    }

    #[test]
    fn test_rotate_without_secret_reannounces() {
        let (_, managers) = managers(1);
        let mut record = EnsembleRecord::default();
        managers[0].ensure_users(&mut record);

        let first = managers[0].rotate(&mut record, SUPER_USER, None, 10).unwrap();
        let again = managers[0].rotate(&mut record, SUPER_USER, None, 20).unwrap();
        let (a, b) = (first.pending.unwrap(), again.pending.unwrap());
        assert_eq!(a.secret, b.secret);
        assert_eq!(a.epoch, b.epoch);
        assert_eq!(b.announced_ms, 20);

        let replaced = managers[0]
            .rotate(&mut record, SUPER_USER, Some("explicit".to_string()), 30)
            .unwrap();
        assert!(replaced.pending.unwrap().epoch > b.epoch);
    }

    #[tokio::test]
    async fn test_cutover_waits_for_every_unit() {
        let (stores, managers) = managers(3);
        let mut state = PeerState::default();
        managers[0].ensure_users(&mut state.ensemble);
        for manager in &managers {
            manager.install_and_acknowledge(&mut state).await.unwrap();
        }

        let old = CredentialManager::current_secret(&state.ensemble, SUPER_USER).unwrap();
        managers[0]
            .rotate(&mut state.ensemble, SUPER_USER, Some("rotated".to_string()), 0)
            .unwrap();

        managers[0].install_and_acknowledge(&mut state).await.unwrap();
        managers[1].install_and_acknowledge(&mut state).await.unwrap();
        let progress = managers[0].advance(&mut state, 1_000);
        assert!(progress.cut_over.is_empty());

        // Both secrets authenticate on every unit that installed them
        let credential = &state.ensemble.credentials[SUPER_USER];
        assert!(credential.authenticates(&old));
        assert!(credential.authenticates("rotated"));
        assert_eq!(stores[1].secrets.lock()[SUPER_USER], vec![old.clone(), "rotated".to_string()]);

        // Unit 2 stays silent past the timeout; nothing is forced
        let stalled = managers[0].advance(&mut state, 400_000);
        assert_eq!(stalled.stalled, vec![(SUPER_USER.to_string(), vec![UnitId::new(2)])]);
        assert!(state.ensemble.credentials[SUPER_USER].is_rotating());

        managers[2].install_and_acknowledge(&mut state).await.unwrap();
        let progress = managers[0].advance(&mut state, 400_001);
        assert_eq!(progress.cut_over, vec![SUPER_USER.to_string()]);

        let credential = &state.ensemble.credentials[SUPER_USER];
        assert!(!credential.authenticates(&old));
        assert!(credential.authenticates("rotated"));
    }

    #[tokio::test]
    async fn test_install_is_idempotent() {
        let (stores, managers) = managers(1);
        let mut state = PeerState::default();
        managers[0].ensure_users(&mut state.ensemble);

        assert!(managers[0].install_and_acknowledge(&mut state).await.unwrap());
        assert!(!managers[0].install_and_acknowledge(&mut state).await.unwrap());
        assert_eq!(*stores[0].installs.lock(), 1);
    }
}
