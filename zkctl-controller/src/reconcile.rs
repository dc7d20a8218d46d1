//! The per-unit reconciliation loop.
//!
//! Every event triggers one pass. A pass reads the peer state once, reports
//! the local unit, runs the unit duties every unit performs, runs the planner
//! duties when the local unit is the planner, and finally steps the rolling
//! coordinator. Each write is a compare-and-write; a lost race leaves the
//! rest of the pass to work on the refreshed state and the next pass retries.
//! Replaying a pass with no new input writes nothing.

use crate::actions::{ActionOutput, OperatorAction};
use crate::cluster_view::ClusterView;
use crate::credentials::CredentialManager;
use crate::events::{ControllerCommand, ControllerCommandReceiver, Event, EventQueue, RotationRequest};
use crate::peer::PeerHandle;
use crate::provider::ServiceEndpoint;
use crate::quorum::{DesiredMembership, Plan, QuorumConfigBuilder};
use crate::rolling::{application_order, pre_upgrade_check, RollingOpsCoordinator, StepOutcome};
use crate::status::{assess, ControllerStatus, PassNotes, UnitStatus};
use crate::telemetry::LogHandle;
use crate::tls::{TlsAction, TlsCoordinator};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::time::interval;
use tracing::{debug, error, info, warn};
use zkctl_core::config::SUPER_USER;
use zkctl_core::{
    CertificateAuthority, ChangeKind, Clock, ConfigChange, ControllerConfig, ControllerError,
    Credential, Ensemble, OpKind, OpToken, PeerState, PeerStateStore, Result, Role, ServerSettings,
    Snapshot, TlsDesired, UnitId, Workload, WorkloadProbe,
};

/// Attempts for writes made on behalf of an operator or a departed unit.
const COMMIT_ATTEMPTS: u32 = 5;

/// Result of one reconciliation pass.
#[derive(Debug, Clone, PartialEq)]
pub struct PassReport {
    pub is_planner: bool,
    pub step: StepOutcome,
    pub status: UnitStatus,
}

/// Reconciles one unit against the shared peer state.
pub struct Reconciler {
    local: UnitId,
    address: String,
    config: ControllerConfig,
    peer: PeerHandle,
    view: ClusterView,
    builder: QuorumConfigBuilder,
    rolling: RollingOpsCoordinator,
    credentials: CredentialManager,
    tls: TlsCoordinator,
    workload: Arc<dyn Workload>,
    clock: Arc<dyn Clock>,
    desired: Option<DesiredMembership>,
    desired_tls: TlsDesired,
    desired_version: Option<String>,
    departed: BTreeSet<UnitId>,
    renew_requested: bool,
    config_error: Option<String>,
    queue: EventQueue,
    status: ControllerStatus,
    log: Option<LogHandle>,
}

impl Reconciler {
    pub fn new(
        local: UnitId,
        address: impl Into<String>,
        config: ControllerConfig,
        store: Arc<dyn PeerStateStore>,
        workload: Arc<dyn Workload>,
        authority: Arc<dyn CertificateAuthority>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let peer = PeerHandle::new(store);
        let rolling = RollingOpsCoordinator::new(
            local,
            config.clone(),
            peer.clone(),
            workload.clone(),
            clock.clone(),
        );
        let credentials =
            CredentialManager::new(local, config.credential_ack_timeout, workload.clone());
        let tls = TlsCoordinator::new(
            local,
            config.app_name.clone(),
            config.renewal_threshold,
            authority,
            workload.clone(),
        );

        Self {
            local,
            address: address.into(),
            view: ClusterView::new(local, config.unreachable_after),
            builder: QuorumConfigBuilder::new(),
            config,
            peer,
            rolling,
            credentials,
            tls,
            workload,
            clock,
            desired: None,
            desired_tls: TlsDesired::disabled(),
            desired_version: None,
            departed: BTreeSet::new(),
            renew_requested: false,
            config_error: None,
            queue: EventQueue::new(),
            status: ControllerStatus {
                unit: Some(local),
                ..Default::default()
            },
            log: None,
        }
    }

    /// Follow `log-level` changes on the installed subscriber.
    pub fn with_log_handle(mut self, handle: LogHandle) -> Self {
        self.log = Some(handle);
        self
    }

    pub fn local(&self) -> UnitId {
        self.local
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Status as of the last pass.
    pub fn status(&self) -> &ControllerStatus {
        &self.status
    }

    /// Fold `event` into the controller's inputs and run a pass.
    pub async fn handle_event(&mut self, event: Event) -> Result<PassReport> {
        debug!("{} handling {}", self.local, event.name());
        match event {
            Event::MembershipChanged(desired) => {
                for unit in desired.voters.iter().chain(desired.observers.iter()) {
                    self.departed.remove(unit);
                }
                self.desired = Some(desired);
            }
            Event::ConfigChanged { options, tls } => {
                match self
                    .config
                    .apply_options(&options)
                    .and_then(|next| next.validate().map(|_| next))
                {
                    Ok(next) => {
                        if next.log_level != self.config.log_level {
                            info!("{} log level is now {}", self.local, next.log_level.as_filter());
                            if let Some(log) = &self.log {
                                if let Err(e) = log.set_level(next.log_level) {
                                    warn!("{} kept the previous log level: {}", self.local, e);
                                }
                            }
                        }
                        self.config = next;
                        self.config_error = None;
                    }
                    Err(e) => {
                        error!("{} rejected configuration: {}", self.local, e);
                        self.config_error = Some(e.to_string());
                    }
                }
                self.desired_tls = tls;
            }
            Event::RelationBroken { unit } => self.unit_departed(unit).await?,
            Event::RotationRequested(request) => self.rotation_requested(request).await?,
            Event::UpgradeRequested { version } => {
                info!("{} server version {} requested", self.local, version);
                self.desired_version = Some(version);
            }
            Event::HealthTick => {}
        }
        self.pass().await
    }

    /// Run an operator action. Mutating actions are followed by a pass.
    pub async fn handle_action(&mut self, action: OperatorAction) -> Result<ActionOutput> {
        info!("{} running action {}", self.local, action.name());
        let output = match action {
            OperatorAction::GetSuperPassword => {
                let snapshot = self.peer.read().await?;
                return CredentialManager::current_secret(&snapshot.state.ensemble, SUPER_USER)
                    .map(ActionOutput::Password)
                    .ok_or_else(|| ControllerError::transient("admin credential not initialised yet"));
            }
            OperatorAction::SetPassword { username, password } => {
                let username = username.unwrap_or_else(|| SUPER_USER.to_string());
                let credential = self.rotate_credential(&username, password).await?;
                ActionOutput::RotationStarted {
                    username,
                    epoch: credential.required_epoch().value(),
                }
            }
            OperatorAction::SetTlsPrivateKey { key_pem } => {
                self.install_private_key(&key_pem).await?;
                ActionOutput::KeyInstalled
            }
            OperatorAction::ResolveFatal { token } => {
                let mut snapshot = self.peer.read().await?;
                let ensemble = &snapshot.state.ensemble;
                let token = token
                    .or_else(|| ensemble.fatal.as_ref().map(|fatal| fatal.token))
                    .ok_or_else(|| ControllerError::invalid_config("no escalated operation to resolve"))?;
                let released = self.rolling.release(&mut snapshot, token).await?;
                ActionOutput::Released { token, released }
            }
        };

        if let Err(e) = self.pass().await {
            warn!("{} pass after {:?} failed: {}", self.local, output, e);
        }
        Ok(output)
    }

    /// One reconciliation pass.
    pub async fn pass(&mut self) -> Result<PassReport> {
        let now = self.clock.now_ms();
        let mut snapshot = self.peer.read().await?;
        let mut notes = PassNotes::default();

        if let Some(reason) = &self.config_error {
            notes.block(format!("invalid configuration: {}", reason));
        }

        self.report(&mut snapshot, now).await?;
        self.unit_duties(&mut snapshot, now, &mut notes).await?;

        let ensemble = self.view.observe(&snapshot.state, now);
        let is_planner = self.view.is_planner(&ensemble);
        if is_planner {
            self.planner_duties(&mut snapshot, &ensemble, now, &mut notes)
                .await?;
        }

        let step = match self.rolling.step(&mut snapshot).await {
            Ok(step) => step,
            Err(e) if e.is_retryable() => {
                warn!("{} rolling step failed: {}", self.local, e);
                StepOutcome::Contended
            }
            Err(e) => return Err(e),
        };
        if let StepOutcome::BackingOff { until_ms } = step {
            notes.wait(format!(
                "retrying in {}s",
                until_ms.saturating_sub(now).div_ceil(1000)
            ));
        }

        let status = assess(&snapshot.state, self.local, &notes);
        if status != self.status.status {
            info!("{} status: {}", self.local, status);
        }
        self.status = ControllerStatus {
            unit: Some(self.local),
            status: status.clone(),
            config_version: snapshot.state.ensemble.config_version,
            is_planner,
            last_step: Some(step.clone()),
            endpoint: ServiceEndpoint::from_state(&snapshot.state),
        };

        Ok(PassReport {
            is_planner,
            step,
            status,
        })
    }

    /// Run until shut down, reconciling on every command and every tick.
    pub async fn run(mut self, mut commands: ControllerCommandReceiver) -> Result<()> {
        info!("Starting zkctl controller for {}", self.local);
        let mut tick = interval(self.config.tick_interval);

        loop {
            let mut shutdown = false;
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => shutdown = self.accept(command).await,
                    None => shutdown = true,
                },
                _ = tick.tick() => {
                    self.queue.push(Event::HealthTick);
                }
            }

            while !shutdown {
                match commands.try_recv() {
                    Ok(command) => shutdown = self.accept(command).await,
                    Err(_) => break,
                }
            }

            self.drain_events().await;
            if shutdown {
                info!("Controller for {} shutting down", self.local);
                return Ok(());
            }
        }
    }

    /// Returns true on shutdown.
    async fn accept(&mut self, command: ControllerCommand) -> bool {
        match command {
            ControllerCommand::Event(event) => {
                self.queue.push(event);
            }
            ControllerCommand::Action(action, reply) => {
                // Actions observe every event that arrived before them.
                self.drain_events().await;
                let _ = reply.send(self.handle_action(action).await);
            }
            ControllerCommand::GetStatus(reply) => {
                self.drain_events().await;
                let _ = reply.send(self.status.clone());
            }
            ControllerCommand::Shutdown => return true,
        }
        false
    }

    async fn drain_events(&mut self) {
        while let Some(event) = self.queue.pop() {
            let name = event.name();
            if let Err(e) = self.handle_event(event).await {
                if e.is_retryable() {
                    warn!("{} pass for {} failed: {}", self.local, name, e);
                } else {
                    error!("{} pass for {} failed: {}", self.local, name, e);
                }
            }
        }
    }

    /// Write the local record: address, probe results and heartbeat.
    async fn report(&self, snapshot: &mut Snapshot, now: u64) -> Result<()> {
        let probe = match self.workload.probe().await {
            Ok(probe) => probe,
            Err(e) => {
                debug!("{} probe failed: {}", self.local, e);
                WorkloadProbe::unreachable()
            }
        };
        let heartbeat_every = self.config.heartbeat_interval.as_millis() as u64;
        let address = self.address.as_str();
        let local = self.local;

        self.peer
            .commit(snapshot, |state| {
                let record = state.unit_mut(local);
                let before = record.clone();

                if record.address.as_deref() != Some(address) {
                    record.address = Some(address.to_string());
                }
                record.health = probe.health;
                record.is_leader = probe.is_leader;
                record.acked_config_version = probe.config_version;
                record.tls_generation = probe.tls_generation;
                if record.joined_at_ms == 0 {
                    record.joined_at_ms = now;
                }

                let due = record
                    .heartbeat_ms
                    .map(|last| now.saturating_sub(last) >= heartbeat_every)
                    .unwrap_or(true);
                if due || *record != before {
                    record.heartbeat_ms = Some(now);
                }
            })
            .await?;
        Ok(())
    }

    /// Duties of every unit: install announced credentials and keep TLS
    /// material for the current generation.
    async fn unit_duties(
        &self,
        snapshot: &mut Snapshot,
        now: u64,
        notes: &mut PassNotes,
    ) -> Result<()> {
        let mut next = snapshot.state.clone();
        match self.credentials.install_and_acknowledge(&mut next).await {
            Ok(true) => {
                self.peer.commit(snapshot, |state| *state = next).await?;
            }
            Ok(false) => {}
            Err(e) => {
                warn!("{} could not install credentials: {}", self.local, e);
                notes.wait("installing credentials");
            }
        }

        let mut next = snapshot.state.clone();
        match self.tls.unit_duties(&mut next, now).await {
            Ok(true) => {
                self.peer.commit(snapshot, |state| *state = next).await?;
            }
            Ok(false) => {}
            Err(e) if e.is_retryable() => {
                warn!("{} certificate handling failed: {}", self.local, e);
                notes.wait("waiting for certificate authority");
            }
            Err(e) => {
                error!("{} certificate handling failed: {}", self.local, e);
                notes.block(e.to_string());
            }
        }
        Ok(())
    }

    async fn planner_duties(
        &mut self,
        snapshot: &mut Snapshot,
        ensemble: &Ensemble,
        now: u64,
        notes: &mut PassNotes,
    ) -> Result<()> {
        let settings = ServerSettings::from(&self.config);
        let credentials = &self.credentials;
        self.peer
            .commit(snapshot, |state| {
                credentials.ensure_users(&mut state.ensemble);
                if state.ensemble.settings.is_none() {
                    state.ensemble.settings = Some(settings);
                }
            })
            .await?;

        let fatal = snapshot.state.ensemble.fatal.is_some();
        if !fatal {
            self.plan_membership(snapshot, ensemble, now, notes).await?;
            self.plan_settings(snapshot, settings, now).await?;
        }

        self.advance_credentials(snapshot, now, notes).await?;
        self.plan_upgrade(snapshot, ensemble, now, notes).await?;

        if !fatal {
            self.plan_tls(snapshot, now, notes).await?;
            self.catch_up_lagging(snapshot, ensemble, now).await?;
        }

        self.forget_departed(snapshot).await
    }

    async fn plan_membership(
        &self,
        snapshot: &mut Snapshot,
        ensemble: &Ensemble,
        now: u64,
        notes: &mut PassNotes,
    ) -> Result<()> {
        let Some(desired) = &self.desired else {
            return Ok(());
        };
        let busy = snapshot.state.ensemble.ops.iter().any(|op| {
            matches!(
                op.kind,
                OpKind::Reconfigure { .. } | OpKind::LeadershipHandoff { .. }
            )
        });
        if busy {
            return Ok(());
        }

        let plan = match self.builder.plan(ensemble, desired) {
            Ok(plan) => plan,
            Err(e) => {
                warn!("{} cannot plan membership: {}", self.local, e);
                notes.block(e.to_string());
                return Ok(());
            }
        };

        match plan {
            Plan::NoOp => {}
            Plan::Defer { reason } => {
                debug!("{} deferring membership change: {}", self.local, reason);
                notes.wait(reason);
            }
            Plan::Change(change) => {
                if !change.is_quorum_safe() {
                    notes.block(format!("change {} is not quorum-safe", change));
                    return Ok(());
                }
                let leader = ensemble.leader();
                let builder = self.builder;
                let rolling = &self.rolling;
                let planned = self
                    .peer
                    .commit(snapshot, |state| {
                        let record = &mut state.ensemble;
                        if record.config_version != change.from_version {
                            return false;
                        }
                        let members = builder.apply(&record.members, &change);
                        let targets = application_order(&members, leader);
                        record.commit_members(change.to_version, members);
                        rolling
                            .request(record, OpKind::Reconfigure { change: change.clone() }, targets, now)
                            .token()
                            .is_some()
                    })
                    .await?;
                if planned == Some(true) {
                    info!("{} planned {}", self.local, change);
                }
            }
            Plan::HandOffLeadership { leader } => {
                let rolling = &self.rolling;
                self.peer
                    .commit(snapshot, |state| {
                        rolling.request(
                            &mut state.ensemble,
                            OpKind::LeadershipHandoff { leader },
                            vec![leader],
                            now,
                        )
                    })
                    .await?;
            }
        }
        Ok(())
    }

    /// Roll a restart when the committed server settings differ from the
    /// configured ones.
    async fn plan_settings(
        &self,
        snapshot: &mut Snapshot,
        wanted: ServerSettings,
        now: u64,
    ) -> Result<()> {
        if snapshot.state.ensemble.settings == Some(wanted) {
            return Ok(());
        }
        let rolling = &self.rolling;
        let leader = leader_of(&snapshot.state);
        let admitted = self
            .peer
            .commit(snapshot, |state| {
                state.ensemble.settings = Some(wanted);
                let targets = application_order(&state.ensemble.members, leader);
                if targets.is_empty() {
                    return None;
                }
                let kind = OpKind::Restart {
                    reason: "server settings changed".to_string(),
                };
                rolling.request(&mut state.ensemble, kind, targets, now).token()
            })
            .await?;
        if let Some(Some(token)) = admitted {
            info!("{} rolling restart {} for new server settings", self.local, token);
        }
        Ok(())
    }

    async fn advance_credentials(
        &self,
        snapshot: &mut Snapshot,
        now: u64,
        notes: &mut PassNotes,
    ) -> Result<()> {
        let credentials = &self.credentials;
        let rolling = &self.rolling;
        let leader = leader_of(&snapshot.state);
        let committed = self
            .peer
            .commit(snapshot, |state| {
                let progress = credentials.advance(state, now);
                if progress.cut_over.is_empty() {
                    return (progress, None);
                }
                // Servers read the JAAS file only at start.
                let targets = application_order(&state.ensemble.members, leader);
                if targets.is_empty() {
                    return (progress, None);
                }
                let kind = OpKind::Restart {
                    reason: "credentials rotated".to_string(),
                };
                let token = rolling.request(&mut state.ensemble, kind, targets, now).token();
                (progress, token)
            })
            .await?;
        if let Some((progress, token)) = committed {
            if let Some(token) = token {
                info!(
                    "{} rolling restart {} to load rotated {:?}",
                    self.local, token, progress.cut_over
                );
            }
            if let Some((username, waiting)) = progress.stalled.first() {
                let units = waiting
                    .iter()
                    .map(UnitId::to_string)
                    .collect::<Vec<_>>()
                    .join(", ");
                notes.wait(format!("rotation of {} waiting on {}", username, units));
            }
        }
        Ok(())
    }

    async fn plan_tls(
        &mut self,
        snapshot: &mut Snapshot,
        now: u64,
        notes: &mut PassNotes,
    ) -> Result<()> {
        let desired = self.desired_tls.clone();
        let renew = self.renew_requested;
        let leader = leader_of(&snapshot.state);
        let tls = &self.tls;
        let rolling = &self.rolling;

        let action = self
            .peer
            .commit(snapshot, |state| {
                let action = tls.ensure(state, &desired, renew, now);
                if let TlsAction::Cutover { generation } = action {
                    let queued = state
                        .ensemble
                        .ops
                        .iter()
                        .any(|op| matches!(op.kind, OpKind::TlsCutover { .. }));
                    if !queued {
                        let targets = application_order(&state.ensemble.members, leader);
                        rolling.request(
                            &mut state.ensemble,
                            OpKind::TlsCutover { generation },
                            targets,
                            now,
                        );
                    }
                }
                action
            })
            .await?;

        let Some(action) = action else {
            return Ok(());
        };
        self.renew_requested = false;
        if let TlsAction::Waiting { generation, on } = action {
            let units = on.iter().map(UnitId::to_string).collect::<Vec<_>>().join(", ");
            notes.wait(format!(
                "certificates for generation {} pending on {}",
                generation, units
            ));
        }
        Ok(())
    }

    /// Roll the requested server version over the members once the ensemble
    /// passes the pre-upgrade check.
    ///
    /// An upgrade to another version still in the queue, escalated or not,
    /// is abandoned for the new request; that is how a failed upgrade is
    /// rolled back.
    async fn plan_upgrade(
        &self,
        snapshot: &mut Snapshot,
        ensemble: &Ensemble,
        now: u64,
        notes: &mut PassNotes,
    ) -> Result<()> {
        let Some(version) = self.desired_version.clone() else {
            return Ok(());
        };
        let record = &snapshot.state.ensemble;
        let mut queued = false;
        let mut superseded: Vec<OpToken> = Vec::new();
        for op in &record.ops {
            if let OpKind::Upgrade { version: other } = &op.kind {
                if *other == version {
                    queued = true;
                } else {
                    superseded.push(op.token);
                }
            }
        }
        let current = record.version.as_deref() == Some(version.as_str());
        if queued || (current && superseded.is_empty()) {
            return Ok(());
        }
        if let Some(fatal) = &record.fatal {
            if !superseded.contains(&fatal.token) {
                return Ok(());
            }
        }

        let rollback = !superseded.is_empty();
        if let Err(cause) = pre_upgrade_check(ensemble, rollback) {
            notes.wait(format!("upgrade to {} waiting: {}", version, cause));
            return Ok(());
        }

        let rolling = &self.rolling;
        let leader = ensemble.leader();
        let admitted = self
            .peer
            .commit(snapshot, |state| {
                let record = &mut state.ensemble;
                record.ops.retain(|op| !superseded.contains(&op.token));
                if record
                    .lock
                    .as_ref()
                    .is_some_and(|lease| superseded.contains(&lease.token))
                {
                    record.lock = None;
                }
                if record
                    .fatal
                    .as_ref()
                    .is_some_and(|fatal| superseded.contains(&fatal.token))
                {
                    record.fatal = None;
                }
                let targets = application_order(&record.members, leader);
                let kind = OpKind::Upgrade {
                    version: version.clone(),
                };
                rolling.request(record, kind, targets, now).token()
            })
            .await?;

        if let Some(Some(token)) = admitted {
            if rollback {
                warn!("{} abandoned upgrade ops {:?}", self.local, superseded);
            }
            info!("{} rolling upgrade {} to {}", self.local, token, version);
        }
        Ok(())
    }

    /// Restart members whose server runs an older configuration than the
    /// committed one, once nothing else is rolling.
    async fn catch_up_lagging(
        &self,
        snapshot: &mut Snapshot,
        ensemble: &Ensemble,
        now: u64,
    ) -> Result<()> {
        if !snapshot.state.ensemble.ops.is_empty() {
            return Ok(());
        }
        let version = snapshot.state.ensemble.config_version;
        let lagging: BTreeSet<UnitId> = ensemble
            .units
            .values()
            .filter(|unit| matches!(unit.role, Some(role) if role != Role::Leaving))
            .filter(|unit| unit.reporting && unit.acked_config_version < version)
            .map(|unit| unit.id)
            .collect();
        if lagging.is_empty() {
            return Ok(());
        }

        let rolling = &self.rolling;
        let leader = ensemble.leader();
        let queued = self
            .peer
            .commit(snapshot, |state| {
                let members: BTreeMap<UnitId, Role> = state
                    .ensemble
                    .members
                    .iter()
                    .filter(|(id, _)| lagging.contains(id))
                    .map(|(id, role)| (*id, *role))
                    .collect();
                let targets = application_order(&members, leader);
                if targets.is_empty() {
                    return None;
                }
                let kind = OpKind::Restart {
                    reason: "config lag".to_string(),
                };
                let before = state.ensemble.ops.len();
                let token = rolling.request(&mut state.ensemble, kind, targets, now).token();
                token.filter(|_| state.ensemble.ops.len() > before)
            })
            .await?;
        if let Some(Some(token)) = queued {
            info!("{} restarting lagging units {:?} as {}", self.local, lagging, token);
        }
        Ok(())
    }

    /// Drop the records of departed units once they left the membership.
    async fn forget_departed(&self, snapshot: &mut Snapshot) -> Result<()> {
        let state = &snapshot.state;
        let gone: Vec<UnitId> = self
            .departed
            .iter()
            .filter(|id| !state.ensemble.members.contains_key(id) && state.units.contains_key(id))
            .copied()
            .collect();
        if gone.is_empty() {
            return Ok(());
        }

        self.peer
            .commit(snapshot, |state| {
                for id in &gone {
                    state.units.remove(id);
                }
            })
            .await?;
        debug!("{} removed records of departed units {:?}", self.local, gone);
        Ok(())
    }

    /// A unit left the platform. Stop waiting for it, and revert a
    /// membership step that was adding it.
    async fn unit_departed(&mut self, unit: UnitId) -> Result<()> {
        info!("{} saw {} depart", self.local, unit);
        self.departed.insert(unit);
        if let Some(desired) = &mut self.desired {
            desired.remove(unit);
        }

        let now = self.clock.now_ms();
        let rolling = &self.rolling;
        let mut snapshot = self.peer.read().await?;
        let reverted = self
            .peer
            .commit_with_retry(&mut snapshot, COMMIT_ATTEMPTS, |state| {
                if rolling.forget_unit(state, unit, now).is_empty() {
                    return None;
                }
                revert_addition(rolling, state, unit, now)
            })
            .await?;

        if let Some(change) = reverted {
            warn!("{} reverting {} after departure", self.local, change);
        }
        Ok(())
    }

    async fn rotation_requested(&mut self, request: RotationRequest) -> Result<()> {
        match request {
            RotationRequest::Credential { username, secret } => {
                self.rotate_credential(&username, secret).await?;
            }
            RotationRequest::PrivateKey { unit, key_pem } => {
                if unit == self.local {
                    self.install_private_key(&key_pem).await?;
                }
            }
            RotationRequest::CertificateRenewal => {
                info!("{} certificate renewal requested", self.local);
                self.renew_requested = true;
            }
        }
        Ok(())
    }

    async fn rotate_credential(&self, username: &str, secret: Option<String>) -> Result<Credential> {
        let now = self.clock.now_ms();
        let credentials = &self.credentials;
        let mut snapshot = self.peer.read().await?;
        self.peer
            .commit_with_retry(&mut snapshot, COMMIT_ATTEMPTS, |state| {
                credentials.rotate(&mut state.ensemble, username, secret.clone(), now)
            })
            .await?
    }

    async fn install_private_key(&self, key_pem: &str) -> Result<()> {
        let tls = &self.tls;
        let mut snapshot = self.peer.read().await?;
        self.peer
            .commit_with_retry(&mut snapshot, COMMIT_ATTEMPTS, |state| {
                tls.set_private_key(state, key_pem)
            })
            .await??;
        Ok(())
    }
}

/// Leader according to the unit records.
fn leader_of(state: &PeerState) -> Option<UnitId> {
    state
        .units
        .iter()
        .find(|(_, record)| record.is_leader && record.health.is_serving())
        .map(|(id, _)| *id)
}

/// Undo a committed but unfinished addition of `unit`, within the same
/// write that cancelled its rollout.
fn revert_addition(
    rolling: &RollingOpsCoordinator,
    state: &mut PeerState,
    unit: UnitId,
    now: u64,
) -> Option<ConfigChange> {
    let record = &mut state.ensemble;
    let kind = match record.members.get(&unit) {
        Some(Role::Joining) => ChangeKind::RemoveVoter,
        Some(Role::Observer) => ChangeKind::RemoveObserver,
        _ => return None,
    };

    let mut members = record.members.clone();
    members.insert(unit, Role::Leaving);
    let change = ConfigChange {
        kind,
        unit,
        from_version: record.config_version,
        to_version: record.config_version.next(),
        voters_before: record.voters(),
        voters_after: members
            .iter()
            .filter(|(_, role)| role.is_participant())
            .map(|(id, _)| *id)
            .collect(),
    };

    if change.voters_after.is_empty() {
        // Nobody else to reconfigure: the addition never took effect.
        members.remove(&unit);
        record.commit_members(change.to_version, members);
        return Some(change);
    }

    let targets = application_order(&members, leader_of_members(state, &members));
    let record = &mut state.ensemble;
    record.commit_members(change.to_version, members);
    rolling
        .request(record, OpKind::Reconfigure { change: change.clone() }, targets, now)
        .token()
        .map(|_| change)
}

fn leader_of_members(state: &PeerState, members: &BTreeMap<UnitId, Role>) -> Option<UnitId> {
    leader_of(state).filter(|leader| members.contains_key(leader))
}
