//! Serialized per-unit application of rolling operations.
//!
//! Ops queue in the peer state in request order and only the head op is
//! applied. A unit applies an op to itself after claiming the shared lock
//! with a compare-and-write; the lock is released once the unit verifies it
//! came back serving at the required config version. There is no blocking
//! mutex: a lost write means someone else moved first, and the loser simply
//! re-reads on its next pass.

use crate::peer::PeerHandle;
use crate::quorum::QuorumConfigBuilder;
use crate::render::render_local;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use zkctl_core::{
    Clock, ConfigPaths, ControllerConfig, ControllerError, Ensemble, EnsembleRecord, FatalCondition,
    LockLease, OpKind, OpPhase, OpToken, PeerState, Result, Role, RollingOp, ServerSettings,
    Snapshot, TlsMaterial, TlsRender, TlsState, UnitId, Workload, WorkloadProbe,
};

/// Answer to an op request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Queued, or merged into an equivalent op already queued
    Accepted(OpToken),
    Rejected(String),
}

impl Admission {
    pub fn token(&self) -> Option<OpToken> {
        match self {
            Admission::Accepted(token) => Some(*token),
            Admission::Rejected(_) => None,
        }
    }
}

/// What one coordinator step did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Idle,
    /// Another unit holds the lock or is next in line
    Waiting { on: UnitId },
    /// Waiting out the backoff after a failed attempt
    BackingOff { until_ms: u64 },
    /// Restarted and still waiting to verify
    Verifying { token: OpToken },
    /// The local unit was verified and released the lock
    Verified { token: OpToken },
    /// The op finished on its last target
    Completed { token: OpToken },
    Retrying { token: OpToken, attempts: u32 },
    /// Retry budget spent; the lock stays held until released by an operator
    Escalated { token: OpToken },
    /// Stale lock reclaimed from another unit
    TookOver { token: OpToken, from: UnitId },
    /// Unreachable target removed from the queue
    Dropped { token: OpToken, unit: UnitId },
    /// A compare-and-write was lost
    Contended,
    Blocked { token: OpToken },
}

/// Application order: observers, joining units, followers by ordinal, and
/// the leader last. Leaving units are not targets.
pub fn application_order(members: &BTreeMap<UnitId, Role>, leader: Option<UnitId>) -> Vec<UnitId> {
    let rank = |id: &UnitId, role: &Role| -> u8 {
        if Some(*id) == leader {
            return 3;
        }
        match role {
            Role::Observer => 0,
            Role::Joining => 1,
            Role::Voter => 2,
            Role::Leaving => 4,
        }
    };

    let mut targets: Vec<(u8, UnitId)> = members
        .iter()
        .filter(|(_, role)| **role != Role::Leaving)
        .map(|(id, role)| (rank(id, role), *id))
        .collect();
    targets.sort();
    targets.into_iter().map(|(_, id)| id).collect()
}

/// Whether an upgrade may start. The quorum must hold, and unless a failed
/// upgrade is being rolled back, every member must be serving in sync with
/// the committed configuration.
pub fn pre_upgrade_check(ensemble: &Ensemble, rollback: bool) -> std::result::Result<(), String> {
    if !ensemble.has_quorum() {
        return Err(format!(
            "{} of {} voters serving, quorum is {}",
            ensemble.serving_voters(),
            ensemble.voters().len(),
            ensemble.quorum_size()
        ));
    }
    if rollback {
        return Ok(());
    }
    let lagging: Vec<String> = ensemble
        .members()
        .into_iter()
        .filter_map(|id| ensemble.unit(id))
        .filter(|unit| {
            !unit.reporting
                || !unit.health.is_serving()
                || unit.acked_config_version < ensemble.config_version
        })
        .map(|unit| unit.id.to_string())
        .collect();
    if lagging.is_empty() {
        Ok(())
    } else {
        Err(format!("{} not in sync", lagging.join(", ")))
    }
}

/// Remove finished ops from the head of the queue and apply their effects.
pub fn finish_drained(state: &mut PeerState, now_ms: u64) -> Vec<OpToken> {
    let mut finished = Vec::new();
    while let Some(op) = state.ensemble.ops.front() {
        if !op.is_finished() {
            break;
        }
        let Some(mut op) = state.ensemble.ops.pop_front() else {
            break;
        };
        op.set_phase(OpPhase::Done, now_ms);
        settle(state, &op);
        info!(
            "Rolling op {} ({}) completed on {} units",
            op.token,
            op.kind.name(),
            op.completed.len()
        );
        finished.push(op.token);
    }
    finished
}

fn settle(state: &mut PeerState, op: &RollingOp) {
    match &op.kind {
        OpKind::Reconfigure { .. } => {
            let ensemble = &mut state.ensemble;
            ensemble.members = QuorumConfigBuilder::new().settle(&ensemble.members);
        }
        OpKind::TlsCutover { generation } => {
            let active_ca = state
                .units
                .values()
                .filter_map(|unit| unit.tls.active.as_ref())
                .filter(|cert| cert.generation >= *generation)
                .max_by_key(|cert| cert.generation)
                .map(|cert| cert.ca.clone());
            let tls = &mut state.ensemble.tls;
            tls.active_generation = tls.active_generation.max(*generation);
            tls.active_ca = if tls.enabled { active_ca } else { None };
            tls.state = match (tls.enabled, tls.is_converged()) {
                (false, _) => TlsState::Absent,
                (true, true) => TlsState::Installed,
                (true, false) => TlsState::Renewing,
            };
        }
        OpKind::Upgrade { version } => state.ensemble.version = Some(version.clone()),
        OpKind::Restart { .. } | OpKind::LeadershipHandoff { .. } => {}
    }
}

/// Drives rolling operations for the local unit.
pub struct RollingOpsCoordinator {
    local: UnitId,
    config: ControllerConfig,
    peer: PeerHandle,
    workload: Arc<dyn Workload>,
    clock: Arc<dyn Clock>,
    paths: ConfigPaths,
}

impl RollingOpsCoordinator {
    pub fn new(
        local: UnitId,
        config: ControllerConfig,
        peer: PeerHandle,
        workload: Arc<dyn Workload>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let paths = ConfigPaths::new(&config.data_dir);
        Self {
            local,
            config,
            peer,
            workload,
            clock,
            paths,
        }
    }

    pub fn local(&self) -> UnitId {
        self.local
    }

    /// Queue an op on `record`. Used inside a peer-state mutation so the
    /// request commits together with whatever motivated it.
    ///
    /// An equivalent op that has not started yet absorbs the new targets
    /// instead of queueing a second op.
    pub fn request(
        &self,
        record: &mut EnsembleRecord,
        kind: OpKind,
        targets: Vec<UnitId>,
        now_ms: u64,
    ) -> Admission {
        if targets.is_empty() {
            return Admission::Rejected(format!("{} op has no targets", kind.name()));
        }
        if let OpKind::Reconfigure { change } = &kind {
            if !change.is_quorum_safe() {
                return Admission::Rejected(format!("change {} is not quorum-safe", change));
            }
        }

        // A restart already under way has passed some targets by, so it
        // cannot stand in for a new one.
        let absorbs = |op: &RollingOp| {
            let started = op.holder.is_some() || !op.completed.is_empty();
            op.kind.same_intent(&kind) && !(started && matches!(kind, OpKind::Restart { .. }))
        };
        if let Some(existing) = record.ops.iter_mut().find(|op| absorbs(op)) {
            if existing.holder.is_none() && existing.completed.is_empty() {
                for target in targets {
                    if !existing.queue.contains(&target) {
                        existing.queue.push_back(target);
                    }
                }
            }
            return Admission::Accepted(existing.token);
        }

        let op = RollingOp::new(kind, targets, self.local, record.config_version, now_ms);
        info!(
            "{} queued rolling op {} ({}) over {:?}",
            self.local,
            op.token,
            op.kind.name(),
            op.queue
        );
        let token = op.token;
        record.ops.push_back(op);
        Admission::Accepted(token)
    }

    /// Release `token`: drop its lock, clear an escalation it caused and
    /// reset it so it is retried from a clean attempt count.
    pub async fn release(&self, snapshot: &mut Snapshot, token: OpToken) -> Result<bool> {
        let now = self.clock.now_ms();
        let released = self
            .peer
            .commit(snapshot, |state| {
                let ensemble = &mut state.ensemble;
                let mut found = false;
                if ensemble.lock.as_ref().map(|lease| lease.token) == Some(token) {
                    ensemble.lock = None;
                    found = true;
                }
                if ensemble.fatal.as_ref().map(|fatal| fatal.token) == Some(token) {
                    ensemble.fatal = None;
                    found = true;
                }
                if let Some(op) = ensemble.op_mut(token) {
                    op.holder = None;
                    op.attempts = 0;
                    op.last_error = None;
                    op.set_phase(OpPhase::Pending, now);
                    found = true;
                }
                finish_drained(state, now);
                found
            })
            .await?;

        match released {
            Some(true) => {
                info!("{} released rolling op {}", self.local, token);
                Ok(true)
            }
            Some(false) => Ok(false),
            None => Err(ControllerError::LockContention {
                expected: snapshot.version.saturating_sub(1),
                actual: snapshot.version,
            }),
        }
    }

    /// Remove a departed unit from every op and from the lock.
    ///
    /// Reconfigurations that were adding the unit are cancelled and
    /// returned; the caller reverts the membership they committed.
    pub fn forget_unit(&self, state: &mut PeerState, unit: UnitId, now_ms: u64) -> Vec<OpToken> {
        let ensemble = &mut state.ensemble;
        let cancelled: Vec<OpToken> = ensemble
            .ops
            .iter()
            .filter(|op| {
                matches!(&op.kind, OpKind::Reconfigure { change }
                    if change.unit == unit && change.kind.is_addition())
            })
            .map(|op| op.token)
            .collect();
        ensemble.ops.retain(|op| !cancelled.contains(&op.token));

        if let Some(lease) = ensemble.lock.clone() {
            if lease.holder == unit || cancelled.contains(&lease.token) {
                ensemble.lock = None;
            }
        }
        if let Some(fatal) = &ensemble.fatal {
            if ensemble.op(fatal.token).is_none() || ensemble.lock.is_none() {
                ensemble.fatal = None;
            }
        }

        for op in ensemble.ops.iter_mut() {
            op.queue.retain(|target| *target != unit);
            if op.holder == Some(unit) {
                op.holder = None;
                op.attempts = 0;
                op.set_phase(OpPhase::Pending, now_ms);
            }
        }

        finish_drained(state, now_ms);
        cancelled
    }

    /// Run one step for the local unit. At most one unit is ever past
    /// `Pending` on the head op, enforced by the lock.
    pub async fn step(&self, snapshot: &mut Snapshot) -> Result<StepOutcome> {
        let outcome = self.step_once(snapshot).await?;
        if let StepOutcome::TookOver { .. } | StepOutcome::Dropped { .. } = outcome {
            // The queue moved; the local unit may now be next.
            let next = self.step_once(snapshot).await?;
            if !matches!(next, StepOutcome::Waiting { .. } | StepOutcome::Idle) {
                return Ok(next);
            }
        }
        Ok(outcome)
    }

    async fn step_once(&self, snapshot: &mut Snapshot) -> Result<StepOutcome> {
        let now = self.clock.now_ms();
        let Some(op) = snapshot.state.ensemble.head_op().cloned() else {
            if snapshot.state.ensemble.lock.is_some() {
                debug!("Clearing lock left without an op");
                let cleared = self
                    .peer
                    .commit(snapshot, |state| state.ensemble.lock = None)
                    .await?;
                if cleared.is_none() {
                    return Ok(StepOutcome::Contended);
                }
            }
            return Ok(StepOutcome::Idle);
        };

        match snapshot.state.ensemble.lock.clone() {
            Some(lease) if lease.holder == self.local => self.continue_held(snapshot, lease).await,
            Some(lease) => {
                if snapshot.state.ensemble.fatal.is_some() {
                    return Ok(StepOutcome::Blocked { token: lease.token });
                }
                if self.is_stale(&snapshot.state, lease.holder, now) {
                    return self.take_over(snapshot, lease, now).await;
                }
                Ok(StepOutcome::Waiting { on: lease.holder })
            }
            None => match op.next_target() {
                None => {
                    let finished = self
                        .peer
                        .commit(snapshot, |state| finish_drained(state, now))
                        .await?;
                    Ok(match finished {
                        Some(_) => StepOutcome::Completed { token: op.token },
                        None => StepOutcome::Contended,
                    })
                }
                Some(target) if target == self.local => self.claim_and_apply(snapshot, op).await,
                Some(target) if self.is_stale(&snapshot.state, target, now) => {
                    self.drop_target(snapshot, op.token, target, now).await
                }
                Some(target) => Ok(StepOutcome::Waiting { on: target }),
            },
        }
    }

    fn is_stale(&self, state: &PeerState, unit: UnitId, now_ms: u64) -> bool {
        let stale_after = self.config.lock_stale_after.as_millis() as u64;
        match state.unit(unit).and_then(|record| record.heartbeat_ms) {
            Some(heartbeat) => now_ms.saturating_sub(heartbeat) > stale_after,
            None => true,
        }
    }

    async fn take_over(&self, snapshot: &mut Snapshot, lease: LockLease, now: u64) -> Result<StepOutcome> {
        let heartbeat_age = snapshot
            .state
            .unit(lease.holder)
            .and_then(|record| record.heartbeat_ms)
            .map(|heartbeat| now.saturating_sub(heartbeat));

        let reclaimed = self
            .peer
            .commit(snapshot, |state| {
                let ensemble = &mut state.ensemble;
                if ensemble.lock.as_ref() != Some(&lease) {
                    return false;
                }
                ensemble.lock = None;
                if let Some(op) = ensemble.op_mut(lease.token) {
                    op.holder = None;
                    op.attempts = 0;
                    op.queue.retain(|target| *target != lease.holder);
                    op.queue.push_back(lease.holder);
                    op.set_phase(OpPhase::Pending, now);
                }
                true
            })
            .await?;

        match reclaimed {
            Some(true) => {
                warn!(
                    "{} took over lock of op {} from {} (heartbeat age {:?} ms, staleness deadline {:?})",
                    self.local, lease.token, lease.holder, heartbeat_age, self.config.lock_stale_after
                );
                Ok(StepOutcome::TookOver {
                    token: lease.token,
                    from: lease.holder,
                })
            }
            _ => Ok(StepOutcome::Contended),
        }
    }

    async fn drop_target(
        &self,
        snapshot: &mut Snapshot,
        token: OpToken,
        unit: UnitId,
        now: u64,
    ) -> Result<StepOutcome> {
        let dropped = self
            .peer
            .commit(snapshot, |state| {
                let Some(op) = state.ensemble.op_mut(token) else {
                    return false;
                };
                if op.next_target() != Some(unit) || op.holder.is_some() {
                    return false;
                }
                op.queue.pop_front();
                finish_drained(state, now);
                true
            })
            .await?;

        match dropped {
            Some(true) => {
                warn!(
                    "{} dropped unreachable {} from rolling op {}",
                    self.local, unit, token
                );
                Ok(StepOutcome::Dropped { token, unit })
            }
            _ => Ok(StepOutcome::Contended),
        }
    }

    async fn claim_and_apply(&self, snapshot: &mut Snapshot, op: RollingOp) -> Result<StepOutcome> {
        let now = self.clock.now_ms();
        if op.phase == OpPhase::Failed {
            let until_ms = op.phase_changed_ms + self.config.backoff(op.attempts).as_millis() as u64;
            if now < until_ms {
                return Ok(StepOutcome::BackingOff { until_ms });
            }
        }

        let local = self.local;
        let token = op.token;
        let claimed = self
            .peer
            .commit(snapshot, |state| {
                let ensemble = &mut state.ensemble;
                if ensemble.lock.is_some() {
                    return false;
                }
                ensemble.lock = Some(LockLease {
                    token,
                    holder: local,
                    acquired_ms: now,
                });
                if let Some(op) = ensemble.op_mut(token) {
                    op.holder = Some(local);
                    op.set_phase(OpPhase::Applying, now);
                }
                true
            })
            .await?;

        if claimed != Some(true) {
            debug!("{} lost the race for the lock of op {}", self.local, token);
            return Ok(StepOutcome::Contended);
        }
        info!(
            "{} acquired lock for rolling op {} ({}), attempt {}",
            self.local,
            token,
            op.kind.name(),
            op.attempts + 1
        );

        self.apply_and_verify(snapshot, token).await
    }

    async fn continue_held(&self, snapshot: &mut Snapshot, lease: LockLease) -> Result<StepOutcome> {
        let Some(op) = snapshot.state.ensemble.op(lease.token).cloned() else {
            let released = self
                .peer
                .commit(snapshot, |state| state.ensemble.lock = None)
                .await?;
            return Ok(match released {
                Some(()) => StepOutcome::Idle,
                None => StepOutcome::Contended,
            });
        };

        match op.phase {
            OpPhase::Verifying => self.verify(snapshot, lease.token).await,
            OpPhase::Failed => Ok(StepOutcome::Blocked { token: lease.token }),
            OpPhase::Pending | OpPhase::Applying | OpPhase::Done => {
                // Interrupted between claiming and restarting
                self.apply_and_verify(snapshot, lease.token).await
            }
        }
    }

    async fn apply_and_verify(&self, snapshot: &mut Snapshot, token: OpToken) -> Result<StepOutcome> {
        let Some(op) = snapshot.state.ensemble.op(token).cloned() else {
            return Ok(StepOutcome::Idle);
        };

        if let Err(e) = self.apply_local(&snapshot.state, &op).await {
            warn!("{} failed to apply op {}: {}", self.local, token, e);
            return self.record_failure(snapshot, token, e.to_string()).await;
        }

        let now = self.clock.now_ms();
        let moved = self
            .peer
            .commit(snapshot, |state| {
                if let Some(op) = state.ensemble.op_mut(token) {
                    op.set_phase(OpPhase::Verifying, now);
                }
            })
            .await?;
        if moved.is_none() {
            return Ok(StepOutcome::Contended);
        }

        self.verify(snapshot, token).await
    }

    /// Rewrite the local configuration for `op` and restart the server.
    async fn apply_local(&self, state: &PeerState, op: &RollingOp) -> Result<()> {
        let record = state.unit(self.local).cloned().unwrap_or_default();
        let tls_record = &state.ensemble.tls;
        let port_unification = !tls_record.is_converged();

        let certificate = match &op.kind {
            OpKind::TlsCutover { generation } if tls_record.enabled => Some(
                record
                    .tls
                    .staged
                    .as_ref()
                    .filter(|cert| cert.generation >= *generation)
                    .or(record.tls.active.as_ref().filter(|cert| cert.generation >= *generation))
                    .ok_or_else(|| {
                        ControllerError::transient(format!(
                            "no certificate staged for generation {}",
                            generation
                        ))
                    })?,
            ),
            OpKind::TlsCutover { .. } => None,
            // A unit that joined an encrypted ensemble adopts its staged
            // certificate at its first restart.
            _ if tls_record.enabled => record.tls.active.as_ref().or(record.tls.staged.as_ref()),
            _ => None,
        };

        let tls = match certificate {
            Some(cert) => {
                if record.tls.active.as_ref() != Some(cert) {
                    let mut trust_bundle = vec![cert.ca.clone()];
                    if let Some(previous) = &tls_record.active_ca {
                        if previous != &cert.ca {
                            trust_bundle.push(previous.clone());
                        }
                    }
                    let material = TlsMaterial {
                        certificate: cert.certificate.clone(),
                        private_key: cert.private_key.clone(),
                        chain: cert.chain.clone(),
                        trust_bundle,
                    };
                    self.workload.install_tls(Some(&material), cert.generation).await?;
                }
                TlsRender {
                    enabled: true,
                    port_unification,
                    generation: cert.generation,
                }
            }
            None => {
                if let OpKind::TlsCutover { generation } = &op.kind {
                    self.workload.install_tls(None, *generation).await?;
                }
                TlsRender {
                    enabled: false,
                    port_unification,
                    generation: tls_record.generation,
                }
            }
        };

        let rendered = render_local(
            self.local,
            &self.paths,
            state,
            ServerSettings::from(&self.config),
            tls,
        );
        if let OpKind::Upgrade { version } = &op.kind {
            self.workload.install_version(version).await?;
        }
        self.workload.write_config(&rendered).await?;
        info!(
            "{} restarting for {} op {} at {}",
            self.local,
            op.kind.name(),
            op.token,
            rendered.config_version
        );
        self.workload.restart().await
    }

    fn is_verified(&self, op: &RollingOp, probe: &WorkloadProbe) -> bool {
        if !probe.health.is_serving() || probe.config_version < op.required_config_version {
            return false;
        }
        match op.kind {
            OpKind::TlsCutover { generation } => probe.tls_generation >= generation,
            _ => true,
        }
    }

    async fn runs_target_version(&self, op: &RollingOp) -> bool {
        let OpKind::Upgrade { version } = &op.kind else {
            return true;
        };
        match self.workload.running_version().await {
            Ok(running) if running.as_deref() == Some(version.as_str()) => true,
            Ok(running) => {
                debug!(
                    "{} serving {:?} while upgrading to {}",
                    self.local, running, version
                );
                false
            }
            Err(e) => {
                debug!("{} could not read the server version: {}", self.local, e);
                false
            }
        }
    }

    /// Poll the local server a bounded number of times. Verification carries
    /// over to later passes until the timeout is reached.
    async fn verify(&self, snapshot: &mut Snapshot, token: OpToken) -> Result<StepOutcome> {
        let Some(op) = snapshot.state.ensemble.op(token).cloned() else {
            return Ok(StepOutcome::Idle);
        };

        let attempts = self.config.verify_poll_attempts.max(1);
        for attempt in 0..attempts {
            match self.workload.probe().await {
                Ok(probe) if self.is_verified(&op, &probe) => {
                    if self.runs_target_version(&op).await {
                        return self.complete_target(snapshot, op, probe).await;
                    }
                }
                Ok(probe) => debug!(
                    "{} not yet verified for op {}: {} at {}",
                    self.local, token, probe.health, probe.config_version
                ),
                Err(e) => debug!("{} probe failed during verification: {}", self.local, e),
            }
            if attempt + 1 < attempts {
                self.clock.sleep(self.config.verify_poll_interval).await;
            }
        }

        let now = self.clock.now_ms();
        let elapsed = now.saturating_sub(op.phase_changed_ms);
        if elapsed > self.config.verification_timeout.as_millis() as u64 {
            let reason = ControllerError::VerificationFailed {
                unit: self.local,
                token,
                reason: format!("not serving at {} after {} ms", op.required_config_version, elapsed),
            };
            warn!("{}", reason);
            return self.record_failure(snapshot, token, reason.to_string()).await;
        }
        Ok(StepOutcome::Verifying { token })
    }

    async fn complete_target(
        &self,
        snapshot: &mut Snapshot,
        op: RollingOp,
        probe: WorkloadProbe,
    ) -> Result<StepOutcome> {
        let now = self.clock.now_ms();
        let local = self.local;
        let token = op.token;

        let result = self
            .peer
            .commit(snapshot, |state| {
                let tls_enabled = state.ensemble.tls.enabled;
                let record = state.unit_mut(local);
                record.health = probe.health;
                record.is_leader = probe.is_leader;
                record.acked_config_version = probe.config_version;
                record.tls_generation = probe.tls_generation;
                if tls_enabled {
                    let staged = record.tls.staged_generation();
                    if staged.is_some() && staged <= Some(probe.tls_generation) {
                        record.tls.active = record.tls.staged.take();
                    }
                } else if matches!(op.kind, OpKind::TlsCutover { .. }) {
                    record.tls.active = None;
                    record.tls.staged = None;
                }
                if let OpKind::Upgrade { version } = &op.kind {
                    record.version = Some(version.clone());
                }

                let ensemble = &mut state.ensemble;
                if ensemble.lock.as_ref().map(|lease| lease.holder) == Some(local) {
                    ensemble.lock = None;
                }
                if let Some(op) = ensemble.op_mut(token) {
                    op.queue.retain(|target| *target != local);
                    op.completed.push(local);
                    op.holder = None;
                    op.attempts = 0;
                    op.last_error = None;
                    op.set_phase(OpPhase::Pending, now);
                }
                finish_drained(state, now).contains(&token)
            })
            .await?;

        match result {
            Some(true) => {
                info!("{} verified; rolling op {} finished", self.local, token);
                Ok(StepOutcome::Completed { token })
            }
            Some(false) => {
                info!("{} verified for rolling op {}; lock released", self.local, token);
                Ok(StepOutcome::Verified { token })
            }
            None => Ok(StepOutcome::Contended),
        }
    }

    async fn record_failure(
        &self,
        snapshot: &mut Snapshot,
        token: OpToken,
        reason: String,
    ) -> Result<StepOutcome> {
        let now = self.clock.now_ms();
        let budget = self.config.retry_budget;
        let local = self.local;

        let result = self
            .peer
            .commit(snapshot, |state| {
                let ensemble = &mut state.ensemble;
                let op = ensemble.op_mut(token)?;
                op.attempts += 1;
                op.last_error = Some(reason.clone());
                op.set_phase(OpPhase::Failed, now);
                let attempts = op.attempts;

                if attempts > budget {
                    let exhausted = ControllerError::RetriesExhausted {
                        token,
                        attempts,
                        reason: reason.clone(),
                    };
                    ensemble.fatal = Some(FatalCondition {
                        token,
                        reason: exhausted.to_string(),
                        since_ms: now,
                    });
                    Some((attempts, true))
                } else {
                    op.holder = None;
                    if ensemble.lock.as_ref().map(|lease| lease.holder) == Some(local) {
                        ensemble.lock = None;
                    }
                    Some((attempts, false))
                }
            })
            .await?;

        match result {
            Some(Some((attempts, true))) => {
                error!(
                    "Rolling op {} on {} exhausted {} attempts: {}; operator intervention required",
                    token, self.local, attempts, reason
                );
                Ok(StepOutcome::Escalated { token })
            }
            Some(Some((attempts, false))) => {
                warn!(
                    "Rolling op {} on {} failed (attempt {}): {}; retrying after {:?}",
                    token,
                    self.local,
                    attempts,
                    reason,
                    self.config.backoff(attempts)
                );
                Ok(StepOutcome::Retrying { token, attempts })
            }
            Some(None) => Ok(StepOutcome::Idle),
            None => Ok(StepOutcome::Contended),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::time::Duration;
    use zkctl_core::{
        ChangeKind, ConfigChange, ConfigVersion, Credential, HealthStatus, ManualClock,
        PeerStateStore, RenderedConfig,
    };
    use zkctl_store::InMemoryPeerStore;

    /// Server that comes back serving at whatever config it was given,
    /// unless told to stay down.
    struct FakeServer {
        written: Mutex<Option<RenderedConfig>>,
        running: Mutex<WorkloadProbe>,
        restarts: Mutex<u32>,
        stay_down: Mutex<bool>,
        tls_generation: Mutex<u64>,
        staged_version: Mutex<Option<String>>,
        version: Mutex<Option<String>>,
        /// Restarts keep running the old binaries
        ignores_upgrades: Mutex<bool>,
    }

    impl FakeServer {
        fn new() -> Self {
            Self {
                written: Mutex::new(None),
                running: Mutex::new(WorkloadProbe::unreachable()),
                restarts: Mutex::new(0),
                stay_down: Mutex::new(false),
                tls_generation: Mutex::new(0),
                staged_version: Mutex::new(None),
                version: Mutex::new(None),
                ignores_upgrades: Mutex::new(false),
            }
        }
    }

    #[async_trait]
    impl Workload for FakeServer {
        async fn write_config(&self, config: &RenderedConfig) -> Result<()> {
            *self.written.lock() = Some(config.clone());
            Ok(())
        }

        async fn restart(&self) -> Result<()> {
            *self.restarts.lock() += 1;
            let staged = self.staged_version.lock().take();
            if staged.is_some() && !*self.ignores_upgrades.lock() {
                *self.version.lock() = staged;
            }
            let version = self
                .written
                .lock()
                .as_ref()
                .map(|config| config.config_version)
                .unwrap_or_default();
            let health = if *self.stay_down.lock() {
                HealthStatus::Syncing
            } else {
                HealthStatus::Serving
            };
            *self.running.lock() = WorkloadProbe {
                health,
                is_leader: false,
                config_version: version,
                tls_generation: *self.tls_generation.lock(),
            };
            Ok(())
        }

        async fn probe(&self) -> Result<WorkloadProbe> {
            Ok(*self.running.lock())
        }

        async fn install_credentials(&self, _credentials: &[Credential]) -> Result<()> {
            Ok(())
        }

        async fn install_tls(&self, _material: Option<&TlsMaterial>, generation: u64) -> Result<()> {
            *self.tls_generation.lock() = generation;
            Ok(())
        }

        async fn update_trust_bundle(&self, _bundle: &[String]) -> Result<()> {
            Ok(())
        }

        async fn install_version(&self, version: &str) -> Result<()> {
            *self.staged_version.lock() = Some(version.to_string());
            Ok(())
        }

        async fn running_version(&self) -> Result<Option<String>> {
            Ok(self.version.lock().clone())
        }
    }

    struct Harness {
        store: InMemoryPeerStore,
        clock: ManualClock,
        servers: Vec<Arc<FakeServer>>,
        coordinators: Vec<RollingOpsCoordinator>,
    }

    fn harness(units: u32) -> Harness {
        let store = InMemoryPeerStore::new();
        let clock = ManualClock::new(1_000_000);
        let config = ControllerConfig::default()
            .with_data_dir("/tmp/zkctl-rolling")
            .with_verify_polling(Duration::from_millis(10), 2)
            .with_retry_budget(1)
            .with_backoff(Duration::from_secs(1), Duration::from_secs(4));

        let mut servers = Vec::new();
        let mut coordinators = Vec::new();
        for id in 0..units {
            let server = Arc::new(FakeServer::new());
            servers.push(server.clone());
            coordinators.push(RollingOpsCoordinator::new(
                UnitId::new(id),
                config.clone(),
                PeerHandle::new(Arc::new(store.clone())),
                server,
                Arc::new(clock.clone()),
            ));
        }
        Harness {
            store,
            clock,
            servers,
            coordinators,
        }
    }

    async fn seed(h: &Harness, members: &[u32]) {
        let mut snapshot = h.store.read().await.unwrap();
        for &id in members {
            let record = snapshot.state.unit_mut(UnitId::new(id));
            record.address = Some(format!("zk-{}", id));
            record.heartbeat_ms = Some(h.clock.now_ms());
            record.health = HealthStatus::Serving;
            snapshot
                .state
                .ensemble
                .members
                .insert(UnitId::new(id), Role::Voter);
        }
        snapshot.state.ensemble.config_version = ConfigVersion::new(1);
        h.store
            .compare_and_write(snapshot.version, &snapshot.state)
            .await
            .unwrap();
    }

    async fn request_restart(h: &Harness, targets: Vec<UnitId>) -> OpToken {
        let mut snapshot = h.store.read().await.unwrap();
        let now = h.clock.now_ms();
        let admission = h.coordinators[0].request(
            &mut snapshot.state.ensemble,
            OpKind::Restart {
                reason: "tick-time".to_string(),
            },
            targets,
            now,
        );
        h.store
            .compare_and_write(snapshot.version, &snapshot.state)
            .await
            .unwrap();
        admission.token().unwrap()
    }

    fn applying(state: &PeerState) -> usize {
        state
            .ensemble
            .ops
            .iter()
            .filter(|op| matches!(op.phase, OpPhase::Applying | OpPhase::Verifying))
            .count()
    }

    #[test]
    fn test_application_order_puts_leader_last() {
        let mut members = BTreeMap::new();
        members.insert(UnitId::new(0), Role::Voter);
        members.insert(UnitId::new(1), Role::Voter);
        members.insert(UnitId::new(2), Role::Joining);
        members.insert(UnitId::new(3), Role::Observer);
        members.insert(UnitId::new(4), Role::Leaving);

        let order = application_order(&members, Some(UnitId::new(0)));
        let ordinals: Vec<u32> = order.iter().map(UnitId::ordinal).collect();
        assert_eq!(ordinals, vec![3, 2, 1, 0]);
    }

    #[tokio::test]
    async fn test_request_deduplicates_and_rejects() {
        let h = harness(3);
        let mut record = EnsembleRecord::default();
        let coordinator = &h.coordinators[0];

        let first = coordinator.request(
            &mut record,
            OpKind::Restart {
                reason: "a".to_string(),
            },
            vec![UnitId::new(1)],
            0,
        );
        let second = coordinator.request(
            &mut record,
            OpKind::Restart {
                reason: "b".to_string(),
            },
            vec![UnitId::new(1), UnitId::new(2)],
            0,
        );
        assert_eq!(first, second);
        assert_eq!(record.ops.len(), 1);
        assert_eq!(record.ops[0].queue.len(), 2);

        // Once the restart has begun, another one is queued behind it.
        record.ops[0].completed.push(UnitId::new(1));
        let third = coordinator.request(
            &mut record,
            OpKind::Restart {
                reason: "c".to_string(),
            },
            vec![UnitId::new(1)],
            0,
        );
        assert_ne!(third, first);
        assert_eq!(record.ops.len(), 2);
        record.ops.pop_back();

        let empty = coordinator.request(&mut record, OpKind::TlsCutover { generation: 1 }, vec![], 0);
        assert!(matches!(empty, Admission::Rejected(_)));

        let unsafe_change = ConfigChange {
            kind: ChangeKind::RemoveVoter,
            unit: UnitId::new(1),
            from_version: ConfigVersion::new(1),
            to_version: ConfigVersion::new(2),
            voters_before: [UnitId::new(0), UnitId::new(1)].into_iter().collect(),
            voters_after: [UnitId::new(0)].into_iter().collect(),
        };
        let rejected = coordinator.request(
            &mut record,
            OpKind::Reconfigure {
                change: unsafe_change,
            },
            vec![UnitId::new(0)],
            0,
        );
        assert!(matches!(rejected, Admission::Rejected(_)));
    }

    #[tokio::test]
    async fn test_rolling_restart_one_unit_at_a_time() {
        let h = harness(3);
        seed(&h, &[0, 1, 2]).await;
        let token = request_restart(&h, vec![UnitId::new(1), UnitId::new(2), UnitId::new(0)]).await;

        // Units not at the head of the queue wait
        let mut snapshot = h.store.read().await.unwrap();
        assert_eq!(
            h.coordinators[0].step(&mut snapshot).await.unwrap(),
            StepOutcome::Waiting { on: UnitId::new(1) }
        );

        let mut completed = false;
        for _ in 0..3 {
            for coordinator in &h.coordinators {
                let mut snapshot = h.store.read().await.unwrap();
                let outcome = coordinator.step(&mut snapshot).await.unwrap();
                assert!(applying(&h.store.state()) <= 1);
                if outcome == (StepOutcome::Completed { token }) {
                    completed = true;
                }
            }
        }

        assert!(completed);
        let state = h.store.state();
        assert!(state.ensemble.ops.is_empty());
        assert!(state.ensemble.lock.is_none());
        for server in &h.servers {
            assert_eq!(*server.restarts.lock(), 1);
        }
    }

    #[tokio::test]
    async fn test_verification_failure_retries_then_escalates() {
        let h = harness(2);
        seed(&h, &[0, 1]).await;
        *h.servers[0].stay_down.lock() = true;
        let token = request_restart(&h, vec![UnitId::new(0), UnitId::new(1)]).await;

        let mut snapshot = h.store.read().await.unwrap();
        assert_eq!(
            h.coordinators[0].step(&mut snapshot).await.unwrap(),
            StepOutcome::Verifying { token }
        );

        h.clock.advance(Duration::from_secs(121));
        let mut snapshot = h.store.read().await.unwrap();
        assert_eq!(
            h.coordinators[0].step(&mut snapshot).await.unwrap(),
            StepOutcome::Retrying { token, attempts: 1 }
        );
        assert!(h.store.state().ensemble.lock.is_none());

        // Still inside the backoff window
        let mut snapshot = h.store.read().await.unwrap();
        assert!(matches!(
            h.coordinators[0].step(&mut snapshot).await.unwrap(),
            StepOutcome::BackingOff { .. }
        ));

        h.clock.advance(Duration::from_secs(2));
        let mut snapshot = h.store.read().await.unwrap();
        assert_eq!(
            h.coordinators[0].step(&mut snapshot).await.unwrap(),
            StepOutcome::Verifying { token }
        );
        h.clock.advance(Duration::from_secs(121));
        let mut snapshot = h.store.read().await.unwrap();
        assert_eq!(
            h.coordinators[0].step(&mut snapshot).await.unwrap(),
            StepOutcome::Escalated { token }
        );

        let state = h.store.state();
        assert!(state.ensemble.fatal.is_some());
        assert_eq!(state.ensemble.lock.as_ref().map(|l| l.holder), Some(UnitId::new(0)));

        // The other unit neither proceeds nor takes over
        let mut snapshot = h.store.read().await.unwrap();
        assert_eq!(
            h.coordinators[1].step(&mut snapshot).await.unwrap(),
            StepOutcome::Blocked { token }
        );

        // Operator fixes the server and releases the op
        *h.servers[0].stay_down.lock() = false;
        let mut snapshot = h.store.read().await.unwrap();
        assert!(h.coordinators[1].release(&mut snapshot, token).await.unwrap());
        let state = h.store.state();
        assert!(state.ensemble.fatal.is_none());
        assert!(state.ensemble.lock.is_none());

        let mut snapshot = h.store.read().await.unwrap();
        assert_eq!(
            h.coordinators[0].step(&mut snapshot).await.unwrap(),
            StepOutcome::Verified { token }
        );
    }

    #[tokio::test]
    async fn test_stale_lock_is_taken_over() {
        let h = harness(3);
        seed(&h, &[0, 1, 2]).await;
        *h.servers[1].stay_down.lock() = true;
        let token = request_restart(&h, vec![UnitId::new(1), UnitId::new(2), UnitId::new(0)]).await;

        let mut snapshot = h.store.read().await.unwrap();
        assert_eq!(
            h.coordinators[1].step(&mut snapshot).await.unwrap(),
            StepOutcome::Verifying { token }
        );

        // Unit 1 goes silent; the others keep heartbeating
        h.clock.advance(Duration::from_secs(91));
        let mut snapshot = h.store.read().await.unwrap();
        let now = h.clock.now_ms();
        for id in [0, 2] {
            snapshot.state.unit_mut(UnitId::new(id)).heartbeat_ms = Some(now);
        }
        h.store
            .compare_and_write(snapshot.version, &snapshot.state)
            .await
            .unwrap();

        let mut snapshot = h.store.read().await.unwrap();
        let outcome = h.coordinators[2].step(&mut snapshot).await.unwrap();
        assert_eq!(outcome, StepOutcome::Verified { token });

        let state = h.store.state();
        let op = state.ensemble.op(token).unwrap();
        assert_eq!(op.completed, vec![UnitId::new(2)]);
        assert_eq!(op.queue.iter().copied().collect::<Vec<_>>(), vec![UnitId::new(0), UnitId::new(1)]);
    }

    async fn request_upgrade(h: &Harness, version: &str, targets: Vec<UnitId>) -> OpToken {
        let mut snapshot = h.store.read().await.unwrap();
        let now = h.clock.now_ms();
        let admission = h.coordinators[0].request(
            &mut snapshot.state.ensemble,
            OpKind::Upgrade {
                version: version.to_string(),
            },
            targets,
            now,
        );
        h.store
            .compare_and_write(snapshot.version, &snapshot.state)
            .await
            .unwrap();
        admission.token().unwrap()
    }

    #[tokio::test]
    async fn test_upgrade_rolls_new_version() {
        let h = harness(2);
        seed(&h, &[0, 1]).await;
        let token = request_upgrade(&h, "3.9.2", vec![UnitId::new(1), UnitId::new(0)]).await;

        for id in [1, 0] {
            let mut snapshot = h.store.read().await.unwrap();
            let outcome = h.coordinators[id].step(&mut snapshot).await.unwrap();
            assert!(matches!(
                outcome,
                StepOutcome::Verified { .. } | StepOutcome::Completed { .. }
            ));
        }

        let state = h.store.state();
        assert!(state.ensemble.op(token).is_none());
        assert_eq!(state.ensemble.version.as_deref(), Some("3.9.2"));
        for (id, server) in h.servers.iter().enumerate() {
            assert_eq!(server.version.lock().as_deref(), Some("3.9.2"));
            let record = state.unit(UnitId::new(id as u32)).unwrap();
            assert_eq!(record.version.as_deref(), Some("3.9.2"));
        }
    }

    #[tokio::test]
    async fn test_upgrade_needs_the_new_version_serving() {
        let h = harness(2);
        seed(&h, &[0, 1]).await;
        *h.servers[0].ignores_upgrades.lock() = true;
        let token = request_upgrade(&h, "3.9.2", vec![UnitId::new(0), UnitId::new(1)]).await;

        // Serving, but on the old binaries.
        let mut snapshot = h.store.read().await.unwrap();
        assert_eq!(
            h.coordinators[0].step(&mut snapshot).await.unwrap(),
            StepOutcome::Verifying { token }
        );
        assert!(h.servers[0].running.lock().health.is_serving());

        h.clock.advance(Duration::from_secs(121));
        let mut snapshot = h.store.read().await.unwrap();
        assert_eq!(
            h.coordinators[0].step(&mut snapshot).await.unwrap(),
            StepOutcome::Retrying { token, attempts: 1 }
        );
        assert_eq!(h.store.state().ensemble.version, None);
    }

    #[test]
    fn test_pre_upgrade_check() {
        let mut state = PeerState::default();
        state.ensemble.config_version = ConfigVersion::new(2);
        for id in 0..3 {
            let unit = UnitId::new(id);
            state.ensemble.members.insert(unit, Role::Voter);
            let record = state.unit_mut(unit);
            record.address = Some(format!("zk-{}", id));
            record.heartbeat_ms = Some(1_000_000);
            record.health = HealthStatus::Serving;
            record.acked_config_version = ConfigVersion::new(2);
        }
        let view = crate::cluster_view::ClusterView::new(UnitId::new(0), Duration::from_secs(30));
        assert!(pre_upgrade_check(&view.observe(&state, 1_000_000), false).is_ok());

        // One member behind the committed config.
        state.unit_mut(UnitId::new(2)).acked_config_version = ConfigVersion::new(1);
        let ensemble = view.observe(&state, 1_000_000);
        let blocked = pre_upgrade_check(&ensemble, false).unwrap_err();
        assert!(blocked.contains("unit/2"), "{}", blocked);
        assert!(pre_upgrade_check(&ensemble, true).is_ok());

        // Without a quorum not even a rollback starts.
        state.unit_mut(UnitId::new(1)).health = HealthStatus::Unreachable;
        state.unit_mut(UnitId::new(2)).health = HealthStatus::Unreachable;
        let ensemble = view.observe(&state, 1_000_000);
        assert!(pre_upgrade_check(&ensemble, true).is_err());
    }

    #[tokio::test]
    async fn test_departed_unit_is_forgotten() {
        let h = harness(3);
        seed(&h, &[0, 1, 2]).await;
        let token = request_restart(&h, vec![UnitId::new(1), UnitId::new(2)]).await;

        let mut snapshot = h.store.read().await.unwrap();
        assert_eq!(
            h.coordinators[1].step(&mut snapshot).await.unwrap(),
            StepOutcome::Verified { token }
        );

        let mut state = h.store.state();
        let now = h.clock.now_ms();
        h.coordinators[0].forget_unit(&mut state, UnitId::new(2), now);
        assert!(state.ensemble.ops.is_empty());
        assert!(state.ensemble.lock.is_none());
    }
}
