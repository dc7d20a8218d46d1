//! Certificate lifecycle: request, staging and ensemble-wide cutover.
//!
//! The ensemble record carries a target generation. Each unit requests a
//! certificate for that generation from the authority and stages it once
//! signed, adding the new CA to the trust bundle of its running server.
//! When every member has staged the generation, the planner requests one
//! `TlsCutover` rolling operation so units switch one at a time, each
//! trusting both the old and the new CA until the rollout ends.

use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};
use zkctl_core::{
    Certificate, CertificateAuthority, CertificateRequest, ControllerError, PeerState, RequestId,
    Result, Role, SigningRequest, TlsDesired, TlsState, UnitId, Workload,
};

/// What the planner should do about TLS this pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TlsAction {
    None,
    /// A new generation was started; units request certificates
    Request { generation: u64 },
    /// Units still requesting or awaiting signatures
    Waiting { generation: u64, on: Vec<UnitId> },
    /// Every member is ready; roll out the generation
    Cutover { generation: u64 },
}

/// Parse a PEM private key.
pub fn validate_private_key(pem: &str) -> Result<()> {
    KeyPair::from_pem(pem)
        .map(|_| ())
        .map_err(|e| ControllerError::invalid_key(e.to_string()))
}

/// Generate a fresh key pair, PEM encoded.
pub fn generate_private_key() -> Result<String> {
    KeyPair::generate()
        .map(|key| key.serialize_pem())
        .map_err(|e| ControllerError::invalid_key(e.to_string()))
}

/// Build a PEM certificate signing request for `subject` and `sans`.
pub fn signing_request_pem(key_pem: &str, subject: &str, sans: &[String]) -> Result<String> {
    let key = KeyPair::from_pem(key_pem).map_err(|e| ControllerError::invalid_key(e.to_string()))?;
    let mut params = CertificateParams::new(sans.to_vec())
        .map_err(|e| ControllerError::invalid_key(e.to_string()))?;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, subject);
    params.distinguished_name = dn;

    params
        .serialize_request(&key)
        .and_then(|csr| csr.pem())
        .map_err(|e| ControllerError::invalid_key(e.to_string()))
}

pub struct TlsCoordinator {
    local: UnitId,
    app_name: String,
    renewal_threshold: f64,
    authority: Arc<dyn CertificateAuthority>,
    workload: Arc<dyn Workload>,
}

impl TlsCoordinator {
    pub fn new(
        local: UnitId,
        app_name: impl Into<String>,
        renewal_threshold: f64,
        authority: Arc<dyn CertificateAuthority>,
        workload: Arc<dyn Workload>,
    ) -> Self {
        Self {
            local,
            app_name: app_name.into(),
            renewal_threshold,
            authority,
            workload,
        }
    }

    pub fn subject(&self) -> String {
        format!("{}-{}", self.app_name, self.local.ordinal())
    }

    pub fn sans(&self, host: Option<&str>) -> Vec<String> {
        let subject = self.subject();
        let mut sans = vec![subject.clone()];
        if let Some(host) = host {
            if host != subject {
                sans.push(host.to_string());
            }
        }
        sans.push(format!("{}.{}-endpoints", subject, self.app_name));
        sans
    }

    /// Planner side: move the ensemble TLS record toward `desired`.
    ///
    /// A new generation starts when TLS is switched on or off, when the
    /// expected CA differs from the active one, when any member's
    /// certificate is close to expiry, or when `renew` is set. Nothing new
    /// starts while a generation is still rolling out.
    pub fn ensure(
        &self,
        state: &mut PeerState,
        desired: &TlsDesired,
        renew: bool,
        now_ms: u64,
    ) -> TlsAction {
        let members = rolling_members(state);
        let tls = &mut state.ensemble.tls;

        if desired.enabled != tls.enabled {
            tls.enabled = desired.enabled;
            tls.generation += 1;
            tls.state = match (desired.enabled, tls.active_ca.is_some()) {
                (true, false) => TlsState::Requested,
                _ => TlsState::Renewing,
            };
            info!(
                "{} {} TLS at generation {}",
                self.local,
                if desired.enabled { "enabling" } else { "disabling" },
                tls.generation
            );
            return TlsAction::Request {
                generation: tls.generation,
            };
        }

        if !tls.enabled && tls.is_converged() {
            return TlsAction::None;
        }

        if tls.is_converged() {
            let ca_changed = matches!(
                (&desired.ca, &tls.active_ca),
                (Some(wanted), Some(active)) if wanted != active
            );
            let expiring: Vec<UnitId> = members
                .iter()
                .filter(|id| {
                    state
                        .units
                        .get(*id)
                        .and_then(|record| record.tls.active.as_ref())
                        .map(|cert| cert.needs_renewal(now_ms, self.renewal_threshold))
                        .unwrap_or(false)
                })
                .copied()
                .collect();

            if !(renew || ca_changed || !expiring.is_empty()) {
                return TlsAction::None;
            }

            let tls = &mut state.ensemble.tls;
            tls.generation += 1;
            tls.state = TlsState::Renewing;
            info!(
                "{} renewing certificates at generation {} (requested: {}, CA changed: {}, expiring: {:?})",
                self.local, tls.generation, renew, ca_changed, expiring
            );
            return TlsAction::Request {
                generation: tls.generation,
            };
        }

        let generation = state.ensemble.tls.generation;
        if !state.ensemble.tls.enabled {
            return TlsAction::Cutover { generation };
        }

        let waiting: Vec<UnitId> = members
            .iter()
            .filter(|id| {
                let ready = state.units.get(*id).map(|record| {
                    record.tls.staged_generation().unwrap_or(0) >= generation
                        || record.tls.active.as_ref().map(|c| c.generation).unwrap_or(0) >= generation
                });
                !ready.unwrap_or(false)
            })
            .copied()
            .collect();

        if waiting.is_empty() {
            TlsAction::Cutover { generation }
        } else {
            TlsAction::Waiting {
                generation,
                on: waiting,
            }
        }
    }

    /// Store an operator-provided key for the local unit.
    ///
    /// The key takes effect with the next generation. When TLS is on and no
    /// rollout is running, a new generation is started right away.
    pub fn set_private_key(&self, state: &mut PeerState, pem: &str) -> Result<bool> {
        validate_private_key(pem)?;
        let record = state.unit_mut(self.local);
        if record.tls.private_key.as_deref() == Some(pem) {
            return Ok(false);
        }
        record.tls.private_key = Some(pem.to_string());

        let tls = &mut state.ensemble.tls;
        if tls.enabled && tls.is_converged() {
            tls.generation += 1;
            tls.state = TlsState::Renewing;
            info!(
                "{} installed a new private key; renewing at generation {}",
                self.local, tls.generation
            );
        } else {
            info!("{} installed a new private key for the next generation", self.local);
        }
        Ok(true)
    }

    /// Unit side: make sure the local unit has key material and a staged
    /// certificate for the current generation. Returns true when `state`
    /// was changed.
    pub async fn unit_duties(&self, state: &mut PeerState, now_ms: u64) -> Result<bool> {
        let tls = state.ensemble.tls.clone();
        let record = state.unit_mut(self.local);

        if !tls.enabled {
            let had = record.tls.request.take().is_some() | record.tls.staged.take().is_some();
            return Ok(had);
        }

        let mut changed = false;
        if record.tls.private_key.is_none() {
            record.tls.private_key = Some(generate_private_key()?);
            debug!("{} generated a private key", self.local);
            changed = true;
        }

        let generation = tls.generation;
        let staged = record.tls.staged_generation().unwrap_or(0);
        let active = record.tls.active.as_ref().map(|c| c.generation).unwrap_or(0);
        if staged >= generation || active >= generation {
            return Ok(changed);
        }

        match record.tls.request.clone() {
            Some(request) if request.generation == generation => {
                let Some(signed) = self.authority.poll(request.request_id).await? else {
                    return Ok(changed);
                };

                let mut bundle = vec![signed.ca.clone()];
                if let Some(previous) = &tls.active_ca {
                    if previous != &signed.ca {
                        bundle.push(previous.clone());
                    }
                }
                self.workload.update_trust_bundle(&bundle).await?;

                record.tls.staged = Some(Certificate {
                    subject: self.subject(),
                    certificate: signed.certificate,
                    private_key: request.private_key,
                    ca: signed.ca,
                    chain: signed.chain,
                    not_before_ms: signed.not_before_ms,
                    not_after_ms: signed.not_after_ms,
                    generation,
                });
                record.tls.request = None;
                info!("{} staged certificate generation {}", self.local, generation);
                Ok(true)
            }
            _ => {
                let key = record
                    .tls
                    .private_key
                    .clone()
                    .ok_or_else(|| ControllerError::internal("private key missing"))?;
                let subject = self.subject();
                let sans = self.sans(record.address.as_deref());
                let csr = signing_request_pem(&key, &subject, &sans)?;
                let request_id = RequestId::new();

                self.authority
                    .submit(SigningRequest {
                        request_id,
                        unit: self.local,
                        subject,
                        sans,
                        csr,
                        generation,
                    })
                    .await
                    .map_err(|e| {
                        warn!("{} certificate request failed: {}", self.local, e);
                        e
                    })?;

                record.tls.request = Some(CertificateRequest {
                    request_id,
                    generation,
                    submitted_ms: now_ms,
                    private_key: key,
                });
                info!(
                    "{} requested certificate generation {} ({})",
                    self.local, generation, request_id
                );
                Ok(true)
            }
        }
    }
}

/// Members that take part in rolling operations.
fn rolling_members(state: &PeerState) -> BTreeSet<UnitId> {
    state
        .ensemble
        .members
        .iter()
        .filter(|(_, role)| **role != Role::Leaving)
        .map(|(id, _)| *id)
        .collect()
}
