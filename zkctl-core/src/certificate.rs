//! # Certificates
//!
//! TLS material, the signing request contract with the external authority,
//! and the ensemble-wide TLS lifecycle state.

use crate::{RequestId, Result, UnitId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Ensemble TLS lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsState {
    #[default]
    Absent,
    /// Certificates for the first generation are being requested
    Requested,
    /// Every unit runs the target generation
    Installed,
    /// A newer generation is being requested or rolled out
    Renewing,
}

impl fmt::Display for TlsState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TlsState::Absent => "absent",
            TlsState::Requested => "requested",
            TlsState::Installed => "installed",
            TlsState::Renewing => "renewing",
        };
        write!(f, "{}", name)
    }
}

/// Desired TLS posture fed in with configuration events.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsDesired {
    pub enabled: bool,
    /// Expected trust anchor; a different installed CA triggers renewal
    pub ca: Option<String>,
}

impl TlsDesired {
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ca: None,
        }
    }

    pub fn disabled() -> Self {
        Self::default()
    }
}

/// Signed certificate plus the private key it was issued for.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certificate {
    pub subject: String,
    pub certificate: String,
    pub private_key: String,
    pub ca: String,
    pub chain: Vec<String>,
    pub not_before_ms: u64,
    pub not_after_ms: u64,
    pub generation: u64,
}

impl Certificate {
    /// Share of the validity period still ahead at `now_ms`.
    pub fn remaining_fraction(&self, now_ms: u64) -> f64 {
        let total = self.not_after_ms.saturating_sub(self.not_before_ms);
        if total == 0 {
            return 0.0;
        }
        let remaining = self.not_after_ms.saturating_sub(now_ms);
        remaining as f64 / total as f64
    }

    pub fn needs_renewal(&self, now_ms: u64, threshold: f64) -> bool {
        self.remaining_fraction(now_ms) < threshold
    }
}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("subject", &self.subject)
            .field("generation", &self.generation)
            .field("not_after_ms", &self.not_after_ms)
            .finish_non_exhaustive()
    }
}

/// Certificate signing request submitted to the authority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningRequest {
    pub request_id: RequestId,
    pub unit: UnitId,
    pub subject: String,
    pub sans: Vec<String>,
    pub csr: String,
    pub generation: u64,
}

/// Authority reply to a signing request.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedCertificate {
    pub certificate: String,
    pub ca: String,
    pub chain: Vec<String>,
    pub not_before_ms: u64,
    pub not_after_ms: u64,
}

impl fmt::Debug for SignedCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignedCertificate")
            .field("not_before_ms", &self.not_before_ms)
            .field("not_after_ms", &self.not_after_ms)
            .finish_non_exhaustive()
    }
}

/// External signing collaborator.
///
/// Replies are asynchronous and keyed by request id; `poll` returns `None`
/// until the certificate is signed.
#[async_trait]
pub trait CertificateAuthority: Send + Sync {
    async fn submit(&self, request: SigningRequest) -> Result<()>;

    async fn poll(&self, request_id: RequestId) -> Result<Option<SignedCertificate>>;
}
