//! # Error Types
//!
//! Error taxonomy for ensemble reconciliation.

use crate::{OpToken, UnitId};
use thiserror::Error;

/// Errors raised while observing, planning or applying ensemble changes.
///
/// The variants follow the recovery policy of the controller:
///
/// - **Transient**: a unit could not be reached; retried with backoff
/// - **Quorum risk**: a change would break the reconfiguration safety rule
/// - **Lock contention**: a compare-and-write lost the race; retried next pass
/// - **Verification failure**: a restarted unit never came back serving
/// - **Retries exhausted**: fatal, needs operator intervention
/// - **Rotation stalled**: a unit has not acknowledged new material yet
///
/// # Examples
///
/// ```rust
/// use zkctl_core::ControllerError;
///
/// let error = ControllerError::transient("connection refused");
/// assert!(error.is_retryable());
/// assert!(!error.is_fatal());
/// ```
#[derive(Error, Debug)]
pub enum ControllerError {
    /// A unit could not be reached or did not answer in time
    #[error("Transient error: {message}")]
    Transient { message: String },

    /// Applying the change could lose quorum
    #[error("Quorum risk: {reason}")]
    QuorumRisk { reason: String },

    /// A compare-and-write on the peer state observed a newer version
    #[error("Lock contention: expected version {expected}, found {actual}")]
    LockContention { expected: u64, actual: u64 },

    /// A restarted unit did not reach `serving` at the current config version
    #[error("Verification of {unit} failed for op {token}: {reason}")]
    VerificationFailed {
        unit: UnitId,
        token: OpToken,
        reason: String,
    },

    /// The retry budget of a rolling operation is spent
    #[error("Rolling operation {token} exhausted {attempts} attempts: {reason}")]
    RetriesExhausted {
        token: OpToken,
        attempts: u32,
        reason: String,
    },

    /// A credential or certificate rotation is waiting for acknowledgments
    #[error("Rotation of {subject} stalled waiting for {waiting_on:?}")]
    RotationStalled {
        subject: String,
        waiting_on: Vec<UnitId>,
    },

    /// Referenced unit is not part of the peer state
    #[error("Unit {unit} not found")]
    UnitNotFound { unit: UnitId },

    /// Operator-provided configuration is invalid
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    /// Operator-provided key material could not be parsed
    #[error("Invalid key material: {reason}")]
    InvalidKeyMaterial { reason: String },

    /// Peer state store failure
    #[error("Store error: {message}")]
    Store { message: String },

    /// Workload (ZooKeeper process) control failure
    #[error("Workload error: {message}")]
    Workload { message: String },

    /// Certificate signing collaborator failure
    #[error("Certificate authority error: {message}")]
    Authority { message: String },

    /// JSON serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// File system I/O failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Unexpected internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Result alias used across zkctl crates.
pub type Result<T> = std::result::Result<T, ControllerError>;

impl ControllerError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    pub fn quorum_risk(reason: impl Into<String>) -> Self {
        Self::QuorumRisk {
            reason: reason.into(),
        }
    }

    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    pub fn invalid_key(reason: impl Into<String>) -> Self {
        Self::InvalidKeyMaterial {
            reason: reason.into(),
        }
    }

    pub fn store(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
        }
    }

    pub fn workload(message: impl Into<String>) -> Self {
        Self::Workload {
            message: message.into(),
        }
    }

    pub fn authority(message: impl Into<String>) -> Self {
        Self::Authority {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Conditions absorbed by the coordinator and retried on a later pass.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transient { .. }
                | Self::LockContention { .. }
                | Self::VerificationFailed { .. }
                | Self::RotationStalled { .. }
                | Self::Workload { .. }
                | Self::Authority { .. }
        )
    }

    /// Conditions that must surface to the operator-visible status.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::RetriesExhausted { .. } | Self::QuorumRisk { .. } | Self::InvalidConfig { .. }
        )
    }
}

impl From<anyhow::Error> for ControllerError {
    fn from(err: anyhow::Error) -> Self {
        ControllerError::Internal {
            message: err.to_string(),
        }
    }
}
