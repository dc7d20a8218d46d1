//! # Credentials
//!
//! Internal account secrets with a dual-validity rotation window.

use crate::CredentialEpoch;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Length of generated secrets.
pub const SECRET_LENGTH: usize = 32;

/// Generate a random alphanumeric secret.
pub fn generate_secret() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SECRET_LENGTH)
        .map(char::from)
        .collect()
}

/// Secret announced to every unit but not yet authoritative.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingSecret {
    pub secret: String,
    pub epoch: CredentialEpoch,
    /// When the secret was last announced
    pub announced_ms: u64,
}

impl fmt::Debug for PendingSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingSecret")
            .field("secret", &"<redacted>")
            .field("epoch", &self.epoch)
            .field("announced_ms", &self.announced_ms)
            .finish()
    }
}

/// One managed account.
///
/// While `pending` is set both secrets are valid on every unit. Cutover
/// promotes the pending secret and drops the old one.
///
/// # Examples
///
/// ```rust
/// use zkctl_core::Credential;
///
/// let mut credential = Credential::new("super", "old");
/// credential.announce("new".to_string(), 100);
/// assert!(credential.authenticates("old"));
/// assert!(credential.authenticates("new"));
///
/// credential.cut_over();
/// assert!(!credential.authenticates("old"));
/// assert!(credential.authenticates("new"));
/// ```
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub username: String,
    pub current: String,
    pub epoch: CredentialEpoch,
    pub pending: Option<PendingSecret>,
}

impl Credential {
    pub fn new(username: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            current: secret.into(),
            epoch: CredentialEpoch::new(1),
            pending: None,
        }
    }

    pub fn is_rotating(&self) -> bool {
        self.pending.is_some()
    }

    /// Epoch a unit must acknowledge before the next step can happen.
    pub fn required_epoch(&self) -> CredentialEpoch {
        self.pending
            .as_ref()
            .map(|pending| pending.epoch)
            .unwrap_or(self.epoch)
    }

    /// Secrets a unit must accept right now, current first.
    pub fn valid_secrets(&self) -> Vec<&str> {
        let mut secrets = vec![self.current.as_str()];
        if let Some(pending) = &self.pending {
            secrets.push(pending.secret.as_str());
        }
        secrets
    }

    pub fn authenticates(&self, secret: &str) -> bool {
        self.valid_secrets().contains(&secret)
    }

    /// Start (or restart) phase one with `secret` as the pending value.
    ///
    /// Replacing an outstanding pending secret allocates a fresh epoch so
    /// acknowledgments of the replaced secret do not count.
    pub fn announce(&mut self, secret: String, now_ms: u64) -> CredentialEpoch {
        let epoch = self.required_epoch().next();
        self.pending = Some(PendingSecret {
            secret,
            epoch,
            announced_ms: now_ms,
        });
        epoch
    }

    /// Re-announce the outstanding pending secret without changing it.
    pub fn reannounce(&mut self, now_ms: u64) -> bool {
        match &mut self.pending {
            Some(pending) => {
                pending.announced_ms = now_ms;
                true
            }
            None => false,
        }
    }

    /// Phase two: the pending secret becomes current.
    pub fn cut_over(&mut self) -> bool {
        match self.pending.take() {
            Some(pending) => {
                self.current = pending.secret;
                self.epoch = pending.epoch;
                true
            }
            None => false,
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("current", &"<redacted>")
            .field("epoch", &self.epoch)
            .field("pending", &self.pending)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_secret_shape() {
        let secret = generate_secret();
        assert_eq!(secret.len(), SECRET_LENGTH);
        assert!(secret.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(secret, generate_secret());
    }

    #[test]
    fn test_epochs_advance() {
        let mut credential = Credential::new("sync", "a");
        assert_eq!(credential.required_epoch(), CredentialEpoch::new(1));

        assert_eq!(credential.announce("b".to_string(), 0), CredentialEpoch::new(2));
        assert_eq!(credential.announce("c".to_string(), 5), CredentialEpoch::new(3));
        assert!(!credential.authenticates("b"));
        assert!(credential.reannounce(9));

        assert!(credential.cut_over());
        assert_eq!(credential.epoch, CredentialEpoch::new(3));
        assert_eq!(credential.current, "c");
        assert!(!credential.cut_over());
        assert!(!credential.reannounce(10));
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let mut credential = Credential::new("super", "hunter2hunter2");
        credential.announce("swordfish".to_string(), 0);
        let rendered = format!("{:?}", credential);
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("swordfish"));
    }
}
