//! Operator actions.

use zkctl_core::config::SUPER_USER;
use zkctl_core::OpToken;

#[derive(Clone, PartialEq, Eq)]
pub enum OperatorAction {
    /// Current password of the admin account
    GetSuperPassword,
    /// Rotate a managed account, the admin account when no username is
    /// given, to `password` or a generated secret
    SetPassword {
        username: Option<String>,
        password: Option<String>,
    },
    /// Install a PEM private key for this unit's certificate requests
    SetTlsPrivateKey { key_pem: String },
    /// Clear an escalated failure after the cause was fixed; the op is
    /// retried from a clean attempt count
    ResolveFatal { token: Option<OpToken> },
}

impl OperatorAction {
    pub fn name(&self) -> &'static str {
        match self {
            OperatorAction::GetSuperPassword => "get-super-password",
            OperatorAction::SetPassword { .. } => "set-password",
            OperatorAction::SetTlsPrivateKey { .. } => "set-tls-private-key",
            OperatorAction::ResolveFatal { .. } => "resolve-fatal",
        }
    }

    pub fn set_password(password: impl Into<String>) -> Self {
        OperatorAction::SetPassword {
            username: Some(SUPER_USER.to_string()),
            password: Some(password.into()),
        }
    }
}

impl std::fmt::Debug for OperatorAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperatorAction::SetPassword { username, .. } => f
                .debug_struct("SetPassword")
                .field("username", username)
                .finish_non_exhaustive(),
            OperatorAction::SetTlsPrivateKey { .. } => {
                f.debug_struct("SetTlsPrivateKey").finish_non_exhaustive()
            }
            other => write!(f, "{}", other.name()),
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub enum ActionOutput {
    Password(String),
    /// Rotation announced at the given epoch; cutover follows once every
    /// unit acknowledged
    RotationStarted { username: String, epoch: u64 },
    KeyInstalled,
    Released { token: OpToken, released: bool },
}

impl std::fmt::Debug for ActionOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActionOutput::Password(_) => write!(f, "Password(<redacted>)"),
            ActionOutput::RotationStarted { username, epoch } => f
                .debug_struct("RotationStarted")
                .field("username", username)
                .field("epoch", epoch)
                .finish(),
            ActionOutput::KeyInstalled => write!(f, "KeyInstalled"),
            ActionOutput::Released { token, released } => f
                .debug_struct("Released")
                .field("token", token)
                .field("released", released)
                .finish(),
        }
    }
}
