//! # Controller Configuration
//!
//! Operator options recognised by the controller plus the tuning knobs of the
//! reconciliation loop.

use crate::{ControllerError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

pub const CLIENT_PORT: u16 = 2181;
pub const SECURE_CLIENT_PORT: u16 = 2182;
pub const SERVER_PORT: u16 = 2888;
pub const ELECTION_PORT: u16 = 3888;
pub const JMX_PORT: u16 = 9998;
pub const METRICS_PROVIDER_PORT: u16 = 7000;

/// Admin account handed to clients.
pub const SUPER_USER: &str = "super";
/// Quorum-internal account used between servers.
pub const SYNC_USER: &str = "sync";
/// Accounts whose secrets the controller manages.
pub const MANAGED_USERS: [&str; 2] = [SUPER_USER, SYNC_USER];

pub const INIT_LIMIT_KEY: &str = "init-limit";
pub const SYNC_LIMIT_KEY: &str = "sync-limit";
pub const TICK_TIME_KEY: &str = "tick-time";
pub const LOG_LEVEL_KEY: &str = "log-level";
pub const EXPOSE_EXTERNAL_KEY: &str = "expose-external";

/// Value of the `log-level` option.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Error,
    Warning,
    #[default]
    Info,
    Debug,
}

impl LogLevel {
    /// Directive understood by `tracing_subscriber::EnvFilter`.
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warning => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }

    pub fn as_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warning => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
        }
    }
}

impl FromStr for LogLevel {
    type Err = ControllerError;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "ERROR" => Ok(LogLevel::Error),
            "WARNING" => Ok(LogLevel::Warning),
            "INFO" => Ok(LogLevel::Info),
            "DEBUG" => Ok(LogLevel::Debug),
            other => Err(ControllerError::invalid_config(format!(
                "{LOG_LEVEL_KEY} must be one of ERROR, WARNING, INFO, DEBUG; got {other:?}"
            ))),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Error => write!(f, "ERROR"),
            LogLevel::Warning => write!(f, "WARNING"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Debug => write!(f, "DEBUG"),
        }
    }
}

/// Value of the `expose-external` option. Client access from outside the
/// platform network is provisioned by the platform; the controller only
/// validates and records the choice.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExposeExternal {
    #[default]
    False,
    NodePort,
}

impl FromStr for ExposeExternal {
    type Err = ControllerError;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "false" => Ok(ExposeExternal::False),
            "nodeport" => Ok(ExposeExternal::NodePort),
            other => Err(ControllerError::invalid_config(format!(
                "{EXPOSE_EXTERNAL_KEY} must be one of false, nodeport; got {other:?}"
            ))),
        }
    }
}

/// Configuration of one unit's controller.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerConfig {
    /// Ticks allowed for follower sync during startup
    pub init_limit: u32,
    /// Ticks allowed for follower sync during steady state
    pub sync_limit: u32,
    /// Base time unit of the server, in milliseconds
    pub tick_time: u32,
    pub log_level: LogLevel,
    pub expose_external: ExposeExternal,

    /// Application name used in SANs and service names
    pub app_name: String,
    /// Mount point of the persisted snapshot and transaction logs
    pub data_dir: PathBuf,

    /// How often a unit refreshes its heartbeat in the peer state
    pub heartbeat_interval: Duration,
    /// Heartbeat age after which a unit is considered unreachable
    pub unreachable_after: Duration,
    /// Heartbeat age after which a lock holder may be displaced
    pub lock_stale_after: Duration,
    /// Time a restarted unit has to come back serving
    pub verification_timeout: Duration,
    /// Delay between in-pass health polls of a restarted unit
    pub verify_poll_interval: Duration,
    /// Health polls attempted within one pass before yielding
    pub verify_poll_attempts: u32,
    /// Failed attempts tolerated before a rolling op turns fatal
    pub retry_budget: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Time after which a missing credential acknowledgment is reported
    pub credential_ack_timeout: Duration,
    /// Fraction of certificate validity remaining that triggers renewal
    pub renewal_threshold: f64,
    /// Period of the health tick fed into the reconciliation loop
    pub tick_interval: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            init_limit: 5,
            sync_limit: 2,
            tick_time: 2000,
            log_level: LogLevel::Info,
            expose_external: ExposeExternal::False,
            app_name: "zookeeper".to_string(),
            data_dir: PathBuf::from("/var/lib/zookeeper"),
            heartbeat_interval: Duration::from_secs(10),
            unreachable_after: Duration::from_secs(30),
            lock_stale_after: Duration::from_secs(90),
            verification_timeout: Duration::from_secs(120),
            verify_poll_interval: Duration::from_millis(500),
            verify_poll_attempts: 5,
            retry_budget: 3,
            backoff_base: Duration::from_secs(5),
            backoff_max: Duration::from_secs(60),
            credential_ack_timeout: Duration::from_secs(300),
            renewal_threshold: 1.0 / 3.0,
            tick_interval: Duration::from_secs(30),
        }
    }
}

impl ControllerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_app_name(mut self, app_name: impl Into<String>) -> Self {
        self.app_name = app_name.into();
        self
    }

    pub fn with_data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.data_dir = data_dir.into();
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_unreachable_after(mut self, after: Duration) -> Self {
        self.unreachable_after = after;
        self
    }

    pub fn with_lock_stale_after(mut self, after: Duration) -> Self {
        self.lock_stale_after = after;
        self
    }

    pub fn with_verification_timeout(mut self, timeout: Duration) -> Self {
        self.verification_timeout = timeout;
        self
    }

    pub fn with_verify_polling(mut self, interval: Duration, attempts: u32) -> Self {
        self.verify_poll_interval = interval;
        self.verify_poll_attempts = attempts;
        self
    }

    pub fn with_retry_budget(mut self, budget: u32) -> Self {
        self.retry_budget = budget;
        self
    }

    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_max = max;
        self
    }

    pub fn with_credential_ack_timeout(mut self, timeout: Duration) -> Self {
        self.credential_ack_timeout = timeout;
        self
    }

    pub fn with_renewal_threshold(mut self, fraction: f64) -> Self {
        self.renewal_threshold = fraction;
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Apply operator options by their recognised keys.
    ///
    /// Values are validated before anything is changed, so an invalid map
    /// leaves the configuration untouched.
    pub fn apply_options(&self, options: &BTreeMap<String, String>) -> Result<Self> {
        let mut next = self.clone();

        for (key, value) in options {
            match key.as_str() {
                INIT_LIMIT_KEY => next.init_limit = parse_positive(key, value)?,
                SYNC_LIMIT_KEY => next.sync_limit = parse_positive(key, value)?,
                TICK_TIME_KEY => next.tick_time = parse_positive(key, value)?,
                LOG_LEVEL_KEY => next.log_level = value.parse()?,
                EXPOSE_EXTERNAL_KEY => next.expose_external = value.parse()?,
                other => warn!("Ignoring unrecognised option {}", other),
            }
        }

        Ok(next)
    }

    /// Whether switching to `other` changes the rendered server properties.
    pub fn server_settings_differ(&self, other: &ControllerConfig) -> bool {
        self.init_limit != other.init_limit
            || self.sync_limit != other.sync_limit
            || self.tick_time != other.tick_time
    }

    /// Exponential backoff after `attempts` failures, capped at `backoff_max`.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let factor = 1u32 << attempts.saturating_sub(1).min(16);
        self.backoff_base
            .checked_mul(factor)
            .map(|delay| delay.min(self.backoff_max))
            .unwrap_or(self.backoff_max)
    }

    pub fn validate(&self) -> Result<()> {
        if self.init_limit == 0 || self.sync_limit == 0 || self.tick_time == 0 {
            return Err(ControllerError::invalid_config(
                "init-limit, sync-limit and tick-time must be greater than zero",
            ));
        }
        if !(0.0..1.0).contains(&self.renewal_threshold) {
            return Err(ControllerError::invalid_config(
                "renewal threshold must be a fraction in [0, 1)",
            ));
        }
        if self.lock_stale_after < self.unreachable_after {
            return Err(ControllerError::invalid_config(
                "lock staleness deadline must not be shorter than the unreachable deadline",
            ));
        }
        Ok(())
    }
}

fn parse_positive(key: &str, value: &str) -> Result<u32> {
    match value.trim().parse::<u32>() {
        Ok(parsed) if parsed > 0 => Ok(parsed),
        _ => Err(ControllerError::invalid_config(format!(
            "{key} must be a positive integer; got {value:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults_match_documented_options() {
        let config = ControllerConfig::default();
        assert_eq!(config.init_limit, 5);
        assert_eq!(config.sync_limit, 2);
        assert_eq!(config.tick_time, 2000);
        assert_eq!(config.log_level, LogLevel::Info);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_apply_options() {
        let config = ControllerConfig::default()
            .apply_options(&options(&[
                ("init-limit", "10"),
                ("sync-limit", "4"),
                ("tick-time", "3000"),
                ("log-level", "DEBUG"),
                ("expose-external", "false"),
            ]))
            .unwrap();

        assert_eq!(config.init_limit, 10);
        assert_eq!(config.sync_limit, 4);
        assert_eq!(config.tick_time, 3000);
        assert_eq!(config.log_level, LogLevel::Debug);
        assert_eq!(config.expose_external, ExposeExternal::False);
    }

    #[test]
    fn test_expose_external_leaves_server_settings() {
        let base = ControllerConfig::default();
        let exposed = base
            .apply_options(&options(&[("expose-external", "nodeport")]))
            .unwrap();
        assert_eq!(exposed.expose_external, ExposeExternal::NodePort);
        assert!(!base.server_settings_differ(&exposed));
        assert!(base
            .apply_options(&options(&[("expose-external", "loadbalancer")]))
            .is_err());
    }

    #[test]
    fn test_rejects_invalid_values() {
        let base = ControllerConfig::default();
        assert!(base.apply_options(&options(&[("init-limit", "0")])).is_err());
        assert!(base.apply_options(&options(&[("tick-time", "-5")])).is_err());
        assert!(base.apply_options(&options(&[("log-level", "info")])).is_err());
        assert!(base.apply_options(&options(&[("log-level", "TRACE")])).is_err());
    }

    #[test]
    fn test_server_settings_differ() {
        let base = ControllerConfig::default();
        let louder = base
            .apply_options(&options(&[("log-level", "ERROR")]))
            .unwrap();
        assert!(!base.server_settings_differ(&louder));

        let slower = base.apply_options(&options(&[("tick-time", "4000")])).unwrap();
        assert!(base.server_settings_differ(&slower));
    }

    #[test]
    fn test_backoff_is_capped() {
        let config = ControllerConfig::default()
            .with_backoff(Duration::from_secs(1), Duration::from_secs(10));
        assert_eq!(config.backoff(1), Duration::from_secs(1));
        assert_eq!(config.backoff(2), Duration::from_secs(2));
        assert_eq!(config.backoff(3), Duration::from_secs(4));
        assert_eq!(config.backoff(10), Duration::from_secs(10));
    }

    #[test]
    fn test_log_level_mapping() {
        assert_eq!(LogLevel::Warning.as_filter(), "warn");
        assert_eq!("WARNING".parse::<LogLevel>().unwrap(), LogLevel::Warning);
        assert_eq!(LogLevel::Error.to_string(), "ERROR");
    }
}
