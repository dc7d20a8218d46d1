//! Log output setup.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Registry};
use zkctl_core::{ControllerError, LogLevel, Result};

/// Output format of the controller log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Filter for `level`, unless `RUST_LOG` is set.
pub fn env_filter(level: LogLevel) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_filter()))
}

/// Swaps the installed filter when the configured log level changes.
#[derive(Clone)]
pub struct LogHandle {
    inner: reload::Handle<EnvFilter, Registry>,
}

impl LogHandle {
    /// A reloadable filter layer and the handle that drives it. The handle
    /// goes dead once the layer is dropped.
    pub fn new(level: LogLevel) -> (reload::Layer<EnvFilter, Registry>, Self) {
        let (layer, inner) = reload::Layer::new(env_filter(level));
        (layer, Self { inner })
    }

    pub fn set_level(&self, level: LogLevel) -> Result<()> {
        self.inner
            .reload(env_filter(level))
            .map_err(|e| ControllerError::internal(format!("failed to reload log filter: {}", e)))
    }

    /// The active filter directives.
    pub fn current(&self) -> Option<String> {
        self.inner.with_current(|filter| filter.to_string()).ok()
    }
}

impl std::fmt::Debug for LogHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogHandle")
            .field("filter", &self.current())
            .finish()
    }
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_logging(level: LogLevel, format: LogFormat) -> Result<LogHandle> {
    let (filter, handle) = LogHandle::new(level);
    let registry = Registry::default().with(filter);
    let installed = match format {
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .try_init(),
    };
    installed
        .map(|_| handle)
        .map_err(|e| ControllerError::internal(format!("failed to initialise logging: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_follows_log_level() {
        if std::env::var("RUST_LOG").is_err() {
            assert_eq!(env_filter(LogLevel::Debug).to_string(), "debug");
            assert_eq!(env_filter(LogLevel::Warning).to_string(), "warn");
        }
    }

    #[test]
    fn test_level_reloads_in_place() {
        let (_layer, handle) = LogHandle::new(LogLevel::Info);
        handle.set_level(LogLevel::Debug).unwrap();
        if std::env::var("RUST_LOG").is_err() {
            assert_eq!(handle.current().as_deref(), Some("debug"));
        }
    }

    #[test]
    fn test_dropped_layer_rejects_reload() {
        let (layer, handle) = LogHandle::new(LogLevel::Info);
        drop(layer);
        assert!(handle.set_level(LogLevel::Debug).is_err());
        assert_eq!(handle.current(), None);
    }

    #[test]
    fn test_second_init_fails() {
        let _ = init_logging(LogLevel::Info, LogFormat::Text);
        assert!(init_logging(LogLevel::Info, LogFormat::Json).is_err());
    }
}
