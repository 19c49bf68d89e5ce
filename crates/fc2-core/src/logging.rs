//! Reloadable console logging, shared by `fc2-dl` and `autofc2`.
//!
//! Only the reloadable-filter mechanism is kept from the supervisor's
//! original logging module — file rotation and websocket log streaming are
//! a web-API concern this system does not have.

use tracing_subscriber::{
    fmt,
    layer::SubscriberExt,
    reload,
    util::SubscriberInitExt,
    EnvFilter,
};

pub type FilterHandle = reload::Handle<EnvFilter, tracing_subscriber::Registry>;

/// The closed set of log levels accepted by `--log-level`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Silent,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "silent" => Ok(LogLevel::Silent),
            "error" => Ok(LogLevel::Error),
            "warn" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(format!("unknown log level: {other}")),
        }
    }
}

impl LogLevel {
    fn filter_directive(self) -> &'static str {
        match self {
            LogLevel::Silent => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Initialize the global tracing subscriber with a reloadable `EnvFilter`,
/// returning a handle the supervisor can use to apply config-driven log
/// level changes on its next reconcile tick.
pub fn init_logging(initial: LogLevel) -> FilterHandle {
    let initial_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(initial.filter_directive()));
    let (filter_layer, filter_handle) = reload::Layer::new(initial_filter);

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt::layer().with_target(false))
        .try_init()
        .expect("global subscriber installed exactly once per process");

    filter_handle
}

/// Apply a new log level to an already-initialized subscriber.
pub fn set_level(handle: &FilterHandle, level: LogLevel) {
    let _ = handle.reload(EnvFilter::new(level.filter_directive()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn parses_known_levels() {
        assert!(matches!(LogLevel::from_str("info"), Ok(LogLevel::Info)));
        assert!(matches!(LogLevel::from_str("silent"), Ok(LogLevel::Silent)));
        assert!(LogLevel::from_str("bogus").is_err());
    }
}
