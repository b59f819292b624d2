//! Structured logging bootstrap (A2): a `tracing-subscriber` initializer
//! honoring `RUST_LOG`, with a plain or JSON-formatted output mode.

use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Plain,
    Json,
}

/// Installs the process-wide `tracing` subscriber. `default_filter` is
/// used when `RUST_LOG` is unset; callers pass `Settings::log_filter`
/// (§3/A3) for that.
pub fn init(default_filter: &str, format: LogFormat) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter.to_string()));

    let subscriber = tracing_subscriber::fmt().with_env_filter(env_filter).with_target(true);

    match format {
        LogFormat::Plain => subscriber.init(),
        LogFormat::Json => subscriber.json().init(),
    }
}
