use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

/// Severity of a log line written from orchestration code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub(crate) fn emit(self, instance: &str, turn_index: u64, message: &str) {
        match self {
            LogLevel::Debug => tracing::debug!(instance, turn_idx = turn_index, "{message}"),
            LogLevel::Info => tracing::info!(instance, turn_idx = turn_index, "{message}"),
            LogLevel::Warn => tracing::warn!(instance, turn_idx = turn_index, "{message}"),
            LogLevel::Error => tracing::error!(instance, turn_idx = turn_index, "{message}"),
        }
    }
}

/// Install a `fmt` subscriber filtered by `RUST_LOG` (default `info`).
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init();
}

// Replay-safe logging macros: silent while the orchestration re-issues recorded decisions.

#[macro_export]
macro_rules! durable_info {
    ($ctx:expr, $($arg:tt)+) => {{
        if !$ctx.is_replaying() {
            ::tracing::info!(turn_idx = $ctx.turn_index(), $($arg)+);
        }
    }};
}

#[macro_export]
macro_rules! durable_warn {
    ($ctx:expr, $($arg:tt)+) => {{
        if !$ctx.is_replaying() {
            ::tracing::warn!(turn_idx = $ctx.turn_index(), $($arg)+);
        }
    }};
}

#[macro_export]
macro_rules! durable_error {
    ($ctx:expr, $($arg:tt)+) => {{
        if !$ctx.is_replaying() {
            ::tracing::error!(turn_idx = $ctx.turn_index(), $($arg)+);
        }
    }};
}
