//! One-shot library initialization and the backend log bridge.

use std::sync::Once;

static INIT: Once = Once::new();

/// Log severity reported by a backend runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Forward a backend log line into `tracing`.
///
/// Trailing newlines are stripped; backends tend to terminate their own
/// lines. Never fails and never panics.
pub fn bridge_backend_log(level: LogLevel, text: &str) {
    let text = text.trim_end_matches('\n');
    match level {
        LogLevel::Debug => tracing::debug!(target: "blama::backend", "{text}"),
        LogLevel::Info => tracing::info!(target: "blama::backend", "{text}"),
        LogLevel::Warn => tracing::warn!(target: "blama::backend", "{text}"),
        LogLevel::Error => tracing::error!(target: "blama::backend", "{text}"),
    }
}

/// Process-wide, one-shot initialization: installs the backend log bridge
/// and any backend globals. Subsequent calls are no-ops.
pub fn init_library() {
    INIT.call_once(|| {
        tracing::info!("blama engine initialized");
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init_library();
        init_library();
    }

    #[test]
    fn log_bridge_accepts_all_levels() {
        bridge_backend_log(LogLevel::Debug, "d\n");
        bridge_backend_log(LogLevel::Info, "i");
        bridge_backend_log(LogLevel::Warn, "w");
        bridge_backend_log(LogLevel::Error, "e\n\n");
    }
}
