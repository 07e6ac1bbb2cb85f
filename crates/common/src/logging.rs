//! Structured logging initialisation built on `tracing`.
//!
//! Two output modes: human-readable for development, JSON for production
//! log pipelines. The filter is taken from `RUST_LOG`, falling back to the
//! given default directive.

use tracing_subscriber::{fmt, EnvFilter};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Compact human-readable lines.
    Plain,
    /// One JSON object per event, suitable for log collectors.
    Json,
}

/// Initialise the global tracing subscriber.
///
/// Safe to call once per process; a second call returns an error from the
/// subscriber registry which is reported but not fatal.
pub fn init(format: LogFormat, default_directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    let result = match format {
        LogFormat::Plain => fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init(),
        LogFormat::Json => fmt()
            .with_env_filter(filter)
            .json()
            .with_current_span(false)
            .flatten_event(true)
            .try_init(),
    };

    if let Err(e) = result {
        eprintln!("logging already initialised: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init(LogFormat::Plain, "info");
        // Second call must not panic.
        init(LogFormat::Json, "debug");
    }
}
