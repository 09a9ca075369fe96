//! Structured logging.
//!
//! # Responsibilities
//! - Initialize the tracing subscriber once per process
//! - Derive the default filter from `[emsm] loglevel`
//!
//! # Design Decisions
//! - `RUST_LOG` wins over the configured level when set
//! - Dependencies log at warn unless `RUST_LOG` says otherwise
//! - Logs go to stderr so command output on stdout stays parseable

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LogLevel;

/// Filter directive used when `RUST_LOG` is not set.
pub fn default_directive(level: LogLevel) -> String {
    format!("warn,emsm={}", level.as_directive())
}

pub fn filter(level: LogLevel) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| default_directive(level).into())
}

/// Install the global subscriber. Later calls are ignored.
pub fn init(level: LogLevel) {
    let result = tracing_subscriber::registry()
        .with(filter(level))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
    if result.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directive() {
        assert_eq!(default_directive(LogLevel::Info), "warn,emsm=info");
        assert_eq!(default_directive(LogLevel::Warning), "warn,emsm=warn");
        assert_eq!(default_directive(LogLevel::Critical), "warn,emsm=error");
    }

    #[test]
    fn test_init_twice_is_harmless() {
        init(LogLevel::Debug);
        init(LogLevel::Error);
        tracing::info!("still logging");
    }
}
