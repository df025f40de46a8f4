// src/logging.rs

//! Logging setup for `coopsched` using `tracing` + `tracing-subscriber`.
//!
//! Priority for determining the log level:
//! 1. `--log-level` CLI flag (if provided)
//! 2. `COOPSCHED_LOG` environment variable (e.g. "info", "debug")
//! 3. default to `info`

use anyhow::{anyhow, Result};
use tracing::Level;
use tracing_subscriber::fmt;

use crate::cli::LogLevel;

pub const LOG_ENV: &str = "COOPSCHED_LOG";

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

/// Pick the effective level from the flag and the environment value.
fn effective_level(cli_level: Option<LogLevel>, env_value: Option<&str>) -> Level {
    cli_level
        .map(Level::from)
        .or_else(|| env_value.and_then(|s| s.trim().parse().ok()))
        .unwrap_or(Level::INFO)
}

/// Install the global subscriber, writing to stderr so stdout stays free for
/// `--dry-run` output.
pub fn init_logging(cli_level: Option<LogLevel>) -> Result<()> {
    let env_value = std::env::var(LOG_ENV).ok();
    let level = effective_level(cli_level, env_value.as_deref());

    fmt()
        .with_max_level(level)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow!("installing log subscriber: {e}"))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_wins_over_environment() {
        assert_eq!(
            effective_level(Some(LogLevel::Trace), Some("error")),
            Level::TRACE
        );
    }

    #[test]
    fn environment_is_case_insensitive_and_falls_back_to_info() {
        assert_eq!(effective_level(None, Some(" DEBUG ")), Level::DEBUG);
        assert_eq!(effective_level(None, Some("loud")), Level::INFO);
        assert_eq!(effective_level(None, None), Level::INFO);
    }
}
