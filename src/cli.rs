// src/cli.rs

//! CLI argument parsing using `clap`.

use clap::{Parser, ValueEnum};

use crate::config::limits::GroupLimits;
use crate::config::loader::DEFAULT_SUITE_FILE;
use crate::config::model::seconds;
use crate::engine::scheduler::SchedulerConfig;
use crate::errors::Result;

/// Command-line arguments for `coopsched`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "coopsched",
    version,
    about = "Run a suite of tasks concurrently with shared, cached fixtures.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the suite file (TOML).
    #[arg(long, value_name = "PATH", default_value = DEFAULT_SUITE_FILE)]
    pub suite: String,

    /// Maximum number of tasks running at once.
    ///
    /// Overrides `[scheduler].max_concurrent_tasks`.
    #[arg(long, value_name = "N")]
    pub max_tasks: Option<usize>,

    /// Per-group ceilings, e.g. "db,network=2 slow=1".
    ///
    /// Tags joined by commas share one ceiling. Replaces
    /// `[scheduler.max_concurrent_by_group]` entirely.
    #[arg(long, value_name = "SPEC")]
    pub max_tasks_by_group: Option<String>,

    /// Ceiling for tasks matching no group (0 = unlimited).
    #[arg(long, value_name = "N")]
    pub max_tasks_by_group_remainder: Option<usize>,

    /// Seconds a task may run before it is cancelled.
    #[arg(long, value_name = "SECS")]
    pub task_timeout: Option<f64>,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `COOPSCHED_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    /// Load and validate the suite, print the plan, run nothing.
    #[arg(long)]
    pub dry_run: bool,
}

impl CliArgs {
    /// Layer the flags that were given over `config`.
    pub fn apply_to(&self, mut config: SchedulerConfig) -> Result<SchedulerConfig> {
        if let Some(n) = self.max_tasks {
            config.max_concurrent_tasks = n;
        }
        if let Some(spec) = &self.max_tasks_by_group {
            config.group_limits = GroupLimits::parse(spec)?;
        }
        if let Some(n) = self.max_tasks_by_group_remainder {
            config.remainder_group_ceiling = n;
        }
        if let Some(secs) = self.task_timeout {
            config.task_timeout = seconds("--task-timeout", secs)?;
        }
        config.validate()?;
        Ok(config)
    }
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}
