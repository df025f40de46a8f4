// src/config/model.rs

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;

use crate::config::limits::GroupLimits;
use crate::engine::scheduler::{
    SchedulerConfig, DEFAULT_MAX_CONCURRENT_TASKS, DEFAULT_POLL_INTERVAL_CAP, DEFAULT_TASK_TIMEOUT,
};
use crate::errors::{CoopError, Result};

/// A suite file as read from TOML.
///
/// ```toml
/// [scheduler]
/// max_concurrent_tasks = 4
///
/// [scheduler.max_concurrent_by_group]
/// "db,network" = 2
///
/// [fixture.database]
/// scope = "session"
/// setup = "echo postgres://localhost/test"
/// teardown = "echo dropping"
///
/// [task.test_query]
/// cmd = "test -n \"$COOP_FIXTURE_DATABASE\""
/// fixtures = ["database"]
/// tags = ["db"]
/// ```
///
/// Every section is optional except at least one task.
#[derive(Debug, Clone, Deserialize)]
pub struct SuiteFile {
    #[serde(default)]
    pub scheduler: SchedulerSection,

    /// Fixtures from `[fixture.<name>]`.
    #[serde(default)]
    pub fixture: BTreeMap<String, FixtureConfig>,

    /// Tasks from `[task.<name>]`; the key is the task id.
    #[serde(default)]
    pub task: BTreeMap<String, TaskConfig>,
}

/// `[scheduler]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchedulerSection {
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,

    #[serde(default = "default_task_timeout_seconds")]
    pub task_timeout_seconds: f64,

    #[serde(default = "default_poll_interval_cap_seconds")]
    pub poll_interval_cap_seconds: f64,

    /// Comma-joined tags mapped to a shared ceiling.
    #[serde(default)]
    pub max_concurrent_by_group: BTreeMap<String, usize>,

    /// Ceiling for tasks that match no group. 0 means unlimited.
    #[serde(default)]
    pub remainder_group_ceiling: usize,
}

fn default_max_concurrent_tasks() -> usize {
    DEFAULT_MAX_CONCURRENT_TASKS
}

fn default_task_timeout_seconds() -> f64 {
    DEFAULT_TASK_TIMEOUT.as_secs_f64()
}

fn default_poll_interval_cap_seconds() -> f64 {
    DEFAULT_POLL_INTERVAL_CAP.as_secs_f64()
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: default_max_concurrent_tasks(),
            task_timeout_seconds: default_task_timeout_seconds(),
            poll_interval_cap_seconds: default_poll_interval_cap_seconds(),
            max_concurrent_by_group: BTreeMap::new(),
            remainder_group_ceiling: 0,
        }
    }
}

impl SchedulerSection {
    pub fn to_scheduler_config(&self) -> Result<SchedulerConfig> {
        let config = SchedulerConfig {
            max_concurrent_tasks: self.max_concurrent_tasks,
            task_timeout: seconds("[scheduler].task_timeout_seconds", self.task_timeout_seconds)?,
            poll_interval_cap: seconds(
                "[scheduler].poll_interval_cap_seconds",
                self.poll_interval_cap_seconds,
            )?,
            group_limits: GroupLimits::from_table(&self.max_concurrent_by_group)?,
            remainder_group_ceiling: self.remainder_group_ceiling,
        };
        config.validate()?;
        Ok(config)
    }
}

/// Positive, finite seconds into a `Duration`.
pub fn seconds(field: &str, value: f64) -> Result<Duration> {
    if !value.is_finite() || value <= 0.0 {
        return Err(CoopError::config(format!(
            "{field} must be a positive number of seconds (got {value})"
        )));
    }
    Duration::try_from_secs_f64(value)
        .map_err(|e| CoopError::config(format!("{field}: {e}")))
}

/// `[fixture.<name>]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FixtureConfig {
    /// `function`, `module` or `session`.
    #[serde(default = "default_scope")]
    pub scope: String,

    /// Command whose trimmed stdout becomes the fixture value.
    pub setup: String,

    /// Command run once the fixture is no longer needed. Sees the value in
    /// `COOP_VALUE`.
    #[serde(default)]
    pub teardown: Option<String>,

    /// Fixtures this one is built from.
    #[serde(default)]
    pub after: Vec<String>,

    /// One task instance per entry, for every task that reaches this fixture.
    #[serde(default)]
    pub params: Option<Vec<String>>,

    #[serde(default)]
    pub autouse: bool,

    /// Restricts an autouse fixture to one module.
    #[serde(default)]
    pub module: Option<String>,
}

fn default_scope() -> String {
    "function".to_string()
}

/// `[task.<name>]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskConfig {
    pub cmd: String,

    #[serde(default)]
    pub module: Option<String>,

    /// Fixture names, in argument order.
    #[serde(default)]
    pub fixtures: Vec<String>,

    #[serde(default)]
    pub tags: Vec<String>,

    /// Retry once on failure.
    #[serde(default)]
    pub flakey: bool,

    /// Report as skipped with this reason instead of running.
    #[serde(default)]
    pub skip: Option<String>,

    /// Subject to the scheduler deadline.
    #[serde(default = "default_true")]
    pub timeout: bool,

    /// Run by the scheduler. `false` defers the task to the caller.
    #[serde(default = "default_true")]
    pub cooperative: bool,
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_to_missing_fields() {
        let suite: SuiteFile = toml::from_str(
            r#"
            [fixture.db]
            setup = "echo db"

            [task.t]
            cmd = "true"
            "#,
        )
        .unwrap();

        assert_eq!(suite.scheduler.max_concurrent_tasks, 100);
        assert_eq!(suite.fixture["db"].scope, "function");
        let task = &suite.task["t"];
        assert!(task.timeout && task.cooperative && !task.flakey);
        assert_eq!(
            suite.scheduler.to_scheduler_config().unwrap(),
            SchedulerConfig::default()
        );
    }

    #[test]
    fn scheduler_section_builds_group_limits() {
        let suite: SuiteFile = toml::from_str(
            r#"
            [scheduler]
            max_concurrent_tasks = 4
            task_timeout_seconds = 2.5

            [scheduler.max_concurrent_by_group]
            "db,network" = 2

            [task.t]
            cmd = "true"
            "#,
        )
        .unwrap();

        let config = suite.scheduler.to_scheduler_config().unwrap();
        assert_eq!(config.max_concurrent_tasks, 4);
        assert_eq!(config.task_timeout, Duration::from_millis(2500));
        assert_eq!(config.group_limits.to_string(), "db,network=2");
    }

    #[test]
    fn non_positive_timeout_is_rejected() {
        let section = SchedulerSection {
            task_timeout_seconds: 0.0,
            ..SchedulerSection::default()
        };
        assert!(matches!(
            section.to_scheduler_config(),
            Err(CoopError::ConfigError(_))
        ));
    }
}
