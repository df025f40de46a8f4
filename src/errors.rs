// src/errors.rs

//! Crate-wide error types.
//!
//! - [`CoopError`] is for run-level failures (bad configuration, IO, TOML).
//!   These are fatal and abort the run before any task executes.
//! - [`TaskError`] is for failures that belong to one task's outcome. They
//!   never abort the scheduler loop.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoopError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CoopError {
    pub fn config(msg: impl Into<String>) -> Self {
        CoopError::ConfigError(msg.into())
    }
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, CoopError>;

/// An error that can be handed to every waiter of a memoized fixture build.
pub type SharedError = Arc<anyhow::Error>;

/// Why a single task did not pass.
///
/// Cloneable so that one failed shared fixture build can be reported as the
/// setup error of every task that depends on it.
#[derive(Error, Debug, Clone)]
pub enum TaskError {
    /// A fixture builder failed; the task body never ran.
    #[error("error setting up fixture '{fixture}': {error:#}")]
    Setup { fixture: String, error: SharedError },

    /// A declared argument names no fixture, no call argument and is not `request`.
    #[error("fixture '{name}' not found (requested by '{requested_by}')")]
    UnknownFixture { name: String, requested_by: String },

    /// The task body returned an error.
    #[error("{0:#}")]
    Call(SharedError),

    /// Resuming a generator fixture past its yield failed.
    #[error("error tearing down fixture '{fixture}': {error:#}")]
    Teardown { fixture: String, error: SharedError },

    /// The scheduler cancelled the task for running past its deadline.
    #[error("task took too long ({:.2} s)", elapsed.as_secs_f64())]
    Timeout { elapsed: Duration },

    /// A cooperative task whose body is a plain synchronous callable.
    #[error("task '{task}' is marked cooperative but its body is not asynchronous")]
    NotCoroutine { task: String },

    /// The spawned runner future panicked.
    #[error("task runner panicked: {0}")]
    Panicked(String),

    /// No admission was possible with an empty running set.
    #[error("task could not be admitted under the configured concurrency limits")]
    Unschedulable,
}

impl TaskError {
    pub fn call(err: anyhow::Error) -> Self {
        TaskError::Call(Arc::new(err))
    }

    /// True for errors raised while acquiring fixtures.
    pub fn is_setup(&self) -> bool {
        matches!(
            self,
            TaskError::Setup { .. } | TaskError::UnknownFixture { .. }
        )
    }
}
