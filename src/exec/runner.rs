// src/exec/runner.rs

//! One attempt of one task: resolve fixtures, call the body, tear down.

use std::sync::Arc;
use std::time::SystemTime;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::TaskError;
use crate::exec::bridge;
use crate::exec::task::{TaskBody, TaskDescriptor};
use crate::fixture::descriptor::FixtureArgs;
use crate::fixture::resolver::{FixtureResolver, Reservation};
use crate::report::{Phase, PhaseTimings, TaskOutcome, TaskStatus};

/// Everything the runner needs for one attempt.
#[derive(Debug)]
pub struct Attempt {
    pub task: Arc<TaskDescriptor>,
    pub attempt: u32,
    /// Shared fixtures registered for this attempt; consumed by teardown.
    pub reservation: Reservation,
    pub cancel: CancellationToken,
}

#[derive(Clone)]
pub struct TaskRunner {
    resolver: Arc<FixtureResolver>,
}

impl TaskRunner {
    pub fn new(resolver: Arc<FixtureResolver>) -> Self {
        Self { resolver }
    }

    pub fn resolver(&self) -> &Arc<FixtureResolver> {
        &self.resolver
    }

    /// Run a task outside the scheduler, reserving its shared fixtures first.
    pub async fn run(&self, task: Arc<TaskDescriptor>) -> TaskOutcome {
        let reservation = self.resolver.reserve(&task);
        self.run_attempt(Attempt {
            task,
            attempt: 0,
            reservation,
            cancel: CancellationToken::new(),
        })
        .await
    }

    /// Setup, call and teardown of a single attempt.
    ///
    /// Cancellation is observed at every suspension point of setup and call.
    /// Teardown always runs, and is not itself cancellable.
    pub async fn run_attempt(&self, attempt: Attempt) -> TaskOutcome {
        let Attempt {
            task,
            attempt,
            reservation,
            cancel,
        } = attempt;

        if !task.body.is_awaitable() {
            warn!(task = %task.id, "cooperative task has a synchronous body");
            let mut outcome = TaskOutcome::failed(
                task.id.clone(),
                attempt,
                TaskError::NotCoroutine {
                    task: task.id.clone(),
                },
            );
            let errors = self.resolver.release(reservation).await;
            outcome.teardown_errors.extend(errors);
            return outcome;
        }

        let mut timings = PhaseTimings::default();
        let mut error: Option<TaskError> = None;
        let mut cancelled = false;

        let fixtures = self
            .resolver
            .scope_for(task.clone(), reservation, cancel.clone());

        debug!(task = %task.id, attempt, "setup");
        let setup_start = SystemTime::now();
        let resolved = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                cancelled = true;
                None
            }
            result = self.resolver.resolve(&fixtures) => match result {
                Ok(values) => Some(values),
                Err(err) => {
                    error = Some(err);
                    None
                }
            },
        };
        timings.setup = Some(Phase {
            start: setup_start,
            stop: SystemTime::now(),
        });

        if let Some(values) = resolved {
            debug!(task = %task.id, attempt, "call");
            let call_start = SystemTime::now();
            tokio::select! {
                biased;
                _ = cancel.cancelled() => cancelled = true,
                result = invoke(&task, values) => {
                    if let Err(err) = result {
                        error = Some(err);
                    }
                }
            }
            timings.call = Some(Phase {
                start: call_start,
                stop: SystemTime::now(),
            });
        }

        debug!(task = %task.id, attempt, "teardown");
        let teardown_start = SystemTime::now();
        let teardown_errors = self.resolver.teardown(fixtures).await;
        timings.teardown = Some(Phase {
            start: teardown_start,
            stop: SystemTime::now(),
        });

        let status = if cancelled {
            TaskStatus::Cancelled
        } else if error.is_some() {
            TaskStatus::Failed
        } else {
            TaskStatus::Passed
        };

        let mut outcome = TaskOutcome {
            task_id: task.id.clone(),
            attempt,
            status,
            error,
            teardown_errors: Vec::new(),
            skip_reason: None,
            timings,
        };
        outcome.absorb_teardown_errors(teardown_errors);

        match (&outcome.status, &outcome.error) {
            (TaskStatus::Passed, _) => info!(task = %task.id, attempt, "task passed"),
            (TaskStatus::Cancelled, _) => info!(task = %task.id, attempt, "task cancelled"),
            (_, Some(err)) if err.is_setup() => {
                info!(task = %task.id, attempt, error = %err, "task errored during setup")
            }
            (_, Some(err)) => info!(task = %task.id, attempt, error = %err, "task failed"),
            (_, None) => info!(task = %task.id, attempt, "task failed"),
        }

        outcome
    }
}

async fn invoke(task: &TaskDescriptor, args: FixtureArgs) -> Result<(), TaskError> {
    match &task.body {
        TaskBody::Async(f) => f(args).await.map_err(TaskError::call),
        TaskBody::Blocking(f) => {
            let f = f.clone();
            bridge::run_blocking(move || f(args)).await
        }
        TaskBody::Sync(_) => Err(TaskError::NotCoroutine {
            task: task.id.clone(),
        }),
    }
}
