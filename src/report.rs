// src/report.rs

//! Task outcomes and the reporting seam.
//!
//! The scheduler hands every final outcome to a [`Reporter`] as soon as it is
//! known, and returns a [`RunSummary`] once the run is over.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::errors::TaskError;
use crate::exec::task::{TaskDescriptor, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Passed,
    Failed,
    Cancelled,
    Skipped,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Passed => "passed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Skipped => "skipped",
        }
    }
}

/// Start and stop of one phase, in wall-clock time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Phase {
    pub start: SystemTime,
    pub stop: SystemTime,
}

impl Phase {
    pub fn duration(&self) -> Duration {
        self.stop.duration_since(self.start).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PhaseTimings {
    pub setup: Option<Phase>,
    pub call: Option<Phase>,
    pub teardown: Option<Phase>,
}

#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub task_id: TaskId,
    /// 0 for the first attempt, 1 for the retry.
    pub attempt: u32,
    pub status: TaskStatus,
    pub error: Option<TaskError>,
    /// Teardown failures that did not become `error`.
    pub teardown_errors: Vec<TaskError>,
    pub skip_reason: Option<String>,
    pub timings: PhaseTimings,
}

impl TaskOutcome {
    pub fn skipped(task_id: impl Into<TaskId>, reason: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            attempt: 0,
            status: TaskStatus::Skipped,
            error: None,
            teardown_errors: Vec::new(),
            skip_reason: Some(reason.into()),
            timings: PhaseTimings::default(),
        }
    }

    /// An outcome for an attempt that failed outside the runner.
    pub fn failed(task_id: impl Into<TaskId>, attempt: u32, error: TaskError) -> Self {
        Self {
            task_id: task_id.into(),
            attempt,
            status: TaskStatus::Failed,
            error: Some(error),
            teardown_errors: Vec::new(),
            skip_reason: None,
            timings: PhaseTimings::default(),
        }
    }

    pub fn cancelled(task_id: impl Into<TaskId>, attempt: u32) -> Self {
        Self {
            task_id: task_id.into(),
            attempt,
            status: TaskStatus::Cancelled,
            error: None,
            teardown_errors: Vec::new(),
            skip_reason: None,
            timings: PhaseTimings::default(),
        }
    }

    pub fn is_passed(&self) -> bool {
        self.status == TaskStatus::Passed
    }

    /// Fold late teardown errors in: the first one becomes the outcome error
    /// of an attempt that had none, the rest are kept alongside.
    pub fn absorb_teardown_errors(&mut self, errors: Vec<TaskError>) {
        for err in errors {
            if self.error.is_none() && self.status == TaskStatus::Passed {
                self.status = TaskStatus::Failed;
                self.error = Some(err);
            } else {
                self.teardown_errors.push(err);
            }
        }
    }
}

/// Everything a run produced.
#[derive(Debug, Default)]
pub struct RunSummary {
    /// Final outcomes in completion order. Discarded first attempts of
    /// retried tasks are not included.
    pub outcomes: Vec<TaskOutcome>,
    /// Tasks that are not enqueue-eligible, handed back untouched.
    pub deferred: Vec<Arc<TaskDescriptor>>,
    /// Number of tasks re-run after a failing first attempt.
    pub retried: usize,
    /// Teardown failures found by the end-of-run sweep.
    pub fixture_errors: Vec<TaskError>,
}

impl RunSummary {
    pub fn count(&self, status: TaskStatus) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }

    pub fn passed(&self) -> usize {
        self.count(TaskStatus::Passed)
    }

    pub fn failed(&self) -> usize {
        self.count(TaskStatus::Failed)
    }

    pub fn cancelled(&self) -> usize {
        self.count(TaskStatus::Cancelled)
    }

    pub fn skipped(&self) -> usize {
        self.count(TaskStatus::Skipped)
    }

    /// Reported outcomes of one task id.
    pub fn outcomes_for<'a>(&'a self, task_id: &'a str) -> impl Iterator<Item = &'a TaskOutcome> {
        self.outcomes.iter().filter(move |o| o.task_id == task_id)
    }

    /// True when nothing failed or was cancelled, including fixture teardowns.
    pub fn is_success(&self) -> bool {
        self.failed() == 0 && self.cancelled() == 0 && self.fixture_errors.is_empty()
    }
}

/// Receives outcomes as the run progresses.
pub trait Reporter: Send {
    fn task_finished(&mut self, outcome: &TaskOutcome);

    fn run_finished(&mut self, _summary: &RunSummary) {}
}

/// Reports through `tracing`.
#[derive(Debug, Default)]
pub struct LogReporter;

impl Reporter for LogReporter {
    fn task_finished(&mut self, outcome: &TaskOutcome) {
        let call = outcome
            .timings
            .call
            .map(|p| p.duration().as_secs_f64())
            .unwrap_or_default();
        match (&outcome.status, &outcome.error) {
            (TaskStatus::Passed, _) => {
                info!(task = %outcome.task_id, attempt = outcome.attempt, call_s = call, "PASSED");
            }
            (TaskStatus::Skipped, _) => {
                info!(
                    task = %outcome.task_id,
                    reason = outcome.skip_reason.as_deref().unwrap_or(""),
                    "SKIPPED"
                );
            }
            (status, Some(err)) => {
                warn!(task = %outcome.task_id, attempt = outcome.attempt, error = %err, "{}", status.as_str().to_uppercase());
            }
            (status, None) => {
                warn!(task = %outcome.task_id, attempt = outcome.attempt, "{}", status.as_str().to_uppercase());
            }
        }
        for err in &outcome.teardown_errors {
            warn!(task = %outcome.task_id, error = %err, "additional teardown error");
        }
    }

    fn run_finished(&mut self, summary: &RunSummary) {
        info!(
            passed = summary.passed(),
            failed = summary.failed(),
            cancelled = summary.cancelled(),
            skipped = summary.skipped(),
            deferred = summary.deferred.len(),
            retried = summary.retried,
            "run finished"
        );
        for err in &summary.fixture_errors {
            warn!(error = %err, "fixture teardown failed at end of run");
        }
    }
}

/// Forwards outcomes over a channel, e.g. to a UI task.
#[derive(Debug, Clone)]
pub struct ChannelReporter {
    tx: mpsc::UnboundedSender<TaskOutcome>,
}

impl ChannelReporter {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<TaskOutcome>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Reporter for ChannelReporter {
    fn task_finished(&mut self, outcome: &TaskOutcome) {
        // A dropped receiver just means nobody is listening any more.
        let _ = self.tx.send(outcome.clone());
    }
}
