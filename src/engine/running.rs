// src/engine/running.rs

//! Bookkeeping for attempts that are queued or running.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::exec::task::{TaskDescriptor, TaskId};
use crate::fixture::resolver::Reservation;

/// One attempt of one task. The retry of a task is a different attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AttemptId {
    pub task: TaskId,
    pub attempt: u32,
}

impl fmt::Display for AttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.attempt == 0 {
            f.write_str(&self.task)
        } else {
            write!(f, "{} (retry {})", self.task, self.attempt)
        }
    }
}

/// An attempt waiting in the backlog.
#[derive(Debug)]
pub struct PendingTask {
    pub task: Arc<TaskDescriptor>,
    pub attempt: u32,
    pub reservation: Reservation,
    /// Held for a possible retry of a flakey task.
    pub spare: Option<Reservation>,
}

impl PendingTask {
    pub fn id(&self) -> AttemptId {
        AttemptId {
            task: self.task.id.clone(),
            attempt: self.attempt,
        }
    }
}

/// An admitted attempt.
#[derive(Debug)]
pub struct RunningTask {
    pub id: AttemptId,
    pub task: Arc<TaskDescriptor>,
    pub enqueued_at: Instant,
    pub cancel: CancellationToken,
    /// Set once the deadline cancellation has been issued.
    pub timed_out: Option<Duration>,
    pub spare: Option<Reservation>,
}

impl RunningTask {
    /// Whether this attempt is still subject to the deadline.
    pub fn deadline_armed(&self) -> bool {
        self.task.deadline_eligible && self.timed_out.is_none()
    }

    pub fn is_overdue(&self, now: Instant, timeout: Duration) -> bool {
        self.deadline_armed() && now.saturating_duration_since(self.enqueued_at) > timeout
    }

    /// Fire the cancellation token; idempotent.
    pub fn cancel_for_timeout(&mut self, now: Instant) {
        if self.timed_out.is_some() {
            return;
        }
        let elapsed = now.saturating_duration_since(self.enqueued_at);
        info!(
            task = %self.id,
            elapsed_s = elapsed.as_secs_f64(),
            "task exceeded its deadline; cancelling"
        );
        self.timed_out = Some(elapsed);
        self.cancel.cancel();
    }

    /// Whether a non-passing end of this attempt should be retried.
    pub fn can_retry(&self) -> bool {
        self.task.retry_eligible && self.id.attempt == 0
    }
}
