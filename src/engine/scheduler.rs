// src/engine/scheduler.rs

//! The admission-controlled run loop.
//!
//! One pass works as follows:
//! - admit backlog entries while there is capacity and the group limits allow;
//! - wait for the first completion, bounded so no deadline is missed by more
//!   than the poll cap;
//! - cancel overdue attempts, route completions to the reporter or the retry
//!   list, refill.
//!
//! A second pass runs the retries collected by the first.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::task::{self, JoinError, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::limits::GroupLimits;
use crate::engine::backlog::Backlog;
use crate::engine::limits::MarkLimitTracker;
use crate::engine::running::{AttemptId, PendingTask, RunningTask};
use crate::errors::{CoopError, Result, TaskError};
use crate::exec::bridge;
use crate::exec::runner::{Attempt, TaskRunner};
use crate::exec::task::TaskDescriptor;
use crate::fixture::resolver::FixtureResolver;
use crate::report::{Reporter, RunSummary, TaskOutcome, TaskStatus};

pub const DEFAULT_MAX_CONCURRENT_TASKS: usize = 100;
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_POLL_INTERVAL_CAP: Duration = Duration::from_secs(30);

/// Added to the computed wait so that a wake-up lands strictly past a deadline.
const DEADLINE_SLACK: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub max_concurrent_tasks: usize,
    pub task_timeout: Duration,
    pub poll_interval_cap: Duration,
    pub group_limits: GroupLimits,
    /// Ceiling for tasks matching no group; 0 means unlimited.
    pub remainder_group_ceiling: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: DEFAULT_MAX_CONCURRENT_TASKS,
            task_timeout: DEFAULT_TASK_TIMEOUT,
            poll_interval_cap: DEFAULT_POLL_INTERVAL_CAP,
            group_limits: GroupLimits::default(),
            remainder_group_ceiling: 0,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_tasks == 0 {
            return Err(CoopError::config("max_concurrent_tasks must be at least 1"));
        }
        if self.task_timeout.is_zero() {
            return Err(CoopError::config("task timeout must be greater than zero"));
        }
        if self.poll_interval_cap.is_zero() {
            return Err(CoopError::config("poll interval cap must be greater than zero"));
        }
        Ok(())
    }
}

type Joined = (AttemptId, std::result::Result<TaskOutcome, String>);

/// State of one pass over a backlog.
struct Pass {
    backlog: Backlog,
    running: HashMap<AttemptId, RunningTask>,
    join_set: JoinSet<Joined>,
    /// Runtime task ids of the spawned runners, for completions that lost
    /// their payload.
    spawned: HashMap<task::Id, AttemptId>,
    retries: Vec<PendingTask>,
    shutting_down: bool,
}

impl Pass {
    fn new(backlog: Backlog) -> Self {
        Self {
            backlog,
            running: HashMap::new(),
            join_set: JoinSet::new(),
            spawned: HashMap::new(),
            retries: Vec::new(),
            shutting_down: false,
        }
    }
}

pub struct Scheduler {
    config: SchedulerConfig,
    runner: TaskRunner,
    limits: MarkLimitTracker,
    shutdown: CancellationToken,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, resolver: Arc<FixtureResolver>) -> Result<Self> {
        config.validate()?;
        let limits = MarkLimitTracker::new(&config.group_limits, config.remainder_group_ceiling);
        Ok(Self {
            config,
            runner: TaskRunner::new(resolver),
            limits,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn resolver(&self) -> &Arc<FixtureResolver> {
        self.runner.resolver()
    }

    /// Cancelling this token stops admission, cancels every running attempt
    /// and reports the rest of the backlog as cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run every task to a final outcome.
    pub async fn run<I, T>(&mut self, tasks: I, reporter: &mut dyn Reporter) -> RunSummary
    where
        I: IntoIterator<Item = T>,
        T: Into<Arc<TaskDescriptor>>,
    {
        let mut summary = RunSummary::default();
        let mut backlog = Backlog::new();

        for task in tasks {
            let task: Arc<TaskDescriptor> = task.into();
            if let Some(reason) = &task.skip {
                debug!(task = %task.id, reason = %reason, "skipping task");
                let outcome = TaskOutcome::skipped(task.id.clone(), reason.clone());
                reporter.task_finished(&outcome);
                summary.outcomes.push(outcome);
                continue;
            }
            if !task.cooperative {
                debug!(task = %task.id, "task is not cooperative; deferring");
                summary.deferred.push(task);
                continue;
            }
            let resolver = self.runner.resolver();
            let reservation = resolver.reserve(&task);
            let spare = task.retry_eligible.then(|| resolver.reserve(&task));
            backlog.push_back(PendingTask {
                task,
                attempt: 0,
                reservation,
                spare,
            });
        }

        info!(
            queued = backlog.len(),
            skipped = summary.skipped(),
            deferred = summary.deferred.len(),
            max_concurrent_tasks = self.config.max_concurrent_tasks,
            task_timeout_s = self.config.task_timeout.as_secs_f64(),
            "starting run"
        );

        // Only first attempts retry, so this runs at most two passes.
        while !backlog.is_empty() {
            let retries = self.run_pass(backlog, &mut summary, reporter).await;
            if !retries.is_empty() {
                info!(count = retries.len(), "re-running flakey tasks");
            }
            backlog = retries.into_iter().collect();
        }

        summary.fixture_errors = self.runner.resolver().finalize().await;
        reporter.run_finished(&summary);
        summary
    }

    async fn run_pass(
        &mut self,
        backlog: Backlog,
        summary: &mut RunSummary,
        reporter: &mut dyn Reporter,
    ) -> Vec<PendingTask> {
        let mut pass = Pass::new(backlog);
        self.drive(&mut pass, summary, reporter).await;
        pass.retries
    }

    async fn drive(&mut self, pass: &mut Pass, summary: &mut RunSummary, reporter: &mut dyn Reporter) {
        let shutdown = self.shutdown.clone();

        if shutdown.is_cancelled() {
            self.begin_shutdown(pass, summary, reporter).await;
        } else {
            self.refill(pass);
            self.fail_unschedulable(pass, summary, reporter).await;
        }

        while !pass.running.is_empty() {
            let wait = self.next_wait(pass);
            let joined = tokio::select! {
                joined = tokio::time::timeout(wait, pass.join_set.join_next_with_id()) => joined,
                _ = shutdown.cancelled(), if !pass.shutting_down => {
                    self.begin_shutdown(pass, summary, reporter).await;
                    continue;
                }
            };

            match joined {
                Ok(Some(Ok((task_id, (id, result))))) => {
                    pass.spawned.remove(&task_id);
                    self.finish(pass, id, result, summary, reporter).await;
                }
                Ok(Some(Err(join_err))) => {
                    self.finish_lost(pass, join_err, summary, reporter).await;
                }
                Ok(None) => {
                    self.orphan_running(pass, summary, reporter).await;
                    break;
                }
                Err(_) => trace!(waited_s = wait.as_secs_f64(), "poll interval elapsed"),
            }

            self.cancel_overdue(pass);

            if !pass.shutting_down {
                self.refill(pass);
                self.fail_unschedulable(pass, summary, reporter).await;
            }
        }
    }

    /// A runner that was aborted, or panicked outside its own guard.
    async fn finish_lost(
        &mut self,
        pass: &mut Pass,
        join_err: JoinError,
        summary: &mut RunSummary,
        reporter: &mut dyn Reporter,
    ) {
        let Some(id) = pass.spawned.remove(&join_err.id()) else {
            error!(error = %join_err, "unknown runner task did not complete");
            return;
        };
        error!(task = %id, error = %join_err, "runner task did not complete");
        let result = if join_err.is_panic() {
            Err(bridge::panic_message(&*join_err.into_panic()))
        } else {
            Ok(TaskOutcome::cancelled(id.task.clone(), id.attempt))
        };
        self.finish(pass, id, result, summary, reporter).await;
    }

    /// Attempts still marked running once the join set is empty never
    /// produced a completion; close them out as cancelled.
    async fn orphan_running(&mut self, pass: &mut Pass, summary: &mut RunSummary, reporter: &mut dyn Reporter) {
        let orphans: Vec<AttemptId> = pass.running.keys().cloned().collect();
        for id in orphans {
            warn!(task = %id, "attempt left running without a runner");
            let outcome = TaskOutcome::cancelled(id.task.clone(), id.attempt);
            self.finish(pass, id, Ok(outcome), summary, reporter).await;
        }
        pass.spawned.clear();
    }

    /// `min(poll_cap, timeout - age of the oldest armed attempt)`.
    fn next_wait(&self, pass: &Pass) -> Duration {
        let cap = self.config.poll_interval_cap;
        let now = Instant::now();
        pass.running
            .values()
            .filter(|r| r.deadline_armed())
            .map(|r| r.enqueued_at)
            .min()
            .map_or(cap, |oldest| {
                let age = now.saturating_duration_since(oldest);
                (self.config.task_timeout.saturating_sub(age) + DEADLINE_SLACK).min(cap)
            })
    }

    fn refill(&mut self, pass: &mut Pass) {
        while pass.running.len() < self.config.max_concurrent_tasks {
            let Some(pending) = pass.backlog.take_admittable(&self.limits) else {
                break;
            };
            self.admit(pending, pass);
        }
    }

    fn admit(&mut self, pending: PendingTask, pass: &mut Pass) {
        let id = pending.id();
        self.limits.update(&id, &pending.task, true);
        debug!(
            task = %id,
            running = pass.running.len() + 1,
            queued = pass.backlog.len(),
            "admitting task"
        );

        let cancel = CancellationToken::new();
        let attempt = Attempt {
            task: pending.task.clone(),
            attempt: pending.attempt,
            reservation: pending.reservation,
            cancel: cancel.clone(),
        };
        let runner = self.runner.clone();
        let key = id.clone();
        let handle = pass.join_set.spawn(async move {
            let result = AssertUnwindSafe(runner.run_attempt(attempt))
                .catch_unwind()
                .await
                .map_err(|payload| bridge::panic_message(&*payload));
            (key, result)
        });
        pass.spawned.insert(handle.id(), id.clone());

        pass.running.insert(
            id.clone(),
            RunningTask {
                id,
                task: pending.task,
                enqueued_at: Instant::now(),
                cancel,
                timed_out: None,
                spare: pending.spare,
            },
        );
    }

    fn cancel_overdue(&self, pass: &mut Pass) {
        let now = Instant::now();
        for running in pass.running.values_mut() {
            if running.is_overdue(now, self.config.task_timeout) {
                running.cancel_for_timeout(now);
            }
        }
    }

    async fn finish(
        &mut self,
        pass: &mut Pass,
        id: AttemptId,
        result: std::result::Result<TaskOutcome, String>,
        summary: &mut RunSummary,
        reporter: &mut dyn Reporter,
    ) {
        let Some(mut running) = pass.running.remove(&id) else {
            warn!(task = %id, "completion for an attempt that is not running");
            return;
        };
        self.limits.update(&id, &running.task, false);

        let mut outcome = match result {
            Ok(outcome) => outcome,
            Err(panic) => {
                error!(task = %id, panic = %panic, "task runner panicked");
                TaskOutcome::failed(id.task.clone(), id.attempt, TaskError::Panicked(panic))
            }
        };
        if let Some(elapsed) = running.timed_out {
            if outcome.status == TaskStatus::Cancelled {
                outcome.error = Some(TaskError::Timeout { elapsed });
            }
        }

        if !outcome.is_passed() && running.can_retry() && !pass.shutting_down {
            info!(
                task = %id,
                status = outcome.status.as_str(),
                "flakey task did not pass; queueing retry"
            );
            let reservation = match running.spare.take() {
                Some(spare) => spare,
                None => self.runner.resolver().reserve(&running.task),
            };
            pass.retries.push(PendingTask {
                task: running.task,
                attempt: id.attempt + 1,
                reservation,
                spare: None,
            });
            summary.retried += 1;
            return;
        }

        if let Some(spare) = running.spare.take() {
            let errors = self.runner.resolver().release(spare).await;
            outcome.absorb_teardown_errors(errors);
        }
        reporter.task_finished(&outcome);
        summary.outcomes.push(outcome);
    }

    /// Report every backlog entry as failed when nothing is running and
    /// nothing can be admitted.
    async fn fail_unschedulable(
        &self,
        pass: &mut Pass,
        summary: &mut RunSummary,
        reporter: &mut dyn Reporter,
    ) {
        if !pass.running.is_empty() || pass.backlog.is_empty() {
            return;
        }
        error!(
            queued = pass.backlog.len(),
            "no queued task can be admitted under the configured limits"
        );
        let stranded: Vec<PendingTask> = pass.backlog.drain().collect();
        for pending in stranded {
            let outcome =
                TaskOutcome::failed(pending.task.id.clone(), pending.attempt, TaskError::Unschedulable);
            self.release_pending(pending).await;
            reporter.task_finished(&outcome);
            summary.outcomes.push(outcome);
        }
    }

    async fn begin_shutdown(
        &self,
        pass: &mut Pass,
        summary: &mut RunSummary,
        reporter: &mut dyn Reporter,
    ) {
        pass.shutting_down = true;
        warn!(
            running = pass.running.len(),
            queued = pass.backlog.len(),
            "shutdown requested; cancelling running tasks"
        );
        for running in pass.running.values() {
            running.cancel.cancel();
        }
        let abandoned: Vec<PendingTask> = pass.backlog.drain().collect();
        for pending in abandoned {
            let outcome = TaskOutcome::cancelled(pending.task.id.clone(), pending.attempt);
            self.release_pending(pending).await;
            reporter.task_finished(&outcome);
            summary.outcomes.push(outcome);
        }
    }

    async fn release_pending(&self, pending: PendingTask) {
        let resolver = self.runner.resolver();
        let mut errors = resolver.release(pending.reservation).await;
        if let Some(spare) = pending.spare {
            errors.extend(resolver.release(spare).await);
        }
        for err in errors {
            warn!(task = %pending.task.id, error = %err, "fixture teardown failed");
        }
    }
}
