// src/engine/mod.rs

//! Scheduling layer.
//!
//! - [`running`] holds per-attempt bookkeeping (queued and admitted).
//! - [`limits`] counts admissions per concurrency group.
//! - [`backlog`] is the submission-ordered queue of attempts.
//! - [`scheduler`] is the run loop tying them to the task runner.

pub mod backlog;
pub mod limits;
pub mod running;
pub mod scheduler;

pub use limits::MarkLimitTracker;
pub use running::{AttemptId, PendingTask, RunningTask};
pub use scheduler::{Scheduler, SchedulerConfig};
