// src/exec/mod.rs

//! Execution layer.
//!
//! - [`task`] describes a unit of work and its body.
//! - [`runner`] runs one attempt of a task: fixtures, body, teardown.
//! - [`bridge`] moves blocking or loop-hostile work onto worker threads.
//! - [`command`] runs the shell commands behind suite-file tasks and fixtures.

pub mod bridge;
pub mod command;
pub mod runner;
pub mod task;

pub use runner::{Attempt, TaskRunner};
pub use task::{TaskBody, TaskDescriptor, TaskId};
