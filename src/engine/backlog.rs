// src/engine/backlog.rs

//! Attempts waiting for admission, in submission order.

use std::collections::VecDeque;

use crate::engine::limits::MarkLimitTracker;
use crate::engine::running::PendingTask;

#[derive(Debug, Default)]
pub struct Backlog {
    pending: VecDeque<PendingTask>,
}

impl Backlog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_back(&mut self, task: PendingTask) {
        self.pending.push_back(task);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Remove and return the first entry the tracker would admit.
    ///
    /// Entries of a saturated group are skipped over rather than blocking
    /// the ones behind them.
    pub fn take_admittable(&mut self, limits: &MarkLimitTracker) -> Option<PendingTask> {
        let index = self
            .pending
            .iter()
            .position(|p| !limits.would_exceed(&p.task))?;
        self.pending.remove(index)
    }

    pub fn drain(&mut self) -> impl Iterator<Item = PendingTask> + '_ {
        self.pending.drain(..)
    }
}

impl FromIterator<PendingTask> for Backlog {
    fn from_iter<I: IntoIterator<Item = PendingTask>>(iter: I) -> Self {
        Self {
            pending: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::limits::GroupLimits;
    use crate::engine::running::AttemptId;
    use crate::exec::task::{TaskBody, TaskDescriptor};
    use crate::fixture::resolver::Reservation;
    use std::sync::Arc;

    fn pending(id: &str, tags: &[&str]) -> PendingTask {
        PendingTask {
            task: Arc::new(
                TaskDescriptor::new(id, TaskBody::from_async(|_| async { Ok(()) }))
                    .with_tags(tags.iter().copied()),
            ),
            attempt: 0,
            reservation: Reservation::default(),
            spare: None,
        }
    }

    #[test]
    fn saturated_head_does_not_block_later_entries() {
        let limits = GroupLimits::parse("slow=1").unwrap();
        let mut tracker = MarkLimitTracker::new(&limits, 0);
        let running = pending("slow0", &["slow"]);
        tracker.update(&running.id(), &running.task, true);

        let mut backlog: Backlog = [pending("slow1", &["slow"]), pending("fast", &[])]
            .into_iter()
            .collect();

        let admitted = backlog.take_admittable(&tracker).unwrap();
        assert_eq!(admitted.id(), AttemptId { task: "fast".into(), attempt: 0 });
        assert!(backlog.take_admittable(&tracker).is_none());
        assert_eq!(backlog.len(), 1);
    }
}
