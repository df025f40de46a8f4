// src/engine/limits.rs

//! Admission accounting per concurrency group.
//!
//! Tags map to group *indices*; a task is added to each distinct group it
//! reaches exactly once, no matter how many of its tags alias to that group.
//! Tasks that reach no group are counted against the remainder ceiling
//! instead (0 = unlimited).
//!
//! The tracker is owned by the scheduler loop and needs no locking.

use std::collections::{BTreeSet, HashMap, HashSet};

use tracing::trace;

use crate::config::limits::GroupLimits;
use crate::engine::running::AttemptId;
use crate::exec::task::TaskDescriptor;

#[derive(Debug)]
struct Group {
    label: String,
    ceiling: usize,
    admitted: HashSet<AttemptId>,
}

#[derive(Debug)]
pub struct MarkLimitTracker {
    groups: Vec<Group>,
    by_tag: HashMap<String, usize>,
    remainder_ceiling: usize,
    remainder: HashSet<AttemptId>,
}

impl MarkLimitTracker {
    pub fn new(limits: &GroupLimits, remainder_ceiling: usize) -> Self {
        let mut groups = Vec::with_capacity(limits.len());
        let mut by_tag = HashMap::new();
        for (index, decl) in limits.iter().enumerate() {
            for tag in &decl.tags {
                by_tag.insert(tag.clone(), index);
            }
            groups.push(Group {
                label: decl.tags.join(","),
                ceiling: decl.ceiling,
                admitted: HashSet::new(),
            });
        }
        Self {
            groups,
            by_tag,
            remainder_ceiling,
            remainder: HashSet::new(),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(&GroupLimits::default(), 0)
    }

    fn groups_of(&self, task: &TaskDescriptor) -> BTreeSet<usize> {
        task.tags
            .iter()
            .filter_map(|tag| self.by_tag.get(tag).copied())
            .collect()
    }

    /// True if admitting `task` would take any of its groups, or the
    /// remainder, past its ceiling.
    pub fn would_exceed(&self, task: &TaskDescriptor) -> bool {
        let groups = self.groups_of(task);
        if groups.is_empty() {
            return self.remainder_ceiling != 0 && self.remainder.len() >= self.remainder_ceiling;
        }
        groups.iter().any(|&i| {
            let group = &self.groups[i];
            group.admitted.len() >= group.ceiling
        })
    }

    /// Record an admission (`admitting = true`) or a completion.
    pub fn update(&mut self, attempt: &AttemptId, task: &TaskDescriptor, admitting: bool) {
        let groups = self.groups_of(task);
        if groups.is_empty() {
            if admitting {
                self.remainder.insert(attempt.clone());
            } else {
                self.remainder.remove(attempt);
            }
            return;
        }
        for i in groups {
            let group = &mut self.groups[i];
            if admitting {
                group.admitted.insert(attempt.clone());
            } else {
                group.admitted.remove(attempt);
            }
            trace!(
                group = %group.label,
                admitted = group.admitted.len(),
                ceiling = group.ceiling,
                "group occupancy"
            );
        }
    }

    /// Admitted attempts in the group `tag` belongs to.
    pub fn admitted_in(&self, tag: &str) -> usize {
        self.by_tag
            .get(tag)
            .map_or(0, |&i| self.groups[i].admitted.len())
    }

    pub fn remainder_admitted(&self) -> usize {
        self.remainder.len()
    }
}
