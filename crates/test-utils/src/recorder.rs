use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use coopsched::report::{Reporter, RunSummary, TaskOutcome};

/// Ordered, shareable log of events ("setup:db", "call:t1", ...).
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<String>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, event: impl Into<String>) {
        self.events.lock().unwrap().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, event: &str) -> usize {
        self.events.lock().unwrap().iter().filter(|e| *e == event).count()
    }

    /// Index of the first occurrence of `event`.
    pub fn position(&self, event: &str) -> Option<usize> {
        self.events.lock().unwrap().iter().position(|e| e == event)
    }

    /// Index of the last event starting with `prefix`.
    pub fn last_with_prefix(&self, prefix: &str) -> Option<usize> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .rposition(|e| e.starts_with(prefix))
    }
}

/// Keeps every reported outcome.
#[derive(Debug, Default)]
pub struct CollectingReporter {
    pub outcomes: Vec<TaskOutcome>,
    pub run_finished: bool,
}

impl CollectingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn outcome(&self, task_id: &str) -> Option<&TaskOutcome> {
        self.outcomes.iter().find(|o| o.task_id == task_id)
    }
}

impl Reporter for CollectingReporter {
    fn task_finished(&mut self, outcome: &TaskOutcome) {
        self.outcomes.push(outcome.clone());
    }

    fn run_finished(&mut self, _summary: &RunSummary) {
        self.run_finished = true;
    }
}

/// Tracks how many bodies are inside a section at once, and the peak.
#[derive(Debug, Clone, Default)]
pub struct ConcurrencyProbe {
    current: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl ConcurrencyProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter(&self) -> ProbeGuard {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        ProbeGuard {
            current: self.current.clone(),
        }
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }
}

/// Leaves the probe on drop, including when the body is cancelled.
#[derive(Debug)]
pub struct ProbeGuard {
    current: Arc<AtomicUsize>,
}

impl Drop for ProbeGuard {
    fn drop(&mut self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}
