use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use proptest::prelude::*;

use coopsched::config::GroupLimits;
use coopsched::engine::backlog::Backlog;
use coopsched::engine::{MarkLimitTracker, PendingTask};
use coopsched::exec::{TaskBody, TaskDescriptor};
use coopsched::fixture::Reservation;

const TAGS: [&str; 4] = ["a", "b", "c", "d"];

fn task(i: usize, tags: &[usize]) -> PendingTask {
    let descriptor = TaskDescriptor::new(format!("t{i}"), TaskBody::from_async(|_| async { Ok(()) }))
        .with_tags(tags.iter().map(|&t| TAGS[t]));
    PendingTask {
        task: Arc::new(descriptor),
        attempt: 0,
        reservation: Reservation::default(),
        spare: None,
    }
}

proptest! {
    // Drive the tracker like the scheduler loop does, completing running
    // tasks in an arbitrary order, and check every ceiling after each
    // admission.
    #[test]
    fn admissions_never_exceed_any_ceiling(
        task_tags in proptest::collection::vec(proptest::collection::vec(0..4usize, 0..3), 1..30),
        ceilings in proptest::collection::vec(1..4usize, 3),
        remainder in 0..3usize,
        max_running in 1..6usize,
        picks in proptest::collection::vec(any::<prop::sample::Index>(), 64),
    ) {
        // "a,b" share one ceiling; "c" and "d" have their own.
        let mut table = BTreeMap::new();
        table.insert("a,b".to_string(), ceilings[0]);
        table.insert("c".to_string(), ceilings[1]);
        table.insert("d".to_string(), ceilings[2]);
        let limits = GroupLimits::from_table(&table).unwrap();
        let mut tracker = MarkLimitTracker::new(&limits, remainder);

        let mut backlog: Backlog = task_tags
            .iter()
            .enumerate()
            .map(|(i, tags)| task(i, tags))
            .collect();
        let mut running: VecDeque<PendingTask> = VecDeque::new();
        let mut finished = 0;
        let mut picks = picks.into_iter().cycle();

        while finished < task_tags.len() {
            while running.len() < max_running {
                let Some(next) = backlog.take_admittable(&tracker) else { break };
                tracker.update(&next.id(), &next.task, true);
                running.push_back(next);

                let untagged = running.iter().filter(|p| p.task.tags.is_empty()).count();
                if remainder > 0 {
                    prop_assert!(untagged <= remainder);
                }
                for (tag_set, ceiling) in [(&["a", "b"][..], ceilings[0]), (&["c"][..], ceilings[1]), (&["d"][..], ceilings[2])] {
                    let in_group = running
                        .iter()
                        .filter(|p| tag_set.iter().any(|t| p.task.tags.contains(*t)))
                        .count();
                    prop_assert!(in_group <= ceiling);
                }
            }

            // With nothing running, something must always be admittable.
            prop_assert!(!running.is_empty());
            let pick = picks.next().unwrap().index(running.len());
            let done = running.remove(pick).unwrap();
            tracker.update(&done.id(), &done.task, false);
            finished += 1;
        }

        prop_assert!(backlog.is_empty());
        prop_assert_eq!(tracker.remainder_admitted(), 0);
    }
}
