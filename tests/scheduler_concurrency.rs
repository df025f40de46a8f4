use std::error::Error;
use std::time::Duration;

use tokio::time::Instant;

use coopsched::engine::SchedulerConfig;
use coopsched::fixture::fixture_value;
use coopsched::types::Scope;
use coopsched_test_utils::builders::{logging_fixture, max_tasks, probed_task, scheduler, sleeping_task};
use coopsched_test_utils::{init_tracing, with_timeout, CollectingReporter, ConcurrencyProbe, EventLog};

type TestResult = Result<(), Box<dyn Error>>;

fn assert_elapsed(start: Instant, expected: Duration) {
    let elapsed = start.elapsed();
    assert!(
        elapsed >= expected && elapsed < expected + Duration::from_millis(100),
        "expected ~{expected:?}, took {elapsed:?}"
    );
}

#[tokio::test(start_paused = true)]
async fn never_more_than_max_concurrent_tasks_running() -> TestResult {
    init_tracing();
    let probe = ConcurrencyProbe::new();
    let log = EventLog::new();
    let tasks: Vec<_> = (0..7)
        .map(|i| probed_task(&format!("t{i}"), Duration::from_secs(1), vec![probe.clone()], &log))
        .collect();

    let mut sched = scheduler(max_tasks(3), vec![]);
    let mut reporter = CollectingReporter::new();
    let start = Instant::now();
    let summary = with_timeout(sched.run(tasks, &mut reporter)).await;

    assert_eq!(summary.passed(), 7);
    assert_eq!(probe.peak(), 3);
    assert_eq!(probe.current(), 0);
    // ceil(7 / 3) waves of one second.
    assert_elapsed(start, Duration::from_secs(3));
    assert!(reporter.run_finished);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn unlimited_tasks_overlap() -> TestResult {
    let mut sched = scheduler(SchedulerConfig::default(), vec![]);
    let mut reporter = CollectingReporter::new();
    let start = Instant::now();

    let summary = sched
        .run(
            [
                sleeping_task("a", Duration::from_secs(2)),
                sleeping_task("b", Duration::from_secs(2)),
            ],
            &mut reporter,
        )
        .await;

    assert_eq!(summary.passed(), 2);
    assert_elapsed(start, Duration::from_secs(2));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn parametrized_instances_share_the_concurrency_budget() -> TestResult {
    let log = EventLog::new();
    let backend = logging_fixture("backend", Scope::Function, &[], Duration::ZERO, &log)
        .params((0..4).map(fixture_value).collect());
    let probe = ConcurrencyProbe::new();

    let mut sched = scheduler(max_tasks(2), vec![backend]);
    let task = probed_task("query", Duration::from_secs(1), vec![probe.clone()], &log)
        .with_args(["backend"]);
    let tasks = sched.resolver().registry().parametrize_tasks(vec![task]);
    assert_eq!(tasks.len(), 4);

    let mut reporter = CollectingReporter::new();
    let start = Instant::now();
    let summary = sched.run(tasks, &mut reporter).await;

    assert_eq!(summary.passed(), 4);
    assert_eq!(probe.peak(), 2);
    assert_elapsed(start, Duration::from_secs(2));
    for i in 0..4 {
        assert!(reporter.outcome(&format!("query[{i}]")).is_some());
    }
    assert_eq!(log.count("setup:backend"), 4);
    assert_eq!(log.count("teardown:backend"), 4);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn every_task_gets_exactly_one_outcome() -> TestResult {
    let mut sched = scheduler(max_tasks(4), vec![]);
    let mut reporter = CollectingReporter::new();
    let tasks: Vec<_> = (0..20)
        .map(|i| sleeping_task(&format!("t{i:02}"), Duration::from_millis(10 * (i % 5) + 1)))
        .collect();

    let summary = sched.run(tasks, &mut reporter).await;

    let mut ids: Vec<_> = reporter.outcomes.iter().map(|o| o.task_id.clone()).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 20);
    assert_eq!(summary.outcomes.len(), 20);
    assert!(summary.is_success());
    Ok(())
}
