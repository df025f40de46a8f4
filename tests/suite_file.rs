#![cfg(unix)]

use std::error::Error;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use clap::Parser;

use coopsched::cli::CliArgs;
use coopsched::engine::Scheduler;
use coopsched::fixture::FixtureResolver;
use coopsched::report::TaskStatus;
use coopsched::suite::load_suite;
use coopsched_test_utils::{init_tracing, CollectingReporter};

type TestResult = Result<(), Box<dyn Error>>;

fn write_suite(dir: &Path, body: &str) -> Result<String, Box<dyn Error>> {
    let path = dir.join("coopsched.toml");
    fs::write(&path, body)?;
    Ok(path.display().to_string())
}

#[tokio::test]
async fn suite_file_runs_commands_with_fixture_values() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let journal = dir.path().join("journal.txt");
    let suite_path = write_suite(
        dir.path(),
        &format!(
            r#"
[scheduler]
max_concurrent_tasks = 2

[fixture.db]
scope = "session"
setup = "echo setup >> {journal}; echo postgres://test"
teardown = "echo \"teardown $COOP_VALUE\" >> {journal}"

[fixture.conn]
setup = "echo \"$COOP_FIXTURE_DB/conn\""
after = ["db"]

[task.uses_conn]
cmd = "test \"$COOP_FIXTURE_CONN\" = postgres://test/conn"
fixtures = ["conn"]

[task.uses_db]
cmd = "test -n \"$COOP_FIXTURE_DB\""
fixtures = ["db"]

[task.fails]
cmd = "exit 3"

[task.skipped]
cmd = "exit 1"
skip = "not on this host"
"#,
            journal = journal.display()
        ),
    )?;

    let suite = load_suite(&suite_path)?;
    let resolver = Arc::new(FixtureResolver::new(suite.registry.clone()));
    let mut scheduler = Scheduler::new(suite.config.clone(), resolver)?;
    let mut reporter = CollectingReporter::new();
    let summary = scheduler.run(suite.tasks, &mut reporter).await;

    assert_eq!(reporter.outcome("uses_conn").unwrap().status, TaskStatus::Passed);
    assert_eq!(reporter.outcome("uses_db").unwrap().status, TaskStatus::Passed);
    assert_eq!(reporter.outcome("fails").unwrap().status, TaskStatus::Failed);
    assert_eq!(reporter.outcome("skipped").unwrap().status, TaskStatus::Skipped);
    assert_eq!(summary.outcomes.len(), 4);

    let journal = fs::read_to_string(&journal)?;
    let lines: Vec<_> = journal.lines().collect();
    assert_eq!(lines, ["setup", "teardown postgres://test"]);
    Ok(())
}

#[tokio::test]
async fn cli_overrides_and_reports_failure() -> TestResult {
    let dir = tempfile::tempdir()?;
    let suite_path = write_suite(
        dir.path(),
        r#"
[scheduler]
max_concurrent_tasks = 1

[task.ok]
cmd = "true"

[task.broken]
cmd = "false"

[task.host_only]
cmd = "true"
cooperative = false
"#,
    )?;

    let args = CliArgs::parse_from(["coopsched", "--suite", &suite_path, "--max-tasks", "4"]);
    let summary = coopsched::run(args).await?;

    assert_eq!(summary.passed(), 2);
    assert_eq!(summary.failed(), 1);
    assert!(summary.deferred.is_empty());
    assert!(!summary.is_success());
    Ok(())
}

#[tokio::test]
async fn dry_run_executes_nothing() -> TestResult {
    let dir = tempfile::tempdir()?;
    let marker = dir.path().join("ran");
    let suite_path = write_suite(
        dir.path(),
        &format!("[task.t]\ncmd = \"touch {}\"\n", marker.display()),
    )?;

    let args = CliArgs::parse_from(["coopsched", "--suite", &suite_path, "--dry-run"]);
    let summary = coopsched::run(args).await?;

    assert!(summary.outcomes.is_empty());
    assert!(!marker.exists());
    Ok(())
}

#[tokio::test]
async fn invalid_suite_is_rejected_before_running() -> TestResult {
    let dir = tempfile::tempdir()?;
    let suite_path = write_suite(
        dir.path(),
        r#"
[fixture.a]
setup = "echo a"
after = ["b"]

[fixture.b]
setup = "echo b"
after = ["a"]

[task.t]
cmd = "true"
fixtures = ["a"]
"#,
    )?;

    let err = load_suite(&suite_path).unwrap_err();
    assert!(format!("{err:#}").contains("cycle"), "{err:#}");
    Ok(())
}
