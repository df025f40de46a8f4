// src/lib.rs

pub mod cli;
pub mod config;
pub mod engine;
pub mod errors;
pub mod exec;
pub mod fixture;
pub mod logging;
pub mod report;
pub mod suite;
pub mod types;

use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::cli::CliArgs;
use crate::engine::{Scheduler, SchedulerConfig};
use crate::exec::TaskRunner;
use crate::fixture::{FixtureRegistry, FixtureResolver};
use crate::report::{LogReporter, Reporter, RunSummary};
use crate::suite::{load_suite, Suite};

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - suite loading and CLI overrides
/// - the scheduler and its fixture resolver
/// - sequential execution of deferred (non-cooperative) tasks
/// - Ctrl-C handling
pub async fn run(args: CliArgs) -> Result<RunSummary> {
    let suite = load_suite(&args.suite)?;
    let config = args.apply_to(suite.config.clone())?;

    if args.dry_run {
        print_dry_run(&suite, &config);
        return Ok(RunSummary::default());
    }

    let resolver = Arc::new(FixtureResolver::new(suite.registry.clone()));
    let mut scheduler = Scheduler::new(config, resolver)?;

    // Ctrl-C → graceful shutdown.
    {
        let token = scheduler.shutdown_token();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                eprintln!("failed to listen for Ctrl+C: {e}");
                return;
            }
            warn!("Ctrl-C received; shutting down");
            token.cancel();
        });
    }

    let mut reporter = LogReporter;
    let mut summary = scheduler.run(suite.tasks, &mut reporter).await;
    run_deferred(suite.registry, &mut summary, &mut reporter).await;
    Ok(summary)
}

/// Run tasks the scheduler handed back, one at a time, with their own
/// fixture cache.
async fn run_deferred(
    registry: Arc<FixtureRegistry>,
    summary: &mut RunSummary,
    reporter: &mut dyn Reporter,
) {
    if summary.deferred.is_empty() {
        return;
    }
    info!(count = summary.deferred.len(), "running deferred tasks sequentially");

    let runner = TaskRunner::new(Arc::new(FixtureResolver::new(registry)));
    for task in std::mem::take(&mut summary.deferred) {
        let outcome = runner.run(task).await;
        reporter.task_finished(&outcome);
        summary.outcomes.push(outcome);
    }
    summary
        .fixture_errors
        .extend(runner.resolver().finalize().await);

    info!(
        passed = summary.passed(),
        failed = summary.failed(),
        cancelled = summary.cancelled(),
        skipped = summary.skipped(),
        "deferred tasks finished"
    );
}

/// Print the effective scheduler settings, fixtures and task instances.
fn print_dry_run(suite: &Suite, config: &SchedulerConfig) {
    println!("coopsched dry-run");
    println!("  max_concurrent_tasks = {}", config.max_concurrent_tasks);
    println!("  task_timeout = {:.2}s", config.task_timeout.as_secs_f64());
    println!(
        "  poll_interval_cap = {:.2}s",
        config.poll_interval_cap.as_secs_f64()
    );
    if !config.group_limits.is_empty() {
        println!("  max_concurrent_by_group = {}", config.group_limits);
    }
    if config.remainder_group_ceiling > 0 {
        println!(
            "  remainder_group_ceiling = {}",
            config.remainder_group_ceiling
        );
    }
    println!();

    println!("fixtures ({}):", suite.registry.len());
    for fixture in suite.registry.iter() {
        println!(
            "  - {} [{}, {}]",
            fixture.name(),
            fixture.get_scope(),
            fixture.shape()
        );
        let deps: Vec<&str> = fixture
            .dependencies()
            .iter()
            .map(String::as_str)
            .filter(|d| *d != fixture::REQUEST_ARG)
            .collect();
        if !deps.is_empty() {
            println!("      after: {deps:?}");
        }
        if let Some(params) = fixture.get_params() {
            println!("      params: {}", params.len());
        }
        if fixture.is_autouse() {
            match fixture.module() {
                Some(module) => println!("      autouse in module '{module}'"),
                None => println!("      autouse"),
            }
        }
    }
    println!();

    println!("tasks ({}):", suite.tasks.len());
    for task in &suite.tasks {
        println!("  - {}", task.id);
        let fixtures: Vec<String> = suite
            .registry
            .closure(task)
            .iter()
            .map(|f| f.name().to_string())
            .collect();
        if !fixtures.is_empty() {
            println!("      fixtures: {fixtures:?}");
        }
        if !task.tags.is_empty() {
            println!("      tags: {:?}", task.tags);
        }
        if let Some(reason) = &task.skip {
            println!("      skip: {reason}");
        }
        if task.retry_eligible {
            println!("      flakey: true");
        }
        if !task.deadline_eligible {
            println!("      timeout: false");
        }
        if !task.cooperative {
            println!("      cooperative: false");
        }
    }

    debug!("dry-run complete (no execution)");
}
