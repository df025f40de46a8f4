use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use coopsched::engine::{Scheduler, SchedulerConfig};
use coopsched::exec::{TaskBody, TaskDescriptor};
use coopsched::fixture::{fixture_value, FixtureDescriptor, FixtureRegistry, FixtureResolver};
use coopsched::types::Scope;

use crate::recorder::{ConcurrencyProbe, EventLog};

/// A task that sleeps for `duration` and passes.
pub fn sleeping_task(id: &str, duration: Duration) -> TaskDescriptor {
    TaskDescriptor::new(
        id,
        TaskBody::from_async(move |_| async move {
            tokio::time::sleep(duration).await;
            Ok(())
        }),
    )
}

/// A task that fails immediately with `message`.
pub fn failing_task(id: &str, message: &str) -> TaskDescriptor {
    let message = message.to_string();
    TaskDescriptor::new(
        id,
        TaskBody::from_async(move |_| {
            let message = message.clone();
            async move { Err(anyhow::anyhow!(message)) }
        }),
    )
}

/// A task that sleeps inside every probe in `probes` and logs `call:<id>`.
pub fn probed_task(
    id: &str,
    duration: Duration,
    probes: Vec<ConcurrencyProbe>,
    log: &EventLog,
) -> TaskDescriptor {
    let log = log.clone();
    let label = id.to_string();
    TaskDescriptor::new(
        id,
        TaskBody::from_async(move |_| {
            let probes = probes.clone();
            let log = log.clone();
            let label = label.clone();
            async move {
                let _guards: Vec<_> = probes.iter().map(ConcurrencyProbe::enter).collect();
                log.push(format!("call:{label}"));
                tokio::time::sleep(duration).await;
                Ok(())
            }
        }),
    )
}

/// A retry-eligible task that fails its first `failures` calls.
///
/// The call counter lives outside the task so the test can read it.
pub fn flakey_task(id: &str, failures: usize, calls: Arc<AtomicUsize>) -> TaskDescriptor {
    TaskDescriptor::new(
        id,
        TaskBody::from_async(move |_| {
            let calls = calls.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < failures {
                    anyhow::bail!("flake #{n}");
                }
                Ok(())
            }
        }),
    )
    .flakey()
}

/// A task declaring `args` that logs `call:<id>`.
pub fn logging_task(id: &str, args: &[&str], log: &EventLog) -> TaskDescriptor {
    let log = log.clone();
    let label = id.to_string();
    TaskDescriptor::new(
        id,
        TaskBody::from_async(move |_| {
            let log = log.clone();
            let label = label.clone();
            async move {
                log.push(format!("call:{label}"));
                Ok(())
            }
        }),
    )
    .with_args(args.iter().copied())
}

/// An async-generator fixture whose value is its own name.
///
/// Logs `setup:<name>` after `delay` and `teardown:<name>` on teardown.
pub fn logging_fixture(
    name: &str,
    scope: Scope,
    deps: &[&str],
    delay: Duration,
    log: &EventLog,
) -> FixtureDescriptor {
    let log = log.clone();
    let label = name.to_string();
    FixtureDescriptor::async_generator(name, move |_| {
        let log = log.clone();
        let label = label.clone();
        async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            log.push(format!("setup:{label}"));
            let value = fixture_value(label.clone());
            let teardown = async move {
                log.push(format!("teardown:{label}"));
                Ok(())
            };
            Ok::<_, anyhow::Error>((value, teardown))
        }
    })
    .scope(scope)
    .depends_on(deps.iter().copied())
}

/// Like [`logging_fixture`], but also logs `start:<name>` each time its
/// builder is entered, before the delay. Counting `start:` events shows how
/// often a build was attempted, including builds that never finished.
pub fn announcing_fixture(name: &str, scope: Scope, delay: Duration, log: &EventLog) -> FixtureDescriptor {
    let log = log.clone();
    let label = name.to_string();
    FixtureDescriptor::async_generator(name, move |_| {
        let log = log.clone();
        let label = label.clone();
        async move {
            log.push(format!("start:{label}"));
            tokio::time::sleep(delay).await;
            log.push(format!("setup:{label}"));
            let value = fixture_value(label.clone());
            let teardown = async move {
                log.push(format!("teardown:{label}"));
                Ok(())
            };
            Ok::<_, anyhow::Error>((value, teardown))
        }
    })
    .scope(scope)
}

/// A coroutine fixture whose setup always fails.
pub fn failing_fixture(name: &str, scope: Scope, message: &str) -> FixtureDescriptor {
    let message = message.to_string();
    FixtureDescriptor::coroutine(name, move |_| {
        let message = message.clone();
        async move { Err::<coopsched::fixture::FixtureValue, _>(anyhow::anyhow!(message)) }
    })
    .scope(scope)
}

pub fn resolver(fixtures: Vec<FixtureDescriptor>) -> Arc<FixtureResolver> {
    let registry = FixtureRegistry::from_fixtures(fixtures).expect("valid fixture registry");
    Arc::new(FixtureResolver::new(Arc::new(registry)))
}

pub fn scheduler(config: SchedulerConfig, fixtures: Vec<FixtureDescriptor>) -> Scheduler {
    Scheduler::new(config, resolver(fixtures)).expect("valid scheduler config")
}

/// Default config with `max_concurrent_tasks` replaced.
pub fn max_tasks(n: usize) -> SchedulerConfig {
    SchedulerConfig {
        max_concurrent_tasks: n,
        ..SchedulerConfig::default()
    }
}
