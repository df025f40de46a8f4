// src/fixture/resolver.rs

//! Turning a task's declared arguments into fixture values.
//!
//! Resolution is recursive and concurrent: the dependencies of one fixture
//! are resolved side by side, and every value goes through a cache so that a
//! fixture reached along several paths is built once. Module and session
//! fixtures use the resolver's shared cache; function fixtures use a cache
//! private to the attempt ([`TaskFixtures`]).
//!
//! Shared fixtures are reference counted through [`Reservation`]s taken
//! before a task is queued. The release that drops the last reservation of a
//! built generator fixture resumes its teardown, so a shared teardown runs
//! after the last dependent task, whether or not dependents overlapped in
//! time.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use futures::future::{join_all, BoxFuture, FutureExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::errors::TaskError;
use crate::exec::task::TaskDescriptor;
use crate::fixture::cache::{CacheKey, FixtureCache};
use crate::fixture::descriptor::{fixture_value, FixtureDescriptor, FixtureValue, Request, REQUEST_ARG};
use crate::fixture::registry::FixtureRegistry;

/// Pre-registered consumer slots on shared fixtures, in dependency order.
///
/// Not `Clone`: every reservation must be released exactly once, either by
/// the attempt that owns it or through [`FixtureResolver::release`].
#[derive(Debug, Default)]
pub struct Reservation {
    keys: Vec<CacheKey>,
}

impl Reservation {
    pub fn keys(&self) -> &[CacheKey] {
        &self.keys
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// A fixture instance an attempt acquired and must give back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TeardownHandle {
    /// Function scope: resumed directly when the attempt ends.
    Local(CacheKey),
    /// Module or session scope: released against the shared cache.
    Shared(CacheKey),
}

impl TeardownHandle {
    pub fn key(&self) -> &CacheKey {
        match self {
            TeardownHandle::Local(k) | TeardownHandle::Shared(k) => k,
        }
    }
}

/// Per-attempt fixture state.
pub struct TaskFixtures {
    task: Arc<TaskDescriptor>,
    cancel: CancellationToken,
    local: FixtureCache,
    acquired: Mutex<Vec<TeardownHandle>>,
    reservation: Reservation,
}

impl TaskFixtures {
    pub fn task(&self) -> &Arc<TaskDescriptor> {
        &self.task
    }

    fn record(&self, handle: TeardownHandle) {
        let mut acquired = self
            .acquired
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !acquired.contains(&handle) {
            acquired.push(handle);
        }
    }

    fn request(&self, requester: Option<&FixtureDescriptor>) -> FixtureValue {
        let param = requester.and_then(|fixture| {
            let idx = CacheKey::for_task(fixture, &self.task).param?;
            fixture.get_params()?.get(idx).cloned()
        });
        fixture_value(Request {
            task_id: self.task.id.clone(),
            module: self.task.module.clone(),
            fixture: requester.map(|f| f.name().to_string()),
            param,
            cancel: self.cancel.clone(),
        })
    }
}

pub struct FixtureResolver {
    registry: Arc<FixtureRegistry>,
    shared: FixtureCache,
}

impl FixtureResolver {
    pub fn new(registry: Arc<FixtureRegistry>) -> Self {
        Self {
            registry,
            shared: FixtureCache::new(),
        }
    }

    pub fn registry(&self) -> &FixtureRegistry {
        &self.registry
    }

    pub fn shared_cache(&self) -> &FixtureCache {
        &self.shared
    }

    /// Shared cache keys the task will touch, dependencies first.
    pub fn plan(&self, task: &TaskDescriptor) -> Vec<CacheKey> {
        self.registry
            .closure(task)
            .iter()
            .filter(|f| f.get_scope().is_shared())
            .map(|f| CacheKey::for_task(f, task))
            .collect()
    }

    /// Register the task as one future consumer of every shared fixture it needs.
    pub fn reserve(&self, task: &TaskDescriptor) -> Reservation {
        let keys = self.plan(task);
        for key in &keys {
            self.shared.reserve(key);
        }
        Reservation { keys }
    }

    /// Give back a reservation that no attempt consumed.
    pub async fn release(&self, reservation: Reservation) -> Vec<TaskError> {
        let mut errors = Vec::new();
        for key in reservation.keys.iter().rev() {
            if let Err(err) = self.shared.release(key).await {
                errors.push(teardown_error(key, err));
            }
        }
        errors
    }

    /// Fresh per-attempt state holding `reservation`.
    pub fn scope_for(
        &self,
        task: Arc<TaskDescriptor>,
        reservation: Reservation,
        cancel: CancellationToken,
    ) -> TaskFixtures {
        TaskFixtures {
            task,
            cancel,
            local: FixtureCache::new(),
            acquired: Mutex::new(Vec::new()),
            reservation,
        }
    }

    /// Resolve every declared argument of the task, plus applicable autouse
    /// fixtures. Returns the values of the declared arguments, in order.
    ///
    /// On error, whatever was acquired before the failure is still recorded
    /// in `fixtures` and is undone by [`FixtureResolver::teardown`].
    pub async fn resolve(&self, fixtures: &TaskFixtures) -> Result<Vec<FixtureValue>, TaskError> {
        let names = self.registry.requested_names(&fixtures.task);
        let mut values = self.resolve_all(fixtures, &names, None).await?;
        values.truncate(fixtures.task.arg_names.len());
        Ok(values)
    }

    /// Siblings always run to completion, even after one of them fails: a
    /// sibling halfway through a shared build must finish and memoize it, and
    /// whatever it acquired must be recorded for teardown. The first error in
    /// declaration order is returned.
    fn resolve_all<'a>(
        &'a self,
        fx: &'a TaskFixtures,
        names: &'a [String],
        requester: Option<&'a FixtureDescriptor>,
    ) -> BoxFuture<'a, Result<Vec<FixtureValue>, TaskError>> {
        async move {
            join_all(
                names
                    .iter()
                    .map(move |name| self.resolve_name(fx, name, requester)),
            )
            .await
            .into_iter()
            .collect::<Result<Vec<_>, _>>()
        }
        .boxed()
    }

    fn resolve_name<'a>(
        &'a self,
        fx: &'a TaskFixtures,
        name: &'a str,
        requester: Option<&'a FixtureDescriptor>,
    ) -> BoxFuture<'a, Result<FixtureValue, TaskError>> {
        async move {
            if name == REQUEST_ARG {
                return Ok(fx.request(requester));
            }
            if let Some(value) = fx.task.direct_args.get(name) {
                return Ok(value.clone());
            }
            let Some(fixture) = self.registry.get(name).cloned() else {
                return Err(TaskError::UnknownFixture {
                    name: name.to_string(),
                    requested_by: requester
                        .map_or_else(|| fx.task.id.clone(), |f| f.name().to_string()),
                });
            };

            let key = CacheKey::for_task(&fixture, &fx.task);
            let shared = fixture.get_scope().is_shared();
            let cache = if shared { &self.shared } else { &fx.local };

            let descriptor: &FixtureDescriptor = &fixture;
            let key_ref = &key;
            let built = cache
                .get_or_build(&key, move || async move {
                    let args = self
                        .resolve_all(fx, descriptor.dependencies(), Some(descriptor))
                        .await
                        .map_err(anyhow::Error::new)?;
                    debug!(
                        task = %fx.task.id,
                        fixture = %key_ref,
                        scope = %descriptor.get_scope(),
                        shape = %descriptor.shape(),
                        "setting up fixture"
                    );
                    descriptor.func().build(args).await
                })
                .await;

            match built {
                Ok(value) => {
                    trace!(task = %fx.task.id, fixture = %key, "fixture acquired");
                    fx.record(if shared {
                        TeardownHandle::Shared(key)
                    } else {
                        TeardownHandle::Local(key)
                    });
                    Ok(value)
                }
                // A dependency failed first: surface its error, not ours.
                Err(err) => Err(match err.downcast_ref::<TaskError>() {
                    Some(inner) => inner.clone(),
                    None => TaskError::Setup {
                        fixture: name.to_string(),
                        error: err,
                    },
                }),
            }
        }
        .boxed()
    }

    /// Undo an attempt's fixtures in reverse acquisition order, then release
    /// any reserved shared fixture the attempt never reached.
    ///
    /// Every teardown is attempted; failures are collected, not raised.
    pub async fn teardown(&self, fixtures: TaskFixtures) -> Vec<TaskError> {
        let TaskFixtures {
            task,
            local,
            acquired,
            reservation,
            ..
        } = fixtures;
        let handles = acquired
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut errors = Vec::new();
        let mut released: HashSet<CacheKey> = HashSet::new();

        for handle in handles.into_iter().rev() {
            match handle {
                TeardownHandle::Local(key) => {
                    let Some(entry) = local.existing(&key) else {
                        continue;
                    };
                    if let Some(teardown) = entry.take_teardown().await {
                        debug!(task = %task.id, fixture = %key, "tearing down fixture");
                        if let Err(err) = teardown.resume().await {
                            warn!(task = %task.id, fixture = %key, error = %err, "fixture teardown failed");
                            errors.push(teardown_error(&key, err));
                        }
                    }
                }
                TeardownHandle::Shared(key) => {
                    if !reservation.keys.contains(&key) {
                        // Nothing to release against; the entry's teardown
                        // is left to the end-of-run sweep.
                        warn!(task = %task.id, fixture = %key, "shared fixture acquired without reservation");
                        continue;
                    }
                    if !released.insert(key.clone()) {
                        continue;
                    }
                    if let Err(err) = self.shared.release(&key).await {
                        warn!(task = %task.id, fixture = %key, error = %err, "fixture teardown failed");
                        errors.push(teardown_error(&key, err));
                    }
                }
            }
        }

        for key in reservation.keys.iter().rev() {
            if released.contains(key) {
                continue;
            }
            if let Err(err) = self.shared.release(key).await {
                warn!(task = %task.id, fixture = %key, error = %err, "fixture teardown failed");
                errors.push(teardown_error(key, err));
            }
        }

        errors
    }

    /// End-of-run sweep over the shared cache.
    pub async fn finalize(&self) -> Vec<TaskError> {
        self.shared
            .finalize()
            .await
            .into_iter()
            .map(|(key, err)| teardown_error(&key, err))
            .collect()
    }
}

fn teardown_error(key: &CacheKey, err: anyhow::Error) -> TaskError {
    TaskError::Teardown {
        fixture: key.fixture.clone(),
        error: Arc::new(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::task::TaskBody;
    use crate::fixture::descriptor::{downcast, SyncTeardown};
    use crate::types::Scope;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn task(id: &str, args: &[&str]) -> Arc<TaskDescriptor> {
        Arc::new(
            TaskDescriptor::new(id, TaskBody::from_async(|_| async { Ok(()) }))
                .with_args(args.iter().copied()),
        )
    }

    fn resolver(fixtures: Vec<FixtureDescriptor>) -> FixtureResolver {
        FixtureResolver::new(Arc::new(FixtureRegistry::from_fixtures(fixtures).unwrap()))
    }

    #[tokio::test]
    async fn diamond_builds_shared_dependency_once_per_task() {
        let builds = Arc::new(AtomicUsize::new(0));
        let counter = builds.clone();
        let resolver = resolver(vec![
            FixtureDescriptor::value("base", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(fixture_value(10u32))
            }),
            FixtureDescriptor::value("left", |args| {
                Ok(fixture_value(downcast::<u32>(&args[0]).copied().unwrap_or(0) + 1))
            })
            .depends_on(["base"]),
            FixtureDescriptor::value("right", |args| {
                Ok(fixture_value(downcast::<u32>(&args[0]).copied().unwrap_or(0) + 2))
            })
            .depends_on(["base"]),
        ]);

        let t = task("t", &["left", "right"]);
        let fx = resolver.scope_for(t.clone(), resolver.reserve(&t), CancellationToken::new());
        let values = resolver.resolve(&fx).await.unwrap();

        assert_eq!(downcast::<u32>(&values[0]), Some(&11));
        assert_eq!(downcast::<u32>(&values[1]), Some(&12));
        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert!(resolver.teardown(fx).await.is_empty());
    }

    #[tokio::test]
    async fn unknown_fixture_names_the_requester() {
        let resolver = resolver(vec![]);
        let t = task("needs_ghost", &["ghost"]);
        let fx = resolver.scope_for(t.clone(), resolver.reserve(&t), CancellationToken::new());

        let err = resolver.resolve(&fx).await.unwrap_err();
        assert!(matches!(
            &err,
            TaskError::UnknownFixture { name, requested_by }
                if name == "ghost" && requested_by == "needs_ghost"
        ));
    }

    #[tokio::test]
    async fn dependency_failure_is_reported_against_the_failing_fixture() {
        let resolver = resolver(vec![
            FixtureDescriptor::value("broken", |_| Err(anyhow::anyhow!("no socket"))),
            FixtureDescriptor::value("client", |_| Ok(fixture_value(())))
                .depends_on(["broken"])
                .scope(Scope::Function),
        ]);
        let t = task("t", &["client"]);
        let fx = resolver.scope_for(t.clone(), resolver.reserve(&t), CancellationToken::new());

        match resolver.resolve(&fx).await.unwrap_err() {
            TaskError::Setup { fixture, error } => {
                assert_eq!(fixture, "broken");
                assert_eq!(error.to_string(), "no socket");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn request_carries_task_and_param() {
        let resolver = resolver(vec![
            FixtureDescriptor::value("which", |args| {
                let request = downcast::<Request>(&args[0]).unwrap();
                Ok(fixture_value(format!(
                    "{}:{}",
                    request.task_id,
                    request.param_as::<&str>().unwrap()
                )))
            })
            .depends_on(["request"])
            .params(vec![fixture_value("x"), fixture_value("y")]),
        ]);
        let expanded = resolver
            .registry()
            .parametrize_tasks(vec![(*task("t", &["which"])).clone()]);
        let second = Arc::new(expanded[1].clone());

        let fx = resolver.scope_for(second.clone(), resolver.reserve(&second), CancellationToken::new());
        let values = resolver.resolve(&fx).await.unwrap();
        assert_eq!(downcast::<String>(&values[0]).unwrap(), "t[1]:y");
    }

    #[tokio::test]
    async fn unreserved_shared_fixture_is_left_for_the_final_sweep() {
        let torn_down = Arc::new(AtomicUsize::new(0));
        let counter = torn_down.clone();
        let resolver = resolver(vec![FixtureDescriptor::generator("pool", move |_| {
            let counter = counter.clone();
            let teardown: SyncTeardown = Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
            Ok((fixture_value(()), teardown))
        })
        .scope(Scope::Session)]);
        let t = task("t", &["pool"]);

        let fx = resolver.scope_for(t.clone(), Reservation::default(), CancellationToken::new());
        resolver.resolve(&fx).await.unwrap();
        assert!(resolver.teardown(fx).await.is_empty());
        assert_eq!(torn_down.load(Ordering::SeqCst), 0);

        assert!(resolver.finalize().await.is_empty());
        assert_eq!(torn_down.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unreached_reservations_are_released() {
        let resolver = resolver(vec![
            FixtureDescriptor::value("session_thing", |_| Ok(fixture_value(())))
                .scope(Scope::Session),
        ]);
        let t = task("t", &["session_thing", "missing"]);
        let reservation = resolver.reserve(&t);
        let key = reservation.keys()[0].clone();
        assert_eq!(resolver.shared_cache().consumers(&key), 1);

        let fx = resolver.scope_for(t.clone(), reservation, CancellationToken::new());
        let _ = resolver.resolve(&fx).await;
        resolver.teardown(fx).await;
        assert_eq!(resolver.shared_cache().consumers(&key), 0);
    }
}
