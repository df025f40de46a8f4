// src/exec/task.rs

//! Task descriptors: a unit of work plus everything the scheduler needs to
//! know about it (tags, eligibility flags, declared fixture arguments).

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};

use crate::exec::bridge;
use crate::fixture::descriptor::{FixtureArgs, FixtureValue};

pub type TaskId = String;

type AsyncBody = Arc<dyn Fn(FixtureArgs) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;
type SyncBody = Arc<dyn Fn(FixtureArgs) -> anyhow::Result<()> + Send + Sync>;

/// The callable a task runs once its fixtures are resolved.
#[derive(Clone)]
pub enum TaskBody {
    /// Cooperative: runs on the scheduler's event loop.
    Async(AsyncBody),
    /// Blocking work moved to the blocking pool and awaited from the loop.
    Blocking(SyncBody),
    /// A plain synchronous callable. Not runnable by the cooperative
    /// scheduler; such tasks fail with `NotCoroutine`.
    Sync(SyncBody),
}

impl TaskBody {
    pub fn from_async<F, Fut>(f: F) -> Self
    where
        F: Fn(FixtureArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        TaskBody::Async(Arc::new(move |args| f(args).boxed()))
    }

    pub fn blocking<F>(f: F) -> Self
    where
        F: Fn(FixtureArgs) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        TaskBody::Blocking(Arc::new(f))
    }

    /// An async body that must not share the scheduler's loop: it is driven
    /// on a private current-thread runtime inside a blocking-pool thread.
    /// The future itself does not need to be `Send`.
    pub fn blocking_async<F, Fut>(f: F) -> Self
    where
        F: Fn(FixtureArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + 'static,
    {
        TaskBody::Blocking(Arc::new(move |args| bridge::block_on(f(args))?))
    }

    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(FixtureArgs) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        TaskBody::Sync(Arc::new(f))
    }

    /// Whether the body can be awaited by the scheduler.
    pub fn is_awaitable(&self) -> bool {
        !matches!(self, TaskBody::Sync(_))
    }

    fn kind(&self) -> &'static str {
        match self {
            TaskBody::Async(_) => "async",
            TaskBody::Blocking(_) => "blocking",
            TaskBody::Sync(_) => "sync",
        }
    }
}

#[derive(Clone)]
pub struct TaskDescriptor {
    pub id: TaskId,
    /// Grouping key for module-scoped fixtures and module-restricted autouse.
    pub module: String,
    /// Declared parameters, each resolved as a fixture, a direct call
    /// argument, or `request`.
    pub arg_names: Vec<String>,
    pub tags: BTreeSet<String>,
    /// May be re-run once after a non-passing first attempt.
    pub retry_eligible: bool,
    /// Subject to the scheduler's per-task timeout.
    pub deadline_eligible: bool,
    /// Runs under the cooperative scheduler; otherwise it is deferred to the
    /// caller untouched.
    pub cooperative: bool,
    /// Reported as skipped without admission.
    pub skip: Option<String>,
    /// Selected param index per parameterized fixture.
    pub fixture_params: BTreeMap<String, usize>,
    /// Values bound directly to argument names, overriding fixtures.
    pub direct_args: BTreeMap<String, FixtureValue>,
    pub body: TaskBody,
}

impl TaskDescriptor {
    /// A cooperative, deadline-eligible task with no arguments.
    ///
    /// The module defaults to the part of `id` before the last `::`.
    pub fn new(id: impl Into<String>, body: TaskBody) -> Self {
        let id = id.into();
        let module = id
            .rsplit_once("::")
            .map(|(module, _)| module.to_string())
            .unwrap_or_default();
        Self {
            id,
            module,
            arg_names: Vec::new(),
            tags: BTreeSet::new(),
            retry_eligible: false,
            deadline_eligible: true,
            cooperative: true,
            skip: None,
            fixture_params: BTreeMap::new(),
            direct_args: BTreeMap::new(),
            body,
        }
    }

    pub fn with_args<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.arg_names = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn in_module(mut self, module: impl Into<String>) -> Self {
        self.module = module.into();
        self
    }

    pub fn flakey(mut self) -> Self {
        self.retry_eligible = true;
        self
    }

    pub fn without_deadline(mut self) -> Self {
        self.deadline_eligible = false;
        self
    }

    pub fn deferred(mut self) -> Self {
        self.cooperative = false;
        self
    }

    pub fn skip(mut self, reason: impl Into<String>) -> Self {
        self.skip = Some(reason.into());
        self
    }

    pub fn with_arg(mut self, name: impl Into<String>, value: FixtureValue) -> Self {
        self.direct_args.insert(name.into(), value);
        self
    }

    /// One instance per value, with `name` bound directly and the instance
    /// id suffixed `[i]`. `name` is appended to the declared arguments if
    /// it is not already one.
    pub fn parametrize(&self, name: &str, values: Vec<FixtureValue>) -> Vec<TaskDescriptor> {
        values
            .into_iter()
            .enumerate()
            .map(|(i, value)| {
                let mut instance = self.clone();
                instance.id = format!("{}[{i}]", self.id);
                if !instance.arg_names.iter().any(|a| a == name) {
                    instance.arg_names.push(name.to_string());
                }
                instance.direct_args.insert(name.to_string(), value);
                instance
            })
            .collect()
    }
}

impl fmt::Debug for TaskDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskDescriptor")
            .field("id", &self.id)
            .field("module", &self.module)
            .field("arg_names", &self.arg_names)
            .field("tags", &self.tags)
            .field("retry_eligible", &self.retry_eligible)
            .field("deadline_eligible", &self.deadline_eligible)
            .field("cooperative", &self.cooperative)
            .field("skip", &self.skip)
            .field("fixture_params", &self.fixture_params)
            .field("direct_args", &self.direct_args.keys().collect::<Vec<_>>())
            .field("body", &self.body.kind())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::descriptor::{downcast, fixture_value};

    #[test]
    fn module_defaults_to_id_prefix() {
        let body = TaskBody::from_async(|_| async { Ok(()) });
        assert_eq!(TaskDescriptor::new("tests/db.rs::test_insert", body.clone()).module, "tests/db.rs");
        assert_eq!(TaskDescriptor::new("standalone", body).module, "");
    }

    #[test]
    fn parametrize_binds_direct_arguments() {
        let base = TaskDescriptor::new("m::t", TaskBody::from_async(|_| async { Ok(()) }))
            .with_args(["db"]);
        let instances = base.parametrize("n", vec![fixture_value(1u8), fixture_value(2u8)]);

        assert_eq!(instances.len(), 2);
        assert_eq!(instances[1].id, "m::t[1]");
        assert_eq!(instances[1].arg_names, ["db", "n"]);
        assert_eq!(downcast::<u8>(&instances[1].direct_args["n"]), Some(&2));
    }
}
