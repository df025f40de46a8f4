// src/fixture/descriptor.rs

//! Fixture descriptors and the closed set of builder shapes.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use tokio_util::sync::CancellationToken;

use crate::types::{Scope, Shape};

/// Name of the pseudo-fixture that injects the [`Request`] handle.
pub const REQUEST_ARG: &str = "request";

/// A resolved fixture value, shared between every consumer of a cache entry.
pub type FixtureValue = Arc<dyn Any + Send + Sync>;

/// Positional arguments handed to builders and task bodies, in declared order.
pub type FixtureArgs = Vec<FixtureValue>;

/// Wrap any value as a [`FixtureValue`].
pub fn fixture_value<T: Any + Send + Sync>(value: T) -> FixtureValue {
    Arc::new(value)
}

/// Borrow a fixture value as `T`, if that is what it holds.
pub fn downcast<T: Any>(value: &FixtureValue) -> Option<&T> {
    (**value).downcast_ref::<T>()
}

pub type SyncTeardown = Box<dyn FnOnce() -> anyhow::Result<()> + Send>;
pub type AsyncTeardown = BoxFuture<'static, anyhow::Result<()>>;

/// The second stage of a generator-shaped fixture: everything after the yield.
pub enum Teardown {
    Sync(SyncTeardown),
    Async(AsyncTeardown),
}

impl Teardown {
    /// Resume the paused fixture exactly once.
    pub async fn resume(self) -> anyhow::Result<()> {
        match self {
            Teardown::Sync(f) => f(),
            Teardown::Async(fut) => fut.await,
        }
    }
}

impl fmt::Debug for Teardown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Teardown::Sync(_) => f.write_str("Teardown::Sync"),
            Teardown::Async(_) => f.write_str("Teardown::Async"),
        }
    }
}

/// Result of running a builder up to its first yield.
#[derive(Debug)]
pub struct Built {
    pub value: FixtureValue,
    pub teardown: Option<Teardown>,
}

type ValueFn = Arc<dyn Fn(FixtureArgs) -> anyhow::Result<FixtureValue> + Send + Sync>;
type GeneratorFn =
    Arc<dyn Fn(FixtureArgs) -> anyhow::Result<(FixtureValue, SyncTeardown)> + Send + Sync>;
type CoroutineFn =
    Arc<dyn Fn(FixtureArgs) -> BoxFuture<'static, anyhow::Result<FixtureValue>> + Send + Sync>;
type AsyncGeneratorFn = Arc<
    dyn Fn(FixtureArgs) -> BoxFuture<'static, anyhow::Result<(FixtureValue, AsyncTeardown)>>
        + Send
        + Sync,
>;

/// A fixture's backing callable, tagged by shape at construction time.
#[derive(Clone)]
pub enum FixtureFn {
    Value(ValueFn),
    Generator(GeneratorFn),
    Coroutine(CoroutineFn),
    AsyncGenerator(AsyncGeneratorFn),
}

impl FixtureFn {
    pub fn shape(&self) -> Shape {
        match self {
            FixtureFn::Value(_) => Shape::Value,
            FixtureFn::Generator(_) => Shape::Generator,
            FixtureFn::Coroutine(_) => Shape::Coroutine,
            FixtureFn::AsyncGenerator(_) => Shape::AsyncGenerator,
        }
    }

    /// Run the builder up to its first yield.
    ///
    /// Synchronous shapes run inline on the calling task; they are expected to
    /// be short.
    pub async fn build(&self, args: FixtureArgs) -> anyhow::Result<Built> {
        match self {
            FixtureFn::Value(f) => Ok(Built {
                value: f(args)?,
                teardown: None,
            }),
            FixtureFn::Generator(f) => {
                let (value, teardown) = f(args)?;
                Ok(Built {
                    value,
                    teardown: Some(Teardown::Sync(teardown)),
                })
            }
            FixtureFn::Coroutine(f) => Ok(Built {
                value: f(args).await?,
                teardown: None,
            }),
            FixtureFn::AsyncGenerator(f) => {
                let (value, teardown) = f(args).await?;
                Ok(Built {
                    value,
                    teardown: Some(Teardown::Async(teardown)),
                })
            }
        }
    }
}

/// A named setup/teardown provider.
///
/// Built with one of the shape constructors and refined with the builder
/// methods:
///
/// ```
/// use coopsched::fixture::{fixture_value, FixtureDescriptor};
/// use coopsched::types::Scope;
///
/// let db = FixtureDescriptor::coroutine("db", |_args| async {
///     Ok(fixture_value(String::from("postgres://localhost/test")))
/// })
/// .scope(Scope::Session);
/// assert_eq!(db.name(), "db");
/// ```
#[derive(Clone)]
pub struct FixtureDescriptor {
    name: String,
    scope: Scope,
    dependencies: Vec<String>,
    params: Option<Vec<FixtureValue>>,
    autouse: bool,
    module: Option<String>,
    func: FixtureFn,
}

impl FixtureDescriptor {
    fn with_fn(name: impl Into<String>, func: FixtureFn) -> Self {
        Self {
            name: name.into(),
            scope: Scope::Function,
            dependencies: Vec::new(),
            params: None,
            autouse: false,
            module: None,
            func,
        }
    }

    /// Plain synchronous fixture without teardown.
    pub fn value<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(FixtureArgs) -> anyhow::Result<FixtureValue> + Send + Sync + 'static,
    {
        Self::with_fn(name, FixtureFn::Value(Arc::new(f)))
    }

    /// Synchronous fixture returning its value plus the code to run after the yield.
    pub fn generator<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(FixtureArgs) -> anyhow::Result<(FixtureValue, SyncTeardown)> + Send + Sync + 'static,
    {
        Self::with_fn(name, FixtureFn::Generator(Arc::new(f)))
    }

    /// Asynchronous fixture without teardown.
    pub fn coroutine<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(FixtureArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<FixtureValue>> + Send + 'static,
    {
        Self::with_fn(
            name,
            FixtureFn::Coroutine(Arc::new(move |args| f(args).boxed())),
        )
    }

    /// Asynchronous fixture whose setup yields a value and a teardown future.
    ///
    /// The teardown future is not polled until the fixture is released.
    pub fn async_generator<F, Fut, T>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(FixtureArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<(FixtureValue, T)>> + Send + 'static,
        T: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self::with_fn(
            name,
            FixtureFn::AsyncGenerator(Arc::new(move |args| {
                let setup = f(args);
                async move {
                    let (value, teardown) = setup.await?;
                    Ok((value, teardown.boxed()))
                }
                .boxed()
            })),
        )
    }

    pub fn scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    /// Declare the fixtures this one consumes, in argument order.
    pub fn depends_on<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn params(mut self, params: Vec<FixtureValue>) -> Self {
        self.params = Some(params);
        self
    }

    pub fn autouse(mut self, autouse: bool) -> Self {
        self.autouse = autouse;
        self
    }

    /// Restrict an autouse fixture to tasks of one module.
    pub fn in_module(mut self, module: impl Into<String>) -> Self {
        self.module = Some(module.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get_scope(&self) -> Scope {
        self.scope
    }

    pub fn shape(&self) -> Shape {
        self.func.shape()
    }

    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    pub fn get_params(&self) -> Option<&[FixtureValue]> {
        self.params.as_deref()
    }

    pub fn is_autouse(&self) -> bool {
        self.autouse
    }

    pub fn module(&self) -> Option<&str> {
        self.module.as_deref()
    }

    pub fn func(&self) -> &FixtureFn {
        &self.func
    }

    /// Whether an autouse fixture applies to tasks of `module`.
    pub fn applies_to_module(&self, module: &str) -> bool {
        self.autouse && self.module.as_deref().is_none_or(|m| m == module)
    }
}

impl fmt::Debug for FixtureDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixtureDescriptor")
            .field("name", &self.name)
            .field("scope", &self.scope)
            .field("shape", &self.shape())
            .field("dependencies", &self.dependencies)
            .field("params", &self.params.as_ref().map(Vec::len))
            .field("autouse", &self.autouse)
            .field("module", &self.module)
            .finish()
    }
}

/// Handle injected for the `request` pseudo-fixture.
#[derive(Debug, Clone)]
pub struct Request {
    pub task_id: String,
    pub module: String,
    /// The fixture that asked for `request`, if any (None for the task itself).
    pub fixture: Option<String>,
    /// The current param of a parameterized requesting fixture.
    pub param: Option<FixtureValue>,
    /// Fires when the scheduler cancels this task.
    pub cancel: CancellationToken,
}

impl Request {
    pub fn param_as<T: Any>(&self) -> Option<&T> {
        self.param.as_ref().and_then(downcast::<T>)
    }
}
