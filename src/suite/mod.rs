// src/suite/mod.rs

//! Turning a suite file into runnable fixtures and tasks.
//!
//! Every fixture and task in a suite file is a shell command:
//! - a fixture's setup command prints its value on stdout;
//! - a fixture's teardown command (if any) runs when the value is retired;
//! - a task command passes when it exits with status 0.
//!
//! Values travel through the environment. A command sees the fixtures it
//! depends on as `COOP_FIXTURE_<NAME>`, a parameterized fixture sees its
//! current param as `COOP_PARAM`, and a teardown command sees the value it
//! is retiring as `COOP_VALUE`.
//!
//! Only fixtures a task lists in `fixtures` are exported to its command.
//! Autouse fixtures still run around the task, but their values are not
//! passed on; list one explicitly to read it.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tracing::{debug, info};

use crate::config::loader::load_and_validate;
use crate::config::model::{FixtureConfig, SuiteFile, TaskConfig};
use crate::engine::scheduler::SchedulerConfig;
use crate::errors::{CoopError, Result};
use crate::exec::command::{fixture_env_var, run_checked};
use crate::exec::task::{TaskBody, TaskDescriptor};
use crate::fixture::descriptor::{
    downcast, fixture_value, FixtureArgs, FixtureDescriptor, Request, REQUEST_ARG,
};
use crate::fixture::registry::FixtureRegistry;
use crate::types::Scope;

pub const PARAM_ENV: &str = "COOP_PARAM";
pub const VALUE_ENV: &str = "COOP_VALUE";

/// A loaded suite, ready to hand to the scheduler.
#[derive(Debug)]
pub struct Suite {
    pub config: SchedulerConfig,
    pub registry: Arc<FixtureRegistry>,
    /// Task instances after parameter expansion, ordered by task name.
    pub tasks: Vec<TaskDescriptor>,
}

/// Load, validate and build the suite at `path`.
pub fn load_suite(path: impl AsRef<Path>) -> anyhow::Result<Suite> {
    let path = path.as_ref();
    let file = load_and_validate(path)?;
    let suite = build_suite(&file).with_context(|| format!("building suite {:?}", path))?;
    info!(
        suite = %path.display(),
        fixtures = suite.registry.len(),
        tasks = suite.tasks.len(),
        "loaded suite"
    );
    Ok(suite)
}

pub fn build_suite(file: &SuiteFile) -> Result<Suite> {
    let config = file.scheduler.to_scheduler_config()?;

    let fixtures = file
        .fixture
        .iter()
        .map(|(name, fixture)| command_fixture(name, fixture))
        .collect::<Result<Vec<_>>>()?;
    let registry = FixtureRegistry::from_fixtures(fixtures)?;

    let tasks = file
        .task
        .iter()
        .map(|(id, task)| command_task(id, task))
        .collect();
    let tasks = registry.parametrize_tasks(tasks);

    Ok(Suite {
        config,
        registry: Arc::new(registry),
        tasks,
    })
}

/// The commands of one suite-file fixture.
#[derive(Debug)]
struct CommandFixture {
    name: String,
    after: Vec<String>,
    setup: String,
    teardown: Option<String>,
}

impl CommandFixture {
    /// Environment for this fixture's commands. `args` holds the values of
    /// `after`, in order, followed by the request.
    fn env(&self, args: &FixtureArgs) -> Vec<(String, String)> {
        let mut env: Vec<(String, String)> = self
            .after
            .iter()
            .zip(args)
            .filter_map(|(dep, value)| {
                downcast::<String>(value).map(|v| (fixture_env_var(dep), v.clone()))
            })
            .collect();
        let param = args
            .last()
            .and_then(downcast::<Request>)
            .and_then(|request| request.param_as::<String>());
        if let Some(param) = param {
            env.push((PARAM_ENV.to_string(), param.clone()));
        }
        env
    }

    async fn setup(&self, args: FixtureArgs) -> anyhow::Result<(String, Vec<(String, String)>)> {
        let env = self.env(&args);
        let value = run_checked(&self.name, &self.setup, &env).await?;
        debug!(fixture = %self.name, value = %value, "fixture setup command finished");
        Ok((value, env))
    }

    async fn teardown(&self, mut env: Vec<(String, String)>, value: String) -> anyhow::Result<()> {
        let Some(cmd) = &self.teardown else {
            return Ok(());
        };
        env.push((VALUE_ENV.to_string(), value));
        run_checked(&format!("{} (teardown)", self.name), cmd, &env).await?;
        Ok(())
    }
}

fn command_fixture(name: &str, config: &FixtureConfig) -> Result<FixtureDescriptor> {
    let scope: Scope = config
        .scope
        .parse()
        .map_err(|e: String| CoopError::config(format!("fixture '{name}': {e}")))?;

    let command = Arc::new(CommandFixture {
        name: name.to_string(),
        after: config.after.clone(),
        setup: config.setup.clone(),
        teardown: config.teardown.clone(),
    });

    let descriptor = if config.teardown.is_some() {
        FixtureDescriptor::async_generator(name, move |args| {
            let command = command.clone();
            async move {
                let (value, env) = command.setup(args).await?;
                let teardown = {
                    let command = command.clone();
                    let value = value.clone();
                    async move { command.teardown(env, value).await }
                };
                Ok::<_, anyhow::Error>((fixture_value(value), teardown))
            }
        })
    } else {
        FixtureDescriptor::coroutine(name, move |args| {
            let command = command.clone();
            async move {
                let (value, _env) = command.setup(args).await?;
                Ok::<_, anyhow::Error>(fixture_value(value))
            }
        })
    };

    let mut descriptor = descriptor
        .scope(scope)
        .depends_on(config.after.iter().cloned().chain([REQUEST_ARG.to_string()]))
        .autouse(config.autouse);
    if let Some(params) = &config.params {
        descriptor = descriptor.params(params.iter().cloned().map(fixture_value).collect());
    }
    if let Some(module) = &config.module {
        descriptor = descriptor.in_module(module.clone());
    }
    Ok(descriptor)
}

fn command_task(id: &str, config: &TaskConfig) -> TaskDescriptor {
    let label = id.to_string();
    let cmd = config.cmd.clone();
    let names = config.fixtures.clone();
    let body = TaskBody::from_async(move |args| {
        let label = label.clone();
        let cmd = cmd.clone();
        let env: Vec<(String, String)> = names
            .iter()
            .zip(&args)
            .filter_map(|(name, value)| {
                downcast::<String>(value).map(|v| (fixture_env_var(name), v.clone()))
            })
            .collect();
        async move {
            run_checked(&label, &cmd, &env).await?;
            Ok(())
        }
    });

    let mut task = TaskDescriptor::new(id, body)
        .with_args(config.fixtures.iter().cloned())
        .with_tags(config.tags.iter().cloned());
    if let Some(module) = &config.module {
        task = task.in_module(module.clone());
    }
    if config.flakey {
        task = task.flakey();
    }
    if !config.timeout {
        task = task.without_deadline();
    }
    if !config.cooperative {
        task = task.deferred();
    }
    if let Some(reason) = &config.skip {
        task = task.skip(reason.clone());
    }
    task
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Shape;

    fn build(src: &str) -> Result<Suite> {
        build_suite(&toml::from_str(src).unwrap())
    }

    #[test]
    fn teardown_command_selects_async_generator_shape() {
        let suite = build(
            r#"
            [fixture.db]
            scope = "session"
            setup = "echo db"
            teardown = "echo bye"

            [fixture.tmp]
            setup = "echo tmp"

            [task.t]
            cmd = "true"
            fixtures = ["db", "tmp"]
            "#,
        )
        .unwrap();

        let db = suite.registry.get("db").unwrap();
        assert_eq!(db.shape(), Shape::AsyncGenerator);
        assert_eq!(db.get_scope(), Scope::Session);
        assert_eq!(db.dependencies(), ["request".to_string()]);
        assert_eq!(suite.registry.get("tmp").unwrap().shape(), Shape::Coroutine);
    }

    #[test]
    fn params_expand_tasks_that_reach_the_fixture() {
        let suite = build(
            r#"
            [fixture.backend]
            setup = "echo $COOP_PARAM"
            params = ["sqlite", "postgres"]

            [fixture.conn]
            setup = "echo conn"
            after = ["backend"]

            [task.reaches]
            cmd = "true"
            fixtures = ["conn"]

            [task.plain]
            cmd = "true"
            "#,
        )
        .unwrap();

        let ids: Vec<_> = suite.tasks.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, ["plain", "reaches[0]", "reaches[1]"]);
    }

    #[test]
    fn task_flags_map_onto_the_descriptor() {
        let suite = build(
            r#"
            [task.t]
            cmd = "true"
            module = "db_tests"
            tags = ["db", "slow"]
            flakey = true
            timeout = false
            cooperative = false
            skip = "not today"
            "#,
        )
        .unwrap();

        let task = &suite.tasks[0];
        assert_eq!(task.module, "db_tests");
        assert!(task.tags.contains("slow"));
        assert!(task.retry_eligible);
        assert!(!task.deadline_eligible);
        assert!(!task.cooperative);
        assert_eq!(task.skip.as_deref(), Some("not today"));
    }

    #[test]
    fn scope_mismatch_is_a_config_error() {
        let err = build(
            r#"
            [fixture.narrow]
            setup = "echo n"

            [fixture.wide]
            scope = "session"
            setup = "echo w"
            after = ["narrow"]

            [task.t]
            cmd = "true"
            fixtures = ["wide"]
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, CoopError::ConfigError(msg) if msg.contains("ScopeMismatch")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn commands_see_fixture_values_in_the_environment() {
        use crate::exec::runner::TaskRunner;
        use crate::fixture::resolver::FixtureResolver;

        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("teardown.txt");
        let suite = build(&format!(
            r#"
            [fixture.db]
            setup = "echo db-$COOP_PARAM"
            teardown = "echo \"$COOP_VALUE\" > {marker}"
            params = ["one"]

            [task.t]
            cmd = "test \"$COOP_FIXTURE_DB\" = db-one"
            fixtures = ["db"]
            "#,
            marker = marker.display()
        ))
        .unwrap();

        let runner = TaskRunner::new(Arc::new(FixtureResolver::new(suite.registry.clone())));
        let task = suite.tasks.into_iter().next().unwrap();
        assert_eq!(task.id, "t[0]");
        let outcome = runner.run(Arc::new(task)).await;

        assert!(outcome.is_passed(), "{:?}", outcome.error);
        let written = std::fs::read_to_string(&marker).unwrap();
        assert_eq!(written.trim(), "db-one");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn autouse_fixtures_run_but_are_not_exported() {
        use crate::exec::runner::TaskRunner;
        use crate::fixture::resolver::FixtureResolver;

        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("autouse.txt");
        let suite = build(&format!(
            r#"
            [fixture.env]
            setup = "echo ran > {marker}; echo ambient"
            autouse = true

            [fixture.db]
            setup = "echo db"

            [task.t]
            cmd = "test -z \"${{COOP_FIXTURE_ENV:-}}\" && test \"$COOP_FIXTURE_DB\" = db"
            fixtures = ["db"]
            "#,
            marker = marker.display()
        ))
        .unwrap();

        let runner = TaskRunner::new(Arc::new(FixtureResolver::new(suite.registry.clone())));
        let task = suite.tasks.into_iter().next().unwrap();
        let outcome = runner.run(Arc::new(task)).await;

        assert!(outcome.is_passed(), "{:?}", outcome.error);
        assert_eq!(std::fs::read_to_string(&marker).unwrap().trim(), "ran");
    }
}
