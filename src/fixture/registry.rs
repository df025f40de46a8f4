// src/fixture/registry.rs

//! Name -> descriptor lookup, graph validation and parameter expansion.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;
use tracing::debug;

use crate::errors::{CoopError, Result};
use crate::exec::task::TaskDescriptor;
use crate::fixture::descriptor::{FixtureDescriptor, REQUEST_ARG};

#[derive(Debug, Default, Clone)]
pub struct FixtureRegistry {
    fixtures: BTreeMap<String, Arc<FixtureDescriptor>>,
}

impl FixtureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build and validate a registry in one go.
    pub fn from_fixtures<I>(fixtures: I) -> Result<Self>
    where
        I: IntoIterator<Item = FixtureDescriptor>,
    {
        let mut registry = Self::new();
        for fixture in fixtures {
            registry.register(fixture)?;
        }
        registry.validate()?;
        Ok(registry)
    }

    pub fn register(&mut self, fixture: FixtureDescriptor) -> Result<()> {
        let name = fixture.name().to_string();
        if name == REQUEST_ARG {
            return Err(CoopError::config(format!(
                "'{REQUEST_ARG}' is reserved and cannot be used as a fixture name"
            )));
        }
        if self.fixtures.contains_key(&name) {
            return Err(CoopError::config(format!(
                "fixture '{name}' is defined more than once"
            )));
        }
        if fixture.get_params().is_some_and(<[_]>::is_empty) {
            return Err(CoopError::config(format!(
                "fixture '{name}' declares an empty params list"
            )));
        }
        self.fixtures.insert(name, Arc::new(fixture));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<FixtureDescriptor>> {
        self.fixtures.get(name)
    }

    pub fn len(&self) -> usize {
        self.fixtures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fixtures.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<FixtureDescriptor>> {
        self.fixtures.values()
    }

    /// Check the fixture graph: known dependencies, no cycles, and no fixture
    /// depending on a narrower-scoped one.
    pub fn validate(&self) -> Result<()> {
        self.validate_dependencies_exist()?;
        self.validate_acyclic()?;
        self.validate_scopes()?;
        Ok(())
    }

    fn validate_dependencies_exist(&self) -> Result<()> {
        for fixture in self.fixtures.values() {
            for dep in fixture.dependencies() {
                if dep == REQUEST_ARG {
                    continue;
                }
                if dep == fixture.name() {
                    return Err(CoopError::config(format!(
                        "fixture '{}' cannot depend on itself",
                        fixture.name()
                    )));
                }
                if !self.fixtures.contains_key(dep) {
                    return Err(CoopError::config(format!(
                        "fixture '{}' depends on unknown fixture '{dep}'",
                        fixture.name()
                    )));
                }
            }
        }
        Ok(())
    }

    fn validate_acyclic(&self) -> Result<()> {
        let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
        for fixture in self.fixtures.values() {
            graph.add_node(fixture.name());
            for dep in fixture.dependencies() {
                if dep != REQUEST_ARG {
                    graph.add_edge(dep.as_str(), fixture.name(), ());
                }
            }
        }

        match toposort(&graph, None) {
            Ok(_) => Ok(()),
            Err(cycle) => Err(CoopError::config(format!(
                "Fixture dependency graph has a cycle involving '{}'",
                cycle.node_id()
            ))),
        }
    }

    fn validate_scopes(&self) -> Result<()> {
        for fixture in self.fixtures.values() {
            for dep in fixture.dependencies() {
                let Some(dep_fixture) = self.fixtures.get(dep) else {
                    continue;
                };
                if dep_fixture.get_scope() < fixture.get_scope() {
                    return Err(CoopError::config(format!(
                        "ScopeMismatch: {}-scoped fixture '{}' depends on {}-scoped fixture '{}'",
                        fixture.get_scope(),
                        fixture.name(),
                        dep_fixture.get_scope(),
                        dep_fixture.name()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Names a task pulls in directly: its declared arguments, then every
    /// applicable autouse fixture it did not already declare.
    pub fn requested_names(&self, task: &TaskDescriptor) -> Vec<String> {
        let mut names = task.arg_names.clone();
        for fixture in self.fixtures.values() {
            if fixture.applies_to_module(&task.module)
                && !names.iter().any(|n| n == fixture.name())
            {
                names.push(fixture.name().to_string());
            }
        }
        names
    }

    /// Every fixture the task transitively needs, dependencies before
    /// dependents. Names bound by direct call arguments, the `request`
    /// pseudo-fixture and unknown names are left out.
    pub fn closure(&self, task: &TaskDescriptor) -> Vec<Arc<FixtureDescriptor>> {
        let mut seen = HashSet::new();
        let mut order = Vec::new();
        for name in self.requested_names(task) {
            self.visit(task, &name, &mut seen, &mut order);
        }
        order
    }

    fn visit(
        &self,
        task: &TaskDescriptor,
        name: &str,
        seen: &mut HashSet<String>,
        order: &mut Vec<Arc<FixtureDescriptor>>,
    ) {
        if name == REQUEST_ARG
            || task.direct_args.contains_key(name)
            || !seen.insert(name.to_string())
        {
            return;
        }
        let Some(fixture) = self.fixtures.get(name) else {
            return;
        };
        for dep in fixture.dependencies() {
            self.visit(task, dep, seen, order);
        }
        order.push(fixture.clone());
    }

    /// Expand each task into one instance per combination of the params of
    /// the parameterized fixtures it needs.
    ///
    /// Instances are named `id[i]` for one parameterized fixture and
    /// `id[i-j]` for several, indices following fixture closure order.
    pub fn parametrize_tasks(&self, tasks: Vec<TaskDescriptor>) -> Vec<TaskDescriptor> {
        let mut expanded = Vec::with_capacity(tasks.len());
        for task in tasks {
            let axes: Vec<(String, usize)> = self
                .closure(&task)
                .iter()
                .filter(|f| !task.fixture_params.contains_key(f.name()))
                .filter_map(|f| f.get_params().map(|p| (f.name().to_string(), p.len())))
                .collect();

            if axes.is_empty() {
                expanded.push(task);
                continue;
            }

            let combos = cartesian(&axes);
            debug!(task = %task.id, instances = combos.len(), "parametrizing task");
            for combo in combos {
                let mut instance = task.clone();
                let suffix = combo
                    .iter()
                    .map(|i| i.to_string())
                    .collect::<Vec<_>>()
                    .join("-");
                instance.id = format!("{}[{suffix}]", task.id);
                for ((name, _), idx) in axes.iter().zip(combo) {
                    instance.fixture_params.insert(name.clone(), idx);
                }
                expanded.push(instance);
            }
        }
        expanded
    }
}

/// All index combinations for the given (name, len) axes, first axis slowest.
fn cartesian(axes: &[(String, usize)]) -> Vec<Vec<usize>> {
    let mut combos: Vec<Vec<usize>> = vec![Vec::new()];
    for (_, len) in axes {
        combos = combos
            .into_iter()
            .flat_map(|prefix| {
                (0..*len).map(move |i| {
                    let mut next = prefix.clone();
                    next.push(i);
                    next
                })
            })
            .collect();
    }
    combos
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::task::TaskBody;
    use crate::fixture::descriptor::fixture_value;
    use crate::types::Scope;

    fn unit(name: &str) -> FixtureDescriptor {
        FixtureDescriptor::value(name, |_| Ok(fixture_value(())))
    }

    fn noop_task(id: &str, args: &[&str]) -> TaskDescriptor {
        TaskDescriptor::new(id, TaskBody::from_async(|_| async { Ok(()) }))
            .with_args(args.iter().copied())
    }

    #[test]
    fn detects_cycles() {
        let err = FixtureRegistry::from_fixtures([
            unit("a").depends_on(["b"]),
            unit("b").depends_on(["a"]),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("cycle"), "{err}");
    }

    #[test]
    fn detects_scope_mismatch() {
        let err = FixtureRegistry::from_fixtures([
            unit("per_task"),
            unit("shared").scope(Scope::Session).depends_on(["per_task"]),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("ScopeMismatch"), "{err}");
    }

    #[test]
    fn rejects_unknown_dependency_and_duplicates() {
        let err = FixtureRegistry::from_fixtures([unit("a").depends_on(["ghost"])]).unwrap_err();
        assert!(err.to_string().contains("unknown fixture 'ghost'"));

        let err = FixtureRegistry::from_fixtures([unit("a"), unit("a")]).unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn closure_is_post_order_and_deduplicated() {
        let registry = FixtureRegistry::from_fixtures([
            unit("base"),
            unit("left").depends_on(["base"]),
            unit("right").depends_on(["base", "request"]),
        ])
        .unwrap();
        let task = noop_task("t", &["left", "right"]);

        let names: Vec<_> = registry
            .closure(&task)
            .iter()
            .map(|f| f.name().to_string())
            .collect();
        assert_eq!(names, ["base", "left", "right"]);
    }

    #[test]
    fn autouse_respects_module() {
        let registry = FixtureRegistry::from_fixtures([
            unit("everywhere").autouse(true),
            unit("db_only").autouse(true).in_module("db"),
        ])
        .unwrap();

        let in_db = noop_task("db::t", &[]).in_module("db");
        let elsewhere = noop_task("web::t", &[]).in_module("web");

        assert_eq!(registry.requested_names(&in_db), ["db_only", "everywhere"]);
        assert_eq!(registry.requested_names(&elsewhere), ["everywhere"]);
    }

    #[test]
    fn parametrize_expands_cartesian_product() {
        let registry = FixtureRegistry::from_fixtures([
            unit("size").params(vec![fixture_value(1), fixture_value(2)]),
            unit("mode").params(vec![
                fixture_value("a"),
                fixture_value("b"),
                fixture_value("c"),
            ]),
        ])
        .unwrap();

        let tasks = registry.parametrize_tasks(vec![
            noop_task("t", &["size", "mode"]),
            noop_task("plain", &[]),
        ]);
        let ids: Vec<_> = tasks.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(
            ids,
            ["t[0-0]", "t[0-1]", "t[0-2]", "t[1-0]", "t[1-1]", "t[1-2]", "plain"]
        );
        assert_eq!(tasks[4].fixture_params.get("size"), Some(&1));
        assert_eq!(tasks[4].fixture_params.get("mode"), Some(&1));
    }
}
