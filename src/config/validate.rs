// src/config/validate.rs

use std::collections::HashSet;

use crate::config::model::SuiteFile;
use crate::errors::{CoopError, Result};
use crate::fixture::descriptor::REQUEST_ARG;
use crate::types::Scope;

/// Semantic checks that need only the parsed file.
///
/// This checks:
/// - there is at least one task
/// - the `[scheduler]` section converts to a valid scheduler config
/// - every fixture scope names a known scope
/// - every `after` and `fixtures` entry names a declared fixture
/// - parameter lists are not empty
///
/// The fixture graph itself (cycles, scope mismatches) is checked when the
/// registry is built.
pub fn validate_suite(suite: &SuiteFile) -> Result<()> {
    ensure_has_tasks(suite)?;
    suite.scheduler.to_scheduler_config()?;
    validate_fixtures(suite)?;
    validate_task_references(suite)?;
    Ok(())
}

fn ensure_has_tasks(suite: &SuiteFile) -> Result<()> {
    if suite.task.is_empty() {
        return Err(CoopError::config(
            "suite must contain at least one [task.<name>] section",
        ));
    }
    Ok(())
}

fn validate_fixtures(suite: &SuiteFile) -> Result<()> {
    for (name, fixture) in &suite.fixture {
        if name == REQUEST_ARG {
            return Err(CoopError::config(format!(
                "'{REQUEST_ARG}' is reserved and cannot be declared as a fixture"
            )));
        }
        fixture.scope.parse::<Scope>().map_err(|e| {
            CoopError::config(format!("fixture '{name}': {e}"))
        })?;
        for dep in &fixture.after {
            if dep == name {
                return Err(CoopError::config(format!(
                    "fixture '{name}' cannot depend on itself in `after`"
                )));
            }
            if !suite.fixture.contains_key(dep) {
                return Err(CoopError::config(format!(
                    "fixture '{name}' has unknown dependency '{dep}' in `after`"
                )));
            }
        }
        if fixture.params.as_ref().is_some_and(Vec::is_empty) {
            return Err(CoopError::config(format!(
                "fixture '{name}' declares an empty `params` list"
            )));
        }
    }
    Ok(())
}

fn validate_task_references(suite: &SuiteFile) -> Result<()> {
    for (id, task) in &suite.task {
        let mut seen = HashSet::new();
        for fixture in &task.fixtures {
            if !suite.fixture.contains_key(fixture) {
                return Err(CoopError::config(format!(
                    "task '{id}' requests unknown fixture '{fixture}'"
                )));
            }
            if !seen.insert(fixture.as_str()) {
                return Err(CoopError::config(format!(
                    "task '{id}' lists fixture '{fixture}' more than once"
                )));
            }
        }
    }
    Ok(())
}
