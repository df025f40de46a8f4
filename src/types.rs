// src/types.rs

//! Small shared enums used across fixtures, config and the engine.

use std::fmt;
use std::str::FromStr;

/// Fixture lifetime class.
///
/// Ordered from narrowest to widest so that scope-mismatch checks can be
/// written as comparisons: a fixture may only depend on fixtures whose scope
/// is at least as wide as its own.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Scope {
    /// Built once per task, torn down when that task finishes.
    #[default]
    Function,
    /// Built once per module, shared by every task of the module.
    Module,
    /// Built once per run, shared by every task.
    Session,
}

impl Scope {
    /// Module and session fixtures live in the shared cache.
    pub fn is_shared(self) -> bool {
        !matches!(self, Scope::Function)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Scope::Function => "function",
            Scope::Module => "module",
            Scope::Session => "session",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "function" => Ok(Scope::Function),
            "module" => Ok(Scope::Module),
            "session" => Ok(Scope::Session),
            other => Err(format!(
                "{other} scope not supported (expected \"function\", \"module\" or \"session\")"
            )),
        }
    }
}

/// Structural kind of a fixture's builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Shape {
    /// Synchronous builder returning a value, no teardown.
    Value,
    /// Synchronous builder returning a value and a synchronous teardown.
    Generator,
    /// Asynchronous builder returning a value, no teardown.
    Coroutine,
    /// Asynchronous builder returning a value and an asynchronous teardown.
    AsyncGenerator,
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Shape::Value => "value",
            Shape::Generator => "generator",
            Shape::Coroutine => "coroutine",
            Shape::AsyncGenerator => "async-generator",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_parses_case_insensitively() {
        assert_eq!("Session".parse::<Scope>().unwrap(), Scope::Session);
        assert_eq!(" module ".parse::<Scope>().unwrap(), Scope::Module);
    }

    #[test]
    fn unknown_scope_is_rejected() {
        let err = "package".parse::<Scope>().unwrap_err();
        assert!(err.contains("package scope not supported"));
    }

    #[test]
    fn scopes_order_from_narrow_to_wide() {
        assert!(Scope::Function < Scope::Module);
        assert!(Scope::Module < Scope::Session);
    }
}
