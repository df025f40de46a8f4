// src/config/mod.rs

//! Suite-file configuration.
//!
//! Responsibilities:
//! - Define the TOML-backed data model (`model.rs`).
//! - Parse group-limit declarations shared with the CLI (`limits.rs`).
//! - Load a suite file from disk (`loader.rs`).
//! - Validate references and scheduler settings (`validate.rs`).

pub mod limits;
pub mod loader;
pub mod model;
pub mod validate;

pub use limits::{GroupDecl, GroupLimits};
pub use loader::{load_and_validate, load_from_path, DEFAULT_SUITE_FILE};
pub use model::{FixtureConfig, SchedulerSection, SuiteFile, TaskConfig};
pub use validate::validate_suite;
