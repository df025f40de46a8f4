// src/config/loader.rs

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

use crate::config::model::SuiteFile;
use crate::config::validate::validate_suite;

/// Read and deserialize a suite file without semantic validation.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<SuiteFile> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)
        .with_context(|| format!("reading suite file at {:?}", path))?;

    let suite: SuiteFile = toml::from_str(&contents)
        .with_context(|| format!("parsing TOML suite from {:?}", path))?;

    Ok(suite)
}

/// Load a suite file and run [`validate_suite`] on it.
pub fn load_and_validate(path: impl AsRef<Path>) -> Result<SuiteFile> {
    let path = path.as_ref();
    let suite = load_from_path(path)?;
    validate_suite(&suite).with_context(|| format!("validating suite {:?}", path))?;
    Ok(suite)
}

/// Suite file read when `--suite` is not given, relative to the working
/// directory.
pub const DEFAULT_SUITE_FILE: &str = "coopsched.toml";
