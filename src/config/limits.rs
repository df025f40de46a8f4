// src/config/limits.rs

//! Per-group concurrency ceilings, as declared on the CLI or in the suite file.
//!
//! A declaration names one or more comma-joined tags and a ceiling. All tags
//! of one declaration share a single counter:
//!
//! ```text
//! db,network=2 slow=1
//! ```

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use crate::errors::{CoopError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupDecl {
    pub tags: Vec<String>,
    pub ceiling: usize,
}

impl fmt::Display for GroupDecl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.tags.join(","), self.ceiling)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupLimits {
    decls: Vec<GroupDecl>,
}

impl GroupLimits {
    /// Parse the whitespace-separated `tags=N` form.
    pub fn parse(spec: &str) -> Result<Self> {
        let mut limits = Self::default();
        for item in spec.split_whitespace() {
            let mut parts = item.split('=');
            let (Some(tags), Some(ceiling), None) = (parts.next(), parts.next(), parts.next())
            else {
                return Err(CoopError::config(format!(
                    "group limit '{item}' must have exactly one '=' (e.g. \"db,network=2\")"
                )));
            };
            let ceiling: usize = ceiling.trim().parse().map_err(|_| {
                CoopError::config(format!(
                    "group limit '{item}' has a non-integer ceiling '{ceiling}'"
                ))
            })?;
            limits.declare(tags, ceiling)?;
        }
        Ok(limits)
    }

    /// Build from a `"tags" = N` table.
    pub fn from_table(table: &BTreeMap<String, usize>) -> Result<Self> {
        let mut limits = Self::default();
        for (tags, ceiling) in table {
            limits.declare(tags, *ceiling)?;
        }
        Ok(limits)
    }

    /// Add one declaration of comma-joined `tags`.
    pub fn declare(&mut self, tags: &str, ceiling: usize) -> Result<()> {
        if ceiling == 0 {
            return Err(CoopError::config(format!(
                "group limit for '{tags}' must be at least 1"
            )));
        }

        let tags: Vec<String> = tags
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect();
        if tags.is_empty() {
            return Err(CoopError::config("group limit declares no tags"));
        }

        let mut seen: HashSet<&str> = self
            .decls
            .iter()
            .flat_map(|d| d.tags.iter().map(String::as_str))
            .collect();
        for tag in &tags {
            if !seen.insert(tag.as_str()) {
                return Err(CoopError::config(format!(
                    "tag '{tag}' appears in more than one group limit"
                )));
            }
        }

        self.decls.push(GroupDecl { tags, ceiling });
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = &GroupDecl> {
        self.decls.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.decls.is_empty()
    }

    pub fn len(&self) -> usize {
        self.decls.len()
    }
}

impl fmt::Display for GroupLimits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.decls.iter().map(ToString::to_string).collect();
        f.write_str(&parts.join(" "))
    }
}
