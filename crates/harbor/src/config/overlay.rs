//! Dotted-path overrides merged into a [`ConfigNode`] tree before binding.
//!
//! Overrides come from two sources: environment variables carrying a fixed
//! prefix (`harbor.server.gzip.enabled=false`) and `-D key=value` flags on the
//! command line. Every value is merged as a string scalar; typed binding
//! coerces it later.

use std::ffi::OsString;

use ::config::{Environment, Map, Source};
use thiserror::Error;
use tracing::warn;

use super::node::{ConfigNode, Mapping};

/// Prefix marking an environment variable as a configuration override.
pub const DEFAULT_PREFIX: &str = "harbor.";

/// One `(dotted.path, value)` override.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverrideEntry {
    pub path: String,
    pub value: String,
}

impl OverrideEntry {
    pub fn new(path: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            value: value.into(),
        }
    }
}

/// Errors produced while parsing or applying overrides.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum OverrideError {
    /// A non-final segment of the path resolved to a scalar or sequence.
    #[error("Unable to override {path}; it's not a valid path ({segment} is a {found}, not a mapping)")]
    NotAMapping {
        path: String,
        segment: String,
        found: &'static str,
    },

    /// The path is empty or contains an empty segment.
    #[error("Unable to override {path:?}; it's not a valid path")]
    InvalidPath { path: String },

    /// A command-line override without `=`.
    #[error("override {0:?} must have the form key=value")]
    MalformedAssignment(String),
}

/// Apply `entries` to `tree` in order. Later entries win on collision.
///
/// # Errors
///
/// Stops at the first entry that cannot be applied. The tree keeps every
/// entry applied before it and is unchanged by the failing one.
pub fn merge<'a, I>(tree: &mut ConfigNode, entries: I) -> Result<(), OverrideError>
where
    I: IntoIterator<Item = &'a OverrideEntry>,
{
    for entry in entries {
        apply(tree, entry)?;
    }
    Ok(())
}

/// Apply a single override.
///
/// Missing intermediate mappings are created. A non-mapping on the way down
/// is an error and leaves `tree` untouched.
///
/// # Errors
///
/// [`OverrideError::InvalidPath`] for empty segments,
/// [`OverrideError::NotAMapping`] when descending through a scalar or
/// sequence.
pub fn apply(tree: &mut ConfigNode, entry: &OverrideEntry) -> Result<(), OverrideError> {
    let segments: Vec<&str> = entry.path.split('.').map(str::trim).collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Err(OverrideError::InvalidPath {
            path: entry.path.clone(),
        });
    }
    let Some((last, parents)) = segments.split_last() else {
        return Err(OverrideError::InvalidPath {
            path: entry.path.clone(),
        });
    };

    // Check the whole path before creating anything so a failure cannot
    // leave freshly inserted empty mappings behind.
    check_descent(tree, parents, &entry.path)?;

    let mut node = tree;
    for segment in parents {
        node = match node {
            ConfigNode::Mapping(mapping) => mapping.child_or_insert_mapping(segment),
            other => {
                return Err(not_a_mapping(&entry.path, segment, other));
            }
        };
    }
    match node {
        ConfigNode::Mapping(mapping) => {
            mapping.insert(*last, ConfigNode::string(entry.value.clone()));
            Ok(())
        }
        other => Err(not_a_mapping(&entry.path, last, other)),
    }
}

fn check_descent(tree: &ConfigNode, parents: &[&str], path: &str) -> Result<(), OverrideError> {
    let mut node = tree;
    let mut walked: Vec<&str> = Vec::with_capacity(parents.len());
    for segment in parents {
        let mapping: &Mapping = match node {
            ConfigNode::Mapping(mapping) => mapping,
            other => return Err(not_a_mapping(path, &walked.join("."), other)),
        };
        walked.push(segment);
        match mapping.get(segment) {
            Some(child) => node = child,
            None => return Ok(()),
        }
    }
    match node {
        ConfigNode::Mapping(_) => Ok(()),
        other => Err(not_a_mapping(path, &walked.join("."), other)),
    }
}

fn not_a_mapping(path: &str, segment: &str, found: &ConfigNode) -> OverrideError {
    OverrideError::NotAMapping {
        path: path.to_owned(),
        segment: if segment.is_empty() {
            "<root>".to_owned()
        } else {
            segment.to_owned()
        },
        found: found.kind(),
    }
}

/// Collect overrides from `vars` whose names start with `prefix`.
///
/// Names are matched and returned in lowercase, with the prefix stripped.
/// The result is sorted by path so the merge order does not depend on the
/// platform's environment ordering.
pub fn from_vars<I, K, V>(vars: I, prefix: &str) -> Vec<OverrideEntry>
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    let vars: Map<String, String> = vars
        .into_iter()
        .map(|(key, value)| (key.into(), value.into()))
        .collect();
    let environment = Environment::with_prefix(prefix)
        .prefix_separator("")
        .source(Some(vars));

    let collected = match environment.collect() {
        Ok(collected) => collected,
        Err(e) => {
            warn!(error = %e, "could not read environment overrides");
            return Vec::new();
        }
    };
    let mut entries: Vec<OverrideEntry> = collected
        .into_iter()
        .filter_map(|(path, value)| match value.into_string() {
            Ok(value) => Some(OverrideEntry::new(path, value)),
            Err(e) => {
                warn!(%path, error = %e, "skipping environment override");
                None
            }
        })
        .collect();
    entries.sort_by(|a, b| a.path.cmp(&b.path));
    entries
}

/// Overrides from the process environment. Variables that are not valid
/// UTF-8 are skipped.
pub fn from_env(prefix: &str) -> Vec<OverrideEntry> {
    let vars = std::env::vars_os().filter_map(|(k, v): (OsString, OsString)| {
        Some((k.into_string().ok()?, v.into_string().ok()?))
    });
    from_vars(vars, prefix)
}

/// Parse a `key=value` command-line override. The value may itself contain `=`.
///
/// # Errors
///
/// [`OverrideError::MalformedAssignment`] if there is no `=` or the key is
/// empty.
pub fn parse_assignment(raw: &str) -> Result<OverrideEntry, OverrideError> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => Ok(OverrideEntry::new(key.trim(), value)),
        _ => Err(OverrideError::MalformedAssignment(raw.to_owned())),
    }
}
