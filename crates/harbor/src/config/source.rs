//! Typed binding through the `config` crate.
//!
//! The merged [`ConfigNode`] tree is handed to [`::config::Config`] as a
//! [`Source`] and deserialized from there. Override values arrive as
//! strings; the crate coerces them into numbers and booleans wherever the
//! target type asks for one, and type errors name the offending key.

use ::config::{Config, ConfigError, Map, Source, Value, ValueKind};
use serde::de::DeserializeOwned;

use super::node::{ConfigNode, Mapping, Scalar};

/// A merged configuration tree exposed as a `config` source.
#[derive(Debug, Clone)]
pub struct TreeSource {
    root: Mapping,
}

impl TreeSource {
    /// Wrap `tree`. A root that is not a mapping yields no keys.
    pub fn new(tree: &ConfigNode) -> Self {
        Self {
            root: tree.as_mapping().cloned().unwrap_or_default(),
        }
    }
}

impl Source for TreeSource {
    fn clone_into_box(&self) -> Box<dyn Source + Send + Sync> {
        Box::new(self.clone())
    }

    fn collect(&self) -> Result<Map<String, Value>, ConfigError> {
        Ok(table(&self.root))
    }
}

fn table(mapping: &Mapping) -> Map<String, Value> {
    mapping
        .entries()
        .iter()
        .map(|(key, node)| (key.clone(), value(node)))
        .collect()
}

fn value(node: &ConfigNode) -> Value {
    let kind = match node {
        ConfigNode::Scalar(Scalar::Null) => ValueKind::Nil,
        ConfigNode::Scalar(Scalar::Bool(b)) => ValueKind::Boolean(*b),
        ConfigNode::Scalar(Scalar::Integer(i)) => ValueKind::I64(*i),
        ConfigNode::Scalar(Scalar::Float(f)) => ValueKind::Float(*f),
        ConfigNode::Scalar(Scalar::String(s)) => ValueKind::String(s.clone()),
        ConfigNode::Sequence(items) => ValueKind::Array(items.iter().map(value).collect()),
        ConfigNode::Mapping(mapping) => ValueKind::Table(table(mapping)),
    };
    Value::new(None, kind)
}

/// Bind `tree` to `C`.
///
/// # Errors
///
/// A value that cannot be converted to its field's type, a missing required
/// field, or an unknown field where `C` denies them.
pub fn bind<C: DeserializeOwned>(tree: &ConfigNode) -> Result<C, ConfigError> {
    Config::builder()
        .add_source(TreeSource::new(tree))
        .build()?
        .try_deserialize()
}
