//! [`ConfigNode`]: the untyped configuration tree.
//!
//! A configuration file is parsed into this tree first. Overrides are merged
//! into it (see [`super::overlay`]) and only then is it bound to a typed
//! configuration struct (see [`super::source`]).

use std::fmt;

use serde::de::{self, Deserialize, Deserializer, MapAccess, SeqAccess, Visitor};

/// A leaf value.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Null => f.write_str("null"),
            Scalar::Bool(b) => write!(f, "{b}"),
            Scalar::Integer(i) => write!(f, "{i}"),
            Scalar::Float(x) => write!(f, "{x}"),
            Scalar::String(s) => f.write_str(s),
        }
    }
}

/// A recursive configuration value.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigNode {
    Scalar(Scalar),
    Sequence(Vec<ConfigNode>),
    Mapping(Mapping),
}

impl ConfigNode {
    /// An empty mapping, the root of a configuration with no file.
    pub fn empty_mapping() -> Self {
        ConfigNode::Mapping(Mapping::new())
    }

    /// A string scalar.
    pub fn string(value: impl Into<String>) -> Self {
        ConfigNode::Scalar(Scalar::String(value.into()))
    }

    /// Short description of the variant, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            ConfigNode::Scalar(_) => "scalar",
            ConfigNode::Sequence(_) => "sequence",
            ConfigNode::Mapping(_) => "mapping",
        }
    }

    /// Returns the string value if this node is a string scalar.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ConfigNode::Scalar(Scalar::String(s)) => Some(s),
            _ => None,
        }
    }

    pub fn as_mapping(&self) -> Option<&Mapping> {
        match self {
            ConfigNode::Mapping(m) => Some(m),
            _ => None,
        }
    }

    /// Follows a dotted path through nested mappings.
    pub fn get_path(&self, path: &str) -> Option<&ConfigNode> {
        path.split('.')
            .try_fold(self, |node, key| node.as_mapping()?.get(key))
    }
}

/// An insertion-ordered mapping with unique keys.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Mapping {
    entries: Vec<(String, ConfigNode)>,
}

impl Mapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&ConfigNode> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut ConfigNode> {
        self.entries
            .iter_mut()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// Inserts `value` under `key`, replacing (in place) and returning any
    /// previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: ConfigNode) -> Option<ConfigNode> {
        let key = key.into();
        match self.get_mut(&key) {
            Some(slot) => Some(std::mem::replace(slot, value)),
            None => {
                self.entries.push((key, value));
                None
            }
        }
    }

    /// Returns the child under `key`, inserting an empty mapping first if the
    /// key is absent.
    pub fn child_or_insert_mapping(&mut self, key: &str) -> &mut ConfigNode {
        let index = match self.entries.iter().position(|(k, _)| k == key) {
            Some(index) => index,
            None => {
                self.entries
                    .push((key.to_owned(), ConfigNode::empty_mapping()));
                self.entries.len() - 1
            }
        };
        &mut self.entries[index].1
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn entries(&self) -> &[(String, ConfigNode)] {
        &self.entries
    }
}

// ---------------------------------------------------------------------------
// Parsing: any self-describing format (YAML, JSON) → ConfigNode
// ---------------------------------------------------------------------------

impl<'de> Deserialize<'de> for ConfigNode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(NodeVisitor)
    }
}

struct NodeVisitor;

impl<'de> Visitor<'de> for NodeVisitor {
    type Value = ConfigNode;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a configuration value")
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> Result<ConfigNode, E> {
        Ok(ConfigNode::Scalar(Scalar::Bool(v)))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<ConfigNode, E> {
        Ok(ConfigNode::Scalar(Scalar::Integer(v)))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<ConfigNode, E> {
        Ok(match i64::try_from(v) {
            Ok(i) => ConfigNode::Scalar(Scalar::Integer(i)),
            Err(_) => ConfigNode::string(v.to_string()),
        })
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<ConfigNode, E> {
        Ok(ConfigNode::Scalar(Scalar::Float(v)))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<ConfigNode, E> {
        Ok(ConfigNode::string(v))
    }

    fn visit_string<E: de::Error>(self, v: String) -> Result<ConfigNode, E> {
        Ok(ConfigNode::string(v))
    }

    fn visit_unit<E: de::Error>(self) -> Result<ConfigNode, E> {
        Ok(ConfigNode::Scalar(Scalar::Null))
    }

    fn visit_none<E: de::Error>(self) -> Result<ConfigNode, E> {
        Ok(ConfigNode::Scalar(Scalar::Null))
    }

    fn visit_some<D: Deserializer<'de>>(self, deserializer: D) -> Result<ConfigNode, D::Error> {
        ConfigNode::deserialize(deserializer)
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<ConfigNode, A::Error> {
        let mut items = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some(item) = seq.next_element()? {
            items.push(item);
        }
        Ok(ConfigNode::Sequence(items))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<ConfigNode, A::Error> {
        let mut mapping = Mapping::new();
        // Later duplicates replace earlier ones so keys stay unique.
        while let Some((key, value)) = map.next_entry::<String, ConfigNode>()? {
            mapping.insert(key, value);
        }
        Ok(ConfigNode::Mapping(mapping))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nested_yaml_in_order() {
        let node: ConfigNode = serde_yaml::from_str(
            "server:\n  port: 8080\n  gzip: true\nlogging:\n  level: info\n",
        )
        .unwrap();
        let root = node.as_mapping().unwrap();
        assert_eq!(root.keys().collect::<Vec<_>>(), vec!["server", "logging"]);
        assert_eq!(
            node.get_path("server.port"),
            Some(&ConfigNode::Scalar(Scalar::Integer(8080)))
        );
        assert_eq!(
            node.get_path("server.gzip"),
            Some(&ConfigNode::Scalar(Scalar::Bool(true)))
        );
        assert_eq!(node.get_path("logging.level").and_then(ConfigNode::as_str), Some("info"));
    }

    #[test]
    fn parses_json_sequences() {
        let node: ConfigNode =
            serde_json::from_str(r#"{"connectors":[{"port":1},{"port":2}],"name":null}"#).unwrap();
        match node.get_path("connectors") {
            Some(ConfigNode::Sequence(items)) => assert_eq!(items.len(), 2),
            other => panic!("expected sequence, got {other:?}"),
        }
        assert_eq!(node.get_path("name"), Some(&ConfigNode::Scalar(Scalar::Null)));
    }

    #[test]
    fn insert_replaces_in_place() {
        let mut m = Mapping::new();
        m.insert("a", ConfigNode::string("1"));
        m.insert("b", ConfigNode::string("2"));
        let previous = m.insert("a", ConfigNode::string("3"));
        assert_eq!(previous, Some(ConfigNode::string("1")));
        assert_eq!(m.keys().collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(m.get("a"), Some(&ConfigNode::string("3")));
    }

    #[test]
    fn get_path_stops_at_scalars() {
        let node: ConfigNode = serde_json::from_str(r#"{"a":{"b":"x"}}"#).unwrap();
        assert!(node.get_path("a.b.c").is_none());
        assert!(node.get_path("missing").is_none());
    }
}
