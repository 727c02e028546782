//! [`ConfigurationFactory`]: file → tree → overrides → typed value → validation.

use std::marker::PhantomData;
use std::path::Path;

use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;

use super::node::{ConfigNode, Scalar};
use super::overlay::{self, OverrideEntry, OverrideError, DEFAULT_PREFIX};
use super::source::bind;
use super::validation::Validate;

/// Source name used when no configuration file is given.
pub const DEFAULT_SOURCE: &str = "the default configuration";

/// Errors produced while loading configuration. Every variant names the
/// source it came from.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{source_name} could not be read: {source}")]
    Io {
        source_name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{source_name} has an error:\n  * Malformed {format}: {message}")]
    Parse {
        source_name: String,
        format: &'static str,
        message: String,
    },

    #[error("{source_name} has an error:\n  * {source}")]
    Override {
        source_name: String,
        #[source]
        source: OverrideError,
    },

    #[error("{source_name} has an error:\n  * {source}")]
    Bind {
        source_name: String,
        #[source]
        source: ::config::ConfigError,
    },

    #[error("{source_name} has the following errors:\n  * {}", violations.join("\n  * "))]
    Validation {
        source_name: String,
        violations: Vec<String>,
    },
}

/// Loads a configuration of type `C`.
///
/// Environment overrides (variables starting with the prefix, `harbor.` by
/// default) are sorted by path and merged first. Caller-supplied overrides
/// are merged after them in the order given.
pub struct ConfigurationFactory<C> {
    prefix: String,
    read_environment: bool,
    _config: PhantomData<fn() -> C>,
}

impl<C> Default for ConfigurationFactory<C> {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_owned(),
            read_environment: true,
            _config: PhantomData,
        }
    }
}

impl<C> std::fmt::Debug for ConfigurationFactory<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigurationFactory")
            .field("prefix", &self.prefix)
            .field("read_environment", &self.read_environment)
            .finish()
    }
}

impl<C: DeserializeOwned + Validate> ConfigurationFactory<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `prefix` instead of `harbor.` to select environment overrides.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Ignore the process environment.
    pub fn without_environment(mut self) -> Self {
        self.read_environment = false;
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Load `path`. `.yaml` and `.yml` files are parsed as YAML, anything
    /// else as JSON.
    ///
    /// # Errors
    ///
    /// See [`ConfigError`]. The error names `path`.
    pub fn build_from_file(&self, path: &Path, extra: &[OverrideEntry]) -> Result<C, ConfigError> {
        let source_name = path.display().to_string();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            source_name: source_name.clone(),
            source,
        })?;
        let tree = parse_tree(path, &text, &source_name)?;
        self.build(tree, &source_name, extra)
    }

    /// Build from defaults and overrides alone.
    ///
    /// # Errors
    ///
    /// See [`ConfigError`].
    pub fn build_default(&self, extra: &[OverrideEntry]) -> Result<C, ConfigError> {
        self.build(ConfigNode::empty_mapping(), DEFAULT_SOURCE, extra)
    }

    /// Merge overrides into `tree`, bind and validate it.
    ///
    /// # Errors
    ///
    /// See [`ConfigError`].
    pub fn build(
        &self,
        mut tree: ConfigNode,
        source_name: &str,
        extra: &[OverrideEntry],
    ) -> Result<C, ConfigError> {
        let environment = if self.read_environment {
            overlay::from_env(&self.prefix)
        } else {
            Vec::new()
        };
        debug!(
            source = source_name,
            environment = environment.len(),
            command_line = extra.len(),
            "applying configuration overrides"
        );

        overlay::merge(&mut tree, environment.iter().chain(extra)).map_err(|source| {
            ConfigError::Override {
                source_name: source_name.to_owned(),
                source,
            }
        })?;

        let config: C = bind(&tree).map_err(|source| ConfigError::Bind {
            source_name: source_name.to_owned(),
            source,
        })?;

        let violations = config.validate();
        if !violations.is_empty() {
            return Err(ConfigError::Validation {
                source_name: source_name.to_owned(),
                violations,
            });
        }
        Ok(config)
    }
}

fn parse_tree(path: &Path, text: &str, source_name: &str) -> Result<ConfigNode, ConfigError> {
    let is_yaml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml"));

    let parsed = if is_yaml {
        serde_yaml::from_str::<ConfigNode>(text).map_err(|e| ("YAML", e.to_string()))
    } else {
        serde_json::from_str::<ConfigNode>(text).map_err(|e| ("JSON", e.to_string()))
    };
    let format = if is_yaml { "YAML" } else { "JSON" };

    match parsed {
        // An empty document has no root at all.
        Ok(ConfigNode::Scalar(Scalar::Null)) => Ok(ConfigNode::empty_mapping()),
        Ok(node @ ConfigNode::Mapping(_)) => Ok(node),
        Ok(other) => Err(ConfigError::Parse {
            source_name: source_name.to_owned(),
            format,
            message: format!("the document root is a {}, not a mapping", other.kind()),
        }),
        Err((format, message)) => Err(ConfigError::Parse {
            source_name: source_name.to_owned(),
            format,
            message,
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::config::schema::{BaseConfiguration, LogFormat};

    fn factory() -> ConfigurationFactory<BaseConfiguration> {
        ConfigurationFactory::new().without_environment()
    }

    fn file(suffix: &str, contents: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        f
    }

    #[test]
    fn loads_yaml_with_overrides() {
        let f = file(".yml", "logging:\n  level: info\nserver:\n  gzip:\n    enabled: true\n");
        let cfg = factory()
            .build_from_file(
                f.path(),
                &[
                    OverrideEntry::new("server.gzip.enabled", "false"),
                    OverrideEntry::new("logging.format", "text"),
                ],
            )
            .unwrap();
        assert!(!cfg.server.gzip.enabled);
        assert_eq!(cfg.logging.format, LogFormat::Text);
    }

    #[test]
    fn loads_json_by_extension() {
        let f = file(".json", r#"{"server": {"min_threads": 2, "max_threads": 4}}"#);
        let cfg = factory().build_from_file(f.path(), &[]).unwrap();
        assert_eq!(cfg.server.min_threads, 2);
        assert_eq!(cfg.server.max_threads, 4);
    }

    #[test]
    fn empty_file_is_all_defaults() {
        let f = file(".yaml", "");
        let cfg = factory().build_from_file(f.path(), &[]).unwrap();
        assert_eq!(cfg.logging.level, "info");
    }

    #[test]
    fn overrides_can_add_absent_fields() {
        let cfg = factory()
            .build_default(&[OverrideEntry::new("server.max_queued_requests", "16")])
            .unwrap();
        assert_eq!(cfg.server.max_queued_requests, Some(16));
    }

    #[test]
    fn errors_name_the_source() {
        let f = file(".yaml", "server:\n  min_threads: many\n");
        let err = factory().build_from_file(f.path(), &[]).unwrap_err();
        let rendered = err.to_string();
        assert!(matches!(err, ConfigError::Bind { .. }));
        assert!(rendered.starts_with(&format!("{} has an error:", f.path().display())));
        assert!(rendered.contains("server.min_threads"), "{rendered}");
    }

    #[test]
    fn override_conflict_is_reported() {
        let f = file(".yaml", "logging:\n  level: info\n");
        let err = factory()
            .build_from_file(f.path(), &[OverrideEntry::new("logging.level.x", "debug")])
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Override {
                source: OverrideError::NotAMapping { .. },
                ..
            }
        ));
    }

    #[test]
    fn validation_lists_every_violation() {
        let err = factory()
            .build_default(&[
                OverrideEntry::new("server.min_threads", "0"),
                OverrideEntry::new("logging.level", "chatty"),
            ])
            .unwrap_err();
        match err {
            ConfigError::Validation { source_name, violations } => {
                assert_eq!(source_name, DEFAULT_SOURCE);
                assert_eq!(violations.len(), 2);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn unknown_fields_fail() {
        let err = factory()
            .build_default(&[OverrideEntry::new("server.colour", "blue")])
            .unwrap_err();
        assert!(err.to_string().contains("unknown field `colour`"), "{err}");
    }

    #[test]
    fn rejects_non_mapping_root() {
        let f = file(".json", "[1, 2]");
        let err = factory().build_from_file(f.path(), &[]).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { format: "JSON", .. }));
    }

    #[test]
    fn reads_prefixed_environment() {
        // Unique prefix so parallel tests do not observe this variable.
        std::env::set_var("harbor-factory-test.logging.level", "trace");
        let cfg: BaseConfiguration = ConfigurationFactory::new()
            .with_prefix("harbor-factory-test.")
            .build_default(&[])
            .unwrap();
        std::env::remove_var("harbor-factory-test.logging.level");
        assert_eq!(cfg.logging.level, "trace");
    }
}
