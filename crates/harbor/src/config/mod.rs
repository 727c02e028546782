//! Configuration loading.
//!
//! # Pipeline
//! 1. Parse the file (YAML or JSON) into an untyped [`ConfigNode`] tree.
//! 2. Merge dotted-path overrides from the environment and command line.
//! 3. Bind the tree to the service's typed configuration through the
//!    `config` crate (see [`source`]).
//! 4. Validate, collecting every violation.
//!
//! Any failure aborts startup before a server is assembled.

pub mod factory;
pub mod node;
pub mod overlay;
pub mod schema;
pub mod source;
pub mod validation;

pub use factory::{ConfigError, ConfigurationFactory};
pub use node::{ConfigNode, Mapping, Scalar};
pub use overlay::{OverrideEntry, OverrideError};
pub use schema::{
    BaseConfiguration, Configuration, ConnectorConfig, LogFormat, LoggingConfig, ServerConfig,
};
pub use validation::Validate;
