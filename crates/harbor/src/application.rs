//! The contract a service implements, and what it can customise before its
//! configuration is loaded.

use async_trait::async_trait;

use crate::config::{Configuration, ConfigurationFactory};
use crate::environment::Environment;
use crate::server::ConnectorRegistry;

/// A service built on harbor.
///
/// [`crate::runner::run`] calls `initialize` once, loads `C`, then calls
/// `run` to let the service register routes, managed resources, tasks and
/// health checks. The server is assembled and started after `run` returns.
#[async_trait]
pub trait Application<C: Configuration>: Send + Sync {
    /// Service name, used for the OTEL resource and the environment.
    fn name(&self) -> &str;

    /// Customise connector types or configuration loading.
    fn initialize(&self, _bootstrap: &mut Bootstrap<C>) {}

    /// # Errors
    ///
    /// Any error aborts startup before the server is assembled.
    async fn run(&self, configuration: &C, environment: &mut Environment) -> anyhow::Result<()>;
}

/// Pre-configuration state: the connector types available to the assembler
/// and how configuration is loaded.
#[derive(Debug)]
pub struct Bootstrap<C> {
    connectors: ConnectorRegistry,
    configuration: ConfigurationFactory<C>,
}

impl<C: Configuration> Default for Bootstrap<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Configuration> Bootstrap<C> {
    /// Built-in connectors and the default configuration factory.
    pub fn new() -> Self {
        Self {
            connectors: ConnectorRegistry::with_defaults(),
            configuration: ConfigurationFactory::new(),
        }
    }

    pub fn connectors(&self) -> &ConnectorRegistry {
        &self.connectors
    }

    pub fn connectors_mut(&mut self) -> &mut ConnectorRegistry {
        &mut self.connectors
    }

    pub fn configuration_factory(&self) -> &ConfigurationFactory<C> {
        &self.configuration
    }

    pub fn set_configuration_factory(&mut self, factory: ConfigurationFactory<C>) {
        self.configuration = factory;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BaseConfiguration;
    use crate::server::H2cConnectorFactory;
    use std::sync::Arc;

    #[test]
    fn bootstrap_starts_with_builtin_connectors() {
        let mut bootstrap = Bootstrap::<BaseConfiguration>::new();
        assert_eq!(bootstrap.connectors().transports(), ["h2c", "http"]);

        bootstrap
            .connectors_mut()
            .register("grpc", Arc::new(H2cConnectorFactory));
        assert_eq!(bootstrap.connectors().transports(), ["grpc", "h2c", "http"]);

        bootstrap.set_configuration_factory(ConfigurationFactory::new().with_prefix("svc."));
        assert_eq!(bootstrap.configuration_factory().prefix(), "svc.");
    }
}
