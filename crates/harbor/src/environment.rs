//! What a service builds against while it runs: routes, managed resources,
//! admin tasks and health checks.

use std::sync::Arc;

use axum::Router;
use opentelemetry::metrics::Meter;

use crate::admin::AdminEnvironment;
use crate::config::ServerConfig;
use crate::lifecycle::{LifecycleError, LifecycleRegistry, Managed};
use crate::server::{self, AssembledServer, AssemblyError, ConnectorRegistry, Handler};

/// Instrumentation scope for the request metrics.
pub const METER_NAME: &str = "harbor";

pub struct Environment {
    name: String,
    lifecycle: LifecycleRegistry,
    admin: AdminEnvironment,
    routes: Router,
    meter: Meter,
}

impl Environment {
    /// A fresh environment with the global meter provider's `harbor` meter.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_meter(name, opentelemetry::global::meter(METER_NAME))
    }

    pub fn with_meter(name: impl Into<String>, meter: Meter) -> Self {
        Self {
            name: name.into(),
            lifecycle: LifecycleRegistry::new(),
            admin: AdminEnvironment::new(),
            routes: Router::new(),
            meter,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lifecycle(&self) -> &LifecycleRegistry {
        &self.lifecycle
    }

    pub fn lifecycle_mut(&mut self) -> &mut LifecycleRegistry {
        &mut self.lifecycle
    }

    pub fn admin(&self) -> &AdminEnvironment {
        &self.admin
    }

    pub fn admin_mut(&mut self) -> &mut AdminEnvironment {
        &mut self.admin
    }

    pub fn meter(&self) -> &Meter {
        &self.meter
    }

    /// Merge `router` into the application routes.
    ///
    /// # Panics
    ///
    /// Panics when a path is routed twice, as [`Router::merge`] does.
    pub fn routes(&mut self, router: Router) {
        let routes = std::mem::replace(&mut self.routes, Router::new());
        self.routes = routes.merge(router);
    }

    /// Put `resource` under lifecycle management.
    ///
    /// # Errors
    ///
    /// See [`LifecycleRegistry::register`].
    pub fn manage(&mut self, resource: Arc<dyn Managed>) -> Result<(), LifecycleError> {
        self.lifecycle.register(resource)
    }

    /// The handler bound to every application listener.
    pub fn application_handler(&self) -> Handler {
        Handler::new("application", self.routes.clone())
    }

    /// Assemble the server and register it after everything the service
    /// registered itself, so the service's resources start first and stop
    /// last.
    ///
    /// # Errors
    ///
    /// See [`AssemblyError`].
    pub fn assemble(
        &mut self,
        config: &ServerConfig,
        connectors: &ConnectorRegistry,
    ) -> Result<AssembledServer, AssemblyError> {
        self.lifecycle.add_listener(self.admin.diagnostics());
        let application = self.application_handler();
        let admin = self.admin.handler();
        server::assemble(
            config,
            connectors,
            &self.meter,
            application,
            admin,
            &mut self.lifecycle,
        )
    }
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("name", &self.name)
            .field("managed", &self.lifecycle.managed_names())
            .field("admin", &self.admin)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum_test::TestServer;

    use super::*;
    use crate::config::ConnectorConfig;
    use crate::lifecycle::LifecycleState;
    use crate::server::Role;

    struct Cache;

    #[async_trait]
    impl Managed for Cache {
        fn name(&self) -> String {
            "cache".into()
        }

        async fn start(&self) -> anyhow::Result<()> {
            Ok(())
        }

        async fn stop(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn loopback() -> ConnectorConfig {
        ConnectorConfig {
            bind_host: Some("127.0.0.1".into()),
            ..ConnectorConfig::http(0)
        }
    }

    #[tokio::test]
    async fn merged_routes_form_the_application_handler() {
        let mut environment = Environment::new("test");
        environment.routes(Router::new().route("/a", get(|| async { "a" })));
        environment.routes(Router::new().route("/b", get(|| async { "b" })));

        let server = TestServer::new(environment.application_handler().router().clone()).unwrap();
        assert_eq!(server.get("/a").await.text(), "a");
        assert_eq!(server.get("/b").await.text(), "b");
        assert_eq!(server.get("/c").await.status_code(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn service_resources_start_before_the_server() {
        let mut environment = Environment::new("test");
        environment.manage(Arc::new(Cache)).unwrap();
        let config = ServerConfig {
            application_connectors: vec![loopback()],
            admin_connectors: vec![loopback()],
            min_threads: 1,
            max_threads: 2,
            ..ServerConfig::default()
        };

        let server = environment
            .assemble(&config, &ConnectorRegistry::with_defaults())
            .unwrap();
        assert_eq!(environment.lifecycle().managed_names()[0], "cache");
        assert!(server.listener(Role::Admin, 0).is_some());

        environment.lifecycle_mut().start().await.unwrap();
        assert_eq!(environment.lifecycle().state(), LifecycleState::Started);
        environment.lifecycle_mut().stop().await.unwrap();
        assert_eq!(environment.lifecycle().state(), LifecycleState::Stopped);
    }
}
