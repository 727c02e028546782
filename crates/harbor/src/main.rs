//! `harbor`: a greeting service demonstrating the framework.
//!
//! ```text
//! harbor server crates/harbor/hello.yml -D hello.default_name=Harbor
//! curl localhost:8080/hello?name=you
//! curl -X POST 'localhost:8081/tasks/log-level?level=debug'
//! ```

use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};

use harbor::admin::HealthCheck;
use harbor::config::validation::{join, not_empty, Validate};
use harbor::config::{Configuration, LoggingConfig, ServerConfig};
use harbor::{Application, Environment};

#[tokio::main]
async fn main() -> Result<()> {
    harbor::run(HelloApplication).await
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct HelloConfiguration {
    #[serde(default)]
    server: ServerConfig,
    #[serde(default)]
    logging: LoggingConfig,
    #[serde(default)]
    hello: HelloConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct HelloConfig {
    /// `%s` is replaced by the caller's name.
    #[serde(default = "default_template")]
    template: String,
    #[serde(default = "default_name")]
    default_name: String,
}

fn default_template() -> String {
    "Hello, %s!".into()
}

fn default_name() -> String {
    "Stranger".into()
}

impl Default for HelloConfig {
    fn default() -> Self {
        Self {
            template: default_template(),
            default_name: default_name(),
        }
    }
}

impl Validate for HelloConfiguration {
    fn validate_at(&self, path: &str, violations: &mut Vec<String>) {
        self.server.validate_at(&join(path, "server"), violations);
        self.logging.validate_at(&join(path, "logging"), violations);
        let hello = join(path, "hello");
        not_empty(&join(&hello, "template"), &self.hello.template, violations);
        not_empty(&join(&hello, "default_name"), &self.hello.default_name, violations);
    }
}

impl Configuration for HelloConfiguration {
    fn server(&self) -> &ServerConfig {
        &self.server
    }

    fn logging(&self) -> &LoggingConfig {
        &self.logging
    }
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

struct HelloApplication;

#[async_trait]
impl Application<HelloConfiguration> for HelloApplication {
    fn name(&self) -> &str {
        "hello"
    }

    async fn run(
        &self,
        configuration: &HelloConfiguration,
        environment: &mut Environment,
    ) -> Result<()> {
        let greeter = Arc::new(Greeter::from(&configuration.hello));
        environment
            .admin_mut()
            .register_health_check("template", Arc::new(TemplateHealthCheck(greeter.clone())));
        environment.routes(routes(greeter));
        Ok(())
    }
}

#[derive(Debug)]
struct Greeter {
    template: String,
    default_name: String,
}

impl From<&HelloConfig> for Greeter {
    fn from(config: &HelloConfig) -> Self {
        Self {
            template: config.template.clone(),
            default_name: config.default_name.clone(),
        }
    }
}

impl Greeter {
    fn greet(&self, name: Option<&str>) -> String {
        self.template
            .replace("%s", name.unwrap_or(&self.default_name))
    }
}

#[derive(Debug, Deserialize)]
struct HelloParams {
    name: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Saying {
    content: String,
}

fn routes(greeter: Arc<Greeter>) -> Router {
    Router::new().route("/hello", get(hello)).with_state(greeter)
}

async fn hello(State(greeter): State<Arc<Greeter>>, Query(params): Query<HelloParams>) -> Json<Saying> {
    Json(Saying {
        content: greeter.greet(params.name.as_deref()),
    })
}

/// Fails when the template renders without the caller's name.
struct TemplateHealthCheck(Arc<Greeter>);

#[async_trait]
impl HealthCheck for TemplateHealthCheck {
    async fn check(&self) -> Result<Option<String>> {
        let saying = self.0.greet(Some("TEST"));
        if !saying.contains("TEST") {
            bail!("template doesn't include a name");
        }
        Ok(None)
    }
}
