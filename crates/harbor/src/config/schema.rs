//! Typed configuration shared by every harbor service.
//!
//! A service's own configuration type embeds [`ServerConfig`] and
//! [`LoggingConfig`] and implements [`Configuration`] to expose them.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::level_filters::LevelFilter;

use super::validation::{self, join, Validate};

/// Contract between a service's configuration type and the framework.
pub trait Configuration: DeserializeOwned + Validate + Send + Sync + 'static {
    fn server(&self) -> &ServerConfig;
    fn logging(&self) -> &LoggingConfig;
}

/// Configuration for a service with no settings of its own.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BaseConfiguration {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Validate for BaseConfiguration {
    fn validate_at(&self, path: &str, violations: &mut Vec<String>) {
        self.server.validate_at(&join(path, "server"), violations);
        self.logging.validate_at(&join(path, "logging"), violations);
    }
}

impl Configuration for BaseConfiguration {
    fn server(&self) -> &ServerConfig {
        &self.server
    }

    fn logging(&self) -> &LoggingConfig {
        &self.logging
    }
}

// ---------------------------------------------------------------------------
// server
// ---------------------------------------------------------------------------

/// Listeners, worker pool sizing and the request wrappers.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Listeners bound to the application handler.
    #[serde(default = "default_application_connectors")]
    pub application_connectors: Vec<ConnectorConfig>,

    /// Listeners bound to the admin handler.
    #[serde(default = "default_admin_connectors")]
    pub admin_connectors: Vec<ConnectorConfig>,

    /// Core worker threads of the shared server pool.
    #[serde(default = "default_min_threads")]
    pub min_threads: usize,

    /// Upper bound on threads running blocking work. The pool holds at most
    /// `min_threads + max_threads` threads.
    #[serde(default = "default_max_threads")]
    pub max_threads: usize,

    /// Maximum number of requests in flight across all listeners. Requests
    /// beyond it are answered with 503. Unbounded when absent.
    #[serde(default)]
    pub max_queued_requests: Option<usize>,

    /// How long an idle blocking thread is kept alive.
    #[serde(default = "default_idle_thread_timeout")]
    pub idle_thread_timeout_secs: u64,

    /// How long shutdown waits for open connections and queued tasks.
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,

    #[serde(default)]
    pub gzip: GzipConfig,

    #[serde(default)]
    pub request_log: RequestLogConfig,
}

fn default_application_connectors() -> Vec<ConnectorConfig> {
    vec![ConnectorConfig::http(8080)]
}
fn default_admin_connectors() -> Vec<ConnectorConfig> {
    vec![ConnectorConfig::http(8081)]
}
fn default_min_threads() -> usize {
    8
}
fn default_max_threads() -> usize {
    1024
}
fn default_idle_thread_timeout() -> u64 {
    60
}
fn default_shutdown_grace_period() -> u64 {
    30
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            application_connectors: default_application_connectors(),
            admin_connectors: default_admin_connectors(),
            min_threads: default_min_threads(),
            max_threads: default_max_threads(),
            max_queued_requests: None,
            idle_thread_timeout_secs: default_idle_thread_timeout(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
            gzip: GzipConfig::default(),
            request_log: RequestLogConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn idle_thread_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_thread_timeout_secs)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }
}

impl Validate for ServerConfig {
    fn validate_at(&self, path: &str, violations: &mut Vec<String>) {
        validation::at_least(&join(path, "min_threads"), self.min_threads, 1, violations);
        validation::at_least(&join(path, "max_threads"), self.max_threads, 1, violations);
        if self.max_threads < self.min_threads {
            violations.push(format!(
                "{} must be greater than or equal to {} (was {} < {})",
                join(path, "max_threads"),
                join(path, "min_threads"),
                self.max_threads,
                self.min_threads
            ));
        }
        if let Some(queued) = self.max_queued_requests {
            validation::at_least(&join(path, "max_queued_requests"), queued, 1, violations);
        }

        let groups = [
            ("application_connectors", &self.application_connectors),
            ("admin_connectors", &self.admin_connectors),
        ];
        let mut seen = BTreeSet::new();
        for (field, connectors) in groups {
            for (index, connector) in connectors.iter().enumerate() {
                let at = format!("{}[{index}]", join(path, field));
                connector.validate_at(&at, violations);
                if connector.port != 0 && !seen.insert((connector.host().to_owned(), connector.port))
                {
                    violations.push(format!(
                        "{at} reuses address {}:{} already bound by another connector",
                        connector.host(),
                        connector.port
                    ));
                }
            }
        }
    }
}

/// One listener definition.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectorConfig {
    /// Transport tag resolved through the connector registry.
    #[serde(rename = "type", default = "default_connector_type")]
    pub kind: String,

    /// Interface to bind. All interfaces when absent.
    #[serde(default)]
    pub bind_host: Option<String>,

    /// `0` binds an ephemeral port.
    pub port: u32,
}

fn default_connector_type() -> String {
    "http".into()
}

impl ConnectorConfig {
    pub fn http(port: u32) -> Self {
        Self {
            kind: default_connector_type(),
            bind_host: None,
            port,
        }
    }

    pub fn host(&self) -> &str {
        self.bind_host.as_deref().unwrap_or("0.0.0.0")
    }
}

impl Validate for ConnectorConfig {
    fn validate_at(&self, path: &str, violations: &mut Vec<String>) {
        validation::not_empty(&join(path, "type"), &self.kind, violations);
        validation::port_range(&join(path, "port"), self.port, 1, u16::MAX.into(), violations);
        if let Some(host) = &self.bind_host {
            validation::not_empty(&join(path, "bind_host"), host, violations);
        }
    }
}

/// Response compression.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GzipConfig {
    #[serde(default = "enabled")]
    pub enabled: bool,
}

impl Default for GzipConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Per-request access logging.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequestLogConfig {
    #[serde(default = "enabled")]
    pub enabled: bool,
}

impl Default for RequestLogConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

fn enabled() -> bool {
    true
}

// ---------------------------------------------------------------------------
// logging
// ---------------------------------------------------------------------------

/// Output format of the log subscriber.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Text,
}

/// Log filter and exporter settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Default level for every target.
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,

    /// Per-target levels, e.g. `hyper: warn`.
    #[serde(default)]
    pub loggers: BTreeMap<String, String>,

    /// OTLP/gRPC endpoint for span export. Spans stay local when absent.
    #[serde(default)]
    pub otlp_endpoint: Option<String>,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            loggers: BTreeMap::new(),
            otlp_endpoint: None,
        }
    }
}

impl LoggingConfig {
    /// Filter directives in `EnvFilter` syntax: the default level followed
    /// by one `target=level` per logger.
    pub fn directives(&self) -> String {
        std::iter::once(self.level.clone())
            .chain(
                self.loggers
                    .iter()
                    .map(|(target, level)| format!("{target}={level}")),
            )
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl Validate for LoggingConfig {
    fn validate_at(&self, path: &str, violations: &mut Vec<String>) {
        check_level(&join(path, "level"), &self.level, violations);
        for (target, level) in &self.loggers {
            check_level(&join(&join(path, "loggers"), target), level, violations);
        }
        if let Some(endpoint) = &self.otlp_endpoint {
            validation::not_empty(&join(path, "otlp_endpoint"), endpoint, violations);
        }
    }
}

fn check_level(path: &str, level: &str, violations: &mut Vec<String>) {
    if level.parse::<LevelFilter>().is_err() {
        violations.push(format!(
            "{path} must be one of off, error, warn, info, debug, trace (was {level})"
        ));
    }
}
