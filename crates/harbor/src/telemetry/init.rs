//! Subscriber and OTEL pipeline initialisation.

use anyhow::{Context, Result};
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{runtime, Resource};
use tracing_subscriber::{layer::SubscriberExt, reload, util::SubscriberInitExt, EnvFilter};

use crate::admin::FilterHandle;
use crate::config::{LogFormat, LoggingConfig};

/// Initialise the global tracing subscriber and, when an OTLP endpoint is
/// configured, the OTEL trace and metric pipelines.
///
/// Configures:
/// - A reloadable [`EnvFilter`]. `RUST_LOG` wins over `logging.level` and
///   `logging.loggers`.
/// - A JSON or plain-text [`tracing_subscriber::fmt`] layer per
///   `logging.format`.
/// - A [`tracing_opentelemetry`] layer exporting spans to `logging.otlp_endpoint`.
/// - A global OTLP meter provider, so [`opentelemetry::global::meter`]
///   instruments are exported too.
///
/// Returns the handle the `log-level` task uses to change the filter.
///
/// # Errors
///
/// Returns an error if the OTLP pipelines cannot be installed or a global
/// subscriber is already set.
pub fn init_telemetry(service_name: &str, logging: &LoggingConfig) -> Result<FilterHandle> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(logging.directives()))
        .context("invalid log filter")?;
    let (filter, handle) = reload::Layer::new(env_filter);

    let json = (logging.format == LogFormat::Json).then(|| tracing_subscriber::fmt::layer().json());
    let text = (logging.format == LogFormat::Text).then(tracing_subscriber::fmt::layer);

    let otel = match &logging.otlp_endpoint {
        Some(endpoint) => {
            install_meter_provider(service_name, endpoint)?;
            Some(tracing_opentelemetry::layer().with_tracer(build_tracer(service_name, endpoint)?))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(text)
        .with(otel)
        .try_init()
        .context("failed to initialise tracing subscriber")?;

    Ok(handle)
}

/// Flush and shut down the OTEL trace pipeline.
pub fn shutdown_telemetry() {
    opentelemetry::global::shutdown_tracer_provider();
}

fn build_tracer(service_name: &str, endpoint: &str) -> Result<opentelemetry_sdk::trace::Tracer> {
    opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint),
        )
        .with_trace_config(
            opentelemetry_sdk::trace::Config::default().with_resource(service_resource(service_name)),
        )
        .install_batch(runtime::Tokio)
        .context("failed to install OTLP tracing pipeline")
}

fn install_meter_provider(service_name: &str, endpoint: &str) -> Result<()> {
    let provider = opentelemetry_otlp::new_pipeline()
        .metrics(runtime::Tokio)
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint),
        )
        .with_resource(service_resource(service_name))
        .build()
        .context("failed to install OTLP metrics pipeline")?;
    opentelemetry::global::set_meter_provider(provider);
    Ok(())
}

fn service_resource(service_name: &str) -> Resource {
    Resource::new(vec![
        KeyValue::new(
            opentelemetry_semantic_conventions::resource::SERVICE_NAME,
            service_name.to_owned(),
        ),
        KeyValue::new(
            opentelemetry_semantic_conventions::resource::SERVICE_VERSION,
            env!("CARGO_PKG_VERSION"),
        ),
    ])
}
