//! Logging and OpenTelemetry setup.
//!
//! Structured logs go to stdout as JSON (or plain text for local runs).
//! Spans and request metrics are exported over OTLP/gRPC when
//! `logging.otlp_endpoint` is configured.

pub mod init;

pub use init::{init_telemetry, shutdown_telemetry};
