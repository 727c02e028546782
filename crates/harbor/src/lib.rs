//! `harbor`: bootstrap core for HTTP services.
//!
//! A service implements [`Application`] for its configuration type and hands
//! itself to [`runner::run`]. harbor loads and validates the configuration,
//! sets up logging and OTEL export, lets the service register routes and
//! managed resources, then assembles application and admin listeners behind
//! a role-routed dispatcher and drives startup and shutdown through one
//! [`LifecycleRegistry`].

pub mod admin;
pub mod application;
pub mod cli;
pub mod config;
pub mod environment;
pub mod lifecycle;
pub mod runner;
pub mod server;
pub mod telemetry;

pub use application::{Application, Bootstrap};
pub use environment::Environment;
pub use lifecycle::{LifecycleRegistry, Managed};
pub use runner::run;
