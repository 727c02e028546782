//! Listeners, role-based dispatch and server assembly.
//!
//! # Responsibilities
//! - Bind one accept loop per configured connector (application or admin).
//! - Route each request to exactly the handler bound to its listener.
//! - Wrap dispatch with compression, instrumentation and request logging.
//! - Register the worker pool, dispatch chain and listeners for lifecycle
//!   management.

pub mod assembler;
pub mod chain;
pub mod connector;
pub mod dispatcher;
pub mod instrumentation;
pub mod listener;
pub mod pipeline;
pub mod request_log;

pub use assembler::{assemble, AssembledServer, AssemblyError};
pub use connector::{ConnectorFactory, ConnectorRegistry, H2cConnectorFactory, HttpConnectorFactory};
pub use dispatcher::{Handler, ListenerId, Role, RoutingDispatcher};
