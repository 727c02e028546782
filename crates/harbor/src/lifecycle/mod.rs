//! Deterministic startup and shutdown.
//!
//! Everything that holds resources (worker pools, listeners, the dispatch
//! chain, components added by the service) implements [`Managed`] and is
//! registered with one [`LifecycleRegistry`]. Registration order is the start
//! order; stop runs in exact reverse.

pub mod executor;
pub mod managed;
pub mod registry;
pub mod state;

pub use executor::{ExecutorBuilder, ExecutorError, ManagedExecutor, QueuePolicy};
pub use managed::Managed;
pub use registry::{LifecycleError, LifecycleEvent, LifecycleRegistry};
pub use state::LifecycleState;
