//! Turns listener definitions and the two handlers into managed resources.
//!
//! # Assembly
//! 1. Build the shared worker pool (registered first, stopped last).
//! 2. Resolve every configured connector to a listener identity and factory.
//! 3. Bind application listeners to the application handler and admin
//!    listeners to the admin handler.
//! 4. Wrap the dispatcher: compression, instrumentation, request log.
//! 5. Register the dispatch chain, then every listener.

use std::sync::Arc;

use opentelemetry::metrics::Meter;
use thiserror::Error;
use tracing::info;

use super::chain::DispatchChain;
use super::connector::{ConnectorFactory, ConnectorRegistry};
use super::dispatcher::{BindingError, BindingTable, Handler, ListenerId, Role, RoutingDispatcher};
use super::instrumentation::RequestMetrics;
use super::listener::Listener;
use super::pipeline::PipelineBuilder;
use crate::config::{ConnectorConfig, ServerConfig};
use crate::lifecycle::{ExecutorError, LifecycleError, LifecycleRegistry, ManagedExecutor, QueuePolicy};

/// Name template of the shared worker threads.
pub const WORKER_NAME_FORMAT: &str = "harbor-worker-%d";

#[derive(Debug, Error)]
pub enum AssemblyError {
    #[error("{listener}: unknown connector type {kind:?} (known: {known})")]
    UnknownConnector {
        listener: String,
        kind: String,
        known: String,
    },

    #[error("{listener}: port {port} is out of range")]
    InvalidPort { listener: String, port: u32 },

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error(transparent)]
    Binding(#[from] BindingError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

/// Handles to everything assembly registered.
#[derive(Debug)]
pub struct AssembledServer {
    executor: Arc<ManagedExecutor>,
    chain: Arc<DispatchChain>,
    listeners: Vec<Arc<Listener>>,
}

impl AssembledServer {
    pub fn executor(&self) -> &Arc<ManagedExecutor> {
        &self.executor
    }

    pub fn chain(&self) -> &Arc<DispatchChain> {
        &self.chain
    }

    pub fn listeners(&self) -> &[Arc<Listener>] {
        &self.listeners
    }

    /// The listener configured at `index` within `role`'s connector list.
    pub fn listener(&self, role: Role, index: usize) -> Option<&Arc<Listener>> {
        self.listeners
            .iter()
            .find(|l| l.id().role == role && l.id().index == index)
    }
}

/// Assemble the server described by `config` and register it with
/// `lifecycle`. Nothing is started.
///
/// # Errors
///
/// See [`AssemblyError`]. A failure may leave the worker pool registered;
/// stopping the registry releases it.
pub fn assemble(
    config: &ServerConfig,
    connectors: &ConnectorRegistry,
    meter: &Meter,
    application: Handler,
    admin: Handler,
    lifecycle: &mut LifecycleRegistry,
) -> Result<AssembledServer, AssemblyError> {
    // 1. Shared worker pool
    let queue = match config.max_queued_requests {
        Some(capacity) => QueuePolicy::Bounded(capacity),
        None => QueuePolicy::Unbounded,
    };
    let executor = lifecycle
        .executor_service(WORKER_NAME_FORMAT)
        .core_threads(config.min_threads)
        .max_threads(config.max_threads)
        .keep_alive(config.idle_thread_timeout())
        .queue(queue)
        .shutdown_grace(config.shutdown_grace_period())
        .build()?;

    // 2. Listener identities
    let mut resolved = Vec::new();
    for (role, definitions) in [
        (Role::Application, &config.application_connectors),
        (Role::Admin, &config.admin_connectors),
    ] {
        for (index, definition) in definitions.iter().enumerate() {
            resolved.push(resolve(role, index, definition, connectors)?);
        }
    }

    // 3. Bindings
    let mut table = BindingTable::builder();
    for (id, _) in &resolved {
        let handler = match id.role {
            Role::Application => application.clone(),
            Role::Admin => admin.clone(),
        };
        table.bind(id.clone(), handler)?;
    }
    let dispatcher = RoutingDispatcher::new(table.build());

    // 4. Wrappers
    let pipeline = PipelineBuilder::new(dispatcher, RequestMetrics::new(meter))
        .gzip(config.gzip.enabled)
        .request_log(config.request_log.enabled);

    // 5. Registration
    let chain = Arc::new(DispatchChain::new(
        pipeline,
        Arc::clone(&executor),
        config.shutdown_grace_period(),
    ));
    lifecycle.register(chain.clone())?;

    let mut listeners = Vec::with_capacity(resolved.len());
    for (id, factory) in resolved {
        let listener = Arc::new(Listener::new(
            id,
            factory,
            Arc::clone(&chain),
            Arc::clone(&executor),
        ));
        lifecycle.register(listener.clone())?;
        listeners.push(listener);
    }

    info!(
        application = config.application_connectors.len(),
        admin = config.admin_connectors.len(),
        gzip = config.gzip.enabled,
        request_log = config.request_log.enabled,
        "server assembled"
    );
    Ok(AssembledServer {
        executor,
        chain,
        listeners,
    })
}

fn resolve(
    role: Role,
    index: usize,
    definition: &ConnectorConfig,
    connectors: &ConnectorRegistry,
) -> Result<(ListenerId, Arc<dyn ConnectorFactory>), AssemblyError> {
    let label = format!("{role}-{index}");
    let port = u16::try_from(definition.port).map_err(|_| AssemblyError::InvalidPort {
        listener: label.clone(),
        port: definition.port,
    })?;
    let factory = connectors
        .resolve(&definition.kind)
        .ok_or_else(|| AssemblyError::UnknownConnector {
            listener: label,
            kind: definition.kind.clone(),
            known: connectors.transports().join(", "),
        })?;
    let id = ListenerId {
        role,
        index,
        transport: definition.kind.as_str().into(),
        host: definition.host().into(),
        port,
    };
    Ok((id, factory))
}
