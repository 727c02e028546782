//! [`DispatchChain`]: owns every open connection.
//!
//! Listeners hand accepted streams to the chain, which serves them on the
//! shared worker pool. Stopping the chain asks every connection to finish
//! its in-flight requests and waits for them up to the grace period.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::connector::ConnectorFactory;
use super::dispatcher::ListenerId;
use super::pipeline::{ConnectionService, PipelineBuilder};
use crate::lifecycle::{ExecutorError, Managed, ManagedExecutor};

pub struct DispatchChain {
    pipeline: PipelineBuilder,
    executor: Arc<ManagedExecutor>,
    connections: TaskTracker,
    shutdown: Mutex<CancellationToken>,
    accepting: AtomicBool,
    grace: Duration,
}

impl std::fmt::Debug for DispatchChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchChain")
            .field("open_connections", &self.connections.len())
            .field("accepting", &self.accepting.load(Ordering::Relaxed))
            .finish()
    }
}

impl DispatchChain {
    pub fn new(pipeline: PipelineBuilder, executor: Arc<ManagedExecutor>, grace: Duration) -> Self {
        Self {
            pipeline,
            executor,
            connections: TaskTracker::new(),
            shutdown: Mutex::new(CancellationToken::new()),
            accepting: AtomicBool::new(false),
            grace,
        }
    }

    pub fn open_connections(&self) -> usize {
        self.connections.len()
    }

    /// Serve `stream`, accepted on `listener`, on the worker pool.
    ///
    /// Connections do not count against the pool's queue; their requests do.
    ///
    /// # Errors
    ///
    /// [`ExecutorError::Shutdown`] if the chain or the pool is not running.
    /// The stream is dropped (closed).
    pub fn accept(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        listener: &ListenerId,
        factory: Arc<dyn ConnectorFactory>,
    ) -> Result<(), ExecutorError> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(ExecutorError::Shutdown {
                name: "dispatch chain".into(),
            });
        }
        let service = ConnectionService::new(
            listener.clone(),
            self.pipeline.build(),
            Arc::clone(&self.executor),
        );
        let shutdown = self.shutdown.lock().clone();
        let listener = listener.clone();
        let connection = self.connections.track_future(async move {
            debug!(%listener, %peer, "connection opened");
            if let Err(e) = factory.serve(stream, service, shutdown).await {
                debug!(%listener, %peer, error = %format!("{e:#}"), "connection closed with error");
            }
        });
        self.executor.spawn_unmetered(connection).map(drop)
    }
}

#[async_trait]
impl Managed for DispatchChain {
    fn name(&self) -> String {
        "dispatch-chain".to_owned()
    }

    async fn start(&self) -> anyhow::Result<()> {
        self.connections.reopen();
        *self.shutdown.lock() = CancellationToken::new();
        self.accepting.store(true, Ordering::Release);
        for (listener, handler) in self.pipeline.dispatcher().bindings().iter() {
            info!(%listener, handler = handler.name(), "bound listener");
        }
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.accepting.store(false, Ordering::Release);
        self.connections.close();
        self.shutdown.lock().cancel();

        let open = self.connections.len();
        if open > 0 {
            info!(open, grace_ms = self.grace.as_millis() as u64, "draining connections");
        }
        if tokio::time::timeout(self.grace, self.connections.wait())
            .await
            .is_err()
        {
            let remaining = self.connections.len();
            warn!(remaining, "connections still open after the grace period");
            bail!("{remaining} connection(s) still open after {:?}", self.grace);
        }
        Ok(())
    }
}
