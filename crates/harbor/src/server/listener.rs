//! [`Listener`]: a managed accept loop for one configured connector.

use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::chain::DispatchChain;
use super::connector::ConnectorFactory;
use super::dispatcher::ListenerId;
use crate::lifecycle::{Managed, ManagedExecutor};

/// Pause after a failed `accept`, e.g. when the process is out of file
/// descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct Listener {
    id: ListenerId,
    factory: Arc<dyn ConnectorFactory>,
    chain: Arc<DispatchChain>,
    executor: Arc<ManagedExecutor>,
    running: Mutex<Option<Running>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("id", &self.id)
            .field("local_addr", &*self.local_addr.lock())
            .finish()
    }
}

impl Listener {
    pub fn new(
        id: ListenerId,
        factory: Arc<dyn ConnectorFactory>,
        chain: Arc<DispatchChain>,
        executor: Arc<ManagedExecutor>,
    ) -> Self {
        Self {
            id,
            factory,
            chain,
            executor,
            running: Mutex::new(None),
            local_addr: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &ListenerId {
        &self.id
    }

    /// Address actually bound, once started. Differs from the configured
    /// port when that port is `0`.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    fn bind(&self) -> anyhow::Result<TcpListener> {
        let std_listener = StdTcpListener::bind((&*self.id.host, self.id.port))
            .with_context(|| format!("failed to bind {}", self.id))?;
        std_listener.set_nonblocking(true)?;
        // Register with the pool's reactor, which will drive the accept loop.
        let _runtime = self.executor.handle().enter();
        Ok(TcpListener::from_std(std_listener)?)
    }
}

#[async_trait]
impl Managed for Listener {
    fn name(&self) -> String {
        self.id.to_string()
    }

    async fn start(&self) -> anyhow::Result<()> {
        if self.running.lock().is_some() {
            return Ok(());
        }
        let listener = self.bind()?;
        let local_addr = listener.local_addr()?;
        *self.local_addr.lock() = Some(local_addr);

        let cancel = CancellationToken::new();
        let task = self.executor.spawn_unmetered(accept_loop(
            listener,
            self.id.clone(),
            Arc::clone(&self.factory),
            Arc::clone(&self.chain),
            cancel.clone(),
        ))?;
        *self.running.lock() = Some(Running { cancel, task });
        info!(listener = %self.id, %local_addr, "listening");
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        let Some(running) = self.running.lock().take() else {
            return Ok(());
        };
        running.cancel.cancel();
        running
            .task
            .await
            .with_context(|| format!("accept loop of {} ended abnormally", self.id))?;
        info!(listener = %self.id, "stopped listening");
        Ok(())
    }
}

async fn accept_loop(
    listener: TcpListener,
    id: ListenerId,
    factory: Arc<dyn ConnectorFactory>,
    chain: Arc<DispatchChain>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    if let Err(e) = chain.accept(stream, peer, &id, Arc::clone(&factory)) {
                        warn!(listener = %id, %peer, error = %e, "connection rejected");
                    }
                }
                Err(e) => {
                    warn!(listener = %id, error = %e, "accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
        }
    }
}
