//! Connector factories: how an accepted TCP stream is served.
//!
//! Listener definitions name a transport with a `type` tag. The tag is
//! resolved through a [`ConnectorRegistry`] that the bootstrap owns and
//! passes to assembly, so services can add transports of their own.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use super::pipeline::ConnectionService;

/// Serves one accepted connection until the peer closes it or `shutdown`
/// fires. On shutdown, in-flight requests should be allowed to complete.
#[async_trait]
pub trait ConnectorFactory: Send + Sync {
    /// The tag this factory is registered under by default.
    fn transport(&self) -> &'static str;

    async fn serve(
        &self,
        stream: TcpStream,
        service: ConnectionService,
        shutdown: CancellationToken,
    ) -> anyhow::Result<()>;
}

/// HTTP/1.1 with keep-alive.
#[derive(Debug, Clone)]
pub struct HttpConnectorFactory {
    pub header_read_timeout: Duration,
}

impl Default for HttpConnectorFactory {
    fn default() -> Self {
        Self {
            header_read_timeout: Duration::from_secs(30),
        }
    }
}

#[async_trait]
impl ConnectorFactory for HttpConnectorFactory {
    fn transport(&self) -> &'static str {
        "http"
    }

    async fn serve(
        &self,
        stream: TcpStream,
        service: ConnectionService,
        shutdown: CancellationToken,
    ) -> anyhow::Result<()> {
        let connection = hyper::server::conn::http1::Builder::new()
            .keep_alive(true)
            .timer(TokioTimer::new())
            .header_read_timeout(self.header_read_timeout)
            .serve_connection(TokioIo::new(stream), service);
        tokio::pin!(connection);

        tokio::select! {
            result = connection.as_mut() => result.context("HTTP/1.1 connection failed")?,
            _ = shutdown.cancelled() => {
                connection.as_mut().graceful_shutdown();
                connection.await.context("HTTP/1.1 connection failed while draining")?;
            }
        }
        Ok(())
    }
}

/// HTTP/2 over cleartext with prior knowledge.
#[derive(Debug, Clone, Copy, Default)]
pub struct H2cConnectorFactory;

#[async_trait]
impl ConnectorFactory for H2cConnectorFactory {
    fn transport(&self) -> &'static str {
        "h2c"
    }

    async fn serve(
        &self,
        stream: TcpStream,
        service: ConnectionService,
        shutdown: CancellationToken,
    ) -> anyhow::Result<()> {
        let connection = hyper::server::conn::http2::Builder::new(TokioExecutor::new())
            .serve_connection(TokioIo::new(stream), service);
        tokio::pin!(connection);

        tokio::select! {
            result = connection.as_mut() => result.context("h2c connection failed")?,
            _ = shutdown.cancelled() => {
                connection.as_mut().graceful_shutdown();
                connection.await.context("h2c connection failed while draining")?;
            }
        }
        Ok(())
    }
}

/// Transport tag → factory.
#[derive(Clone, Default)]
pub struct ConnectorRegistry {
    factories: HashMap<String, Arc<dyn ConnectorFactory>>,
}

impl std::fmt::Debug for ConnectorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectorRegistry")
            .field("transports", &self.transports())
            .finish()
    }
}

impl ConnectorRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the built-in `http` and `h2c` transports.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register_default(Arc::new(HttpConnectorFactory::default()));
        registry.register_default(Arc::new(H2cConnectorFactory));
        registry
    }

    /// Register `factory` under `tag`, replacing any previous factory.
    pub fn register(&mut self, tag: impl Into<String>, factory: Arc<dyn ConnectorFactory>) {
        self.factories.insert(tag.into(), factory);
    }

    /// Register `factory` under its own transport name.
    pub fn register_default(&mut self, factory: Arc<dyn ConnectorFactory>) {
        self.register(factory.transport(), factory);
    }

    pub fn resolve(&self, tag: &str) -> Option<Arc<dyn ConnectorFactory>> {
        self.factories.get(tag).cloned()
    }

    /// Registered tags, sorted.
    pub fn transports(&self) -> Vec<&str> {
        let mut tags: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        tags.sort_unstable();
        tags
    }
}
