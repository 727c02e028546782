//! The wrapped dispatch path shared by every listener.
//!
//! Layer order, innermost first:
//! 1. [`RoutingDispatcher`]
//! 2. response compression (when `server.gzip.enabled`)
//! 3. [`InstrumentedLayer`]
//! 4. [`RequestLogLayer`] (when `server.request_log.enabled`)

use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, Response};
use common::ServiceError;
use hyper::body::Incoming;
use tower::util::BoxCloneService;
use tower::{Layer, ServiceBuilder, ServiceExt};
use tower_http::compression::{CompressionBody, CompressionLayer};
use tracing::warn;

use super::dispatcher::{ListenerId, RoutingDispatcher};
use super::instrumentation::{InstrumentedLayer, RequestMetrics};
use super::request_log::RequestLogLayer;
use crate::admin::handlers::error_response;
use crate::lifecycle::ManagedExecutor;

/// A fully wrapped dispatch path.
pub type Pipeline = BoxCloneService<Request<Body>, Response<Body>, Infallible>;

/// Recipe for [`Pipeline`]s. Cheap to clone and shareable across threads;
/// each connection builds its own pipeline from it.
#[derive(Clone)]
pub struct PipelineBuilder {
    dispatcher: RoutingDispatcher,
    metrics: RequestMetrics,
    gzip: bool,
    request_log: bool,
}

impl PipelineBuilder {
    pub fn new(dispatcher: RoutingDispatcher, metrics: RequestMetrics) -> Self {
        Self {
            dispatcher,
            metrics,
            gzip: true,
            request_log: true,
        }
    }

    pub fn gzip(mut self, enabled: bool) -> Self {
        self.gzip = enabled;
        self
    }

    pub fn request_log(mut self, enabled: bool) -> Self {
        self.request_log = enabled;
        self
    }

    pub fn dispatcher(&self) -> &RoutingDispatcher {
        &self.dispatcher
    }

    pub fn build(&self) -> Pipeline {
        let dispatcher = self.dispatcher.clone();
        let compressed: Pipeline = if self.gzip {
            BoxCloneService::new(
                ServiceBuilder::new()
                    .map_response(|response: Response<CompressionBody<Body>>| {
                        response.map(Body::new)
                    })
                    .layer(CompressionLayer::new())
                    .service(dispatcher),
            )
        } else {
            BoxCloneService::new(dispatcher)
        };

        let instrumented: Pipeline =
            BoxCloneService::new(InstrumentedLayer::new(self.metrics.clone()).layer(compressed));

        if self.request_log {
            BoxCloneService::new(RequestLogLayer.layer(instrumented))
        } else {
            instrumented
        }
    }
}

/// Per-connection hyper service: tags each request with the accepting
/// listener and runs it through the pipeline.
///
/// Each request takes a slot in the worker pool's queue for as long as it
/// is in flight. A request that finds the queue full is answered with `503`
/// without reaching the pipeline.
#[derive(Clone)]
pub struct ConnectionService {
    listener: ListenerId,
    pipeline: Pipeline,
    executor: Arc<ManagedExecutor>,
}

impl ConnectionService {
    pub fn new(listener: ListenerId, pipeline: Pipeline, executor: Arc<ManagedExecutor>) -> Self {
        Self {
            listener,
            pipeline,
            executor,
        }
    }

    pub fn listener(&self) -> &ListenerId {
        &self.listener
    }
}

type ResponseFuture = Pin<Box<dyn Future<Output = Result<Response<Body>, Infallible>> + Send>>;

impl hyper::service::Service<Request<Incoming>> for ConnectionService {
    type Response = Response<Body>;
    type Error = Infallible;
    type Future = ResponseFuture;

    fn call(&self, request: Request<Incoming>) -> Self::Future {
        let permit = match self.executor.admit() {
            Ok(permit) => permit,
            Err(e) => {
                warn!(
                    listener = %self.listener,
                    method = %request.method(),
                    uri = %request.uri(),
                    error = %e,
                    "request rejected"
                );
                let response = error_response(ServiceError::Unavailable(e.to_string()));
                return Box::pin(std::future::ready(Ok(response)));
            }
        };
        let mut request = request.map(Body::new);
        request.extensions_mut().insert(self.listener.clone());
        let response = self.pipeline.clone().oneshot(request);
        Box::pin(async move {
            let _permit = permit;
            response.await
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::fmt;

    use super::*;
    use crate::server::dispatcher::{tests::listener, BindingTable, Handler, Role};
    use crate::server::request_log::TARGET;
    use axum::http::header;
    use axum::routing::get;
    use axum::Router;
    use parking_lot::Mutex;
    use tracing::field::{Field, Visit};
    use tracing::{Event, Subscriber};
    use tracing_subscriber::layer::{Context, SubscriberExt};

    type Events = Arc<Mutex<Vec<BTreeMap<String, String>>>>;

    /// Records the fields of every access log event.
    #[derive(Clone, Default)]
    struct AccessLog(Events);

    struct Fields<'a>(&'a mut BTreeMap<String, String>);

    impl Visit for Fields<'_> {
        fn record_str(&mut self, field: &Field, value: &str) {
            self.0.insert(field.name().to_owned(), value.to_owned());
        }

        fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
            self.0.insert(field.name().to_owned(), format!("{value:?}"));
        }
    }

    impl<S: Subscriber> tracing_subscriber::Layer<S> for AccessLog {
        fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
            if event.metadata().target() != TARGET {
                return;
            }
            let mut fields = BTreeMap::new();
            event.record(&mut Fields(&mut fields));
            self.0.lock().push(fields);
        }
    }

    /// Run one gzip-accepting request through `builder`'s pipeline and
    /// return the response with the access log events it produced.
    async fn logged(builder: PipelineBuilder) -> (Response<Body>, Vec<BTreeMap<String, String>>) {
        let log = AccessLog::default();
        let events = Arc::clone(&log.0);
        let _guard = tracing::subscriber::set_default(tracing_subscriber::registry().with(log));
        let response = builder.build().oneshot(gzip_request()).await.unwrap();
        let events = events.lock().clone();
        (response, events)
    }

    const LONG_BODY: &str = "harbor harbor harbor harbor harbor harbor harbor harbor harbor";

    fn builder() -> PipelineBuilder {
        let mut table = BindingTable::builder();
        table
            .bind(
                listener(Role::Application, 0),
                Handler::new("app", Router::new().route("/", get(|| async { LONG_BODY }))),
            )
            .unwrap();
        let meter = opentelemetry::global::meter("pipeline-test");
        PipelineBuilder::new(RoutingDispatcher::new(table.build()), RequestMetrics::new(&meter))
    }

    fn gzip_request() -> Request<Body> {
        let mut req = Request::get("/")
            .header(header::ACCEPT_ENCODING, "gzip")
            .body(Body::empty())
            .unwrap();
        req.extensions_mut().insert(listener(Role::Application, 0));
        req
    }

    #[tokio::test]
    async fn compresses_when_enabled() {
        let response = builder().build().oneshot(gzip_request()).await.unwrap();
        assert_eq!(
            response.headers().get(header::CONTENT_ENCODING).unwrap(),
            "gzip"
        );
    }

    #[tokio::test]
    async fn leaves_body_alone_when_disabled() {
        let response = builder()
            .gzip(false)
            .request_log(false)
            .build()
            .oneshot(gzip_request())
            .await
            .unwrap();
        assert!(response.headers().get(header::CONTENT_ENCODING).is_none());
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body, LONG_BODY.as_bytes());
    }

    #[tokio::test]
    async fn request_log_sees_the_compressed_response() {
        let (response, events) = logged(builder()).await;
        assert_eq!(events.len(), 1, "{events:?}");
        assert_eq!(events[0]["content_encoding"], "gzip");
        assert_eq!(events[0]["status"], "200");
        assert_eq!(events[0]["uri"], "/");

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..2], &[0x1f_u8, 0x8b][..]);
    }

    #[tokio::test]
    async fn request_log_reports_identity_without_gzip() {
        let (_, events) = logged(builder().gzip(false)).await;
        assert_eq!(events.len(), 1, "{events:?}");
        assert_eq!(events[0]["content_encoding"], "identity");
    }

    #[tokio::test]
    async fn request_log_can_be_disabled() {
        let (response, events) = logged(builder().request_log(false)).await;
        assert_eq!(
            response.headers().get(header::CONTENT_ENCODING).unwrap(),
            "gzip"
        );
        assert!(events.is_empty(), "{events:?}");
    }
}
