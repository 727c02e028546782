//! Request metrics recorded on an OpenTelemetry [`Meter`].
//!
//! Every instrument carries a `listener.role` attribute so application and
//! admin traffic can be told apart.

use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use axum::body::Body;
use axum::http::{Request, Response, StatusCode};
use opentelemetry::metrics::{Counter, Histogram, Meter, UpDownCounter};
use opentelemetry::KeyValue;
use tower::{Layer, Service};

use super::dispatcher::ListenerId;

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// The instruments shared by every connection.
#[derive(Clone)]
pub struct RequestMetrics {
    requests: Counter<u64>,
    duration: Histogram<f64>,
    active: UpDownCounter<i64>,
}

impl RequestMetrics {
    pub fn new(meter: &Meter) -> Self {
        Self {
            requests: meter
                .u64_counter("harbor.server.requests")
                .with_description("Completed requests by listener role and status class")
                .init(),
            duration: meter
                .f64_histogram("harbor.server.request.duration")
                .with_description("Request duration in seconds")
                .init(),
            active: meter
                .i64_up_down_counter("harbor.server.active_requests")
                .with_description("Requests currently being processed")
                .init(),
        }
    }
}

#[derive(Clone)]
pub struct InstrumentedLayer {
    metrics: RequestMetrics,
}

impl InstrumentedLayer {
    pub fn new(metrics: RequestMetrics) -> Self {
        Self { metrics }
    }
}

impl<S> Layer<S> for InstrumentedLayer {
    type Service = Instrumented<S>;

    fn layer(&self, inner: S) -> Self::Service {
        Instrumented {
            inner,
            metrics: self.metrics.clone(),
        }
    }
}

#[derive(Clone)]
pub struct Instrumented<S> {
    inner: S,
    metrics: RequestMetrics,
}

impl<S> Service<Request<Body>> for Instrumented<S>
where
    S: Service<Request<Body>, Response = Response<Body>, Error = Infallible> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Response<Body>;
    type Error = Infallible;
    type Future = BoxFuture<Result<Response<Body>, Infallible>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<Body>) -> Self::Future {
        // The clone may not be ready; call the instance that was polled.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let metrics = self.metrics.clone();
        let role = role_of(&request);

        Box::pin(async move {
            let attributes = [KeyValue::new("listener.role", role)];
            let _active = ActiveRequest::enter(&metrics.active, &attributes);
            let started = Instant::now();

            let response = inner.call(request).await?;

            metrics
                .duration
                .record(started.elapsed().as_secs_f64(), &attributes);
            metrics.requests.add(
                1,
                &[
                    KeyValue::new("listener.role", role),
                    KeyValue::new("http.status_class", status_class(response.status())),
                ],
            );
            Ok(response)
        })
    }
}

/// Decrements the active-request counter when the request finishes or is
/// abandoned.
struct ActiveRequest<'a> {
    counter: &'a UpDownCounter<i64>,
    attributes: &'a [KeyValue],
}

impl<'a> ActiveRequest<'a> {
    fn enter(counter: &'a UpDownCounter<i64>, attributes: &'a [KeyValue]) -> Self {
        counter.add(1, attributes);
        Self {
            counter,
            attributes,
        }
    }
}

impl Drop for ActiveRequest<'_> {
    fn drop(&mut self) {
        self.counter.add(-1, self.attributes);
    }
}

fn role_of<B>(request: &Request<B>) -> &'static str {
    request
        .extensions()
        .get::<ListenerId>()
        .map_or("unknown", |listener| listener.role.as_str())
}

pub(crate) fn status_class(status: StatusCode) -> &'static str {
    match status.as_u16() {
        100..=199 => "1xx",
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        _ => "5xx",
    }
}
