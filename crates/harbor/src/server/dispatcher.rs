//! [`RoutingDispatcher`]: sends each request to the handler bound to the
//! listener it arrived on.
//!
//! The binding table is built once during assembly and never changes, so
//! dispatch is a lock-free lookup. A request from a listener with no binding
//! is a wiring defect and panics rather than being dropped or misrouted.

use std::collections::HashMap;
use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::Request;
use axum::response::Response;
use axum::Router;
use thiserror::Error;
use tower::util::Oneshot;
use tower::{Service, ServiceExt};

/// Which handler a listener serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Role {
    Application,
    Admin,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Application => "application",
            Role::Admin => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of one configured listener.
///
/// Attached to every request as an extension by the connection that
/// accepted it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ListenerId {
    pub role: Role,
    /// Position within its role's connector list.
    pub index: usize,
    pub transport: Arc<str>,
    pub host: Arc<str>,
    /// Configured port; `0` means the OS picked one at bind time.
    pub port: u16,
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{} ({}://{}:{})",
            self.role, self.index, self.transport, self.host, self.port
        )
    }
}

/// A fully built request handler.
#[derive(Clone)]
pub struct Handler {
    name: Arc<str>,
    router: Router,
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler").field("name", &self.name).finish()
    }
}

impl Handler {
    pub fn new(name: impl Into<Arc<str>>, router: Router) -> Self {
        Self {
            name: name.into(),
            router,
        }
    }

    /// Wrap an arbitrary tower service as a handler.
    pub fn from_service<S>(name: impl Into<Arc<str>>, service: S) -> Self
    where
        S: Service<Request<Body>, Response = Response, Error = Infallible> + Clone + Send + 'static,
        S::Future: Send + 'static,
    {
        Self::new(name, Router::new().fallback_service(service))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn router(&self) -> &Router {
        &self.router
    }
}

#[derive(Debug, Error)]
pub enum BindingError {
    #[error("listener {0} is already bound")]
    Duplicate(ListenerId),
}

/// Write-once mapping from listener to handler.
#[derive(Debug, Default)]
pub struct BindingTable {
    bindings: HashMap<ListenerId, Handler>,
}

impl BindingTable {
    pub fn builder() -> BindingTableBuilder {
        BindingTableBuilder::default()
    }

    pub fn get(&self, listener: &ListenerId) -> Option<&Handler> {
        self.bindings.get(listener)
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Every binding, sorted by role then index.
    pub fn iter(&self) -> impl Iterator<Item = (&ListenerId, &Handler)> {
        let mut entries: Vec<_> = self.bindings.iter().collect();
        entries.sort_by_key(|(id, _)| (id.role, id.index));
        entries.into_iter()
    }
}

#[derive(Debug, Default)]
pub struct BindingTableBuilder {
    bindings: HashMap<ListenerId, Handler>,
}

impl BindingTableBuilder {
    /// # Errors
    ///
    /// [`BindingError::Duplicate`] if `listener` already has a handler.
    pub fn bind(&mut self, listener: ListenerId, handler: Handler) -> Result<(), BindingError> {
        if self.bindings.contains_key(&listener) {
            return Err(BindingError::Duplicate(listener));
        }
        self.bindings.insert(listener, handler);
        Ok(())
    }

    pub fn build(self) -> BindingTable {
        BindingTable {
            bindings: self.bindings,
        }
    }
}

/// Single entry point shared by every listener.
#[derive(Debug, Clone)]
pub struct RoutingDispatcher {
    table: Arc<BindingTable>,
}

impl RoutingDispatcher {
    pub fn new(table: BindingTable) -> Self {
        Self {
            table: Arc::new(table),
        }
    }

    pub fn bindings(&self) -> &BindingTable {
        &self.table
    }

    /// The handler bound to `listener`.
    ///
    /// # Panics
    ///
    /// If `listener` has no binding.
    pub fn handler_for(&self, listener: &ListenerId) -> &Handler {
        match self.table.get(listener) {
            Some(handler) => handler,
            None => panic!("no handler bound to listener {listener}; the server was wired incorrectly"),
        }
    }

    /// Forward `request` unchanged to the handler bound to `listener`.
    pub fn dispatch(
        &self,
        listener: &ListenerId,
        request: Request<Body>,
    ) -> Oneshot<Router, Request<Body>> {
        self.handler_for(listener).router.clone().oneshot(request)
    }
}

impl Service<Request<Body>> for RoutingDispatcher {
    type Response = Response;
    type Error = Infallible;
    type Future = Oneshot<Router, Request<Body>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    /// # Panics
    ///
    /// If the request carries no [`ListenerId`] or its listener is unbound.
    fn call(&mut self, request: Request<Body>) -> Self::Future {
        let router = match request.extensions().get::<ListenerId>() {
            Some(listener) => self.handler_for(listener).router.clone(),
            None => panic!("request reached the dispatcher without a listener identity"),
        };
        router.oneshot(request)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::routing::get;

    pub(crate) fn listener(role: Role, index: usize) -> ListenerId {
        ListenerId {
            role,
            index,
            transport: "http".into(),
            host: "127.0.0.1".into(),
            port: 0,
        }
    }

    fn handler(body: &'static str) -> Handler {
        Handler::new(body, Router::new().route("/whoami", get(move || async move { body })))
    }

    fn dispatcher() -> RoutingDispatcher {
        let mut table = BindingTable::builder();
        table.bind(listener(Role::Application, 0), handler("application")).unwrap();
        table.bind(listener(Role::Application, 1), handler("application")).unwrap();
        table.bind(listener(Role::Admin, 0), handler("admin")).unwrap();
        RoutingDispatcher::new(table.build())
    }

    async fn body_of(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn request(listener: Option<ListenerId>) -> Request<Body> {
        let mut req = Request::builder().uri("/whoami").body(Body::empty()).unwrap();
        if let Some(listener) = listener {
            req.extensions_mut().insert(listener);
        }
        req
    }

    #[tokio::test]
    async fn each_listener_reaches_only_its_own_handler() {
        let dispatcher = dispatcher();
        for (role, index, expected) in [
            (Role::Application, 0, "application"),
            (Role::Application, 1, "application"),
            (Role::Admin, 0, "admin"),
        ] {
            let response = dispatcher
                .clone()
                .oneshot(request(Some(listener(role, index))))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(body_of(response).await, expected);
        }
    }

    #[tokio::test]
    async fn dispatch_forwards_the_request_unchanged() {
        let dispatcher = dispatcher();
        let id = listener(Role::Admin, 0);
        let response = dispatcher.dispatch(&id, request(None)).await.unwrap();
        assert_eq!(body_of(response).await, "admin");
    }

    #[test]
    #[should_panic(expected = "no handler bound to listener admin-7")]
    fn unbound_listener_panics() {
        dispatcher().handler_for(&listener(Role::Admin, 7));
    }

    #[test]
    #[should_panic(expected = "without a listener identity")]
    fn missing_listener_identity_panics() {
        let _ = dispatcher().call(request(None));
    }

    #[test]
    fn duplicate_binding_is_rejected() {
        let mut table = BindingTable::builder();
        table.bind(listener(Role::Admin, 0), handler("a")).unwrap();
        let err = table.bind(listener(Role::Admin, 0), handler("b")).unwrap_err();
        assert!(err.to_string().contains("admin-0"));
    }

    #[test]
    fn iterates_in_role_order() {
        let dispatcher = dispatcher();
        let order: Vec<String> = dispatcher
            .bindings()
            .iter()
            .map(|(id, h)| format!("{}-{}:{}", id.role, id.index, h.name()))
            .collect();
        assert_eq!(
            order,
            vec!["application-0:application", "application-1:application", "admin-0:admin"]
        );
    }
}
