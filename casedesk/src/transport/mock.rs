//! Scripted in-process backend for testing.
//!
//! Routes are registered per `(method, path)` and answered by a closure,
//! optionally after a delay. Every request is recorded so tests can count
//! calls (for example, how many times the refresh endpoint was hit).
//! Unrouted requests get a 404.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::{ApiRequest, ApiResponse, HttpBackend, Method, TransportError};

/// Reply produced by a mock route.
pub type MockReply = Result<ApiResponse, TransportError>;

type Handler = Arc<dyn Fn(&ApiRequest) -> MockReply + Send + Sync>;

#[derive(Clone)]
struct Route {
    handler: Handler,
    delay: Duration,
}

/// In-process [`HttpBackend`] answering from registered closures.
///
/// Cloning yields a handle to the same routes and request log.
#[derive(Clone, Default)]
pub struct MockBackend {
    routes: Arc<Mutex<HashMap<(Method, String), Route>>>,
    log: Arc<Mutex<Vec<ApiRequest>>>,
}

impl MockBackend {
    /// Creates a backend with no routes.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the handler for `method path`.
    pub fn route<F>(&self, method: Method, path: &str, handler: F)
    where
        F: Fn(&ApiRequest) -> MockReply + Send + Sync + 'static,
    {
        self.route_delayed(method, path, Duration::ZERO, handler);
    }

    /// Register a handler that answers only after `delay`.
    ///
    /// The handler runs after the delay, so it observes any state changed
    /// while the request was "on the wire".
    pub fn route_delayed<F>(&self, method: Method, path: &str, delay: Duration, handler: F)
    where
        F: Fn(&ApiRequest) -> MockReply + Send + Sync + 'static,
    {
        self.routes.lock().insert(
            (method, path.to_string()),
            Route {
                handler: Arc::new(handler),
                delay,
            },
        );
    }

    /// Every request received so far, in arrival order.
    #[must_use]
    pub fn requests(&self) -> Vec<ApiRequest> {
        self.log.lock().clone()
    }

    /// Number of requests received for `method path`.
    #[must_use]
    pub fn calls(&self, method: Method, path: &str) -> usize {
        self.log
            .lock()
            .iter()
            .filter(|r| r.method == method && r.path == path)
            .count()
    }

    /// Forget all recorded requests.
    pub fn clear_log(&self) {
        self.log.lock().clear();
    }
}

impl HttpBackend for MockBackend {
    async fn execute(&self, request: ApiRequest) -> Result<ApiResponse, TransportError> {
        self.log.lock().push(request.clone());
        let route = self
            .routes
            .lock()
            .get(&(request.method, request.path.clone()))
            .cloned();

        let Some(route) = route else {
            return Ok(ApiResponse::empty(404));
        };
        if !route.delay.is_zero() {
            tokio::time::sleep(route.delay).await;
        }
        (route.handler)(&request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn routed_request_is_answered_and_logged() {
        let backend = MockBackend::new();
        backend.route(Method::Get, "/ping/", |_| Ok(ApiResponse::empty(204)));

        let resp = backend.execute(ApiRequest::get("/ping/")).await.unwrap();
        assert_eq!(resp.status, 204);
        assert_eq!(backend.calls(Method::Get, "/ping/"), 1);
    }

    #[tokio::test]
    async fn unrouted_request_is_not_found() {
        let backend = MockBackend::new();
        let resp = backend.execute(ApiRequest::get("/missing/")).await.unwrap();
        assert_eq!(resp.status, 404);
        assert_eq!(backend.requests().len(), 1);
    }

    #[tokio::test]
    async fn handler_can_fail_at_transport_level() {
        let backend = MockBackend::new();
        backend.route(Method::Post, "/x/", |_| Err(TransportError::Timeout));
        let result = backend.execute(ApiRequest::post("/x/")).await;
        assert_eq!(result, Err(TransportError::Timeout));
    }

    #[tokio::test]
    async fn replacing_a_route_changes_the_answer() {
        let backend = MockBackend::new();
        backend.route(Method::Get, "/v/", |_| Ok(ApiResponse::empty(500)));
        backend.route(Method::Get, "/v/", |_| Ok(ApiResponse::empty(200)));
        let resp = backend.execute(ApiRequest::get("/v/")).await.unwrap();
        assert_eq!(resp.status, 200);
    }
}
