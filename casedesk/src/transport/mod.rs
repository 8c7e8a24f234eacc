//! HTTP backend abstraction for `casedesk`.
//!
//! Defines the [`HttpBackend`] trait that carries one request to the REST
//! API and returns the raw response. Concrete implementations:
//! - [`http::ReqwestBackend`]: real HTTP via `reqwest`
//! - [`mock::MockBackend`]: in-process scripted routes for testing
//!
//! Backends never interpret status codes. Authentication, retry and
//! decoding happen in [`crate::session`].

pub mod http;
pub mod mock;

use std::fmt;

use serde::Serialize;
use serde::de::DeserializeOwned;
use uuid::Uuid;

/// HTTP methods used by the API contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// `GET`
    Get,
    /// `POST`
    Post,
    /// `PATCH`
    Patch,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Get => write!(f, "GET"),
            Self::Post => write!(f, "POST"),
            Self::Patch => write!(f, "PATCH"),
        }
    }
}

/// One outbound API call.
///
/// `path` is relative to the configured API base (`/chat/messages/`).
/// `bearer` is filled in by the session layer, never by callers.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    /// HTTP method.
    pub method: Method,
    /// Path below the API base, with leading slash.
    pub path: String,
    /// Query-string pairs, in order.
    pub query: Vec<(String, String)>,
    /// JSON body, if any.
    pub body: Option<serde_json::Value>,
    /// Access credential to send as `Authorization: Bearer`.
    pub bearer: Option<String>,
    /// Correlation id sent as `X-Request-Id` and used in logs.
    pub request_id: Uuid,
}

impl ApiRequest {
    /// Creates a request with no query, body or credential.
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
            bearer: None,
            request_id: Uuid::now_v7(),
        }
    }

    /// Shorthand for a `GET`.
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    /// Shorthand for a `POST`.
    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::Post, path)
    }

    /// Shorthand for a `PATCH`.
    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::Patch, path)
    }

    /// Append a query-string pair.
    #[must_use]
    pub fn query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    /// Attach a JSON body.
    ///
    /// # Errors
    ///
    /// Returns [`serde_json::Error`] if `body` cannot be represented as JSON.
    pub fn json<T: Serialize>(mut self, body: &T) -> Result<Self, serde_json::Error> {
        self.body = Some(serde_json::to_value(body)?);
        Ok(self)
    }

    /// Returns the value of the first query pair named `key`.
    #[must_use]
    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Raw response: status code and body bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response body.
    pub body: Vec<u8>,
}

impl ApiResponse {
    /// Creates a response from a status and raw body.
    #[must_use]
    pub const fn new(status: u16, body: Vec<u8>) -> Self {
        Self { status, body }
    }

    /// Creates a response whose body is `value` serialized as JSON.
    ///
    /// Serialization failures produce an empty body.
    pub fn with_json<T: Serialize>(status: u16, value: &T) -> Self {
        Self {
            status,
            body: serde_json::to_vec(value).unwrap_or_default(),
        }
    }

    /// Creates an empty-bodied response.
    #[must_use]
    pub const fn empty(status: u16) -> Self {
        Self {
            status,
            body: Vec::new(),
        }
    }

    /// Whether the status is 2xx.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300
    }

    /// Decode the body as JSON.
    ///
    /// # Errors
    ///
    /// Returns [`serde_json::Error`] if the body is not valid JSON for `T`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    /// The body as (lossy) UTF-8 text, for error messages.
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Errors that prevent a response from being received at all.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The request did not complete within the configured timeout.
    #[error("request timed out")]
    Timeout,

    /// The server could not be reached.
    #[error("connection failed: {0}")]
    Connect(String),

    /// The configured base URL or request path is invalid.
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    /// Any other client-side failure while sending or reading.
    #[error("request failed: {0}")]
    Request(String),
}

/// Async backend that performs one HTTP exchange.
///
/// # Invariant
///
/// Implementations return every HTTP status (including 401) as
/// `Ok(ApiResponse)`. `Err` is reserved for failures where no response
/// exists.
pub trait HttpBackend: Send + Sync + 'static {
    /// Perform the request and return the raw response.
    fn execute(
        &self,
        request: ApiRequest,
    ) -> impl std::future::Future<Output = Result<ApiResponse, TransportError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_collects_query_and_body() {
        let req = ApiRequest::get("/chat/messages/")
            .query("chat_with", 5)
            .json(&serde_json::json!({"read": true}))
            .unwrap();
        assert_eq!(req.method, Method::Get);
        assert_eq!(req.query_value("chat_with"), Some("5"));
        assert_eq!(req.body, Some(serde_json::json!({"read": true})));
        assert!(req.bearer.is_none());
    }

    #[test]
    fn each_request_gets_its_own_id() {
        assert_ne!(
            ApiRequest::get("/a").request_id,
            ApiRequest::get("/a").request_id
        );
    }

    #[test]
    fn methods_display_as_http_verbs() {
        assert_eq!(Method::Get.to_string(), "GET");
        assert_eq!(Method::Post.to_string(), "POST");
        assert_eq!(Method::Patch.to_string(), "PATCH");
    }

    #[test]
    fn success_range() {
        assert!(ApiResponse::empty(200).is_success());
        assert!(ApiResponse::empty(204).is_success());
        assert!(!ApiResponse::empty(401).is_success());
        assert!(!ApiResponse::empty(302).is_success());
    }

    #[test]
    fn json_response_decodes() {
        let resp = ApiResponse::with_json(200, &serde_json::json!({"access": "t"}));
        let value: serde_json::Value = resp.json().unwrap();
        assert_eq!(value["access"], "t");
    }
}
