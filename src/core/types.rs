//! # Core Types Module
//!
//! Request and response shapes exchanged between the surrounding HTTP server and the
//! tiering layer. The server converts its own request type into a [`RequestDescriptor`]
//! and receives a [`GatewayResponse`] back; nothing in this crate depends on the
//! connection staying open.

use axum::body::Body;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use tokio::time::Instant;
use uuid::Uuid;

/// Narrow view of an inbound request used for classification and dispatch
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    /// Unique identifier for this request (for tracing and logging)
    pub id: String,

    /// HTTP method
    pub method: Method,

    /// Request path without the query string
    pub path: String,

    /// Route parameters extracted by the router (`/users/:id` -> `id`)
    pub params: HashMap<String, String>,

    /// Query parameters, kept sorted so cache keys are stable
    pub query: BTreeMap<String, String>,

    /// Request headers
    pub headers: HeaderMap,

    /// Request body
    pub body: Bytes,

    /// When the request was received
    pub received_at: Instant,
}

impl RequestDescriptor {
    /// Create a descriptor for `method` and `path` with a generated ID
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            method,
            path: path.into(),
            params: HashMap::new(),
            query: BTreeMap::new(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
            received_at: Instant::now(),
        }
    }

    /// Create a descriptor from a request URI, splitting out the query string
    pub fn from_uri(method: Method, uri: &Uri) -> Self {
        let mut descriptor = Self::new(method, uri.path());
        if let Some(query) = uri.query() {
            descriptor.query = parse_query(query);
        }
        descriptor
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(name.into(), value.into());
        self
    }

    /// Add a header; invalid names or values are ignored
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            name.parse::<HeaderName>(),
            HeaderValue::from_str(value),
        ) {
            self.headers.insert(name, value);
        }
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Get a header value by name
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(name)
            .and_then(|value| value.to_str().ok())
    }

    pub fn has_body(&self) -> bool {
        !self.body.is_empty()
    }

    /// True when the client asked us not to serve or store a cached response
    pub fn forbids_caching(&self) -> bool {
        self.header("cache-control")
            .map(|value| {
                let value = value.to_ascii_lowercase();
                value.contains("no-cache") || value.contains("no-store")
            })
            .unwrap_or(false)
    }

    /// Query string rebuilt in sorted order
    pub fn canonical_query(&self) -> Option<String> {
        if self.query.is_empty() {
            return None;
        }
        Some(
            self.query
                .iter()
                .map(|(name, value)| format!("{}={}", name, value))
                .collect::<Vec<_>>()
                .join("&"),
        )
    }
}

fn parse_query(query: &str) -> BTreeMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((name, value)) => (name.to_string(), value.to_string()),
            None => (pair.to_string(), String::new()),
        })
        .collect()
}

/// Response produced by a handler or served from cache
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl GatewayResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers,
            body: body.into(),
        }
    }

    /// Plain text response
    pub fn text(status: StatusCode, body: impl Into<String>) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            "content-type",
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        Self::new(status, headers, body.into())
    }

    /// JSON response
    pub fn json(status: StatusCode, value: &serde_json::Value) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        Self::new(status, headers, value.to_string())
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(name)
            .and_then(|value| value.to_str().ok())
    }

    /// Insert a header, replacing any previous value; invalid values are ignored
    pub fn set_header(&mut self, name: &'static str, value: &str) {
        if let Ok(value) = HeaderValue::from_str(value) {
            self.headers.insert(name, value);
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

impl IntoResponse for GatewayResponse {
    fn into_response(self) -> Response {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_uri_sorts_query() {
        let uri: Uri = "/users?page=2&limit=10&flag".parse().unwrap();
        let request = RequestDescriptor::from_uri(Method::GET, &uri);

        assert_eq!(request.path, "/users");
        assert_eq!(request.canonical_query().as_deref(), Some("flag=&limit=10&page=2"));
    }

    #[test]
    fn test_forbids_caching() {
        let request = RequestDescriptor::new(Method::GET, "/health")
            .with_header("cache-control", "No-Cache");
        assert!(request.forbids_caching());

        let request = RequestDescriptor::new(Method::GET, "/health")
            .with_header("cache-control", "max-age=60");
        assert!(!request.forbids_caching());
    }

    #[test]
    fn test_response_headers() {
        let mut response = GatewayResponse::text(StatusCode::OK, "ok");
        response.set_header("x-cache", "MISS");

        assert_eq!(response.header("x-cache"), Some("MISS"));
        assert_eq!(response.header("content-type"), Some("text/plain; charset=utf-8"));
        assert!(response.is_success());
    }
}
