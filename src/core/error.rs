//! # Error Handling Module
//!
//! This module defines the error types that can cross the boundary of the tiering layer
//! and the HTTP status mapping used when one of them is rendered for a client.
//!
//! ## Error Containment
//!
//! Errors produced *inside* the optimization layer (classification, route learning,
//! cache lookups) are represented by [`OptimizationError`] and never leave the
//! dispatcher: they are counted and the request is downgraded to the standard path.
//! Only [`GatewayError`] values produced by caller supplied handlers and middleware
//! are propagated outward, unchanged.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::convert::Infallible;
use thiserror::Error;

/// Main result type used throughout the gateway
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Errors that may be returned to the surrounding server
///
/// Each variant represents a different category of error that can occur.
/// The `#[error("...")]` attribute from `thiserror` implements `Display`.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum GatewayError {
    /// Configuration-related errors (invalid config, missing files, etc.)
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Request validation errors (malformed descriptor, invalid headers, etc.)
    #[error("Request validation failed: {field} - {reason}")]
    RequestValidation { field: String, reason: String },

    /// Security stage rejected the request
    #[error("Authorization failed: {reason}")]
    Authorization { reason: String },

    /// Error raised by a business handler, carrying the status it wants to surface
    #[error("Handler error ({status}): {message}")]
    Handler { status: u16, message: String },

    /// Middleware execution errors
    #[error("Middleware error ({middleware}): {message}")]
    Middleware { middleware: String, message: String },

    /// Request timeout errors
    #[error("Request timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Internal server errors for unexpected failures
    #[error("Internal server error: {message}")]
    Internal { message: String },

    /// I/O errors (file operations, network errors, etc.)
    #[error("I/O error: {message}")]
    Io { message: String },

    /// JSON serialization/deserialization errors
    #[error("JSON error: {message}")]
    Json { message: String },

    /// YAML parsing errors for configuration files
    #[error("YAML error: {message}")]
    Yaml { message: String },

    /// TOML parsing errors for configuration files
    #[error("TOML error: {message}")]
    Toml { message: String },
}

impl GatewayError {
    /// Create a configuration error with a custom message
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an authorization error with a custom reason
    pub fn authz<S: Into<String>>(reason: S) -> Self {
        Self::Authorization {
            reason: reason.into(),
        }
    }

    /// Create a handler error with the status code the handler wants to return
    pub fn handler<S: Into<String>>(status: StatusCode, message: S) -> Self {
        Self::Handler {
            status: status.as_u16(),
            message: message.into(),
        }
    }

    /// Create a middleware error
    pub fn middleware<N: Into<String>, S: Into<String>>(middleware: N, message: S) -> Self {
        Self::Middleware {
            middleware: middleware.into(),
            message: message.into(),
        }
    }

    /// Create an internal error with a custom message
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Create a validation error for a specific request field
    pub fn validation<F: Into<String>, S: Into<String>>(field: F, reason: S) -> Self {
        Self::RequestValidation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Get the appropriate HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Authorization { .. } => StatusCode::FORBIDDEN,
            Self::RequestValidation { .. } => StatusCode::BAD_REQUEST,
            Self::Handler { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
            Self::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::Json { .. } => StatusCode::BAD_REQUEST,
            Self::Configuration { .. }
            | Self::Middleware { .. }
            | Self::Internal { .. }
            | Self::Io { .. }
            | Self::Yaml { .. }
            | Self::Toml { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get a string representation of the error type for API responses
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => "configuration_error",
            Self::RequestValidation { .. } => "request_validation_error",
            Self::Authorization { .. } => "authorization_error",
            Self::Handler { .. } => "handler_error",
            Self::Middleware { .. } => "middleware_error",
            Self::Timeout { .. } => "timeout",
            Self::Internal { .. } => "internal_error",
            Self::Io { .. } => "io_error",
            Self::Json { .. } => "json_error",
            Self::Yaml { .. } => "yaml_error",
            Self::Toml { .. } => "toml_error",
        }
    }
}

impl From<Infallible> for GatewayError {
    fn from(infallible: Infallible) -> Self {
        match infallible {}
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json {
            message: err.to_string(),
        }
    }
}

impl From<serde_yaml::Error> for GatewayError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Yaml {
            message: err.to_string(),
        }
    }
}

impl From<toml::de::Error> for GatewayError {
    fn from(err: toml::de::Error) -> Self {
        Self::Toml {
            message: err.to_string(),
        }
    }
}

/// Render errors as structured JSON so axum handlers can return them directly
impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let error_response = json!({
            "error": {
                "code": status.as_u16(),
                "message": self.to_string(),
                "type": self.error_type(),
            }
        });

        (status, Json(error_response)).into_response()
    }
}

/// Failures inside the optimization layer
///
/// These are always contained by the dispatcher: the request is downgraded to the
/// standard path and the failure is counted in the optimization statistics.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum OptimizationError {
    /// Cache lookup or write failed in a way the store did not absorb
    #[error("cache operation failed: {0}")]
    Cache(String),

    /// The request descriptor could not be classified
    #[error("classification failed: {0}")]
    Classification(String),

    /// A cached payload could not be decoded back into a response
    #[error("cached response is corrupt: {0}")]
    CorruptCachedResponse(String),
}

impl From<crate::caching::CacheError> for OptimizationError {
    fn from(err: crate::caching::CacheError) -> Self {
        Self::Cache(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_codes() {
        assert_eq!(
            GatewayError::authz("missing api key").status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            GatewayError::validation("path", "empty").status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            GatewayError::Timeout { timeout_ms: 5000 }.status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
    }

    #[test]
    fn test_handler_error_keeps_its_status() {
        let err = GatewayError::handler(StatusCode::NOT_FOUND, "no such user");
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(err.error_type(), "handler_error");

        let invalid = GatewayError::Handler {
            status: 42,
            message: "bogus".to_string(),
        };
        assert_eq!(invalid.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_into_response_uses_status_code() {
        let response = GatewayError::authz("denied").into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }
}
