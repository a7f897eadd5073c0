//! Error types for recsync
//!
//! This module defines the error hierarchy for the whole engine.
//! All public APIs return `Result<T, Error>` where Error is defined here.
//!
//! Every error also maps onto a [`FailureClass`], which is what the retry
//! policy looks at when a run stops.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The main error type for recsync
#[derive(Error, Debug)]
pub enum Error {
    // ============================================================================
    // Configuration Errors
    // ============================================================================
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Missing required config field: {field}")]
    MissingConfigField { field: String },

    #[error("Invalid config value for '{field}': {message}")]
    InvalidConfigValue { field: String, message: String },

    #[error("Failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    // ============================================================================
    // Data Source Errors
    // ============================================================================
    #[error("Data source unavailable: {message}")]
    SourceUnavailable { message: String },

    #[error("Access denied for record types: {types}")]
    AccessDenied { types: String },

    #[error("Query failed for '{record_type}': {message}")]
    SourceQuery {
        record_type: String,
        message: String,
    },

    // ============================================================================
    // Upload Errors
    // ============================================================================
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP {status}: {body}")]
    HttpStatus { status: u16, body: String },

    #[error("Request timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Network unavailable: {message}")]
    Offline { message: String },

    #[error("Rejected items could not be reconciled: {message}")]
    RejectionMismatch { message: String },

    #[error("Item '{id}' cannot be serialized: {message}")]
    Serialization { id: String, message: String },

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    // ============================================================================
    // State Errors
    // ============================================================================
    #[error("State error: {message}")]
    State { message: String },

    #[error("Invalid run state transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    // ============================================================================
    // Run Control Errors
    // ============================================================================
    #[error("Upload cancelled")]
    Cancelled,

    #[error("Coordinator for {mode} mode is not running")]
    CoordinatorClosed { mode: String },

    // ============================================================================
    // I/O Errors
    // ============================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("File not found: {path}")]
    FileNotFound { path: String },

    // ============================================================================
    // Generic Errors
    // ============================================================================
    #[error("{0}")]
    Other(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Coarse classification of a failure, used to pick a retry decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Missing identifiers, denied access, bad settings. Never retried.
    Configuration,
    /// The host reports no network
    Connectivity,
    /// Remote answered with a 5xx status
    Server,
    /// Transient failure worth another attempt
    Retryable,
    /// Failure that another attempt will not fix
    NonRetryable,
    /// Work was cancelled
    Cancelled,
}

impl FailureClass {
    /// Whether failures of this class enter the retry policy
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            FailureClass::Connectivity | FailureClass::Server | FailureClass::Retryable
        )
    }
}

impl Error {
    /// Create a config error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a missing field error
    pub fn missing_field(field: impl Into<String>) -> Self {
        Self::MissingConfigField {
            field: field.into(),
        }
    }

    /// Create an invalid config value error
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidConfigValue {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create an HTTP status error
    pub fn http_status(status: u16, body: impl Into<String>) -> Self {
        Self::HttpStatus {
            status,
            body: body.into(),
        }
    }

    /// Create a source query error
    pub fn source_query(record_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SourceQuery {
            record_type: record_type.into(),
            message: message.into(),
        }
    }

    /// Create a serialization error for a single item
    pub fn serialization(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Serialization {
            id: id.into(),
            message: message.into(),
        }
    }

    /// Create a state error
    pub fn state(message: impl Into<String>) -> Self {
        Self::State {
            message: message.into(),
        }
    }

    /// Classify this error for the retry policy
    pub fn failure_class(&self) -> FailureClass {
        match self {
            Error::Config { .. }
            | Error::MissingConfigField { .. }
            | Error::InvalidConfigValue { .. }
            | Error::SourceUnavailable { .. }
            | Error::AccessDenied { .. }
            | Error::InvalidUrl(_) => FailureClass::Configuration,
            Error::Offline { .. } => FailureClass::Connectivity,
            Error::HttpStatus { status, .. } => classify_status(*status),
            Error::Http(_)
            | Error::Timeout { .. }
            | Error::SourceQuery { .. }
            | Error::State { .. }
            | Error::Io(_)
            | Error::Other(_)
            | Error::Anyhow(_) => FailureClass::Retryable,
            Error::Cancelled => FailureClass::Cancelled,
            Error::RejectionMismatch { .. }
            | Error::Serialization { .. }
            | Error::InvalidTransition { .. }
            | Error::CoordinatorClosed { .. }
            | Error::YamlParse(_)
            | Error::JsonParse(_)
            | Error::FileNotFound { .. } => FailureClass::NonRetryable,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        self.failure_class().is_retryable()
    }

    /// HTTP status attached to this error, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::HttpStatus { status, .. } => Some(*status),
            Error::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

/// Map an HTTP status onto a failure class
fn classify_status(status: u16) -> FailureClass {
    match status {
        500..=599 => FailureClass::Server,
        408 | 429 => FailureClass::Retryable,
        _ => FailureClass::NonRetryable,
    }
}

/// Result type alias for recsync
pub type Result<T> = std::result::Result<T, Error>;

/// Extension trait for adding context to errors
pub trait ResultExt<T> {
    /// Add context to an error
    fn context(self, message: impl Into<String>) -> Result<T>;

    /// Add context with a closure (lazy evaluation)
    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T>;
}

impl<T, E: Into<Error>> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| {
            let inner = e.into();
            Error::Other(format!("{}: {}", message.into(), inner))
        })
    }

    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T> {
        self.map_err(|e| {
            let inner = e.into();
            Error::Other(format!("{}: {}", f(), inner))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn test_error_display() {
        let err = Error::config("test message");
        assert_eq!(err.to_string(), "Configuration error: test message");

        let err = Error::missing_field("account_id");
        assert_eq!(err.to_string(), "Missing required config field: account_id");

        let err = Error::http_status(404, "Not found");
        assert_eq!(err.to_string(), "HTTP 404: Not found");

        let err = Error::Cancelled;
        assert_eq!(err.to_string(), "Upload cancelled");
    }

    #[test_case(500, FailureClass::Server ; "internal error")]
    #[test_case(503, FailureClass::Server ; "unavailable")]
    #[test_case(429, FailureClass::Retryable ; "too many requests")]
    #[test_case(400, FailureClass::NonRetryable ; "bad request")]
    #[test_case(401, FailureClass::NonRetryable ; "unauthorized")]
    #[test_case(404, FailureClass::NonRetryable ; "not found")]
    fn test_status_classification(status: u16, expected: FailureClass) {
        assert_eq!(Error::http_status(status, "").failure_class(), expected);
    }

    #[test]
    fn test_failure_class() {
        assert_eq!(
            Error::missing_field("upload_target_id").failure_class(),
            FailureClass::Configuration
        );
        assert_eq!(
            Error::AccessDenied {
                types: "glucose".to_string()
            }
            .failure_class(),
            FailureClass::Configuration
        );
        assert_eq!(
            Error::Offline {
                message: "no route".to_string()
            }
            .failure_class(),
            FailureClass::Connectivity
        );
        assert_eq!(
            Error::Timeout { timeout_ms: 1000 }.failure_class(),
            FailureClass::Retryable
        );
        assert_eq!(Error::Cancelled.failure_class(), FailureClass::Cancelled);
        assert_eq!(
            Error::RejectionMismatch {
                message: "3 != 2".to_string()
            }
            .failure_class(),
            FailureClass::NonRetryable
        );
    }

    #[test]
    fn test_is_retryable() {
        assert!(Error::Timeout { timeout_ms: 1000 }.is_retryable());
        assert!(Error::http_status(500, "").is_retryable());
        assert!(Error::source_query("glucose", "busy").is_retryable());

        assert!(!Error::http_status(400, "").is_retryable());
        assert!(!Error::config("test").is_retryable());
        assert!(!Error::Cancelled.is_retryable());
    }

    #[test]
    fn test_status() {
        assert_eq!(Error::http_status(502, "").status(), Some(502));
        assert_eq!(Error::config("x").status(), None);
    }

    #[test]
    fn test_result_context() {
        let result: Result<()> = Err(Error::config("inner"));
        let with_context = result.context("outer");
        assert!(with_context
            .unwrap_err()
            .to_string()
            .contains("outer: Configuration error: inner"));
    }
}
