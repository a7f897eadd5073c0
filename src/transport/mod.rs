//! Upload transport module
//!
//! Carries create and delete batches to the remote service.
//!
//! # Features
//!
//! - **Raw Responses**: Every HTTP status comes back as a `TransportResponse`;
//!   interpretation (success, partial rejection, failure) belongs to the uploader
//! - **Rate Limiting**: Token bucket rate limiter using governor
//! - **Per-Call Timeouts**: The active tier's timeout bounds each request

mod client;
mod rate_limit;

pub use client::{HttpTransport, HttpTransportConfig, HttpTransportConfigBuilder};
pub use rate_limit::{RateLimiter, RateLimiterConfig};

use crate::error::Result;
use crate::types::JsonValue;
use async_trait::async_trait;
use std::time::Duration;

/// Status and body of a completed request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    /// HTTP status code
    pub status: u16,
    /// Response body as text
    pub body: String,
}

impl TransportResponse {
    /// Create a response
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// 2xx status
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Sends batches to the remote service.
///
/// Errors are reserved for requests that produced no response at all
/// (timeouts, connection failures, cancellation).
#[async_trait]
pub trait UploadTransport: Send + Sync {
    /// Create the records described by `body`
    async fn create_batch(&self, body: &JsonValue, timeout: Duration) -> Result<TransportResponse>;

    /// Delete the records described by `body`
    async fn delete_batch(&self, body: &JsonValue, timeout: Duration) -> Result<TransportResponse>;
}

#[cfg(test)]
mod tests;
