//! HTTP transport
//!
//! Posts create batches and issues delete batches against
//! `{base_url}/v1/datasets/{upload_target_id}/data`, waiting on the rate
//! limiter before every request. Retries are not done here; the
//! coordinator owns retry decisions.

use super::rate_limit::{RateLimiter, RateLimiterConfig};
use super::{TransportResponse, UploadTransport};
use crate::config::HostConfig;
use crate::error::{Error, Result};
use crate::types::JsonValue;
use async_trait::async_trait;
use reqwest::{Client, Method};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// Configuration for the HTTP transport
#[derive(Debug, Clone)]
pub struct HttpTransportConfig {
    /// Base URL of the remote service
    pub base_url: String,
    /// Dataset receiving the uploads
    pub upload_target_id: String,
    /// Bearer token
    pub auth_token: Option<String>,
    /// Rate limiter configuration
    pub rate_limit: Option<RateLimiterConfig>,
    /// Connect timeout; request timeouts come from the active tier
    pub connect_timeout: Duration,
    /// User agent string
    pub user_agent: String,
}

impl Default for HttpTransportConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            upload_target_id: String::new(),
            auth_token: None,
            rate_limit: None,
            connect_timeout: Duration::from_secs(10),
            user_agent: format!("recsync/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl HttpTransportConfig {
    /// Create a new config builder
    pub fn builder() -> HttpTransportConfigBuilder {
        HttpTransportConfigBuilder::default()
    }

    /// Transport settings taken from the host configuration
    pub fn from_host_config(config: &HostConfig) -> Result<Self> {
        let upload_target_id = config
            .upload_target_id
            .clone()
            .ok_or_else(|| Error::missing_field("upload_target_id"))?;
        let mut builder = Self::builder()
            .base_url(config.base_url.clone())
            .upload_target_id(upload_target_id);
        if let Some(token) = &config.auth_token {
            builder = builder.auth_token(token.clone());
        }
        if let Some(rps) = config.requests_per_second {
            builder = builder.rate_limit(RateLimiterConfig::new(rps, rps));
        }
        Ok(builder.build())
    }
}

/// Builder for HTTP transport config
#[derive(Default)]
pub struct HttpTransportConfigBuilder {
    config: HttpTransportConfig,
}

impl HttpTransportConfigBuilder {
    /// Set the base URL
    #[must_use]
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.config.base_url = url.into();
        self
    }

    /// Set the upload target
    #[must_use]
    pub fn upload_target_id(mut self, id: impl Into<String>) -> Self {
        self.config.upload_target_id = id.into();
        self
    }

    /// Set the bearer token
    #[must_use]
    pub fn auth_token(mut self, token: impl Into<String>) -> Self {
        self.config.auth_token = Some(token.into());
        self
    }

    /// Set rate limiter
    #[must_use]
    pub fn rate_limit(mut self, config: RateLimiterConfig) -> Self {
        self.config.rate_limit = Some(config);
        self
    }

    /// Set connect timeout
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Set user agent
    #[must_use]
    pub fn user_agent(mut self, agent: impl Into<String>) -> Self {
        self.config.user_agent = agent.into();
        self
    }

    /// Build the config
    pub fn build(self) -> HttpTransportConfig {
        self.config
    }
}

/// Upload transport over HTTP
pub struct HttpTransport {
    client: Client,
    config: HttpTransportConfig,
    endpoint: Url,
    rate_limiter: Option<RateLimiter>,
}

impl HttpTransport {
    /// Create a transport
    pub fn new(config: HttpTransportConfig) -> Result<Self> {
        if config.upload_target_id.is_empty() {
            return Err(Error::missing_field("upload_target_id"));
        }
        let endpoint = build_endpoint(&config.base_url, &config.upload_target_id)?;
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .user_agent(&config.user_agent)
            .build()?;
        let rate_limiter = config.rate_limit.as_ref().map(RateLimiter::new);

        Ok(Self {
            client,
            config,
            endpoint,
            rate_limiter,
        })
    }

    /// Create a transport from the host configuration
    pub fn from_host_config(config: &HostConfig) -> Result<Self> {
        Self::new(HttpTransportConfig::from_host_config(config)?)
    }

    /// URL every batch is sent to
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    async fn send(
        &self,
        method: Method,
        body: &JsonValue,
        timeout: Duration,
    ) -> Result<TransportResponse> {
        // Wait for rate limiter
        if let Some(ref limiter) = self.rate_limiter {
            limiter.wait().await;
        }

        let mut req = self
            .client
            .request(method.clone(), self.endpoint.clone())
            .json(body)
            .timeout(timeout);
        if let Some(ref token) = self.config.auth_token {
            req = req.bearer_auth(token);
        }

        match req.send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                let body = response.text().await.unwrap_or_default();
                debug!(%method, status, "Upload request completed");
                Ok(TransportResponse { status, body })
            }
            Err(e) if e.is_timeout() => {
                warn!(%method, timeout_ms = timeout.as_millis() as u64, "Upload request timed out");
                Err(Error::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
            Err(e) => {
                warn!(%method, error = %e, "Upload request failed");
                Err(Error::Http(e))
            }
        }
    }
}

#[async_trait]
impl UploadTransport for HttpTransport {
    async fn create_batch(&self, body: &JsonValue, timeout: Duration) -> Result<TransportResponse> {
        self.send(Method::POST, body, timeout).await
    }

    async fn delete_batch(&self, body: &JsonValue, timeout: Duration) -> Result<TransportResponse> {
        self.send(Method::DELETE, body, timeout).await
    }
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("endpoint", &self.endpoint.as_str())
            .field("has_auth", &self.config.auth_token.is_some())
            .field("has_rate_limiter", &self.rate_limiter.is_some())
            .finish_non_exhaustive()
    }
}

/// Join the base URL and dataset path
fn build_endpoint(base_url: &str, upload_target_id: &str) -> Result<Url> {
    let base = base_url.trim_end_matches('/');
    Ok(Url::parse(&format!(
        "{base}/v1/datasets/{upload_target_id}/data"
    ))?)
}
