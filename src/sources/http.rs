//! HTTP client for a remote metrics endpoint.
//!
//! Reads `GET {base}/metrics/current` and `GET {base}/metrics/baseline`. Each
//! endpoint returns a [`PerformanceMetrics`] JSON object, either bare or
//! wrapped as `{ "metrics": { … } }`.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use super::MetricsSource;
use crate::error::Result;
use crate::metrics::PerformanceMetrics;

/// Errors that can occur while talking to the metrics endpoint.
#[derive(Debug)]
pub enum MetricsSourceError {
    /// The remote server replied with a non-2xx HTTP status code.
    Http { status: u16, url: String },
    /// Response body could not be parsed as the expected JSON structure.
    Json { url: String, detail: String },
    /// A TCP-level connection could not be established.
    Connect { url: String, detail: String },
}

impl std::fmt::Display for MetricsSourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetricsSourceError::Http { status, url } => {
                write!(f, "HTTP {status} from {url}")
            }
            MetricsSourceError::Json { url, detail } => {
                write!(f, "JSON parse error from {url}: {detail}")
            }
            MetricsSourceError::Connect { url, detail } => {
                write!(f, "Connection failed to {url}: {detail}")
            }
        }
    }
}

impl std::error::Error for MetricsSourceError {}

/// Configuration for [`HttpMetricsSource`].
#[derive(Debug, Clone)]
pub struct HttpMetricsConfig {
    /// Base URL of the metrics API (e.g. `http://127.0.0.1:9100`).
    pub base_url: String,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl HttpMetricsConfig {
    /// Defaults: connect timeout 3 s, request timeout 10 s.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            connect_timeout: Duration::from_secs(3),
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Parse a snapshot from either the bare or the wrapped JSON shape.
pub fn parse_snapshot(bytes: &[u8], url: &str) -> std::result::Result<PerformanceMetrics, MetricsSourceError> {
    if let Ok(m) = serde_json::from_slice::<PerformanceMetrics>(bytes) {
        return Ok(m.sanitized());
    }

    #[derive(Deserialize)]
    struct Wrapped {
        metrics: PerformanceMetrics,
    }

    serde_json::from_slice::<Wrapped>(bytes)
        .map(|w| w.metrics.sanitized())
        .map_err(|e| MetricsSourceError::Json { url: url.to_string(), detail: e.to_string() })
}

/// A [`MetricsSource`] that polls a JSON HTTP endpoint.
pub struct HttpMetricsSource {
    config: HttpMetricsConfig,
    client: reqwest::Client,
}

impl HttpMetricsSource {
    pub fn builder(base_url: impl Into<String>) -> HttpMetricsSourceBuilder {
        HttpMetricsSourceBuilder::new(base_url)
    }

    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }

    async fn fetch(&self, path: &str) -> std::result::Result<PerformanceMetrics, MetricsSourceError> {
        let url = format!("{}/{}", self.config.base_url, path);
        let resp = self.client.get(&url).send().await.map_err(|e| MetricsSourceError::Connect {
            url: url.clone(),
            detail: e.to_string(),
        })?;

        if !resp.status().is_success() {
            return Err(MetricsSourceError::Http { status: resp.status().as_u16(), url });
        }

        let bytes = resp.bytes().await.map_err(|e| MetricsSourceError::Json {
            url: url.clone(),
            detail: e.to_string(),
        })?;

        parse_snapshot(&bytes, &url)
    }
}

#[async_trait]
impl MetricsSource for HttpMetricsSource {
    async fn current(&self) -> Result<PerformanceMetrics> {
        Ok(self.fetch("metrics/current").await?)
    }

    async fn baseline(&self) -> Result<PerformanceMetrics> {
        Ok(self.fetch("metrics/baseline").await?)
    }
}

/// Builder for [`HttpMetricsSource`].
pub struct HttpMetricsSourceBuilder {
    config: HttpMetricsConfig,
}

impl HttpMetricsSourceBuilder {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self { config: HttpMetricsConfig::new(base_url) }
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    pub fn build(self) -> HttpMetricsSource {
        // Client construction only fails in exotic TLS environments; fall
        // back to the default client there.
        let client = reqwest::Client::builder()
            .connect_timeout(self.config.connect_timeout)
            .timeout(self.config.request_timeout)
            .build()
            .unwrap_or_default();
        HttpMetricsSource { config: self.config, client }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
