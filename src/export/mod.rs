pub mod health;

use std::collections::HashMap;
use std::io::Write;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::debug;

use crate::metrics::snapshot::MetricsPayload;

/// Request-body compression applied to snapshot uploads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    None,
    #[default]
    Gzip,
    Zstd,
    Zlib,
    Snappy,
}

impl Compression {
    /// Encodes `data` with this algorithm.
    pub fn encode(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Self::None => Ok(data.to_vec()),
            Self::Gzip => {
                use flate2::write::GzEncoder;
                let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
                encoder.write_all(data).context("gzip write")?;
                encoder.finish().context("gzip finish")
            }
            Self::Zstd => zstd::encode_all(data, 0).context("zstd encode"),
            Self::Zlib => {
                use flate2::write::ZlibEncoder;
                let mut encoder = ZlibEncoder::new(Vec::new(), flate2::Compression::default());
                encoder.write_all(data).context("zlib write")?;
                encoder.finish().context("zlib finish")
            }
            Self::Snappy => {
                let mut encoder = snap::raw::Encoder::new();
                encoder.compress_vec(data).context("snappy encode")
            }
        }
    }

    /// The Content-Encoding header value, if the algorithm carries one.
    pub fn content_encoding(&self) -> Option<&'static str> {
        match self {
            Self::None => None,
            Self::Gzip => Some("gzip"),
            Self::Zstd => Some("zstd"),
            Self::Zlib => Some("deflate"),
            Self::Snappy => Some("snappy"),
        }
    }
}

/// Connection settings for the remote collector.
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// Base collector URL; snapshots go to `{endpoint}/metrics`.
    pub endpoint: String,
    /// Application credentials sent as headers. The handshake beyond these
    /// headers belongs to the collector, not this client.
    pub app_id: String,
    pub app_secret: String,
    /// Additional headers attached to every upload.
    pub headers: HashMap<String, String>,
    pub compression: Compression,
    pub timeout: Duration,
    /// Host identity reported alongside the payload.
    pub hostname: String,
}

/// HTTP client that posts snapshot payloads to the remote collector.
pub struct CollectorClient {
    http: reqwest::Client,
    cfg: CollectorConfig,
}

impl CollectorClient {
    /// Builds the client. Fails when the endpoint is empty.
    pub fn new(cfg: CollectorConfig) -> Result<Self> {
        if cfg.endpoint.is_empty() {
            bail!("collector endpoint must be configured");
        }

        let http = reqwest::Client::builder()
            .timeout(cfg.timeout)
            .build()
            .context("building collector HTTP client")?;

        Ok(Self { http, cfg })
    }

    /// Posts one snapshot payload. Transient failures are returned to the
    /// caller; the next report tick is the retry.
    pub async fn send(&self, payload: &MetricsPayload) -> Result<()> {
        let body = serde_json::to_vec(payload).context("serializing metrics payload")?;
        let raw_len = body.len();

        let compressed = self
            .cfg
            .compression
            .encode(&body)
            .context("compressing metrics payload")?;

        let url = format!("{}/metrics", self.cfg.endpoint.trim_end_matches('/'));
        let mut request = self
            .http
            .post(&url)
            .header("Content-Type", "application/json")
            .body(compressed);

        if let Some(encoding) = self.cfg.compression.content_encoding() {
            request = request.header("Content-Encoding", encoding);
        }

        if !self.cfg.app_id.is_empty() {
            request = request.header("X-App-Id", &self.cfg.app_id);
        }
        if !self.cfg.app_secret.is_empty() {
            request = request.header("X-App-Secret", &self.cfg.app_secret);
        }
        if !self.cfg.hostname.is_empty() {
            request = request.header("X-Agent-Hostname", &self.cfg.hostname);
        }

        for (key, value) in &self.cfg.headers {
            request = request.header(key.as_str(), value.as_str());
        }

        let response = request.send().await.context("sending metrics payload")?;

        let status = response.status();
        // Drain the body so the connection can be reused.
        let _ = response.bytes().await;

        if !status.is_success() {
            bail!("collector returned unexpected status: {status}");
        }

        debug!(bytes = raw_len, "snapshot exported");

        Ok(())
    }
}

impl std::fmt::Debug for CollectorClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectorClient")
            .field("endpoint", &self.cfg.endpoint)
            .field("compression", &self.cfg.compression)
            .finish()
    }
}
