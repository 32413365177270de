use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::export::Compression;

/// Top-level configuration for the vigil agent.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Application id presented to the collector. Env: VIGIL_APP_ID.
    #[serde(default)]
    pub app_id: String,

    /// Application secret presented to the collector. Env: VIGIL_APP_SECRET.
    #[serde(default)]
    pub app_secret: String,

    /// Collector base URL; empty disables reporting and time sync.
    /// Env: VIGIL_ENDPOINT.
    #[serde(default)]
    pub endpoint: String,

    /// Host identity reported with each payload. Defaults to the machine
    /// hostname. Env: VIGIL_HOSTNAME.
    #[serde(default = "default_hostname")]
    pub hostname: String,

    /// How often a snapshot is built and exported. Default: 20s.
    #[serde(default = "default_report_interval", with = "humantime_serde")]
    pub report_interval: Duration,

    /// Clock synchronization configuration.
    #[serde(default)]
    pub time_sync: TimeSyncConfig,

    /// Document-size cache configuration.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Aggregation configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Snapshot export configuration.
    #[serde(default)]
    pub export: ExportConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Clock synchronization configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TimeSyncConfig {
    /// Enable periodic clock synchronization. Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Time request timeout. Default: 10s.
    #[serde(default = "default_time_sync_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for TimeSyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout: default_time_sync_timeout(),
        }
    }
}

/// Document-size cache configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Maximum query fingerprints held. Default: 100000.
    #[serde(default = "default_cache_max_entries")]
    pub max_entries: usize,

    /// Size measurements kept per fingerprint. Default: 10.
    #[serde(default = "default_cache_max_samples")]
    pub max_samples: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: default_cache_max_entries(),
            max_samples: default_cache_max_samples(),
        }
    }
}

/// Aggregation configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// CPU utilization sampling interval. Default: 2s.
    #[serde(default = "default_cpu_sample_interval", with = "humantime_serde")]
    pub cpu_sample_interval: Duration,

    /// Inactivity span after which a session counts as new. Default: 30m.
    #[serde(default = "default_session_timeout", with = "humantime_serde")]
    pub session_timeout: Duration,

    /// Event-loop lag sampling interval. Default: 200ms.
    #[serde(default = "default_lag_sample_interval", with = "humantime_serde")]
    pub lag_sample_interval: Duration,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            cpu_sample_interval: default_cpu_sample_interval(),
            session_timeout: default_session_timeout(),
            lag_sample_interval: default_lag_sample_interval(),
        }
    }
}

/// Snapshot export configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ExportConfig {
    /// Payload compression (none, gzip, zstd, zlib, snappy). Default: gzip.
    #[serde(default)]
    pub compression: Compression,

    /// Additional headers attached to every upload.
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Maximum duration for one upload. Default: 30s.
    #[serde(default = "default_export_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            compression: Compression::default(),
            headers: HashMap::new(),
            timeout: default_export_timeout(),
        }
    }
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: ":9090". Empty disables the server.
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

impl Config {
    /// Loads configuration from a YAML file and applies env overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let mut cfg: Config = serde_yaml::from_str(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Builds a configuration from defaults and env overrides only.
    pub fn from_env() -> Result<Self> {
        let mut cfg: Config = serde_yaml::from_str("{}").context("building default config")?;
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(app_id) = std::env::var("VIGIL_APP_ID") {
            self.app_id = app_id;
        }
        if let Ok(app_secret) = std::env::var("VIGIL_APP_SECRET") {
            self.app_secret = app_secret;
        }
        if let Ok(endpoint) = std::env::var("VIGIL_ENDPOINT") {
            self.endpoint = endpoint;
        }
        if let Ok(hostname) = std::env::var("VIGIL_HOSTNAME") {
            self.hostname = hostname;
        }
    }

    fn validate(&self) -> Result<()> {
        if self.report_interval.is_zero() {
            bail!("report_interval must be positive");
        }
        if self.cache.max_samples == 0 {
            bail!("cache.max_samples must be positive");
        }
        if self.cache.max_entries == 0 {
            bail!("cache.max_entries must be positive");
        }
        if self.metrics.cpu_sample_interval.is_zero() {
            bail!("metrics.cpu_sample_interval must be positive");
        }
        Ok(())
    }
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_hostname() -> String {
    machine_hostname().unwrap_or_default()
}

fn default_report_interval() -> Duration {
    Duration::from_secs(20)
}

fn default_true() -> bool {
    true
}

fn default_time_sync_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_cache_max_entries() -> usize {
    100_000
}

fn default_cache_max_samples() -> usize {
    10
}

fn default_cpu_sample_interval() -> Duration {
    Duration::from_millis(2000)
}

fn default_session_timeout() -> Duration {
    Duration::from_secs(30 * 60)
}

fn default_lag_sample_interval() -> Duration {
    Duration::from_millis(200)
}

fn default_export_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

/// Machine hostname via gethostname(2).
fn machine_hostname() -> Option<String> {
    let mut buf = [0u8; 256];
    // SAFETY: gethostname writes a NUL-terminated name into the provided
    // buffer and never reads beyond the given length.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
    if rc != 0 {
        return None;
    }

    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    std::str::from_utf8(&buf[..end]).ok().map(str::to_string)
}
