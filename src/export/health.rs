use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{Counter, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Prometheus metrics for agent health and self-observability.
///
/// All metrics use the "vigil" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Total snapshots exported to the collector.
    pub snapshots_sent: Counter,
    /// Total export attempts that failed.
    pub export_errors: Counter,
    /// Snapshot export duration.
    pub export_duration: Histogram,
    /// Whether the clock has completed at least one sync round (1=yes).
    pub clock_synced: Gauge,
    /// Current estimated clock offset in milliseconds.
    pub clock_offset_ms: Gauge,
    /// New sessions counted into the last exported window.
    pub window_new_sessions: Gauge,
    /// Query fingerprints currently held by the size cache.
    pub size_cache_entries: Gauge,
    /// Latest sampled process CPU utilization percentage.
    pub cpu_pct: Gauge,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let snapshots_sent = Counter::with_opts(
            Opts::new("snapshots_sent_total", "Snapshots exported to the collector.")
                .namespace("vigil"),
        )
        .context("creating snapshots_sent")?;
        registry
            .register(Box::new(snapshots_sent.clone()))
            .context("registering snapshots_sent")?;

        let export_errors = Counter::with_opts(
            Opts::new("export_errors_total", "Failed snapshot export attempts.")
                .namespace("vigil"),
        )
        .context("creating export_errors")?;
        registry
            .register(Box::new(export_errors.clone()))
            .context("registering export_errors")?;

        let export_duration = Histogram::with_opts(
            HistogramOpts::new("export_duration_seconds", "Snapshot export duration.")
                .namespace("vigil")
                .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]),
        )
        .context("creating export_duration")?;
        registry
            .register(Box::new(export_duration.clone()))
            .context("registering export_duration")?;

        let clock_synced = Gauge::with_opts(
            Opts::new("clock_synced", "Clock sync completed at least once (1=yes).")
                .namespace("vigil"),
        )
        .context("creating clock_synced")?;
        registry
            .register(Box::new(clock_synced.clone()))
            .context("registering clock_synced")?;

        let clock_offset_ms = Gauge::with_opts(
            Opts::new("clock_offset_ms", "Estimated clock offset in milliseconds.")
                .namespace("vigil"),
        )
        .context("creating clock_offset_ms")?;
        registry
            .register(Box::new(clock_offset_ms.clone()))
            .context("registering clock_offset_ms")?;

        let window_new_sessions = Gauge::with_opts(
            Opts::new("window_new_sessions", "New sessions in the last exported window.")
                .namespace("vigil"),
        )
        .context("creating window_new_sessions")?;
        registry
            .register(Box::new(window_new_sessions.clone()))
            .context("registering window_new_sessions")?;

        let size_cache_entries = Gauge::with_opts(
            Opts::new("size_cache_entries", "Fingerprints held by the size cache.")
                .namespace("vigil"),
        )
        .context("creating size_cache_entries")?;
        registry
            .register(Box::new(size_cache_entries.clone()))
            .context("registering size_cache_entries")?;

        let cpu_pct = Gauge::with_opts(
            Opts::new("cpu_pct", "Latest sampled process CPU utilization percentage.")
                .namespace("vigil"),
        )
        .context("creating cpu_pct")?;
        registry
            .register(Box::new(cpu_pct.clone()))
            .context("registering cpu_pct")?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            snapshots_sent,
            export_errors,
            export_duration,
            clock_synced,
            clock_offset_ms,
            window_new_sessions,
            size_cache_entries,
            cpu_pct,
        })
    }

    /// Starts the HTTP server for /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let registry = self.registry.clone();
        let app_state = Arc::new(AppState { registry });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(())
    }

    /// Stops the HTTP server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }
        Ok(())
    }
}

struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = state.registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "encoding metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "encoding error".to_string(),
        );
    }

    match String::from_utf8(buffer) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "converting metrics to string");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}
