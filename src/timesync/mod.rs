use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use arc_swap::ArcSwap;
use rand::Rng;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::retry::{Retry, RetryPolicy};

/// Path on the collector endpoint that answers with its current epoch
/// milliseconds as plain text.
const SYNC_PATH: &str = "/simplentp/sync";

/// Request attempts per synchronization round before falling back to a
/// full resync cycle.
const MAX_REQUEST_ATTEMPTS: u32 = 5;

/// Precondition violations for the server-time request path.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TimeSyncError {
    #[error("server time requires a configured endpoint")]
    MissingEndpoint,
    #[error("server time requires time sync to be enabled")]
    Disabled,
}

/// Last known clock offset. Replaced wholesale on every successful round so
/// readers never observe a half-written update.
#[derive(Debug, Clone, Copy)]
struct OffsetState {
    offset_ms: f64,
    synced: bool,
}

/// Keeps local wall-clock time aligned with the collector's clock.
///
/// A successful round measures one request round trip, halves it as the
/// network delay estimate and derives `offset = server_start - client_start`.
/// Request failures back off on a short cycle; after
/// [`MAX_REQUEST_ATTEMPTS`] consecutive failures the round is abandoned and
/// a whole new round is scheduled on the long resync cycle. The last good
/// offset is never rolled back.
pub struct TimeSync {
    endpoint: Option<String>,
    enabled: bool,
    http: reqwest::Client,
    offset: ArcSwap<OffsetState>,
    resync_count: AtomicU32,
    request_retry: Retry,
    resync_retry: Retry,
}

impl TimeSync {
    /// Creates a new synchronizer. An empty endpoint leaves it unconfigured:
    /// `sync` becomes a no-op and `server_time` an error.
    pub fn new(endpoint: &str, enabled: bool, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building time sync HTTP client")?;

        let endpoint = if endpoint.is_empty() {
            None
        } else {
            Some(endpoint.trim_end_matches('/').to_string())
        };

        Ok(Self {
            endpoint,
            enabled,
            http,
            offset: ArcSwap::from_pointee(OffsetState {
                offset_ms: 0.0,
                synced: false,
            }),
            resync_count: AtomicU32::new(0),
            request_retry: Retry::new(RetryPolicy {
                base_delay: Duration::from_secs(20),
                max_delay: Duration::from_secs(60),
                min_delay: Duration::ZERO,
                min_attempts: 1,
                ..RetryPolicy::default()
            }),
            resync_retry: Retry::new(RetryPolicy {
                base_delay: Duration::from_secs(60),
                max_delay: Duration::from_secs(10 * 60),
                min_attempts: 0,
                ..RetryPolicy::default()
            }),
        })
    }

    /// Current local epoch milliseconds.
    pub fn local_now_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    /// Local now adjusted by the rounded offset.
    pub fn now(&self) -> i64 {
        Self::local_now_ms() + self.offset.load().offset_ms.round() as i64
    }

    /// Converts an already-recorded local timestamp to collector time.
    pub fn sync_time(&self, local_ms: i64) -> i64 {
        local_ms + self.offset.load().offset_ms.ceil() as i64
    }

    /// Whether at least one round has completed successfully.
    pub fn synced(&self) -> bool {
        self.offset.load().synced
    }

    /// Current offset estimate in milliseconds.
    pub fn offset_ms(&self) -> f64 {
        self.offset.load().offset_ms
    }

    /// Starts a synchronization round. No-op when disabled or unconfigured.
    pub fn sync(self: Arc<Self>) {
        if !self.enabled || self.endpoint.is_none() {
            debug!("time sync disabled or unconfigured, skipping");
            return;
        }

        debug!("starting time sync round");
        self.spawn_attempt(0);
    }

    /// Cancels any pending retry or resync timers.
    pub fn stop(&self) {
        self.request_retry.cancel();
        self.resync_retry.cancel();
    }

    /// Fetches the collector's current epoch milliseconds.
    ///
    /// Calling this while disabled or unconfigured is a caller bug and fails
    /// with an explicit error rather than being silently ignored.
    pub async fn server_time(&self) -> Result<i64> {
        if !self.enabled {
            return Err(TimeSyncError::Disabled.into());
        }
        let Some(endpoint) = &self.endpoint else {
            return Err(TimeSyncError::MissingEndpoint.into());
        };

        let url = format!(
            "{endpoint}{SYNC_PATH}?noCache={}-{}",
            Self::local_now_ms(),
            rand::thread_rng().gen::<u32>(),
        );

        let response = self
            .http
            .get(&url)
            .header("Accept", "application/json")
            .send()
            .await
            .context("requesting server time")?;

        let status = response.status();
        if !status.is_success() {
            bail!("unexpected status {status} from time endpoint");
        }

        let body = response.text().await.context("reading server time body")?;
        body.trim()
            .parse::<i64>()
            .with_context(|| format!("parsing server time {body:?}"))
    }

    fn spawn_attempt(self: Arc<Self>, attempt: u32) {
        if attempt >= MAX_REQUEST_ATTEMPTS {
            warn!(
                attempts = MAX_REQUEST_ATTEMPTS,
                "time sync round failed, scheduling full resync",
            );
            self.schedule_resync();
            return;
        }

        let this = Arc::clone(&self);
        let delay = self
            .request_retry
            .schedule(attempt, async move { this.run_attempt(attempt).await });
        debug!(attempt, delay_ms = delay.as_millis() as u64, "time sync attempt scheduled");
    }

    async fn run_attempt(self: Arc<Self>, attempt: u32) {
        // Warm the connection and DNS cache so the measured request below
        // sees a representative round trip.
        if let Err(e) = self.server_time().await {
            debug!(error = %e, attempt, "time sync warm-up request failed");
            self.spawn_attempt(attempt + 1);
            return;
        }

        let client_start = Self::local_now_ms();
        match self.server_time().await {
            Ok(server_time) => {
                let network_delay = (Self::local_now_ms() - client_start) as f64 / 2.0;
                let offset = (server_time as f64 - network_delay) - client_start as f64;
                self.offset.store(Arc::new(OffsetState {
                    offset_ms: offset,
                    synced: true,
                }));
                info!(offset_ms = offset, "clock offset updated");
                self.schedule_resync();
            }
            Err(e) => {
                debug!(error = %e, attempt, "time sync request failed");
                self.spawn_attempt(attempt + 1);
            }
        }
    }

    /// Schedules the next full round on the long cycle. The attempt counter
    /// advances across rounds, not per request.
    fn schedule_resync(self: Arc<Self>) {
        let round = self.resync_count.fetch_add(1, Ordering::Relaxed);
        let this = Arc::clone(&self);
        self.resync_retry.schedule(round, async move { this.sync() });
    }
}

impl std::fmt::Debug for TimeSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.offset.load();
        f.debug_struct("TimeSync")
            .field("endpoint", &self.endpoint)
            .field("enabled", &self.enabled)
            .field("offset_ms", &state.offset_ms)
            .field("synced", &state.synced)
            .finish()
    }
}
