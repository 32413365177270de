use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Event-loop health as reported by a lag sampler.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoopStatus {
    /// Percentage (0-100) of elapsed time the loop spent stalled.
    pub pct_block: f64,
    /// Total stall time observed, in milliseconds.
    pub total_lag_ms: f64,
    /// Wall time covered by the observation, in milliseconds.
    pub elapsed_ms: f64,
}

/// Samples scheduling delay of the async runtime.
pub trait EventLoopProbe: Send + Sync {
    /// Current blocking summary.
    fn status(&self) -> LoopStatus;

    /// Takes the stall durations observed since the previous drain.
    fn drain_lag(&self) -> Vec<Duration>;
}

/// Cumulative garbage-collector pause totals in milliseconds.
#[derive(Debug, Clone, Copy, Default)]
pub struct GcTotals {
    pub major_ms: f64,
    pub minor_ms: f64,
    pub incremental_ms: f64,
    pub weak_cb_ms: f64,
}

/// Pause-duration counters for a managed heap embedded in the process.
pub trait GcProbe: Send + Sync {
    /// Current cumulative totals.
    fn totals(&self) -> GcTotals;

    /// Zeroes all counters.
    fn reset(&self);
}

/// Process memory figures in bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryStats {
    pub rss: u64,
    pub heap_total: u64,
    pub heap_used: u64,
    pub external: u64,
    pub array_buffers: u64,
}

/// Process-level introspection: memory and outstanding work items.
pub trait ProcessProbe: Send + Sync {
    fn memory(&self) -> MemoryStats;
    fn active_handles(&self) -> usize;
    fn active_requests(&self) -> usize;
}

/// Measures runtime scheduling lag by timing how far a periodic timer
/// overshoots its interval.
///
/// A tick that lands late by more than [`LAG_THRESHOLD`] is recorded as a
/// stall and contributes to `pct_block` until the sampler is stopped.
pub struct LagSampler {
    interval: Duration,
    stalls: Arc<Mutex<Vec<Duration>>>,
    total_lag_ns: Arc<AtomicU64>,
    started_at: Arc<Mutex<Option<Instant>>>,
    running: Arc<AtomicBool>,
    cancel: CancellationToken,
}

/// Minimum overshoot counted as a stall.
const LAG_THRESHOLD: Duration = Duration::from_millis(1);

impl LagSampler {
    /// Creates a sampler that checks the timer every `interval`.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            stalls: Arc::new(Mutex::new(Vec::new())),
            total_lag_ns: Arc::new(AtomicU64::new(0)),
            started_at: Arc::new(Mutex::new(None)),
            running: Arc::new(AtomicBool::new(false)),
            cancel: CancellationToken::new(),
        }
    }

    /// Starts the background measurement task.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return; // Already running.
        }

        *self.started_at.lock() = Some(Instant::now());
        self.total_lag_ns.store(0, Ordering::Relaxed);

        let interval = self.interval;
        let stalls = Arc::clone(&self.stalls);
        let total_lag_ns = Arc::clone(&self.total_lag_ns);
        let cancel = self.cancel.clone();

        debug!(interval_ms = interval.as_millis() as u64, "lag sampler started");

        tokio::spawn(async move {
            let mut last = Instant::now();

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("lag sampler stopped");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        let overshoot = last.elapsed().saturating_sub(interval);
                        if overshoot >= LAG_THRESHOLD {
                            total_lag_ns.fetch_add(
                                overshoot.as_nanos() as u64,
                                Ordering::Relaxed,
                            );
                            stalls.lock().push(overshoot);
                        }
                        last = Instant::now();
                    }
                }
            }
        });
    }

    /// Stops measurement. Status reads return zeros afterwards.
    pub fn stop(&self) {
        self.cancel.cancel();
        self.running.store(false, Ordering::SeqCst);
        *self.started_at.lock() = None;
    }

    #[cfg(test)]
    fn record_stall(&self, lag: Duration) {
        self.total_lag_ns
            .fetch_add(lag.as_nanos() as u64, Ordering::Relaxed);
        self.stalls.lock().push(lag);
    }
}

impl EventLoopProbe for LagSampler {
    fn status(&self) -> LoopStatus {
        let Some(started_at) = *self.started_at.lock() else {
            return LoopStatus::default();
        };

        let elapsed_ms = started_at.elapsed().as_secs_f64() * 1000.0;
        let total_lag_ms = self.total_lag_ns.load(Ordering::Relaxed) as f64 / 1_000_000.0;

        let pct_block = if elapsed_ms > 0.0 {
            (total_lag_ms / elapsed_ms * 100.0).min(100.0)
        } else {
            0.0
        };

        LoopStatus {
            pct_block,
            total_lag_ms,
            elapsed_ms,
        }
    }

    fn drain_lag(&self) -> Vec<Duration> {
        std::mem::take(&mut *self.stalls.lock())
    }
}

/// Pause-kind identifiers accepted by [`GcTally::record`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcKind {
    Major,
    Minor,
    Incremental,
    WeakCallback,
}

/// Atomic pause accumulators an embedding runtime feeds from its own GC
/// hooks. Durations are stored as microseconds to keep the counters lock
/// free while preserving sub-millisecond pauses.
#[derive(Debug, Default)]
pub struct GcTally {
    major_us: AtomicU64,
    minor_us: AtomicU64,
    incremental_us: AtomicU64,
    weak_cb_us: AtomicU64,
}

impl GcTally {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one pause of the given kind.
    pub fn record(&self, kind: GcKind, duration: Duration) {
        let us = duration.as_micros() as u64;
        let counter = match kind {
            GcKind::Major => &self.major_us,
            GcKind::Minor => &self.minor_us,
            GcKind::Incremental => &self.incremental_us,
            GcKind::WeakCallback => &self.weak_cb_us,
        };
        counter.fetch_add(us, Ordering::Relaxed);
    }
}

impl GcProbe for GcTally {
    fn totals(&self) -> GcTotals {
        GcTotals {
            major_ms: self.major_us.load(Ordering::Relaxed) as f64 / 1000.0,
            minor_ms: self.minor_us.load(Ordering::Relaxed) as f64 / 1000.0,
            incremental_ms: self.incremental_us.load(Ordering::Relaxed) as f64 / 1000.0,
            weak_cb_ms: self.weak_cb_us.load(Ordering::Relaxed) as f64 / 1000.0,
        }
    }

    fn reset(&self) {
        self.major_us.store(0, Ordering::Relaxed);
        self.minor_us.store(0, Ordering::Relaxed);
        self.incremental_us.store(0, Ordering::Relaxed);
        self.weak_cb_us.store(0, Ordering::Relaxed);
    }
}

/// Process probe backed by /proc/self. Heap figures are zero unless the
/// embedding runtime reports a managed heap of its own.
#[derive(Debug, Default)]
pub struct HostProcessProbe;

impl HostProcessProbe {
    pub fn new() -> Self {
        Self
    }
}

impl ProcessProbe for HostProcessProbe {
    fn memory(&self) -> MemoryStats {
        MemoryStats {
            rss: read_self_rss_bytes().unwrap_or(0),
            ..MemoryStats::default()
        }
    }

    fn active_handles(&self) -> usize {
        0
    }

    fn active_requests(&self) -> usize {
        0
    }
}

fn read_self_rss_bytes() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    parse_status_kb_bytes(&status, "VmRSS:")
}

fn parse_status_kb_bytes(status: &str, key: &str) -> Option<u64> {
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix(key) {
            let mut parts = rest.split_whitespace();
            return parts
                .next()?
                .parse::<u64>()
                .ok()
                .map(|kb| kb.saturating_mul(1024));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gc_tally_accumulates_and_resets() {
        let tally = GcTally::new();
        tally.record(GcKind::Major, Duration::from_millis(12));
        tally.record(GcKind::Major, Duration::from_millis(8));
        tally.record(GcKind::Minor, Duration::from_micros(1500));
        tally.record(GcKind::Incremental, Duration::from_millis(3));
        tally.record(GcKind::WeakCallback, Duration::from_millis(1));

        let totals = tally.totals();
        assert_eq!(totals.major_ms, 20.0);
        assert_eq!(totals.minor_ms, 1.5);
        assert_eq!(totals.incremental_ms, 3.0);
        assert_eq!(totals.weak_cb_ms, 1.0);

        tally.reset();
        let totals = tally.totals();
        assert_eq!(totals.major_ms, 0.0);
        assert_eq!(totals.minor_ms, 0.0);
        assert_eq!(totals.incremental_ms, 0.0);
        assert_eq!(totals.weak_cb_ms, 0.0);
    }

    #[test]
    fn test_parse_status_rss() {
        let status = "Name:\tvigil\nVmSize:\t  200000 kB\nVmRSS:\t   51200 kB\nThreads:\t8\n";
        assert_eq!(
            parse_status_kb_bytes(status, "VmRSS:"),
            Some(51200 * 1024),
        );
        assert_eq!(parse_status_kb_bytes(status, "VmSwap:"), None);
    }

    #[test]
    fn test_lag_sampler_idle_status() {
        let sampler = LagSampler::new(Duration::from_millis(100));
        let status = sampler.status();
        assert_eq!(status.pct_block, 0.0);
        assert_eq!(status.total_lag_ms, 0.0);
    }

    #[tokio::test]
    async fn test_lag_sampler_records_and_drains_stalls() {
        let sampler = LagSampler::new(Duration::from_millis(100));
        *sampler.started_at.lock() = Some(Instant::now() - Duration::from_secs(1));

        sampler.record_stall(Duration::from_millis(150));
        sampler.record_stall(Duration::from_millis(50));

        let status = sampler.status();
        assert!(status.total_lag_ms >= 200.0);
        assert!(status.pct_block > 0.0);

        let drained = sampler.drain_lag();
        assert_eq!(drained.len(), 2);
        assert!(sampler.drain_lag().is_empty());
    }

    #[tokio::test]
    async fn test_lag_sampler_stop_zeroes_status() {
        let sampler = LagSampler::new(Duration::from_millis(50));
        sampler.start();
        tokio::time::sleep(Duration::from_millis(120)).await;
        sampler.stop();

        let status = sampler.status();
        assert_eq!(status.pct_block, 0.0);
        assert_eq!(status.elapsed_ms, 0.0);
    }

    #[test]
    fn test_host_process_probe_reports_rss() {
        let probe = HostProcessProbe::new();
        let memory = probe.memory();
        // Running under any Linux test environment the agent has an RSS.
        assert!(memory.rss > 0);
        assert_eq!(memory.heap_used, 0);
    }
}
