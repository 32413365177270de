pub mod cpu;
pub mod histogram;
pub mod session;
pub mod snapshot;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::probes::{EventLoopProbe, GcProbe, ProcessProbe};
use crate::sizecache::SizeCache;
use crate::timesync::TimeSync;

use self::cpu::{CpuHistoryEntry, CpuSampler};
use self::histogram::LagHistogram;
use self::session::{SessionActivity, SessionEventKind, SocketInfo};
use self::snapshot::SystemMetrics;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Aggregation behavior knobs.
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// How often process CPU utilization is sampled.
    pub cpu_sample_interval: Duration,
    /// Inactivity span after which a session counts as new again.
    pub session_timeout: Duration,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            cpu_sample_interval: Duration::from_millis(2000),
            session_timeout: Duration::from_secs(30 * 60),
        }
    }
}

/// State accumulated between snapshots. Everything here is read and reset
/// in one locked span so consecutive snapshots cover disjoint, contiguous
/// windows.
struct Window {
    start_time: i64,
    new_sessions: u64,
    cpu_history: Vec<CpuHistoryEntry>,
    lag: LagHistogram,
}

/// Owns the aggregation window between snapshots, the CPU sampling timer
/// and the session activity classifier.
pub struct Aggregator {
    cfg: AggregatorConfig,
    clock: Arc<TimeSync>,
    size_cache: Arc<SizeCache>,
    loop_probe: Arc<dyn EventLoopProbe>,
    gc_probe: Arc<dyn GcProbe>,
    process_probe: Arc<dyn ProcessProbe>,
    window: Arc<Mutex<Window>>,
    /// Last-active timestamps keyed by session ref.
    sessions: DashMap<String, i64>,
    running: AtomicBool,
    cancel: CancellationToken,
}

impl Aggregator {
    /// Wires the aggregator to its collaborators. All instances are passed
    /// in explicitly; nothing here reaches for process-global state.
    pub fn new(
        cfg: AggregatorConfig,
        clock: Arc<TimeSync>,
        size_cache: Arc<SizeCache>,
        loop_probe: Arc<dyn EventLoopProbe>,
        gc_probe: Arc<dyn GcProbe>,
        process_probe: Arc<dyn ProcessProbe>,
    ) -> Self {
        Self {
            cfg,
            clock,
            size_cache,
            loop_probe,
            gc_probe,
            process_probe,
            window: Arc::new(Mutex::new(Window {
                start_time: TimeSync::local_now_ms(),
                new_sessions: 0,
                cpu_history: Vec::new(),
                lag: LagHistogram::new(),
            })),
            sessions: DashMap::new(),
            running: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    /// Starts the CPU sampling timer.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return; // Already running.
        }

        let interval = self.cfg.cpu_sample_interval;
        let window = Arc::clone(&self.window);
        let size_cache = Arc::clone(&self.size_cache);
        let loop_probe = Arc::clone(&self.loop_probe);
        let cancel = self.cancel.clone();

        info!(
            interval_ms = interval.as_millis() as u64,
            "cpu sampler started",
        );

        tokio::spawn(async move {
            let mut sampler = CpuSampler::new();
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // Consume the immediate first tick so the first sample covers a
            // full interval.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("cpu sampler stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let entry = sampler.sample(TimeSync::local_now_ms());
                        Self::ingest_sample(&window, loop_probe.as_ref(), &size_cache, entry);
                    }
                }
            }
        });
    }

    /// Stops the sampling timer.
    pub fn stop(&self) {
        self.cancel.cancel();
        self.running.store(false, Ordering::SeqCst);
    }

    /// Appends one CPU sample, folds pending stall events into the lag
    /// histogram, and pushes the load signal into the size cache.
    fn ingest_sample(
        window: &Mutex<Window>,
        loop_probe: &dyn EventLoopProbe,
        size_cache: &SizeCache,
        entry: CpuHistoryEntry,
    ) {
        {
            let mut window = window.lock();
            for lag in loop_probe.drain_lag() {
                window.lag.record(lag);
            }
            window.cpu_history.push(entry);
        }

        size_cache.set_cpu_load(entry.usage * 100.0);
    }

    /// Classifies one inbound session event and updates the session's
    /// last-active timestamp.
    ///
    /// A connect without a prior session ref, or a subscribe/invoke on a
    /// session inactive longer than the timeout, counts as a new session -
    /// unless the socket originates from the local machine or a private
    /// network range.
    pub fn handle_session_activity(&self, activity: &SessionActivity) {
        let now = TimeSync::local_now_ms();

        match &activity.kind {
            SessionEventKind::Connect { prior_session } => {
                if prior_session.is_none() {
                    self.count_new_session(&activity.socket);
                }
            }
            SessionEventKind::Subscribe | SessionEventKind::Invoke => {
                if !self.is_session_active(&activity.session_ref, now) {
                    self.count_new_session(&activity.socket);
                }
            }
        }

        self.sessions.insert(activity.session_ref.clone(), now);
    }

    /// Number of sessions currently tracked.
    pub fn tracked_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Builds one snapshot and resets the window.
    ///
    /// The read is destructive: the new-session counter, lag histogram, GC
    /// totals and CPU history are all zeroed, and the window start rebases
    /// to now, so successive snapshots never overlap.
    pub fn build_snapshot(&self) -> SystemMetrics {
        let now = TimeSync::local_now_ms();

        let memory = self.process_probe.memory();
        let loop_status = self.loop_probe.status();

        let mut window = self.window.lock();

        let gc = self.gc_probe.totals();
        self.gc_probe.reset();

        let lag = std::mem::take(&mut window.lag);
        let cpu_history = std::mem::take(&mut window.cpu_history);
        let new_sessions = window.new_sessions;
        window.new_sessions = 0;
        let start_time = window.start_time;
        window.start_time = now;

        drop(window);

        // Idle session entries cannot count as active again, so drop them
        // to keep the registry bounded.
        let timeout_ms = self.cfg.session_timeout.as_millis() as i64;
        self.sessions.retain(|_, last_active| now - *last_active < timeout_ms);

        let (pcpu, pcpu_user, pcpu_system) = cpu_history
            .last()
            .map(|entry| (entry.usage * 100.0, entry.user * 100.0, entry.sys * 100.0))
            .unwrap_or((0.0, 0.0, 0.0));

        SystemMetrics {
            start_time: self.clock.sync_time(start_time),
            end_time: self.clock.sync_time(now),
            memory: memory.rss as f64 / BYTES_PER_MB,
            memory_array_buffers: memory.array_buffers as f64 / BYTES_PER_MB,
            memory_external: memory.external as f64 / BYTES_PER_MB,
            memory_heap_used: memory.heap_used as f64 / BYTES_PER_MB,
            memory_heap_total: memory.heap_total as f64 / BYTES_PER_MB,
            new_sessions,
            active_requests: self.process_probe.active_requests(),
            active_handles: self.process_probe.active_handles(),
            pct_evloop_block: loop_status.pct_block,
            evloop_histogram: lag.snapshot(),
            gc_major_duration: gc.major_ms,
            gc_minor_duration: gc.minor_ms,
            gc_incremental_duration: gc.incremental_ms,
            gc_weak_cb_duration: gc.weak_cb_ms,
            pcpu,
            pcpu_user,
            pcpu_system,
            cpu_history: cpu_history
                .into_iter()
                .map(|entry| CpuHistoryEntry {
                    time: self.clock.sync_time(entry.time),
                    ..entry
                })
                .collect(),
        }
    }

    fn is_session_active(&self, session_ref: &str, now: i64) -> bool {
        let timeout_ms = self.cfg.session_timeout.as_millis() as i64;
        self.sessions
            .get(session_ref)
            .map(|last_active| now - *last_active < timeout_ms)
            .unwrap_or(false)
    }

    fn count_new_session(&self, socket: &SocketInfo) {
        if session::is_local_socket(socket) {
            return;
        }
        self.window.lock().new_sessions += 1;
    }
}

impl std::fmt::Debug for Aggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Aggregator")
            .field("cfg", &self.cfg)
            .field("sessions", &self.sessions.len())
            .finish()
    }
}
