use std::time::{Duration, Instant};

use serde::Serialize;

/// One point of process CPU utilization. Ratios are in [0,1]; the payload
/// surfaces the latest point scaled to percent.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct CpuHistoryEntry {
    /// Epoch milliseconds the sample was taken at.
    pub time: i64,
    /// Combined user+system utilization.
    pub usage: f64,
    /// User-time share of elapsed wall time.
    pub user: f64,
    /// System-time share of elapsed wall time.
    pub sys: f64,
}

/// Computes per-interval CPU utilization from cumulative rusage counters.
#[derive(Debug)]
pub struct CpuSampler {
    last_wall: Instant,
    last_user: Duration,
    last_sys: Duration,
}

impl CpuSampler {
    pub fn new() -> Self {
        let (user, sys) = cpu_times();
        Self {
            last_wall: Instant::now(),
            last_user: user,
            last_sys: sys,
        }
    }

    /// Measures utilization since the previous sample and rebases.
    pub fn sample(&mut self, now_ms: i64) -> CpuHistoryEntry {
        let elapsed = self.last_wall.elapsed();
        let (user, sys) = cpu_times();

        let user_delta = user.saturating_sub(self.last_user);
        let sys_delta = sys.saturating_sub(self.last_sys);

        let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
        let (usage, user_ratio, sys_ratio) = if elapsed_ms > 0.0 {
            let user_ms = user_delta.as_secs_f64() * 1000.0;
            let sys_ms = sys_delta.as_secs_f64() * 1000.0;
            (
                (user_ms + sys_ms) / elapsed_ms,
                user_ms / elapsed_ms,
                sys_ms / elapsed_ms,
            )
        } else {
            (0.0, 0.0, 0.0)
        };

        self.last_wall = Instant::now();
        self.last_user = user;
        self.last_sys = sys;

        CpuHistoryEntry {
            time: now_ms,
            usage,
            user: user_ratio,
            sys: sys_ratio,
        }
    }
}

impl Default for CpuSampler {
    fn default() -> Self {
        Self::new()
    }
}

/// Cumulative (user, system) CPU time of this process.
fn cpu_times() -> (Duration, Duration) {
    let mut usage = std::mem::MaybeUninit::<libc::rusage>::zeroed();
    // SAFETY: `getrusage(RUSAGE_SELF, ...)` only writes into the provided
    // struct and is thread-safe.
    let rc = unsafe { libc::getrusage(libc::RUSAGE_SELF, usage.as_mut_ptr()) };
    if rc != 0 {
        return (Duration::ZERO, Duration::ZERO);
    }

    // SAFETY: getrusage returned success, so the struct is initialized.
    let usage = unsafe { usage.assume_init() };
    (timeval_duration(usage.ru_utime), timeval_duration(usage.ru_stime))
}

fn timeval_duration(tv: libc::timeval) -> Duration {
    Duration::from_secs(tv.tv_sec.max(0) as u64) + Duration::from_micros(tv.tv_usec.max(0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_times_are_monotonic() {
        let (user_a, sys_a) = cpu_times();
        // Burn a little CPU so the counters move.
        let mut acc = 0u64;
        for i in 0..2_000_000u64 {
            acc = acc.wrapping_add(i).rotate_left(7);
        }
        std::hint::black_box(acc);

        let (user_b, sys_b) = cpu_times();
        assert!(user_b >= user_a);
        assert!(sys_b >= sys_a);
    }

    #[test]
    fn test_sample_produces_bounded_ratios() {
        let mut sampler = CpuSampler::new();
        std::thread::sleep(Duration::from_millis(20));

        let entry = sampler.sample(1_700_000_000_000);
        assert_eq!(entry.time, 1_700_000_000_000);
        assert!(entry.usage >= 0.0);
        assert!(entry.user >= 0.0);
        assert!(entry.sys >= 0.0);
        // user and sys are both shares of the same elapsed window.
        assert!((entry.user + entry.sys - entry.usage).abs() < 1e-9);
    }

    #[test]
    fn test_sample_rebases_window() {
        let mut sampler = CpuSampler::new();
        std::thread::sleep(Duration::from_millis(10));
        let _ = sampler.sample(0);

        // Immediately after a sample the window restarts; a mostly-sleeping
        // single-threaded test cannot saturate it.
        std::thread::sleep(Duration::from_millis(10));
        let entry = sampler.sample(1);
        assert!(entry.usage < 2.0);
    }
}
