use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio_util::sync::CancellationToken;

/// Delay policy for exponential backoff with jitter.
///
/// Delays below `min_attempts` are pinned to `min_delay`; beyond that they
/// grow as `base_delay * exponent^attempt`, capped at `max_delay`, then
/// fuzzed by a uniform factor in `[1 - jitter/2, 1 + jitter/2]` so that many
/// agent instances retrying against the same backend do not fire in lockstep.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub exponent: f64,
    pub max_delay: Duration,
    pub min_delay: Duration,
    pub min_attempts: u32,
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            exponent: 2.2,
            max_delay: Duration::from_secs(5 * 60),
            min_delay: Duration::from_millis(10),
            min_attempts: 2,
            jitter: 0.5,
        }
    }
}

/// Schedules a single deferred task with exponential backoff.
///
/// At most one task is pending per instance: `schedule` supersedes whatever
/// was armed before it. This is a debounce, not a queue.
pub struct Retry {
    policy: RetryPolicy,
    pending: Mutex<Option<CancellationToken>>,
}

impl Retry {
    /// Creates a scheduler with the given policy.
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            pending: Mutex::new(None),
        }
    }

    /// Computes the backoff delay for the given attempt number.
    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt < self.policy.min_attempts {
            return self.policy.min_delay;
        }

        let raw = (self.policy.base_delay.as_millis() as f64
            * self.policy.exponent.powi(attempt as i32))
        .min(self.policy.max_delay.as_millis() as f64);

        let factor =
            rand::thread_rng().gen::<f64>() * self.policy.jitter + (1.0 - self.policy.jitter / 2.0);

        Duration::from_millis((raw * factor).ceil() as u64)
    }

    /// Arms `task` to run after the backoff delay for `attempt`, cancelling
    /// any previously pending task on this instance. Returns the delay.
    pub fn schedule<F>(&self, attempt: u32, task: F) -> Duration
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let delay = self.delay(attempt);
        let token = CancellationToken::new();

        if let Some(prev) = self.pending.lock().replace(token.clone()) {
            prev.cancel();
        }

        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    task.await;
                }
            }
        });

        delay
    }

    /// Cancels any pending task. Idempotent.
    pub fn cancel(&self) {
        if let Some(token) = self.pending.lock().take() {
            token.cancel();
        }
    }
}

impl std::fmt::Debug for Retry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Retry").field("policy", &self.policy).finish()
    }
}
