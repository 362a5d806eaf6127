use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::core::errors::{ProvisionError, ProvisionResult};

/// Budget for the readiness gate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(with = "crate::config::duration_secs")]
    pub timeout: Duration,
    #[serde(with = "crate::config::duration_secs")]
    pub initial_interval: Duration,
    #[serde(with = "crate::config::duration_secs")]
    pub max_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(30),
        }
    }
}

/// Floor for both ends of the backoff.
pub const MIN_INTERVAL: Duration = Duration::from_millis(10);

impl RetryPolicy {
    pub fn backoff(&self) -> Backoff {
        Backoff {
            next: self.initial_interval.max(MIN_INTERVAL),
            max: self.max_interval.max(MIN_INTERVAL),
        }
    }
}

/// Doubling intervals, capped, never below [`MIN_INTERVAL`]. Never ends.
#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
    max: Duration,
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let current = self.next.min(self.max);
        self.next = current.saturating_mul(2).min(self.max);
        Some(current)
    }
}

/// Polls `probe` until it succeeds or `policy.timeout` has elapsed.
///
/// Sleeps between probes follow [`Backoff`], clipped to the time left so the
/// final probe lands on the deadline. Returns the time it took.
pub async fn await_reachable<F, Fut>(
    host: &str,
    policy: &RetryPolicy,
    mut probe: F,
) -> ProvisionResult<Duration>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = Instant::now();
    let mut backoff = policy.backoff();
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        if probe().await {
            let elapsed = start.elapsed();
            info!(host, attempts, elapsed_ms = elapsed.as_millis() as u64, "host reachable");
            return Ok(elapsed);
        }

        let elapsed = start.elapsed();
        if elapsed >= policy.timeout {
            warn!(host, attempts, "host never became reachable");
            return Err(ProvisionError::ReadinessTimeout {
                host: host.to_string(),
                elapsed,
            });
        }

        let interval = backoff.next().unwrap_or(policy.max_interval);
        let pause = interval.min(policy.timeout - elapsed);
        debug!(host, attempts, pause_ms = pause.as_millis() as u64, "not reachable yet");
        sleep(pause).await;
    }
}
