//! Exponential backoff retry policy with randomized jitter.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::IndexerError;

/// Lower bound of the jitter factor.
const JITTER_MIN: f64 = 0.8;
/// Upper bound (exclusive) of the jitter factor.
const JITTER_MAX: f64 = 1.2;

/// Retry policy applied to write jobs.
///
/// The delay before retry `n` (0-based) is
/// `min(min_backoff + (2^n - 1) * jitter * delta_backoff, max_backoff)`
/// with `jitter` drawn uniformly from `[0.8, 1.2)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExponentialBackoff {
    /// Maximum number of retries (not counting the first attempt).
    pub max_retries: u32,
    pub min_backoff: Duration,
    /// Cap on any single delay.
    pub max_backoff: Duration,
    /// Step that grows exponentially with the retry count.
    pub delta_backoff: Duration,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            max_retries: 15,
            min_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            delta_backoff: Duration::from_millis(200),
        }
    }
}

impl ExponentialBackoff {
    pub fn new(
        max_retries: u32,
        min_backoff: Duration,
        max_backoff: Duration,
        delta_backoff: Duration,
    ) -> Self {
        Self {
            max_retries,
            min_backoff,
            max_backoff,
            delta_backoff,
        }
    }

    /// Deterministic delay for `retry` with a fixed `jitter` factor.
    pub fn delay(&self, retry: u32, jitter: f64) -> Duration {
        let growth = 2f64.powi(retry.min(62) as i32) - 1.0;
        let extra = self.delta_backoff.as_secs_f64() * growth * jitter.max(0.0);
        if !extra.is_finite() || extra >= self.max_backoff.as_secs_f64() {
            return self.max_backoff;
        }
        self.min_backoff
            .saturating_add(Duration::from_secs_f64(extra))
            .min(self.max_backoff)
    }

    /// Randomized delay before retry `retry`, `None` once retries are used up.
    pub fn next_delay(&self, retry: u32) -> Option<Duration> {
        if retry >= self.max_retries {
            return None;
        }
        let jitter = rand::thread_rng().gen_range(JITTER_MIN..JITTER_MAX);
        Some(self.delay(retry, jitter))
    }

    /// Run `op` until it succeeds or retries are exhausted.
    ///
    /// The last error is returned unchanged. Fatal errors are returned
    /// immediately without retrying.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T, IndexerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, IndexerError>>,
    {
        let mut retry = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => match self.next_delay(retry) {
                    Some(delay) => {
                        tracing::warn!(
                            retry = retry + 1,
                            max_retries = self.max_retries,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "operation failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        retry += 1;
                    }
                    None => return Err(e),
                },
            }
        }
    }
}
