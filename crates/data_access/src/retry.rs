//! Bounded exponential backoff.
//!
//! Used by the subscription manager to reconnect and, on caller opt-in, to
//! repeat idempotent reads. Writes never go through [`retry_read`].

use std::{future::Future, time::Duration};

use crate::error::Result;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Backoff {
    /// Delay before the first retry.
    pub initial: Duration,
    /// Upper bound of a single delay.
    pub max: Duration,
    /// Retries allowed after the first failure.
    pub max_attempts: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(30),
            max_attempts: 8,
        }
    }
}

impl Backoff {
    /// Delay before retry number `attempt` (1-based): `initial * 2^(attempt-1)`
    /// capped at `max`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.initial
            .checked_mul(1u32 << exponent)
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

/// Runs `op` until it succeeds, fails with a non-retryable error, or the
/// attempts allowed by `backoff` are used up.
pub async fn retry_read<T, F, Fut>(backoff: &Backoff, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < backoff.max_attempts => {
                attempt += 1;
                let delay = backoff.delay(attempt);
                tracing::warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "read failed, retrying: {err}"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}
