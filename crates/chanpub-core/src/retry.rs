//! Bounded retries with exponential backoff around external calls.
//!
//! Every attempt runs under a fixed per-call timeout that is independent of the
//! backoff schedule. A timed-out attempt counts as a transient failure.

use std::{future::Future, time::Duration};

use tokio::time::{sleep, timeout};

use crate::{errors::Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            call_timeout: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, given that `attempt` (1-based) failed.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exp)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails terminally, or attempts run out.
    ///
    /// `op` receives the 1-based attempt number. A server `retry_after` hint
    /// replaces the computed backoff and is honored in full; `max_delay` only
    /// caps the computed schedule.
    pub async fn run<T, F, Fut>(&self, op_name: &str, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let err = match timeout(self.call_timeout, op(attempt)).await {
                Ok(Ok(v)) => {
                    if attempt > 1 {
                        tracing::debug!(op = op_name, attempt, "succeeded after retry");
                    }
                    return Ok(v);
                }
                Ok(Err(e)) => e,
                Err(_) => Error::transient(format!(
                    "{op_name} timed out after {}ms",
                    self.call_timeout.as_millis()
                )),
            };

            if !err.is_retryable() {
                return Err(err);
            }
            if attempt >= max_attempts {
                tracing::warn!(op = op_name, attempts = attempt, error = %err, "retries exhausted");
                return Err(Error::RetryExhausted {
                    attempts: attempt,
                    last: err.to_string(),
                });
            }

            let delay = err.retry_after().unwrap_or_else(|| self.backoff(attempt));
            tracing::info!(
                op = op_name,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying after transient failure"
            );
            sleep(delay).await;
        }
    }
}
