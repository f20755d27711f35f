//! Bounded exponential-backoff retry around async operations.

use crate::error::LinkError;
use crate::events::metrics::EventMetrics;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Backoff parameters for a retry schedule.
///
/// After failure N (1-based), the next attempt runs after
/// `min(base_delay × backoff_multiplier^(N−1), max_delay)`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub backoff_multiplier: f64,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Delay scheduled after `failed_attempts` failures.
    pub fn delay_after(&self, failed_attempts: u32) -> Duration {
        let exponent = failed_attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
        let scaled = self.base_delay.mul_f64(self.backoff_multiplier.powi(exponent));
        scaled.min(self.max_delay)
    }
}

/// Runs async operations with bounded retries and exponential backoff.
///
/// Only transient failures are retried (see [`LinkError::is_retryable`]);
/// codec failures surface immediately. A shutdown signal observed while a
/// retry is waiting abandons the schedule with [`LinkError::Cancelled`].
pub struct RetryManager {
    policy: RetryPolicy,
    shutdown: watch::Receiver<bool>,
    metrics: Arc<EventMetrics>,
}

impl RetryManager {
    pub fn new(
        policy: RetryPolicy,
        shutdown: watch::Receiver<bool>,
        metrics: Arc<EventMetrics>,
    ) -> Self {
        Self {
            policy,
            shutdown,
            metrics,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Runs `operation` up to `max_attempts` times, sleeping between
    /// attempts. On final failure the last underlying error is surfaced.
    pub async fn execute_with_retry<T, F, Fut>(
        &self,
        operation_name: &str,
        operation: F,
    ) -> Result<T, LinkError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, LinkError>>,
    {
        let max = self.policy.max_attempts;
        let mut attempt: u32 = 1;
        loop {
            if *self.shutdown.borrow() {
                return Err(LinkError::Cancelled);
            }

            debug!("executing {operation_name} (attempt {attempt}/{max})");
            match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        info!("{operation_name} succeeded on attempt {attempt}/{max}");
                    }
                    return Ok(value);
                }
                Err(e) if attempt < max && e.is_retryable() => {
                    let delay = self.policy.delay_after(attempt);
                    warn!(
                        "{operation_name} failed on attempt {attempt}/{max}, retrying in {} ms: {e}",
                        delay.as_millis()
                    );
                    self.metrics.record_retry_attempt();

                    let mut shutdown = self.shutdown.clone();
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => {
                            debug!("{operation_name} retry abandoned by shutdown");
                            return Err(LinkError::Cancelled);
                        }
                    }
                    attempt += 1;
                }
                Err(e) => {
                    if attempt > 1 {
                        error!("{operation_name} failed after {attempt} attempts, giving up: {e}");
                    }
                    return Err(e);
                }
            }
        }
    }
}
