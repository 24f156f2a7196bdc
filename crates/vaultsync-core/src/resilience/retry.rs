//! Retry with exponential backoff and optional jitter.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::serde_millis;
use crate::domain::{Result, SyncError};

/// Jitter spread applied to each backoff delay (±10%).
const JITTER_FRACTION: f64 = 0.1;

/// Backoff parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryOptions {
    pub max_attempts: u32,
    #[serde(with = "serde_millis")]
    pub base_delay: Duration,
    #[serde(with = "serde_millis")]
    pub max_delay: Duration,
    pub exponential_base: f64,
    pub jitter: bool,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
            exponential_base: 2.0,
            jitter: true,
        }
    }
}

impl RetryOptions {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(SyncError::InvalidConfig(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        if self.base_delay > self.max_delay {
            return Err(SyncError::InvalidConfig(format!(
                "retry.base_delay ({:?}) exceeds retry.max_delay ({:?})",
                self.base_delay, self.max_delay
            )));
        }
        if self.exponential_base.is_nan() || self.exponential_base <= 1.0 {
            return Err(SyncError::InvalidConfig(
                "retry.exponential_base must be greater than 1".into(),
            ));
        }
        Ok(())
    }

    /// Delay before attempt `attempt + 1`, without jitter.
    ///
    /// `base_delay * exponential_base^(attempt - 1)`, capped at `max_delay`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let raw = self.base_delay.as_secs_f64() * self.exponential_base.powi(exponent);
        let capped = raw.min(self.max_delay.as_secs_f64());
        if capped.is_finite() && capped > 0.0 {
            Duration::from_secs_f64(capped)
        } else if capped.is_finite() {
            Duration::ZERO
        } else {
            self.max_delay
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let delay = self.backoff_for(attempt);
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let factor = 1.0 + rand::thread_rng().gen_range(-JITTER_FRACTION..=JITTER_FRACTION);
        Duration::from_secs_f64((delay.as_secs_f64() * factor).max(0.0))
    }
}

/// Aggregate statistics for a [`RetryPolicy`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetryStats {
    pub total_executions: u64,
    pub successful_executions: u64,
    pub failed_executions: u64,
    pub total_retries: u64,
    pub average_attempts: f64,
    #[serde(with = "serde_millis")]
    pub average_execution_time: Duration,
}

impl RetryStats {
    fn observe(&mut self, attempts: u32, elapsed: Duration, success: bool) {
        self.total_executions += 1;
        if success {
            self.successful_executions += 1;
        } else {
            self.failed_executions += 1;
        }
        self.total_retries += u64::from(attempts.saturating_sub(1));

        let n = self.total_executions as f64;
        self.average_attempts += (f64::from(attempts) - self.average_attempts) / n;
        let avg = self.average_execution_time.as_secs_f64();
        let next = avg + (elapsed.as_secs_f64() - avg) / n;
        self.average_execution_time = Duration::from_secs_f64(next.max(0.0));
    }
}

/// Retries fallible async operations according to [`RetryOptions`].
pub struct RetryPolicy {
    options: RetryOptions,
    stats: Mutex<RetryStats>,
    disposed: AtomicBool,
}

impl RetryPolicy {
    pub fn new(options: RetryOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            options,
            stats: Mutex::new(RetryStats::default()),
            disposed: AtomicBool::new(false),
        })
    }

    pub fn options(&self) -> &RetryOptions {
        &self.options
    }

    /// Run `op`, retrying every failure until `max_attempts` is reached.
    pub async fn execute_with_retry<T, F, Fut>(&self, context: &str, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.execute_with_custom_retry(context, op, |_, _| true).await
    }

    /// Run `op`, retrying only failures for which `should_retry(error, attempt)`
    /// returns true. A non-retryable error is returned as-is.
    pub async fn execute_with_custom_retry<T, F, Fut, P>(
        &self,
        context: &str,
        mut op: F,
        should_retry: P,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
        P: Fn(&SyncError, u32) -> bool,
    {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(SyncError::Disposed("retry policy"));
        }

        let started = Instant::now();
        let max_attempts = self.options.max_attempts;
        let mut attempt = 1u32;

        loop {
            match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(context, attempt, "operation succeeded after retry");
                    }
                    self.observe(attempt, started.elapsed(), true);
                    return Ok(value);
                }
                Err(err) if !should_retry(&err, attempt) => {
                    debug!(context, attempt, error = %err, "error is not retryable");
                    self.observe(attempt, started.elapsed(), false);
                    return Err(err);
                }
                Err(err) if attempt >= max_attempts => {
                    warn!(context, attempts = attempt, error = %err, "retries exhausted");
                    self.observe(attempt, started.elapsed(), false);
                    return Err(SyncError::RetryExhausted {
                        context: context.to_string(),
                        attempts: attempt,
                        last: Box::new(err),
                    });
                }
                Err(err) => {
                    let delay = self.options.delay_for(attempt);
                    warn!(
                        context,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "attempt failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    pub fn stats(&self) -> RetryStats {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn reset_stats(&self) {
        *self.stats.lock().unwrap_or_else(|e| e.into_inner()) = RetryStats::default();
    }

    /// Permanently disable the policy; later executions fail with `Disposed`.
    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
    }

    fn observe(&self, attempts: u32, elapsed: Duration, success: bool) {
        self.stats
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .observe(attempts, elapsed, success);
    }
}
