//! Resilience layer: retry policy, circuit breaker, and the combinator that
//! composes them around remote-ish operations.
//!
//! Composition order is `retry(breaker(op))`: every attempt passes through
//! the breaker, so repeated transient failures trip it, and an open circuit
//! is never retried.

pub mod circuit_breaker;
pub mod retry;

use std::future::Future;
use std::sync::Arc;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState};
pub use retry::{RetryOptions, RetryPolicy, RetryStats};

use crate::domain::Result;

/// Run `op` under `breaker`, retried by `retry` while errors are transient.
pub async fn with_resilience<T, F, Fut>(
    retry: &RetryPolicy,
    breaker: &CircuitBreaker,
    context: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    retry
        .execute_with_custom_retry(
            context,
            move || breaker.execute(op()),
            |err, _attempt| err.is_transient(),
        )
        .await
}

/// A retry policy and circuit breaker shared by one pipeline.
#[derive(Clone)]
pub struct Resilience {
    pub retry: Arc<RetryPolicy>,
    pub breaker: Arc<CircuitBreaker>,
}

impl Resilience {
    pub fn new(retry: Arc<RetryPolicy>, breaker: Arc<CircuitBreaker>) -> Self {
        Self { retry, breaker }
    }

    pub async fn run<T, F, Fut>(&self, context: &str, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        with_resilience(&self.retry, &self.breaker, context, op).await
    }

    pub fn dispose(&self) {
        self.retry.dispose();
        self.breaker.dispose();
    }
}
