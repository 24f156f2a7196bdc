//! Circuit breaker guarding a flaky dependency (the git working tree and its
//! remote).
//!
//! ```text
//! Closed --(failure_count >= failure_threshold)--> Open
//! Open --(call after recovery_time)--> HalfOpen
//! HalfOpen --(half_open_max_calls successes)--> Closed
//! HalfOpen --(any failure)--> Open
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::config::serde_millis;
use crate::domain::{Result, SyncError};
use crate::obs;

/// Breaker thresholds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    #[serde(with = "serde_millis")]
    pub recovery_time: Duration,
    pub half_open_max_calls: u32,
    /// Quiet period after which the maintenance tick decays the failure count.
    #[serde(with = "serde_millis")]
    pub monitoring_window: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_time: Duration::from_secs(60),
            half_open_max_calls: 3,
            monitoring_window: Duration::from_secs(120),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(SyncError::InvalidConfig(
                "circuit_breaker.failure_threshold must be at least 1".into(),
            ));
        }
        if self.half_open_max_calls == 0 {
            return Err(SyncError::InvalidConfig(
                "circuit_breaker.half_open_max_calls must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Snapshot of breaker counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerStats {
    pub state: CircuitState,
    pub failure_count: u32,
    pub total_executions: u64,
    pub total_failures: u64,
    pub total_successes: u64,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub failure_rate: f64,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    /// Probe calls admitted since entering HalfOpen.
    half_open_calls: u32,
    half_open_successes: u32,
    last_failure: Option<Instant>,
    last_failure_time: Option<DateTime<Utc>>,
    total_executions: u64,
    total_failures: u64,
    total_successes: u64,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            half_open_calls: 0,
            half_open_successes: 0,
            last_failure: None,
            last_failure_time: None,
            total_executions: 0,
            total_failures: 0,
            total_successes: 0,
        }
    }

    fn clear_probes(&mut self) {
        self.half_open_calls = 0;
        self.half_open_successes = 0;
    }
}

pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
    disposed: AtomicBool,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerState::new()),
            disposed: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Run `fut` if the circuit admits the call.
    ///
    /// A rejected call drops `fut` without polling it, so the wrapped operation
    /// never starts. A half-open call dropped before it finishes gives its
    /// slot back without recording an outcome.
    pub async fn execute<T, Fut>(&self, fut: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(SyncError::Disposed("circuit breaker"));
        }
        let mut admission = Admission {
            breaker: self,
            half_open: self.admit()?,
            settled: false,
        };

        let outcome = fut.await;
        admission.settled = true;
        match &outcome {
            Ok(_) => self.on_success(),
            Err(_) => self.on_failure(),
        }
        outcome
    }

    /// Returns whether the call took a half-open slot.
    fn admit(&self) -> Result<bool> {
        let mut st = self.lock();
        match st.state {
            CircuitState::Closed => Ok(false),
            CircuitState::Open => {
                let recovered = st
                    .last_failure
                    .map_or(true, |at| at.elapsed() > self.config.recovery_time);
                if !recovered {
                    return Err(SyncError::CircuitOpen {
                        name: self.name.clone(),
                    });
                }
                self.transition(&mut st, CircuitState::HalfOpen);
                st.half_open_calls = 1;
                Ok(true)
            }
            CircuitState::HalfOpen => {
                if st.half_open_calls >= self.config.half_open_max_calls {
                    return Err(SyncError::CircuitOpen {
                        name: self.name.clone(),
                    });
                }
                st.half_open_calls += 1;
                Ok(true)
            }
        }
    }

    fn on_cancelled(&self) {
        let mut st = self.lock();
        if st.state == CircuitState::HalfOpen {
            st.half_open_calls = st.half_open_calls.saturating_sub(1);
            debug!(breaker = %self.name, "half-open call dropped before completion");
        }
    }

    fn on_success(&self) {
        let mut st = self.lock();
        st.total_executions += 1;
        st.total_successes += 1;
        match st.state {
            CircuitState::Closed => st.failure_count = 0,
            CircuitState::HalfOpen => {
                st.half_open_successes += 1;
                if st.half_open_successes >= self.config.half_open_max_calls {
                    st.failure_count = 0;
                    self.transition(&mut st, CircuitState::Closed);
                }
            }
            // Reopened by a concurrent probe failure; this late success changes nothing.
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self) {
        let mut st = self.lock();
        st.total_executions += 1;
        st.total_failures += 1;
        st.failure_count = st.failure_count.saturating_add(1);
        st.last_failure = Some(Instant::now());
        st.last_failure_time = Some(Utc::now());
        match st.state {
            CircuitState::Closed if st.failure_count >= self.config.failure_threshold => {
                self.transition(&mut st, CircuitState::Open);
            }
            CircuitState::HalfOpen => self.transition(&mut st, CircuitState::Open),
            _ => {}
        }
    }

    fn transition(&self, st: &mut BreakerState, to: CircuitState) {
        let from = st.state;
        if from == to {
            return;
        }
        st.state = to;
        st.clear_probes();
        obs::emit_circuit_transition(&self.name, from.as_str(), to.as_str(), st.failure_count);
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let st = self.lock();
        let failure_rate = if st.total_executions == 0 {
            0.0
        } else {
            st.total_failures as f64 / st.total_executions as f64
        };
        CircuitBreakerStats {
            state: st.state,
            failure_count: st.failure_count,
            total_executions: st.total_executions,
            total_failures: st.total_failures,
            total_successes: st.total_successes,
            last_failure_time: st.last_failure_time,
            failure_rate,
        }
    }

    /// Return to Closed and forget the failure streak. Lifetime totals are kept.
    pub fn reset(&self) {
        let mut st = self.lock();
        st.failure_count = 0;
        st.last_failure = None;
        self.transition(&mut st, CircuitState::Closed);
        st.clear_probes();
    }

    pub fn force_open(&self) {
        let mut st = self.lock();
        st.last_failure = Some(Instant::now());
        self.transition(&mut st, CircuitState::Open);
    }

    pub fn force_closed(&self) {
        let mut st = self.lock();
        st.failure_count = 0;
        self.transition(&mut st, CircuitState::Closed);
    }

    /// Decay the failure count by one after a quiet `monitoring_window`.
    ///
    /// Never changes state. Returns whether the count was decremented.
    pub fn decay_failures(&self) -> bool {
        let mut st = self.lock();
        if st.state != CircuitState::Closed || st.failure_count == 0 {
            return false;
        }
        let quiet = st
            .last_failure
            .map_or(true, |at| at.elapsed() > self.config.monitoring_window);
        if quiet {
            st.failure_count -= 1;
            debug!(breaker = %self.name, failure_count = st.failure_count, "failure count decayed");
        }
        quiet
    }

    /// Run [`decay_failures`](Self::decay_failures) every `period` until the
    /// breaker is dropped or disposed.
    pub fn spawn_maintenance(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(breaker) = weak.upgrade() else { break };
                if breaker.disposed.load(Ordering::SeqCst) {
                    break;
                }
                breaker.decay_failures();
            }
        })
    }

    /// Permanently disable the breaker; later calls fail with `Disposed`.
    pub fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::SeqCst) {
            info!(breaker = %self.name, "circuit breaker disposed");
        }
    }
}

/// Held across an admitted call; a half-open call that never settles frees
/// its slot on drop.
struct Admission<'a> {
    breaker: &'a CircuitBreaker,
    half_open: bool,
    settled: bool,
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if self.half_open && !self.settled {
            self.breaker.on_cancelled();
        }
    }
}
