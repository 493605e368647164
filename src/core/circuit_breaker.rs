//! Circuit breaker pattern for resilient server communication
//!
//! Prevents cascade failures by temporarily rejecting calls to a server whose
//! recent failures crossed a threshold inside a sliding window.

use crate::core::telemetry::{NoopTelemetry, SharedTelemetry};
use crate::utils::errors::{McpError, McpResult};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - requests pass through
    Closed,
    /// Failure threshold reached - requests are rejected
    Open,
    /// Cooldown elapsed - a single trial request is allowed
    HalfOpen,
}

impl CircuitState {
    /// Gauge encoding used by telemetry backends.
    pub fn gauge_value(&self) -> u64 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::HalfOpen => 1,
            CircuitState::Open => 2,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Failures inside `failure_window` that open the circuit
    pub failure_threshold: u32,
    /// How long the circuit stays open before a trial call
    pub reset_timeout: Duration,
    /// Sliding window for counting failures
    pub failure_window: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
            failure_window: Duration::from_secs(60),
        }
    }
}

/// Circuit breaker statistics
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub state: CircuitState,
    pub failures: u64,
    pub successes: u64,
    pub recent_failures: usize,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub last_success_time: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_times: VecDeque<Instant>,
    failure_count: u64,
    success_count: u64,
    last_failure: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
    last_success_at: Option<DateTime<Utc>>,
    trial_in_flight: bool,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_times: VecDeque::new(),
            failure_count: 0,
            success_count: 0,
            last_failure: None,
            last_failure_at: None,
            last_success_at: None,
            trial_in_flight: false,
        }
    }

    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(front) = self.failure_times.front() {
            if now.duration_since(*front) > window {
                self.failure_times.pop_front();
            } else {
                break;
            }
        }
    }
}

enum Admission {
    Allowed { trial: bool },
    Rejected { retry_after_secs: u64 },
}

/// Transition to report once the lock is released
struct Transition {
    to: CircuitState,
    tripped: bool,
}

/// Circuit breaker for a single server
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
    telemetry: SharedTelemetry,
}

impl CircuitBreaker {
    /// Create a new circuit breaker
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self::with_telemetry(name, config, Arc::new(NoopTelemetry))
    }

    pub fn with_telemetry(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        telemetry: SharedTelemetry,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner::new()),
            telemetry,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Get current state
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Execute a call with circuit breaker protection.
    ///
    /// When the circuit is open and still cooling down, `f` is never invoked
    /// and [`McpError::CircuitOpen`] is returned instead.
    pub async fn execute<F, Fut, T>(&self, f: F) -> McpResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = McpResult<T>>,
    {
        let trial = match self.admit() {
            Admission::Allowed { trial } => trial,
            Admission::Rejected { retry_after_secs } => {
                return Err(McpError::CircuitOpen {
                    server: self.name.clone(),
                    retry_after_secs,
                });
            }
        };

        let mut guard = TrialGuard {
            breaker: self,
            armed: trial,
        };
        let result = f().await;
        guard.armed = false;

        match &result {
            Ok(_) => self.record_success(trial),
            Err(_) => self.record_failure(trial),
        }

        result
    }

    fn admit(&self) -> Admission {
        let mut transition = None;
        let admission = {
            let mut inner = self.inner.lock();
            match inner.state {
                CircuitState::Closed => Admission::Allowed { trial: false },
                CircuitState::Open => {
                    let elapsed = inner
                        .last_failure
                        .map(|t| Instant::now().duration_since(t))
                        .unwrap_or(self.config.reset_timeout);
                    if elapsed < self.config.reset_timeout {
                        let remaining = self.config.reset_timeout - elapsed;
                        Admission::Rejected {
                            retry_after_secs: ceil_secs(remaining),
                        }
                    } else {
                        inner.state = CircuitState::HalfOpen;
                        inner.trial_in_flight = true;
                        transition = Some(Transition {
                            to: CircuitState::HalfOpen,
                            tripped: false,
                        });
                        Admission::Allowed { trial: true }
                    }
                }
                CircuitState::HalfOpen => {
                    if inner.trial_in_flight {
                        Admission::Rejected { retry_after_secs: 0 }
                    } else {
                        inner.trial_in_flight = true;
                        Admission::Allowed { trial: true }
                    }
                }
            }
        };

        if let Some(t) = transition {
            info!("Circuit breaker '{}' transitioned to half-open", self.name);
            self.report(t);
        }
        admission
    }

    fn record_success(&self, trial: bool) {
        let transition = {
            let mut inner = self.inner.lock();
            inner.success_count += 1;
            inner.last_success_at = Some(Utc::now());
            if trial {
                inner.trial_in_flight = false;
            }
            if trial && inner.state == CircuitState::HalfOpen {
                inner.failure_times.clear();
                inner.state = CircuitState::Closed;
                Some(Transition {
                    to: CircuitState::Closed,
                    tripped: false,
                })
            } else {
                None
            }
        };

        if let Some(t) = transition {
            info!("Circuit breaker '{}' closed after recovery", self.name);
            self.report(t);
        }
    }

    fn record_failure(&self, trial: bool) {
        let transition = {
            let mut inner = self.inner.lock();
            let now = Instant::now();
            inner.failure_count += 1;
            inner.failure_times.push_back(now);
            inner.last_failure = Some(now);
            inner.last_failure_at = Some(Utc::now());
            inner.prune(now, self.config.failure_window);
            if trial {
                inner.trial_in_flight = false;
            }

            let recent = inner.failure_times.len();
            let reopen = trial && inner.state == CircuitState::HalfOpen;
            let trip = inner.state == CircuitState::Closed
                && recent >= self.config.failure_threshold as usize;

            if reopen || trip {
                inner.state = CircuitState::Open;
                Some((
                    Transition {
                        to: CircuitState::Open,
                        tripped: true,
                    },
                    reopen,
                    recent,
                ))
            } else {
                None
            }
        };

        if let Some((t, reopen, recent)) = transition {
            if reopen {
                warn!(
                    "Circuit breaker '{}' re-opened after failure in half-open state",
                    self.name
                );
            } else {
                warn!(
                    "Circuit breaker '{}' opened after {} failures",
                    self.name, recent
                );
            }
            self.report(t);
        }
    }

    fn release_trial(&self) {
        self.inner.lock().trial_in_flight = false;
    }

    fn report(&self, transition: Transition) {
        self.telemetry
            .breaker_state_changed(&self.name, transition.to);
        if transition.tripped {
            self.telemetry.breaker_tripped(&self.name);
        }
    }

    /// Get statistics
    pub fn stats(&self) -> CircuitBreakerStats {
        let mut inner = self.inner.lock();
        inner.prune(Instant::now(), self.config.failure_window);
        CircuitBreakerStats {
            state: inner.state,
            failures: inner.failure_count,
            successes: inner.success_count,
            recent_failures: inner.failure_times.len(),
            last_failure_time: inner.last_failure_at,
            last_success_time: inner.last_success_at,
        }
    }

    /// Reset the circuit breaker (for manual intervention)
    pub fn reset(&self) {
        let previous = {
            let mut inner = self.inner.lock();
            let previous = inner.state;
            *inner = BreakerInner::new();
            previous
        };
        info!("Circuit breaker '{}' manually reset", self.name);
        if previous != CircuitState::Closed {
            self.report(Transition {
                to: CircuitState::Closed,
                tripped: false,
            });
        }
    }

    /// Administrative override used by recovery tooling.
    pub fn force_state(&self, state: CircuitState) {
        let previous = {
            let mut inner = self.inner.lock();
            let previous = inner.state;
            inner.state = state;
            inner.trial_in_flight = false;
            match state {
                CircuitState::Open => inner.last_failure = Some(Instant::now()),
                CircuitState::Closed => inner.failure_times.clear(),
                CircuitState::HalfOpen => {}
            }
            previous
        };
        warn!(
            "Circuit breaker '{}' forced from {} to {}",
            self.name, previous, state
        );
        if previous != state {
            self.report(Transition {
                to: state,
                tripped: state == CircuitState::Open,
            });
        }
    }
}

/// Frees the half-open slot if a trial future is dropped before finishing.
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.release_trial();
        }
    }
}

fn ceil_secs(d: Duration) -> u64 {
    let secs = d.as_secs();
    if d.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::telemetry::MockConnectionTelemetry;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn breaker(threshold: u32, reset_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                reset_timeout: Duration::from_millis(reset_ms),
                failure_window: Duration::from_secs(60),
            },
        )
    }

    async fn fail(cb: &CircuitBreaker, calls: &AtomicU32) -> McpResult<()> {
        cb.execute(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(McpError::TransportError("boom".to_string()))
        })
        .await
    }

    async fn succeed(cb: &CircuitBreaker, calls: &AtomicU32) -> McpResult<()> {
        cb.execute(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await
    }

    #[tokio::test]
    async fn test_circuit_breaker_starts_closed() {
        let cb = CircuitBreaker::new("test", CircuitBreakerConfig::default());
        assert_eq!(cb.state(), CircuitState::Closed);
        let calls = AtomicU32::new(0);
        assert!(succeed(&cb, &calls).await.is_ok());
        assert_eq!(cb.stats().successes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_rejects_without_calling() {
        let cb = breaker(2, 1000);
        let calls = AtomicU32::new(0);

        fail(&cb, &calls).await.unwrap_err();
        assert_eq!(cb.state(), CircuitState::Closed);
        fail(&cb, &calls).await.unwrap_err();
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        tokio::time::advance(Duration::from_millis(400)).await;
        let err = succeed(&cb, &calls).await.unwrap_err();
        match err {
            McpError::CircuitOpen {
                server,
                retry_after_secs,
            } => {
                assert_eq!(server, "test");
                assert_eq!(retry_after_secs, 1);
            }
            other => panic!("expected CircuitOpen, got {other}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_success_closes_and_clears_history() {
        let cb = breaker(2, 1000);
        let calls = AtomicU32::new(0);
        fail(&cb, &calls).await.unwrap_err();
        fail(&cb, &calls).await.unwrap_err();

        tokio::time::advance(Duration::from_millis(1000)).await;
        succeed(&cb, &calls).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.stats().recent_failures, 0);

        // History was cleared, so one more failure must not reopen.
        fail(&cb, &calls).await.unwrap_err();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let cb = breaker(2, 1000);
        let calls = AtomicU32::new(0);
        fail(&cb, &calls).await.unwrap_err();
        fail(&cb, &calls).await.unwrap_err();

        tokio::time::advance(Duration::from_millis(1000)).await;
        fail(&cb, &calls).await.unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(cb.state(), CircuitState::Open);

        let err = succeed(&cb, &calls).await.unwrap_err();
        assert!(matches!(err, McpError::CircuitOpen { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_outside_window_are_pruned() {
        let cb = CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                failure_threshold: 2,
                reset_timeout: Duration::from_secs(1),
                failure_window: Duration::from_secs(10),
            },
        );
        let calls = AtomicU32::new(0);

        fail(&cb, &calls).await.unwrap_err();
        tokio::time::advance(Duration::from_secs(11)).await;
        fail(&cb, &calls).await.unwrap_err();

        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.stats().recent_failures, 1);
        assert_eq!(cb.stats().failures, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_one_trial_while_half_open() {
        let cb = Arc::new(breaker(1, 100));
        let calls = Arc::new(AtomicU32::new(0));
        fail(&cb, &calls).await.unwrap_err();
        tokio::time::advance(Duration::from_millis(100)).await;

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let trial = {
            let cb = cb.clone();
            tokio::spawn(async move {
                cb.execute(|| async move {
                    let _ = release_rx.await;
                    Ok::<_, McpError>(())
                })
                .await
            })
        };
        tokio::task::yield_now().await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        let err = succeed(&cb, &calls).await.unwrap_err();
        assert!(matches!(err, McpError::CircuitOpen { retry_after_secs: 0, .. }));

        release_tx.send(()).unwrap();
        trial.await.unwrap().unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_reset_and_force_state() {
        let cb = breaker(1, 60_000);
        let calls = AtomicU32::new(0);
        fail(&cb, &calls).await.unwrap_err();
        assert_eq!(cb.state(), CircuitState::Open);

        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        let stats = cb.stats();
        assert_eq!(stats.failures, 0);
        assert!(stats.last_failure_time.is_none());

        cb.force_state(CircuitState::Open);
        assert!(matches!(
            succeed(&cb, &calls).await,
            Err(McpError::CircuitOpen { .. })
        ));
    }

    #[tokio::test]
    async fn test_transitions_reach_telemetry() {
        let mut telemetry = MockConnectionTelemetry::new();
        telemetry
            .expect_breaker_state_changed()
            .withf(|server, state| server.to_string() == "fs" && *state == CircuitState::Open)
            .times(1)
            .return_const(());
        telemetry
            .expect_breaker_tripped()
            .withf(|server| server.to_string() == "fs")
            .times(1)
            .return_const(());

        let cb = CircuitBreaker::with_telemetry(
            "fs",
            CircuitBreakerConfig {
                failure_threshold: 1,
                ..Default::default()
            },
            Arc::new(telemetry),
        );
        let calls = AtomicU32::new(0);
        fail(&cb, &calls).await.unwrap_err();
    }

    #[test]
    fn test_circuit_breaker_config_default() {
        let config = CircuitBreakerConfig::default();
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.reset_timeout, Duration::from_secs(60));
        assert_eq!(config.failure_window, Duration::from_secs(60));
    }

    #[test]
    fn test_circuit_state_display_and_gauge() {
        assert_eq!(format!("{}", CircuitState::Closed), "closed");
        assert_eq!(format!("{}", CircuitState::Open), "open");
        assert_eq!(format!("{}", CircuitState::HalfOpen), "half-open");
        assert_eq!(CircuitState::Closed.gauge_value(), 0);
        assert_eq!(CircuitState::HalfOpen.gauge_value(), 1);
        assert_eq!(CircuitState::Open.gauge_value(), 2);
    }
}
