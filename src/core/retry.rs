//! Retry policy for transient errors
//!
//! Bounded exponential backoff around a single async operation. The policy
//! runs inside [`CircuitBreaker::execute`](crate::core::circuit_breaker::CircuitBreaker::execute),
//! so an exhausted burst of retries counts as one breaker failure.

use crate::utils::errors::{McpError, McpResult};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Decides whether an error is worth another attempt
pub type RetryPredicate = Arc<dyn Fn(&McpError) -> bool + Send + Sync>;

/// Configuration for retry behavior
#[derive(Clone)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts after the first call
    pub max_retries: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Name used in diagnostics
    pub name: String,
    retryable: RetryPredicate,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .field("name", &self.name)
            .finish()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_millis(5000),
            name: "default".to_string(),
            retryable: Arc::new(McpError::is_transient),
        }
    }
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a policy with no retries
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    pub fn with_max_retries(mut self, max: u32) -> Self {
        self.max_retries = max;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Replace the retryable-error predicate
    pub fn with_predicate<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&McpError) -> bool + Send + Sync + 'static,
    {
        self.retryable = Arc::new(predicate);
        self
    }

    /// Delay after the failed attempt with the given 0-based index
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    pub fn is_retryable(&self, error: &McpError) -> bool {
        (self.retryable)(error)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or
    /// `max_retries + 1` attempts have been made.
    pub async fn run<F, Fut, T>(&self, mut op: F) -> McpResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = McpResult<T>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.max_retries && self.is_retryable(&e) => {
                    let delay = self.delay_for_attempt(attempt);
                    debug!(
                        policy = %self.name,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying after transient failure"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
