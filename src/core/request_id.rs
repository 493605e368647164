//! Unique request ID generation
//!
//! Each transport owns one generator so ids only need to be unique per link.

use crate::core::protocol::RequestId;
use std::sync::atomic::{AtomicU64, Ordering};

/// Request ID generator
#[derive(Debug)]
pub struct RequestIdGenerator {
    counter: AtomicU64,
    /// Prefix for IDs, usually the server name
    prefix: Option<String>,
}

impl RequestIdGenerator {
    /// Create a new request ID generator with sequential numeric IDs
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(1),
            prefix: None,
        }
    }

    /// Create a new generator with a prefix
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            counter: AtomicU64::new(1),
            prefix: Some(prefix.into()),
        }
    }

    /// Generate the next request ID
    pub fn next_id(&self) -> RequestId {
        let num = self.counter.fetch_add(1, Ordering::SeqCst);

        match &self.prefix {
            Some(prefix) => RequestId::String(format!("{}-{}", prefix, num)),
            None => RequestId::Number(num as i64),
        }
    }

    /// Get current counter value (for debugging)
    pub fn current_value(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }
}

impl Default for RequestIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
