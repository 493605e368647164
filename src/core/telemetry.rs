//! Telemetry hooks fired by the connection subsystem
//!
//! The manager, connections and circuit breakers call these at fixed points in
//! their lifecycle. Backends implement [`ConnectionTelemetry`]; every method
//! has a no-op default so implementors only override what they export.

use crate::core::circuit_breaker::CircuitState;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[cfg_attr(test, mockall::automock)]
pub trait ConnectionTelemetry: Send + Sync {
    fn connect_succeeded(&self, _server: &str, _elapsed: Duration) {}

    fn connect_failed(&self, _server: &str, _error: &str) {}

    fn disconnected(&self, _server: &str) {}

    /// Gauge update; see [`CircuitState::gauge_value`].
    fn breaker_state_changed(&self, _server: &str, _state: CircuitState) {}

    fn breaker_tripped(&self, _server: &str) {}

    fn reconnect_succeeded(&self, _server: &str, _attempt: u32) {}

    fn reconnect_failed(&self, _server: &str, _attempt: u32, _error: &str) {}

    fn tool_executed(&self, _server: &str, _tool: &str, _success: bool, _elapsed_ms: u64) {}
}

pub type SharedTelemetry = Arc<dyn ConnectionTelemetry>;

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTelemetry;

impl ConnectionTelemetry for NoopTelemetry {}

/// Emits every event as a tracing record.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTelemetry;

impl ConnectionTelemetry for TracingTelemetry {
    fn connect_succeeded(&self, server: &str, elapsed: Duration) {
        info!(server, elapsed_ms = elapsed.as_millis() as u64, "telemetry: connect succeeded");
    }

    fn connect_failed(&self, server: &str, error: &str) {
        warn!(server, error, "telemetry: connect failed");
    }

    fn disconnected(&self, server: &str) {
        info!(server, "telemetry: disconnected");
    }

    fn breaker_state_changed(&self, server: &str, state: CircuitState) {
        debug!(server, state = %state, gauge = state.gauge_value(), "telemetry: breaker state");
    }

    fn breaker_tripped(&self, server: &str) {
        warn!(server, "telemetry: breaker tripped");
    }

    fn reconnect_succeeded(&self, server: &str, attempt: u32) {
        info!(server, attempt, "telemetry: reconnect succeeded");
    }

    fn reconnect_failed(&self, server: &str, attempt: u32, error: &str) {
        warn!(server, attempt, error, "telemetry: reconnect failed");
    }

    fn tool_executed(&self, server: &str, tool: &str, success: bool, elapsed_ms: u64) {
        debug!(server, tool, success, elapsed_ms, "telemetry: tool executed");
    }
}

/// Fans one event out to several sinks.
#[derive(Default, Clone)]
pub struct TelemetryFanout {
    sinks: Vec<SharedTelemetry>,
}

impl TelemetryFanout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: SharedTelemetry) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl ConnectionTelemetry for TelemetryFanout {
    fn connect_succeeded(&self, server: &str, elapsed: Duration) {
        self.sinks.iter().for_each(|s| s.connect_succeeded(server, elapsed));
    }

    fn connect_failed(&self, server: &str, error: &str) {
        self.sinks.iter().for_each(|s| s.connect_failed(server, error));
    }

    fn disconnected(&self, server: &str) {
        self.sinks.iter().for_each(|s| s.disconnected(server));
    }

    fn breaker_state_changed(&self, server: &str, state: CircuitState) {
        self.sinks.iter().for_each(|s| s.breaker_state_changed(server, state));
    }

    fn breaker_tripped(&self, server: &str) {
        self.sinks.iter().for_each(|s| s.breaker_tripped(server));
    }

    fn reconnect_succeeded(&self, server: &str, attempt: u32) {
        self.sinks.iter().for_each(|s| s.reconnect_succeeded(server, attempt));
    }

    fn reconnect_failed(&self, server: &str, attempt: u32, error: &str) {
        self.sinks.iter().for_each(|s| s.reconnect_failed(server, attempt, error));
    }

    fn tool_executed(&self, server: &str, tool: &str, success: bool, elapsed_ms: u64) {
        self.sinks
            .iter()
            .for_each(|s| s.tool_executed(server, tool, success, elapsed_ms));
    }
}
