//! Connection metrics
//!
//! Counts lifecycle events fired through [`ConnectionTelemetry`] and renders
//! them as Prometheus text or JSON. Exporting the snapshot somewhere is the
//! caller's concern.

use crate::core::circuit_breaker::CircuitState;
use crate::core::telemetry::ConnectionTelemetry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Per-server counters
#[derive(Debug, Default)]
struct ServerCounters {
    connects: AtomicU64,
    connect_failures: AtomicU64,
    disconnects: AtomicU64,
    breaker_trips: AtomicU64,
    breaker_state: AtomicU64,
    reconnects: AtomicU64,
    reconnect_failures: AtomicU64,
    tool_calls: AtomicU64,
    tool_failures: AtomicU64,
    tool_duration_ms: AtomicU64,
}

/// Metrics collector
pub struct ConnectionMetrics {
    servers: DashMap<String, ServerCounters>,
    start_time: Instant,
}

impl ConnectionMetrics {
    pub fn new() -> Self {
        Self {
            servers: DashMap::new(),
            start_time: Instant::now(),
        }
    }

    fn bump(&self, server: &str, pick: impl FnOnce(&ServerCounters) -> &AtomicU64, by: u64) {
        let entry = self.servers.entry(server.to_string()).or_default();
        pick(entry.value()).fetch_add(by, Ordering::SeqCst);
    }

    fn read(&self, server: &str, pick: impl FnOnce(&ServerCounters) -> &AtomicU64) -> u64 {
        self.servers
            .get(server)
            .map(|c| pick(c.value()).load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    fn total(&self, pick: impl Fn(&ServerCounters) -> &AtomicU64) -> u64 {
        self.servers
            .iter()
            .map(|entry| pick(entry.value()).load(Ordering::SeqCst))
            .sum()
    }

    pub fn connect_failures(&self, server: &str) -> u64 {
        self.read(server, |c| &c.connect_failures)
    }

    pub fn breaker_trips(&self, server: &str) -> u64 {
        self.read(server, |c| &c.breaker_trips)
    }

    pub fn breaker_gauge(&self, server: &str) -> u64 {
        self.read(server, |c| &c.breaker_state)
    }

    pub fn tool_calls(&self, server: &str) -> u64 {
        self.read(server, |c| &c.tool_calls)
    }

    pub fn total_connects(&self) -> u64 {
        self.total(|c| &c.connects)
    }

    pub fn total_connect_failures(&self) -> u64 {
        self.total(|c| &c.connect_failures)
    }

    /// Average tool call duration across all servers
    pub fn average_tool_duration_ms(&self) -> f64 {
        let calls = self.total(|c| &c.tool_calls);
        if calls == 0 {
            0.0
        } else {
            self.total(|c| &c.tool_duration_ms) as f64 / calls as f64
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Export metrics in Prometheus format
    pub fn export_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str("# HELP mcp_uptime_seconds Collector uptime in seconds\n");
        output.push_str("# TYPE mcp_uptime_seconds gauge\n");
        output.push_str(&format!("mcp_uptime_seconds {}\n", self.uptime_seconds()));

        output.push_str("# HELP mcp_tool_duration_ms Average tool call duration in milliseconds\n");
        output.push_str("# TYPE mcp_tool_duration_ms gauge\n");
        output.push_str(&format!(
            "mcp_tool_duration_ms {:.2}\n",
            self.average_tool_duration_ms()
        ));

        let series: [(&str, &str, &str, fn(&ServerCounters) -> &AtomicU64); 9] = [
            ("mcp_connects_total", "counter", "Successful connects", |c| &c.connects),
            ("mcp_connect_failures_total", "counter", "Failed connects", |c| &c.connect_failures),
            ("mcp_disconnects_total", "counter", "Disconnects", |c| &c.disconnects),
            ("mcp_breaker_trips_total", "counter", "Circuit breaker trips", |c| &c.breaker_trips),
            ("mcp_breaker_state", "gauge", "Breaker state (0=closed, 1=half-open, 2=open)", |c| &c.breaker_state),
            ("mcp_reconnects_total", "counter", "Successful reconnects", |c| &c.reconnects),
            ("mcp_reconnect_failures_total", "counter", "Failed reconnect attempts", |c| &c.reconnect_failures),
            ("mcp_tool_calls_total", "counter", "Tool calls", |c| &c.tool_calls),
            ("mcp_tool_failures_total", "counter", "Failed tool calls", |c| &c.tool_failures),
        ];

        let mut names: Vec<String> = self.servers.iter().map(|e| e.key().clone()).collect();
        names.sort();

        for (metric, kind, help, pick) in series {
            output.push_str(&format!("# HELP {} {}\n", metric, help));
            output.push_str(&format!("# TYPE {} {}\n", metric, kind));
            for name in &names {
                if let Some(counters) = self.servers.get(name) {
                    output.push_str(&format!(
                        "{}{{server=\"{}\"}} {}\n",
                        metric,
                        name,
                        pick(counters.value()).load(Ordering::SeqCst)
                    ));
                }
            }
        }

        output
    }

    /// Export metrics in JSON format
    pub fn export_json(&self) -> serde_json::Value {
        let mut servers = serde_json::Map::new();
        for entry in self.servers.iter() {
            let c = entry.value();
            servers.insert(
                entry.key().clone(),
                serde_json::json!({
                    "connects": c.connects.load(Ordering::SeqCst),
                    "connect_failures": c.connect_failures.load(Ordering::SeqCst),
                    "disconnects": c.disconnects.load(Ordering::SeqCst),
                    "breaker_trips": c.breaker_trips.load(Ordering::SeqCst),
                    "breaker_state": c.breaker_state.load(Ordering::SeqCst),
                    "reconnects": c.reconnects.load(Ordering::SeqCst),
                    "reconnect_failures": c.reconnect_failures.load(Ordering::SeqCst),
                    "tool_calls": c.tool_calls.load(Ordering::SeqCst),
                    "tool_failures": c.tool_failures.load(Ordering::SeqCst),
                }),
            );
        }

        serde_json::json!({
            "uptime_seconds": self.uptime_seconds(),
            "average_tool_duration_ms": self.average_tool_duration_ms(),
            "servers": servers,
        })
    }
}

impl Default for ConnectionMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionTelemetry for ConnectionMetrics {
    fn connect_succeeded(&self, server: &str, _elapsed: Duration) {
        self.bump(server, |c| &c.connects, 1);
    }

    fn connect_failed(&self, server: &str, _error: &str) {
        self.bump(server, |c| &c.connect_failures, 1);
    }

    fn disconnected(&self, server: &str) {
        self.bump(server, |c| &c.disconnects, 1);
    }

    fn breaker_state_changed(&self, server: &str, state: CircuitState) {
        let entry = self.servers.entry(server.to_string()).or_default();
        entry.breaker_state.store(state.gauge_value(), Ordering::SeqCst);
    }

    fn breaker_tripped(&self, server: &str) {
        self.bump(server, |c| &c.breaker_trips, 1);
    }

    fn reconnect_succeeded(&self, server: &str, _attempt: u32) {
        self.bump(server, |c| &c.reconnects, 1);
    }

    fn reconnect_failed(&self, server: &str, _attempt: u32, _error: &str) {
        self.bump(server, |c| &c.reconnect_failures, 1);
    }

    fn tool_executed(&self, server: &str, tool: &str, success: bool, elapsed_ms: u64) {
        self.bump(server, |c| &c.tool_calls, 1);
        self.bump(server, |c| &c.tool_duration_ms, elapsed_ms);
        if !success {
            self.bump(server, |c| &c.tool_failures, 1);
        }
        debug!(
            "Tool call recorded: server={}, tool={}, success={}, duration={}ms",
            server, tool, success, elapsed_ms
        );
    }
}

/// Shared metrics handle
pub type SharedMetrics = Arc<ConnectionMetrics>;
