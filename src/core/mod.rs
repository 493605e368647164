pub mod circuit_breaker;
pub mod client;
pub mod connection;
pub mod manager;
pub mod protocol;
pub mod request_id;
pub mod retry;
pub mod suggest;
pub mod telemetry;
pub mod types;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState};
pub use client::McpClient;
pub use connection::{
    ConnectionOptions, ConnectionState, ReconnectPolicy, ServerConnection, ServerStatus, Session,
};
pub use manager::{ConnectionManager, InitializeReport, ManagerSettings};
pub use request_id::RequestIdGenerator;
pub use retry::RetryPolicy;
pub use telemetry::{ConnectionTelemetry, NoopTelemetry, SharedTelemetry, TelemetryFanout, TracingTelemetry};
pub use types::{Catalog, InvocationMetadata, Prompt, Resource, Tool, ToolInvocationResult};
