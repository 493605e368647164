pub mod errors;
pub mod logging;
pub mod metrics;

pub use errors::{McpError, McpResult};
pub use logging::init_tracing;
pub use metrics::{ConnectionMetrics, SharedMetrics};
