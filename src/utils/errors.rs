use thiserror::Error;

#[derive(Error, Debug)]
pub enum McpError {
    #[error("server not found: {0}")]
    ServerNotFound(String),

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("failed to connect to '{server}': {reason}")]
    ConnectError { server: String, reason: String },

    #[error("transport error: {0}")]
    TransportError(String),

    #[error("timeout after {0}ms")]
    Timeout(u64),

    #[error("server returned error {code}: {message}")]
    Rpc { code: i32, message: String },

    #[error("circuit breaker for '{server}' is open, retry after {retry_after_secs}s")]
    CircuitOpen { server: String, retry_after_secs: u64 },

    #[error("no connected server provides resource: {0}")]
    ResourceNotFound(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("internal error: {0}")]
    InternalError(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<anyhow::Error> for McpError {
    fn from(e: anyhow::Error) -> Self {
        McpError::InternalError(e.to_string())
    }
}

impl From<serde_yaml::Error> for McpError {
    fn from(e: serde_yaml::Error) -> Self {
        McpError::ConfigError(e.to_string())
    }
}

impl McpError {
    pub fn connect(server: impl Into<String>, reason: impl Into<String>) -> Self {
        McpError::ConnectError {
            server: server.into(),
            reason: reason.into(),
        }
    }

    /// Whether the failure is a transient link problem worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::TransportError(_) | Self::Timeout(_) | Self::Io(_)
        )
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::ServerNotFound(_) => "SERVER_NOT_FOUND",
            Self::ConfigError(_) => "CONFIG_ERROR",
            Self::ConnectError { .. } => "CONNECT_ERROR",
            Self::TransportError(_) => "TRANSPORT_ERROR",
            Self::Timeout(_) => "TIMEOUT",
            Self::Rpc { .. } => "RPC_ERROR",
            Self::CircuitOpen { .. } => "CIRCUIT_OPEN",
            Self::ResourceNotFound(_) => "RESOURCE_NOT_FOUND",
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::InternalError(_) => "INTERNAL_ERROR",
            Self::Io(_) => "IO_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }
}

pub type McpResult<T> = Result<T, McpError>;
