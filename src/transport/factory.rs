use crate::config::{ServerConfig, TransportConfig};
use crate::transport::process::{ChildProcess, ProcessSpec, DEFAULT_SHUTDOWN_GRACE};
use crate::transport::streamable::StreamableHttpTransport;
use crate::transport::stdio::StdioTransport;
use crate::transport::traits::{OpenedTransport, Transport, TransportFactory, TransportKind};
use crate::transport::websocket::WebSocketTransport;
use crate::utils::errors::McpResult;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

/// Opens real processes and sockets
#[derive(Debug, Clone)]
pub struct DefaultTransportFactory {
    request_timeout: Duration,
    shutdown_grace: Duration,
}

impl DefaultTransportFactory {
    pub fn new(request_timeout: Duration, shutdown_grace: Duration) -> Self {
        Self {
            request_timeout,
            shutdown_grace,
        }
    }
}

impl Default for DefaultTransportFactory {
    fn default() -> Self {
        Self::new(Duration::from_secs(60), DEFAULT_SHUTDOWN_GRACE)
    }
}

#[async_trait]
impl TransportFactory for DefaultTransportFactory {
    async fn open(&self, server: &ServerConfig) -> McpResult<OpenedTransport> {
        let (events_tx, events) = mpsc::channel(8);
        let kind = TransportKind::for_config(&server.transport);
        debug!(server = %server.name, %kind, "Opening transport");

        match &server.transport {
            TransportConfig::Process { command, args, env } => {
                let spec = ProcessSpec {
                    command: command.clone(),
                    args: args.clone(),
                    env: env.clone(),
                };
                let (process, stdin, stdout) =
                    ChildProcess::spawn(&server.name, &spec, events_tx.clone(), self.shutdown_grace)?;
                let transport: Arc<dyn Transport> = Arc::new(StdioTransport::new(
                    &server.name,
                    stdin,
                    stdout,
                    events_tx,
                    self.request_timeout,
                ));
                Ok(OpenedTransport {
                    transport,
                    process: Some(process),
                    events,
                })
            }
            TransportConfig::Remote { url, headers, .. } => {
                let transport: Arc<dyn Transport> = match kind {
                    TransportKind::WebSocket => Arc::new(
                        WebSocketTransport::connect(
                            &server.name,
                            url,
                            headers,
                            events_tx,
                            self.request_timeout,
                        )
                        .await?,
                    ),
                    _ => Arc::new(StreamableHttpTransport::new(
                        &server.name,
                        url,
                        headers,
                        self.request_timeout,
                    )?),
                };
                Ok(OpenedTransport {
                    transport,
                    process: None,
                    events,
                })
            }
        }
    }
}
