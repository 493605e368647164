pub mod factory;
pub mod pending;
pub mod process;
pub mod stdio;
pub mod streamable;
pub mod traits;
pub mod websocket;

pub use factory::DefaultTransportFactory;
pub use process::{ChildProcess, ProcessSpec};
pub use stdio::StdioTransport;
pub use streamable::StreamableHttpTransport;
pub use traits::{LinkEvent, OpenedTransport, Transport, TransportFactory, TransportKind};
pub use websocket::WebSocketTransport;
