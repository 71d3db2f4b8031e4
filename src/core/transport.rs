use crate::domain::config::{EndpointConfig, TransportKind};
use crate::domain::error::PortLinkResult;
use crate::infrastructure::serial::SerialTransport;
use crate::infrastructure::tcp::{TcpClientTransport, TcpServerTransport};
use async_trait::async_trait;
use bytes::Bytes;

/// An open byte-stream connection.
///
/// A transport is owned by exactly one connection manager. `read` must be
/// cancel-safe: the manager drops a pending read whenever a write command
/// or shutdown arrives and calls `read` again afterwards.
#[async_trait]
pub trait Transport: Send {
    /// Get the transport kind
    fn kind(&self) -> TransportKind;

    /// Next chunk of inbound bytes; `Ok(None)` signals end of stream
    async fn read(&mut self) -> PortLinkResult<Option<Bytes>>;

    /// Write the whole buffer, returning the number of bytes written
    async fn write(&mut self, data: &[u8]) -> PortLinkResult<usize>;

    /// Release the underlying handle. Calling it again is a no-op.
    async fn close(&mut self) -> PortLinkResult<()>;
}

/// Opens transports for endpoint configurations
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, config: &EndpointConfig) -> PortLinkResult<Box<dyn Transport>>;
}

/// Connector for the built-in serial and TCP transports
#[derive(Debug, Default, Clone)]
pub struct DefaultConnector;

#[async_trait]
impl Connector for DefaultConnector {
    async fn open(&self, config: &EndpointConfig) -> PortLinkResult<Box<dyn Transport>> {
        let transport: Box<dyn Transport> = match config.transport {
            TransportKind::Serial => Box::new(SerialTransport::open(config).await?),
            TransportKind::TcpClient => Box::new(TcpClientTransport::open(config).await?),
            TransportKind::TcpServer => Box::new(TcpServerTransport::open(config).await?),
        };
        Ok(transport)
    }
}
