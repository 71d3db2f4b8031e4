use crate::core::transport::Transport;
use crate::domain::config::{EndpointConfig, TransportKind};
use crate::domain::error::{PortLinkError, PortLinkResult};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Active-connect TCP transport
pub struct TcpClientTransport {
    stream: Option<TcpStream>,
    peer: Option<SocketAddr>,
    chunk: usize,
}

impl TcpClientTransport {
    pub async fn open(config: &EndpointConfig) -> PortLinkResult<Self> {
        let host = config.address.as_str();
        let port = config.port;

        // Connect with timeout
        let connect = TcpStream::connect((host, port));
        let stream = tokio::time::timeout(config.connect_timeout(), connect)
            .await
            .map_err(|_| {
                PortLinkError::connect(format!("Connection timeout to {}:{}", host, port))
            })?
            .map_err(|e| {
                PortLinkError::connect(format!("Failed to connect to {}:{}: {}", host, port, e))
            })?;

        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY: {}", e);
        }

        let peer = stream.peer_addr().ok();
        info!("TCP connection established to {}:{}", host, port);

        Ok(Self {
            stream: Some(stream),
            peer,
            chunk: config.read_chunk_size(),
        })
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }
}

#[async_trait]
impl Transport for TcpClientTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::TcpClient
    }

    async fn read(&mut self) -> PortLinkResult<Option<Bytes>> {
        let stream = self.stream.as_mut().ok_or(PortLinkError::NotConnected)?;
        let mut buffer = BytesMut::with_capacity(self.chunk);

        match stream.read_buf(&mut buffer).await? {
            0 => {
                info!("TCP connection closed by peer");
                Ok(None)
            }
            n => {
                debug!("Received {} bytes over TCP", n);
                Ok(Some(buffer.freeze()))
            }
        }
    }

    async fn write(&mut self, data: &[u8]) -> PortLinkResult<usize> {
        let stream = self.stream.as_mut().ok_or(PortLinkError::NotConnected)?;
        stream.write_all(data).await?;
        stream.flush().await?;
        debug!("Sent {} bytes over TCP", data.len());
        Ok(data.len())
    }

    async fn close(&mut self) -> PortLinkResult<()> {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown().await {
                warn!("Failed to shutdown TCP stream: {}", e);
            }
            info!("TCP client closed");
        }
        Ok(())
    }
}
