use crate::core::transport::Transport;
use crate::domain::config::{AcceptPolicy, EndpointConfig, TransportKind};
use crate::domain::error::{PortLinkError, PortLinkResult};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// Peers waiting behind the active one under `AcceptPolicy::Queue`
pub const MAX_QUEUED_PEERS: usize = 8;

#[derive(Debug)]
struct Peer {
    stream: TcpStream,
    addr: SocketAddr,
}

/// Listening TCP transport with one active peer at a time.
///
/// `open` binds and waits for the first peer. The listener keeps accepting
/// while a peer is active; newcomers either replace the active peer or wait
/// in a bounded queue, depending on the accept policy.
pub struct TcpServerTransport {
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
    active: Option<Peer>,
    queued: VecDeque<Peer>,
    policy: AcceptPolicy,
    chunk: usize,
}

impl TcpServerTransport {
    pub async fn open(config: &EndpointConfig) -> PortLinkResult<Self> {
        let bind_addr = format!("{}:{}", config.address, config.port);
        let listener = TcpListener::bind(bind_addr.as_str()).await.map_err(|e| {
            PortLinkError::connect(format!("Failed to bind to {}: {}", bind_addr, e))
        })?;

        let local_addr = listener
            .local_addr()
            .map_err(|e| PortLinkError::connect(format!("Failed to get local address: {}", e)))?;

        info!("TCP server listening on {}", local_addr);

        let (stream, addr) = listener.accept().await.map_err(|e| {
            PortLinkError::connect(format!("Failed to accept connection on {}: {}", local_addr, e))
        })?;

        info!("Peer connected: {}", addr);

        Ok(Self {
            listener: Some(listener),
            local_addr,
            active: Some(Peer { stream, addr }),
            queued: VecDeque::new(),
            policy: config.accept_policy,
            chunk: config.read_chunk_size(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.active.as_ref().map(|peer| peer.addr)
    }

    pub fn queued_peers(&self) -> usize {
        self.queued.len()
    }

    fn admit(&mut self, stream: TcpStream, addr: SocketAddr) {
        match self.policy {
            AcceptPolicy::Replace => {
                if let Some(old) = self.active.replace(Peer { stream, addr }) {
                    info!("Peer {} replaced by {}", old.addr, addr);
                } else {
                    info!("Peer connected: {}", addr);
                }
            }
            AcceptPolicy::Queue => {
                if self.active.is_none() {
                    self.active = Some(Peer { stream, addr });
                    info!("Peer connected: {}", addr);
                } else if self.queued.len() >= MAX_QUEUED_PEERS {
                    warn!("Rejecting peer {}: {} peers already queued", addr, MAX_QUEUED_PEERS);
                } else {
                    debug!("Queued peer {}", addr);
                    self.queued.push_back(Peer { stream, addr });
                }
            }
        }
    }

    /// Move the oldest queued peer into the active slot
    fn promote(&mut self) -> bool {
        self.active = self.queued.pop_front();
        match &self.active {
            Some(peer) => {
                info!("Promoted queued peer {}", peer.addr);
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl Transport for TcpServerTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::TcpServer
    }

    async fn read(&mut self) -> PortLinkResult<Option<Bytes>> {
        loop {
            let listener = self.listener.as_ref().ok_or(PortLinkError::NotConnected)?;
            let peer = self.active.as_mut().ok_or(PortLinkError::NotConnected)?;
            let mut buffer = BytesMut::with_capacity(self.chunk);

            // Pending peers are admitted before the active peer is read.
            tokio::select! {
                biased;

                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => self.admit(stream, addr),
                        Err(e) => warn!("Failed to accept connection: {}", e),
                    }
                }
                read = peer.stream.read_buf(&mut buffer) => {
                    match read {
                        Ok(0) => {
                            info!("Peer disconnected: {}", peer.addr);
                            if !self.promote() {
                                return Ok(None);
                            }
                        }
                        Ok(n) => {
                            debug!("Received {} bytes from {}", n, peer.addr);
                            return Ok(Some(buffer.freeze()));
                        }
                        Err(e) => {
                            warn!("Read error from {}: {}", peer.addr, e);
                            if !self.promote() {
                                return Err(PortLinkError::Io(e));
                            }
                        }
                    }
                }
            }
        }
    }

    async fn write(&mut self, data: &[u8]) -> PortLinkResult<usize> {
        let peer = self.active.as_mut().ok_or(PortLinkError::NotConnected)?;
        peer.stream.write_all(data).await?;
        peer.stream.flush().await?;
        debug!("Sent {} bytes to {}", data.len(), peer.addr);
        Ok(data.len())
    }

    async fn close(&mut self) -> PortLinkResult<()> {
        if self.listener.take().is_none() {
            return Ok(());
        }
        if let Some(mut peer) = self.active.take() {
            if let Err(e) = peer.stream.shutdown().await {
                warn!("Failed to shutdown stream for {}: {}", peer.addr, e);
            }
        }
        self.queued.clear();
        info!("TCP server on {} closed", self.local_addr);
        Ok(())
    }
}
