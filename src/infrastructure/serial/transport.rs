use crate::core::transport::Transport;
use crate::domain::config::{EndpointConfig, FlowControlConfig, ParityConfig, TransportKind};
use crate::domain::error::{PortLinkError, PortLinkResult};
use async_trait::async_trait;
use bytes::Bytes;
use serialport::SerialPort;
use std::io::{self, Read, Write};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Port timeout; bounds how long a blocking read holds the port
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Upper bound on waiting for an in-flight read during `close`
const CLOSE_GRACE: Duration = Duration::from_millis(500);

type PendingRead = JoinHandle<(Box<dyn SerialPort>, io::Result<Vec<u8>>)>;

/// Serial port transport.
///
/// `serialport` is blocking, so reads and writes run on the blocking pool
/// against two cloned handles of the same port. A read that is still in
/// flight when the caller stops waiting is kept and resumed by the next
/// `read`, so no bytes are lost to cancellation.
pub struct SerialTransport {
    path: String,
    reader: Option<Box<dyn SerialPort>>,
    writer: Option<Box<dyn SerialPort>>,
    pending: Option<PendingRead>,
    chunk: usize,
    closed: bool,
}

impl SerialTransport {
    pub async fn open(config: &EndpointConfig) -> PortLinkResult<Self> {
        let builder = port_builder(config)?;
        let path = config.address.clone();

        let port = tokio::task::spawn_blocking(move || builder.open())
            .await
            .map_err(|e| PortLinkError::connect(format!("Serial open task failed: {}", e)))?
            .map_err(|e| classify_open_error(&path, e))?;

        let writer = port
            .try_clone()
            .map_err(|e| classify_open_error(&path, e))?;

        info!(
            "Serial port {} opened ({} baud, {} data bits, parity {:?}, {} stop bits)",
            path, config.baud, config.data_bits, config.parity, config.stop_bits
        );

        Ok(Self {
            path,
            reader: Some(port),
            writer: Some(writer),
            pending: None,
            chunk: config.read_chunk_size(),
            closed: false,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn start_read(&mut self) -> PortLinkResult<()> {
        let mut port = self.reader.take().ok_or(PortLinkError::NotConnected)?;
        let chunk = self.chunk;

        self.pending = Some(tokio::task::spawn_blocking(move || {
            let mut buffer = vec![0u8; chunk];
            let result = port.read(&mut buffer).map(|n| {
                buffer.truncate(n);
                buffer
            });
            (port, result)
        }));

        Ok(())
    }
}

/// Build the port settings, rejecting combinations `serialport` cannot express
pub fn port_builder(config: &EndpointConfig) -> PortLinkResult<serialport::SerialPortBuilder> {
    let data_bits = match config.data_bits {
        5 => serialport::DataBits::Five,
        6 => serialport::DataBits::Six,
        7 => serialport::DataBits::Seven,
        8 => serialport::DataBits::Eight,
        other => {
            return Err(PortLinkError::config(format!("Invalid data bits: {}", other)));
        }
    };

    let stop_bits = match config.stop_bits {
        1 => serialport::StopBits::One,
        2 => serialport::StopBits::Two,
        other => {
            return Err(PortLinkError::config(format!("Invalid stop bits: {}", other)));
        }
    };

    let parity = match config.parity {
        ParityConfig::None => serialport::Parity::None,
        ParityConfig::Even => serialport::Parity::Even,
        ParityConfig::Odd => serialport::Parity::Odd,
    };

    let flow_control = match config.flow_control {
        FlowControlConfig::None => serialport::FlowControl::None,
        FlowControlConfig::Software => serialport::FlowControl::Software,
        FlowControlConfig::Hardware => serialport::FlowControl::Hardware,
    };

    if config.baud == 0 {
        return Err(PortLinkError::config("Invalid baud rate: 0"));
    }

    Ok(serialport::new(config.address.as_str(), config.baud)
        .data_bits(data_bits)
        .stop_bits(stop_bits)
        .parity(parity)
        .flow_control(flow_control)
        .timeout(POLL_TIMEOUT))
}

/// Settings the platform rejects are terminal; everything else is retried.
pub fn classify_open_error(path: &str, error: serialport::Error) -> PortLinkError {
    match error.kind {
        serialport::ErrorKind::InvalidInput => PortLinkError::config(format!(
            "Serial settings rejected for {}: {}",
            path, error
        )),
        _ => PortLinkError::connect(format!("Failed to open serial port {}: {}", path, error)),
    }
}

fn join_error(error: tokio::task::JoinError) -> PortLinkError {
    PortLinkError::Io(io::Error::new(io::ErrorKind::Other, error))
}

/// Wait for a blocking task so the port handle it owns is dropped.
/// Returns false if it is still running after `limit`.
async fn settle<T>(task: JoinHandle<T>, limit: Duration) -> bool {
    tokio::time::timeout(limit, task).await.is_ok()
}

#[async_trait]
impl Transport for SerialTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Serial
    }

    async fn read(&mut self) -> PortLinkResult<Option<Bytes>> {
        loop {
            if self.closed {
                return Err(PortLinkError::NotConnected);
            }
            if self.pending.is_none() {
                self.start_read()?;
            }

            let joined = match self.pending.as_mut() {
                Some(handle) => handle.await,
                None => return Err(PortLinkError::NotConnected),
            };
            self.pending = None;

            let (port, result) = joined.map_err(join_error)?;
            self.reader = Some(port);

            match result {
                // No data within the port timeout
                Ok(data) if data.is_empty() => continue,
                Ok(data) => {
                    debug!("Received {} bytes over serial", data.len());
                    return Ok(Some(Bytes::from(data)));
                }
                Err(ref e) if e.kind() == io::ErrorKind::TimedOut => continue,
                Err(e) => return Err(PortLinkError::Io(e)),
            }
        }
    }

    async fn write(&mut self, data: &[u8]) -> PortLinkResult<usize> {
        let mut port = self.writer.take().ok_or(PortLinkError::NotConnected)?;
        let data = data.to_vec();

        let (port, result) = tokio::task::spawn_blocking(move || {
            let result = port
                .write_all(&data)
                .and_then(|_| port.flush())
                .map(|_| data.len());
            (port, result)
        })
        .await
        .map_err(join_error)?;

        self.writer = Some(port);
        let written = result?;
        debug!("Sent {} bytes over serial", written);
        Ok(written)
    }

    async fn close(&mut self) -> PortLinkResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        if let Some(pending) = self.pending.take() {
            debug!("Waiting for in-flight serial read on {}", self.path);
            if !settle(pending, CLOSE_GRACE).await {
                warn!("Serial read on {} did not finish within {:?}", self.path, CLOSE_GRACE);
            }
        }
        self.reader = None;
        self.writer = None;

        info!("Serial port {} closed", self.path);
        Ok(())
    }
}
