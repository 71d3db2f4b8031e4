// Shared test doubles for connection manager tests
#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use portlink::{
    Connector, EndpointConfig, PortLinkError, PortLinkResult, Transport, TransportKind,
};
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Outcome of one `open` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenStep {
    Accept,
    /// Retryable connect error
    Refuse,
    /// Terminal configuration error
    Reject,
}

/// What the test pushes into an open mock transport
#[derive(Debug)]
pub enum Inbound {
    Data(Bytes),
    Eof,
    Error(io::ErrorKind),
}

/// Test-side handle of one opened mock transport
#[derive(Clone)]
pub struct MockLink {
    inbound: mpsc::UnboundedSender<Inbound>,
    written: Arc<Mutex<Vec<u8>>>,
    fail_writes: Arc<AtomicBool>,
    closes: Arc<AtomicUsize>,
}

impl MockLink {
    pub fn push(&self, data: &[u8]) {
        let _ = self.inbound.send(Inbound::Data(Bytes::copy_from_slice(data)));
    }

    pub fn eof(&self) {
        let _ = self.inbound.send(Inbound::Eof);
    }

    pub fn error(&self, kind: io::ErrorKind) {
        let _ = self.inbound.send(Inbound::Error(kind));
    }

    pub fn written(&self) -> Vec<u8> {
        self.written.lock().unwrap().clone()
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

/// Transports opened and not yet closed, with the high-water mark
#[derive(Default)]
struct LiveCount {
    live: AtomicUsize,
    peak: AtomicUsize,
}

pub struct MockTransport {
    inbound: mpsc::UnboundedReceiver<Inbound>,
    link: MockLink,
    closed: bool,
    close_delay: Duration,
    live: Arc<LiveCount>,
}

#[async_trait]
impl Transport for MockTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::TcpClient
    }

    async fn read(&mut self) -> PortLinkResult<Option<Bytes>> {
        if self.closed {
            return Err(PortLinkError::NotConnected);
        }
        match self.inbound.recv().await {
            Some(Inbound::Data(data)) => Ok(Some(data)),
            Some(Inbound::Eof) | None => Ok(None),
            Some(Inbound::Error(kind)) => {
                Err(PortLinkError::Io(io::Error::new(kind, "mock read failure")))
            }
        }
    }

    async fn write(&mut self, data: &[u8]) -> PortLinkResult<usize> {
        if self.closed {
            return Err(PortLinkError::NotConnected);
        }
        if self.link.fail_writes.load(Ordering::SeqCst) {
            return Err(PortLinkError::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "mock write failure",
            )));
        }
        self.link.written.lock().unwrap().extend_from_slice(data);
        Ok(data.len())
    }

    async fn close(&mut self) -> PortLinkResult<()> {
        if !self.closed {
            self.closed = true;
            if !self.close_delay.is_zero() {
                tokio::time::sleep(self.close_delay).await;
            }
            self.link.closes.fetch_add(1, Ordering::SeqCst);
            self.live.live.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Connector that follows a script of open outcomes, then repeats `fallback`
pub struct MockConnector {
    script: Mutex<VecDeque<OpenStep>>,
    fallback: OpenStep,
    opens: Mutex<Vec<Instant>>,
    links: Mutex<Vec<MockLink>>,
    close_delay: Duration,
    live: Arc<LiveCount>,
}

impl MockConnector {
    pub fn new(script: impl IntoIterator<Item = OpenStep>, fallback: OpenStep) -> Arc<Self> {
        Self::build(script.into_iter().collect(), fallback, Duration::ZERO)
    }

    /// Always accepts; every `close` takes `delay` to complete
    pub fn slow_closing(delay: Duration) -> Arc<Self> {
        Self::build(VecDeque::new(), OpenStep::Accept, delay)
    }

    fn build(script: VecDeque<OpenStep>, fallback: OpenStep, close_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script),
            fallback,
            opens: Mutex::new(Vec::new()),
            links: Mutex::new(Vec::new()),
            close_delay,
            live: Arc::new(LiveCount::default()),
        })
    }

    pub fn accepting() -> Arc<Self> {
        Self::new([], OpenStep::Accept)
    }

    pub fn refusing() -> Arc<Self> {
        Self::new([], OpenStep::Refuse)
    }

    pub fn open_count(&self) -> usize {
        self.opens.lock().unwrap().len()
    }

    /// Times of every open attempt
    pub fn open_times(&self) -> Vec<Instant> {
        self.opens.lock().unwrap().clone()
    }

    /// Link of the n-th successfully opened transport
    pub fn link(&self, index: usize) -> MockLink {
        self.links.lock().unwrap()[index].clone()
    }

    pub fn link_count(&self) -> usize {
        self.links.lock().unwrap().len()
    }

    /// Most transports that were ever open at the same time
    pub fn peak_live(&self) -> usize {
        self.live.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(&self, config: &EndpointConfig) -> PortLinkResult<Box<dyn Transport>> {
        self.opens.lock().unwrap().push(Instant::now());
        let step = self.script.lock().unwrap().pop_front().unwrap_or(self.fallback);

        match step {
            OpenStep::Refuse => Err(PortLinkError::connect(format!(
                "Connection refused by {}",
                config.target()
            ))),
            OpenStep::Reject => Err(PortLinkError::config(format!(
                "Settings rejected by {}",
                config.target()
            ))),
            OpenStep::Accept => {
                let (tx, rx) = mpsc::unbounded_channel();
                let link = MockLink {
                    inbound: tx,
                    written: Arc::new(Mutex::new(Vec::new())),
                    fail_writes: Arc::new(AtomicBool::new(false)),
                    closes: Arc::new(AtomicUsize::new(0)),
                };
                self.links.lock().unwrap().push(link.clone());
                let live = self.live.live.fetch_add(1, Ordering::SeqCst) + 1;
                self.live.peak.fetch_max(live, Ordering::SeqCst);
                Ok(Box::new(MockTransport {
                    inbound: rx,
                    link,
                    closed: false,
                    close_delay: self.close_delay,
                    live: Arc::clone(&self.live),
                }))
            }
        }
    }
}

/// Endpoint used with the mock connector
pub fn mock_endpoint() -> EndpointConfig {
    EndpointConfig::tcp_client("mock.local", 4000)
}
