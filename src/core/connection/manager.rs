use crate::core::connection::backoff::Backoff;
use crate::core::connection::state::{ConnectionState, ConnectionStats};
use crate::core::connection::subscriber::{Subscriber, SubscriptionToken};
use crate::core::framer::Framer;
use crate::core::record::Record;
use crate::core::transport::{Connector, DefaultConnector, Transport};
use crate::domain::config::{EndpointConfig, OverflowPolicy, WritePolicy};
use crate::domain::error::{ErrorInfo, ErrorKind, PortLinkError, PortLinkResult};
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

type SubscriberList = Vec<(SubscriptionToken, Arc<dyn Subscriber>)>;

/// Outbound write waiting for the driver
struct WriteCommand {
    data: Bytes,
    reply: oneshot::Sender<PortLinkResult<usize>>,
}

/// Control side of a running driver task
struct DriverHandle {
    commands: mpsc::Sender<WriteCommand>,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

#[derive(Debug, Default)]
struct StatsCounters {
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
    records_received: AtomicU64,
    connects: AtomicU64,
    failures: AtomicU64,
}

impl StatsCounters {
    fn add(counter: &AtomicU64, value: u64) {
        counter.fetch_add(value, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ConnectionStats {
        ConnectionStats {
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            records_received: self.records_received.load(Ordering::Relaxed),
            connects: self.connects.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Shared {
    id: Uuid,
    config: Arc<EndpointConfig>,
    target: String,
    connector: Arc<dyn Connector>,
    subscribers: RwLock<SubscriberList>,
    next_token: AtomicU64,
    state: watch::Sender<ConnectionState>,
    last_error: Mutex<Option<ErrorInfo>>,
    driver: Mutex<Option<DriverHandle>>,
    /// Stopped driver that may still be closing its transport
    retiring: Mutex<Option<JoinHandle<()>>>,
    stats: StatsCounters,
}

impl Shared {
    fn subscriber_snapshot(&self) -> Vec<Arc<dyn Subscriber>> {
        let subscribers = self.subscribers.read().unwrap_or_else(PoisonError::into_inner);
        subscribers.iter().map(|(_, s)| Arc::clone(s)).collect()
    }

    /// Publish a state change to the watch channel and every subscriber
    fn transition(&self, state: ConnectionState, error: Option<ErrorInfo>) {
        // Holding the read lock keeps a concurrent subscribe from replaying
        // a state it would then receive a second time.
        let subscribers = {
            let subscribers = self.subscribers.read().unwrap_or_else(PoisonError::into_inner);
            self.state.send_replace(state);
            *lock(&self.last_error) = error.clone();
            subscribers.iter().map(|(_, s)| Arc::clone(s)).collect::<Vec<_>>()
        };

        match &error {
            Some(info) => warn!("{} is {}: {}", self.target, state, info),
            None => info!("{} is {}", self.target, state),
        }

        for subscriber in subscribers {
            subscriber.on_state_change(state, error.as_ref());
        }
    }

    fn deliver(&self, records: &[Record]) {
        for subscriber in self.subscriber_snapshot() {
            for record in records {
                subscriber.on_record(record);
            }
        }
    }

    fn report(&self, error: &ErrorInfo) {
        for subscriber in self.subscriber_snapshot() {
            subscriber.on_error(error);
        }
    }

    fn dropped_write(&self, len: usize) -> ErrorInfo {
        ErrorInfo::new(
            ErrorKind::NotConnected,
            format!("Dropped write of {} bytes: {} is not connected", len, self.target),
        )
    }

    fn command_sender(&self) -> Option<mpsc::Sender<WriteCommand>> {
        lock(&self.driver).as_ref().map(|driver| driver.commands.clone())
    }

    fn start(self: &Arc<Self>) {
        let mut slot = lock(&self.driver);
        if slot.is_some() {
            return;
        }

        let (commands_tx, commands) = mpsc::channel(self.config.write_queue_limit);
        let (stop_tx, stop) = watch::channel(false);
        let previous = lock(&self.retiring).take();

        let driver = Driver {
            shared: Arc::clone(self),
            commands,
            stop,
            pending: VecDeque::new(),
            framer: Framer::from_config(&self.config)
                .starting_after(self.stats.records_received.load(Ordering::Relaxed)),
            backoff: Backoff::from_policy(&self.config.reconnect),
        };

        debug!("Starting connection driver for {}", self.target);
        let task = tokio::spawn(driver.run(previous));
        *slot = Some(DriverHandle {
            commands: commands_tx,
            stop: stop_tx,
            task,
        });
    }

    /// Signal the driver to stop without waiting for it
    fn stop(&self) {
        let driver = lock(&self.driver).take();
        if let Some(driver) = driver {
            debug!("Stopping connection driver for {}", self.target);
            let _ = driver.stop.send(true);
            *lock(&self.retiring) = Some(driver.task);
        }
    }
}

/// Stops the driver once the last manager handle is gone
struct Owner(Arc<Shared>);

impl Drop for Owner {
    fn drop(&mut self) {
        self.0.stop();
    }
}

/// Owns the connection to one endpoint and fans its output out to subscribers.
///
/// A single driver task holds the transport and the framer. It opens the
/// transport, reads and frames inbound bytes, performs queued writes one at a
/// time and reconnects with exponential backoff after failures. The driver
/// starts with the first subscriber and stops when the last one leaves,
/// unless the endpoint is configured with `keep_alive`.
///
/// Handles are cheap to clone; all clones drive the same connection.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
    _owner: Arc<Owner>,
}

impl ConnectionManager {
    /// Create a manager for a validated endpoint. Nothing is opened yet.
    pub fn new(config: EndpointConfig, connector: Arc<dyn Connector>) -> PortLinkResult<Self> {
        config.validate()?;

        let target = config.target();
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let shared = Arc::new(Shared {
            id: Uuid::new_v4(),
            config: Arc::new(config),
            target,
            connector,
            subscribers: RwLock::new(Vec::new()),
            next_token: AtomicU64::new(1),
            state,
            last_error: Mutex::new(None),
            driver: Mutex::new(None),
            retiring: Mutex::new(None),
            stats: StatsCounters::default(),
        });

        Ok(Self {
            _owner: Arc::new(Owner(Arc::clone(&shared))),
            shared,
        })
    }

    /// Manager using the built-in serial and TCP transports
    pub fn with_default_connector(config: EndpointConfig) -> PortLinkResult<Self> {
        Self::new(config, Arc::new(DefaultConnector))
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.shared.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Error attached to the current state, if any
    pub fn last_error(&self) -> Option<ErrorInfo> {
        lock(&self.shared.last_error).clone()
    }

    pub fn stats(&self) -> ConnectionStats {
        self.shared.stats.snapshot()
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_running(&self) -> bool {
        lock(&self.shared.driver).is_some()
    }

    /// Start the driver if it is not running. Must be called inside a tokio runtime.
    pub fn start(&self) {
        self.shared.start();
    }

    /// Register a subscriber.
    ///
    /// The current state is replayed to the new subscriber only, then the
    /// driver is started if it was idle.
    pub fn subscribe(&self, subscriber: Arc<dyn Subscriber>) -> SubscriptionToken {
        let token = SubscriptionToken(self.shared.next_token.fetch_add(1, Ordering::Relaxed));
        {
            let mut subscribers = self
                .shared
                .subscribers
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            let state = *self.shared.state.borrow();
            let error = lock(&self.shared.last_error).clone();
            subscriber.on_state_change(state, error.as_ref());
            subscribers.push((token, subscriber));
        }
        debug!("Subscriber {} added to {}", token.id(), self.shared.target);

        self.start();
        token
    }

    /// Remove a subscriber. Returns false for unknown tokens.
    pub fn unsubscribe(&self, token: SubscriptionToken) -> bool {
        let (removed, remaining) = {
            let mut subscribers = self
                .shared
                .subscribers
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            let before = subscribers.len();
            subscribers.retain(|(t, _)| *t != token);
            (subscribers.len() != before, subscribers.len())
        };

        if removed {
            debug!("Subscriber {} removed from {}", token.id(), self.shared.target);
            if remaining == 0 && !self.shared.config.keep_alive {
                info!("Last subscriber left {}, closing", self.shared.target);
                self.shared.stop();
            }
        }
        removed
    }

    /// Write bytes to the endpoint.
    ///
    /// Writes are performed one at a time in call order. What happens while
    /// the endpoint is not connected depends on the write policy.
    pub async fn send(&self, data: impl Into<Bytes>) -> PortLinkResult<usize> {
        let data = data.into();
        let commands = self
            .shared
            .command_sender()
            .ok_or(PortLinkError::NotConnected)?;

        if self.shared.config.write_policy == WritePolicy::Drop && !self.state().is_connected() {
            let info = self.shared.dropped_write(data.len());
            debug!("{}", info);
            self.shared.report(&info);
            return Err(PortLinkError::NotConnected);
        }

        let (reply, response) = oneshot::channel();
        commands
            .send(WriteCommand { data, reply })
            .await
            .map_err(|_| PortLinkError::NotConnected)?;
        response.await.map_err(|_| PortLinkError::NotConnected)?
    }

    /// Stop the driver and wait until the transport is closed.
    ///
    /// Applies regardless of `keep_alive`. Subscribers stay registered; a
    /// later `start` or `subscribe` reconnects.
    pub async fn shutdown(&self) {
        self.shared.stop();
        let task = lock(&self.shared.retiring).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!("Connection driver for {} ended abnormally: {}", self.shared.target, e);
            }
        }
    }

    /// Wait until the manager reaches `state`. Returns false on timeout.
    pub async fn wait_for_state(&self, state: ConnectionState, timeout: Duration) -> bool {
        let mut states = self.shared.state.subscribe();
        let reached = tokio::time::timeout(timeout, async move {
            let reached = states.wait_for(|current| *current == state).await.is_ok();
            reached
        })
        .await;
        reached.unwrap_or(false)
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("id", &self.shared.id)
            .field("target", &self.shared.target)
            .field("state", &self.state())
            .finish()
    }
}

enum Opened {
    Ready(Box<dyn Transport>),
    Failed(PortLinkError),
    Stopped,
}

enum Exit {
    Stopped,
    Lost(ErrorInfo),
}

enum Inbound {
    Data(Bytes),
    Eof,
    Idle,
}

async fn stopped(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stop| *stop).await;
}

/// Read once, giving up after `idle` so a partial record can be flushed
async fn next_inbound(
    transport: &mut dyn Transport,
    idle: Option<Duration>,
) -> PortLinkResult<Inbound> {
    let read = async {
        let chunk = transport.read().await?;
        Ok::<_, PortLinkError>(chunk.map_or(Inbound::Eof, Inbound::Data))
    };
    match idle {
        Some(limit) => tokio::time::timeout(limit, read)
            .await
            .unwrap_or(Ok(Inbound::Idle)),
        None => read.await,
    }
}

/// State owned by the driver task
struct Driver {
    shared: Arc<Shared>,
    commands: mpsc::Receiver<WriteCommand>,
    stop: watch::Receiver<bool>,
    /// Writes held while offline, or interrupted and awaiting a retry
    pending: VecDeque<WriteCommand>,
    framer: Framer,
    backoff: Backoff,
}

impl Driver {
    async fn run(mut self, previous: Option<JoinHandle<()>>) {
        if let Some(previous) = previous {
            let _ = previous.await;
        }
        info!("Connection driver started for {}", self.shared.target);

        loop {
            self.shared.transition(ConnectionState::Connecting, None);

            let failure = match self.open().await {
                Opened::Stopped => break,
                Opened::Ready(transport) => match self.serve(transport).await {
                    Exit::Stopped => break,
                    Exit::Lost(info) => info,
                },
                Opened::Failed(e) if e.is_terminal() => {
                    error!("{}: {}", self.shared.target, e);
                    StatsCounters::add(&self.shared.stats.failures, 1);
                    self.shared.transition(ConnectionState::Failed, Some(e.info()));
                    self.park().await;
                    break;
                }
                Opened::Failed(e) => e.info(),
            };

            StatsCounters::add(&self.shared.stats.failures, 1);
            self.shared.transition(ConnectionState::Failed, Some(failure));

            match self.backoff.next_delay() {
                Some(delay) => {
                    warn!(
                        "Reconnecting to {} in {:?} (attempt {})",
                        self.shared.target,
                        delay,
                        self.backoff.failures()
                    );
                    if !self.wait(delay).await {
                        break;
                    }
                }
                None => {
                    error!(
                        "Giving up on {} after {} consecutive failures",
                        self.shared.target,
                        self.backoff.failures()
                    );
                    self.park().await;
                    break;
                }
            }
        }

        self.finish();
    }

    /// Whether commands are taken off the channel while offline
    fn accepts_offline(&self) -> bool {
        self.shared.config.write_policy != WritePolicy::Block
    }

    async fn open(&mut self) -> Opened {
        let connector = Arc::clone(&self.shared.connector);
        let config = Arc::clone(&self.shared.config);
        let mut open = connector.open(&config);
        let offline = self.accepts_offline();

        loop {
            tokio::select! {
                biased;

                _ = stopped(&mut self.stop) => return Opened::Stopped,
                command = self.commands.recv(), if offline => match command {
                    Some(command) => self.hold(command),
                    None => return Opened::Stopped,
                },
                result = &mut open => {
                    return match result {
                        Ok(transport) => Opened::Ready(transport),
                        Err(e) => Opened::Failed(e),
                    };
                }
            }
        }
    }

    /// Sleep out a backoff delay. Returns false if stopped meanwhile.
    async fn wait(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        let offline = self.accepts_offline();

        loop {
            tokio::select! {
                biased;

                _ = stopped(&mut self.stop) => return false,
                command = self.commands.recv(), if offline => match command {
                    Some(command) => self.hold(command),
                    None => return false,
                },
                _ = &mut sleep => return true,
            }
        }
    }

    /// Stay failed until stopped, rejecting every write
    async fn park(&mut self) {
        while let Some(command) = self.pending.pop_front() {
            self.reject(command);
        }

        loop {
            tokio::select! {
                biased;

                _ = stopped(&mut self.stop) => return,
                command = self.commands.recv() => match command {
                    Some(command) => self.reject(command),
                    None => return,
                },
            }
        }
    }

    async fn serve(&mut self, mut transport: Box<dyn Transport>) -> Exit {
        StatsCounters::add(&self.shared.stats.connects, 1);
        self.framer.reset();
        self.shared.transition(ConnectionState::Connected, None);
        let connected_at = Instant::now();

        let exit = self.pump(transport.as_mut()).await;

        if matches!(exit, Exit::Stopped) {
            self.shared.transition(ConnectionState::Closing, None);
        }
        if let Err(e) = transport.close().await {
            warn!("Failed to close {}: {}", self.shared.target, e);
        }

        let stable_after = Duration::from_millis(self.shared.config.reconnect.stable_after_ms);
        if connected_at.elapsed() >= stable_after {
            self.backoff.reset();
        }
        exit
    }

    async fn pump(&mut self, transport: &mut dyn Transport) -> Exit {
        while let Some(command) = self.pending.pop_front() {
            if let Err(info) = self.write(&mut *transport, command).await {
                return Exit::Lost(info);
            }
        }

        loop {
            let idle = if self.framer.pending() > 0 {
                self.shared.config.flush_timeout()
            } else {
                None
            };

            tokio::select! {
                biased;

                _ = stopped(&mut self.stop) => return Exit::Stopped,
                command = self.commands.recv() => match command {
                    Some(command) => {
                        if let Err(info) = self.write(&mut *transport, command).await {
                            return Exit::Lost(info);
                        }
                    }
                    None => return Exit::Stopped,
                },
                inbound = next_inbound(&mut *transport, idle) => match inbound {
                    Ok(Inbound::Data(chunk)) => {
                        if let Err(info) = self.ingest(&chunk) {
                            return Exit::Lost(info);
                        }
                    }
                    Ok(Inbound::Idle) => {
                        if self.framer.flush_pending() {
                            debug!(
                                "Flushed partial record from {} after idle timeout",
                                self.shared.target
                            );
                            self.deliver();
                        }
                    }
                    Ok(Inbound::Eof) => {
                        let info = ErrorInfo::new(ErrorKind::Io, "connection closed by peer");
                        return Exit::Lost(info);
                    }
                    Err(e) => return Exit::Lost(e.info()),
                },
            }
        }
    }

    fn ingest(&mut self, chunk: &[u8]) -> Result<(), ErrorInfo> {
        StatsCounters::add(&self.shared.stats.bytes_received, chunk.len() as u64);
        let pushed = self.framer.push(chunk);
        self.deliver();

        match pushed {
            Ok(()) => Ok(()),
            Err(e @ PortLinkError::FramingOverflow { .. })
                if self.shared.config.overflow_policy == OverflowPolicy::Fatal =>
            {
                error!("{}: {}", self.shared.target, e);
                Err(e.info())
            }
            Err(e) => {
                warn!("{}: {}", self.shared.target, e);
                self.shared.report(&e.info());
                Ok(())
            }
        }
    }

    fn deliver(&mut self) {
        let records = self.framer.drain();
        if records.is_empty() {
            return;
        }
        StatsCounters::add(&self.shared.stats.records_received, records.len() as u64);
        self.shared.deliver(&records);
    }

    async fn write(
        &mut self,
        transport: &mut dyn Transport,
        command: WriteCommand,
    ) -> Result<(), ErrorInfo> {
        match transport.write(&command.data).await {
            Ok(written) => {
                StatsCounters::add(&self.shared.stats.bytes_sent, written as u64);
                let _ = command.reply.send(Ok(written));
                Ok(())
            }
            Err(e) => {
                let info = e.info();
                if self.shared.config.write_policy == WritePolicy::Buffer {
                    debug!(
                        "Write of {} bytes to {} interrupted, retrying after reconnect",
                        command.data.len(),
                        self.shared.target
                    );
                    self.pending.push_front(command);
                } else {
                    let _ = command.reply.send(Err(e));
                }
                Err(info)
            }
        }
    }

    /// Handle a write that arrived while not connected
    fn hold(&mut self, command: WriteCommand) {
        match self.shared.config.write_policy {
            WritePolicy::Drop => self.reject(command),
            WritePolicy::Block => self.pending.push_back(command),
            WritePolicy::Buffer => {
                if self.pending.len() < self.shared.config.write_queue_limit {
                    debug!(
                        "Buffered {} bytes for {} while offline",
                        command.data.len(),
                        self.shared.target
                    );
                    self.pending.push_back(command);
                } else {
                    warn!(
                        "Write queue for {} is full ({} writes)",
                        self.shared.target, self.shared.config.write_queue_limit
                    );
                    self.reject(command);
                }
            }
        }
    }

    fn reject(&self, command: WriteCommand) {
        self.shared.report(&self.shared.dropped_write(command.data.len()));
        let _ = command.reply.send(Err(PortLinkError::NotConnected));
    }

    fn finish(mut self) {
        self.commands.close();
        while let Some(command) = self.pending.pop_front() {
            let _ = command.reply.send(Err(PortLinkError::NotConnected));
        }
        while let Ok(command) = self.commands.try_recv() {
            let _ = command.reply.send(Err(PortLinkError::NotConnected));
        }

        self.shared.transition(ConnectionState::Disconnected, None);
        info!("Connection driver for {} stopped", self.shared.target);
    }
}
