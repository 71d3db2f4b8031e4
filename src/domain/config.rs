use crate::domain::error::{PortLinkError, PortLinkResult};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;

const MAX_READ_CHUNK: usize = 64 * 1024;

/// PortLink configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortLinkConfig {
    /// Global configuration
    #[serde(default)]
    pub global: GlobalConfig,
    /// Named endpoint configurations
    #[serde(default)]
    pub endpoints: Vec<NamedEndpoint>,
}

/// Global configuration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalConfig {
    /// Default log level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Endpoint entry in the configuration file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamedEndpoint {
    /// Endpoint name used on the command line
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(flatten)]
    pub endpoint: EndpointConfig,
}

/// Transport kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    Serial,
    TcpServer,
    TcpClient,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Serial => write!(f, "serial"),
            TransportKind::TcpServer => write!(f, "tcp-server"),
            TransportKind::TcpClient => write!(f, "tcp-client"),
        }
    }
}

/// Parity configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParityConfig {
    #[default]
    None,
    Odd,
    Even,
}

/// Flow control configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowControlConfig {
    #[default]
    None,
    Hardware,
    Software,
}

/// How inbound bytes are cut into records
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FramingMode {
    /// One record per read, bytes verbatim
    #[default]
    Raw,
    /// Records terminated by `split_char`
    SplitChar,
    /// Base64 text decoded in aligned 4-character quanta
    Base64,
    /// Records of exactly `buffer_size` bytes
    FixedSize,
    /// Brace-balanced JSON objects
    Json,
}

/// Payload representation of delimited records
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputEncoding {
    #[default]
    Buffer,
    Utf8,
}

/// What happens to `send` calls outside the connected state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WritePolicy {
    /// Fail immediately with `NotConnected`
    #[default]
    Drop,
    /// Wait until the endpoint is connected
    Block,
    /// Queue while offline and retry interrupted writes after reconnect
    Buffer,
}

/// What happens when a partial record exceeds `buffer_size`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Flush the partial record, notify and keep reading
    #[default]
    Drop,
    /// Treat as a connection failure
    Fatal,
}

/// Server-role handling of a second peer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AcceptPolicy {
    /// New peer replaces the active one
    #[default]
    Replace,
    /// New peers wait until the active one closes
    Queue,
}

/// Reconnect and backoff policy
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Consecutive retries before giving up; `None` retries forever
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(default = "default_backoff_seed_ms")]
    pub backoff_seed_ms: u64,
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
    /// Connected time after which the backoff resets to the seed
    #[serde(default = "default_stable_after_ms")]
    pub stable_after_ms: u64,
}

/// Immutable description of one connection target.
///
/// Two configs with equal fields denote the same endpoint; the registry
/// uses this structural identity to share one connection manager.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub transport: TransportKind,
    /// Serial device path, or host/bind address for TCP
    pub address: String,
    /// TCP port; ignored for serial
    #[serde(default)]
    pub port: u16,
    #[serde(default = "default_baud")]
    pub baud: u32,
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    #[serde(default)]
    pub parity: ParityConfig,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    #[serde(default)]
    pub flow_control: FlowControlConfig,
    #[serde(default)]
    pub framing: FramingMode,
    #[serde(default = "default_split_char")]
    pub split_char: u8,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default)]
    pub topic: String,
    #[serde(default)]
    pub output: OutputEncoding,
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
    #[serde(default)]
    pub write_policy: WritePolicy,
    #[serde(default = "default_write_queue_limit")]
    pub write_queue_limit: usize,
    #[serde(default)]
    pub overflow_policy: OverflowPolicy,
    #[serde(default)]
    pub accept_policy: AcceptPolicy,
    /// Keep the connection open after the last subscriber leaves
    #[serde(default)]
    pub keep_alive: bool,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Emit an unterminated record after this much read inactivity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flush_timeout_ms: Option<u64>,
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_baud() -> u32 {
    57600
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

fn default_split_char() -> u8 {
    b'\n'
}

fn default_buffer_size() -> usize {
    4096
}

fn default_write_queue_limit() -> usize {
    64
}

fn default_connect_timeout_ms() -> u64 {
    3000
}

fn default_backoff_seed_ms() -> u64 {
    500
}

fn default_backoff_cap_ms() -> u64 {
    30_000
}

fn default_stable_after_ms() -> u64 {
    10_000
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: None,
            backoff_seed_ms: default_backoff_seed_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            stable_after_ms: default_stable_after_ms(),
        }
    }
}

impl ReconnectPolicy {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

impl EndpointConfig {
    fn with_defaults(transport: TransportKind, address: String, port: u16) -> Self {
        Self {
            transport,
            address,
            port,
            baud: default_baud(),
            data_bits: default_data_bits(),
            parity: ParityConfig::default(),
            stop_bits: default_stop_bits(),
            flow_control: FlowControlConfig::default(),
            framing: FramingMode::default(),
            split_char: default_split_char(),
            buffer_size: default_buffer_size(),
            topic: String::new(),
            output: OutputEncoding::default(),
            reconnect: ReconnectPolicy::default(),
            write_policy: WritePolicy::default(),
            write_queue_limit: default_write_queue_limit(),
            overflow_policy: OverflowPolicy::default(),
            accept_policy: AcceptPolicy::default(),
            keep_alive: false,
            connect_timeout_ms: default_connect_timeout_ms(),
            flush_timeout_ms: None,
        }
    }

    pub fn serial(port: impl Into<String>) -> Self {
        Self::with_defaults(TransportKind::Serial, port.into(), 0)
    }

    pub fn tcp_client(host: impl Into<String>, port: u16) -> Self {
        Self::with_defaults(TransportKind::TcpClient, host.into(), port)
    }

    pub fn tcp_server(bind: impl Into<String>, port: u16) -> Self {
        Self::with_defaults(TransportKind::TcpServer, bind.into(), port)
    }

    pub fn with_framing(mut self, framing: FramingMode) -> Self {
        self.framing = framing;
        self
    }

    pub fn with_split_char(mut self, split_char: u8) -> Self {
        self.framing = FramingMode::SplitChar;
        self.split_char = split_char;
        self
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_write_policy(mut self, policy: WritePolicy) -> Self {
        self.write_policy = policy;
        self
    }

    pub fn with_overflow_policy(mut self, policy: OverflowPolicy) -> Self {
        self.overflow_policy = policy;
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Check field ranges. Failures are terminal configuration errors.
    pub fn validate(&self) -> PortLinkResult<()> {
        if self.address.trim().is_empty() {
            return Err(PortLinkError::config(format!(
                "{} endpoint requires an address",
                self.transport
            )));
        }

        match self.transport {
            TransportKind::Serial => {
                if self.baud == 0 {
                    return Err(PortLinkError::config("Invalid baud rate: 0"));
                }
                if !(5..=8).contains(&self.data_bits) {
                    return Err(PortLinkError::config(format!(
                        "Invalid data bits: {}",
                        self.data_bits
                    )));
                }
                if !(1..=2).contains(&self.stop_bits) {
                    return Err(PortLinkError::config(format!(
                        "Invalid stop bits: {}",
                        self.stop_bits
                    )));
                }
            }
            TransportKind::TcpClient => {
                if self.port == 0 {
                    return Err(PortLinkError::config("TCP client requires a non-zero port"));
                }
            }
            TransportKind::TcpServer => {}
        }

        if self.buffer_size == 0 {
            return Err(PortLinkError::config("Buffer size must be greater than zero"));
        }

        if self.write_queue_limit == 0 {
            return Err(PortLinkError::config("Write queue limit must be greater than zero"));
        }

        if self.connect_timeout_ms == 0 {
            return Err(PortLinkError::config("Connect timeout must be greater than zero"));
        }

        let reconnect = &self.reconnect;
        if reconnect.enabled && reconnect.backoff_seed_ms == 0 {
            return Err(PortLinkError::config("Backoff seed must be greater than zero"));
        }
        if reconnect.backoff_cap_ms < reconnect.backoff_seed_ms {
            return Err(PortLinkError::config(format!(
                "Backoff cap ({} ms) is below the seed ({} ms)",
                reconnect.backoff_cap_ms, reconnect.backoff_seed_ms
            )));
        }

        Ok(())
    }

    /// Structural hash of every field
    pub fn identity(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }

    /// Short human-readable target, e.g. `tcp-client://127.0.0.1:4000`
    pub fn target(&self) -> String {
        match self.transport {
            TransportKind::Serial => format!("serial://{}@{}", self.address, self.baud),
            kind => format!("{}://{}:{}", kind, self.address, self.port),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn flush_timeout(&self) -> Option<Duration> {
        self.flush_timeout_ms.map(Duration::from_millis)
    }

    /// Upper bound for a single transport read
    pub fn read_chunk_size(&self) -> usize {
        self.buffer_size.clamp(1, MAX_READ_CHUNK)
    }
}
