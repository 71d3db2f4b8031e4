use crate::domain::config::{
    AcceptPolicy, EndpointConfig, FlowControlConfig, FramingMode, OutputEncoding, ParityConfig,
    PortLinkConfig, ReconnectPolicy, WritePolicy,
};
use crate::domain::error::{PortLinkError, PortLinkResult};
use crate::infrastructure::config::find_endpoint;
use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Command line arguments for PortLink
#[derive(Parser, Debug)]
#[command(
    name = "portlink",
    version = env!("CARGO_PKG_VERSION"),
    about = "Serial and TCP endpoint monitor",
    long_about = "Opens serial ports and TCP sockets, keeps them connected with exponential backoff, splits inbound bytes into records and sends data to the endpoint."
)]
pub struct Args {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress log output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Configuration file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Output format
    #[arg(short, long, value_enum, default_value = "text", global = true)]
    pub output: OutputFormat,

    /// Command to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print records received from an endpoint until interrupted
    Listen {
        #[command(flatten)]
        endpoint: EndpointArgs,
        /// Stop after this many records
        #[arg(short = 'n', long)]
        count: Option<u64>,
    },
    /// Send data to an endpoint
    Send {
        #[command(flatten)]
        endpoint: EndpointArgs,
        /// Data to send
        data: String,
        /// Data format
        #[arg(short, long, value_enum, default_value = "text")]
        format: DataFormat,
        /// How long to wait for the connection, in milliseconds
        #[arg(long, default_value = "5000")]
        timeout_ms: u64,
    },
    /// List available serial ports
    Ports,
    /// Configuration management commands
    Config(ConfigArgs),
    /// Display version information
    Version,
}

/// Output format options
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputFormat {
    /// Human-readable text output
    Text,
    /// One JSON document per line
    Json,
}

/// Configuration management arguments
#[derive(ClapArgs, Debug)]
pub struct ConfigArgs {
    /// Configuration subcommand
    #[command(subcommand)]
    pub command: ConfigCommand,
}

/// Configuration subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Create a project configuration with example endpoints
    Init {
        /// Project directory (defaults to the current directory)
        #[arg(short, long)]
        path: Option<PathBuf>,
    },
    /// Show the effective configuration
    Show,
    /// Validate the configuration and report problems
    Validate,
}

/// Endpoint selection: a configured name or an ad-hoc target, plus overrides
#[derive(ClapArgs, Debug, Default)]
pub struct EndpointArgs {
    /// Endpoint name from the configuration file
    #[arg(short, long, conflicts_with_all = ["serial", "tcp_client", "tcp_server"])]
    pub endpoint: Option<String>,

    /// Serial device path
    #[arg(long, conflicts_with_all = ["tcp_client", "tcp_server"])]
    pub serial: Option<String>,

    /// Connect to HOST:PORT
    #[arg(long, value_name = "HOST:PORT", conflicts_with = "tcp_server")]
    pub tcp_client: Option<String>,

    /// Listen on ADDR:PORT
    #[arg(long, value_name = "ADDR:PORT")]
    pub tcp_server: Option<String>,

    /// Baud rate
    #[arg(short, long)]
    pub baud: Option<u32>,

    /// Data bits (5-8)
    #[arg(long)]
    pub data_bits: Option<u8>,

    /// Stop bits (1-2)
    #[arg(long)]
    pub stop_bits: Option<u8>,

    /// Parity
    #[arg(long, value_enum)]
    pub parity: Option<ParityArg>,

    /// Flow control
    #[arg(long, value_enum)]
    pub flow_control: Option<FlowControlArg>,

    /// Framing mode
    #[arg(long, value_enum)]
    pub framing: Option<FramingArg>,

    /// Record delimiter for split-char framing, e.g. "\n", "\r" or "0x03"
    #[arg(long, value_parser = parse_split_char)]
    pub split_char: Option<u8>,

    /// Maximum partial record size in bytes
    #[arg(long)]
    pub buffer_size: Option<usize>,

    /// Emit delimited records as UTF-8 text
    #[arg(long)]
    pub utf8: bool,

    /// Topic attached to every record
    #[arg(long)]
    pub topic: Option<String>,

    /// Do not reconnect after a failure
    #[arg(long)]
    pub no_reconnect: bool,

    /// Give up after this many consecutive failures
    #[arg(long)]
    pub max_retries: Option<u32>,

    /// Behaviour of writes while not connected
    #[arg(long, value_enum)]
    pub write_policy: Option<WritePolicyArg>,

    /// Server role: what to do with a second peer
    #[arg(long, value_enum)]
    pub accept_policy: Option<AcceptPolicyArg>,

    /// Flush an unterminated record after this much idle time
    #[arg(long)]
    pub flush_timeout_ms: Option<u64>,
}

impl EndpointArgs {
    /// Build the endpoint from the configuration or the target flags, then apply overrides
    pub fn resolve(&self, config: &PortLinkConfig) -> PortLinkResult<EndpointConfig> {
        let mut endpoint = if let Some(name) = &self.endpoint {
            find_endpoint(config, name)?.endpoint.clone()
        } else if let Some(path) = &self.serial {
            EndpointConfig::serial(path.as_str())
        } else if let Some(target) = &self.tcp_client {
            let (host, port) = parse_host_port(target)?;
            EndpointConfig::tcp_client(host, port)
        } else if let Some(target) = &self.tcp_server {
            let (addr, port) = parse_host_port(target)?;
            EndpointConfig::tcp_server(addr, port)
        } else {
            return Err(PortLinkError::config(
                "No endpoint given; use --endpoint, --serial, --tcp-client or --tcp-server",
            ));
        };

        if let Some(baud) = self.baud {
            endpoint.baud = baud;
        }
        if let Some(data_bits) = self.data_bits {
            endpoint.data_bits = data_bits;
        }
        if let Some(stop_bits) = self.stop_bits {
            endpoint.stop_bits = stop_bits;
        }
        if let Some(parity) = self.parity {
            endpoint.parity = parity.into();
        }
        if let Some(flow_control) = self.flow_control {
            endpoint.flow_control = flow_control.into();
        }
        if let Some(framing) = self.framing {
            endpoint.framing = framing.into();
        }
        if let Some(split_char) = self.split_char {
            endpoint.split_char = split_char;
            if self.framing.is_none() {
                endpoint.framing = FramingMode::SplitChar;
            }
        }
        if let Some(buffer_size) = self.buffer_size {
            endpoint.buffer_size = buffer_size;
        }
        if self.utf8 {
            endpoint.output = OutputEncoding::Utf8;
        }
        if let Some(topic) = &self.topic {
            endpoint.topic = topic.clone();
        }
        if self.no_reconnect {
            endpoint.reconnect = ReconnectPolicy::disabled();
        }
        if let Some(max_retries) = self.max_retries {
            endpoint.reconnect.max_retries = Some(max_retries);
        }
        if let Some(policy) = self.write_policy {
            endpoint.write_policy = policy.into();
        }
        if let Some(policy) = self.accept_policy {
            endpoint.accept_policy = policy.into();
        }
        if let Some(flush_timeout_ms) = self.flush_timeout_ms {
            endpoint.flush_timeout_ms = Some(flush_timeout_ms);
        }

        endpoint.validate()?;
        Ok(endpoint)
    }
}

fn parse_host_port(target: &str) -> PortLinkResult<(String, u16)> {
    let (host, port) = target
        .rsplit_once(':')
        .ok_or_else(|| PortLinkError::config(format!("Expected HOST:PORT, got '{}'", target)))?;
    let port = port
        .parse::<u16>()
        .map_err(|e| PortLinkError::config(format!("Invalid port in '{}': {}", target, e)))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    Ok((host.to_string(), port))
}

/// Accepts a single character, a C-style escape or a 0x-prefixed byte
pub fn parse_split_char(value: &str) -> Result<u8, String> {
    match value {
        "\\n" => return Ok(b'\n'),
        "\\r" => return Ok(b'\r'),
        "\\t" => return Ok(b'\t'),
        "\\0" => return Ok(0),
        _ => {}
    }

    if let Some(hex) = value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        return u8::from_str_radix(hex, 16).map_err(|e| format!("invalid byte '{}': {}", value, e));
    }

    match value.as_bytes() {
        [byte] => Ok(*byte),
        _ => Err(format!("expected one character, an escape or 0xNN, got '{}'", value)),
    }
}

#[derive(ValueEnum, Debug, Clone, Copy)]
pub enum ParityArg {
    None,
    Even,
    Odd,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
pub enum FlowControlArg {
    None,
    Software,
    Hardware,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
pub enum FramingArg {
    Raw,
    SplitChar,
    Base64,
    FixedSize,
    Json,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
pub enum WritePolicyArg {
    Drop,
    Block,
    Buffer,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
pub enum AcceptPolicyArg {
    Replace,
    Queue,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataFormat {
    Text,
    Hex,
    Base64,
}

impl From<ParityArg> for ParityConfig {
    fn from(parity: ParityArg) -> Self {
        match parity {
            ParityArg::None => Self::None,
            ParityArg::Even => Self::Even,
            ParityArg::Odd => Self::Odd,
        }
    }
}

impl From<FlowControlArg> for FlowControlConfig {
    fn from(flow: FlowControlArg) -> Self {
        match flow {
            FlowControlArg::None => Self::None,
            FlowControlArg::Software => Self::Software,
            FlowControlArg::Hardware => Self::Hardware,
        }
    }
}

impl From<FramingArg> for FramingMode {
    fn from(framing: FramingArg) -> Self {
        match framing {
            FramingArg::Raw => Self::Raw,
            FramingArg::SplitChar => Self::SplitChar,
            FramingArg::Base64 => Self::Base64,
            FramingArg::FixedSize => Self::FixedSize,
            FramingArg::Json => Self::Json,
        }
    }
}

impl From<WritePolicyArg> for WritePolicy {
    fn from(policy: WritePolicyArg) -> Self {
        match policy {
            WritePolicyArg::Drop => Self::Drop,
            WritePolicyArg::Block => Self::Block,
            WritePolicyArg::Buffer => Self::Buffer,
        }
    }
}

impl From<AcceptPolicyArg> for AcceptPolicy {
    fn from(policy: AcceptPolicyArg) -> Self {
        match policy {
            AcceptPolicyArg::Replace => Self::Replace,
            AcceptPolicyArg::Queue => Self::Queue,
        }
    }
}

impl std::fmt::Display for DataFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataFormat::Text => write!(f, "text"),
            DataFormat::Hex => write!(f, "hex"),
            DataFormat::Base64 => write!(f, "base64"),
        }
    }
}
