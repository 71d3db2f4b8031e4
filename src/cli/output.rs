use crate::cli::args::OutputFormat;
use crate::core::connection::{ConnectionEvent, ConnectionState, ConnectionStats};
use crate::core::record::{Payload, Record};
use crate::domain::config::{NamedEndpoint, PortLinkConfig};
use crate::domain::error::ErrorInfo;
use serde::Serialize;
use std::io::{self, Write};
use std::time::UNIX_EPOCH;
use tabled::{Table, Tabled};

/// Output writer trait for different formats
pub trait OutputWriter {
    fn write_record(&self, record: &Record) -> Result<(), OutputError>;
    fn write_state(
        &self,
        state: ConnectionState,
        error: Option<&ErrorInfo>,
    ) -> Result<(), OutputError>;
    fn write_error(&self, error: &ErrorInfo) -> Result<(), OutputError>;
    fn write_stats(&self, stats: &ConnectionStats) -> Result<(), OutputError>;
    fn write_config(&self, config: &PortLinkConfig) -> Result<(), OutputError>;
    fn write_message(&self, message: &str) -> Result<(), OutputError>;

    fn write_event(&self, event: &ConnectionEvent) -> Result<(), OutputError> {
        match event {
            ConnectionEvent::Record(record) => self.write_record(record),
            ConnectionEvent::State { state, error } => self.write_state(*state, error.as_ref()),
            ConnectionEvent::Error(error) => self.write_error(error),
        }
    }
}

/// Output formatting errors
#[derive(Debug, thiserror::Error)]
pub enum OutputError {
    #[error("JSON serialization error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
}

impl From<OutputError> for crate::domain::error::PortLinkError {
    fn from(err: OutputError) -> Self {
        Self::Output(err.to_string())
    }
}

/// JSON shape of a record
#[derive(Debug, Serialize)]
pub struct RecordView<'a> {
    pub sequence: u64,
    pub topic: &'a str,
    pub timestamp_ms: u128,
    /// "utf8" or "hex"
    pub encoding: &'static str,
    pub payload: String,
}

impl<'a> From<&'a Record> for RecordView<'a> {
    fn from(record: &'a Record) -> Self {
        let (encoding, payload) = match &record.payload {
            Payload::Text(text) => ("utf8", text.clone()),
            Payload::Binary(_) => ("hex", record.payload.to_hex()),
        };
        Self {
            sequence: record.sequence,
            topic: &record.topic,
            timestamp_ms: record
                .timestamp
                .duration_since(UNIX_EPOCH)
                .map(|elapsed| elapsed.as_millis())
                .unwrap_or(0),
            encoding,
            payload,
        }
    }
}

#[derive(Serialize)]
struct StateView<'a> {
    state: ConnectionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a ErrorInfo>,
}

#[derive(Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
enum JsonLine<'a> {
    Record(RecordView<'a>),
    State(StateView<'a>),
    Error(&'a ErrorInfo),
    Stats(&'a ConnectionStats),
    Message { message: &'a str },
}

/// Console output writer
pub struct ConsoleWriter {
    format: OutputFormat,
}

impl ConsoleWriter {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    fn json_line(&self, line: &JsonLine<'_>) -> Result<(), OutputError> {
        let mut stdout = io::stdout().lock();
        serde_json::to_writer(&mut stdout, line)?;
        writeln!(stdout)?;
        Ok(())
    }
}

impl OutputWriter for ConsoleWriter {
    fn write_record(&self, record: &Record) -> Result<(), OutputError> {
        match self.format {
            OutputFormat::Text => {
                let payload = match &record.payload {
                    Payload::Text(text) => text.clone(),
                    Payload::Binary(_) => record.payload.to_hex(),
                };
                if record.topic.is_empty() {
                    println!("[{}] {}", record.sequence, payload);
                } else {
                    println!("[{}] {}: {}", record.sequence, record.topic, payload);
                }
                Ok(())
            }
            OutputFormat::Json => self.json_line(&JsonLine::Record(RecordView::from(record))),
        }
    }

    fn write_state(
        &self,
        state: ConnectionState,
        error: Option<&ErrorInfo>,
    ) -> Result<(), OutputError> {
        match self.format {
            OutputFormat::Text => {
                match error {
                    Some(error) => eprintln!("-- {} ({})", state, error),
                    None => eprintln!("-- {}", state),
                }
                Ok(())
            }
            OutputFormat::Json => self.json_line(&JsonLine::State(StateView { state, error })),
        }
    }

    fn write_error(&self, error: &ErrorInfo) -> Result<(), OutputError> {
        match self.format {
            OutputFormat::Text => {
                eprintln!("Error: {}", error);
                Ok(())
            }
            OutputFormat::Json => self.json_line(&JsonLine::Error(error)),
        }
    }

    fn write_stats(&self, stats: &ConnectionStats) -> Result<(), OutputError> {
        match self.format {
            OutputFormat::Text => {
                println!("Statistics:");
                println!("  Bytes received: {}", stats.bytes_received);
                println!("  Bytes sent: {}", stats.bytes_sent);
                println!("  Records: {}", stats.records_received);
                println!("  Connects: {}", stats.connects);
                println!("  Failures: {}", stats.failures);
                Ok(())
            }
            OutputFormat::Json => self.json_line(&JsonLine::Stats(stats)),
        }
    }

    fn write_config(&self, config: &PortLinkConfig) -> Result<(), OutputError> {
        match self.format {
            OutputFormat::Text => {
                println!("PortLink Configuration:");
                println!("  Log level: {}", config.global.log_level);

                if config.endpoints.is_empty() {
                    println!("  No endpoints configured");
                } else {
                    let rows: Vec<EndpointTableRow> =
                        config.endpoints.iter().map(EndpointTableRow::from).collect();
                    println!("{}", Table::new(rows));
                }
            }
            OutputFormat::Json => {
                let output = serde_json::to_string_pretty(config)?;
                println!("{}", output);
            }
        }
        Ok(())
    }

    fn write_message(&self, message: &str) -> Result<(), OutputError> {
        match self.format {
            OutputFormat::Text => {
                println!("{}", message);
                Ok(())
            }
            OutputFormat::Json => self.json_line(&JsonLine::Message { message }),
        }
    }
}

#[derive(Tabled)]
struct EndpointTableRow {
    name: String,
    transport: String,
    target: String,
    framing: String,
    description: String,
}

impl From<&NamedEndpoint> for EndpointTableRow {
    fn from(entry: &NamedEndpoint) -> Self {
        Self {
            name: entry.name.clone(),
            transport: entry.endpoint.transport.to_string(),
            target: entry.endpoint.target(),
            framing: format!("{:?}", entry.endpoint.framing).to_lowercase(),
            description: entry.description.clone(),
        }
    }
}
