use crate::cli::args::{Args, Command, ConfigCommand, DataFormat, EndpointArgs};
use crate::cli::output::{ConsoleWriter, OutputWriter};
use crate::core::connection::{ChannelSubscriber, ConnectionEvent, ConnectionState};
use crate::core::registry::EndpointRegistry;
use crate::domain::config::PortLinkConfig;
use crate::domain::error::{ErrorKind, PortLinkError};
use crate::infrastructure::config::{validate_config, ConfigManager};
use crate::infrastructure::logging::init_logging;
use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Execute CLI command
pub async fn execute_command(args: Args) -> Result<()> {
    let writer = ConsoleWriter::new(args.output);

    let config = load_config(&args)?;

    if !args.quiet {
        let level = if args.verbose {
            "debug"
        } else {
            config.global.log_level.as_str()
        };
        if let Err(e) = init_logging(level) {
            eprintln!("Failed to initialize logging: {}", e);
        }
    }

    match args.command {
        Command::Listen { endpoint, count } => listen(&writer, &config, &endpoint, count).await,
        Command::Send {
            endpoint,
            data,
            format,
            timeout_ms,
        } => {
            let payload = parse_data(&data, format)?;
            send(&writer, &config, &endpoint, payload, Duration::from_millis(timeout_ms)).await
        }
        Command::Ports => list_ports(&writer),
        Command::Config(config_args) => {
            execute_config_command(config_args.command, &writer, &config)
        }
        Command::Version => {
            writer.write_message(&format!("portlink {}", env!("CARGO_PKG_VERSION")))?;
            Ok(())
        }
    }
}

fn load_config(args: &Args) -> Result<PortLinkConfig> {
    match &args.config {
        Some(path) => ConfigManager::load_config_from_path(path)
            .with_context(|| format!("Failed to load {}", path.display())),
        None => {
            let manager = ConfigManager::new()?;
            manager.load_config().context("Failed to load configuration")
        }
    }
}

async fn listen(
    writer: &ConsoleWriter,
    config: &PortLinkConfig,
    endpoint: &EndpointArgs,
    count: Option<u64>,
) -> Result<()> {
    let endpoint = endpoint.resolve(config)?;
    let registry = EndpointRegistry::default();
    let manager = registry.acquire(&endpoint).await?;

    let (subscriber, mut events) = ChannelSubscriber::new();
    let token = manager.subscribe(Arc::new(subscriber));
    debug!("Listening on {}", endpoint.target());

    let mut received = 0u64;
    let outcome: Result<()> = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                debug!("Interrupted");
                break Ok(());
            }
            event = events.recv() => {
                let Some(event) = event else { break Ok(()) };
                writer.write_event(&event)?;

                match event {
                    ConnectionEvent::Record(_) => {
                        received += 1;
                        if count.is_some_and(|limit| received >= limit) {
                            break Ok(());
                        }
                    }
                    ConnectionEvent::State { state: ConnectionState::Failed, error: Some(error) }
                        if error.kind == ErrorKind::Config =>
                    {
                        break Err(PortLinkError::config(error.message).into());
                    }
                    _ => {}
                }
            }
        }
    };

    let stats = manager.stats();
    registry.release(&manager, Some(token)).await;
    if outcome.is_ok() && count.is_none() {
        writer.write_stats(&stats)?;
    }
    outcome
}

async fn send(
    writer: &ConsoleWriter,
    config: &PortLinkConfig,
    endpoint: &EndpointArgs,
    payload: Vec<u8>,
    timeout: Duration,
) -> Result<()> {
    let endpoint = endpoint.resolve(config)?;
    let registry = EndpointRegistry::default();
    let manager = registry.acquire(&endpoint).await?;
    manager.start();

    if !manager.wait_for_state(ConnectionState::Connected, timeout).await {
        let reason = manager
            .last_error()
            .map(|error| error.to_string())
            .unwrap_or_else(|| "timed out".to_string());
        registry.release(&manager, None).await;
        bail!("Could not connect to {}: {}", endpoint.target(), reason);
    }

    let result = manager.send(payload).await;
    registry.release(&manager, None).await;

    let written = result.with_context(|| format!("Failed to send to {}", endpoint.target()))?;
    writer.write_message(&format!("Sent {} bytes to {}", written, endpoint.target()))?;
    Ok(())
}

fn list_ports(writer: &ConsoleWriter) -> Result<()> {
    let ports = serialport::available_ports().context("Failed to list serial ports")?;

    if ports.is_empty() {
        writer.write_message("No serial ports found")?;
    }
    for port in ports {
        writer.write_message(&port.port_name)?;
    }
    Ok(())
}

fn execute_config_command(
    command: ConfigCommand,
    writer: &ConsoleWriter,
    config: &PortLinkConfig,
) -> Result<()> {
    match command {
        ConfigCommand::Init { path } => {
            let dir = match path {
                Some(path) => path,
                None => std::env::current_dir().context("Failed to read current directory")?,
            };
            let manager = ConfigManager::new()?;
            let created: PathBuf = manager.init_project_config(&dir)?;
            writer.write_message(&format!("Created {}", created.display()))?;
        }
        ConfigCommand::Show => {
            writer.write_config(config)?;
        }
        ConfigCommand::Validate => {
            validate_config(config)?;
            for entry in &config.endpoints {
                let reconnect = &entry.endpoint.reconnect;
                if reconnect.enabled && reconnect.max_retries == Some(0) {
                    warn!("Endpoint '{}' reconnects with a retry budget of zero", entry.name);
                }
            }
            writer.write_message(&format!(
                "Configuration is valid ({} endpoints)",
                config.endpoints.len()
            ))?;
        }
    }
    Ok(())
}

/// Decode command-line data in the given format
pub fn parse_data(data: &str, format: DataFormat) -> Result<Vec<u8>, PortLinkError> {
    match format {
        DataFormat::Text => Ok(unescape(data).into_bytes()),
        DataFormat::Hex => {
            let cleaned: String = data.chars().filter(|c| !c.is_whitespace()).collect();
            hex::decode(&cleaned)
                .map_err(|e| PortLinkError::InvalidData(format!("Invalid hex data: {}", e)))
        }
        DataFormat::Base64 => {
            use base64::Engine;
            base64::engine::general_purpose::STANDARD
                .decode(data.trim())
                .map_err(|e| PortLinkError::InvalidData(format!("Invalid base64 data: {}", e)))
        }
    }
}

/// Expand \n, \r, \t and \\ in text payloads
fn unescape(data: &str) -> String {
    let mut out = String::with_capacity(data.len());
    let mut chars = data.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}
