// Domain module - Configuration and error types shared by every layer
pub mod config;
pub mod error;

pub use config::{EndpointConfig, PortLinkConfig, TransportKind};
pub use error::{ErrorInfo, ErrorKind, PortLinkError, PortLinkResult};
