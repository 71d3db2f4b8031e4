use serde::{Deserialize, Serialize};
use thiserror::Error;

/// PortLink unified error type
#[derive(Error, Debug)]
pub enum PortLinkError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Connect error: {message}")]
    Connect { message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Framing overflow: buffer limit of {limit} bytes exceeded, {dropped} bytes dropped")]
    FramingOverflow { limit: usize, dropped: usize },

    #[error("Device not connected")]
    NotConnected,

    #[error("Invalid data format: {0}")]
    InvalidData(String),

    #[error("Output error: {0}")]
    Output(String),
}

pub type PortLinkResult<T> = Result<T, PortLinkError>;

impl PortLinkError {
    pub fn config(message: impl Into<String>) -> Self {
        PortLinkError::Config {
            message: message.into(),
        }
    }

    pub fn connect(message: impl Into<String>) -> Self {
        PortLinkError::Connect {
            message: message.into(),
        }
    }

    /// Classification seen by subscribers
    pub fn kind(&self) -> ErrorKind {
        match self {
            PortLinkError::Config { .. } => ErrorKind::Config,
            PortLinkError::Connect { .. } => ErrorKind::Connect,
            PortLinkError::Io(_) => ErrorKind::Io,
            PortLinkError::FramingOverflow { .. } => ErrorKind::FramingOverflow,
            PortLinkError::NotConnected => ErrorKind::NotConnected,
            PortLinkError::InvalidData(_) => ErrorKind::InvalidData,
            PortLinkError::Output(_) => ErrorKind::Io,
        }
    }

    /// Terminal errors are reported once and never retried.
    pub fn is_terminal(&self) -> bool {
        matches!(self, PortLinkError::Config { .. })
    }

    pub fn info(&self) -> ErrorInfo {
        ErrorInfo::new(self.kind(), self.to_string())
    }
}

/// Error category carried in notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    Config,
    Connect,
    Io,
    FramingOverflow,
    NotConnected,
    InvalidData,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Config => write!(f, "config"),
            ErrorKind::Connect => write!(f, "connect"),
            ErrorKind::Io => write!(f, "io"),
            ErrorKind::FramingOverflow => write!(f, "framing-overflow"),
            ErrorKind::NotConnected => write!(f, "not-connected"),
            ErrorKind::InvalidData => write!(f, "invalid-data"),
        }
    }
}

/// Classified error delivered to subscribers in place of raw transport errors
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

impl From<&PortLinkError> for ErrorInfo {
    fn from(error: &PortLinkError) -> Self {
        error.info()
    }
}
