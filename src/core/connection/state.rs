use serde::{Deserialize, Serialize};

/// Lifecycle state of a connection manager
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// No driver running, no transport held
    #[default]
    Disconnected,
    /// Opening the transport
    Connecting,
    /// Transport open and being read
    Connected,
    /// Shutting down an open transport
    Closing,
    /// Last open attempt or connection failed
    Failed,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Closing => write!(f, "closing"),
            ConnectionState::Failed => write!(f, "failed"),
        }
    }
}

/// Traffic counters for one connection manager
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStats {
    /// Total bytes read from transports
    pub bytes_received: u64,
    /// Total bytes written to transports
    pub bytes_sent: u64,
    /// Records delivered to subscribers
    pub records_received: u64,
    /// Successful transport opens
    pub connects: u64,
    /// Failed opens and lost connections
    pub failures: u64,
}
