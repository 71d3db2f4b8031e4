// Connection module - per-endpoint connection lifecycle
pub mod backoff;
pub mod manager;
pub mod state;
pub mod subscriber;

pub use backoff::Backoff;
pub use manager::ConnectionManager;
pub use state::{ConnectionState, ConnectionStats};
pub use subscriber::{ChannelSubscriber, ConnectionEvent, Subscriber, SubscriptionToken};
