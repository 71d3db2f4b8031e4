//! PortLink Library
//!
//! Connection management for serial ports and TCP sockets. A
//! [`ConnectionManager`] keeps one endpoint open, reconnecting with
//! exponential backoff, cuts the inbound byte stream into [`Record`]s with a
//! [`Framer`] and fans them out to any number of [`Subscriber`]s. The
//! [`EndpointRegistry`] shares one manager between all users of an
//! identical endpoint configuration.

pub mod cli;
pub mod core;
pub mod domain;
pub mod infrastructure;

pub use crate::core::connection::{
    ChannelSubscriber, ConnectionEvent, ConnectionManager, ConnectionState, ConnectionStats,
    Subscriber, SubscriptionToken,
};
pub use crate::core::framer::Framer;
pub use crate::core::record::{Payload, Record};
pub use crate::core::registry::EndpointRegistry;
pub use crate::core::transport::{Connector, DefaultConnector, Transport};
pub use domain::config::{EndpointConfig, PortLinkConfig, TransportKind};
pub use domain::error::{ErrorInfo, ErrorKind, PortLinkError, PortLinkResult};
