// Core module - framing, transports, connection management
pub mod connection;
pub mod framer;
pub mod record;
pub mod registry;
pub mod transport;
