// Serial module - Serial port transport
pub mod transport;

pub use transport::SerialTransport;
