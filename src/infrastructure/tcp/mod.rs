// TCP module - TCP client and server transports
pub mod client;
pub mod server;

pub use client::TcpClientTransport;
pub use server::TcpServerTransport;
