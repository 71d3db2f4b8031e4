// Infrastructure module - Transports, logging and configuration files
pub mod config;
pub mod logging;
pub mod serial;
pub mod tcp;
