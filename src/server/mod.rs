//! TCP ingest server

pub mod config;
pub mod listener;

pub use config::ServerConfig;
pub use listener::IngestServer;
