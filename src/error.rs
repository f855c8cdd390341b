//! Error types
//!
//! Every failure a session can hit maps onto one variant of [`Error`]. Only
//! [`ConfigError`] is fatal, and only at startup; everything else is contained
//! to the session that produced it.

use std::path::PathBuf;

use thiserror::Error;

pub use crate::config::ConfigError;
pub use crate::registry::RegistryError;

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("authorization failed: {0}")]
    Authorization(#[from] AuthError),

    #[error("segment error: {0}")]
    Segment(#[from] SegmentError),

    #[error("relay error: {0}")]
    Relay(#[from] RelayError),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("media error: {0}")]
    Media(#[from] MediaError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Malformed or unexpected input from a peer
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid command line: {0}")]
    InvalidCommand(String),

    #[error("command line exceeds {0} bytes")]
    CommandTooLong(usize),

    #[error("invalid FLV header")]
    InvalidFlvHeader,

    #[error("FLV tag of {size} bytes exceeds limit of {limit}")]
    TagTooLarge { size: usize, limit: usize },

    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("unexpected message: {0}")]
    UnexpectedMessage(String),
}

/// Failures talking to, or refusals from, the external stream validator
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("validator denied stream: {0}")]
    Denied(String),

    #[error("stream is not active or has no destination")]
    InactiveStream,

    #[error("validator request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("validator returned unparseable body: {0}")]
    InvalidResponse(#[from] serde_json::Error),
}

/// Segment file failures
#[derive(Debug, Error)]
pub enum SegmentError {
    #[error("segment destination escapes the base path: {0}")]
    InvalidDestination(String),

    #[error("failed to create segment directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to open segment file {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to write segment {id}: {source}")]
    Write { id: u64, source: std::io::Error },

    #[error("segment {0} is closed")]
    Closed(u64),

    #[error("stream segments are closed")]
    EngineClosed,
}

/// Outbound relay failures
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("failed to connect to frame processor: {0}")]
    Connect(#[from] tonic::transport::Error),

    #[error("frame processor returned status: {0}")]
    Status(#[from] tonic::Status),

    #[error("relay stream is closed")]
    StreamClosed,

    #[error("relay task failed: {0}")]
    Task(String),
}

/// Codec payload parsing failures
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("invalid AVC packet")]
    InvalidAvcPacket,

    #[error("invalid AAC packet")]
    InvalidAacPacket,

    #[error("{0} cannot be carried in the segment container")]
    UnsupportedCodec(&'static str),
}
