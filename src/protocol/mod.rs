//! Ingest protocol seam
//!
//! A [`ProtocolAdapter`] turns the raw bytes of one connection into lifecycle
//! callbacks on a [`SessionHandler`]. The session never parses wire data and
//! the adapter never touches the registry; replies to the peer go back through
//! [`SessionHandler::write_output`].

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::media::MediaFrame;
use crate::registry::StreamKey;

pub mod flv;

pub use flv::FlvIngestAdapter;

/// What a peer asked to do with a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMode {
    Publish,
    Play,
}

impl std::fmt::Display for StreamMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamMode::Publish => f.write_str("publish"),
            StreamMode::Play => f.write_str("play"),
        }
    }
}

/// Answer to a prepare request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrepareResult {
    Accept,
    /// Refuse with a reason sent back to the peer
    Reject(String),
}

/// Callbacks an adapter drives while decoding a connection
#[async_trait]
pub trait SessionHandler: Send {
    /// A peer named the stream it wants to publish or play
    async fn on_prepare(&mut self, mode: StreamMode, key: &StreamKey) -> PrepareResult;

    /// The accepted publish is about to send media
    async fn on_publish_start(&mut self) -> Result<()>;

    /// The accepted play request should start receiving media
    async fn on_play_start(&mut self) -> Result<()>;

    async fn on_frame(&mut self, frame: MediaFrame) -> Result<()>;

    /// The adapter hit an error it is about to return
    async fn on_error(&mut self, error: &Error);

    /// Send bytes to the peer
    async fn write_output(&mut self, data: &[u8]) -> Result<()>;
}

/// Decodes one connection's byte stream
#[async_trait]
pub trait ProtocolAdapter: Send {
    /// Feed the next chunk read from the connection. Chunks may split
    /// messages at any byte.
    async fn input(&mut self, data: &[u8], handler: &mut dyn SessionHandler) -> Result<()>;
}
