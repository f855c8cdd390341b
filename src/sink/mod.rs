//! Frame destinations
//!
//! Session and broker code only see [`FrameSink`]; the concrete destination is
//! picked by the registry when a publish or play starts.
//!
//! - [`LocalSegmentSink`]: mux into the stream's segmentation engine
//! - [`RelaySink`]: forward over a client-streaming gRPC call
//! - [`FlvPeerSink`]: write an FLV byte stream back to a playing peer

use async_trait::async_trait;

use crate::error::Result;
use crate::media::MediaFrame;

pub mod peer;
pub mod proto;
pub mod relay;
pub mod segment;

pub use peer::{peer_output, FlvPeerSink, PeerOutput};
pub use relay::{MediaFrameClient, RelaySink};
pub use segment::LocalSegmentSink;

/// Consumes frames for one session
#[async_trait]
pub trait FrameSink: Send {
    async fn write(&mut self, frame: &MediaFrame) -> Result<()>;

    /// Release the destination. Calling it more than once is harmless.
    async fn close(&mut self) -> Result<()>;
}
