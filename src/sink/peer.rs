//! FLV byte stream back to a playing peer

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::error::Result;
use crate::media::flv::{FileHeader, FlvTag};
use crate::media::{MediaFrame, MediaKind};

use super::FrameSink;

/// Write half of a connection, shared by the protocol replies and the player sink
pub type PeerOutput = Arc<Mutex<Box<dyn AsyncWrite + Send + Unpin>>>;

pub fn peer_output<W>(writer: W) -> PeerOutput
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    Arc::new(Mutex::new(Box::new(writer)))
}

/// Writes the FLV file header once, then one tag per frame
pub struct FlvPeerSink {
    output: PeerOutput,
    header_written: bool,
    closed: bool,
}

impl FlvPeerSink {
    pub fn new(output: PeerOutput) -> Self {
        Self {
            output,
            header_written: false,
            closed: false,
        }
    }
}

#[async_trait]
impl FrameSink for FlvPeerSink {
    async fn write(&mut self, frame: &MediaFrame) -> Result<()> {
        let timestamp = frame.timestamp.dts as u32;
        let tag = match frame.kind {
            MediaKind::Video => FlvTag::video(timestamp, frame.payload.clone()),
            MediaKind::Audio => FlvTag::audio(timestamp, frame.payload.clone()),
        };

        let mut output = self.output.lock().await;
        if !self.header_written {
            output.write_all(&FileHeader::default().encode()).await?;
            self.header_written = true;
        }
        output.write_all(&tag.encode()).await?;
        output.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if std::mem::replace(&mut self.closed, true) {
            return Ok(());
        }
        self.output.lock().await.shutdown().await?;
        Ok(())
    }
}
