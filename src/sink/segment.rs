//! Local segment file output

use std::sync::PoisonError;

use async_trait::async_trait;

use crate::error::Result;
use crate::media::{MediaFrame, MediaKind, Muxer};
use crate::segment::SharedSegments;

use super::FrameSink;

/// Muxes frames and routes the bytes into a stream's segmentation engine
pub struct LocalSegmentSink {
    stream_id: i64,
    muxer: Box<dyn Muxer>,
    segments: SharedSegments,
}

impl LocalSegmentSink {
    pub fn new(stream_id: i64, muxer: Box<dyn Muxer>, segments: SharedSegments) -> Self {
        Self {
            stream_id,
            muxer,
            segments,
        }
    }
}

#[async_trait]
impl FrameSink for LocalSegmentSink {
    async fn write(&mut self, frame: &MediaFrame) -> Result<()> {
        let data = self.muxer.mux(frame)?;
        if data.is_empty() {
            return Ok(());
        }

        let mut segments = self
            .segments
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match frame.kind {
            MediaKind::Video => {
                segments.write_video(&data, frame.timestamp, frame.is_video_keyframe())?
            }
            MediaKind::Audio => segments.write_audio(&data, frame.timestamp)?,
        }
        Ok(())
    }

    /// The engine itself belongs to the registry and is closed there.
    async fn close(&mut self) -> Result<()> {
        tracing::debug!(stream_id = self.stream_id, "Segment sink closed");
        Ok(())
    }
}
