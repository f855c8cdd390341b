//! Relay wire messages, matching `proto/media_frame.proto`

use crate::media::{MediaFrame, MediaKind};

/// Fully-qualified method path of the relay call
pub const SEND_FRAME_PATH: &str = "/message.MediaFrame/SendFrame";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum FrameType {
    Video = 0,
    Audio = 1,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct Timestamp {
    #[prost(uint64, tag = "1")]
    pub pts: u64,
    #[prost(uint64, tag = "2")]
    pub dts: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Frame {
    #[prost(enumeration = "FrameType", tag = "1")]
    pub r#type: i32,
    #[prost(message, optional, tag = "2")]
    pub timestamp: ::core::option::Option<Timestamp>,
    #[prost(int64, tag = "3")]
    pub session_id: i64,
    #[prost(bytes = "bytes", tag = "4")]
    pub buffer: ::prost::bytes::Bytes,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Ack {
    #[prost(bool, tag = "1")]
    pub success: bool,
    #[prost(string, tag = "2")]
    pub message: ::prost::alloc::string::String,
}

impl Frame {
    /// Wrap a media frame; the payload buffer is shared, not copied
    pub fn from_media(frame: &MediaFrame, session_id: i64) -> Self {
        let kind = match frame.kind {
            MediaKind::Video => FrameType::Video,
            MediaKind::Audio => FrameType::Audio,
        };
        Self {
            r#type: kind as i32,
            timestamp: Some(Timestamp {
                pts: frame.timestamp.pts,
                dts: frame.timestamp.dts,
            }),
            session_id,
            buffer: frame.payload.clone(),
        }
    }
}
