//! Decoded media frames
//!
//! A [`MediaFrame`] is what the protocol adapter hands to a session and what the
//! broker distributes. Payloads are `Bytes`, so cloning a frame for another
//! consumer shares the immutable buffer instead of copying it.

use bytes::Bytes;

use super::flv::{AudioFormat, VideoCodec};
use super::timestamp::Timestamp;

/// Elementary stream kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Video,
    Audio,
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaKind::Video => f.write_str("video"),
            MediaKind::Audio => f.write_str("audio"),
        }
    }
}

/// Codec tag carried by a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Codec {
    H264,
    H265,
    Av1,
    /// Any other video codec the container can carry
    OtherVideo(u8),
    Aac,
    Mp3,
    /// Any other audio format the container can carry
    OtherAudio(u8),
}

impl Codec {
    /// Map an FLV video codec id (lower nibble of the first tag byte)
    pub fn from_flv_video(b: u8) -> Self {
        match VideoCodec::from_byte(b) {
            Some(VideoCodec::Avc) => Codec::H264,
            Some(VideoCodec::Hevc) => Codec::H265,
            Some(VideoCodec::Av1) => Codec::Av1,
            _ => Codec::OtherVideo(b & 0x0F),
        }
    }

    /// Map an FLV sound format (upper nibble of the first tag byte)
    pub fn from_flv_audio(b: u8) -> Self {
        match AudioFormat::from_byte(b) {
            Some(AudioFormat::Aac) => Codec::Aac,
            Some(AudioFormat::Mp3) | Some(AudioFormat::Mp38k) => Codec::Mp3,
            _ => Codec::OtherAudio((b >> 4) & 0x0F),
        }
    }

    pub fn kind(&self) -> MediaKind {
        match self {
            Codec::H264 | Codec::H265 | Codec::Av1 | Codec::OtherVideo(_) => MediaKind::Video,
            Codec::Aac | Codec::Mp3 | Codec::OtherAudio(_) => MediaKind::Audio,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Codec::H264 => "H.264",
            Codec::H265 => "H.265",
            Codec::Av1 => "AV1",
            Codec::OtherVideo(_) => "video",
            Codec::Aac => "AAC",
            Codec::Mp3 => "MP3",
            Codec::OtherAudio(_) => "audio",
        }
    }
}

/// One decoded audio or video frame
///
/// `payload` is the codec payload exactly as carried in the FLV tag body,
/// including the one-byte media header (and for AVC/AAC the packet-type byte).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaFrame {
    pub kind: MediaKind,
    pub codec: Codec,
    pub timestamp: Timestamp,
    pub payload: Bytes,
    /// Video only: frame is a random access point
    pub keyframe: bool,
    /// Decoder configuration (AVC/AAC sequence header) rather than a picture or sample
    pub header: bool,
}

impl MediaFrame {
    pub fn video(codec: Codec, timestamp: Timestamp, payload: Bytes, keyframe: bool) -> Self {
        Self {
            kind: MediaKind::Video,
            codec,
            timestamp,
            payload,
            keyframe,
            header: false,
        }
    }

    pub fn audio(codec: Codec, timestamp: Timestamp, payload: Bytes) -> Self {
        Self {
            kind: MediaKind::Audio,
            codec,
            timestamp,
            payload,
            keyframe: false,
            header: false,
        }
    }

    /// Mark this frame as a sequence header
    pub fn into_header(mut self) -> Self {
        self.header = true;
        self
    }

    pub fn is_video(&self) -> bool {
        self.kind == MediaKind::Video
    }

    pub fn is_audio(&self) -> bool {
        self.kind == MediaKind::Audio
    }

    /// True for video frames that start a decodable run
    pub fn is_video_keyframe(&self) -> bool {
        self.is_video() && self.keyframe && !self.header
    }

    pub fn size(&self) -> usize {
        self.payload.len()
    }
}
