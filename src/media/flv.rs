//! FLV container primitives
//!
//! Used by the bundled ingest adapter (demux) and by the bundled muxer.
//!
//! File layout:
//! ```text
//! +-----------+--------------------+-------------------------------------+
//! | Header(9) | PreviousTagSize0(4)| { Tag(11 + N) | PreviousTagSize(4) }*|
//! +-----------+--------------------+-------------------------------------+
//! ```
//!
//! Tag header:
//! ```text
//! +--------+-------------+-----------+-------------+-----------+-------------+
//! | Type(1)| DataSize(3) | TS(3)     | TSExt(1)    | StreamID(3)| Data(N)    |
//! +--------+-------------+-----------+-------------+-----------+-------------+
//! ```
//!
//! The first data byte of a video tag packs frame type and codec id; of an
//! audio tag, sound format and rate/size/type bits.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;

use super::frame::{Codec, MediaFrame};
use super::timestamp::Timestamp;

/// Size of the file header
pub const FILE_HEADER_SIZE: usize = 9;

/// Size of a tag header
pub const TAG_HEADER_SIZE: usize = 11;

/// Size of a PreviousTagSize field
pub const PREVIOUS_TAG_SIZE: usize = 4;

/// FLV tag type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlvTagType {
    Audio,
    Video,
    Script,
}

impl FlvTagType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b & 0x1F {
            8 => Some(FlvTagType::Audio),
            9 => Some(FlvTagType::Video),
            18 => Some(FlvTagType::Script),
            _ => None,
        }
    }

    pub fn as_byte(&self) -> u8 {
        match self {
            FlvTagType::Audio => 8,
            FlvTagType::Video => 9,
            FlvTagType::Script => 18,
        }
    }
}

/// Video frame type (upper 4 bits of first byte)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoFrameType {
    Keyframe = 1,
    InterFrame = 2,
    DisposableInterFrame = 3,
    /// Reserved for server use
    GeneratedKeyframe = 4,
    VideoInfoFrame = 5,
}

impl VideoFrameType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match (b >> 4) & 0x0F {
            1 => Some(VideoFrameType::Keyframe),
            2 => Some(VideoFrameType::InterFrame),
            3 => Some(VideoFrameType::DisposableInterFrame),
            4 => Some(VideoFrameType::GeneratedKeyframe),
            5 => Some(VideoFrameType::VideoInfoFrame),
            _ => None,
        }
    }

    pub fn is_keyframe(&self) -> bool {
        matches!(
            self,
            VideoFrameType::Keyframe | VideoFrameType::GeneratedKeyframe
        )
    }
}

/// Video codec id (lower 4 bits of first byte)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoCodec {
    SorensonH263 = 2,
    ScreenVideo = 3,
    Vp6 = 4,
    Vp6Alpha = 5,
    ScreenVideoV2 = 6,
    Avc = 7,
    Hevc = 12,
    Av1 = 13,
}

impl VideoCodec {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b & 0x0F {
            2 => Some(VideoCodec::SorensonH263),
            3 => Some(VideoCodec::ScreenVideo),
            4 => Some(VideoCodec::Vp6),
            5 => Some(VideoCodec::Vp6Alpha),
            6 => Some(VideoCodec::ScreenVideoV2),
            7 => Some(VideoCodec::Avc),
            12 => Some(VideoCodec::Hevc),
            13 => Some(VideoCodec::Av1),
            _ => None,
        }
    }
}

/// Sound format (upper 4 bits of first byte)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioFormat {
    LinearPcmPlatform = 0,
    Adpcm = 1,
    Mp3 = 2,
    LinearPcmLe = 3,
    Nellymoser16kMono = 4,
    Nellymoser8kMono = 5,
    Nellymoser = 6,
    G711ALaw = 7,
    G711MuLaw = 8,
    Aac = 10,
    Speex = 11,
    Mp38k = 14,
    DeviceSpecific = 15,
}

impl AudioFormat {
    pub fn from_byte(b: u8) -> Option<Self> {
        match (b >> 4) & 0x0F {
            0 => Some(AudioFormat::LinearPcmPlatform),
            1 => Some(AudioFormat::Adpcm),
            2 => Some(AudioFormat::Mp3),
            3 => Some(AudioFormat::LinearPcmLe),
            4 => Some(AudioFormat::Nellymoser16kMono),
            5 => Some(AudioFormat::Nellymoser8kMono),
            6 => Some(AudioFormat::Nellymoser),
            7 => Some(AudioFormat::G711ALaw),
            8 => Some(AudioFormat::G711MuLaw),
            10 => Some(AudioFormat::Aac),
            11 => Some(AudioFormat::Speex),
            14 => Some(AudioFormat::Mp38k),
            15 => Some(AudioFormat::DeviceSpecific),
            _ => None,
        }
    }
}

/// Parsed FLV file header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    pub has_audio: bool,
    pub has_video: bool,
}

impl FileHeader {
    /// Parse the 9-byte signature block
    pub fn parse(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < FILE_HEADER_SIZE || &buf[0..3] != b"FLV" || buf[3] != 1 {
            return Err(ProtocolError::InvalidFlvHeader);
        }
        let offset = u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]) as usize;
        if offset < FILE_HEADER_SIZE {
            return Err(ProtocolError::InvalidFlvHeader);
        }
        Ok(Self {
            has_audio: buf[4] & 0x04 != 0,
            has_video: buf[4] & 0x01 != 0,
        })
    }

    /// Encode the header followed by PreviousTagSize0
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FILE_HEADER_SIZE + PREVIOUS_TAG_SIZE);
        buf.put_slice(b"FLV");
        buf.put_u8(1);
        let mut flags = 0u8;
        if self.has_audio {
            flags |= 0x04;
        }
        if self.has_video {
            flags |= 0x01;
        }
        buf.put_u8(flags);
        buf.put_u32(FILE_HEADER_SIZE as u32);
        buf.put_u32(0);
        buf.freeze()
    }
}

impl Default for FileHeader {
    fn default() -> Self {
        Self {
            has_audio: true,
            has_video: true,
        }
    }
}

/// Parsed tag header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagHeader {
    /// Raw type byte; unknown types are skipped by readers
    pub tag_type: u8,
    pub data_size: u32,
    /// Milliseconds, with the extension byte folded in
    pub timestamp: u32,
}

impl TagHeader {
    pub fn parse(buf: &[u8; TAG_HEADER_SIZE]) -> Self {
        let data_size = u32::from_be_bytes([0, buf[1], buf[2], buf[3]]);
        let timestamp = u32::from_be_bytes([buf[7], buf[4], buf[5], buf[6]]);
        Self {
            tag_type: buf[0],
            data_size,
            timestamp,
        }
    }

    pub fn kind(&self) -> Option<FlvTagType> {
        FlvTagType::from_byte(self.tag_type)
    }
}

/// A complete FLV tag
#[derive(Debug, Clone)]
pub struct FlvTag {
    pub tag_type: FlvTagType,
    pub timestamp: u32,
    /// Tag body, including codec headers
    pub data: Bytes,
}

impl FlvTag {
    pub fn video(timestamp: u32, data: Bytes) -> Self {
        Self {
            tag_type: FlvTagType::Video,
            timestamp,
            data,
        }
    }

    pub fn audio(timestamp: u32, data: Bytes) -> Self {
        Self {
            tag_type: FlvTagType::Audio,
            timestamp,
            data,
        }
    }

    pub fn is_keyframe(&self) -> bool {
        self.tag_type == FlvTagType::Video
            && self
                .data
                .first()
                .and_then(|b| VideoFrameType::from_byte(*b))
                .map(|ft| ft.is_keyframe())
                .unwrap_or(false)
    }

    /// Convert into a media frame. Script tags and empty bodies yield `None`.
    pub fn into_frame(self) -> Option<MediaFrame> {
        let first = *self.data.first()?;
        match self.tag_type {
            FlvTagType::Video => {
                let codec = Codec::from_flv_video(first);
                let header = is_avc_sequence_header(&self.data);
                let composition = if codec == Codec::H264 {
                    composition_time(&self.data)
                } else {
                    0
                };
                let keyframe = self.is_keyframe();
                let frame = MediaFrame::video(
                    codec,
                    Timestamp::from_flv(self.timestamp, composition),
                    self.data,
                    keyframe,
                );
                Some(if header { frame.into_header() } else { frame })
            }
            FlvTagType::Audio => {
                let header = is_aac_sequence_header(&self.data);
                let frame = MediaFrame::audio(
                    Codec::from_flv_audio(first),
                    Timestamp::from_flv(self.timestamp, 0),
                    self.data,
                );
                Some(if header { frame.into_header() } else { frame })
            }
            FlvTagType::Script => None,
        }
    }

    /// Append the encoded tag and its trailing PreviousTagSize to `out`
    pub fn encode_into(&self, out: &mut BytesMut) {
        let size = self.data.len() as u32;
        out.reserve(TAG_HEADER_SIZE + self.data.len() + PREVIOUS_TAG_SIZE);
        out.put_u8(self.tag_type.as_byte());
        out.put_slice(&size.to_be_bytes()[1..]);
        out.put_slice(&self.timestamp.to_be_bytes()[1..]);
        out.put_u8((self.timestamp >> 24) as u8);
        out.put_slice(&[0, 0, 0]);
        out.put_slice(&self.data);
        out.put_u32(size + TAG_HEADER_SIZE as u32);
    }

    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::new();
        self.encode_into(&mut out);
        out.freeze()
    }
}

/// AVC video body carrying an AVCDecoderConfigurationRecord
pub fn is_avc_sequence_header(data: &[u8]) -> bool {
    data.len() >= 2 && VideoCodec::from_byte(data[0]) == Some(VideoCodec::Avc) && data[1] == 0
}

/// AAC audio body carrying an AudioSpecificConfig
pub fn is_aac_sequence_header(data: &[u8]) -> bool {
    data.len() >= 2 && AudioFormat::from_byte(data[0]) == Some(AudioFormat::Aac) && data[1] == 0
}

/// Signed 24-bit composition time offset of an AVC video body
pub fn composition_time(data: &[u8]) -> i32 {
    if data.len() < 5 {
        return 0;
    }
    let raw = ((data[2] as i32) << 16) | ((data[3] as i32) << 8) | data[4] as i32;
    if raw & 0x80_0000 != 0 {
        raw | !0xFF_FFFF
    } else {
        raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::frame::MediaKind;

    #[test]
    fn test_video_frame_type() {
        assert_eq!(
            VideoFrameType::from_byte(0x17),
            Some(VideoFrameType::Keyframe)
        );
        assert_eq!(
            VideoFrameType::from_byte(0x27),
            Some(VideoFrameType::InterFrame)
        );
        assert_eq!(VideoFrameType::from_byte(0x07), None);
        assert!(VideoFrameType::GeneratedKeyframe.is_keyframe());
        assert!(!VideoFrameType::DisposableInterFrame.is_keyframe());
    }

    #[test]
    fn test_file_header_roundtrip_and_rejects_garbage() {
        let encoded = FileHeader::default().encode();
        assert_eq!(encoded.len(), FILE_HEADER_SIZE + PREVIOUS_TAG_SIZE);
        let parsed = FileHeader::parse(&encoded).unwrap();
        assert!(parsed.has_audio && parsed.has_video);

        assert!(FileHeader::parse(b"FLX\x01\x05\x00\x00\x00\x09").is_err());
        assert!(FileHeader::parse(b"FLV").is_err());
    }

    #[test]
    fn test_tag_encode_layout() {
        let tag = FlvTag::video(0x0102_0304, Bytes::from_static(&[0x17, 0x01, 0, 0, 0]));
        let out = tag.encode();
        assert_eq!(out.len(), TAG_HEADER_SIZE + 5 + PREVIOUS_TAG_SIZE);
        assert_eq!(out[0], 9);
        assert_eq!(&out[1..4], &[0, 0, 5]);
        // lower 24 bits, then the extension byte
        assert_eq!(&out[4..8], &[0x02, 0x03, 0x04, 0x01]);
        assert_eq!(&out[out.len() - 4..], &16u32.to_be_bytes());

        let mut header = [0u8; TAG_HEADER_SIZE];
        header.copy_from_slice(&out[..TAG_HEADER_SIZE]);
        let parsed = TagHeader::parse(&header);
        assert_eq!(parsed.kind(), Some(FlvTagType::Video));
        assert_eq!(parsed.data_size, 5);
        assert_eq!(parsed.timestamp, 0x0102_0304);
    }

    #[test]
    fn test_sequence_header_detection() {
        assert!(is_avc_sequence_header(&[0x17, 0x00, 0, 0, 0]));
        assert!(!is_avc_sequence_header(&[0x17, 0x01, 0, 0, 0]));
        assert!(!is_avc_sequence_header(&[0x1C, 0x00]));
        assert!(!is_avc_sequence_header(&[0x17]));

        assert!(is_aac_sequence_header(&[0xAF, 0x00, 0x12, 0x10]));
        assert!(!is_aac_sequence_header(&[0xAF, 0x01]));
        assert!(!is_aac_sequence_header(&[0x2F, 0x00]));
    }

    #[test]
    fn test_composition_time_sign_extension() {
        assert_eq!(composition_time(&[0x27, 0x01, 0x00, 0x01, 0x00]), 256);
        assert_eq!(composition_time(&[0x27, 0x01, 0xFF, 0xFF, 0x00]), -256);
        assert_eq!(composition_time(&[0x27, 0x01]), 0);
    }

    #[test]
    fn test_video_tag_into_frame() {
        let tag = FlvTag::video(1000, Bytes::from_static(&[0x17, 0x01, 0x00, 0x00, 0x28, 0xAA]));
        let frame = tag.into_frame().unwrap();
        assert_eq!(frame.kind, MediaKind::Video);
        assert_eq!(frame.codec, Codec::H264);
        assert!(frame.keyframe);
        assert!(!frame.header);
        assert_eq!(frame.timestamp, Timestamp::new(1040, 1000));
    }

    #[test]
    fn test_sequence_header_tags_become_header_frames() {
        let video = FlvTag::video(0, Bytes::from_static(&[0x17, 0x00, 0, 0, 0, 1]))
            .into_frame()
            .unwrap();
        assert!(video.header);

        let audio = FlvTag::audio(0, Bytes::from_static(&[0xAF, 0x00, 0x12, 0x10]))
            .into_frame()
            .unwrap();
        assert!(audio.header);
        assert_eq!(audio.codec, Codec::Aac);
    }

    #[test]
    fn test_script_and_empty_tags_are_skipped() {
        let script = FlvTag {
            tag_type: FlvTagType::Script,
            timestamp: 0,
            data: Bytes::from_static(&[0x02, 0x00]),
        };
        assert!(script.into_frame().is_none());
        assert!(FlvTag::audio(0, Bytes::new()).into_frame().is_none());
    }
}
