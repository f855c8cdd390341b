//! H.264/AVC access-unit inspection
//!
//! FLV carries H.264 in AVCC form: a 5-byte video header (frame type/codec,
//! AVCPacketType, 24-bit composition time) followed by length-prefixed NAL units.
//! The broker uses this module to split a frame into its NAL units and decide
//! whether any of them is an IDR picture.

use bytes::{Buf, Bytes};

use crate::error::{MediaError, Result};

/// Bytes preceding the NAL units in an FLV AVC video body
pub const AVC_VIDEO_HEADER_SIZE: usize = 5;

/// Length prefix size assumed until a decoder configuration says otherwise
pub const DEFAULT_NALU_LENGTH_SIZE: u8 = 4;

/// AVC packet type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AvcPacketType {
    SequenceHeader = 0,
    Nalu = 1,
    EndOfSequence = 2,
}

impl AvcPacketType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(AvcPacketType::SequenceHeader),
            1 => Some(AvcPacketType::Nalu),
            2 => Some(AvcPacketType::EndOfSequence),
            _ => None,
        }
    }
}

/// NAL unit type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NaluType {
    Slice = 1,
    SlicePartA = 2,
    SlicePartB = 3,
    SlicePartC = 4,
    /// Instantaneous decoder refresh
    Idr = 5,
    Sei = 6,
    Sps = 7,
    Pps = 8,
    Aud = 9,
    EndSeq = 10,
    EndStream = 11,
    Filler = 12,
}

impl NaluType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b & 0x1F {
            1 => Some(NaluType::Slice),
            2 => Some(NaluType::SlicePartA),
            3 => Some(NaluType::SlicePartB),
            4 => Some(NaluType::SlicePartC),
            5 => Some(NaluType::Idr),
            6 => Some(NaluType::Sei),
            7 => Some(NaluType::Sps),
            8 => Some(NaluType::Pps),
            9 => Some(NaluType::Aud),
            10 => Some(NaluType::EndSeq),
            11 => Some(NaluType::EndStream),
            12 => Some(NaluType::Filler),
            _ => None,
        }
    }

    pub fn is_keyframe(&self) -> bool {
        matches!(self, NaluType::Idr)
    }
}

/// AVCDecoderConfigurationRecord, the payload of an AVC sequence header
#[derive(Debug, Clone)]
pub struct AvcConfig {
    pub profile: u8,
    pub level: u8,
    /// Size of each NAL unit length prefix in bytes (1, 2 or 4)
    pub nalu_length_size: u8,
    pub sps: Vec<Bytes>,
    pub pps: Vec<Bytes>,
}

impl AvcConfig {
    /// Parse from an FLV video body whose packet type is the sequence header
    pub fn from_flv_body(body: &Bytes) -> Result<Self> {
        if body.len() < AVC_VIDEO_HEADER_SIZE {
            return Err(MediaError::InvalidAvcPacket.into());
        }
        Self::parse(body.slice(AVC_VIDEO_HEADER_SIZE..))
    }

    /// Parse a bare AVCDecoderConfigurationRecord
    pub fn parse(mut data: Bytes) -> Result<Self> {
        if data.len() < 7 || data.get_u8() != 1 {
            return Err(MediaError::InvalidAvcPacket.into());
        }

        let profile = data.get_u8();
        let _compatibility = data.get_u8();
        let level = data.get_u8();
        let nalu_length_size = (data.get_u8() & 0x03) + 1;

        let num_sps = (data.get_u8() & 0x1F) as usize;
        let sps = read_parameter_sets(&mut data, num_sps)?;

        if data.is_empty() {
            return Err(MediaError::InvalidAvcPacket.into());
        }
        let num_pps = data.get_u8() as usize;
        let pps = read_parameter_sets(&mut data, num_pps)?;

        Ok(AvcConfig {
            profile,
            level,
            nalu_length_size,
            sps,
            pps,
        })
    }
}

fn read_parameter_sets(data: &mut Bytes, count: usize) -> Result<Vec<Bytes>> {
    let mut sets = Vec::with_capacity(count);
    for _ in 0..count {
        if data.len() < 2 {
            return Err(MediaError::InvalidAvcPacket.into());
        }
        let len = data.get_u16() as usize;
        if data.len() < len {
            return Err(MediaError::InvalidAvcPacket.into());
        }
        sets.push(data.split_to(len));
    }
    Ok(sets)
}

/// Split an FLV AVC NALU body into its NAL units
///
/// Pieces are zero-copy slices of `body`. Non-NALU packet types and truncated
/// trailing data yield no further pieces.
pub fn split_access_unit(body: &Bytes, nalu_length_size: u8) -> Vec<Bytes> {
    if body.len() <= AVC_VIDEO_HEADER_SIZE
        || AvcPacketType::from_byte(body[1]) != Some(AvcPacketType::Nalu)
    {
        return Vec::new();
    }
    let nalus = body.slice(AVC_VIDEO_HEADER_SIZE..);
    let mut pieces = Vec::new();
    let mut offset = 0;
    for nalu in NaluIterator::new(&nalus, nalu_length_size) {
        offset += nalu_length_size as usize;
        pieces.push(nalus.slice(offset..offset + nalu.len()));
        offset += nalu.len();
    }
    pieces
}

/// True when any NAL unit in the access unit is an IDR picture
pub fn contains_idr(body: &Bytes, nalu_length_size: u8) -> bool {
    split_access_unit(body, nalu_length_size)
        .iter()
        .any(|piece| is_idr(piece))
}

/// True when a single NAL unit is an IDR slice
pub fn is_idr(nalu: &[u8]) -> bool {
    nalu.first()
        .and_then(|b| NaluType::from_byte(*b))
        .map(|t| t.is_keyframe())
        .unwrap_or(false)
}

/// Iterator over NAL units in AVCC format
pub struct NaluIterator<'a> {
    data: &'a [u8],
    offset: usize,
    nalu_length_size: usize,
}

impl<'a> NaluIterator<'a> {
    pub fn new(data: &'a [u8], nalu_length_size: u8) -> Self {
        Self {
            data,
            offset: 0,
            nalu_length_size: nalu_length_size as usize,
        }
    }
}

impl<'a> Iterator for NaluIterator<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        if self.nalu_length_size == 0 || self.offset + self.nalu_length_size > self.data.len() {
            return None;
        }

        let mut len: usize = 0;
        for i in 0..self.nalu_length_size {
            len = (len << 8) | (self.data[self.offset + i] as usize);
        }
        self.offset += self.nalu_length_size;

        if self.offset + len > self.data.len() {
            return None;
        }

        let nalu = &self.data[self.offset..self.offset + len];
        self.offset += len;
        Some(nalu)
    }
}
