//! Container muxing for segment output
//!
//! Segments are MPEG transport streams: one program, H.264 video on
//! [`VIDEO_PID`] and ADTS-framed AAC on [`AUDIO_PID`].

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{MediaError, Result};

use super::frame::{Codec, MediaFrame, MediaKind};
use super::h264::{split_access_unit, AvcConfig, DEFAULT_NALU_LENGTH_SIZE};

/// Turns frames into container bytes for a segment file
///
/// Implementations may buffer state (for example decoder configuration) between
/// calls. An empty output means the frame produced nothing to write yet.
pub trait Muxer: Send {
    fn mux(&mut self, frame: &MediaFrame) -> Result<Bytes>;

    /// Extension used for segment file names, without the dot
    fn file_extension(&self) -> &'static str;

    /// Bytes written at the start of every segment file
    fn preamble(&self) -> Bytes;
}

pub const TS_PACKET_SIZE: usize = 188;
const SYNC_BYTE: u8 = 0x47;

pub const PAT_PID: u16 = 0x0000;
pub const PMT_PID: u16 = 0x1000;
pub const VIDEO_PID: u16 = 0x0100;
pub const AUDIO_PID: u16 = 0x0101;

const PROGRAM_NUMBER: u16 = 1;
const STREAM_TYPE_H264: u8 = 0x1B;
const STREAM_TYPE_AAC: u8 = 0x0F;
const VIDEO_STREAM_ID: u8 = 0xE0;
const AUDIO_STREAM_ID: u8 = 0xC0;

const START_CODE: [u8; 4] = [0, 0, 0, 1];
const ACCESS_UNIT_DELIMITER: [u8; 6] = [0, 0, 0, 1, 0x09, 0xF0];

/// FLV timestamps are milliseconds, MPEG-TS clocks tick at 90 kHz
const TICKS_PER_MS: u64 = 90;
const ADTS_HEADER_SIZE: usize = 7;

/// AudioSpecificConfig fields needed for ADTS headers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct AacConfig {
    object_type: u8,
    frequency_index: u8,
    channels: u8,
}

impl AacConfig {
    /// Parse from an FLV AAC sequence header body
    fn from_flv_body(body: &[u8]) -> Result<Self> {
        if body.len() < 4 {
            return Err(MediaError::InvalidAacPacket.into());
        }
        let asc = &body[2..];
        Ok(Self {
            object_type: asc[0] >> 3,
            frequency_index: ((asc[0] & 0x07) << 1) | (asc[1] >> 7),
            channels: (asc[1] >> 3) & 0x0F,
        })
    }

    fn adts_header(&self, payload_len: usize) -> Result<[u8; ADTS_HEADER_SIZE]> {
        let frame_len = ADTS_HEADER_SIZE + payload_len;
        if frame_len > 0x1FFF {
            return Err(MediaError::InvalidAacPacket.into());
        }
        let profile = self.object_type.saturating_sub(1) & 0x03;
        Ok([
            0xFF,
            0xF1,
            (profile << 6) | ((self.frequency_index & 0x0F) << 2) | (self.channels >> 2),
            ((self.channels & 0x03) << 6) | (frame_len >> 11) as u8,
            (frame_len >> 3) as u8,
            (((frame_len & 0x07) as u8) << 5) | 0x1F,
            0xFC,
        ])
    }
}

/// Per-PID 4-bit continuity counters
#[derive(Debug, Default)]
struct Continuity {
    pat: u8,
    pmt: u8,
    video: u8,
    audio: u8,
}

impl Continuity {
    fn next(&mut self, pid: u16) -> u8 {
        let counter = match pid {
            PAT_PID => &mut self.pat,
            PMT_PID => &mut self.pmt,
            VIDEO_PID => &mut self.video,
            _ => &mut self.audio,
        };
        let current = *counter;
        *counter = (current + 1) & 0x0F;
        current
    }
}

/// MPEG-TS muxer
///
/// AVCC access units are rewritten to Annex B with an access unit delimiter;
/// keyframes carry SPS/PPS in band and are preceded by PAT/PMT, so a segment
/// cut at a keyframe decodes on its own. AAC frames get ADTS headers. Audio in
/// any other format is dropped, video in any other codec is an error.
#[derive(Debug, Default)]
pub struct TsMuxer {
    avc: Option<AvcConfig>,
    aac: Option<AacConfig>,
    continuity: Continuity,
}

impl TsMuxer {
    pub fn new() -> Self {
        Self::default()
    }

    fn mux_video(&mut self, frame: &MediaFrame) -> Result<Bytes> {
        if frame.codec != Codec::H264 {
            return Err(MediaError::UnsupportedCodec(frame.codec.name()).into());
        }
        if frame.header {
            self.avc = Some(AvcConfig::from_flv_body(&frame.payload)?);
            return Ok(Bytes::new());
        }

        let length_size = self
            .avc
            .as_ref()
            .map_or(DEFAULT_NALU_LENGTH_SIZE, |avc| avc.nalu_length_size);
        let nalus = split_access_unit(&frame.payload, length_size);
        if nalus.is_empty() {
            return Ok(Bytes::new());
        }

        let mut es = BytesMut::with_capacity(frame.payload.len() + 64);
        es.put_slice(&ACCESS_UNIT_DELIMITER);
        if frame.keyframe {
            if let Some(avc) = &self.avc {
                for set in avc.sps.iter().chain(avc.pps.iter()) {
                    es.put_slice(&START_CODE);
                    es.put_slice(set);
                }
            }
        }
        for nalu in &nalus {
            es.put_slice(&START_CODE);
            es.put_slice(nalu);
        }

        let pts = frame.timestamp.pts * TICKS_PER_MS;
        let dts = frame.timestamp.dts * TICKS_PER_MS;
        let pes = pes_packet(VIDEO_STREAM_ID, pts, Some(dts), &es);

        let mut out = BytesMut::new();
        if frame.keyframe {
            self.write_tables(&mut out);
        }
        self.packetize(&mut out, VIDEO_PID, &pes, Some(dts), frame.keyframe);
        Ok(out.freeze())
    }

    fn mux_audio(&mut self, frame: &MediaFrame) -> Result<Bytes> {
        if frame.codec != Codec::Aac {
            return Ok(Bytes::new());
        }
        if frame.header {
            self.aac = Some(AacConfig::from_flv_body(&frame.payload)?);
            return Ok(Bytes::new());
        }
        let Some(aac) = self.aac else {
            return Ok(Bytes::new());
        };
        if frame.payload.len() <= 2 {
            return Ok(Bytes::new());
        }

        let raw = &frame.payload[2..];
        let mut es = BytesMut::with_capacity(ADTS_HEADER_SIZE + raw.len());
        es.put_slice(&aac.adts_header(raw.len())?);
        es.put_slice(raw);

        let pes = pes_packet(AUDIO_STREAM_ID, frame.timestamp.pts * TICKS_PER_MS, None, &es);
        let mut out = BytesMut::new();
        self.packetize(&mut out, AUDIO_PID, &pes, None, false);
        Ok(out.freeze())
    }

    fn write_tables(&mut self, out: &mut BytesMut) {
        let cc = self.continuity.next(PAT_PID);
        psi_packet(out, PAT_PID, cc, &pat_section());
        let cc = self.continuity.next(PMT_PID);
        psi_packet(out, PMT_PID, cc, &pmt_section());
    }

    /// Split a PES packet into transport packets
    ///
    /// The first packet carries the PCR and random access flag when asked for;
    /// the last one is padded through its adaptation field.
    fn packetize(&mut self, out: &mut BytesMut, pid: u16, pes: &[u8], pcr: Option<u64>, random_access: bool) {
        let mut remaining = pes;
        let mut first = true;

        while !remaining.is_empty() {
            let mut fields = BytesMut::new();
            if first && (pcr.is_some() || random_access) {
                let mut flags = 0u8;
                if random_access {
                    flags |= 0x40;
                }
                if pcr.is_some() {
                    flags |= 0x10;
                }
                fields.put_u8(flags);
                if let Some(pcr) = pcr {
                    let base = pcr & 0x1_FFFF_FFFF;
                    fields.put_u32((base >> 1) as u32);
                    fields.put_u8((((base & 1) as u8) << 7) | 0x7E);
                    fields.put_u8(0);
                }
            }

            let mut adaptation_len = if fields.is_empty() { 0 } else { 1 + fields.len() };
            let room = TS_PACKET_SIZE - 4 - adaptation_len;
            let take = remaining.len().min(room);
            if take < room {
                let mut deficit = room - take;
                if adaptation_len == 0 {
                    // a zero-length adaptation field is the length byte alone
                    adaptation_len = 1;
                    deficit -= 1;
                    if deficit > 0 {
                        fields.put_u8(0);
                        adaptation_len += 1;
                        deficit -= 1;
                    }
                }
                fields.put_bytes(0xFF, deficit);
                adaptation_len += deficit;
            }

            let start = out.len();
            out.put_u8(SYNC_BYTE);
            let start_indicator = if first { 0x4000 } else { 0 };
            out.put_u16(start_indicator | pid);
            let control = if adaptation_len > 0 { 0x30 } else { 0x10 };
            out.put_u8(control | self.continuity.next(pid));
            if adaptation_len > 0 {
                out.put_u8((adaptation_len - 1) as u8);
                out.put_slice(&fields);
            }
            out.put_slice(&remaining[..take]);
            debug_assert_eq!(out.len() - start, TS_PACKET_SIZE);

            remaining = &remaining[take..];
            first = false;
        }
    }
}

impl Muxer for TsMuxer {
    fn mux(&mut self, frame: &MediaFrame) -> Result<Bytes> {
        match frame.kind {
            MediaKind::Video => self.mux_video(frame),
            MediaKind::Audio => self.mux_audio(frame),
        }
    }

    fn file_extension(&self) -> &'static str {
        "ts"
    }

    /// PAT and PMT, so a file cut between keyframes still names its streams
    fn preamble(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(TS_PACKET_SIZE * 2);
        psi_packet(&mut out, PAT_PID, 0, &pat_section());
        psi_packet(&mut out, PMT_PID, 0, &pmt_section());
        out.freeze()
    }
}

fn pes_packet(stream_id: u8, pts: u64, dts: Option<u64>, es: &[u8]) -> BytesMut {
    let header_data_len: usize = if dts.is_some() { 10 } else { 5 };
    let mut pes = BytesMut::with_capacity(9 + header_data_len + es.len());
    pes.put_slice(&[0, 0, 1, stream_id]);

    let length = 3 + header_data_len + es.len();
    // video PES may be unbounded
    let length = if stream_id == VIDEO_STREAM_ID || length > 0xFFFF { 0 } else { length };
    pes.put_u16(length as u16);

    pes.put_u8(0x80);
    match dts {
        Some(dts) => {
            pes.put_u8(0xC0);
            pes.put_u8(header_data_len as u8);
            put_pes_timestamp(&mut pes, 0x3, pts);
            put_pes_timestamp(&mut pes, 0x1, dts);
        }
        None => {
            pes.put_u8(0x80);
            pes.put_u8(header_data_len as u8);
            put_pes_timestamp(&mut pes, 0x2, pts);
        }
    }
    pes.put_slice(es);
    pes
}

fn put_pes_timestamp(out: &mut BytesMut, marker: u8, ts: u64) {
    let ts = ts & 0x1_FFFF_FFFF;
    out.put_u8((marker << 4) | (((ts >> 29) as u8) & 0x0E) | 1);
    out.put_u16((((ts >> 14) & 0xFFFE) | 1) as u16);
    out.put_u16((((ts << 1) & 0xFFFE) | 1) as u16);
}

fn psi_packet(out: &mut BytesMut, pid: u16, cc: u8, section: &[u8]) {
    out.put_u8(SYNC_BYTE);
    out.put_u16(0x4000 | pid);
    out.put_u8(0x10 | (cc & 0x0F));
    // pointer field
    out.put_u8(0);
    out.put_slice(section);
    out.put_bytes(0xFF, TS_PACKET_SIZE - 5 - section.len());
}

fn section(table_id: u8, id: u16, body: &[u8]) -> BytesMut {
    let mut s = BytesMut::with_capacity(12 + body.len());
    s.put_u8(table_id);
    s.put_u16(0xB000 | (5 + body.len() + 4) as u16);
    s.put_u16(id);
    // version 0, current
    s.put_u8(0xC1);
    s.put_u8(0);
    s.put_u8(0);
    s.put_slice(body);
    let crc = crc32_mpeg2(&s);
    s.put_u32(crc);
    s
}

fn pat_section() -> BytesMut {
    let mut body = BytesMut::with_capacity(4);
    body.put_u16(PROGRAM_NUMBER);
    body.put_u16(0xE000 | PMT_PID);
    section(0x00, 1, &body)
}

fn pmt_section() -> BytesMut {
    let mut body = BytesMut::with_capacity(14);
    body.put_u16(0xE000 | VIDEO_PID);
    body.put_u16(0xF000);
    for (stream_type, pid) in [(STREAM_TYPE_H264, VIDEO_PID), (STREAM_TYPE_AAC, AUDIO_PID)] {
        body.put_u8(stream_type);
        body.put_u16(0xE000 | pid);
        body.put_u16(0xF000);
    }
    section(0x02, PROGRAM_NUMBER, &body)
}

fn crc32_mpeg2(data: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    for &byte in data {
        crc ^= (byte as u32) << 24;
        for _ in 0..8 {
            crc = if crc & 0x8000_0000 != 0 {
                (crc << 1) ^ 0x04C1_1DB7
            } else {
                crc << 1
            };
        }
    }
    crc
}
