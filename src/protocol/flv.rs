//! FLV over TCP with a one-line command preamble
//!
//! ```text
//! peer ──► "PUBLISH live/s1\n"          peer ──► "PLAY live/s1\n"
//! peer ◄── "OK\n" | "ERROR <reason>\n"  peer ◄── "OK\n" | "ERROR <reason>\n"
//! peer ──► FLV header, tags...          peer ◄── FLV header, tags...
//! ```

use async_trait::async_trait;
use bytes::{Buf, BytesMut};

use crate::error::{Error, ProtocolError, Result};
use crate::media::flv::{
    FileHeader, FlvTag, TagHeader, FILE_HEADER_SIZE, PREVIOUS_TAG_SIZE, TAG_HEADER_SIZE,
};
use crate::registry::StreamKey;

use super::{PrepareResult, ProtocolAdapter, SessionHandler, StreamMode};

/// Longest accepted command line, newline included
pub const MAX_COMMAND_LEN: usize = 1024;

/// Largest accepted tag body
pub const DEFAULT_MAX_TAG_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Command,
    FileHeader,
    Tags,
    /// Player connection; anything the peer sends is ignored
    Playing,
    /// Rejected or failed; further input is an error
    Closed,
}

/// Adapter for the bundled FLV ingest protocol
pub struct FlvIngestAdapter {
    stage: Stage,
    buffer: BytesMut,
    max_tag_size: usize,
    tags: u64,
}

impl FlvIngestAdapter {
    pub fn new() -> Self {
        Self::with_max_tag_size(DEFAULT_MAX_TAG_SIZE)
    }

    pub fn with_max_tag_size(max_tag_size: usize) -> Self {
        Self {
            stage: Stage::Command,
            buffer: BytesMut::with_capacity(4096),
            max_tag_size,
            tags: 0,
        }
    }

    /// Tags decoded so far
    pub fn tags(&self) -> u64 {
        self.tags
    }

    async fn step(&mut self, handler: &mut dyn SessionHandler) -> Result<bool> {
        match self.stage {
            Stage::Command => self.read_command(handler).await,
            Stage::FileHeader => {
                if self.buffer.len() < FILE_HEADER_SIZE + PREVIOUS_TAG_SIZE {
                    return Ok(false);
                }
                let header = FileHeader::parse(&self.buffer[..FILE_HEADER_SIZE])?;
                self.buffer.advance(FILE_HEADER_SIZE + PREVIOUS_TAG_SIZE);
                tracing::debug!(
                    has_audio = header.has_audio,
                    has_video = header.has_video,
                    "FLV header"
                );
                self.stage = Stage::Tags;
                Ok(true)
            }
            Stage::Tags => self.read_tag(handler).await,
            Stage::Playing => {
                self.buffer.clear();
                Ok(false)
            }
            Stage::Closed => Err(ProtocolError::UnexpectedMessage("data after close".into()).into()),
        }
    }

    async fn read_command(&mut self, handler: &mut dyn SessionHandler) -> Result<bool> {
        let Some(end) = self.buffer.iter().position(|b| *b == b'\n') else {
            if self.buffer.len() >= MAX_COMMAND_LEN {
                return Err(ProtocolError::CommandTooLong(MAX_COMMAND_LEN).into());
            }
            return Ok(false);
        };
        if end >= MAX_COMMAND_LEN {
            return Err(ProtocolError::CommandTooLong(MAX_COMMAND_LEN).into());
        }

        let line = self.buffer.split_to(end + 1);
        let (mode, key) = parse_command(&line[..end])?;

        if let PrepareResult::Reject(reason) = handler.on_prepare(mode, &key).await {
            return Err(self.reject(handler, reason).await);
        }

        match mode {
            StreamMode::Publish => {
                if let Err(e) = handler.on_publish_start().await {
                    return Err(self.reject(handler, e.to_string()).await);
                }
                handler.write_output(b"OK\n").await?;
                self.stage = Stage::FileHeader;
            }
            StreamMode::Play => {
                // the reply has to reach the peer before the first FLV byte
                handler.write_output(b"OK\n").await?;
                handler.on_play_start().await?;
                self.stage = Stage::Playing;
            }
        }
        Ok(true)
    }

    async fn reject(&mut self, handler: &mut dyn SessionHandler, reason: String) -> Error {
        self.stage = Stage::Closed;
        let reply = format!("ERROR {}\n", reason.replace('\n', " "));
        if let Err(e) = handler.write_output(reply.as_bytes()).await {
            tracing::debug!(error = %e, "Failed to send rejection");
        }
        ProtocolError::Rejected(reason).into()
    }

    async fn read_tag(&mut self, handler: &mut dyn SessionHandler) -> Result<bool> {
        if self.buffer.len() < TAG_HEADER_SIZE {
            return Ok(false);
        }
        let mut raw = [0u8; TAG_HEADER_SIZE];
        raw.copy_from_slice(&self.buffer[..TAG_HEADER_SIZE]);
        let header = TagHeader::parse(&raw);

        let size = header.data_size as usize;
        if size > self.max_tag_size {
            return Err(ProtocolError::TagTooLarge {
                size,
                limit: self.max_tag_size,
            }
            .into());
        }
        let total = TAG_HEADER_SIZE + size + PREVIOUS_TAG_SIZE;
        if self.buffer.len() < total {
            self.buffer.reserve(total - self.buffer.len());
            return Ok(false);
        }

        let mut tag = self.buffer.split_to(total).freeze();
        tag.advance(TAG_HEADER_SIZE);
        let data = tag.split_to(size);
        self.tags += 1;

        let Some(tag_type) = header.kind() else {
            tracing::trace!(tag_type = header.tag_type, "Skipping unknown FLV tag");
            return Ok(true);
        };
        let flv_tag = FlvTag {
            tag_type,
            timestamp: header.timestamp,
            data,
        };
        if let Some(frame) = flv_tag.into_frame() {
            handler.on_frame(frame).await?;
        }
        Ok(true)
    }
}

impl Default for FlvIngestAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProtocolAdapter for FlvIngestAdapter {
    async fn input(&mut self, data: &[u8], handler: &mut dyn SessionHandler) -> Result<()> {
        self.buffer.extend_from_slice(data);
        loop {
            match self.step(handler).await {
                Ok(true) => continue,
                Ok(false) => return Ok(()),
                Err(e) => {
                    self.stage = Stage::Closed;
                    handler.on_error(&e).await;
                    return Err(e);
                }
            }
        }
    }
}

fn parse_command(line: &[u8]) -> Result<(StreamMode, StreamKey)> {
    let text = std::str::from_utf8(line)
        .map_err(|_| ProtocolError::InvalidCommand("not UTF-8".into()))?
        .trim_end_matches('\r')
        .trim();
    let invalid = || ProtocolError::InvalidCommand(text.to_string());

    let (verb, path) = text.split_once(' ').ok_or_else(invalid)?;
    let mode = match verb.to_ascii_uppercase().as_str() {
        "PUBLISH" => StreamMode::Publish,
        "PLAY" => StreamMode::Play,
        _ => return Err(invalid().into()),
    };
    let key = StreamKey::parse(path.trim()).ok_or_else(invalid)?;
    Ok((mode, key))
}
