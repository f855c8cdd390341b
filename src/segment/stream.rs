//! Per-stream segmentation engine

use std::path::{Path, PathBuf};

use bytes::Bytes;

use crate::error::SegmentError;
use crate::media::{Muxer, Timestamp};

use super::file::Segment;
use super::policy::{ChunkKind, CutPolicy};

/// File naming and per-file preamble for one container format
#[derive(Debug, Clone)]
pub struct SegmentFormat {
    pub extension: &'static str,
    /// Written at the start of every segment file
    pub preamble: Bytes,
}

impl SegmentFormat {
    pub fn of(muxer: &dyn Muxer) -> Self {
        Self {
            extension: muxer.file_extension(),
            preamble: muxer.preamble(),
        }
    }
}

impl Default for SegmentFormat {
    fn default() -> Self {
        Self {
            extension: "ts",
            preamble: Bytes::new(),
        }
    }
}

/// Slices one stream's muxed bytes into an ordered run of segment files
///
/// At most one segment is open at a time. Cut points come from the
/// [`CutPolicy`]; segment ids increase by one per file.
#[derive(Debug)]
pub struct StreamSegments {
    base_path: PathBuf,
    policy: CutPolicy,
    format: SegmentFormat,
    current: Option<Segment>,
    closed: Vec<Segment>,
    id_counter: u64,
    finished: bool,
}

impl StreamSegments {
    pub fn new(base_path: impl Into<PathBuf>, policy: CutPolicy) -> Self {
        Self::with_format(base_path, policy, SegmentFormat::default())
    }

    pub fn with_format(base_path: impl Into<PathBuf>, policy: CutPolicy, format: SegmentFormat) -> Self {
        Self {
            base_path: base_path.into(),
            policy,
            format,
            current: None,
            closed: Vec::new(),
            id_counter: 0,
            finished: false,
        }
    }

    /// Create the base directory (recursively) if it does not exist
    pub fn open(&mut self) -> Result<(), SegmentError> {
        std::fs::create_dir_all(&self.base_path).map_err(|source| SegmentError::CreateDir {
            path: self.base_path.clone(),
            source,
        })
    }

    pub fn write_video(&mut self, data: &[u8], timestamp: Timestamp, keyframe: bool) -> Result<(), SegmentError> {
        self.write(data, timestamp, ChunkKind::Video { keyframe })
    }

    pub fn write_audio(&mut self, data: &[u8], timestamp: Timestamp) -> Result<(), SegmentError> {
        self.write(data, timestamp, ChunkKind::Audio)
    }

    fn write(&mut self, data: &[u8], timestamp: Timestamp, chunk: ChunkKind) -> Result<(), SegmentError> {
        if self.finished {
            return Err(SegmentError::EngineClosed);
        }

        if self.policy.should_cut(self.current.as_ref(), chunk, timestamp) {
            self.cut()?;
        }

        match self.current.as_mut() {
            Some(segment) => segment.write(data, timestamp),
            None => Err(SegmentError::EngineClosed),
        }
    }

    /// Retire the current segment and open the next one
    ///
    /// If the new file cannot be created no segment is left open, so the next
    /// write retries the cut instead of landing in the retired file.
    fn cut(&mut self) -> Result<(), SegmentError> {
        self.retire_current()?;

        let id = self.id_counter;
        self.id_counter += 1;

        let name = format!(
            "{}_{}.{}",
            id,
            chrono::Local::now().format("%Y%m%d%H%M%S"),
            self.format.extension
        );
        let mut segment = Segment::new(id, self.base_path.join(name));
        segment.open()?;
        if !self.format.preamble.is_empty() {
            segment.write_untimed(&self.format.preamble)?;
        }

        tracing::debug!(
            segment_id = id,
            path = %segment.path().display(),
            "Opened segment"
        );
        self.current = Some(segment);
        Ok(())
    }

    fn retire_current(&mut self) -> Result<(), SegmentError> {
        let Some(mut segment) = self.current.take() else {
            return Ok(());
        };
        let result = segment.close();
        tracing::debug!(
            segment_id = segment.id(),
            duration = segment.duration(),
            bytes = segment.bytes_written(),
            "Closed segment"
        );
        self.closed.push(segment);
        result
    }

    /// Close whatever segment is open. Safe to call repeatedly, or before any
    /// segment was opened.
    pub fn close(&mut self) -> Result<(), SegmentError> {
        self.finished = true;
        self.retire_current()
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn policy(&self) -> CutPolicy {
        self.policy
    }

    pub fn current(&self) -> Option<&Segment> {
        self.current.as_ref()
    }

    /// Segments already cut, oldest first
    pub fn closed_segments(&self) -> &[Segment] {
        &self.closed
    }

    /// Total segments opened so far
    pub fn segment_count(&self) -> usize {
        self.closed.len() + usize::from(self.current.is_some())
    }

    pub fn is_closed(&self) -> bool {
        self.finished
    }
}
