//! A single output file

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::error::SegmentError;
use crate::media::Timestamp;

/// One segment file covering a contiguous time range
///
/// Owns its file handle while open. `begin` is taken from the first timed write
/// and `end` follows every write after that.
#[derive(Debug)]
pub struct Segment {
    id: u64,
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    begin: Option<Timestamp>,
    end: Option<Timestamp>,
    bytes_written: u64,
}

impl Segment {
    /// Describe a segment; no file is touched until [`Segment::open`]
    pub fn new(id: u64, path: impl Into<PathBuf>) -> Self {
        Self {
            id,
            path: path.into(),
            writer: None,
            begin: None,
            end: None,
            bytes_written: 0,
        }
    }

    /// Create the file, truncating anything already at the path
    pub fn open(&mut self) -> Result<(), SegmentError> {
        let file = File::create(&self.path).map_err(|source| SegmentError::Open {
            path: self.path.clone(),
            source,
        })?;
        self.writer = Some(BufWriter::new(file));
        Ok(())
    }

    /// Append a frame's bytes
    pub fn write(&mut self, data: &[u8], timestamp: Timestamp) -> Result<(), SegmentError> {
        self.write_untimed(data)?;
        if self.begin.is_none() {
            self.begin = Some(timestamp);
        }
        self.end = Some(timestamp);
        Ok(())
    }

    /// Append bytes that carry no media time (container preamble)
    pub fn write_untimed(&mut self, data: &[u8]) -> Result<(), SegmentError> {
        let id = self.id;
        let writer = self.writer.as_mut().ok_or(SegmentError::Closed(id))?;
        writer
            .write_all(data)
            .map_err(|source| SegmentError::Write { id, source })?;
        self.bytes_written += data.len() as u64;
        Ok(())
    }

    /// Flush and release the file. Calling it again, or on a segment that was
    /// never opened, does nothing.
    pub fn close(&mut self) -> Result<(), SegmentError> {
        let Some(mut writer) = self.writer.take() else {
            return Ok(());
        };
        let id = self.id;
        writer
            .flush()
            .map_err(|source| SegmentError::Write { id, source })?;
        writer
            .get_ref()
            .sync_data()
            .map_err(|source| SegmentError::Write { id, source })?;
        Ok(())
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        self.writer.is_some()
    }

    pub fn begin_time(&self) -> Option<Timestamp> {
        self.begin
    }

    pub fn end_time(&self) -> Option<Timestamp> {
        self.end
    }

    /// Presentation time spanned so far
    pub fn duration(&self) -> u64 {
        match (self.begin, self.end) {
            (Some(begin), Some(end)) => begin.diff(&end),
            _ => 0,
        }
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(segment_id = self.id, error = %e, "Failed to close segment on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(pts: u64) -> Timestamp {
        Timestamp::new(pts, pts)
    }

    #[test]
    fn test_contents_are_concatenation_of_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("0_test.ts");
        let mut segment = Segment::new(0, &path);
        segment.open().unwrap();

        let chunks: [&[u8]; 3] = [b"abc", b"", b"defgh"];
        for (i, chunk) in chunks.iter().enumerate() {
            segment.write(chunk, ts(i as u64 * 40)).unwrap();
        }
        segment.close().unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"abcdefgh");
        assert_eq!(segment.bytes_written(), 8);
    }

    #[test]
    fn test_begin_set_once_end_follows_writes() {
        let dir = tempfile::tempdir().unwrap();
        let mut segment = Segment::new(3, dir.path().join("3.ts"));
        assert_eq!(segment.begin_time(), None);

        segment.open().unwrap();
        segment.write_untimed(b"hdr").unwrap();
        assert_eq!(segment.begin_time(), None);

        segment.write(b"a", ts(1000)).unwrap();
        segment.write(b"b", ts(1200)).unwrap();
        segment.write(b"c", ts(1500)).unwrap();
        assert_eq!(segment.begin_time(), Some(ts(1000)));
        assert_eq!(segment.end_time(), Some(ts(1500)));
        assert_eq!(segment.duration(), 500);
    }

    #[test]
    fn test_close_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut never_opened = Segment::new(1, dir.path().join("1.ts"));
        assert!(never_opened.close().is_ok());

        let mut segment = Segment::new(2, dir.path().join("2.ts"));
        segment.open().unwrap();
        assert!(segment.is_open());
        segment.close().unwrap();
        segment.close().unwrap();
        assert!(!segment.is_open());
    }

    #[test]
    fn test_write_after_close_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut segment = Segment::new(5, dir.path().join("5.ts"));
        segment.open().unwrap();
        segment.close().unwrap();

        let err = segment.write(b"late", ts(0)).unwrap_err();
        assert!(matches!(err, SegmentError::Closed(5)));
    }

    #[test]
    fn test_open_fails_in_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mut segment = Segment::new(0, dir.path().join("missing").join("0.ts"));
        assert!(matches!(segment.open(), Err(SegmentError::Open { .. })));
        assert!(!segment.is_open());
    }
}
