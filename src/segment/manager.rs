//! Segmentation engines for all live streams

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::SegmentError;

use super::policy::CutPolicy;
use super::stream::{SegmentFormat, StreamSegments};

/// Engine handle shared between the registry and a session's sink
pub type SharedSegments = Arc<Mutex<StreamSegments>>;

/// Owns one [`StreamSegments`] per live stream id
///
/// Engines are rooted at `<base_path>/<destination>`, where the destination is
/// the path hint returned by the validator.
pub struct SegmentManager {
    base_path: PathBuf,
    policy: CutPolicy,
    format: SegmentFormat,
    streams: Mutex<HashMap<i64, SharedSegments>>,
}

impl SegmentManager {
    pub fn new(base_path: impl Into<PathBuf>, policy: CutPolicy, format: SegmentFormat) -> Self {
        Self {
            base_path: base_path.into(),
            policy,
            format,
            streams: Mutex::new(HashMap::new()),
        }
    }

    /// Directory an engine for `destination` is rooted at
    ///
    /// The destination must stay below the base path: `..` and absolute
    /// components are refused.
    pub fn stream_dir(&self, destination: &str) -> Result<PathBuf, SegmentError> {
        let relative = Path::new(destination.trim_start_matches('/'));
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes {
            tracing::warn!(destination, "Refusing segment destination outside base path");
            return Err(SegmentError::InvalidDestination(destination.to_string()));
        }
        Ok(self.base_path.join(relative))
    }

    /// Create and open the engine for a stream, replacing any stale engine
    /// registered under the same id.
    pub fn open_stream(&self, stream_id: i64, destination: &str) -> Result<SharedSegments, SegmentError> {
        let dir = self.stream_dir(destination)?;
        let mut segments = StreamSegments::with_format(&dir, self.policy, self.format.clone());
        segments.open()?;

        let shared = Arc::new(Mutex::new(segments));
        let stale = self
            .streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(stream_id, Arc::clone(&shared));
        if let Some(stale) = stale {
            tracing::warn!(stream_id, "Replacing stale segment engine");
            close_engine(stream_id, &stale);
        }

        tracing::info!(
            stream_id,
            path = %dir.display(),
            policy = self.policy.name(),
            "Opened stream segments"
        );
        Ok(shared)
    }

    /// Close and forget a stream's engine. Unknown ids are a logged no-op.
    pub fn close_stream(&self, stream_id: i64) {
        let removed = self
            .streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&stream_id);

        match removed {
            Some(engine) => {
                close_engine(stream_id, &engine);
                tracing::info!(stream_id, "Closed stream segments");
            }
            None => {
                tracing::debug!(stream_id, "No segment engine to close");
            }
        }
    }

    pub fn get(&self, stream_id: i64) -> Option<SharedSegments> {
        self.streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&stream_id)
            .cloned()
    }

    pub fn stream_count(&self) -> usize {
        self.streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn format(&self) -> &SegmentFormat {
        &self.format
    }
}

fn close_engine(stream_id: i64, engine: &SharedSegments) {
    let mut segments = engine.lock().unwrap_or_else(PoisonError::into_inner);
    if let Err(e) = segments.close() {
        tracing::warn!(stream_id, error = %e, "Failed to close segment");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::Timestamp;

    fn manager(dir: &tempfile::TempDir) -> SegmentManager {
        SegmentManager::new(dir.path(), CutPolicy::Keyframe, SegmentFormat::default())
    }

    #[test]
    fn test_open_stream_roots_at_destination() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir);

        let engine = manager.open_stream(42, "/abc").unwrap();
        assert_eq!(engine.lock().unwrap().base_path(), dir.path().join("abc"));
        assert!(dir.path().join("abc").is_dir());
        assert_eq!(manager.stream_count(), 1);
        assert!(manager.get(42).is_some());
    }

    #[test]
    fn test_destination_cannot_escape_base_path() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir);

        assert_eq!(manager.stream_dir("/").unwrap(), dir.path());
        assert_eq!(manager.stream_dir("/a/./b").unwrap(), dir.path().join("a/./b"));
        for destination in ["/../etc", "a/../../b", "..", "//..//x"] {
            assert!(
                matches!(
                    manager.stream_dir(destination),
                    Err(SegmentError::InvalidDestination(_))
                ),
                "{destination}"
            );
        }

        assert!(matches!(
            manager.open_stream(5, "/up/../../out"),
            Err(SegmentError::InvalidDestination(_))
        ));
        assert_eq!(manager.stream_count(), 0);
        assert!(!dir.path().parent().unwrap().join("out").exists());
    }

    #[test]
    fn test_close_stream_closes_open_segment() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir);
        let engine = manager.open_stream(7, "s1").unwrap();
        engine
            .lock()
            .unwrap()
            .write_video(b"k", Timestamp::ZERO, true)
            .unwrap();

        manager.close_stream(7);
        assert_eq!(manager.stream_count(), 0);
        let segments = engine.lock().unwrap();
        assert!(segments.is_closed());
        assert!(segments.current().is_none());
    }

    #[test]
    fn test_close_unknown_stream_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir);
        manager.close_stream(99);
        manager.close_stream(99);
        assert_eq!(manager.stream_count(), 0);
    }

    #[test]
    fn test_reopen_replaces_and_closes_stale_engine() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir);
        let first = manager.open_stream(1, "/a").unwrap();
        let second = manager.open_stream(1, "/a").unwrap();

        assert!(first.lock().unwrap().is_closed());
        assert!(!second.lock().unwrap().is_closed());
        assert_eq!(manager.stream_count(), 1);
    }

    #[test]
    fn test_open_failure_registers_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"x").unwrap();
        let manager = SegmentManager::new(&blocker, CutPolicy::Keyframe, SegmentFormat::default());

        assert!(matches!(
            manager.open_stream(3, "/x"),
            Err(SegmentError::CreateDir { .. })
        ));
        assert_eq!(manager.stream_count(), 0);
    }
}
