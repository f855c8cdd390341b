//! Segment cut decisions

use crate::media::Timestamp;

use super::file::Segment;

/// What kind of chunk is about to be written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    Video { keyframe: bool },
    Audio,
}

/// When to close the current segment and start a new one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CutPolicy {
    /// Cut on every video keyframe
    #[default]
    Keyframe,
    /// Cut once a chunk lies more than `max` time units past the segment's begin time
    Duration { max: u64 },
}

impl CutPolicy {
    /// Whether `chunk` must start a new segment
    ///
    /// Every policy opens a segment when none is open.
    pub fn should_cut(&self, current: Option<&Segment>, chunk: ChunkKind, timestamp: Timestamp) -> bool {
        let Some(segment) = current.filter(|s| s.is_open()) else {
            return true;
        };
        match self {
            CutPolicy::Keyframe => matches!(chunk, ChunkKind::Video { keyframe: true }),
            CutPolicy::Duration { max } => segment
                .begin_time()
                .map(|begin| begin.diff(&timestamp) > *max)
                .unwrap_or(false),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            CutPolicy::Keyframe => "keyframe",
            CutPolicy::Duration { .. } => "duration",
        }
    }
}
