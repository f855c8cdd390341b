//! Session and server counters

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::media::{MediaFrame, MediaKind};

/// Per-session counters, owned by the session task and logged at teardown
#[derive(Debug, Clone)]
pub struct SessionStats {
    pub started_at: Instant,
    /// Bytes read from the peer
    pub bytes_received: u64,
    pub video_frames: u64,
    pub audio_frames: u64,
    pub keyframes: u64,
    /// Frames a sink refused
    pub dropped_frames: u64,
}

impl Default for SessionStats {
    fn default() -> Self {
        Self {
            started_at: Instant::now(),
            bytes_received: 0,
            video_frames: 0,
            audio_frames: 0,
            keyframes: 0,
            dropped_frames: 0,
        }
    }
}

impl SessionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_frame(&mut self, frame: &MediaFrame) {
        match frame.kind {
            MediaKind::Video => {
                self.video_frames += 1;
                if frame.is_video_keyframe() {
                    self.keyframes += 1;
                }
            }
            MediaKind::Audio => self.audio_frames += 1,
        }
    }

    pub fn duration(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Average ingest bitrate in bits per second
    pub fn bitrate(&self) -> u64 {
        let secs = self.duration().as_secs();
        if secs > 0 {
            (self.bytes_received * 8) / secs
        } else {
            0
        }
    }
}

/// Delivery counters for one broker consumer
#[derive(Debug, Default)]
pub struct ConsumerStats {
    delivered: AtomicU64,
    gated: AtomicU64,
}

impl ConsumerStats {
    pub fn record_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    /// Frame discarded while waiting for the first keyframe
    pub fn record_gated(&self) {
        self.gated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn gated(&self) -> u64 {
        self.gated.load(Ordering::Relaxed)
    }
}

/// Listener-wide counters
#[derive(Debug, Default)]
pub struct ServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    rejected_connections: AtomicU64,
}

impl ServerStats {
    pub fn connection_opened(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn connection_rejected(&self) {
        self.rejected_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total_connections(&self) -> u64 {
        self.total_connections.load(Ordering::Relaxed)
    }

    pub fn active_connections(&self) -> u64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    pub fn rejected_connections(&self) -> u64 {
        self.rejected_connections.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    use crate::media::{Codec, Timestamp};

    #[test]
    fn test_record_frame() {
        let mut stats = SessionStats::new();
        let key = MediaFrame::video(Codec::H264, Timestamp::ZERO, Bytes::from_static(&[0x17]), true);
        let inter = MediaFrame::video(Codec::H264, Timestamp::ZERO, Bytes::from_static(&[0x27]), false);
        let header = key.clone().into_header();
        let audio = MediaFrame::audio(Codec::Aac, Timestamp::ZERO, Bytes::from_static(&[0xAF]));

        for frame in [&key, &inter, &header, &audio, &audio] {
            stats.record_frame(frame);
        }
        assert_eq!(stats.video_frames, 3);
        assert_eq!(stats.keyframes, 1);
        assert_eq!(stats.audio_frames, 2);
        assert_eq!(stats.bitrate(), 0);
    }

    #[test]
    fn test_server_stats() {
        let stats = ServerStats::default();
        stats.connection_opened();
        stats.connection_opened();
        stats.connection_closed();
        stats.connection_rejected();
        assert_eq!(stats.total_connections(), 2);
        assert_eq!(stats.active_connections(), 1);
        assert_eq!(stats.rejected_connections(), 1);
    }

    #[test]
    fn test_consumer_stats() {
        let stats = ConsumerStats::default();
        stats.record_gated();
        stats.record_delivered();
        stats.record_delivered();
        assert_eq!(stats.gated(), 1);
        assert_eq!(stats.delivered(), 2);
    }
}
