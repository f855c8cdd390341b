//! One published stream's fan-out

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::media::h264::{self, AvcConfig, DEFAULT_NALU_LENGTH_SIZE};
use crate::media::{Codec, MediaFrame, MediaKind};
use crate::registry::{RegistryError, StreamKey};
use crate::session::SessionControl;
use crate::sink::FrameSink;

use super::consumer::{self, Consumer};

#[derive(Default)]
struct BrokerState {
    /// Attach order
    consumers: Vec<Arc<Consumer>>,
    video_header: Option<MediaFrame>,
    audio_header: Option<MediaFrame>,
    closed: bool,
}

/// Distributes one publisher's frames to any number of consumers
///
/// Each consumer gets its own queue and drain task, so a slow or failing
/// consumer never blocks the publisher or its siblings. Dispatch snapshots the
/// consumer list and releases the lock before touching any queue.
pub struct FrameBroker {
    key: StreamKey,
    publisher_id: u64,
    state: RwLock<BrokerState>,
    nalu_length_size: AtomicU8,
    next_consumer_id: AtomicU64,
    published: AtomicU64,
    closed: AtomicBool,
}

impl std::fmt::Debug for FrameBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameBroker")
            .field("key", &self.key)
            .field("publisher_id", &self.publisher_id)
            .finish_non_exhaustive()
    }
}

impl FrameBroker {
    pub fn new(key: StreamKey, publisher_id: u64) -> Self {
        Self {
            key,
            publisher_id,
            state: RwLock::new(BrokerState::default()),
            nalu_length_size: AtomicU8::new(DEFAULT_NALU_LENGTH_SIZE),
            next_consumer_id: AtomicU64::new(1),
            published: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn key(&self) -> &StreamKey {
        &self.key
    }

    pub fn publisher_id(&self) -> u64 {
        self.publisher_id
    }

    /// Classify and distribute one frame; returns the classified frame
    ///
    /// H.264 pictures are split into NAL units and marked as keyframes when any
    /// unit is an IDR slice. Timestamps pass through untouched.
    pub async fn publish(&self, mut frame: MediaFrame) -> MediaFrame {
        if frame.codec == Codec::H264 {
            if frame.header {
                self.learn_avc_config(&frame);
            } else {
                let pieces = h264::split_access_unit(
                    &frame.payload,
                    self.nalu_length_size.load(Ordering::Relaxed),
                );
                if !pieces.is_empty() {
                    frame.keyframe = pieces.iter().any(|p| h264::is_idr(p));
                }
            }
        }

        let snapshot: Vec<Arc<Consumer>> = if frame.header {
            let mut state = self.state.write().await;
            match frame.kind {
                MediaKind::Video => state.video_header = Some(frame.clone()),
                MediaKind::Audio => state.audio_header = Some(frame.clone()),
            }
            state.consumers.clone()
        } else {
            self.state.read().await.consumers.clone()
        };

        for consumer in &snapshot {
            consumer.push(frame.clone());
        }

        self.published.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(
            stream = %self.key,
            kind = %frame.kind,
            keyframe = frame.keyframe,
            pts = frame.timestamp.pts,
            consumers = snapshot.len(),
            "Frame dispatched"
        );
        frame
    }

    fn learn_avc_config(&self, header: &MediaFrame) {
        match AvcConfig::from_flv_body(&header.payload) {
            Ok(config) => {
                self.nalu_length_size
                    .store(config.nalu_length_size, Ordering::Relaxed);
                tracing::debug!(
                    stream = %self.key,
                    profile = config.profile,
                    level = config.level,
                    nalu_length_size = config.nalu_length_size,
                    "AVC decoder configuration"
                );
            }
            Err(e) => {
                tracing::warn!(stream = %self.key, error = %e, "Ignoring malformed AVC sequence header");
            }
        }
    }

    /// Attach a consumer session and start its drain loop
    ///
    /// Cached sequence headers are queued first so a late joiner can decode
    /// from its first keyframe.
    pub async fn attach(
        &self,
        session: Arc<SessionControl>,
        sink: Box<dyn FrameSink>,
    ) -> Result<u64, RegistryError> {
        let id = self.next_consumer_id.fetch_add(1, Ordering::Relaxed);
        let consumer = Arc::new(Consumer::new(id, Arc::clone(&session)));

        {
            let mut state = self.state.write().await;
            if state.closed {
                return Err(RegistryError::StreamNotFound(self.key.clone()));
            }
            for header in [&state.video_header, &state.audio_header].into_iter().flatten() {
                consumer.enqueue(header.clone());
            }
            state.consumers.push(Arc::clone(&consumer));
        }

        if consumer.pending_len() > 0 {
            consumer.wake();
        }
        tokio::spawn(consumer::drain(consumer, sink));

        tracing::info!(
            stream = %self.key,
            session_id = session.id(),
            consumer_id = id,
            "Consumer attached"
        );
        Ok(id)
    }

    /// Remove a consumer. Unknown ids are ignored.
    pub async fn detach(&self, consumer_id: u64) -> bool {
        let removed = {
            let mut state = self.state.write().await;
            let position = state.consumers.iter().position(|c| c.id() == consumer_id);
            position.map(|i| state.consumers.remove(i))
        };

        match removed {
            Some(consumer) => {
                consumer.detach();
                tracing::info!(stream = %self.key, consumer_id, "Consumer detached");
                true
            }
            None => false,
        }
    }

    /// Stop every consumer session and refuse further attaches. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let consumers = {
            let mut state = self.state.write().await;
            state.closed = true;
            std::mem::take(&mut state.consumers)
        };
        for consumer in &consumers {
            consumer.detach();
            consumer.session_control().request_stop();
        }
        tracing::info!(
            stream = %self.key,
            consumers = consumers.len(),
            published = self.published.load(Ordering::Relaxed),
            "Broker closed"
        );
    }

    pub async fn consumer_count(&self) -> usize {
        self.state.read().await.consumers.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use bytes::Bytes;

    use crate::error::{RelayError, Result};
    use crate::media::Timestamp;

    #[derive(Clone, Default)]
    struct Collect {
        frames: Arc<Mutex<Vec<MediaFrame>>>,
        fail: bool,
    }

    impl Collect {
        fn failing() -> Self {
            Self {
                fail: true,
                ..Default::default()
            }
        }

        fn len(&self) -> usize {
            self.frames.lock().unwrap().len()
        }

        fn pts(&self) -> Vec<u64> {
            self.frames
                .lock()
                .unwrap()
                .iter()
                .map(|f| f.timestamp.pts)
                .collect()
        }
    }

    #[async_trait]
    impl FrameSink for Collect {
        async fn write(&mut self, frame: &MediaFrame) -> Result<()> {
            if self.fail {
                return Err(RelayError::StreamClosed.into());
            }
            self.frames.lock().unwrap().push(frame.clone());
            Ok(())
        }

        async fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn avc(ts: u64, nalu_type: u8) -> MediaFrame {
        let mut body = vec![0x27, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x02];
        body.extend_from_slice(&[nalu_type, 0x88]);
        MediaFrame::video(Codec::H264, Timestamp::new(ts, ts), Bytes::from(body), false)
    }

    fn idr(ts: u64) -> MediaFrame {
        avc(ts, 0x65)
    }

    fn slice(ts: u64) -> MediaFrame {
        avc(ts, 0x41)
    }

    fn avc_header() -> MediaFrame {
        let body = Bytes::from_static(&[
            0x17, 0x00, 0x00, 0x00, 0x00, 0x01, 0x64, 0x00, 0x1F, 0xFF, 0xE1, 0x00, 0x02, 0x67,
            0x64, 0x01, 0x00, 0x02, 0x68, 0xEF,
        ]);
        MediaFrame::video(Codec::H264, Timestamp::ZERO, body, true).into_header()
    }

    async fn wait_for_len(sink: &Collect, len: usize) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while sink.len() < len {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("consumer did not receive frames in time");
    }

    fn broker() -> FrameBroker {
        FrameBroker::new(StreamKey::new("live", "s1"), 1)
    }

    #[tokio::test]
    async fn test_publish_classifies_idr_from_nal_units() {
        let broker = broker();
        assert!(broker.publish(idr(0)).await.keyframe);

        let mut flagged = slice(40);
        flagged.keyframe = true;
        assert!(!broker.publish(flagged).await.keyframe);
    }

    #[tokio::test]
    async fn test_header_learns_nalu_length_size() {
        let broker = broker();
        broker.publish(avc_header()).await;
        assert_eq!(broker.nalu_length_size.load(Ordering::Relaxed), 4);

        // malformed header keeps the previous value
        let body = Bytes::from_static(&[0x17, 0x00, 0x00, 0x00, 0x00, 0x02]);
        let bad = MediaFrame::video(Codec::H264, Timestamp::ZERO, body, true).into_header();
        broker.publish(bad).await;
        assert_eq!(broker.nalu_length_size.load(Ordering::Relaxed), 4);
    }

    #[tokio::test]
    async fn test_consumer_receives_frames_in_publish_order() {
        let broker = broker();
        let sink = Collect::default();
        broker
            .attach(SessionControl::new(2), Box::new(sink.clone()))
            .await
            .unwrap();

        broker.publish(idr(0)).await;
        for i in 1..50u64 {
            broker.publish(slice(i * 40)).await;
        }

        wait_for_len(&sink, 50).await;
        let expected: Vec<u64> = (0..50u64).map(|i| i * 40).collect();
        assert_eq!(sink.pts(), expected);
    }

    #[tokio::test]
    async fn test_late_consumer_gets_headers_then_waits_for_keyframe() {
        let broker = broker();
        broker.publish(avc_header()).await;
        broker.publish(idr(0)).await;
        broker.publish(slice(40)).await;

        let sink = Collect::default();
        broker
            .attach(SessionControl::new(2), Box::new(sink.clone()))
            .await
            .unwrap();
        broker.publish(slice(80)).await;
        broker.publish(idr(120)).await;
        broker.publish(slice(160)).await;

        wait_for_len(&sink, 3).await;
        let frames = sink.frames.lock().unwrap().clone();
        assert_eq!(frames.len(), 3);
        assert!(frames[0].header);
        assert_eq!(frames[1].timestamp.pts, 120);
        assert!(frames[1].keyframe);
        assert_eq!(frames[2].timestamp.pts, 160);
    }

    #[tokio::test]
    async fn test_cached_headers_drain_without_further_publish() {
        let broker = broker();
        broker.publish(avc_header()).await;

        let sink = Collect::default();
        broker
            .attach(SessionControl::new(2), Box::new(sink.clone()))
            .await
            .unwrap();

        wait_for_len(&sink, 1).await;
        assert!(sink.frames.lock().unwrap()[0].header);
    }

    #[tokio::test]
    async fn test_failing_consumer_does_not_affect_others() {
        let broker = broker();
        let bad_session = SessionControl::new(2);
        broker
            .attach(Arc::clone(&bad_session), Box::new(Collect::failing()))
            .await
            .unwrap();
        let good = Collect::default();
        broker
            .attach(SessionControl::new(3), Box::new(good.clone()))
            .await
            .unwrap();

        broker.publish(idr(0)).await;
        for i in 1..10u64 {
            broker.publish(slice(i * 40)).await;
        }

        wait_for_len(&good, 10).await;
        tokio::time::timeout(Duration::from_secs(1), bad_session.stopped())
            .await
            .unwrap();
        assert_eq!(good.len(), 10);
    }

    #[tokio::test]
    async fn test_detach_is_idempotent() {
        let broker = broker();
        let id = broker
            .attach(SessionControl::new(2), Box::new(Collect::default()))
            .await
            .unwrap();
        assert_eq!(broker.consumer_count().await, 1);
        assert!(broker.detach(id).await);
        assert!(!broker.detach(id).await);
        assert_eq!(broker.consumer_count().await, 0);
    }

    #[tokio::test]
    async fn test_close_stops_consumers_and_refuses_attach() {
        let broker = broker();
        let session = SessionControl::new(2);
        broker
            .attach(Arc::clone(&session), Box::new(Collect::default()))
            .await
            .unwrap();

        broker.close().await;
        broker.close().await;
        assert!(broker.is_closed());
        assert!(session.is_stop_requested());
        assert_eq!(broker.consumer_count().await, 0);

        let err = broker
            .attach(SessionControl::new(3), Box::new(Collect::default()))
            .await
            .unwrap_err();
        assert_eq!(err, RegistryError::StreamNotFound(StreamKey::new("live", "s1")));
    }
}
