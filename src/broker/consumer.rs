//! Broker consumers and their drain loop

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::media::MediaFrame;
use crate::session::SessionControl;
use crate::sink::FrameSink;
use crate::stats::ConsumerStats;

use super::wake::WakeSignal;

/// Drops everything until the first video keyframe, then lets all frames through
///
/// Sequence headers always pass; they are decoder configuration, not pictures.
#[derive(Debug, Default)]
pub struct KeyframeGate {
    open: bool,
}

impl KeyframeGate {
    pub fn admit(&mut self, frame: &MediaFrame) -> bool {
        if self.open || frame.header {
            return true;
        }
        if frame.is_video_keyframe() {
            self.open = true;
        }
        self.open
    }

    pub fn is_open(&self) -> bool {
        self.open
    }
}

/// One reader attached to a broker
pub struct Consumer {
    id: u64,
    session: Arc<SessionControl>,
    queue: Mutex<Vec<MediaFrame>>,
    wake: WakeSignal,
    detached: AtomicBool,
    stats: ConsumerStats,
}

impl Consumer {
    pub(crate) fn new(id: u64, session: Arc<SessionControl>) -> Self {
        Self {
            id,
            session,
            queue: Mutex::new(Vec::new()),
            wake: WakeSignal::new(),
            detached: AtomicBool::new(false),
            stats: ConsumerStats::default(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn session_id(&self) -> u64 {
        self.session.id()
    }

    pub fn stats(&self) -> &ConsumerStats {
        &self.stats
    }

    pub(crate) fn session_control(&self) -> &Arc<SessionControl> {
        &self.session
    }

    pub(crate) fn wake(&self) {
        self.wake.raise();
    }

    /// Enqueue without waking; used while the consumer is not yet visible
    pub(crate) fn enqueue(&self, frame: MediaFrame) {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(frame);
    }

    /// Enqueue and wake the drain loop
    pub(crate) fn push(&self, frame: MediaFrame) {
        self.enqueue(frame);
        self.wake.raise();
    }

    /// Swap the pending queue for an empty one
    pub(crate) fn take_pending(&self) -> Vec<MediaFrame> {
        std::mem::take(&mut *self.queue.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn pending_len(&self) -> usize {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Stop the drain loop. Idempotent.
    pub(crate) fn detach(&self) {
        if !self.detached.swap(true, Ordering::AcqRel) {
            self.wake.raise();
        }
    }

    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }
}

/// Deliver queued frames to `sink` until the consumer is detached, its session
/// stops, or the sink fails. The sink is closed on the way out.
pub(crate) async fn drain(consumer: Arc<Consumer>, mut sink: Box<dyn FrameSink>) {
    let mut gate = KeyframeGate::default();

    'run: loop {
        tokio::select! {
            _ = consumer.session.stopped() => break 'run,
            _ = consumer.wake.wait() => {}
        }
        if consumer.is_detached() {
            break;
        }

        for frame in consumer.take_pending() {
            if !gate.admit(&frame) {
                consumer.stats.record_gated();
                continue;
            }
            if let Err(e) = sink.write(&frame).await {
                tracing::warn!(
                    session_id = consumer.session_id(),
                    consumer_id = consumer.id,
                    error = %e,
                    "Consumer write failed, stopping consumer"
                );
                consumer.session.request_stop();
                break 'run;
            }
            consumer.stats.record_delivered();
        }
    }

    if let Err(e) = sink.close().await {
        tracing::debug!(consumer_id = consumer.id, error = %e, "Consumer sink close failed");
    }
    tracing::debug!(
        session_id = consumer.session_id(),
        consumer_id = consumer.id,
        delivered = consumer.stats.delivered(),
        gated = consumer.stats.gated(),
        "Consumer drained"
    );
}
