//! Per-connection session task
//!
//! One task per accepted connection reads the socket and feeds the protocol
//! adapter; the adapter calls back into [`SessionCore`] on the same task.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

use crate::broker::FrameBroker;
use crate::error::{Error, ProtocolError, Result};
use crate::media::MediaFrame;
use crate::protocol::{PrepareResult, ProtocolAdapter, SessionHandler, StreamMode};
use crate::registry::{SessionRegistry, StreamKey};
use crate::sink::{FrameSink, PeerOutput};
use crate::stats::SessionStats;

use super::state::{SessionControl, SessionPhase};

/// Handler side of a session: everything the adapter's callbacks touch
pub struct SessionCore {
    control: Arc<SessionControl>,
    registry: Arc<SessionRegistry>,
    output: PeerOutput,
    requested: Option<(StreamMode, StreamKey)>,
    sink: Option<Box<dyn FrameSink>>,
    broker: Option<Arc<FrameBroker>>,
    stats: SessionStats,
}

impl SessionCore {
    pub fn new(control: Arc<SessionControl>, registry: Arc<SessionRegistry>, output: PeerOutput) -> Self {
        Self {
            control,
            registry,
            output,
            requested: None,
            sink: None,
            broker: None,
            stats: SessionStats::new(),
        }
    }

    pub fn control(&self) -> &Arc<SessionControl> {
        &self.control
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// Close the sink, if any. Safe to call more than once.
    async fn close_sink(&mut self) {
        if let Some(mut sink) = self.sink.take() {
            if let Err(e) = sink.close().await {
                tracing::warn!(session_id = self.control.id(), error = %e, "Sink close failed");
            }
        }
        self.broker = None;
    }
}

#[async_trait]
impl SessionHandler for SessionCore {
    async fn on_prepare(&mut self, mode: StreamMode, key: &StreamKey) -> PrepareResult {
        self.requested = Some((mode, key.clone()));
        let checked = match mode {
            StreamMode::Publish => self
                .registry
                .check_valid_stream(&self.control, &key.app, &key.name)
                .await
                .map(|_| ()),
            StreamMode::Play => self.registry.check_playable(key).await,
        };
        match checked {
            Ok(()) => PrepareResult::Accept,
            Err(e) => PrepareResult::Reject(e.to_string()),
        }
    }

    async fn on_publish_start(&mut self) -> Result<()> {
        let (sink, broker) = self.registry.stream_start(&self.control).await?;
        self.sink = Some(sink);
        self.broker = broker;
        Ok(())
    }

    async fn on_play_start(&mut self) -> Result<()> {
        let key = match &self.requested {
            Some((StreamMode::Play, key)) => key.clone(),
            _ => return Err(ProtocolError::UnexpectedMessage("play without request".into()).into()),
        };
        self.registry
            .attach_player(&self.control, key, Arc::clone(&self.output))
            .await?;
        Ok(())
    }

    async fn on_frame(&mut self, frame: MediaFrame) -> Result<()> {
        if self.control.phase() != SessionPhase::Publishing {
            self.stats.dropped_frames += 1;
            return Ok(());
        }

        let frame = match &self.broker {
            Some(broker) => broker.publish(frame).await,
            None => frame,
        };
        self.stats.record_frame(&frame);
        tracing::trace!(
            session_id = self.control.id(),
            kind = %frame.kind,
            pts = frame.timestamp.pts,
            dts = frame.timestamp.dts,
            keyframe = frame.keyframe,
            size = frame.size(),
            "Frame received"
        );

        if let Some(sink) = self.sink.as_mut() {
            if let Err(e) = sink.write(&frame).await {
                self.stats.dropped_frames += 1;
                return Err(e);
            }
        }
        Ok(())
    }

    async fn on_error(&mut self, error: &Error) {
        tracing::debug!(session_id = self.control.id(), error = %error, "Protocol adapter error");
    }

    async fn write_output(&mut self, data: &[u8]) -> Result<()> {
        let mut output = self.output.lock().await;
        output.write_all(data).await?;
        output.flush().await?;
        Ok(())
    }
}

/// One connection from accept to teardown
pub struct Session {
    core: SessionCore,
    adapter: Box<dyn ProtocolAdapter>,
    read_buffer_size: usize,
}

impl Session {
    pub fn new(core: SessionCore, adapter: Box<dyn ProtocolAdapter>, read_buffer_size: usize) -> Self {
        Self {
            core,
            adapter,
            read_buffer_size: read_buffer_size.max(1),
        }
    }

    pub fn id(&self) -> u64 {
        self.core.control.id()
    }

    /// Read until end of stream, an error, or a stop request; then tear down
    pub async fn run<R>(mut self, mut reader: R) -> Result<()>
    where
        R: AsyncRead + Send + Unpin,
    {
        let control = Arc::clone(&self.core.control);
        let registry = Arc::clone(&self.core.registry);
        let mut buf = vec![0u8; self.read_buffer_size];

        let result: Result<()> = loop {
            let n = tokio::select! {
                _ = control.stopped() => break Ok(()),
                read = reader.read(&mut buf) => match read {
                    Ok(n) => n,
                    Err(e) => break Err(e.into()),
                },
            };
            if n == 0 {
                break Ok(());
            }
            self.core.stats.bytes_received += n as u64;
            if let Err(e) = self.adapter.input(&buf[..n], &mut self.core).await {
                break Err(e);
            }
        };

        self.core.close_sink().await;
        match &result {
            Ok(()) => registry.stream_end(&control).await,
            Err(e) => registry.stream_error(&control, e).await,
        };

        let stats = &self.core.stats;
        tracing::info!(
            session_id = control.id(),
            bytes = stats.bytes_received,
            video_frames = stats.video_frames,
            audio_frames = stats.audio_frames,
            keyframes = stats.keyframes,
            dropped = stats.dropped_frames,
            duration_secs = stats.duration().as_secs(),
            bitrate = stats.bitrate(),
            "Session closed"
        );
        result
    }
}
