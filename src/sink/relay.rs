//! Downstream relay over gRPC
//!
//! One client-streaming `SendFrame` call per session. Frames are queued on a
//! bounded channel that feeds the request stream; closing the sink ends the
//! stream and waits for the processor's single [`Ack`].

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::Stream;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::{Channel, Endpoint};

use crate::error::{RelayError, Result};
use crate::media::MediaFrame;

use super::proto::{Ack, Frame, SEND_FRAME_PATH};
use super::FrameSink;

/// Client for the `message.MediaFrame` service
#[derive(Debug, Clone)]
pub struct MediaFrameClient {
    inner: tonic::client::Grpc<Channel>,
}

impl MediaFrameClient {
    /// Dial `host:port` (or a full `http://` URI)
    pub async fn connect(address: &str, connect_timeout: Duration) -> std::result::Result<Self, RelayError> {
        let uri = if address.starts_with("http://") || address.starts_with("https://") {
            address.to_string()
        } else {
            format!("http://{address}")
        };
        let channel = Endpoint::from_shared(uri)?
            .connect_timeout(connect_timeout)
            .connect()
            .await?;
        Ok(Self::new(channel))
    }

    pub fn new(channel: Channel) -> Self {
        Self {
            inner: tonic::client::Grpc::new(channel),
        }
    }

    /// Stream `frames` to the processor and wait for its acknowledgement
    pub async fn send_frame<S>(&mut self, frames: S) -> std::result::Result<Ack, RelayError>
    where
        S: Stream<Item = Frame> + Send + 'static,
    {
        self.inner
            .ready()
            .await
            .map_err(|e| tonic::Status::unknown(format!("service was not ready: {e}")))?;
        let codec = tonic_prost::ProstCodec::default();
        let path = PathAndQuery::from_static(SEND_FRAME_PATH);
        let response = self
            .inner
            .client_streaming(tonic::Request::new(frames), path, codec)
            .await?;
        Ok(response.into_inner())
    }
}

/// Forwards frames to the downstream processor
pub struct RelaySink {
    session_id: i64,
    tx: Option<mpsc::Sender<Frame>>,
    ack: Option<JoinHandle<std::result::Result<Ack, RelayError>>>,
}

impl RelaySink {
    /// Start the streaming call on a background task
    pub fn open(mut client: MediaFrameClient, session_id: i64, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let ack = tokio::spawn(async move { client.send_frame(ReceiverStream::new(rx)).await });
        Self::from_parts(session_id, tx, ack)
    }

    /// Assemble from an existing frame channel and the task that resolves to the ack
    pub fn from_parts(
        session_id: i64,
        tx: mpsc::Sender<Frame>,
        ack: JoinHandle<std::result::Result<Ack, RelayError>>,
    ) -> Self {
        Self {
            session_id,
            tx: Some(tx),
            ack: Some(ack),
        }
    }
}

#[async_trait]
impl FrameSink for RelaySink {
    async fn write(&mut self, frame: &MediaFrame) -> Result<()> {
        let tx = self.tx.as_ref().ok_or(RelayError::StreamClosed)?;
        tx.send(Frame::from_media(frame, self.session_id))
            .await
            .map_err(|_| RelayError::StreamClosed)?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        // dropping the sender ends the request stream
        self.tx.take();
        let Some(ack) = self.ack.take() else {
            return Ok(());
        };

        match ack.await {
            Ok(Ok(ack)) => {
                if ack.success {
                    tracing::debug!(session_id = self.session_id, "Relay acknowledged");
                } else {
                    tracing::warn!(
                        session_id = self.session_id,
                        message = %ack.message,
                        "Relay reported failure"
                    );
                }
                Ok(())
            }
            Ok(Err(e)) => Err(e.into()),
            Err(e) => Err(RelayError::Task(e.to_string()).into()),
        }
    }
}

impl Drop for RelaySink {
    fn drop(&mut self) {
        // without an explicit close the call is abandoned rather than awaited
        if let Some(ack) = self.ack.take() {
            ack.abort();
        }
    }
}
