//! Session registry implementation
//!
//! The registry owns every piece of state shared between connections: the
//! live-session map, the segmentation engines and the frame brokers. Sessions
//! reach it through an `Arc<SessionRegistry>` handed out by the server.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;

use crate::broker::{BrokerHub, FrameBroker};
use crate::config::AppConfig;
use crate::error::{Error, ProtocolError, Result};
use crate::media::{Muxer, TsMuxer};
use crate::segment::{SegmentFormat, SegmentManager};
use crate::session::{Binding, SessionControl, SessionPhase};
use crate::sink::{FlvPeerSink, FrameSink, LocalSegmentSink, MediaFrameClient, PeerOutput, RelaySink};

use super::auth::{Authorizer, HttpAuthorizer, StreamGrant};
use super::error::RegistryError;
use super::key::StreamKey;

/// Where publishing sessions send their frames when not writing segments
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub address: String,
    pub channel_capacity: usize,
    pub connect_timeout: Duration,
}

/// Registry behaviour switches
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    /// Run a frame broker per publisher and accept players
    pub fanout: bool,
    /// Relay to the frame processor instead of writing local segments
    pub relay: Option<RelaySettings>,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            fanout: true,
            relay: None,
        }
    }
}

/// Why a session is being torn down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownReason {
    /// Clean end of stream
    End,
    /// Read or protocol failure
    Error,
    /// Registry-wide shutdown
    Shutdown,
}

impl std::fmt::Display for TeardownReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TeardownReason::End => f.write_str("end"),
            TeardownReason::Error => f.write_str("error"),
            TeardownReason::Shutdown => f.write_str("shutdown"),
        }
    }
}

struct LiveSession {
    control: Arc<SessionControl>,
    key: StreamKey,
}

/// Central registry for live sessions
///
/// The live map is keyed by the validator's stream id. Its lock is only held
/// for the map mutation itself; validator calls, file I/O and broker dispatch
/// all happen outside it.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<i64, LiveSession>>,
    authorizer: Arc<dyn Authorizer>,
    segments: SegmentManager,
    brokers: BrokerHub,
    settings: RegistrySettings,
}

impl SessionRegistry {
    pub fn new(
        authorizer: Arc<dyn Authorizer>,
        segments: SegmentManager,
        settings: RegistrySettings,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            authorizer,
            segments,
            brokers: BrokerHub::new(),
            settings,
        }
    }

    /// Build the registry the binary runs with
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let timeout = config.server.request_timeout();
        let authorizer = HttpAuthorizer::new(&config.server.broadcast_server_address, timeout)?;
        let format = SegmentFormat::of(&TsMuxer::new());
        let segments = SegmentManager::new(
            config.segment.base_path.clone(),
            config.segment.policy(),
            format,
        );
        let settings = RegistrySettings {
            fanout: config.server.fanout,
            relay: config.server.media_processor.as_ref().map(|mp| RelaySettings {
                address: mp.address.clone(),
                channel_capacity: mp.channel_capacity,
                connect_timeout: timeout,
            }),
        };
        Ok(Self::new(Arc::new(authorizer), segments, settings))
    }

    pub fn settings(&self) -> &RegistrySettings {
        &self.settings
    }

    pub fn segments(&self) -> &SegmentManager {
        &self.segments
    }

    pub fn brokers(&self) -> &BrokerHub {
        &self.brokers
    }

    /// Authorize a publish request and register the session as live
    ///
    /// On success the session is bound to the granted stream id, its engine is
    /// open (local mode) and its phase is `Authorized`. On failure nothing
    /// stays registered; the session is back in `Idle`, unless a teardown
    /// claimed it meanwhile, which yields [`RegistryError::SessionClosed`].
    pub async fn check_valid_stream(
        &self,
        control: &Arc<SessionControl>,
        app: &str,
        stream_key: &str,
    ) -> Result<StreamGrant> {
        if !control.transition(SessionPhase::Idle, SessionPhase::Preparing) {
            return Err(ProtocolError::UnexpectedMessage(format!(
                "prepare while {:?}",
                control.phase()
            ))
            .into());
        }

        let grant = match self.authorizer.activate(stream_key).await {
            Ok(grant) => grant,
            Err(e) => {
                control.transition(SessionPhase::Preparing, SessionPhase::Idle);
                tracing::warn!(
                    session_id = control.id(),
                    app,
                    stream_key,
                    error = %e,
                    "Publish not authorized"
                );
                return Err(e.into());
            }
        };
        let stream_id = grant.stream_id;
        let key = StreamKey::new(app, stream_key);

        {
            let mut sessions = self.sessions.write().await;
            if sessions.contains_key(&stream_id) {
                drop(sessions);
                control.transition(SessionPhase::Preparing, SessionPhase::Idle);
                tracing::warn!(
                    session_id = control.id(),
                    stream_id,
                    "Stream already has a live session"
                );
                return Err(RegistryError::StreamAlreadyPublishing(stream_id).into());
            }
            sessions.insert(
                stream_id,
                LiveSession {
                    control: Arc::clone(control),
                    key: key.clone(),
                },
            );
        }

        if self.settings.relay.is_none() {
            if let Err(e) = self.segments.open_stream(stream_id, &grant.url) {
                self.release_publisher(control, stream_id, &key).await;
                control.transition(SessionPhase::Preparing, SessionPhase::Idle);
                tracing::warn!(
                    session_id = control.id(),
                    stream_id,
                    error = %e,
                    "Failed to open stream segments"
                );
                return Err(e.into());
            }
        }

        // whoever takes the binding back out releases the stream: a racing
        // teardown, or the failed commit below
        control.bind(Binding::Publisher {
            stream_id,
            key: key.clone(),
        });
        if !control.transition(SessionPhase::Preparing, SessionPhase::Authorized) {
            if let Binding::Publisher { .. } = control.take_binding() {
                self.release_publisher(control, stream_id, &key).await;
            }
            tracing::warn!(
                session_id = control.id(),
                stream_id,
                "Session stopped during authorization"
            );
            return Err(RegistryError::SessionClosed(control.id()).into());
        }

        tracing::info!(
            session_id = control.id(),
            stream_id,
            stream = %key,
            url = %grant.url,
            "Publish authorized"
        );
        Ok(grant)
    }

    /// Wire an authorized session for publishing
    ///
    /// Returns the sink the session writes every frame to and, when fan-out is
    /// enabled, the broker it publishes to.
    pub async fn stream_start(
        &self,
        control: &Arc<SessionControl>,
    ) -> Result<(Box<dyn FrameSink>, Option<Arc<FrameBroker>>)> {
        let (stream_id, key) = match control.binding() {
            Binding::Publisher { stream_id, key } if control.phase() == SessionPhase::Authorized => {
                (stream_id, key)
            }
            _ => return Err(RegistryError::UnknownSession(control.id()).into()),
        };

        let broker = if self.settings.fanout {
            Some(self.brokers.create(key.clone(), control.id()).await?)
        } else {
            None
        };

        let sink = match self.open_sink(stream_id).await {
            Ok(sink) => sink,
            Err(e) => {
                self.release_broker(&key, control.id()).await;
                return Err(e);
            }
        };

        if !control.transition(SessionPhase::Authorized, SessionPhase::Publishing) {
            self.release_broker(&key, control.id()).await;
            return Err(RegistryError::UnknownSession(control.id()).into());
        }

        tracing::info!(
            session_id = control.id(),
            stream_id,
            stream = %key,
            relay = self.settings.relay.is_some(),
            fanout = broker.is_some(),
            "Publishing started"
        );
        Ok((sink, broker))
    }

    async fn open_sink(&self, stream_id: i64) -> Result<Box<dyn FrameSink>> {
        match &self.settings.relay {
            Some(relay) => {
                let client = MediaFrameClient::connect(&relay.address, relay.connect_timeout).await?;
                Ok(Box::new(RelaySink::open(
                    client,
                    stream_id,
                    relay.channel_capacity,
                )))
            }
            None => {
                let segments = self
                    .segments
                    .get(stream_id)
                    .ok_or(RegistryError::UnknownSession(stream_id as u64))?;
                let muxer: Box<dyn Muxer> = Box::new(TsMuxer::new());
                Ok(Box::new(LocalSegmentSink::new(stream_id, muxer, segments)))
            }
        }
    }

    async fn release_broker(&self, key: &StreamKey, publisher_id: u64) {
        if let Some(broker) = self.brokers.remove(key, publisher_id).await {
            broker.close().await;
        }
    }

    /// Whether a player could attach to `key` right now
    pub async fn check_playable(&self, key: &StreamKey) -> Result<()> {
        if !self.settings.fanout {
            return Err(RegistryError::FanoutDisabled.into());
        }
        if self.brokers.get(key).await.is_none() {
            return Err(RegistryError::StreamNotFound(key.clone()).into());
        }
        Ok(())
    }

    /// Attach an idle session to a live stream as a player
    ///
    /// The session passes `Preparing` while the broker is looked up and
    /// `Authorized` while the consumer is attached.
    pub async fn attach_player(
        &self,
        control: &Arc<SessionControl>,
        key: StreamKey,
        output: PeerOutput,
    ) -> Result<u64> {
        if !self.settings.fanout {
            return Err(RegistryError::FanoutDisabled.into());
        }
        if !control.transition(SessionPhase::Idle, SessionPhase::Preparing) {
            return Err(ProtocolError::UnexpectedMessage(format!(
                "play while {:?}",
                control.phase()
            ))
            .into());
        }

        let Some(broker) = self.brokers.get(&key).await else {
            control.transition(SessionPhase::Preparing, SessionPhase::Idle);
            return Err(RegistryError::StreamNotFound(key).into());
        };
        if !control.transition(SessionPhase::Preparing, SessionPhase::Authorized) {
            return Err(RegistryError::SessionClosed(control.id()).into());
        }

        let consumer_id = match broker
            .attach(Arc::clone(control), Box::new(FlvPeerSink::new(output)))
            .await
        {
            Ok(consumer_id) => consumer_id,
            Err(e) => {
                control.transition(SessionPhase::Authorized, SessionPhase::Idle);
                return Err(e.into());
            }
        };

        control.bind(Binding::Player {
            key: key.clone(),
            consumer_id,
        });
        if !control.transition(SessionPhase::Authorized, SessionPhase::Playing) {
            if let Binding::Player { .. } = control.take_binding() {
                broker.detach(consumer_id).await;
            }
            return Err(RegistryError::SessionClosed(control.id()).into());
        }

        tracing::info!(session_id = control.id(), stream = %key, consumer_id, "Playing started");
        Ok(consumer_id)
    }

    /// Producer reached end of stream
    pub async fn stream_end(&self, control: &Arc<SessionControl>) -> bool {
        self.teardown(control, TeardownReason::End).await
    }

    /// Producer failed
    pub async fn stream_error(&self, control: &Arc<SessionControl>, error: &Error) -> bool {
        tracing::warn!(session_id = control.id(), error = %error, "Session failed");
        self.teardown(control, TeardownReason::Error).await
    }

    /// Run the session's teardown. Only the first caller does any work;
    /// returns whether this call did.
    pub async fn teardown(&self, control: &Arc<SessionControl>, reason: TeardownReason) -> bool {
        if !control.begin_teardown() {
            return false;
        }

        match control.take_binding() {
            Binding::Publisher { stream_id, key } => {
                self.release_publisher(control, stream_id, &key).await;
            }
            Binding::Player { key, consumer_id } => {
                if let Some(broker) = self.brokers.get(&key).await {
                    broker.detach(consumer_id).await;
                }
            }
            Binding::None => {}
        }

        control.request_stop();
        control.mark_terminated();
        tracing::info!(session_id = control.id(), reason = %reason, "Session terminated");
        true
    }

    /// Drop everything a publisher holds: its live-map entry, the validator
    /// activation, its segment engine and its broker
    async fn release_publisher(&self, control: &Arc<SessionControl>, stream_id: i64, key: &StreamKey) {
        let removed = {
            let mut sessions = self.sessions.write().await;
            let owned = sessions.get(&stream_id).map(|live| live.control.id()) == Some(control.id());
            if owned {
                sessions.remove(&stream_id)
            } else {
                None
            }
        };
        if removed.is_some() {
            self.deactivate(control.id(), stream_id, &key.name).await;
            if self.settings.relay.is_none() {
                self.segments.close_stream(stream_id);
            }
        } else {
            // the id belongs to someone else now; leave their engine alone
            tracing::warn!(
                session_id = control.id(),
                stream_id,
                "Session missing from live map during teardown"
            );
        }
        self.release_broker(key, control.id()).await;
    }

    async fn deactivate(&self, session_id: u64, stream_id: i64, stream_key: &str) {
        if let Err(e) = self.authorizer.deactivate(stream_key).await {
            tracing::warn!(session_id, stream_id, error = %e, "Failed to deactivate stream");
        }
    }

    /// Stop every live session and every broker
    pub async fn terminate_all(&self) {
        let controls: Vec<Arc<SessionControl>> = self
            .sessions
            .read()
            .await
            .values()
            .map(|live| Arc::clone(&live.control))
            .collect();
        tracing::info!(sessions = controls.len(), "Terminating all sessions");

        for control in &controls {
            self.teardown(control, TeardownReason::Shutdown).await;
        }
        for broker in self.brokers.drain().await {
            broker.close().await;
        }
    }

    pub async fn is_live(&self, stream_id: i64) -> bool {
        self.sessions.read().await.contains_key(&stream_id)
    }

    pub async fn live_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Stream key a live stream id was published under
    pub async fn live_key(&self, stream_id: i64) -> Option<StreamKey> {
        self.sessions
            .read()
            .await
            .get(&stream_id)
            .map(|live| live.key.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use tempfile::TempDir;

    use crate::error::AuthError;
    use crate::segment::CutPolicy;

    #[derive(Default)]
    struct FakeAuthorizer {
        grants: Mutex<HashMap<String, StreamGrant>>,
        activations: AtomicUsize,
        deactivations: AtomicUsize,
    }

    impl FakeAuthorizer {
        fn with(key: &str, stream_id: i64, url: &str) -> Arc<Self> {
            let auth = Self::default();
            auth.grants.lock().unwrap().insert(
                key.to_string(),
                StreamGrant {
                    stream_id,
                    url: url.to_string(),
                },
            );
            Arc::new(auth)
        }
    }

    #[async_trait]
    impl Authorizer for FakeAuthorizer {
        async fn activate(&self, stream_key: &str) -> std::result::Result<StreamGrant, AuthError> {
            self.activations.fetch_add(1, Ordering::SeqCst);
            self.grants
                .lock()
                .unwrap()
                .get(stream_key)
                .cloned()
                .ok_or_else(|| AuthError::Denied("unknown key".into()))
        }

        async fn deactivate(&self, _stream_key: &str) -> std::result::Result<(), AuthError> {
            self.deactivations.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn registry(auth: Arc<FakeAuthorizer>, dir: &TempDir, fanout: bool) -> SessionRegistry {
        let segments = SegmentManager::new(
            dir.path(),
            CutPolicy::Keyframe,
            SegmentFormat::of(&TsMuxer::new()),
        );
        SessionRegistry::new(
            auth,
            segments,
            RegistrySettings {
                fanout,
                relay: None,
            },
        )
    }

    #[tokio::test]
    async fn test_denied_stream_opens_nothing() {
        let dir = TempDir::new().unwrap();
        let registry = registry(Arc::new(FakeAuthorizer::default()), &dir, true);
        let control = SessionControl::new(1);

        let err = registry
            .check_valid_stream(&control, "live", "nope")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Authorization(AuthError::Denied(_))));
        assert_eq!(control.phase(), SessionPhase::Idle);
        assert_eq!(control.binding(), Binding::None);
        assert_eq!(registry.segments().stream_count(), 0);
        assert_eq!(registry.live_count().await, 0);
    }

    #[tokio::test]
    async fn test_approved_stream_opens_engine_under_url() {
        let dir = TempDir::new().unwrap();
        let registry = registry(FakeAuthorizer::with("s1", 42, "/abc"), &dir, true);
        let control = SessionControl::new(1);

        let grant = registry
            .check_valid_stream(&control, "live", "s1")
            .await
            .unwrap();
        assert_eq!(grant.stream_id, 42);
        assert!(registry.is_live(42).await);
        assert_eq!(registry.live_key(42).await, Some(StreamKey::new("live", "s1")));
        assert!(dir.path().join("abc").is_dir());
        assert!(registry.segments().get(42).is_some());
        assert_eq!(control.phase(), SessionPhase::Authorized);
        assert_eq!(control.stream_id(), Some(42));
    }

    #[tokio::test]
    async fn test_duplicate_stream_id_is_refused() {
        let dir = TempDir::new().unwrap();
        let registry = registry(FakeAuthorizer::with("s1", 42, "/abc"), &dir, true);
        let first = SessionControl::new(1);
        let second = SessionControl::new(2);

        registry.check_valid_stream(&first, "live", "s1").await.unwrap();
        let err = registry
            .check_valid_stream(&second, "live", "s1")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Registry(RegistryError::StreamAlreadyPublishing(42))
        ));
        assert_eq!(second.phase(), SessionPhase::Idle);
        assert_eq!(registry.live_count().await, 1);
        assert_eq!(first.phase(), SessionPhase::Authorized);
    }

    #[tokio::test]
    async fn test_concurrent_teardown_runs_once() {
        let dir = TempDir::new().unwrap();
        let auth = FakeAuthorizer::with("s1", 7, "/s1");
        let registry = Arc::new(registry(Arc::clone(&auth), &dir, true));
        let control = SessionControl::new(1);
        registry.check_valid_stream(&control, "live", "s1").await.unwrap();
        let (_sink, broker) = registry.stream_start(&control).await.unwrap();
        assert!(broker.is_some());

        let mut tasks = Vec::new();
        for i in 0..8 {
            let registry = Arc::clone(&registry);
            let control = Arc::clone(&control);
            tasks.push(tokio::spawn(async move {
                if i % 2 == 0 {
                    registry.stream_end(&control).await
                } else {
                    let err = Error::Protocol(ProtocolError::InvalidFlvHeader);
                    registry.stream_error(&control, &err).await
                }
            }));
        }
        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap() {
                winners += 1;
            }
        }

        assert_eq!(winners, 1);
        assert_eq!(auth.deactivations.load(Ordering::SeqCst), 1);
        assert_eq!(control.phase(), SessionPhase::Terminated);
        assert!(control.is_stop_requested());
        assert!(!registry.is_live(7).await);
        assert_eq!(registry.segments().stream_count(), 0);
        assert_eq!(registry.brokers().count().await, 0);

        assert!(!registry.stream_end(&control).await);
        assert_eq!(auth.deactivations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_teardown_of_unauthorized_session_skips_validator() {
        let dir = TempDir::new().unwrap();
        let auth = Arc::new(FakeAuthorizer::default());
        let registry = registry(Arc::clone(&auth), &dir, true);
        let control = SessionControl::new(1);

        assert!(registry.stream_end(&control).await);
        assert_eq!(auth.deactivations.load(Ordering::SeqCst), 0);
        assert_eq!(control.phase(), SessionPhase::Terminated);
    }

    #[tokio::test]
    async fn test_stream_start_requires_authorization() {
        let dir = TempDir::new().unwrap();
        let registry = registry(Arc::new(FakeAuthorizer::default()), &dir, true);
        let control = SessionControl::new(3);
        let err = registry.stream_start(&control).await.err().unwrap();
        assert!(matches!(err, Error::Registry(RegistryError::UnknownSession(3))));
    }

    #[tokio::test]
    async fn test_player_needs_live_broker_and_fanout() {
        let dir = TempDir::new().unwrap();
        let key = StreamKey::new("live", "s1");

        let registry_off = registry(FakeAuthorizer::with("s1", 7, "/s1"), &dir, false);
        let (_, write) = tokio::io::duplex(64);
        let err = registry_off
            .attach_player(&SessionControl::new(2), key.clone(), crate::sink::peer_output(write))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Registry(RegistryError::FanoutDisabled)));

        let registry = registry(FakeAuthorizer::with("s1", 7, "/s1"), &dir, true);
        let player = SessionControl::new(2);
        let (_, write) = tokio::io::duplex(64);
        let err = registry
            .attach_player(&player, key.clone(), crate::sink::peer_output(write))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Registry(RegistryError::StreamNotFound(_))));
        assert_eq!(player.phase(), SessionPhase::Idle);
    }

    #[tokio::test]
    async fn test_publisher_teardown_stops_players() {
        let dir = TempDir::new().unwrap();
        let registry = registry(FakeAuthorizer::with("s1", 7, "/s1"), &dir, true);
        let publisher = SessionControl::new(1);
        registry.check_valid_stream(&publisher, "live", "s1").await.unwrap();
        registry.stream_start(&publisher).await.unwrap();

        let player = SessionControl::new(2);
        let (_read, write) = tokio::io::duplex(4096);
        registry
            .attach_player(&player, StreamKey::new("live", "s1"), crate::sink::peer_output(write))
            .await
            .unwrap();
        assert_eq!(player.phase(), SessionPhase::Playing);

        registry.stream_end(&publisher).await;
        assert!(player.is_stop_requested());

        assert!(registry.stream_end(&player).await);
        assert_eq!(player.phase(), SessionPhase::Terminated);
    }

    #[tokio::test]
    async fn test_terminate_all_stops_live_sessions() {
        let dir = TempDir::new().unwrap();
        let auth = FakeAuthorizer::with("a", 1, "/a");
        auth.grants.lock().unwrap().insert(
            "b".into(),
            StreamGrant {
                stream_id: 2,
                url: "/b".into(),
            },
        );
        let registry = registry(Arc::clone(&auth), &dir, true);
        let a = SessionControl::new(10);
        let b = SessionControl::new(11);
        registry.check_valid_stream(&a, "live", "a").await.unwrap();
        registry.check_valid_stream(&b, "live", "b").await.unwrap();
        registry.stream_start(&a).await.unwrap();

        registry.terminate_all().await;
        assert_eq!(registry.live_count().await, 0);
        assert_eq!(registry.segments().stream_count(), 0);
        assert_eq!(registry.brokers().count().await, 0);
        assert!(a.is_stop_requested() && b.is_stop_requested());
        assert_eq!(auth.deactivations.load(Ordering::SeqCst), 2);
    }

    /// Claims the session's teardown while its activation is in flight
    struct ClaimDuringActivate {
        inner: Arc<FakeAuthorizer>,
        control: Arc<SessionControl>,
    }

    #[async_trait]
    impl Authorizer for ClaimDuringActivate {
        async fn activate(&self, stream_key: &str) -> std::result::Result<StreamGrant, AuthError> {
            self.control.begin_teardown();
            self.inner.activate(stream_key).await
        }

        async fn deactivate(&self, stream_key: &str) -> std::result::Result<(), AuthError> {
            self.inner.deactivate(stream_key).await
        }
    }

    #[tokio::test]
    async fn test_teardown_claimed_during_authorization_releases_stream() {
        let dir = TempDir::new().unwrap();
        let inner = FakeAuthorizer::with("s1", 7, "/s1");
        let control = SessionControl::new(1);
        let auth = Arc::new(ClaimDuringActivate {
            inner: Arc::clone(&inner),
            control: Arc::clone(&control),
        });
        let segments = SegmentManager::new(
            dir.path(),
            CutPolicy::Keyframe,
            SegmentFormat::of(&TsMuxer::new()),
        );
        let registry = SessionRegistry::new(auth, segments, RegistrySettings::default());

        let err = registry
            .check_valid_stream(&control, "live", "s1")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Registry(RegistryError::SessionClosed(1))));
        assert!(!registry.is_live(7).await);
        assert_eq!(registry.segments().stream_count(), 0);
        assert_eq!(control.binding(), Binding::None);
        assert_eq!(inner.deactivations.load(Ordering::SeqCst), 1);

        // the stream id is free again
        let next = SessionControl::new(2);
        registry.check_valid_stream(&next, "live", "s1").await.unwrap();
        assert!(registry.is_live(7).await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_authorization_racing_terminate_all_leaves_nothing_behind() {
        for _ in 0..200 {
            let dir = TempDir::new().unwrap();
            let auth = FakeAuthorizer::with("s1", 7, "/s1");
            let registry = Arc::new(registry(Arc::clone(&auth), &dir, true));
            let control = SessionControl::new(1);

            let terminator = {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move {
                    for _ in 0..20 {
                        registry.terminate_all().await;
                        tokio::task::yield_now().await;
                    }
                })
            };
            let result = registry.check_valid_stream(&control, "live", "s1").await;
            terminator.await.unwrap();

            match result {
                Ok(grant) => assert_eq!(grant.stream_id, 7),
                Err(e) => assert!(
                    matches!(e, Error::Registry(RegistryError::SessionClosed(1))),
                    "{e}"
                ),
            }

            registry.terminate_all().await;
            assert!(control.phase().is_finished());
            assert_eq!(registry.live_count().await, 0);
            assert_eq!(registry.segments().stream_count(), 0);
            assert_eq!(auth.deactivations.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test]
    async fn test_player_attach_requires_idle_session() {
        let dir = TempDir::new().unwrap();
        let registry = registry(FakeAuthorizer::with("s1", 7, "/s1"), &dir, true);
        let publisher = SessionControl::new(1);
        registry.check_valid_stream(&publisher, "live", "s1").await.unwrap();
        let (_sink, broker) = registry.stream_start(&publisher).await.unwrap();
        let broker = broker.unwrap();
        let key = StreamKey::new("live", "s1");

        // the publisher itself cannot also play
        let (_read, write) = tokio::io::duplex(64);
        let err = registry
            .attach_player(&publisher, key.clone(), crate::sink::peer_output(write))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(ProtocolError::UnexpectedMessage(_))));

        // a session already torn down gets nothing attached
        let gone = SessionControl::new(3);
        assert!(registry.stream_end(&gone).await);
        let (_read, write) = tokio::io::duplex(64);
        assert!(registry
            .attach_player(&gone, key.clone(), crate::sink::peer_output(write))
            .await
            .is_err());
        assert_eq!(broker.consumer_count().await, 0);

        let player = SessionControl::new(2);
        let (_read, write) = tokio::io::duplex(4096);
        let consumer_id = registry
            .attach_player(&player, key.clone(), crate::sink::peer_output(write))
            .await
            .unwrap();
        assert_eq!(player.phase(), SessionPhase::Playing);
        assert_eq!(player.binding(), Binding::Player { key, consumer_id });
        assert_eq!(broker.consumer_count().await, 1);
    }
}
