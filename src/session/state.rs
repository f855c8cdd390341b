//! Session lifecycle state
//!
//! ```text
//! Idle ──prepare──► Preparing ──authorized──► Authorized ──┬─publish─► Publishing ─┐
//!   ▲                  │                                    └─play────► Playing ────┤
//!   └────rejected──────┘                                                           ▼
//!                                       (EOF / error / shutdown)          Stopping ──► Terminated
//! ```
//!
//! Publishers sit in `Preparing` while the validator is asked; players sit
//! there while their broker is looked up. Either way the move out of
//! `Preparing` or `Authorized` is the commit point: if a teardown claimed the
//! session first, setup releases whatever it registered and fails.
//!
//! The phase lives in an atomic so the registry and the session's own task can
//! race to tear a session down; only the caller that wins the move into
//! `Stopping` runs the teardown.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;

use crate::registry::StreamKey;

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionPhase {
    /// Connected, nothing requested yet
    Idle = 0,
    /// Prepare received, authorization in flight
    Preparing = 1,
    /// Authorized, waiting for publish or play to start
    Authorized = 2,
    Publishing = 3,
    Playing = 4,
    /// Teardown in progress
    Stopping = 5,
    /// Absorbing; nothing happens after this
    Terminated = 6,
}

impl SessionPhase {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SessionPhase::Idle,
            1 => SessionPhase::Preparing,
            2 => SessionPhase::Authorized,
            3 => SessionPhase::Publishing,
            4 => SessionPhase::Playing,
            5 => SessionPhase::Stopping,
            _ => SessionPhase::Terminated,
        }
    }

    /// Authorized, publishing or playing
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SessionPhase::Authorized | SessionPhase::Publishing | SessionPhase::Playing
        )
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, SessionPhase::Stopping | SessionPhase::Terminated)
    }
}

/// What a session is attached to once it got past authorization
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Binding {
    #[default]
    None,
    /// Registered in the live map under `stream_id`
    Publisher { stream_id: i64, key: StreamKey },
    /// Attached to the broker of `key`
    Player { key: StreamKey, consumer_id: u64 },
}

/// Shared, thread-safe handle on one session's lifecycle
#[derive(Debug)]
pub struct SessionControl {
    id: u64,
    phase: AtomicU8,
    stop_tx: watch::Sender<bool>,
    binding: Mutex<Binding>,
}

impl SessionControl {
    pub fn new(id: u64) -> Arc<Self> {
        let (stop_tx, _) = watch::channel(false);
        Arc::new(Self {
            id,
            phase: AtomicU8::new(SessionPhase::Idle as u8),
            stop_tx,
            binding: Mutex::new(Binding::None),
        })
    }

    /// Connection-scoped session id
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn phase(&self) -> SessionPhase {
        SessionPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    /// Move from `from` to `to`; false if the session was not in `from`
    pub fn transition(&self, from: SessionPhase, to: SessionPhase) -> bool {
        self.phase
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Claim the teardown. Returns true for exactly one caller over the
    /// session's lifetime.
    pub fn begin_teardown(&self) -> bool {
        let mut current = self.phase.load(Ordering::Acquire);
        loop {
            if SessionPhase::from_u8(current).is_finished() {
                return false;
            }
            match self.phase.compare_exchange_weak(
                current,
                SessionPhase::Stopping as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn mark_terminated(&self) {
        self.phase
            .store(SessionPhase::Terminated as u8, Ordering::Release);
    }

    /// Signal every waiter on [`SessionControl::stopped`]
    pub fn request_stop(&self) {
        self.stop_tx.send_replace(true);
    }

    pub fn is_stop_requested(&self) -> bool {
        *self.stop_tx.borrow()
    }

    /// Resolves once a stop has been requested
    pub async fn stopped(&self) {
        let mut rx = self.stop_tx.subscribe();
        // the sender lives in self, so the channel cannot close under us
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    pub fn bind(&self, binding: Binding) {
        *self.binding.lock().unwrap_or_else(PoisonError::into_inner) = binding;
    }

    pub fn binding(&self) -> Binding {
        self.binding
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Take the binding, leaving `Binding::None`
    pub fn take_binding(&self) -> Binding {
        std::mem::take(&mut *self.binding.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Live stream id, if this session is a registered publisher
    pub fn stream_id(&self) -> Option<i64> {
        match &*self.binding.lock().unwrap_or_else(PoisonError::into_inner) {
            Binding::Publisher { stream_id, .. } => Some(*stream_id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_initial_phase() {
        let control = SessionControl::new(1);
        assert_eq!(control.id(), 1);
        assert_eq!(control.phase(), SessionPhase::Idle);
        assert!(!control.is_stop_requested());
        assert_eq!(control.binding(), Binding::None);
    }

    #[test]
    fn test_transition_requires_expected_phase() {
        let control = SessionControl::new(1);
        assert!(!control.transition(SessionPhase::Preparing, SessionPhase::Authorized));
        assert!(control.transition(SessionPhase::Idle, SessionPhase::Preparing));
        assert!(control.transition(SessionPhase::Preparing, SessionPhase::Authorized));
        assert!(control.phase().is_active());
    }

    #[test]
    fn test_teardown_claimed_once() {
        let control = SessionControl::new(1);
        assert!(control.begin_teardown());
        assert!(!control.begin_teardown());
        control.mark_terminated();
        assert!(!control.begin_teardown());
        assert_eq!(control.phase(), SessionPhase::Terminated);
        assert!(control.phase().is_finished());
    }

    #[test]
    fn test_teardown_claimed_once_across_threads() {
        let control = SessionControl::new(9);
        control.transition(SessionPhase::Idle, SessionPhase::Preparing);
        let winners: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| scope.spawn(|| control.begin_teardown()))
                .collect();
            handles
                .into_iter()
                .map(|h| usize::from(h.join().unwrap()))
                .sum()
        });
        assert_eq!(winners, 1);
        assert_eq!(control.phase(), SessionPhase::Stopping);
    }

    #[test]
    fn test_binding() {
        let control = SessionControl::new(2);
        control.bind(Binding::Publisher {
            stream_id: 42,
            key: StreamKey::new("live", "s1"),
        });
        assert_eq!(control.stream_id(), Some(42));
        assert!(matches!(control.take_binding(), Binding::Publisher { .. }));
        assert_eq!(control.binding(), Binding::None);
        assert_eq!(control.stream_id(), None);
    }

    #[tokio::test]
    async fn test_stopped_resolves_after_request() {
        let control = SessionControl::new(3);
        let waiter = {
            let control = Arc::clone(&control);
            tokio::spawn(async move { control.stopped().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        control.request_stop();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();

        // already stopped: resolves immediately
        control.stopped().await;
    }
}
