//! Registry error types

use super::key::StreamKey;

/// Error type for registry operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// No live broker for the key
    StreamNotFound(StreamKey),
    /// Stream id is already registered live
    StreamAlreadyPublishing(i64),
    /// Another publisher already owns the key
    StreamKeyInUse(StreamKey),
    /// Session id is not registered
    UnknownSession(u64),
    /// Play requested but fan-out is switched off
    FanoutDisabled,
    /// Session was torn down before it finished setting up
    SessionClosed(u64),
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::StreamNotFound(key) => write!(f, "Stream not found: {}", key),
            RegistryError::StreamAlreadyPublishing(id) => {
                write!(f, "Stream {} already has a live session", id)
            }
            RegistryError::StreamKeyInUse(key) => {
                write!(f, "Stream already has a publisher: {}", key)
            }
            RegistryError::UnknownSession(id) => write!(f, "Unknown session: {}", id),
            RegistryError::FanoutDisabled => write!(f, "Playback is disabled"),
            RegistryError::SessionClosed(id) => write!(f, "Session {} closed during setup", id),
        }
    }
}

impl std::error::Error for RegistryError {}
