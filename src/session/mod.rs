//! Connection sessions
//!
//! [`SessionControl`] is the shared handle the registry and brokers hold;
//! [`Session`] is the task that owns the connection.

pub mod connection;
pub mod state;

pub use connection::{Session, SessionCore};
pub use state::{Binding, SessionControl, SessionPhase};
