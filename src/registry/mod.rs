//! Session registry and stream authorization
//!
//! ```text
//!                         Arc<SessionRegistry>
//!                 ┌───────────────────────────────┐
//!                 │ sessions: stream id ─► session│
//!                 │ segments: SegmentManager      │
//!                 │ brokers:  BrokerHub           │
//!                 │ authorizer: dyn Authorizer    │
//!                 └──────────────┬────────────────┘
//!                                │
//!        check_valid_stream ─────┼───── stream_end / stream_error
//!        stream_start            │      terminate_all
//!        attach_player           ▼
//!                     exactly-once teardown per session
//! ```

pub mod auth;
pub mod error;
pub mod key;
pub mod store;

pub use auth::{Authorizer, HttpAuthorizer, StreamGrant};
pub use error::RegistryError;
pub use key::StreamKey;
pub use store::{RegistrySettings, RelaySettings, SessionRegistry, TeardownReason};
