//! Live frame fan-out
//!
//! When fan-out is enabled every publishing session owns a [`FrameBroker`]
//! registered in the [`BrokerHub`] under its stream key. Players attach to the
//! broker as consumers:
//!
//! ```text
//!                    ┌──────────────┐   push    ┌──────────┐  drain  ┌──────┐
//! publisher ─frame──►│ FrameBroker  │──────────►│ Consumer │────────►│ sink │
//!                    │ header cache │           └──────────┘         └──────┘
//!                    │ NALU parsing │──────────►│ Consumer │────────►│ sink │
//!                    └──────────────┘           └──────────┘         └──────┘
//! ```
//!
//! Frames are shared between consumers through `Bytes` reference counting.
//! Each consumer drops frames until its first video keyframe; cached sequence
//! headers are replayed to late joiners.

pub mod consumer;
pub mod fanout;
pub mod hub;
pub mod wake;

pub use consumer::{Consumer, KeyframeGate};
pub use fanout::FrameBroker;
pub use hub::BrokerHub;
pub use wake::WakeSignal;
