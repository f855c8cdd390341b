//! Media model and container helpers
//!
//! This module provides:
//! - The frame/timestamp value types shared by every other module
//! - FLV tag parsing and generation
//! - H.264 access-unit inspection for keyframe detection
//! - The muxer seam and the MPEG-TS muxer used by segment output

pub mod flv;
pub mod frame;
pub mod h264;
pub mod mux;
pub mod timestamp;

pub use frame::{Codec, MediaFrame, MediaKind};
pub use mux::{Muxer, TsMuxer};
pub use timestamp::Timestamp;
