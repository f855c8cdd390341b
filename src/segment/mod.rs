//! Segmentation engine
//!
//! Turns a stream of muxed chunks into a run of closed files, each covering a
//! contiguous time range.
//!
//! ```text
//!                      SegmentManager
//!                    stream_id -> StreamSegments
//!                                  │
//!    write_video / write_audio ──► CutPolicy? ──cut──► close current, open next
//!                                  │
//!                                  ▼
//!                  <base>/<dest>/<index>_<YYYYmmddHHMMSS>.<ext>
//! ```

pub mod file;
pub mod manager;
pub mod policy;
pub mod stream;

pub use file::Segment;
pub use manager::{SegmentManager, SharedSegments};
pub use policy::{ChunkKind, CutPolicy};
pub use stream::{SegmentFormat, StreamSegments};
