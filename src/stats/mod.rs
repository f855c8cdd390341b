//! Statistics and metrics

pub mod metrics;

pub use metrics::{ConsumerStats, ServerStats, SessionStats};
