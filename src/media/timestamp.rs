//! Presentation/decode timestamps

/// A frame's presentation and decode time, in milliseconds
///
/// Both values are monotonically non-decreasing within one stream. The all-zero
/// value doubles as the "not yet set" sentinel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp {
    pub pts: u64,
    pub dts: u64,
}

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp { pts: 0, dts: 0 };

    pub fn new(pts: u64, dts: u64) -> Self {
        Self { pts, dts }
    }

    /// Build from an FLV tag timestamp (the decode time) and a signed composition
    /// offset; a negative result clamps to zero.
    pub fn from_flv(dts: u32, composition_time: i32) -> Self {
        let pts = (dts as i64 + composition_time as i64).max(0) as u64;
        Self {
            pts,
            dts: dts as u64,
        }
    }

    /// True when both components are zero
    pub fn is_empty(&self) -> bool {
        self.pts == 0 && self.dts == 0
    }

    /// Presentation-time delta from `self` to `later`
    ///
    /// Saturates at zero instead of wrapping if the stream goes backwards.
    pub fn diff(&self, later: &Timestamp) -> u64 {
        later.pts.saturating_sub(self.pts)
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "pts={} dts={}", self.pts, self.dts)
    }
}
