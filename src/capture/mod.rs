//! Edge capture: timestamped GPIO levels in, candidate pulses out.

pub mod ring;
pub mod source;

pub use source::{EdgeRecord, EdgeSource, Level, SourceError};

/// `(level-before-the-pulse, duration_us)`. A pulse is the interval between
/// two consecutive edges; the level named is the level that was held for
/// `duration_us` before the edge that ended it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pulse {
    pub level: Level,
    pub duration_us: u32,
}
