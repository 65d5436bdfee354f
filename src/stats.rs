//! A small context object carrying diagnostic counters.
//!
//! The original implementation kept these in global singletons
//! (`Statistics`, `Log::instance`). Per the redesign notes in spec §9, this
//! crate threads a single [`Stats`] value through the components that need
//! it instead, so the core remains testable without process-wide state.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for the capture and decode pipeline.
///
/// All fields are independently-updated atomics; there is no cross-field
/// consistency guarantee beyond "each counter's value reflects the number of
/// times the corresponding event was observed," which is all the diagnostic
/// and `SIGUSR1` dump use cases need.
#[derive(Debug, Default)]
pub struct Stats {
    /// Edge-source reported overflow inside the kernel driver.
    pub overflow_in_driver: AtomicU64,
    /// Edge-source reported overflow inside our own buffering.
    pub overflow_in_buffer: AtomicU64,
    /// Total interrupts/edge records observed.
    pub interrupt_count: AtomicU64,
    /// Pulses corrected by the noise filter's spike-skip logic.
    pub corrected: AtomicU64,
    /// Sequences dropped for being shorter than `min_sequence_length`.
    pub dropped_short: AtomicU64,
    /// Sequences dropped because the sequence directory was full.
    pub sequence_pool_overflow: AtomicU64,
    /// Sequences successfully decoded.
    pub decoded: AtomicU64,
    /// Sequences offered to every decoder but decoded by none.
    pub decode_failed: AtomicU64,
    /// Readings dropped due to a registry/history allocation failure.
    pub registry_drop: AtomicU64,
    /// Sink publish attempts that returned an error.
    pub publish_errors: AtomicU64,
}

impl Stats {
    /// Construct a zeroed set of counters.
    #[must_use]
    pub fn new() -> Stats {
        Stats::default()
    }

    /// Take a consistent-enough snapshot of all counters for logging or a
    /// `SIGUSR1` dump.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            overflow_in_driver: self.overflow_in_driver.load(Ordering::Relaxed),
            overflow_in_buffer: self.overflow_in_buffer.load(Ordering::Relaxed),
            interrupt_count: self.interrupt_count.load(Ordering::Relaxed),
            corrected: self.corrected.load(Ordering::Relaxed),
            dropped_short: self.dropped_short.load(Ordering::Relaxed),
            sequence_pool_overflow: self.sequence_pool_overflow.load(Ordering::Relaxed),
            decoded: self.decoded.load(Ordering::Relaxed),
            decode_failed: self.decode_failed.load(Ordering::Relaxed),
            registry_drop: self.registry_drop.load(Ordering::Relaxed),
            publish_errors: self.publish_errors.load(Ordering::Relaxed),
        }
    }

    /// Increment a counter by one.
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
/// A point-in-time copy of [`Stats`], convenient for formatting.
pub struct StatsSnapshot {
    pub overflow_in_driver: u64,
    pub overflow_in_buffer: u64,
    pub interrupt_count: u64,
    pub corrected: u64,
    pub dropped_short: u64,
    pub sequence_pool_overflow: u64,
    pub decoded: u64,
    pub decode_failed: u64,
    pub registry_drop: u64,
    pub publish_errors: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_increments() {
        let stats = Stats::new();
        Stats::incr(&stats.decoded);
        Stats::incr(&stats.decoded);
        Stats::incr(&stats.dropped_short);

        let snap = stats.snapshot();
        assert_eq!(snap.decoded, 2);
        assert_eq!(snap.dropped_short, 1);
        assert_eq!(snap.corrected, 0);
    }
}
