//! Segments an edge stream into candidate sequences (spec §4.C).
//!
//! Runs on the capture thread: one [`Assembler`] owns the pulse pool and
//! sequence directory and is fed pulses one at a time. It never blocks and
//! never allocates on the hot path (the `Vec` inside [`crate::capture::ring::PulsePool`]
//! is pre-sized at construction).

use crate::capture::ring::{PulsePool, SequenceDirectory, SequenceEntry};
use crate::capture::Level;
use crate::stats::Stats;

/// Spike longer than this closes the sequence outright (spec §4.C).
pub const IGNORABLE_SKIP_US: u32 = 60;
/// At most this many spike pairs may be absorbed by the noise filter.
pub const MAX_IGNORED_SKIPS: u32 = 2;
/// A corrected duration longer than this closes the sequence even if it
/// would otherwise fall in range (spec §4.C.3).
pub const MAX_PERIOD_US: u32 = 1150;

#[derive(Debug, Clone, Copy)]
pub struct AssemblerLimits {
    pub min_duration_us: u32,
    pub max_duration_us: u32,
    pub min_sequence_length: usize,
}

impl Default for AssemblerLimits {
    fn default() -> Self {
        AssemblerLimits {
            min_duration_us: crate::DEFAULT_MIN_DURATION_US,
            max_duration_us: crate::DEFAULT_MAX_DURATION_US,
            min_sequence_length: crate::DEFAULT_MIN_SEQUENCE_LENGTH,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenState {
    Closed,
    Open {
        start_pool_index: usize,
        length: usize,
        start_monotonic_us: u32,
        /// Monotonic time of the last pulse actually appended to the pool;
        /// the noise filter corrects a spike's duration as the gap from
        /// this point to the pulse that ends the spike (spec §4.C.3).
        last_good_us: u32,
        skips: u32,
    },
}

pub struct Assembler {
    limits: AssemblerLimits,
    state: OpenState,
    /// `true` when the noise filter (interrupt-callback source only) is
    /// active; kernel-device and replay sources already deliver filtered
    /// pulses.
    noise_filter_enabled: bool,
    last_level: Option<Level>,
}

impl Assembler {
    #[must_use]
    pub fn new(limits: AssemblerLimits, noise_filter_enabled: bool) -> Assembler {
        Assembler {
            limits,
            state: OpenState::Closed,
            noise_filter_enabled,
            last_level: None,
        }
    }

    /// Feed one pulse; may open, extend, or close the current sequence.
    /// `pool` receives the duration encoded for later `copy_out`; `dir`
    /// receives a directory entry when a sequence closes successfully.
    pub fn on_pulse(
        &mut self,
        level: Level,
        duration_us: u32,
        pool: &mut PulsePool,
        dir: &mut SequenceDirectory,
        monotonic_us: u32,
        stats: &Stats,
    ) {
        let in_range = duration_us >= self.limits.min_duration_us && duration_us <= self.limits.max_duration_us;

        match self.state {
            OpenState::Closed => {
                if level == Level::High && in_range {
                    if !pool.has_room() {
                        return;
                    }
                    let encoded = duration_us.min(i16::MAX as u32) as i16;
                    let idx = pool.push(encoded);
                    self.state = OpenState::Open {
                        start_pool_index: idx,
                        length: 1,
                        start_monotonic_us: monotonic_us,
                        last_good_us: monotonic_us,
                        skips: 0,
                    };
                }
            }
            OpenState::Open { start_pool_index, length, start_monotonic_us, last_good_us, skips } => {
                if in_range {
                    if !pool.has_room() {
                        self.close_sequence(start_pool_index, length, start_monotonic_us, dir, stats);
                        return;
                    }
                    let encoded = duration_us.min(i16::MAX as u32) as i16;
                    pool.push(encoded);
                    let new_length = length + 1;
                    if new_length >= crate::MAX_SEQUENCE_LENGTH {
                        self.close_sequence(start_pool_index, new_length, start_monotonic_us, dir, stats);
                    } else {
                        self.state = OpenState::Open {
                            start_pool_index,
                            length: new_length,
                            start_monotonic_us,
                            last_good_us: monotonic_us,
                            skips,
                        };
                    }
                } else if self.noise_filter_enabled && duration_us <= IGNORABLE_SKIP_US && skips < MAX_IGNORED_SKIPS {
                    let corrected_duration = monotonic_us.wrapping_sub(last_good_us);
                    if corrected_duration > MAX_PERIOD_US {
                        self.close_sequence(start_pool_index, length, start_monotonic_us, dir, stats);
                    } else if corrected_duration >= self.limits.min_duration_us && corrected_duration <= self.limits.max_duration_us {
                        // The spike's two fronts cancel out; the corrected gap
                        // since the last good pulse replaces them as a single
                        // merged entry.
                        if !pool.has_room() {
                            self.close_sequence(start_pool_index, length, start_monotonic_us, dir, stats);
                        } else {
                            let encoded = corrected_duration.min(i16::MAX as u32) as i16;
                            pool.push(encoded);
                            Stats::incr(&stats.corrected);
                            let new_length = length + 1;
                            if new_length >= crate::MAX_SEQUENCE_LENGTH {
                                self.close_sequence(start_pool_index, new_length, start_monotonic_us, dir, stats);
                            } else {
                                self.state = OpenState::Open {
                                    start_pool_index,
                                    length: new_length,
                                    start_monotonic_us,
                                    last_good_us: monotonic_us,
                                    skips: 0,
                                };
                            }
                        }
                    } else {
                        // Still inside the ignorable window but not yet
                        // resolved to an in-range gap; keep absorbing.
                        self.state = OpenState::Open {
                            start_pool_index,
                            length,
                            start_monotonic_us,
                            last_good_us,
                            skips: skips + 1,
                        };
                    }
                } else {
                    self.close_sequence(start_pool_index, length, start_monotonic_us, dir, stats);
                }
            }
        }

        self.last_level = Some(level);
    }

    fn close_sequence(
        &mut self,
        start_pool_index: usize,
        length: usize,
        start_monotonic_us: u32,
        dir: &mut SequenceDirectory,
        stats: &Stats,
    ) {
        self.state = OpenState::Closed;
        if length < self.limits.min_sequence_length {
            Stats::incr(&stats.dropped_short);
            return;
        }
        let entry = SequenceEntry { start_pool_index, length, start_monotonic_us };
        if !dir.try_push(entry) {
            Stats::incr(&stats.sequence_pool_overflow);
        }
    }

    /// Force-close whatever sequence is open, e.g. on a driver `Break`.
    pub fn on_break(&mut self, dir: &mut SequenceDirectory, stats: &Stats) {
        if let OpenState::Open { start_pool_index, length, start_monotonic_us, .. } = self.state {
            self.close_sequence(start_pool_index, length, start_monotonic_us, dir, stats);
        }
        self.last_level = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(assembler: &mut Assembler, pool: &mut PulsePool, dir: &mut SequenceDirectory, stats: &Stats, pulses: &[(Level, u32)]) {
        for (i, (level, duration)) in pulses.iter().enumerate() {
            assembler.on_pulse(*level, *duration, pool, dir, i as u32 * 100, stats);
        }
    }

    #[test]
    fn closes_short_sequence_as_dropped() {
        let limits = AssemblerLimits { min_sequence_length: 10, ..AssemblerLimits::default() };
        let mut assembler = Assembler::new(limits, false);
        let mut pool = PulsePool::new(64);
        let mut dir = SequenceDirectory::new(8);
        let stats = Stats::new();
        let pulses: Vec<(Level, u32)> = (0..5)
            .map(|i| (if i % 2 == 0 { Level::High } else { Level::Low }, 500))
            .collect();
        feed(&mut assembler, &mut pool, &mut dir, &stats, &pulses);
        assembler.on_break(&mut dir, &stats);
        assert_eq!(dir.try_pop(), None);
        assert_eq!(stats.snapshot().dropped_short, 1);
    }

    #[test]
    fn publishes_sequence_meeting_min_length() {
        let limits = AssemblerLimits { min_sequence_length: 4, ..AssemblerLimits::default() };
        let mut assembler = Assembler::new(limits, false);
        let mut pool = PulsePool::new(64);
        let mut dir = SequenceDirectory::new(8);
        let stats = Stats::new();
        let pulses: Vec<(Level, u32)> = (0..6)
            .map(|i| (if i % 2 == 0 { Level::High } else { Level::Low }, 500))
            .collect();
        feed(&mut assembler, &mut pool, &mut dir, &stats, &pulses);
        assembler.on_break(&mut dir, &stats);
        let entry = dir.try_pop().expect("sequence published");
        assert_eq!(entry.length, 6);
    }

    #[test]
    fn out_of_range_duration_closes_sequence_without_noise_filter() {
        let limits = AssemblerLimits { min_sequence_length: 2, ..AssemblerLimits::default() };
        let mut assembler = Assembler::new(limits, false);
        let mut pool = PulsePool::new(64);
        let mut dir = SequenceDirectory::new(8);
        let stats = Stats::new();
        feed(
            &mut assembler,
            &mut pool,
            &mut dir,
            &stats,
            &[(Level::High, 500), (Level::Low, 500), (Level::High, 50_000)],
        );
        let entry = dir.try_pop().expect("sequence closed on out-of-range pulse");
        assert_eq!(entry.length, 2);
    }

    #[test]
    fn noise_filter_absorbs_small_spike() {
        let limits = AssemblerLimits { min_sequence_length: 2, ..AssemblerLimits::default() };
        let mut assembler = Assembler::new(limits, true);
        let mut pool = PulsePool::new(64);
        let mut dir = SequenceDirectory::new(8);
        let stats = Stats::new();
        // Pulses are fed 100us apart (see `feed`); the spike at index 2 is
        // 20us long but the gap since the last good pulse (index 1, at
        // t=100) to this spike's own timestamp (t=200) is 100us, which
        // falls back in range and is recorded as a corrected entry.
        feed(
            &mut assembler,
            &mut pool,
            &mut dir,
            &stats,
            &[(Level::High, 500), (Level::Low, 500), (Level::High, 20), (Level::Low, 500)],
        );
        assembler.on_break(&mut dir, &stats);
        assert_eq!(stats.snapshot().corrected, 1);
        let entry = dir.try_pop().expect("sequence still open after absorbed spike");
        assert_eq!(entry.length, 4);
        let durations = pool.copy_out(entry.start_pool_index, entry.length);
        assert_eq!(durations, vec![500, 500, 100, 500]);
    }

    #[test]
    fn noise_filter_closes_sequence_when_corrected_duration_exceeds_max_period() {
        let limits = AssemblerLimits { min_sequence_length: 2, ..AssemblerLimits::default() };
        let mut assembler = Assembler::new(limits, true);
        let mut pool = PulsePool::new(64);
        let mut dir = SequenceDirectory::new(8);
        let stats = Stats::new();
        assembler.on_pulse(Level::High, 500, &mut pool, &mut dir, 0, &stats);
        assembler.on_pulse(Level::Low, 500, &mut pool, &mut dir, 500, &stats);
        // Spike arrives long after the last good pulse; corrected duration
        // (2000us) exceeds MAX_PERIOD_US (1150), so the sequence closes
        // instead of absorbing the spike.
        assembler.on_pulse(Level::High, 20, &mut pool, &mut dir, 2500, &stats);
        let entry = dir.try_pop().expect("sequence closed on over-long corrected duration");
        assert_eq!(entry.length, 2);
        assert_eq!(stats.snapshot().corrected, 0);
    }

    #[test]
    fn noise_filter_gives_up_after_max_ignored_skips() {
        let limits = AssemblerLimits { min_sequence_length: 1, ..AssemblerLimits::default() };
        let mut assembler = Assembler::new(limits, true);
        let mut pool = PulsePool::new(64);
        let mut dir = SequenceDirectory::new(8);
        let stats = Stats::new();
        assembler.on_pulse(Level::High, 500, &mut pool, &mut dir, 0, &stats);
        // Three consecutive spikes whose corrected gap since the last good
        // pulse never climbs back above min_duration (10, 20, then a third
        // spike arriving once MAX_IGNORED_SKIPS is already used up) close
        // the sequence rather than absorbing indefinitely.
        assembler.on_pulse(Level::Low, 10, &mut pool, &mut dir, 10, &stats);
        assembler.on_pulse(Level::High, 10, &mut pool, &mut dir, 20, &stats);
        assembler.on_pulse(Level::Low, 10, &mut pool, &mut dir, 30, &stats);
        let entry = dir.try_pop().expect("sequence closed after exhausting ignored skips");
        assert_eq!(entry.length, 1);
        assert_eq!(stats.snapshot().corrected, 0);
    }

    #[test]
    fn max_sequence_length_closes_immediately() {
        let limits = AssemblerLimits { min_sequence_length: 1, ..AssemblerLimits::default() };
        let mut assembler = Assembler::new(limits, false);
        let mut pool = PulsePool::new(crate::MAX_SEQUENCE_LENGTH + 8);
        let mut dir = SequenceDirectory::new(8);
        let stats = Stats::new();
        let pulses: Vec<(Level, u32)> = (0..crate::MAX_SEQUENCE_LENGTH + 2)
            .map(|i| (if i % 2 == 0 { Level::High } else { Level::Low }, 500))
            .collect();
        feed(&mut assembler, &mut pool, &mut dir, &stats, &pulses);
        let entry = dir.try_pop().expect("sequence closed at max length");
        assert_eq!(entry.length, crate::MAX_SEQUENCE_LENGTH);
    }
}
