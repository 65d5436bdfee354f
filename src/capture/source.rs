//! The edge-source capability interface (spec §4.B) and its three
//! interchangeable implementations.
//!
//! The teacher's hardware layer defines small traits (`GpioPin`, `Adc`) so
//! that real hardware and an in-memory test double satisfy the same
//! interface; `EdgeSource` follows the same shape here.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Low,
    High,
}

impl Level {
    #[must_use]
    pub fn flipped(self) -> Level {
        match self {
            Level::Low => Level::High,
            Level::High => Level::Low,
        }
    }
}

/// One record read from an edge source: either a timestamped level change,
/// or a non-fatal driver signal that should close any in-flight sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeRecord {
    /// The pin transitioned to `level` at `monotonic_us` (wraps at 2^32).
    Edge { level: Level, monotonic_us: u32 },
    /// The driver coalesced a run of edges into a single ready-made pulse
    /// (the kernel character device does this).
    Pulse { level: Level, duration_us: u32 },
    /// Noise or a gap exceeding the driver's idle timeout: close any
    /// in-flight sequence without corrupting state.
    Break,
    /// The driver dropped records because its own buffer filled.
    OverflowInDriver,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("edge source I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("edge source channel disconnected")]
    Disconnected,
    #[error("malformed replay line: {0:?}")]
    MalformedReplayLine(String),
}

/// Non-fatal counters an edge source exposes (spec §4.B).
#[derive(Debug, Clone, Copy, Default)]
pub struct SourceCounters {
    pub overflow_in_driver: u64,
    pub overflow_in_buffer: u64,
    pub interrupt_count: u64,
}

/// Blocking read of edge/pulse records, with driver configuration knobs.
/// Implementations must never block indefinitely: `read` should return
/// within a bounded time (5 s kernel-device timeout, or a 0.5 s poll
/// interval) so the caller can observe a shutdown flag.
pub trait EdgeSource: Send {
    fn set_min_duration_us(&mut self, min: u32);
    fn set_max_duration_us(&mut self, max: u32);
    fn set_min_sequence_length(&mut self, min: usize);

    /// Read the next record, blocking for at most a driver-chosen timeout.
    /// `Ok(None)` means "timed out, no record, try again."
    fn read(&mut self) -> Result<Option<EdgeRecord>, SourceError>;

    fn counters(&self) -> SourceCounters;
}

/// (a) Kernel character-device reader: the driver already delivers filtered
/// `(status, duration)` records, so no in-process noise filtering runs on
/// this path. Reads come from an in-process channel fed by a dedicated
/// reader loop elsewhere (kept generic over the channel so tests can drive
/// it without a real device node).
pub struct KernelDeviceSource {
    records: Receiver<EdgeRecord>,
    timeout: Duration,
    counters: SourceCounters,
}

impl KernelDeviceSource {
    #[must_use]
    pub fn new(records: Receiver<EdgeRecord>) -> KernelDeviceSource {
        KernelDeviceSource {
            records,
            timeout: Duration::from_secs(5),
            counters: SourceCounters::default(),
        }
    }
}

impl EdgeSource for KernelDeviceSource {
    fn set_min_duration_us(&mut self, _min: u32) {}
    fn set_max_duration_us(&mut self, _max: u32) {}
    fn set_min_sequence_length(&mut self, _min: usize) {}

    fn read(&mut self) -> Result<Option<EdgeRecord>, SourceError> {
        match self.records.recv_timeout(self.timeout) {
            Ok(record) => {
                self.counters.interrupt_count += 1;
                if matches!(record, EdgeRecord::OverflowInDriver) {
                    self.counters.overflow_in_driver += 1;
                }
                Ok(Some(record))
            }
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(SourceError::Disconnected),
        }
    }

    fn counters(&self) -> SourceCounters {
        self.counters
    }
}

/// (b) Interrupt-callback source: raw `(level, tick)` edges, with filtering
/// left to the assembler. Driven by the same channel abstraction as
/// [`KernelDeviceSource`] but with a shorter poll interval since there is no
/// kernel-side timeout to rely on.
pub struct CallbackSource {
    edges: Receiver<EdgeRecord>,
    poll_interval: Duration,
    counters: SourceCounters,
}

impl CallbackSource {
    #[must_use]
    pub fn new(edges: Receiver<EdgeRecord>) -> CallbackSource {
        CallbackSource {
            edges,
            poll_interval: Duration::from_millis(500),
            counters: SourceCounters::default(),
        }
    }
}

impl EdgeSource for CallbackSource {
    fn set_min_duration_us(&mut self, _min: u32) {}
    fn set_max_duration_us(&mut self, _max: u32) {}
    fn set_min_sequence_length(&mut self, _min: usize) {}

    fn read(&mut self) -> Result<Option<EdgeRecord>, SourceError> {
        match self.edges.recv_timeout(self.poll_interval) {
            Ok(record) => {
                self.counters.interrupt_count += 1;
                Ok(Some(record))
            }
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(SourceError::Disconnected),
        }
    }

    fn counters(&self) -> SourceCounters {
        self.counters
    }
}

/// (c) File replay: reconstructs pulses from a text log, one sequence per
/// line, comma-separated durations. The first duration's level is assumed
/// `Low` (a sequence always opens on a low-to-high transition per spec
/// §4.C), alternating thereafter. EOF is treated as shutdown by the caller.
pub struct ReplaySource {
    lines: std::io::Lines<BufReader<File>>,
    pending: std::collections::VecDeque<EdgeRecord>,
    counters: SourceCounters,
}

impl ReplaySource {
    pub fn open(path: impl AsRef<Path>) -> Result<ReplaySource, SourceError> {
        let file = File::open(path)?;
        Ok(ReplaySource {
            lines: BufReader::new(file).lines(),
            pending: std::collections::VecDeque::new(),
            counters: SourceCounters::default(),
        })
    }

    fn load_next_line(&mut self) -> Result<bool, SourceError> {
        let Some(line) = self.lines.next() else {
            return Ok(false);
        };
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return self.load_next_line();
        }
        let mut level = Level::Low;
        for field in trimmed.split(',') {
            let duration_us: u32 = field
                .trim()
                .parse()
                .map_err(|_| SourceError::MalformedReplayLine(line.clone()))?;
            self.pending.push_back(EdgeRecord::Pulse { level, duration_us });
            level = level.flipped();
        }
        self.pending.push_back(EdgeRecord::Break);
        Ok(true)
    }
}

impl EdgeSource for ReplaySource {
    fn set_min_duration_us(&mut self, _min: u32) {}
    fn set_max_duration_us(&mut self, _max: u32) {}
    fn set_min_sequence_length(&mut self, _min: usize) {}

    fn read(&mut self) -> Result<Option<EdgeRecord>, SourceError> {
        if self.pending.is_empty() && !self.load_next_line()? {
            return Ok(None);
        }
        self.counters.interrupt_count += 1;
        Ok(self.pending.pop_front())
    }

    fn counters(&self) -> SourceCounters {
        self.counters
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::mpsc::channel;

    #[test]
    fn kernel_device_source_forwards_records_and_counts_overflow() {
        let (tx, rx) = channel();
        tx.send(EdgeRecord::Pulse { level: Level::High, duration_us: 500 }).unwrap();
        tx.send(EdgeRecord::OverflowInDriver).unwrap();
        let mut source = KernelDeviceSource::new(rx);
        assert!(matches!(source.read(), Ok(Some(EdgeRecord::Pulse { .. }))));
        assert!(matches!(source.read(), Ok(Some(EdgeRecord::OverflowInDriver))));
        assert_eq!(source.counters().overflow_in_driver, 1);
        assert_eq!(source.counters().interrupt_count, 2);
    }

    #[test]
    fn replay_source_alternates_levels_and_closes_each_line() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "500,600,700").unwrap();
        let mut source = ReplaySource::open(file.path()).unwrap();
        assert_eq!(
            source.read().unwrap(),
            Some(EdgeRecord::Pulse { level: Level::Low, duration_us: 500 })
        );
        assert_eq!(
            source.read().unwrap(),
            Some(EdgeRecord::Pulse { level: Level::High, duration_us: 600 })
        );
        assert_eq!(
            source.read().unwrap(),
            Some(EdgeRecord::Pulse { level: Level::Low, duration_us: 700 })
        );
        assert_eq!(source.read().unwrap(), Some(EdgeRecord::Break));
        assert_eq!(source.read().unwrap(), None);
    }

    #[test]
    fn replay_source_rejects_malformed_line() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "500,not-a-number").unwrap();
        let mut source = ReplaySource::open(file.path()).unwrap();
        let err = source.read().unwrap_err();
        assert!(matches!(err, SourceError::MalformedReplayLine(_)));
    }
}
