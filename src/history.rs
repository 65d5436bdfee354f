//! Bounded rolling history of `(time, value)` pairs, per metric per sensor.
//!
//! Kept as a plain `VecDeque` behind its own mutex rather than the original
//! hand-rolled singly linked list: the access pattern (tail append, head
//! truncate, full-range snapshot) is exactly `VecDeque`'s strength, and
//! there is no pointer-stability requirement that would justify a linked
//! list in Rust.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use crate::HISTORY_DEPTH_HOURS;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryPoint {
    pub time: SystemTime,
    pub value_x10: i32,
}

/// A single metric's bounded history for one sensor.
#[derive(Debug)]
pub struct History {
    points: Mutex<VecDeque<HistoryPoint>>,
    depth: Duration,
}

impl History {
    #[must_use]
    pub fn new() -> History {
        History::with_depth_hours(HISTORY_DEPTH_HOURS)
    }

    #[must_use]
    pub fn with_depth_hours(hours: u32) -> History {
        History {
            points: Mutex::new(VecDeque::new()),
            depth: Duration::from_secs(u64::from(hours) * 3600),
        }
    }

    /// Append a point and truncate everything older than the retention
    /// window. `time` must be greater than or equal to the last appended
    /// point's time; out-of-order callers are a bug in the registry, not
    /// something this type silently repairs.
    pub fn append(&self, time: SystemTime, value_x10: i32) {
        let mut points = self.points.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        points.push_back(HistoryPoint { time, value_x10 });
        let cutoff = time.checked_sub(self.depth);
        if let Some(cutoff) = cutoff {
            while let Some(front) = points.front() {
                if front.time < cutoff {
                    points.pop_front();
                } else {
                    break;
                }
            }
        }
    }

    /// Drop every point older than `before`.
    pub fn truncate(&self, before: SystemTime) {
        let mut points = self.points.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        while let Some(front) = points.front() {
            if front.time < before {
                points.pop_front();
            } else {
                break;
            }
        }
    }

    /// Copy every point in `[from, to]` under the lock, then release it:
    /// serialization never blocks a concurrent writer.
    #[must_use]
    pub fn snapshot(&self, from: SystemTime, to: SystemTime) -> Vec<HistoryPoint> {
        let points = self.points.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        points.iter().filter(|p| p.time >= from && p.time <= to).copied().collect()
    }

    /// Number of points currently retained.
    #[must_use]
    pub fn len(&self) -> usize {
        self.points.lock().unwrap_or_else(std::sync::PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for History {
    fn default() -> Self {
        History::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(secs: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
    }

    #[test]
    fn append_and_snapshot_in_order() {
        let h = History::with_depth_hours(24);
        h.append(t(100), 10);
        h.append(t(200), 20);
        h.append(t(300), 30);
        let snap = h.snapshot(t(0), t(1000));
        assert_eq!(snap.len(), 3);
        assert_eq!(snap[0].value_x10, 10);
        assert_eq!(snap[2].value_x10, 30);
    }

    #[test]
    fn truncate_drops_points_before_cutoff() {
        let h = History::with_depth_hours(24);
        h.append(t(100), 1);
        h.append(t(200), 2);
        h.truncate(t(150));
        assert_eq!(h.len(), 1);
        assert_eq!(h.snapshot(t(0), t(1000))[0].value_x10, 2);
    }

    #[test]
    fn append_evicts_points_outside_retention_window() {
        let h = History::with_depth_hours(1);
        h.append(t(0), 1);
        h.append(t(3600 + 1), 2);
        let snap = h.snapshot(t(0), t(10_000));
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].value_x10, 2);
    }
}
