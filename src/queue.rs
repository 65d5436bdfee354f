//! Handoff queue between the capture/decoder thread and the message
//! consumer thread(s) (spec §5).
//!
//! The source's queue is a singly linked list guarded by a mutex and
//! condition variable. The list shape isn't load-bearing: only FIFO order,
//! blocking pop with timeout, and a broadcast wakeup on shutdown are. A
//! `VecDeque` behind the same `Mutex`/`Condvar` gets all three without
//! reimplementing a linked list by hand, the same trade made in
//! [`crate::history`].

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, SystemTime};

use crate::reading::{MetricBits, SensorReading};

/// A decoded reading paired with which sensor slot it resolved to, handed
/// from the decoder thread to the rule/sink consumer thread.
#[derive(Debug, Clone)]
pub struct DecodedMessage {
    pub sensor_index: Option<usize>,
    pub reading: SensorReading,
    /// Which metrics changed on this update (spec §4.F), carried through so
    /// rule evaluation can skip a rule whose metric wasn't part of the
    /// change set (spec §4.H step 2) instead of re-acting on every
    /// transmission of an unrelated metric.
    pub changed: MetricBits,
    pub received_at: SystemTime,
}

struct Inner {
    items: VecDeque<DecodedMessage>,
    shutdown: bool,
}

/// Bounded-only-by-memory FIFO queue, safe to share behind an `Arc` across
/// the producer and consumer threads in [`crate::gateway::Gateway`].
pub struct DecodedMessageQueue {
    inner: Mutex<Inner>,
    not_empty: Condvar,
}

impl DecodedMessageQueue {
    #[must_use]
    pub fn new() -> DecodedMessageQueue {
        DecodedMessageQueue {
            inner: Mutex::new(Inner { items: VecDeque::new(), shutdown: false }),
            not_empty: Condvar::new(),
        }
    }

    pub fn push(&self, message: DecodedMessage) {
        let mut guard = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        guard.items.push_back(message);
        self.not_empty.notify_one();
    }

    /// Block until a message is available, `timeout` elapses, or the queue
    /// is shut down. Returns `None` on timeout or shutdown with an empty
    /// queue (draining whatever was already queued before reporting empty).
    pub fn pop_timeout(&self, timeout: Duration) -> Option<DecodedMessage> {
        let mut guard = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        loop {
            if let Some(message) = guard.items.pop_front() {
                return Some(message);
            }
            if guard.shutdown {
                return None;
            }
            let (next_guard, result) = self
                .not_empty
                .wait_timeout(guard, timeout)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            guard = next_guard;
            if result.timed_out() && guard.items.is_empty() {
                return None;
            }
        }
    }

    /// Mark the queue shut down and wake every blocked waiter. Messages
    /// already queued are still returned by subsequent `pop_timeout` calls.
    pub fn shutdown(&self) {
        let mut guard = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        guard.shutdown = true;
        drop(guard);
        self.not_empty.notify_all();
    }

    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        let guard = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        guard.shutdown
    }
}

impl Default for DecodedMessageQueue {
    fn default() -> DecodedMessageQueue {
        DecodedMessageQueue::new()
    }
}
