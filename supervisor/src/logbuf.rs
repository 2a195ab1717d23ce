//! Bounded per-application log ring buffer.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lines retained per application unless configured otherwise.
pub const DEFAULT_CAPACITY: usize = 1000;

/// Where a log line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSource {
    Stdout,
    Stderr,
    Audit,
}

impl fmt::Display for LogSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogSource::Stdout => write!(f, "stdout"),
            LogSource::Stderr => write!(f, "stderr"),
            LogSource::Audit => write!(f, "audit"),
        }
    }
}

/// One captured line. `seq` increases by one per append to the owning
/// buffer and is never reused, even after eviction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogLine {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub source: LogSource,
}

struct Ring {
    lines: VecDeque<LogLine>,
    next_seq: u64,
}

/// Fixed-capacity FIFO of log lines with its own lock, independent of the
/// supervisor's registry lock.
pub struct LogBuffer {
    capacity: usize,
    ring: Mutex<Ring>,
}

impl LogBuffer {
    /// A capacity of zero is bumped to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            ring: Mutex::new(Ring {
                lines: VecDeque::with_capacity(capacity),
                next_seq: 1,
            }),
        }
    }

    // Every write leaves the ring consistent, so a poisoned lock is still usable.
    fn lock(&self) -> MutexGuard<'_, Ring> {
        self.ring.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a line stamped now, evicting the oldest line when full.
    pub fn push(&self, source: LogSource, message: impl Into<String>) -> u64 {
        let message = message.into();
        let mut ring = self.lock();
        let seq = ring.next_seq;
        ring.next_seq += 1;
        if ring.lines.len() == self.capacity {
            ring.lines.pop_front();
        }
        ring.lines.push_back(LogLine {
            seq,
            timestamp: Utc::now(),
            message,
            source,
        });
        seq
    }

    /// Copy of every retained line, oldest first.
    pub fn snapshot(&self) -> Vec<LogLine> {
        self.lock().lines.iter().cloned().collect()
    }

    /// Retained lines with a sequence number greater than `seq`.
    pub fn since(&self, seq: u64) -> Vec<LogLine> {
        let ring = self.lock();
        let start = ring.lines.partition_point(|line| line.seq <= seq);
        ring.lines.range(start..).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl fmt::Debug for LogBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogBuffer")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}
