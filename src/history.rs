use std::collections::VecDeque;
use std::ops::Range;

use serde::{Serialize, Serializer};

use crate::types::LogRecord;

pub const DEFAULT_LOG_CAPACITY: usize = 1000;

/// Ordered, capacity-bounded log history.
///
/// Appending past the capacity evicts from the front, so the buffer always
/// holds the most recent `capacity` records in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub struct LogHistory {
    records: VecDeque<LogRecord>,
    capacity: usize,
    evicted: u64,
}

impl LogHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            records: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            evicted: 0,
        }
    }

    pub fn push(&mut self, record: LogRecord) {
        while self.records.len() >= self.capacity {
            self.records.pop_front();
            self.evicted += 1;
        }
        self.records.push_back(record);
    }

    pub fn clear(&mut self) {
        self.records.clear();
        self.evicted = 0;
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Records dropped off the front since creation or the last `clear`.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    pub fn get(&self, idx: usize) -> Option<&LogRecord> {
        self.records.get(idx)
    }

    pub fn iter(&self) -> impl Iterator<Item = &LogRecord> {
        self.records.iter()
    }

    /// Borrow a contiguous slice; out-of-bounds ends are clamped.
    pub fn slice(&self, range: Range<usize>) -> impl Iterator<Item = &LogRecord> {
        let end = range.end.min(self.records.len());
        let start = range.start.min(end);
        self.records.range(start..end)
    }

    pub fn to_vec(&self) -> Vec<LogRecord> {
        self.records.iter().cloned().collect()
    }
}

impl Default for LogHistory {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}

impl Serialize for LogHistory {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.records.iter())
    }
}
