//! Change-only logging for sampled counters.
//!
//! A counter sampled at a fixed rate mostly repeats its value. Only changes
//! carry information, but a reader drawing the counter needs to know how long
//! the old value lasted, so the last repeated sample is written right before
//! the next change:
//!
//! ```text
//! samples: 5 5 5 5 7 7 9
//! written: 5 . . 5 7 . 7 9
//! ```

use crate::entries::{EntryType, StandardEntry};
use crate::logger::Logger;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterPoint {
    pub value: i64,
    pub timestamp: i64,
}

/// What to do with a freshly sampled point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Write the point.
    Log,
    /// Same value as before; nothing to write yet.
    Skip,
    /// The value changed after one or more skipped samples: write `previous`
    /// (the last skipped sample), then the new point.
    LogWithPrevious(CounterPoint),
}

#[derive(Debug, Default)]
pub struct CounterDeduplicator {
    last_value: Option<i64>,
    skipped: Option<CounterPoint>,
}

impl CounterDeduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, value: i64, timestamp: i64) -> Decision {
        match self.last_value {
            Some(last) if last == value => {
                self.skipped = Some(CounterPoint { value, timestamp });
                Decision::Skip
            }
            Some(_) => {
                self.last_value = Some(value);
                match self.skipped.take() {
                    Some(previous) => Decision::LogWithPrevious(previous),
                    None => Decision::Log,
                }
            }
            None => {
                self.last_value = Some(value);
                Decision::Log
            }
        }
    }

    /// Take the pending skipped point, e.g. when a trace ends and the
    /// duration of the last value should still be visible.
    pub fn take_pending(&mut self) -> Option<CounterPoint> {
        self.skipped.take()
    }
}

/// A counter that writes `COUNTER` entries (`callid` = counter id, `extra` =
/// value) through a [`Logger`], skipping repeats.
pub struct MonotonicCounter<'a> {
    logger: Logger<'a>,
    counter_id: i32,
    tid: i32,
    dedup: CounterDeduplicator,
}

impl<'a> MonotonicCounter<'a> {
    pub fn new(logger: Logger<'a>, counter_id: i32, tid: i32) -> Self {
        Self {
            logger,
            counter_id,
            tid,
            dedup: CounterDeduplicator::new(),
        }
    }

    fn write(&self, point: CounterPoint) {
        self.logger.write(StandardEntry {
            id: 0,
            kind: EntryType::COUNTER,
            timestamp: point.timestamp,
            tid: self.tid,
            callid: self.counter_id,
            matchid: 0,
            extra: point.value,
        });
    }

    /// Record a sample; returns how many entries were written.
    pub fn record(&mut self, value: i64, timestamp: i64) -> usize {
        let current = CounterPoint { value, timestamp };
        match self.dedup.record(value, timestamp) {
            Decision::Skip => 0,
            Decision::Log => {
                self.write(current);
                1
            }
            Decision::LogWithPrevious(previous) => {
                self.write(previous);
                self.write(current);
                2
            }
        }
    }

    /// Write the pending repeated sample, if any.
    pub fn flush(&mut self) -> usize {
        match self.dedup.take_pending() {
            Some(point) => {
                self.write(point);
                1
            }
            None => 0,
        }
    }
}
