//! Transforming stages of the writer chain.
//!
//! Each stage wraps the next one, rewrites the entry it is handed and
//! forwards it exactly once. None of them buffers entries, so tearing a chain
//! down never loses data.

use crate::entries::{BytesEntry, EntryVisitor, FramesEntry, StandardEntry};
use crate::error::Result;

/// Rewrites slowly growing columns as the difference to the previous value
/// of the same column, which makes the text far more compressible.
///
/// `id` is one column shared by all shapes. `timestamp` and `tid` are shared
/// by standard and frames entries, `matchid` by standard and bytes entries.
pub struct DeltaEncodingVisitor<V> {
    inner: V,
    prev_id: i32,
    prev_timestamp: i64,
    prev_tid: i32,
    prev_matchid: i32,
}

impl<V: EntryVisitor> DeltaEncodingVisitor<V> {
    pub fn new(inner: V) -> Self {
        Self {
            inner,
            prev_id: 0,
            prev_timestamp: 0,
            prev_tid: 0,
            prev_matchid: 0,
        }
    }

    pub fn into_inner(self) -> V {
        self.inner
    }

    fn id(&mut self, id: i32) -> i32 {
        let delta = id.wrapping_sub(self.prev_id);
        self.prev_id = id;
        delta
    }

    fn timestamp(&mut self, timestamp: i64) -> i64 {
        let delta = timestamp.wrapping_sub(self.prev_timestamp);
        self.prev_timestamp = timestamp;
        delta
    }

    fn tid(&mut self, tid: i32) -> i32 {
        let delta = tid.wrapping_sub(self.prev_tid);
        self.prev_tid = tid;
        delta
    }

    fn matchid(&mut self, matchid: i32) -> i32 {
        let delta = matchid.wrapping_sub(self.prev_matchid);
        self.prev_matchid = matchid;
        delta
    }
}

impl<V: EntryVisitor> EntryVisitor for DeltaEncodingVisitor<V> {
    fn visit_standard(&mut self, mut entry: StandardEntry) -> Result<()> {
        entry.id = self.id(entry.id);
        entry.timestamp = self.timestamp(entry.timestamp);
        entry.tid = self.tid(entry.tid);
        entry.matchid = self.matchid(entry.matchid);
        self.inner.visit_standard(entry)
    }

    fn visit_bytes(&mut self, mut entry: BytesEntry) -> Result<()> {
        entry.id = self.id(entry.id);
        entry.matchid = self.matchid(entry.matchid);
        self.inner.visit_bytes(entry)
    }

    fn visit_frames(&mut self, mut entry: FramesEntry) -> Result<()> {
        entry.id = self.id(entry.id);
        entry.timestamp = self.timestamp(entry.timestamp);
        entry.tid = self.tid(entry.tid);
        self.inner.visit_frames(entry)
    }
}

/// Reduces nanosecond timestamps to `precision` decimal digits of a second.
pub struct TimestampTruncatingVisitor<V> {
    inner: V,
    divisor: i64,
}

impl<V: EntryVisitor> TimestampTruncatingVisitor<V> {
    /// `precision` is clamped to `0..=9`; 9 keeps nanoseconds, 6
    /// microseconds and so on.
    pub fn new(inner: V, precision: u32) -> Self {
        let precision = precision.min(9);
        Self {
            inner,
            divisor: 10i64.pow(9 - precision),
        }
    }

    pub fn into_inner(self) -> V {
        self.inner
    }
}

impl<V: EntryVisitor> EntryVisitor for TimestampTruncatingVisitor<V> {
    fn visit_standard(&mut self, mut entry: StandardEntry) -> Result<()> {
        entry.timestamp /= self.divisor;
        self.inner.visit_standard(entry)
    }

    fn visit_bytes(&mut self, entry: BytesEntry) -> Result<()> {
        self.inner.visit_bytes(entry)
    }

    fn visit_frames(&mut self, mut entry: FramesEntry) -> Result<()> {
        entry.timestamp /= self.divisor;
        self.inner.visit_frames(entry)
    }
}

/// Reverses the frame order of frames entries. Unwinders capture from the
/// leaf up, the file format lists frames from the root down.
pub struct StackTraceInvertingVisitor<V> {
    inner: V,
}

impl<V: EntryVisitor> StackTraceInvertingVisitor<V> {
    pub fn new(inner: V) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> V {
        self.inner
    }
}

impl<V: EntryVisitor> EntryVisitor for StackTraceInvertingVisitor<V> {
    fn visit_standard(&mut self, entry: StandardEntry) -> Result<()> {
        self.inner.visit_standard(entry)
    }

    fn visit_bytes(&mut self, entry: BytesEntry) -> Result<()> {
        self.inner.visit_bytes(entry)
    }

    fn visit_frames(&mut self, mut entry: FramesEntry) -> Result<()> {
        entry.frames.reverse();
        self.inner.visit_frames(entry)
    }
}
