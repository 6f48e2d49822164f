//! Trace entries and the visitor interface used to consume them.
//!
//! There are three entry shapes:
//!
//! - [`StandardEntry`] - fixed width, the bulk of all trace data.
//! - [`BytesEntry`] - a blob (usually a string) attached to an earlier entry
//!   through `matchid`.
//! - [`FramesEntry`] - a stack of frame values captured at one point in time.
//!
//! Consumers implement [`EntryVisitor`]. Every stage of the writer pipeline
//! is a visitor, so the match over the three shapes happens in one place per
//! stage and the compiler checks that no shape is forgotten.

mod codec;
mod entry_type;

pub use codec::{parse, BYTES_HEADER_SIZE, FRAMES_HEADER_SIZE, STANDARD_ENTRY_SIZE};
pub use entry_type::EntryType;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StandardEntry {
    pub id: i32,
    pub kind: EntryType,
    pub timestamp: i64,
    pub tid: i32,
    pub callid: i32,
    pub matchid: i32,
    pub extra: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BytesEntry {
    pub id: i32,
    pub kind: EntryType,
    pub matchid: i32,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FramesEntry {
    pub id: i32,
    pub kind: EntryType,
    pub timestamp: i64,
    pub tid: i32,
    pub frames: Vec<i64>,
}

/// One decoded entry of any shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    Standard(StandardEntry),
    Bytes(BytesEntry),
    Frames(FramesEntry),
}

impl Entry {
    pub fn id(&self) -> i32 {
        match self {
            Entry::Standard(e) => e.id,
            Entry::Bytes(e) => e.id,
            Entry::Frames(e) => e.id,
        }
    }

    pub fn kind(&self) -> EntryType {
        match self {
            Entry::Standard(e) => e.kind,
            Entry::Bytes(e) => e.kind,
            Entry::Frames(e) => e.kind,
        }
    }

    /// Overwrite the id, used by loggers that assign ids at write time.
    pub fn set_id(&mut self, id: i32) {
        match self {
            Entry::Standard(e) => e.id = id,
            Entry::Bytes(e) => e.id = id,
            Entry::Frames(e) => e.id = id,
        }
    }
}

impl From<StandardEntry> for Entry {
    fn from(entry: StandardEntry) -> Self {
        Entry::Standard(entry)
    }
}

impl From<BytesEntry> for Entry {
    fn from(entry: BytesEntry) -> Self {
        Entry::Bytes(entry)
    }
}

impl From<FramesEntry> for Entry {
    fn from(entry: FramesEntry) -> Self {
        Entry::Frames(entry)
    }
}

/// A consumer of decoded entries.
///
/// Entries are passed by value so transforming stages can rewrite fields in
/// place before forwarding them to the next stage.
pub trait EntryVisitor {
    fn visit_standard(&mut self, entry: StandardEntry) -> Result<()>;

    fn visit_bytes(&mut self, entry: BytesEntry) -> Result<()>;

    fn visit_frames(&mut self, entry: FramesEntry) -> Result<()>;

    fn visit(&mut self, entry: Entry) -> Result<()> {
        match entry {
            Entry::Standard(e) => self.visit_standard(e),
            Entry::Bytes(e) => self.visit_bytes(e),
            Entry::Frames(e) => self.visit_frames(e),
        }
    }
}

impl<V: EntryVisitor + ?Sized> EntryVisitor for Box<V> {
    fn visit_standard(&mut self, entry: StandardEntry) -> Result<()> {
        (**self).visit_standard(entry)
    }

    fn visit_bytes(&mut self, entry: BytesEntry) -> Result<()> {
        (**self).visit_bytes(entry)
    }

    fn visit_frames(&mut self, entry: FramesEntry) -> Result<()> {
        (**self).visit_frames(entry)
    }
}

/// Collects every visited entry, in order.
#[derive(Debug, Default)]
pub struct CollectingVisitor {
    pub entries: Vec<Entry>,
}

impl EntryVisitor for CollectingVisitor {
    fn visit_standard(&mut self, entry: StandardEntry) -> Result<()> {
        self.entries.push(Entry::Standard(entry));
        Ok(())
    }

    fn visit_bytes(&mut self, entry: BytesEntry) -> Result<()> {
        self.entries.push(Entry::Bytes(entry));
        Ok(())
    }

    fn visit_frames(&mut self, entry: FramesEntry) -> Result<()> {
        self.entries.push(Entry::Frames(entry));
        Ok(())
    }
}
