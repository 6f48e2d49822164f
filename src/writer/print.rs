use std::io::Write;

use crate::entries::{BytesEntry, EntryVisitor, FramesEntry, StandardEntry};
use crate::error::Result;

/// Renders entries as `|`-separated text lines, one line per entry and one
/// line per frame of a frames entry.
pub struct PrintEntryVisitor<W: Write> {
    out: W,
}

impl<W: Write> PrintEntryVisitor<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn get_ref(&self) -> &W {
        &self.out
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> EntryVisitor for PrintEntryVisitor<W> {
    fn visit_standard(&mut self, entry: StandardEntry) -> Result<()> {
        writeln!(
            self.out,
            "{}|{}|{}|{}|{}|{}|{}",
            entry.id,
            entry.kind,
            entry.timestamp,
            entry.tid,
            entry.callid,
            entry.matchid,
            entry.extra
        )?;
        Ok(())
    }

    fn visit_bytes(&mut self, entry: BytesEntry) -> Result<()> {
        write!(self.out, "{}|{}|{}|", entry.id, entry.kind, entry.matchid)?;
        self.out.write_all(&entry.bytes)?;
        self.out.write_all(b"\n")?;
        Ok(())
    }

    fn visit_frames(&mut self, entry: FramesEntry) -> Result<()> {
        for frame in &entry.frames {
            writeln!(
                self.out,
                "{}|{}|{}|{}|0|0|{}",
                entry.id, entry.kind, entry.timestamp, entry.tid, frame
            )?;
        }
        Ok(())
    }
}
