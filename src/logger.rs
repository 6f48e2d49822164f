//! Producer side API.
//!
//! Loggers are cheap views: [`Logger`] borrows one [`Buffer`],
//! [`MultiBufferLogger`] holds weak handles to any number of them. Writing
//! never blocks on the draining side and never reports failure to the call
//! site; the worst outcome of a write is a returned id of 0.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use nix::time::{clock_gettime, ClockId};

use crate::buffer::{Buffer, WeakBuffer};
use crate::entries::{
    BytesEntry, Entry, EntryType, FramesEntry, StandardEntry, STANDARD_ENTRY_SIZE,
};
use crate::packet::write_payload;
use crate::ringbuf::Cursor;

/// Longest payload a Bytes entry may carry; longer payloads are truncated.
pub const MAX_BYTES_PAYLOAD: usize = 1024;

const PLACEHOLDER: char = '?';

bitflags::bitflags! {
    /// Call-site options for [`Logger::write_with_flags`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EntryFlags: u32 {
        /// Write even if no provider is enabled on the buffer.
        const SKIP_PROVIDER_CHECK = 1;
        /// Replace the timestamp with the monotonic clock.
        const FILL_TIMESTAMP = 1 << 1;
        /// Replace the tid with the calling thread's id.
        const FILL_TID = 1 << 2;
    }
}

/// Monotonic clock in nanoseconds.
pub fn monotonic_time() -> i64 {
    match clock_gettime(ClockId::CLOCK_MONOTONIC) {
        Ok(ts) => ts.tv_sec() as i64 * 1_000_000_000 + ts.tv_nsec() as i64,
        Err(_) => 0,
    }
}

/// Kernel id of the calling thread.
pub fn thread_id() -> i32 {
    nix::unistd::gettid().as_raw()
}

/// Hand out the next id from `counter`; ids wrap from `i32::MAX` to 1 and
/// are never 0 as long as the counter starts at 1.
fn next_id(counter: &AtomicI32) -> i32 {
    counter
        .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |id| {
            Some(if id == i32::MAX { 1 } else { id + 1 })
        })
        .unwrap_or_else(|id| id)
}

fn truncated(bytes: &[u8]) -> &[u8] {
    &bytes[..bytes.len().min(MAX_BYTES_PAYLOAD)]
}

/// Best-effort conversion of arbitrary text into a payload: at most
/// [`MAX_BYTES_PAYLOAD`] characters, anything outside printable ASCII and
/// tab replaced with a placeholder.
pub fn sanitize_text(text: &str) -> Vec<u8> {
    text.chars()
        .take(MAX_BYTES_PAYLOAD)
        .map(|c| {
            if c == '\t' || (' '..='~').contains(&c) {
                c as u8
            } else {
                PLACEHOLDER as u8
            }
        })
        .collect()
}

/// Assign `id`, encode and hand the bytes to `sink`. Returns 0 when the
/// entry cannot be encoded.
///
/// Standard entries are packed on the stack; only the variable length
/// shapes allocate.
fn encode_with_id<F: FnMut(&[u8]) -> Option<Cursor>>(
    mut entry: Entry,
    id: i32,
    mut sink: F,
) -> (i32, Option<Cursor>) {
    entry.set_id(id);
    let packed = match &entry {
        Entry::Standard(e) => {
            let mut bytes = [0u8; STANDARD_ENTRY_SIZE];
            e.pack(&mut bytes).map(|len| sink(&bytes[..len]))
        }
        _ => entry.to_bytes().map(|bytes| sink(&bytes)),
    };
    match packed {
        Ok(cursor) => (id, cursor),
        Err(e) => {
            tracing::debug!("Dropping {} entry: {}", entry.kind(), e);
            (0, None)
        }
    }
}

/// Writes entries into a single buffer.
#[derive(Clone, Copy)]
pub struct Logger<'a> {
    buffer: &'a Buffer,
}

impl<'a> Logger<'a> {
    pub fn new(buffer: &'a Buffer) -> Self {
        Self { buffer }
    }

    fn emit(&self, entry: Entry) -> (i32, Option<Cursor>) {
        let id = next_id(self.buffer.id_counter());
        encode_with_id(entry, id, |bytes| {
            Some(write_payload(self.buffer.ring(), bytes))
        })
    }

    /// Write `entry` with a freshly assigned id and return that id.
    pub fn write(&self, entry: StandardEntry) -> i32 {
        self.emit(entry.into()).0
    }

    /// Like [`Logger::write`], also returning the cursor of the entry so the
    /// caller can ask a writer to start draining right there.
    pub fn write_and_get_cursor(&self, entry: StandardEntry) -> (i32, Cursor) {
        let (id, cursor) = self.emit(entry.into());
        (
            id,
            cursor.unwrap_or_else(|| self.buffer.ring().current_head()),
        )
    }

    /// The instrumentation call-site form of [`Logger::write`].
    ///
    /// Without [`EntryFlags::SKIP_PROVIDER_CHECK`] nothing is written (and 0
    /// is returned) while the buffer has no provider enabled.
    #[allow(clippy::too_many_arguments)]
    pub fn write_with_flags(
        &self,
        flags: EntryFlags,
        kind: EntryType,
        timestamp: i64,
        tid: i32,
        callid: i32,
        matchid: i32,
        extra: i64,
    ) -> i32 {
        if !flags.contains(EntryFlags::SKIP_PROVIDER_CHECK) && self.buffer.providers() == 0 {
            return 0;
        }
        let timestamp = if flags.contains(EntryFlags::FILL_TIMESTAMP) {
            monotonic_time()
        } else {
            timestamp
        };
        let tid = if flags.contains(EntryFlags::FILL_TID) {
            thread_id()
        } else {
            tid
        };
        self.write(StandardEntry {
            id: 0,
            kind,
            timestamp,
            tid,
            callid,
            matchid,
            extra,
        })
    }

    /// Attach a blob to the entry `parent_id`.
    pub fn write_bytes(&self, kind: EntryType, parent_id: i32, bytes: &[u8]) -> i32 {
        self.emit(
            BytesEntry {
                id: 0,
                kind,
                matchid: parent_id,
                bytes: truncated(bytes).to_vec(),
            }
            .into(),
        )
        .0
    }

    /// Attach text to the entry `parent_id`; see [`sanitize_text`].
    pub fn write_str(&self, kind: EntryType, parent_id: i32, text: &str) -> i32 {
        self.write_bytes(kind, parent_id, &sanitize_text(text))
    }

    pub fn write_frames(&self, kind: EntryType, timestamp: i64, tid: i32, frames: &[i64]) -> i32 {
        self.emit(
            FramesEntry {
                id: 0,
                kind,
                timestamp,
                tid,
                frames: frames.to_vec(),
            }
            .into(),
        )
        .0
    }
}

/// Writes every entry into each registered buffer that is still alive.
///
/// One id is assigned per write and shared by all copies, so the copies of
/// an entry in different buffers can be matched up later. Writers read the
/// target list through an atomic snapshot; only registering and removing
/// buffers serialize on a lock.
pub struct MultiBufferLogger {
    targets: ArcSwap<Vec<WeakBuffer>>,
    edit_lock: Mutex<()>,
    next_id: AtomicI32,
}

impl Default for MultiBufferLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl MultiBufferLogger {
    pub fn new() -> Self {
        Self {
            targets: ArcSwap::from_pointee(Vec::new()),
            edit_lock: Mutex::new(()),
            next_id: AtomicI32::new(1),
        }
    }

    /// Publish a new target list derived from the current one. Dead
    /// references are pruned on every edit.
    fn edit<F: FnOnce(&mut Vec<WeakBuffer>)>(&self, f: F) {
        let _guard = self.edit_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut targets: Vec<WeakBuffer> = self
            .targets
            .load()
            .iter()
            .filter(|b| b.is_alive())
            .cloned()
            .collect();
        f(&mut targets);
        self.targets.store(Arc::new(targets));
    }

    pub fn add_buffer(&self, buffer: &Arc<Buffer>) {
        self.edit(|targets| {
            if !targets.iter().any(|b| b.ptr_eq(buffer)) {
                targets.push(Buffer::downgrade(buffer));
            }
        });
    }

    pub fn remove_buffer(&self, buffer: &Arc<Buffer>) {
        self.edit(|targets| targets.retain(|b| !b.ptr_eq(buffer)));
    }

    /// Number of registered buffers that are still alive.
    pub fn live_buffers(&self) -> usize {
        self.targets.load().iter().filter(|b| b.is_alive()).count()
    }

    fn emit(&self, entry: Entry) -> i32 {
        let targets = self.targets.load();
        if !targets.iter().any(WeakBuffer::is_alive) {
            return 0;
        }
        let id = next_id(&self.next_id);
        encode_with_id(entry, id, |bytes| {
            for buffer in targets.iter().filter_map(|b| b.upgrade().ok()) {
                write_payload(buffer.ring(), bytes);
            }
            None
        })
        .0
    }

    pub fn write(&self, entry: StandardEntry) -> i32 {
        self.emit(entry.into())
    }

    pub fn write_bytes(&self, kind: EntryType, parent_id: i32, bytes: &[u8]) -> i32 {
        self.emit(
            BytesEntry {
                id: 0,
                kind,
                matchid: parent_id,
                bytes: truncated(bytes).to_vec(),
            }
            .into(),
        )
    }

    pub fn write_frames(&self, kind: EntryType, timestamp: i64, tid: i32, frames: &[i64]) -> i32 {
        self.emit(
            FramesEntry {
                id: 0,
                kind,
                timestamp,
                tid,
                frames: frames.to_vec(),
            }
            .into(),
        )
    }
}
