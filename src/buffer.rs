//! Backing storage for a [`RingBuffer`].
//!
//! A buffer is one memory mapping laid out as
//!
//! ```text
//! +----------------+ 0
//! | BufferHeader   |
//! +----------------+ HEADER_REGION (64-byte aligned)
//! | ring meta      |
//! | slots ...      |
//! +----------------+
//! ```
//!
//! File-backed buffers map a file shared, so whatever the process managed to
//! write survives a crash and can be read back with [`Snapshot::load`].

use std::fs::{self, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use memmap2::MmapMut;
use plain::Plain;

use crate::entries::{parse, CollectingVisitor, Entry};
use crate::error::{Error, Result};
use crate::logger::Logger;
use crate::packet::{Packet, PacketReassembler};
use crate::ringbuf::{RingBuffer, SLOT_SIZE};

/// "RTRCBUF1"
pub const BUFFER_MAGIC: u64 = 0x3146_5542_4352_5452;
pub const BUFFER_VERSION: u32 = 1;

pub const SESSION_ID_LEN: usize = 40;
pub const MEMORY_MAPS_FILE_LEN: usize = 512;

/// Metadata stored in front of the ring, readable without the process that
/// produced the buffer.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct BufferHeader {
    pub magic: u64,
    pub version: u32,
    pub providers: i32,
    pub long_context: i64,
    pub trace_id: i64,
    pub config_id: i64,
    pub entry_count: u64,
    pub slot_size: u32,
    pub reserved: u32,
    pub session_id: [u8; SESSION_ID_LEN],
    pub memory_maps_file: [u8; MEMORY_MAPS_FILE_LEN],
}

unsafe impl Plain for BufferHeader {}

/// Offset of the ring inside the mapping.
pub const HEADER_REGION: usize = (std::mem::size_of::<BufferHeader>() + 63) & !63;

fn c_str(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

/// Copy `value` into a fixed NUL-terminated field, truncating to fit.
fn fill_c_str(dst: &mut [u8], value: &str) {
    dst.fill(0);
    let len = value.len().min(dst.len() - 1);
    dst[..len].copy_from_slice(&value.as_bytes()[..len]);
}

impl BufferHeader {
    fn new(entry_count: usize) -> Self {
        Self {
            magic: BUFFER_MAGIC,
            version: BUFFER_VERSION,
            providers: 0,
            long_context: 0,
            trace_id: 0,
            config_id: 0,
            entry_count: entry_count as u64,
            slot_size: SLOT_SIZE as u32,
            reserved: 0,
            session_id: [0; SESSION_ID_LEN],
            memory_maps_file: [0; MEMORY_MAPS_FILE_LEN],
        }
    }

    pub fn session_id(&self) -> String {
        c_str(&self.session_id)
    }

    pub fn memory_maps_file(&self) -> String {
        c_str(&self.memory_maps_file)
    }

    fn validate(&self) -> Result<()> {
        if self.magic != BUFFER_MAGIC {
            return Err(Error::BadDump(format!("bad magic {:#x}", self.magic)));
        }
        if self.version != BUFFER_VERSION {
            return Err(Error::BadDump(format!(
                "unsupported version {}",
                self.version
            )));
        }
        if self.slot_size as usize != SLOT_SIZE {
            return Err(Error::BadDump(format!(
                "slot size {} does not match {SLOT_SIZE}",
                self.slot_size
            )));
        }
        Ok(())
    }
}

pub struct Buffer {
    // Declared first so it is dropped before the mapping it points into.
    ring: RingBuffer,
    header: NonNull<BufferHeader>,
    header_lock: Mutex<()>,
    // Mirror of the header's provider mask, read by producers without the lock.
    providers: AtomicI32,
    next_id: AtomicI32,
    path: Mutex<Option<PathBuf>>,
    persist: AtomicBool,
    _map: MmapMut,
}

// The header is only touched under `header_lock`, the ring synchronizes
// itself.
unsafe impl Send for Buffer {}
unsafe impl Sync for Buffer {}

impl Buffer {
    fn required_size(entry_count: usize) -> usize {
        HEADER_REGION + RingBuffer::required_size(entry_count)
    }

    /// Buffer in anonymous memory, lost with the process.
    pub fn anonymous(entry_count: usize) -> Result<Buffer> {
        if entry_count == 0 {
            return Err(Error::invalid("buffer entry count must be non-zero"));
        }
        let map = MmapMut::map_anon(Self::required_size(entry_count))?;
        Self::from_map(map, entry_count, None)
    }

    /// Buffer mapped from a newly created file at `path`.
    ///
    /// The file is grown with a single trailing byte so untouched pages stay
    /// sparse on disk.
    pub fn file_backed<P: AsRef<Path>>(path: P, entry_count: usize) -> Result<Buffer> {
        if entry_count == 0 {
            return Err(Error::invalid("buffer entry count must be non-zero"));
        }
        let path = path.as_ref();
        let size = Self::required_size(entry_count);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        let map = file
            .write_all_at(&[0], size as u64 - 1)
            // SAFETY: the file was just created by us and is not resized while mapped.
            .and_then(|_| unsafe { MmapMut::map_mut(&file) });
        match map {
            Ok(map) => Self::from_map(map, entry_count, Some(path.to_path_buf())),
            Err(e) => {
                let _ = fs::remove_file(path);
                Err(e.into())
            }
        }
    }

    fn from_map(mut map: MmapMut, entry_count: usize, path: Option<PathBuf>) -> Result<Buffer> {
        let base = NonNull::new(map.as_mut_ptr()).ok_or_else(|| Error::invalid("null map"))?;
        let header = base.cast::<BufferHeader>();
        // SAFETY: the mapping is page aligned and sized by required_size, the
        // ring region starts at a 64-byte aligned offset.
        let ring = unsafe {
            header.as_ptr().write(BufferHeader::new(entry_count));
            let ring_base = NonNull::new_unchecked(base.as_ptr().add(HEADER_REGION));
            RingBuffer::init_at(ring_base, entry_count)
        };
        Ok(Buffer {
            ring,
            header,
            header_lock: Mutex::new(()),
            providers: AtomicI32::new(0),
            next_id: AtomicI32::new(1),
            path: Mutex::new(path),
            persist: AtomicBool::new(false),
            _map: map,
        })
    }

    pub fn ring(&self) -> &RingBuffer {
        &self.ring
    }

    pub fn logger(&self) -> Logger<'_> {
        Logger::new(self)
    }

    pub(crate) fn id_counter(&self) -> &AtomicI32 {
        &self.next_id
    }

    pub fn path(&self) -> Option<PathBuf> {
        self.path.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Atomically move the backing file, e.g. from a temporary name to the
    /// name an uploader looks for.
    pub fn rename<P: AsRef<Path>>(&self, new_path: P) -> Result<()> {
        let mut path = self.path.lock().unwrap_or_else(|e| e.into_inner());
        let Some(current) = path.as_ref() else {
            return Err(Error::invalid("anonymous buffers have no file to rename"));
        };
        fs::rename(current, new_path.as_ref())?;
        *path = Some(new_path.as_ref().to_path_buf());
        Ok(())
    }

    /// Keep the backing file when the buffer is dropped.
    pub fn persist(&self) {
        self.persist.store(true, Ordering::Relaxed);
    }

    fn update_header<F: FnOnce(&mut BufferHeader)>(&self, f: F) {
        let _guard = self.header_lock.lock().unwrap_or_else(|e| e.into_inner());
        // SAFETY: exclusive access to the header is serialized by header_lock.
        f(unsafe { &mut *self.header.as_ptr() });
    }

    pub fn header(&self) -> BufferHeader {
        let _guard = self.header_lock.lock().unwrap_or_else(|e| e.into_inner());
        // SAFETY: see update_header.
        unsafe { *self.header.as_ptr() }
    }

    pub fn set_providers(&self, providers: i32) {
        self.update_header(|h| {
            h.providers = providers;
            self.providers.store(providers, Ordering::Release);
        });
    }

    /// Enabled provider mask. Lock-free, so safe on the producer path.
    pub fn providers(&self) -> i32 {
        self.providers.load(Ordering::Acquire)
    }

    pub fn set_long_context(&self, long_context: i64) {
        self.update_header(|h| h.long_context = long_context);
    }

    pub fn set_trace_id(&self, trace_id: i64) {
        self.update_header(|h| h.trace_id = trace_id);
    }

    pub fn set_config_id(&self, config_id: i64) {
        self.update_header(|h| h.config_id = config_id);
    }

    pub fn set_session_id(&self, session_id: &str) {
        self.update_header(|h| fill_c_str(&mut h.session_id, session_id));
    }

    pub fn set_memory_maps_file(&self, file_name: &str) {
        self.update_header(|h| fill_c_str(&mut h.memory_maps_file, file_name));
    }

    pub fn downgrade(this: &Arc<Buffer>) -> WeakBuffer {
        WeakBuffer(Arc::downgrade(this))
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if self.persist.load(Ordering::Relaxed) {
            return;
        }
        let path = self.path.get_mut().unwrap_or_else(|e| e.into_inner());
        if let Some(path) = path.take() {
            if let Err(e) = fs::remove_file(&path) {
                tracing::debug!("Failed to remove buffer file {}: {}", path.display(), e);
            }
        }
    }
}

/// Non-owning handle to a [`Buffer`].
#[derive(Clone, Debug, Default)]
pub struct WeakBuffer(Weak<Buffer>);

impl WeakBuffer {
    pub fn upgrade(&self) -> Result<Arc<Buffer>> {
        self.0
            .upgrade()
            .ok_or_else(|| Error::invalid("buffer has been released"))
    }

    pub fn is_alive(&self) -> bool {
        self.0.strong_count() > 0
    }

    pub(crate) fn ptr_eq(&self, other: &Arc<Buffer>) -> bool {
        std::ptr::eq(self.0.as_ptr(), Arc::as_ptr(other))
    }
}

/// Contents of a persisted buffer file.
pub struct Snapshot {
    pub header: BufferHeader,
    /// Retained packets in write order.
    pub packets: Vec<Packet>,
}

impl Snapshot {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Snapshot> {
        let bytes = fs::read(path.as_ref())?;
        Self::from_bytes(&bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Snapshot> {
        let mut header = BufferHeader::new(0);
        plain::copy_from_bytes(&mut header, bytes)
            .map_err(|_| Error::BadDump("file shorter than the buffer header".to_string()))?;
        header.validate()?;

        let region = bytes.get(HEADER_REGION..).unwrap_or_default();
        let packets = RingBuffer::decode_region(region, header.entry_count)?;
        Ok(Snapshot { header, packets })
    }

    /// Reassemble and decode the retained packets. Entries whose first
    /// packets were already overwritten are skipped.
    pub fn entries(&self) -> Vec<Entry> {
        let mut collector = CollectingVisitor::default();
        let mut reassembler = PacketReassembler::new();
        for packet in &self.packets {
            reassembler.process(packet, |payload| {
                if let Err(e) = parse(payload, &mut collector) {
                    tracing::debug!("Skipping undecodable entry in snapshot: {}", e);
                }
            });
        }
        collector.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entries::{EntryType, StandardEntry};
    use crate::logger::EntryFlags;
    use std::sync::mpsc;
    use std::thread;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    #[test]
    fn test_header_layout() {
        assert_eq!(HEADER_REGION % 64, 0);
        assert!(HEADER_REGION >= std::mem::size_of::<BufferHeader>());
    }

    #[test]
    fn test_anonymous_buffer_rejects_rename() {
        let buffer = Buffer::anonymous(16).unwrap();
        assert!(matches!(
            buffer.rename("/tmp/nowhere"),
            Err(Error::InvalidArgument(_))
        ));
        assert!(buffer.path().is_none());
    }

    #[test]
    fn test_zero_entries_rejected() {
        assert!(matches!(Buffer::anonymous(0), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_header_setters() {
        let buffer = Buffer::anonymous(4).unwrap();
        buffer.set_providers(3);
        buffer.set_trace_id(77);
        buffer.set_session_id(&"x".repeat(100));
        buffer.set_memory_maps_file("maps.txt");

        let header = buffer.header();
        assert_eq!(header.providers, 3);
        assert_eq!(header.trace_id, 77);
        assert_eq!(header.entry_count, 4);
        assert_eq!(header.session_id().len(), SESSION_ID_LEN - 1);
        assert_eq!(header.memory_maps_file(), "maps.txt");
    }

    #[test]
    fn test_file_removed_on_drop() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("buffer.tmp");
        {
            let buffer = Buffer::file_backed(&path, 8).unwrap();
            assert!(path.exists());
            buffer.rename(dir.path().join("buffer.buf")).unwrap();
            assert!(!path.exists());
        }
        assert!(!dir.path().join("buffer.buf").exists());
    }

    #[test]
    fn test_persisted_buffer_snapshot() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("buffer.buf");
        {
            let buffer = Buffer::file_backed(&path, 32).unwrap();
            buffer.set_trace_id(12);
            buffer.set_session_id("session");
            let logger = buffer.logger();
            for i in 0..3 {
                logger.write(StandardEntry {
                    kind: EntryType::MARK_PUSH,
                    timestamp: 100 + i,
                    ..Default::default()
                });
            }
            logger.write_bytes(EntryType::STRING_NAME, 1, &[b'z'; 150]);
            buffer.persist();
        }

        let snapshot = Snapshot::load(&path).unwrap();
        assert_eq!(snapshot.header.trace_id, 12);
        assert_eq!(snapshot.header.session_id(), "session");
        let entries = snapshot.entries();
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[0].id(), 1);
        match &entries[3] {
            Entry::Bytes(b) => assert_eq!(b.bytes.len(), 150),
            other => panic!("unexpected entry {other:?}"),
        }
    }

    #[test]
    fn test_snapshot_rejects_garbage() {
        assert!(matches!(
            Snapshot::from_bytes(&[0u8; 16]),
            Err(Error::BadDump(_))
        ));
        assert!(matches!(
            Snapshot::from_bytes(&vec![0u8; 4096]),
            Err(Error::BadDump(_))
        ));
    }

    fn ring_capacity_corrupted(capacity: u64) -> Vec<u8> {
        let buffer = Buffer::anonymous(4).unwrap();
        buffer.logger().write(StandardEntry::default());
        let mut image = buffer._map.to_vec();
        let off = HEADER_REGION + 8;
        image[off..off + 8].copy_from_slice(&capacity.to_ne_bytes());
        image
    }

    #[test]
    fn test_snapshot_rejects_corrupt_capacity() {
        for capacity in [u64::MAX / 2, u64::MAX, 3, 5] {
            assert!(
                matches!(
                    Snapshot::from_bytes(&ring_capacity_corrupted(capacity)),
                    Err(Error::BadDump(_))
                ),
                "capacity {capacity}"
            );
        }
        assert_eq!(Snapshot::from_bytes(&ring_capacity_corrupted(4)).unwrap().packets.len(), 1);
    }

    #[test]
    fn test_producer_not_blocked_by_header_lock() {
        let buffer = Arc::new(Buffer::anonymous(16).unwrap());
        buffer.set_providers(1);
        let (locked_tx, locked_rx) = mpsc::channel();
        let holder = {
            let buffer = Arc::clone(&buffer);
            thread::spawn(move || {
                buffer.update_header(|_| {
                    locked_tx.send(()).unwrap();
                    thread::sleep(Duration::from_millis(500));
                });
            })
        };
        locked_rx.recv().unwrap();

        let started = Instant::now();
        let id = buffer.logger().write_with_flags(
            EntryFlags::empty(),
            EntryType::MARK_PUSH,
            1,
            2,
            0,
            0,
            0,
        );
        let elapsed = started.elapsed();
        holder.join().unwrap();

        assert!(id > 0);
        assert!(elapsed < Duration::from_millis(100), "blocked for {elapsed:?}");
    }

    #[test]
    fn test_weak_buffer_expires() {
        let buffer = Arc::new(Buffer::anonymous(4).unwrap());
        let weak = Buffer::downgrade(&buffer);
        assert!(weak.upgrade().is_ok());
        drop(buffer);
        assert!(!weak.is_alive());
        assert!(matches!(weak.upgrade(), Err(Error::InvalidArgument(_))));
    }
}
