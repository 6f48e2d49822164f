//! Multi-producer ring buffer of fixed-size packet slots.
//!
//! Producers reserve a ticket with a single `fetch_add` on the shared write
//! counter; ticket `t` lives in slot `t % capacity` during lap
//! `t / capacity`. Each slot carries a sequence stamp:
//!
//! - `2 * lap + 1` while the writer of that lap is copying its packet in,
//! - `2 * lap + 2` once that write is published.
//!
//! A consumer holding ticket `t` reads the slot only if the stamp is exactly
//! `2 * lap + 2`. A smaller stamp means the write has not happened yet, a
//! larger one means the slot was already reused for a later lap and the data
//! for `t` is gone. The stamp is checked again after copying so a read that
//! raced with an overwrite is never reported as valid.
//!
//! Producers never wait on consumers. The only time a producer waits is when
//! the previous lap's writer of the very same slot has not finished yet.

use std::ptr::NonNull;
use std::sync::atomic::{fence, AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use memmap2::MmapMut;

use crate::error::{Error, Result};
use crate::packet::{Packet, PACKET_WORDS};

/// Upper bound on one condition variable wait; covers a wakeup racing with
/// a consumer going to sleep.
const PARK_TIMEOUT: Duration = Duration::from_millis(20);

/// Busy spins before a waiting producer starts yielding its time slice.
const SPIN_LIMIT: u32 = 64;

#[repr(C, align(64))]
pub(crate) struct RingMeta {
    ticket: AtomicU64,
    capacity: u64,
}

#[repr(C)]
pub(crate) struct Slot {
    seq: AtomicU64,
    words: [AtomicU64; PACKET_WORDS],
}

/// Bytes per slot: the sequence stamp plus one packet.
pub const SLOT_SIZE: usize = std::mem::size_of::<Slot>();

/// Bookmark into the ring's sequence of writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Cursor {
    ticket: u64,
}

impl Cursor {
    pub fn new(position: u64) -> Self {
        Self { ticket: position }
    }

    /// Absolute write sequence number this cursor points at.
    pub fn position(&self) -> u64 {
        self.ticket
    }

    pub fn move_forward(&mut self) {
        self.ticket += 1;
    }
}

/// Outcome of reading the slot under a cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// The packet was copied out.
    Ready,
    /// Nothing published at this position yet.
    Pending,
    /// The position was overwritten before it could be read. `lost` counts
    /// the positions between the cursor and the oldest retained slot.
    Overwritten { lost: u64 },
    /// A blocking read was interrupted before data arrived.
    Interrupted,
}

pub struct RingBuffer {
    meta: NonNull<RingMeta>,
    slots: NonNull<Slot>,
    capacity: u64,
    next_stream: AtomicU32,
    parked: AtomicUsize,
    wake_lock: Mutex<()>,
    wake: Condvar,
    // Present when the ring owns its memory rather than living in a Buffer.
    _memory: Option<MmapMut>,
}

// The raw pointers refer to memory that is only accessed through atomics.
unsafe impl Send for RingBuffer {}
unsafe impl Sync for RingBuffer {}

fn backoff(spins: &mut u32) {
    if *spins < SPIN_LIMIT {
        std::hint::spin_loop();
        *spins += 1;
    } else {
        std::thread::yield_now();
    }
}

impl RingBuffer {
    /// Bytes of memory needed for a ring of `capacity` slots.
    pub fn required_size(capacity: usize) -> usize {
        std::mem::size_of::<RingMeta>() + capacity * std::mem::size_of::<Slot>()
    }

    /// Allocate a ring in its own anonymous memory.
    pub fn with_capacity(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::invalid("ring buffer capacity must be non-zero"));
        }
        let mut memory = MmapMut::map_anon(Self::required_size(capacity))?;
        let base = NonNull::new(memory.as_mut_ptr()).ok_or_else(|| Error::invalid("null map"))?;
        // SAFETY: the mapping is page aligned, zeroed and large enough.
        let mut ring = unsafe { Self::init_at(base, capacity) };
        ring._memory = Some(memory);
        Ok(ring)
    }

    /// Initialize a ring in caller provided memory.
    ///
    /// # Safety
    ///
    /// `base` must be 64-byte aligned, valid for reads and writes of
    /// [`RingBuffer::required_size`] bytes, and outlive the returned ring.
    pub(crate) unsafe fn init_at(base: NonNull<u8>, capacity: usize) -> Self {
        let meta = base.cast::<RingMeta>();
        meta.as_ptr().write(RingMeta {
            ticket: AtomicU64::new(0),
            capacity: capacity as u64,
        });
        let slots = NonNull::new_unchecked(base.as_ptr().add(std::mem::size_of::<RingMeta>()))
            .cast::<Slot>();
        std::ptr::write_bytes(slots.as_ptr(), 0, capacity);
        Self {
            meta,
            slots,
            capacity: capacity as u64,
            next_stream: AtomicU32::new(1),
            parked: AtomicUsize::new(0),
            wake_lock: Mutex::new(()),
            wake: Condvar::new(),
            _memory: None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    fn meta(&self) -> &RingMeta {
        // SAFETY: initialized in init_at and alive as long as self.
        unsafe { self.meta.as_ref() }
    }

    fn slot(&self, ticket: u64) -> &Slot {
        let idx = (ticket % self.capacity) as usize;
        // SAFETY: idx < capacity, slots were zero-initialized in init_at.
        unsafe { &*self.slots.as_ptr().add(idx) }
    }

    pub(crate) fn next_stream_id(&self) -> u32 {
        self.next_stream.fetch_add(1, Ordering::Relaxed)
    }

    /// Publish one packet, overwriting the oldest slot if the ring is full.
    pub fn write(&self, packet: &Packet) -> Cursor {
        let ticket = self.meta().ticket.fetch_add(1, Ordering::AcqRel);
        let slot = self.slot(ticket);
        let ready = 2 * (ticket / self.capacity);

        let mut spins = 0;
        while slot.seq.load(Ordering::Acquire) != ready {
            backoff(&mut spins);
        }

        slot.seq.store(ready + 1, Ordering::Relaxed);
        fence(Ordering::Release);
        for (dst, src) in slot.words.iter().zip(packet.to_words()) {
            dst.store(src, Ordering::Relaxed);
        }
        slot.seq.store(ready + 2, Ordering::Release);

        self.notify();
        Cursor { ticket }
    }

    fn notify(&self) {
        fence(Ordering::SeqCst);
        if self.parked.load(Ordering::Relaxed) > 0 {
            let _guard = self.wake_lock.lock().unwrap_or_else(|e| e.into_inner());
            self.wake.notify_all();
        }
    }

    /// Wake every consumer blocked in [`RingBuffer::wait_and_read`].
    pub fn wake_all(&self) {
        let _guard = self.wake_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.wake.notify_all();
    }

    pub fn try_read(&self, packet: &mut Packet, cursor: &Cursor) -> ReadStatus {
        let ticket = cursor.ticket;
        let slot = self.slot(ticket);
        let published = 2 * (ticket / self.capacity) + 2;

        let before = slot.seq.load(Ordering::Acquire);
        if before < published {
            return ReadStatus::Pending;
        }
        if before > published {
            return self.overwritten(ticket);
        }

        let mut words = [0u64; PACKET_WORDS];
        for (dst, src) in words.iter_mut().zip(slot.words.iter()) {
            *dst = src.load(Ordering::Relaxed);
        }
        fence(Ordering::Acquire);
        if slot.seq.load(Ordering::Relaxed) != before {
            return self.overwritten(ticket);
        }

        *packet = Packet::from_words(&words);
        ReadStatus::Ready
    }

    fn overwritten(&self, ticket: u64) -> ReadStatus {
        let oldest = self.oldest().position();
        ReadStatus::Overwritten {
            lost: oldest.saturating_sub(ticket).max(1),
        }
    }

    /// Like [`RingBuffer::try_read`], but sleeps while the position is
    /// pending. Returns [`ReadStatus::Interrupted`] once `interrupt` is set.
    pub fn wait_and_read(
        &self,
        packet: &mut Packet,
        cursor: &Cursor,
        interrupt: &AtomicBool,
    ) -> ReadStatus {
        loop {
            match self.try_read(packet, cursor) {
                ReadStatus::Pending => {}
                status => return status,
            }
            if interrupt.load(Ordering::Acquire) {
                return ReadStatus::Interrupted;
            }

            self.parked.fetch_add(1, Ordering::SeqCst);
            fence(Ordering::SeqCst);
            let guard = self.wake_lock.lock().unwrap_or_else(|e| e.into_inner());
            let status = self.try_read(packet, cursor);
            if status == ReadStatus::Pending && !interrupt.load(Ordering::Acquire) {
                let _ = self
                    .wake
                    .wait_timeout(guard, PARK_TIMEOUT)
                    .unwrap_or_else(|e| e.into_inner());
            } else {
                drop(guard);
            }
            self.parked.fetch_sub(1, Ordering::SeqCst);

            if status != ReadStatus::Pending {
                return status;
            }
        }
    }

    /// Cursor at the next position to be written.
    pub fn current_head(&self) -> Cursor {
        Cursor {
            ticket: self.meta().ticket.load(Ordering::Acquire),
        }
    }

    /// Cursor at the most recently written position.
    pub fn current_tail(&self) -> Cursor {
        Cursor {
            ticket: self.current_head().ticket.saturating_sub(1),
        }
    }

    /// Cursor at the oldest position still retained.
    pub fn oldest(&self) -> Cursor {
        Cursor {
            ticket: self.current_head().ticket.saturating_sub(self.capacity),
        }
    }

    /// Decode the retained packets of a ring from a raw copy of its memory,
    /// e.g. a buffer file left behind by a process that died.
    ///
    /// The ring must have `expected_capacity` slots and fit in `bytes`.
    /// Slots that were mid-write or already reused are skipped.
    pub(crate) fn decode_region(bytes: &[u8], expected_capacity: u64) -> Result<Vec<Packet>> {
        let meta_size = std::mem::size_of::<RingMeta>();
        let slot_size = std::mem::size_of::<Slot>();
        if bytes.len() < meta_size {
            return Err(Error::BadDump("ring region too small".to_string()));
        }
        let word = |off: usize| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes[off..off + 8]);
            u64::from_ne_bytes(raw)
        };
        let head = word(0);
        let capacity = word(8);
        if capacity == 0 || capacity != expected_capacity {
            return Err(Error::BadDump(format!(
                "ring capacity {capacity} does not match {expected_capacity} header entries"
            )));
        }
        let needed = usize::try_from(capacity)
            .ok()
            .and_then(|c| c.checked_mul(slot_size))
            .and_then(|s| s.checked_add(meta_size));
        if !matches!(needed, Some(needed) if bytes.len() >= needed) {
            return Err(Error::BadDump(format!(
                "ring region of {} bytes cannot hold {capacity} slots",
                bytes.len()
            )));
        }

        let mut packets = Vec::new();
        for ticket in head.saturating_sub(capacity)..head {
            let off = meta_size + (ticket % capacity) as usize * slot_size;
            if word(off) != 2 * (ticket / capacity) + 2 {
                continue;
            }
            let mut words = [0u64; PACKET_WORDS];
            for (i, w) in words.iter_mut().enumerate() {
                *w = word(off + 8 * (i + 1));
            }
            packets.push(Packet::from_words(&words));
        }
        Ok(packets)
    }
}
