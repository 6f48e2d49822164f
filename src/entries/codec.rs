//! Binary encoding of entries.
//!
//! Every packed entry starts with a one byte shape tag followed by its fields
//! in declaration order, little-endian and unaligned. Variable length shapes
//! carry a `u16` element count in front of their array, which must be the
//! last field.

use super::{BytesEntry, Entry, EntryType, EntryVisitor, FramesEntry, StandardEntry};
use crate::error::{Error, Result};

const SHAPE_STANDARD: u8 = 1;
const SHAPE_FRAMES: u8 = 2;
const SHAPE_BYTES: u8 = 3;

/// tag + id + type + timestamp + tid + callid + matchid + extra
pub const STANDARD_ENTRY_SIZE: usize = 1 + 4 + 1 + 8 + 4 + 4 + 4 + 8;

/// tag + id + type + timestamp + tid + count
pub const FRAMES_HEADER_SIZE: usize = 1 + 4 + 1 + 8 + 4 + 2;

/// tag + id + type + matchid + count
pub const BYTES_HEADER_SIZE: usize = 1 + 4 + 1 + 4 + 2;

struct Encoder<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> Encoder<'a> {
    /// Callers check the total size up front, so `put` never runs past the end.
    fn new(buf: &'a mut [u8], needed: usize) -> Result<Self> {
        if buf.len() < needed {
            return Err(Error::OutOfRange {
                needed,
                available: buf.len(),
            });
        }
        Ok(Self { buf, pos: 0 })
    }

    fn put(&mut self, bytes: &[u8]) {
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
    }

    fn u8(&mut self, v: u8) {
        self.put(&[v]);
    }

    fn u16(&mut self, v: u16) {
        self.put(&v.to_le_bytes());
    }

    fn i32(&mut self, v: i32) {
        self.put(&v.to_le_bytes());
    }

    fn i64(&mut self, v: i64) {
        self.put(&v.to_le_bytes());
    }

    fn finish(self) -> usize {
        self.pos
    }
}

struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn new(buf: &'a [u8], shape: u8) -> Result<Self> {
        let mut dec = Self { buf, pos: 0 };
        let tag = dec.u8()?;
        if tag != shape {
            return Err(Error::invalid(format!(
                "serialization type is incorrect: expected {shape}, found {tag}"
            )));
        }
        Ok(dec)
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.pos + len;
        if end > self.buf.len() {
            return Err(Error::OutOfRange {
                needed: end,
                available: self.buf.len(),
            });
        }
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    fn i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.array()?))
    }

    fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.array()?))
    }

    fn kind(&mut self) -> Result<EntryType> {
        EntryType::try_from(self.u8()?)
    }
}

fn array_len(len: usize) -> Result<u16> {
    u16::try_from(len).map_err(|_| Error::OutOfRange {
        needed: len,
        available: u16::MAX as usize,
    })
}

impl StandardEntry {
    pub fn calculate_size(&self) -> usize {
        STANDARD_ENTRY_SIZE
    }

    /// Encode into `dst`, returning the number of bytes written.
    pub fn pack(&self, dst: &mut [u8]) -> Result<usize> {
        let mut enc = Encoder::new(dst, STANDARD_ENTRY_SIZE)?;
        enc.u8(SHAPE_STANDARD);
        enc.i32(self.id);
        enc.u8(self.kind as u8);
        enc.i64(self.timestamp);
        enc.i32(self.tid);
        enc.i32(self.callid);
        enc.i32(self.matchid);
        enc.i64(self.extra);
        Ok(enc.finish())
    }

    pub fn unpack(src: &[u8]) -> Result<Self> {
        let mut dec = Decoder::new(src, SHAPE_STANDARD)?;
        Ok(Self {
            id: dec.i32()?,
            kind: dec.kind()?,
            timestamp: dec.i64()?,
            tid: dec.i32()?,
            callid: dec.i32()?,
            matchid: dec.i32()?,
            extra: dec.i64()?,
        })
    }
}

impl BytesEntry {
    pub fn calculate_size(&self) -> usize {
        BYTES_HEADER_SIZE + self.bytes.len()
    }

    pub fn pack(&self, dst: &mut [u8]) -> Result<usize> {
        let count = array_len(self.bytes.len())?;
        let mut enc = Encoder::new(dst, self.calculate_size())?;
        enc.u8(SHAPE_BYTES);
        enc.i32(self.id);
        enc.u8(self.kind as u8);
        enc.i32(self.matchid);
        enc.u16(count);
        enc.put(&self.bytes);
        Ok(enc.finish())
    }

    pub fn unpack(src: &[u8]) -> Result<Self> {
        let mut dec = Decoder::new(src, SHAPE_BYTES)?;
        let id = dec.i32()?;
        let kind = dec.kind()?;
        let matchid = dec.i32()?;
        let count = dec.u16()? as usize;
        let bytes = dec.take(count)?.to_vec();
        Ok(Self {
            id,
            kind,
            matchid,
            bytes,
        })
    }
}

impl FramesEntry {
    pub fn calculate_size(&self) -> usize {
        FRAMES_HEADER_SIZE + self.frames.len() * 8
    }

    pub fn pack(&self, dst: &mut [u8]) -> Result<usize> {
        let count = array_len(self.frames.len())?;
        let mut enc = Encoder::new(dst, self.calculate_size())?;
        enc.u8(SHAPE_FRAMES);
        enc.i32(self.id);
        enc.u8(self.kind as u8);
        enc.i64(self.timestamp);
        enc.i32(self.tid);
        enc.u16(count);
        for frame in &self.frames {
            enc.i64(*frame);
        }
        Ok(enc.finish())
    }

    pub fn unpack(src: &[u8]) -> Result<Self> {
        let mut dec = Decoder::new(src, SHAPE_FRAMES)?;
        let id = dec.i32()?;
        let kind = dec.kind()?;
        let timestamp = dec.i64()?;
        let tid = dec.i32()?;
        let count = dec.u16()? as usize;
        let mut frames = Vec::with_capacity(count);
        for _ in 0..count {
            frames.push(dec.i64()?);
        }
        Ok(Self {
            id,
            kind,
            timestamp,
            tid,
            frames,
        })
    }
}

macro_rules! impl_raw_codec {
    ($($ty:ty),*) => {
        $(
            impl $ty {
                /// Pointer-level variant of `pack`.
                ///
                /// # Safety
                ///
                /// `dst` must either be null or valid for writes of `len` bytes.
                pub unsafe fn pack_raw(&self, dst: *mut u8, len: usize) -> Result<usize> {
                    if dst.is_null() {
                        return Err(Error::invalid("dst is null"));
                    }
                    self.pack(std::slice::from_raw_parts_mut(dst, len))
                }

                /// Pointer-level variant of `unpack`.
                ///
                /// # Safety
                ///
                /// `src` must either be null or valid for reads of `len` bytes.
                pub unsafe fn unpack_raw(src: *const u8, len: usize) -> Result<Self> {
                    if src.is_null() {
                        return Err(Error::invalid("src is null"));
                    }
                    Self::unpack(std::slice::from_raw_parts(src, len))
                }
            }
        )*
    };
}

impl_raw_codec!(StandardEntry, BytesEntry, FramesEntry);

impl Entry {
    pub fn calculate_size(&self) -> usize {
        match self {
            Entry::Standard(e) => e.calculate_size(),
            Entry::Bytes(e) => e.calculate_size(),
            Entry::Frames(e) => e.calculate_size(),
        }
    }

    pub fn pack(&self, dst: &mut [u8]) -> Result<usize> {
        match self {
            Entry::Standard(e) => e.pack(dst),
            Entry::Bytes(e) => e.pack(dst),
            Entry::Frames(e) => e.pack(dst),
        }
    }

    /// Pack into a freshly allocated, exactly sized vector.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = vec![0u8; self.calculate_size()];
        self.pack(&mut out)?;
        Ok(out)
    }

    pub fn unpack(src: &[u8]) -> Result<Self> {
        match src.first() {
            Some(&SHAPE_STANDARD) => StandardEntry::unpack(src).map(Entry::Standard),
            Some(&SHAPE_BYTES) => BytesEntry::unpack(src).map(Entry::Bytes),
            Some(&SHAPE_FRAMES) => FramesEntry::unpack(src).map(Entry::Frames),
            Some(other) => Err(Error::invalid(format!("unknown serialization type {other}"))),
            None => Err(Error::OutOfRange {
                needed: 1,
                available: 0,
            }),
        }
    }
}

/// Decode the entry at the front of `buf` and hand it to `visitor`.
///
/// Bytes past the end of the entry are ignored. A corrupt entry fails this
/// call only; the visitor is not invoked.
pub fn parse<V: EntryVisitor + ?Sized>(buf: &[u8], visitor: &mut V) -> Result<()> {
    visitor.visit(Entry::unpack(buf)?)
}
