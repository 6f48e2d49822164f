//! Fixed-size packets carrying packed entries through the ring buffer.
//!
//! Every ring buffer slot holds exactly one [`Packet`]. A packed entry that
//! does not fit into one packet payload is split into a stream of packets
//! sharing a stream id; the first one is flagged `start`, every one but the
//! last is flagged `next`. Packets of different streams may interleave when
//! several threads write at once, so the consumer side keeps a small table
//! of partially assembled streams.

use crate::ringbuf::{Cursor, RingBuffer};

/// Payload bytes per packet.
pub const PACKET_DATA_SIZE: usize = 48;

/// Size of one packet in 64-bit words, one header word plus the payload.
pub(crate) const PACKET_WORDS: usize = 1 + PACKET_DATA_SIZE / 8;

const FLAG_START: u8 = 1;
const FLAG_NEXT: u8 = 2;

/// Partially assembled streams kept before the oldest is dropped.
const MAX_PENDING_STREAMS: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Packet {
    pub stream: u32,
    pub start: bool,
    pub next: bool,
    pub size: u16,
    pub data: [u8; PACKET_DATA_SIZE],
}

impl Default for Packet {
    fn default() -> Self {
        Self {
            stream: 0,
            start: false,
            next: false,
            size: 0,
            data: [0; PACKET_DATA_SIZE],
        }
    }
}

impl Packet {
    pub fn payload(&self) -> &[u8] {
        let len = (self.size as usize).min(PACKET_DATA_SIZE);
        &self.data[..len]
    }

    pub(crate) fn to_words(&self) -> [u64; PACKET_WORDS] {
        let mut flags = 0u8;
        if self.start {
            flags |= FLAG_START;
        }
        if self.next {
            flags |= FLAG_NEXT;
        }
        let mut words = [0u64; PACKET_WORDS];
        words[0] = self.stream as u64 | (flags as u64) << 32 | (self.size as u64) << 48;
        for (word, chunk) in words[1..].iter_mut().zip(self.data.chunks_exact(8)) {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(chunk);
            *word = u64::from_le_bytes(raw);
        }
        words
    }

    pub(crate) fn from_words(words: &[u64; PACKET_WORDS]) -> Self {
        let header = words[0];
        let flags = (header >> 32) as u8;
        let mut data = [0u8; PACKET_DATA_SIZE];
        for (chunk, word) in data.chunks_exact_mut(8).zip(&words[1..]) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        Self {
            stream: header as u32,
            start: flags & FLAG_START != 0,
            next: flags & FLAG_NEXT != 0,
            size: (header >> 48) as u16,
            data,
        }
    }
}

/// Split `payload` into packets and write them to `ring`.
///
/// Returns the cursor of the first packet, which is where a consumer has to
/// start reading to see this payload.
pub fn write_payload(ring: &RingBuffer, payload: &[u8]) -> Cursor {
    let stream = ring.next_stream_id();
    if payload.is_empty() {
        return ring.write(&Packet {
            stream,
            start: true,
            ..Default::default()
        });
    }

    let mut first = None;
    let mut chunks = payload.chunks(PACKET_DATA_SIZE).peekable();
    let mut start = true;
    while let Some(chunk) = chunks.next() {
        let mut packet = Packet {
            stream,
            start,
            next: chunks.peek().is_some(),
            size: chunk.len() as u16,
            ..Default::default()
        };
        packet.data[..chunk.len()].copy_from_slice(chunk);
        let cursor = ring.write(&packet);
        first.get_or_insert(cursor);
        start = false;
    }
    first.unwrap_or_else(|| ring.current_tail())
}

struct PendingStream {
    stream: u32,
    bytes: Vec<u8>,
}

/// Joins packet streams back into whole payloads.
#[derive(Default)]
pub struct PacketReassembler {
    pending: Vec<PendingStream>,
}

impl PacketReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one packet; `on_complete` runs once for every payload this
    /// packet completes.
    ///
    /// Continuations whose start packet was never seen are dropped.
    pub fn process<F: FnMut(&[u8])>(&mut self, packet: &Packet, mut on_complete: F) {
        if packet.start {
            self.pending.retain(|p| p.stream != packet.stream);
            if !packet.next {
                on_complete(packet.payload());
                return;
            }
            if self.pending.len() >= MAX_PENDING_STREAMS {
                let dropped = self.pending.remove(0);
                tracing::debug!("Dropping incomplete packet stream {}", dropped.stream);
            }
            self.pending.push(PendingStream {
                stream: packet.stream,
                bytes: packet.payload().to_vec(),
            });
            return;
        }

        let Some(idx) = self.pending.iter().position(|p| p.stream == packet.stream) else {
            return;
        };
        self.pending[idx].bytes.extend_from_slice(packet.payload());
        if !packet.next {
            let done = self.pending.remove(idx);
            on_complete(&done.bytes);
        }
    }

    /// Forget every partially assembled stream, e.g. after packets were lost.
    pub fn reset(&mut self) {
        self.pending.clear();
    }

    pub fn pending_streams(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ringbuf::ReadStatus;

    fn drain(ring: &RingBuffer, from: Cursor) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        let mut reassembler = PacketReassembler::new();
        let mut cursor = from;
        let mut packet = Packet::default();
        while let ReadStatus::Ready = ring.try_read(&mut packet, &cursor) {
            reassembler.process(&packet, |payload| out.push(payload.to_vec()));
            cursor.move_forward();
        }
        out
    }

    #[test]
    fn test_word_round_trip() {
        let mut packet = Packet {
            stream: 0xdead_beef,
            start: true,
            next: false,
            size: 17,
            ..Default::default()
        };
        for (i, b) in packet.data.iter_mut().enumerate() {
            *b = i as u8;
        }
        assert_eq!(Packet::from_words(&packet.to_words()), packet);
    }

    #[test]
    fn test_single_packet_payload() {
        let ring = RingBuffer::with_capacity(8).unwrap();
        let start = ring.current_head();
        write_payload(&ring, b"short");
        assert_eq!(drain(&ring, start), vec![b"short".to_vec()]);
    }

    #[test]
    fn test_multi_packet_payload() {
        let ring = RingBuffer::with_capacity(16).unwrap();
        let payload: Vec<u8> = (0..200u32).map(|i| i as u8).collect();
        let start = ring.current_head();
        let cursor = write_payload(&ring, &payload);
        assert_eq!(cursor, start);
        assert_eq!(ring.current_head().position(), 5);
        assert_eq!(drain(&ring, start), vec![payload]);
    }

    #[test]
    fn test_interleaved_streams() {
        let a: Vec<u8> = vec![b'a'; 100];
        let b: Vec<u8> = vec![b'b'; 60];
        let mut reassembler = PacketReassembler::new();
        let mut out = Vec::new();

        let packets = |stream: u32, payload: &[u8]| -> Vec<Packet> {
            let chunks: Vec<&[u8]> = payload.chunks(PACKET_DATA_SIZE).collect();
            chunks
                .iter()
                .enumerate()
                .map(|(i, chunk)| {
                    let mut p = Packet {
                        stream,
                        start: i == 0,
                        next: i + 1 < chunks.len(),
                        size: chunk.len() as u16,
                        ..Default::default()
                    };
                    p.data[..chunk.len()].copy_from_slice(chunk);
                    p
                })
                .collect()
        };
        let pa = packets(1, &a);
        let pb = packets(2, &b);
        for p in [pa[0], pb[0], pa[1], pb[1], pa[2]] {
            reassembler.process(&p, |payload| out.push(payload.to_vec()));
        }
        assert_eq!(out, vec![b.clone(), a.clone()]);
        assert_eq!(reassembler.pending_streams(), 0);
    }

    #[test]
    fn test_orphan_continuation_dropped() {
        let mut reassembler = PacketReassembler::new();
        let orphan = Packet {
            stream: 9,
            start: false,
            next: false,
            size: 3,
            ..Default::default()
        };
        let mut called = false;
        reassembler.process(&orphan, |_| called = true);
        assert!(!called);
    }
}
