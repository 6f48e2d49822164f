use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use crate::buffer::Buffer;
use crate::config::WriterConfig;
use crate::entries::{parse, Entry, EntryType, EntryVisitor, StandardEntry};
use crate::error::Result;
use crate::packet::{Packet, PacketReassembler};
use crate::ringbuf::{Cursor, ReadStatus, RingBuffer};
use crate::writer::lifecycle::{AbortReason, TraceCallbacks, TraceLifecycleVisitor};

enum Request {
    Trace { cursor: Cursor, trace_id: i64 },
    Stop,
}

struct Shared {
    queue: Mutex<VecDeque<Request>>,
    cond: Condvar,
    interrupt: AtomicBool,
}

impl Shared {
    fn push(&self, request: Request) {
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        queue.push_back(request);
        self.cond.notify_one();
    }

    fn pop(&self) -> Request {
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if let Some(request) = queue.pop_front() {
                return request;
            }
            queue = self.cond.wait(queue).unwrap_or_else(|e| e.into_inner());
        }
    }
}

/// Owns the draining thread of one buffer.
///
/// Each submitted request names a trace id and the cursor to start reading
/// from. Requests are served one at a time in submission order; a request is
/// finished once its session ended, or right away if the session can no
/// longer be observed.
pub struct TraceWriter {
    shared: Arc<Shared>,
    buffer: Arc<Buffer>,
    handle: Option<JoinHandle<()>>,
}

impl TraceWriter {
    pub fn start(
        config: WriterConfig,
        buffer: Arc<Buffer>,
        callbacks: Arc<dyn TraceCallbacks>,
    ) -> Result<TraceWriter> {
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
            interrupt: AtomicBool::new(false),
        });

        let handle = {
            let shared = shared.clone();
            let buffer = buffer.clone();
            thread::Builder::new()
                .name(config.thread_name.clone())
                .spawn(move || {
                    tracing::debug!("Trace writer thread started");
                    loop {
                        match shared.pop() {
                            Request::Stop => break,
                            Request::Trace { cursor, trace_id } => {
                                Self::run_session(
                                    &config,
                                    &buffer,
                                    callbacks.clone(),
                                    cursor,
                                    trace_id,
                                    &shared.interrupt,
                                );
                            }
                        }
                    }
                    tracing::debug!("Trace writer thread exiting");
                })?
        };

        Ok(TraceWriter {
            shared,
            buffer,
            handle: Some(handle),
        })
    }

    /// Capture `trace_id`, reading from `cursor` on.
    pub fn submit(&self, cursor: Cursor, trace_id: i64) {
        self.shared.push(Request::Trace { cursor, trace_id });
    }

    /// Capture `trace_id`, reading from the oldest retained entry on.
    pub fn submit_from_oldest(&self, trace_id: i64) {
        self.submit(self.buffer.ring().oldest(), trace_id);
    }

    /// Let pending requests finish, then stop the thread.
    pub fn stop(mut self) {
        self.shared.push(Request::Stop);
        self.join();
    }

    /// Stop as soon as possible; an open session is aborted.
    pub fn shutdown(mut self) {
        self.interrupt();
    }

    fn interrupt(&mut self) {
        self.shared.interrupt.store(true, Ordering::Release);
        self.shared.push(Request::Stop);
        self.buffer.ring().wake_all();
        self.join();
    }

    fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::warn!("Trace writer thread panicked");
            }
        }
    }

    /// Drain one session synchronously on the calling thread.
    pub fn process_trace(
        config: &WriterConfig,
        buffer: &Buffer,
        callbacks: Arc<dyn TraceCallbacks>,
        cursor: Cursor,
        trace_id: i64,
    ) {
        let interrupt = AtomicBool::new(false);
        Self::run_session(config, buffer, callbacks, cursor, trace_id, &interrupt);
    }

    fn run_session(
        config: &WriterConfig,
        buffer: &Buffer,
        callbacks: Arc<dyn TraceCallbacks>,
        cursor: Cursor,
        trace_id: i64,
        interrupt: &AtomicBool,
    ) {
        tracing::debug!(
            "Processing trace {} from position {}",
            trace_id,
            cursor.position()
        );
        let mut visitor = TraceLifecycleVisitor::new(config.clone(), callbacks, trace_id);
        drain(buffer.ring(), cursor, &mut visitor, interrupt);
        if !visitor.started() {
            tracing::debug!("Trace {} finished without a session", trace_id);
        }
    }
}

impl Drop for TraceWriter {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.interrupt();
        }
    }
}

fn dispatch(payload: &[u8], visitor: &mut TraceLifecycleVisitor) {
    if let Err(e) = parse(payload, visitor) {
        tracing::debug!("Skipping undecodable entry: {}", e);
    }
}

/// Pull entries from `cursor` on into `visitor` until its session is done.
fn drain(
    ring: &RingBuffer,
    mut cursor: Cursor,
    visitor: &mut TraceLifecycleVisitor,
    interrupt: &AtomicBool,
) {
    let mut reassembler = PacketReassembler::new();
    let mut packet = Packet::default();

    while !visitor.done() {
        match ring.wait_and_read(&mut packet, &cursor, interrupt) {
            ReadStatus::Ready => {
                let position = cursor;
                cursor.move_forward();
                reassembler.process(&packet, |payload| dispatch(payload, visitor));
                if visitor.take_backfill_request() {
                    backfill(ring, position, visitor);
                }
            }
            ReadStatus::Overwritten { lost } => {
                if !visitor.is_capturing() {
                    tracing::debug!(
                        "Trace {} fell behind by {} records before it started",
                        visitor.trace_id(),
                        lost
                    );
                    return;
                }
                tracing::warn!("Trace {} lost {} records", visitor.trace_id(), lost);
                let marker = StandardEntry {
                    kind: EntryType::LOST_RECORDS,
                    extra: lost as i64,
                    ..Default::default()
                };
                if let Err(e) = visitor.visit_standard(marker) {
                    tracing::debug!("Failed to record lost records: {}", e);
                }
                reassembler.reset();
                cursor = ring.oldest().max(cursor);
            }
            ReadStatus::Interrupted => {
                visitor.abort(AbortReason::WriterStopped);
                return;
            }
            ReadStatus::Pending => {}
        }
    }
}

/// Replay the retained history before `until` into the open session,
/// without lifecycle entries.
fn backfill(ring: &RingBuffer, until: Cursor, visitor: &mut TraceLifecycleVisitor) {
    let mut reassembler = PacketReassembler::new();
    let mut packet = Packet::default();
    let mut cursor = ring.oldest();
    let mut replayed = 0usize;

    while cursor < until {
        match ring.try_read(&mut packet, &cursor) {
            ReadStatus::Ready => {
                cursor.move_forward();
                reassembler.process(&packet, |payload| match Entry::unpack(payload) {
                    Ok(Entry::Standard(e)) if e.kind.is_lifecycle() => {}
                    Ok(entry) => {
                        replayed += 1;
                        if let Err(e) = visitor.visit(entry) {
                            tracing::debug!("Failed to replay entry: {}", e);
                        }
                    }
                    Err(e) => tracing::debug!("Skipping undecodable entry: {}", e),
                });
            }
            ReadStatus::Overwritten { .. } => {
                reassembler.reset();
                cursor = ring.oldest();
            }
            _ => break,
        }
    }
    tracing::debug!(
        "Backfilled {} entries into trace {}",
        replayed,
        visitor.trace_id()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::lifecycle::NoopCallbacks;
    use tempfile::TempDir;

    fn lifecycle(kind: EntryType, trace_id: i64) -> StandardEntry {
        StandardEntry {
            kind,
            extra: trace_id,
            ..Default::default()
        }
    }

    fn trace_files(dir: &TempDir) -> usize {
        std::fs::read_dir(dir.path())
            .unwrap()
            .flat_map(|d| std::fs::read_dir(d.unwrap().path()).unwrap())
            .count()
    }

    #[test]
    fn test_stop_with_no_requests() {
        let dir = TempDir::new().unwrap();
        let buffer = Arc::new(Buffer::anonymous(8).unwrap());
        let writer = TraceWriter::start(
            WriterConfig::new(dir.path()),
            buffer,
            Arc::new(NoopCallbacks),
        )
        .unwrap();
        writer.stop();
    }

    #[test]
    fn test_shutdown_interrupts_waiting_session() {
        let dir = TempDir::new().unwrap();
        let buffer = Arc::new(Buffer::anonymous(8).unwrap());
        let writer = TraceWriter::start(
            WriterConfig::new(dir.path()),
            buffer.clone(),
            Arc::new(NoopCallbacks),
        )
        .unwrap();
        let cursor = buffer.ring().current_head();
        buffer.logger().write(lifecycle(EntryType::TRACE_START, 1));
        writer.submit(cursor, 1);
        writer.shutdown();
        assert_eq!(trace_files(&dir), 0);
    }

    #[test]
    fn test_process_trace_synchronously() {
        let dir = TempDir::new().unwrap();
        let buffer = Buffer::anonymous(16).unwrap();
        let cursor = buffer.ring().current_head();
        let logger = buffer.logger();
        logger.write(lifecycle(EntryType::TRACE_START, 5));
        logger.write(StandardEntry::default());
        logger.write(lifecycle(EntryType::TRACE_END, 5));

        TraceWriter::process_trace(
            &WriterConfig::new(dir.path()),
            &buffer,
            Arc::new(NoopCallbacks),
            cursor,
            5,
        );
        assert_eq!(trace_files(&dir), 1);
    }
}
