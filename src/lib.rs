//! ringtrace library - crash-safe, low-overhead event tracing.
//!
//! Application threads write small binary entries into a shared ring buffer
//! through a [`Logger`]. A [`TraceWriter`] thread drains the buffer and turns
//! the stream into gzip-compressed trace files, one per trace session. A
//! session is delimited by sentinel entries written through the same logger,
//! so there is no separate control channel.
//!
//! # Modules
//!
//! - [`entries`] - Entry shapes, entry types and their binary codec
//! - [`ringbuf`] - Multi-producer ring buffer of fixed-size slots
//! - [`packet`] - Splitting entries into slot-sized packets and back
//! - [`buffer`] - Anonymous or file-backed storage for a ring buffer
//! - [`logger`] - Producer API
//! - [`counters`] - Change-only logging for sampled counters
//! - [`writer`] - Draining thread, trace lifecycle and output transforms
//! - [`recover`] - Trace files from buffers of dead processes
//!
//! # Example
//!
//! ```no_run
//! use ringtrace::entries::{EntryType, StandardEntry};
//! use ringtrace::{Buffer, NoopCallbacks, TraceWriter, WriterConfig};
//! use std::sync::Arc;
//!
//! let buffer = Arc::new(Buffer::anonymous(4096).expect("Failed to create buffer"));
//! let writer = TraceWriter::start(
//!     WriterConfig::new("/tmp/traces"),
//!     buffer.clone(),
//!     Arc::new(NoopCallbacks),
//! )
//! .expect("Failed to start writer");
//!
//! let logger = buffer.logger();
//! let (_, cursor) = logger.write_and_get_cursor(StandardEntry {
//!     kind: EntryType::TRACE_START,
//!     extra: 42,
//!     ..Default::default()
//! });
//! writer.submit(cursor, 42);
//! logger.write(StandardEntry {
//!     kind: EntryType::TRACE_END,
//!     extra: 42,
//!     ..Default::default()
//! });
//! writer.stop();
//! ```

pub mod buffer;
pub mod config;
pub mod counters;
pub mod entries;
pub mod error;
pub mod logger;
pub mod packet;
pub mod recover;
pub mod ringbuf;
pub mod writer;

// Re-export for convenience
pub use buffer::{Buffer, BufferHeader, Snapshot, WeakBuffer};
pub use config::WriterConfig;
pub use error::{Error, Result};
pub use logger::{EntryFlags, Logger, MultiBufferLogger};
pub use ringbuf::{Cursor, ReadStatus, RingBuffer};
pub use writer::{AbortReason, NoopCallbacks, TraceCallbacks, TraceWriter};
