//! Draining side: turns ring buffer contents into trace files.
//!
//! # Design
//!
//! A [`TraceWriter`] owns one thread that pulls packets from a ring buffer,
//! reassembles and decodes them, and feeds the entries to a
//! [`TraceLifecycleVisitor`]. While a session is open, the lifecycle visitor
//! forwards entries through a chain of transforming visitors:
//!
//! ```text
//! lifecycle -> stack inversion -> timestamp truncation -> delta encoding -> print
//! ```
//!
//! The print stage writes text lines into a gzip stream. All chain state lives
//! on the draining thread, so none of it needs locking.

pub mod lifecycle;
pub mod print;
pub mod priority;
pub mod trace_writer;
pub mod transforms;

pub use lifecycle::{
    encode_trace_id, AbortReason, NoopCallbacks, TraceCallbacks, TraceLifecycleVisitor,
    TRACE_FORMAT_VERSION,
};
pub use print::PrintEntryVisitor;
pub use priority::ScopedThreadPriority;
pub use trace_writer::TraceWriter;
pub use transforms::{DeltaEncodingVisitor, StackTraceInvertingVisitor, TimestampTruncatingVisitor};
