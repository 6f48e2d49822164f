//! Common test utilities for ringtrace integration tests.

#![allow(dead_code)]

use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use flate2::read::GzDecoder;
use ringtrace::entries::{EntryType, StandardEntry};
use ringtrace::{AbortReason, Logger, TraceCallbacks};

pub const TRACE_ID: i64 = 1;
pub const SECOND_TRACE_ID: i64 = 2;
pub const TRACE_ID_STRING: &str = "AAAAAAAAAAB";
pub const TRACE_PREFIX: &str = "test-prefix";

/// One callback invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum Callback {
    Start {
        trace_id: i64,
        flags: i32,
        path: PathBuf,
    },
    End {
        trace_id: i64,
        crc: u32,
    },
    Abort {
        trace_id: i64,
        reason: AbortReason,
    },
    Backfill {
        trace_id: i64,
    },
}

/// Records every callback in order.
#[derive(Default)]
pub struct RecordingCallbacks {
    calls: Mutex<Vec<Callback>>,
    decline_backfill: AtomicBool,
}

impl RecordingCallbacks {
    /// Answer backfill requests with "no replay".
    pub fn declining_backfill() -> Self {
        let callbacks = Self::default();
        callbacks.decline_backfill.store(true, Ordering::Relaxed);
        callbacks
    }

    pub fn calls(&self) -> Vec<Callback> {
        self.calls.lock().unwrap().clone()
    }

    pub fn starts(&self, trace_id: i64) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Callback::Start { trace_id: id, .. } if *id == trace_id))
            .count()
    }

    pub fn ends(&self, trace_id: i64) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Callback::End { trace_id: id, .. } if *id == trace_id))
            .count()
    }

    pub fn aborts(&self) -> Vec<(i64, AbortReason)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Callback::Abort { trace_id, reason } => Some((trace_id, reason)),
                _ => None,
            })
            .collect()
    }
}

impl TraceCallbacks for RecordingCallbacks {
    fn on_trace_start(&self, trace_id: i64, flags: i32, path: &Path) {
        self.calls.lock().unwrap().push(Callback::Start {
            trace_id,
            flags,
            path: path.to_path_buf(),
        });
    }

    fn on_trace_end(&self, trace_id: i64, crc: u32) {
        self.calls
            .lock()
            .unwrap()
            .push(Callback::End { trace_id, crc });
    }

    fn on_trace_abort(&self, trace_id: i64, reason: AbortReason) {
        self.calls
            .lock()
            .unwrap()
            .push(Callback::Abort { trace_id, reason });
    }

    fn on_trace_backfill(&self, trace_id: i64) -> bool {
        self.calls
            .lock()
            .unwrap()
            .push(Callback::Backfill { trace_id });
        !self.decline_backfill.load(Ordering::Relaxed)
    }
}

fn lifecycle_entry(kind: EntryType, timestamp: i64, trace_id: i64) -> StandardEntry {
    StandardEntry {
        id: 0,
        kind,
        timestamp,
        tid: 0,
        callid: 0,
        matchid: 0,
        extra: trace_id,
    }
}

pub fn write_trace_start(logger: &Logger<'_>, trace_id: i64) -> i32 {
    logger.write(lifecycle_entry(EntryType::TRACE_START, 123, trace_id))
}

pub fn write_trace_end(logger: &Logger<'_>, trace_id: i64) -> i32 {
    logger.write(lifecycle_entry(EntryType::TRACE_END, 124, trace_id))
}

pub fn write_trace_abort(logger: &Logger<'_>, trace_id: i64) -> i32 {
    logger.write(lifecycle_entry(EntryType::TRACE_ABORT, 125, trace_id))
}

pub fn write_filler(logger: &Logger<'_>) -> i32 {
    logger.write(lifecycle_entry(EntryType::MARK_PUSH, 125, 0))
}

/// Every regular file below `dir`.
pub fn trace_files(dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir).unwrap() {
        let path = entry.unwrap().path();
        if path.is_dir() {
            files.extend(trace_files(&path));
        } else {
            files.push(path);
        }
    }
    files.sort();
    files
}

pub fn only_trace_file(dir: &Path) -> PathBuf {
    let files = trace_files(dir);
    assert_eq!(files.len(), 1, "expected exactly one trace file: {files:?}");
    files.into_iter().next().unwrap()
}

pub fn read_trace(path: &Path) -> String {
    let mut text = String::new();
    GzDecoder::new(File::open(path).unwrap())
        .read_to_string(&mut text)
        .unwrap();
    text
}

/// Entry lines of a trace file, without the header block.
pub fn trace_body(text: &str) -> Vec<&str> {
    match text.split_once("\n\n") {
        Some((_, body)) => body.lines().collect(),
        None => Vec::new(),
    }
}
