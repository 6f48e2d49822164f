//! Turns the raw entry stream into trace files.
//!
//! The lifecycle visitor sits at the front of the chain and watches for
//! lifecycle entries whose `extra` field carries its trace id. A start entry
//! opens a compressed file and builds a fresh transform chain in front of it,
//! an end entry closes and publishes the file, an abort or timeout entry
//! throws it away. Everything between is forwarded to the chain. Lifecycle
//! entries of other trace ids are ignored, which lets several sessions share
//! one ring buffer.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use flate2::write::GzEncoder;
use flate2::{Compression, CrcWriter};

use crate::config::WriterConfig;
use crate::entries::{BytesEntry, Entry, EntryType, EntryVisitor, FramesEntry, StandardEntry};
use crate::error::{Error, Result};
use crate::writer::print::PrintEntryVisitor;
use crate::writer::priority::ScopedThreadPriority;
use crate::writer::transforms::{
    DeltaEncodingVisitor, StackTraceInvertingVisitor, TimestampTruncatingVisitor,
};

pub const TRACE_FORMAT_VERSION: u32 = 3;

const TRACE_ID_ALPHABET: &[u8; 64] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";
const TRACE_ID_LEN: usize = 11;

const OUTPUT_BUFFER_SIZE: usize = 1 << 19;

/// Why a session ended without a published trace file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AbortReason {
    Unknown,
    ControllerInitiated,
    MissedEvent,
    Timeout,
    /// A second start entry arrived for the trace id being captured.
    NewStart,
    /// Opening, writing or publishing the trace file failed.
    Io,
    /// The writer shut down while the session was open.
    WriterStopped,
}

/// Host notifications about trace sessions. Called on the draining thread.
pub trait TraceCallbacks: Send + Sync {
    fn on_trace_start(&self, trace_id: i64, flags: i32, path: &Path);

    /// `crc` is the CRC32 of the uncompressed trace text.
    fn on_trace_end(&self, trace_id: i64, crc: u32);

    fn on_trace_abort(&self, trace_id: i64, reason: AbortReason);

    /// Called once a backwards trace has opened its file. Returning true
    /// replays the history still retained in the buffer into the session
    /// before draining continues forward.
    fn on_trace_backfill(&self, _trace_id: i64) -> bool {
        true
    }
}

/// Callbacks that ignore everything.
pub struct NoopCallbacks;

impl TraceCallbacks for NoopCallbacks {
    fn on_trace_start(&self, _trace_id: i64, _flags: i32, _path: &Path) {}

    fn on_trace_end(&self, _trace_id: i64, _crc: u32) {}

    fn on_trace_abort(&self, _trace_id: i64, _reason: AbortReason) {}
}

/// Encode a trace id as 11 base64 digits, most significant first.
pub fn encode_trace_id(trace_id: i64) -> Result<String> {
    if trace_id < 0 {
        return Err(Error::invalid(format!(
            "trace id must be non-negative, got {trace_id}"
        )));
    }
    let mut digits = [b'A'; TRACE_ID_LEN];
    let mut rest = trace_id as u64;
    for digit in digits.iter_mut().rev() {
        *digit = TRACE_ID_ALPHABET[(rest % 64) as usize];
        rest /= 64;
    }
    Ok(digits.iter().map(|&b| b as char).collect())
}

/// Replace everything but `[A-Za-z0-9._-]` with `_`.
pub fn sanitize_file_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn local_time() -> libc::tm {
    // SAFETY: tm is plain old data, localtime_r fills it or leaves it zeroed.
    unsafe {
        let now = libc::time(std::ptr::null_mut());
        let mut tm: libc::tm = std::mem::zeroed();
        libc::localtime_r(&now, &mut tm);
        tm
    }
}

/// `<prefix>-<pid>-<Y>-<M>-<D>T<h>-<m>-<s>-<trace id>.tmp`
pub fn trace_file_name(prefix: &str, trace_id: &str) -> String {
    let tm = local_time();
    format!(
        "{}-{}-{}-{}-{}T{}-{}-{}-{}.tmp",
        prefix,
        std::process::id(),
        1900 + tm.tm_year,
        1 + tm.tm_mon,
        tm.tm_mday,
        tm.tm_hour,
        tm.tm_min,
        tm.tm_sec,
        trace_id
    )
}

type Output = CrcWriter<GzEncoder<BufWriter<File>>>;

type Chain = StackTraceInvertingVisitor<
    TimestampTruncatingVisitor<DeltaEncodingVisitor<PrintEntryVisitor<Output>>>,
>;

struct Session {
    chain: Chain,
    path: PathBuf,
    // Dropped with the session, which restores the thread priority.
    priority: Option<ScopedThreadPriority>,
}

impl Session {
    fn open(config: &WriterConfig, trace_id: i64) -> Result<Session> {
        let id = encode_trace_id(trace_id)?;
        let folder = config.folder.join(sanitize_file_name(&id));
        fs::create_dir_all(&folder)?;
        let path = folder.join(sanitize_file_name(&trace_file_name(&config.prefix, &id)));

        let file = File::create(&path)?;
        let gz = GzEncoder::new(
            BufWriter::with_capacity(OUTPUT_BUFFER_SIZE, file),
            Compression::new(config.compression_level.min(9)),
        );
        let mut output = CrcWriter::new(gz);
        if let Err(e) = write_header(&mut output, config, &id) {
            let _ = fs::remove_file(&path);
            return Err(e.into());
        }

        let chain = StackTraceInvertingVisitor::new(TimestampTruncatingVisitor::new(
            DeltaEncodingVisitor::new(PrintEntryVisitor::new(output)),
            config.timestamp_precision,
        ));
        Ok(Session {
            chain,
            path,
            priority: None,
        })
    }

    /// Flush and publish the file; returns the CRC32 of its contents and
    /// the published path.
    fn finish(self) -> Result<(u32, PathBuf)> {
        let Session {
            chain,
            path,
            priority,
        } = self;
        let output = chain.into_inner().into_inner().into_inner().into_inner();
        let result = (|| -> Result<(u32, PathBuf)> {
            let crc = output.crc().sum();
            let file = output
                .into_inner()
                .finish()?
                .into_inner()
                .map_err(|e| e.into_error())?;
            file.sync_all()?;
            let published = path.with_extension("log");
            fs::rename(&path, &published)?;
            Ok((crc, published))
        })();
        drop(priority);
        if result.is_err() {
            let _ = fs::remove_file(&path);
        }
        result
    }

    fn discard(self) {
        let path = self.path.clone();
        drop(self);
        if let Err(e) = fs::remove_file(&path) {
            tracing::debug!("Failed to remove partial trace {}: {}", path.display(), e);
        }
    }
}

fn write_header<W: Write>(out: &mut W, config: &WriterConfig, id: &str) -> io::Result<()> {
    write!(
        out,
        "dt\nver|{}\nid|{}\nprec|{}\n",
        TRACE_FORMAT_VERSION,
        id,
        config.timestamp_precision.min(9)
    )?;
    for (key, value) in &config.headers {
        writeln!(out, "{}|{}", key, value)?;
    }
    out.write_all(b"\n")
}

/// Outermost visitor of the writer chain, owning the open trace file.
pub struct TraceLifecycleVisitor {
    config: WriterConfig,
    callbacks: Arc<dyn TraceCallbacks>,
    expected_trace_id: i64,
    session: Option<Session>,
    started: bool,
    done: bool,
    backfill_requested: bool,
}

impl TraceLifecycleVisitor {
    pub fn new(config: WriterConfig, callbacks: Arc<dyn TraceCallbacks>, trace_id: i64) -> Self {
        Self {
            config,
            callbacks,
            expected_trace_id: trace_id,
            session: None,
            started: false,
            done: false,
            backfill_requested: false,
        }
    }

    pub fn trace_id(&self) -> i64 {
        self.expected_trace_id
    }

    /// Whether a trace file is open.
    pub fn is_capturing(&self) -> bool {
        self.session.is_some()
    }

    /// Whether a session was opened at some point.
    pub fn started(&self) -> bool {
        self.started
    }

    /// Whether the session for this trace id is over, successfully or not.
    pub fn done(&self) -> bool {
        self.done
    }

    /// Returns true once after a backwards trace was started.
    pub fn take_backfill_request(&mut self) -> bool {
        std::mem::take(&mut self.backfill_requested)
    }

    /// Close the open session without publishing it. Does nothing when no
    /// file is open.
    pub fn abort(&mut self, reason: AbortReason) {
        self.done = true;
        if let Some(session) = self.session.take() {
            session.discard();
            tracing::info!("Trace {} aborted: {:?}", self.expected_trace_id, reason);
            self.callbacks
                .on_trace_abort(self.expected_trace_id, reason);
        }
    }

    fn forward(&mut self, entry: Entry) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if let Err(e) = session.chain.visit(entry) {
            tracing::warn!("Failed to write trace {}: {}", self.expected_trace_id, e);
            self.abort(AbortReason::Io);
        }
    }

    fn on_start(&mut self, entry: StandardEntry) {
        if self.session.is_some() {
            self.abort(AbortReason::NewStart);
        }
        match Session::open(&self.config, self.expected_trace_id) {
            Ok(session) => {
                let path = session.path.clone();
                self.session = Some(session);
                self.started = true;
                self.done = false;
                self.forward(entry.into());
                if self.session.is_some() {
                    tracing::info!("Trace {} started: {}", self.expected_trace_id, path.display());
                    self.callbacks
                        .on_trace_start(self.expected_trace_id, entry.matchid, &path);
                    self.backfill_requested = entry.kind == EntryType::TRACE_BACKWARDS
                        && self.callbacks.on_trace_backfill(self.expected_trace_id);
                }
            }
            Err(e) => {
                tracing::warn!(
                    "Failed to open trace file for {}: {}",
                    self.expected_trace_id,
                    e
                );
                let reason = match e {
                    Error::Io(_) => AbortReason::Io,
                    _ => AbortReason::Unknown,
                };
                self.done = true;
                self.callbacks.on_trace_abort(self.expected_trace_id, reason);
            }
        }
    }

    fn on_end(&mut self, entry: StandardEntry) {
        self.forward(entry.into());
        self.done = true;
        let Some(session) = self.session.take() else {
            return;
        };
        match session.finish() {
            Ok((crc, path)) => {
                tracing::info!("Trace {} written: {}", self.expected_trace_id, path.display());
                self.callbacks.on_trace_end(self.expected_trace_id, crc);
            }
            Err(e) => {
                tracing::warn!(
                    "Failed to finish trace {}: {}",
                    self.expected_trace_id,
                    e
                );
                self.callbacks
                    .on_trace_abort(self.expected_trace_id, AbortReason::Io);
            }
        }
    }

    fn on_priority(&mut self, entry: StandardEntry) {
        if let Some(session) = self.session.as_mut() {
            // Release the previous boost before applying the new one.
            session.priority = None;
            match ScopedThreadPriority::new(entry.callid) {
                Ok(priority) => session.priority = Some(priority),
                Err(e) => tracing::warn!("Failed to set writer priority {}: {}", entry.callid, e),
            }
        }
        self.forward(entry.into());
    }
}

impl EntryVisitor for TraceLifecycleVisitor {
    fn visit_standard(&mut self, entry: StandardEntry) -> Result<()> {
        let kind = entry.kind;
        if kind.is_lifecycle() && entry.extra != self.expected_trace_id {
            return Ok(());
        }
        match kind {
            EntryType::TRACE_START | EntryType::TRACE_BACKWARDS => self.on_start(entry),
            EntryType::TRACE_END => self.on_end(entry),
            EntryType::TRACE_ABORT | EntryType::TRACE_TIMEOUT => {
                self.forward(entry.into());
                let reason = if kind == EntryType::TRACE_TIMEOUT {
                    AbortReason::Timeout
                } else {
                    AbortReason::ControllerInitiated
                };
                self.abort(reason);
            }
            EntryType::LOGGER_PRIORITY => self.on_priority(entry),
            _ => self.forward(entry.into()),
        }
        Ok(())
    }

    fn visit_bytes(&mut self, entry: BytesEntry) -> Result<()> {
        self.forward(entry.into());
        Ok(())
    }

    fn visit_frames(&mut self, entry: FramesEntry) -> Result<()> {
        self.forward(entry.into());
        Ok(())
    }
}

impl Drop for TraceLifecycleVisitor {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            session.discard();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq)]
    enum Event {
        Start(i64, i32, PathBuf),
        End(i64, u32),
        Abort(i64, AbortReason),
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<Event>>);

    impl Recorder {
        fn events(&self) -> Vec<Event> {
            self.0.lock().unwrap().clone()
        }
    }

    impl TraceCallbacks for Recorder {
        fn on_trace_start(&self, trace_id: i64, flags: i32, path: &Path) {
            self.0
                .lock()
                .unwrap()
                .push(Event::Start(trace_id, flags, path.to_path_buf()));
        }

        fn on_trace_end(&self, trace_id: i64, crc: u32) {
            self.0.lock().unwrap().push(Event::End(trace_id, crc));
        }

        fn on_trace_abort(&self, trace_id: i64, reason: AbortReason) {
            self.0.lock().unwrap().push(Event::Abort(trace_id, reason));
        }
    }

    fn lifecycle(kind: EntryType, trace_id: i64) -> StandardEntry {
        StandardEntry {
            id: 1,
            kind,
            timestamp: 1000,
            extra: trace_id,
            ..Default::default()
        }
    }

    fn setup(dir: &TempDir) -> (TraceLifecycleVisitor, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let config = WriterConfig::new(dir.path()).with_header("key", "value");
        (
            TraceLifecycleVisitor::new(config, recorder.clone(), 1),
            recorder,
        )
    }

    fn files(dir: &Path) -> Vec<PathBuf> {
        let mut out = Vec::new();
        for entry in fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                out.extend(files(&path));
            } else {
                out.push(path);
            }
        }
        out
    }

    #[test]
    fn test_trace_id_encoding() {
        assert_eq!(encode_trace_id(0).unwrap(), "AAAAAAAAAAA");
        assert_eq!(encode_trace_id(1).unwrap(), "AAAAAAAAAAB");
        assert_eq!(encode_trace_id(64).unwrap(), "AAAAAAAAABA");
        assert_eq!(encode_trace_id(63).unwrap(), "AAAAAAAAAA/");
        assert!(matches!(encode_trace_id(-1), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("a+b/c.d-e_f"), "a_b_c.d-e_f");
    }

    #[test]
    fn test_trace_file_name() {
        let name = trace_file_name("prefix", "AAAAAAAAAAB");
        assert!(name.starts_with(&format!("prefix-{}-", std::process::id())));
        assert!(name.ends_with("-AAAAAAAAAAB.tmp"));
        assert!(name.contains('T'));
    }

    #[test]
    fn test_full_session() {
        let dir = TempDir::new().unwrap();
        let (mut visitor, recorder) = setup(&dir);

        visitor.visit_standard(lifecycle(EntryType::TRACE_START, 1)).unwrap();
        assert!(visitor.is_capturing());
        visitor
            .visit_bytes(BytesEntry {
                id: 2,
                kind: EntryType::STRING_KEY,
                matchid: 1,
                bytes: b"hi".to_vec(),
            })
            .unwrap();
        visitor.visit_standard(lifecycle(EntryType::TRACE_END, 1)).unwrap();
        assert!(visitor.done());
        assert!(!visitor.is_capturing());

        let found = files(dir.path());
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].extension().unwrap(), "log");
        assert_eq!(
            found[0].parent().unwrap().file_name().unwrap(),
            "AAAAAAAAAAB"
        );

        let mut text = String::new();
        GzDecoder::new(File::open(&found[0]).unwrap())
            .read_to_string(&mut text)
            .unwrap();
        assert!(text.starts_with("dt\nver|3\nid|AAAAAAAAAAB\nprec|6\nkey|value\n\n"));
        assert!(text.ends_with("1|TRACE_START|1|0|0|0|1\n1|STRING_KEY|1|hi\n-1|TRACE_END|0|0|0|-1|1\n"));

        let mut crc = flate2::Crc::new();
        crc.update(text.as_bytes());
        let events = recorder.events();
        assert!(matches!(events[0], Event::Start(1, 0, _)));
        assert_eq!(events[1], Event::End(1, crc.sum()));
    }

    #[test]
    fn test_other_trace_ids_ignored() {
        let dir = TempDir::new().unwrap();
        let (mut visitor, recorder) = setup(&dir);
        visitor.visit_standard(lifecycle(EntryType::TRACE_START, 2)).unwrap();
        visitor.visit_standard(lifecycle(EntryType::TRACE_END, 2)).unwrap();
        assert!(!visitor.done());
        assert!(recorder.events().is_empty());
        assert!(files(dir.path()).is_empty());
    }

    #[test]
    fn test_restart_aborts_open_session() {
        let dir = TempDir::new().unwrap();
        let (mut visitor, recorder) = setup(&dir);
        visitor.visit_standard(lifecycle(EntryType::TRACE_START, 1)).unwrap();
        visitor.visit_standard(lifecycle(EntryType::TRACE_START, 1)).unwrap();
        assert!(visitor.is_capturing());
        assert!(!visitor.done());

        let events = recorder.events();
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], Event::Start(1, _, _)));
        assert_eq!(events[1], Event::Abort(1, AbortReason::NewStart));
        assert!(matches!(events[2], Event::Start(1, _, _)));
    }

    #[test]
    fn test_abort_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let (mut visitor, recorder) = setup(&dir);
        visitor.abort(AbortReason::Unknown);
        assert!(recorder.events().is_empty());

        visitor.visit_standard(lifecycle(EntryType::TRACE_START, 1)).unwrap();
        visitor.visit_standard(lifecycle(EntryType::TRACE_TIMEOUT, 1)).unwrap();
        visitor.abort(AbortReason::Unknown);
        let events = recorder.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1], Event::Abort(1, AbortReason::Timeout));
        assert!(files(dir.path()).is_empty());
    }

    #[test]
    fn test_end_while_idle_finishes_silently() {
        let dir = TempDir::new().unwrap();
        let (mut visitor, recorder) = setup(&dir);
        visitor.visit_standard(lifecycle(EntryType::TRACE_ABORT, 1)).unwrap();
        assert!(visitor.done());
        assert!(!visitor.started());
        assert!(recorder.events().is_empty());
    }

    #[test]
    fn test_unwritable_folder_reports_io() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, b"x").unwrap();
        let recorder = Arc::new(Recorder::default());
        let mut visitor =
            TraceLifecycleVisitor::new(WriterConfig::new(&blocker), recorder.clone(), 1);
        visitor.visit_standard(lifecycle(EntryType::TRACE_START, 1)).unwrap();
        assert!(visitor.done());
        assert_eq!(recorder.events(), vec![Event::Abort(1, AbortReason::Io)]);
    }

    #[test]
    fn test_backwards_requests_backfill() {
        let dir = TempDir::new().unwrap();
        let (mut visitor, _recorder) = setup(&dir);
        visitor
            .visit_standard(lifecycle(EntryType::TRACE_BACKWARDS, 1))
            .unwrap();
        assert!(visitor.take_backfill_request());
        assert!(!visitor.take_backfill_request());
    }

    struct NoReplay;

    impl TraceCallbacks for NoReplay {
        fn on_trace_start(&self, _trace_id: i64, _flags: i32, _path: &Path) {}

        fn on_trace_end(&self, _trace_id: i64, _crc: u32) {}

        fn on_trace_abort(&self, _trace_id: i64, _reason: AbortReason) {}

        fn on_trace_backfill(&self, _trace_id: i64) -> bool {
            false
        }
    }

    #[test]
    fn test_declined_backfill_still_opens_session() {
        let dir = TempDir::new().unwrap();
        let mut visitor =
            TraceLifecycleVisitor::new(WriterConfig::new(dir.path()), Arc::new(NoReplay), 1);
        visitor
            .visit_standard(lifecycle(EntryType::TRACE_BACKWARDS, 1))
            .unwrap();
        assert!(visitor.started());
        assert!(!visitor.take_backfill_request());
    }
}
