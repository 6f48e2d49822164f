//! ringtrace: inspect, recover and produce trace buffers and trace files.

use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use flate2::read::GzDecoder;
use tracing_subscriber::EnvFilter;

use ringtrace::counters::MonotonicCounter;
use ringtrace::entries::{Entry, EntryType, StandardEntry};
use ringtrace::logger::{monotonic_time, thread_id};
use ringtrace::{
    recover, AbortReason, Buffer, EntryFlags, Snapshot, TraceCallbacks, TraceWriter, WriterConfig,
};

#[derive(Parser)]
#[command(name = "ringtrace")]
#[command(about = "Crash-safe event tracing into ring buffers")]
#[command(version)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbosity: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the header and contents of a persisted buffer file
    Inspect {
        /// Path to the buffer file
        dump: PathBuf,

        /// Also list every retained entry
        #[arg(short, long)]
        entries: bool,

        /// Print the header as JSON
        #[arg(long)]
        json: bool,
    },
    /// Turn a persisted buffer file into a trace file
    Recover {
        /// Path to the buffer file
        dump: PathBuf,

        #[command(flatten)]
        output: OutputArgs,
    },
    /// Print the decompressed contents of a trace file
    Cat {
        /// Path to the trace file
        trace: PathBuf,
    },
    /// Capture a synthetic workload into a trace file
    Record {
        #[command(flatten)]
        output: OutputArgs,

        /// Trace id of the session
        #[arg(long, default_value_t = 1)]
        trace_id: i64,

        /// Number of producer threads
        #[arg(short, long, default_value_t = 4)]
        threads: usize,

        /// Entries written by each producer thread
        #[arg(short = 'n', long, default_value_t = 1000)]
        entries: usize,

        /// Ring buffer slots
        #[arg(long, default_value_t = 1 << 16)]
        slots: usize,

        /// Back the ring buffer with this file and keep it afterwards
        #[arg(long)]
        buffer_file: Option<PathBuf>,
    },
}

#[derive(clap::Args)]
struct OutputArgs {
    /// Folder trace files are written to
    #[arg(short, long, default_value = ".")]
    folder: PathBuf,

    /// Trace file name prefix
    #[arg(short, long)]
    prefix: Option<String>,

    /// JSON writer configuration; command line options take precedence
    #[arg(short, long)]
    config: Option<PathBuf>,
}

impl OutputArgs {
    fn writer_config(&self) -> Result<WriterConfig> {
        let mut config = match &self.config {
            Some(path) => WriterConfig::from_json_file(path)?,
            None => WriterConfig::default(),
        };
        config.folder = self.folder.clone();
        if let Some(prefix) = &self.prefix {
            config.prefix = prefix.clone();
        }
        Ok(config)
    }
}

/// Reports session transitions on stderr.
#[derive(Default)]
struct ConsoleCallbacks {
    failed: AtomicBool,
}

impl TraceCallbacks for ConsoleCallbacks {
    fn on_trace_start(&self, trace_id: i64, flags: i32, path: &Path) {
        eprintln!(
            "Trace {} started (flags {:#x}): {}",
            trace_id,
            flags,
            path.display()
        );
    }

    fn on_trace_end(&self, trace_id: i64, crc: u32) {
        eprintln!("Trace {} complete, crc32 {:08x}", trace_id, crc);
    }

    fn on_trace_abort(&self, trace_id: i64, reason: AbortReason) {
        eprintln!("Trace {} aborted: {:?}", trace_id, reason);
        self.failed.store(true, Ordering::Relaxed);
    }
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn run_inspect(dump: &Path, entries: bool, json: bool) -> Result<()> {
    let snapshot = Snapshot::load(dump)
        .with_context(|| format!("Failed to load buffer file {}", dump.display()))?;
    let header = &snapshot.header;

    if json {
        let value = serde_json::json!({
            "version": header.version,
            "providers": header.providers,
            "long_context": header.long_context,
            "trace_id": header.trace_id,
            "config_id": header.config_id,
            "entry_count": header.entry_count,
            "slot_size": header.slot_size,
            "session_id": header.session_id(),
            "memory_maps_file": header.memory_maps_file(),
            "retained_packets": snapshot.packets.len(),
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        println!("version:          {}", header.version);
        println!("providers:        {:#x}", header.providers);
        println!("long context:     {}", header.long_context);
        println!("trace id:         {}", header.trace_id);
        println!("config id:        {}", header.config_id);
        println!("slots:            {}", header.entry_count);
        println!("session id:       {}", header.session_id());
        println!("memory maps file: {}", header.memory_maps_file());
        println!("retained packets: {}", snapshot.packets.len());
    }

    if entries {
        for entry in snapshot.entries() {
            match entry {
                Entry::Standard(e) => println!(
                    "{}|{}|{}|{}|{}|{}|{}",
                    e.id, e.kind, e.timestamp, e.tid, e.callid, e.matchid, e.extra
                ),
                Entry::Bytes(e) => println!(
                    "{}|{}|{}|{}",
                    e.id,
                    e.kind,
                    e.matchid,
                    String::from_utf8_lossy(&e.bytes)
                ),
                Entry::Frames(e) => println!(
                    "{}|{}|{}|{}|{:?}",
                    e.id, e.kind, e.timestamp, e.tid, e.frames
                ),
            }
        }
    }
    Ok(())
}

fn run_recover(dump: &Path, output: &OutputArgs) -> Result<()> {
    let config = output.writer_config()?;
    let callbacks = Arc::new(ConsoleCallbacks::default());
    match recover::write_trace_from_dump(dump, &config, callbacks.clone())
        .with_context(|| format!("Failed to recover {}", dump.display()))?
    {
        Some(trace_id) => {
            if callbacks.failed.load(Ordering::Relaxed) {
                bail!("Recovery of trace {} failed", trace_id);
            }
        }
        None => println!("No trace was active in {}", dump.display()),
    }
    Ok(())
}

fn run_cat(trace: &Path) -> Result<()> {
    let file =
        File::open(trace).with_context(|| format!("Failed to open {}", trace.display()))?;
    let mut reader = GzDecoder::new(BufReader::new(file));
    io::copy(&mut reader, &mut io::stdout().lock())
        .with_context(|| format!("Failed to decompress {}", trace.display()))?;
    Ok(())
}

fn produce(buffer: &Buffer, producer: usize, entries: usize) {
    let logger = buffer.logger();
    let tid = thread_id();
    let mut counter = MonotonicCounter::new(logger, producer as i32, tid);
    let flags = EntryFlags::SKIP_PROVIDER_CHECK | EntryFlags::FILL_TIMESTAMP | EntryFlags::FILL_TID;

    for i in 0..entries {
        let id = logger.write_with_flags(flags, EntryType::MARK_PUSH, 0, 0, i as i32, 0, 0);
        logger.write_str(
            EntryType::STRING_NAME,
            id,
            &format!("producer {} item {}", producer, i),
        );
        if i % 16 == 0 {
            logger.write_frames(
                EntryType::STACK_FRAME,
                monotonic_time(),
                tid,
                &[0x1000, 0x2000 + i as i64, 0x3000],
            );
        }
        counter.record((i / 10) as i64, monotonic_time());
        logger.write_with_flags(flags, EntryType::MARK_POP, 0, 0, i as i32, id, 0);
    }
    counter.flush();
}

fn run_record(
    output: &OutputArgs,
    trace_id: i64,
    threads: usize,
    entries: usize,
    slots: usize,
    buffer_file: Option<&Path>,
) -> Result<()> {
    if trace_id <= 0 {
        bail!("Trace id must be positive");
    }
    let config = output.writer_config()?;
    let buffer = Arc::new(match buffer_file {
        Some(path) => Buffer::file_backed(path, slots)?,
        None => Buffer::anonymous(slots)?,
    });
    buffer.set_trace_id(trace_id);
    buffer.set_session_id(&format!("record-{}", std::process::id()));

    let callbacks = Arc::new(ConsoleCallbacks::default());
    let writer = TraceWriter::start(config, buffer.clone(), callbacks.clone())?;

    let logger = buffer.logger();
    let (_, cursor) = logger.write_and_get_cursor(StandardEntry {
        kind: EntryType::TRACE_START,
        timestamp: monotonic_time(),
        tid: thread_id(),
        extra: trace_id,
        ..Default::default()
    });
    writer.submit(cursor, trace_id);

    let mut producers = Vec::new();
    for producer in 0..threads {
        let buffer = buffer.clone();
        producers.push(
            thread::Builder::new()
                .name(format!("producer-{}", producer))
                .spawn(move || produce(&buffer, producer, entries))?,
        );
    }
    for handle in producers {
        if handle.join().is_err() {
            bail!("Producer thread panicked");
        }
    }

    logger.write(StandardEntry {
        kind: EntryType::TRACE_END,
        timestamp: monotonic_time(),
        tid: thread_id(),
        extra: trace_id,
        ..Default::default()
    });
    writer.stop();

    if buffer_file.is_some() {
        buffer.persist();
    }
    if callbacks.failed.load(Ordering::Relaxed) {
        bail!("Trace {} was aborted", trace_id);
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbosity);

    match cli.command {
        Commands::Inspect {
            dump,
            entries,
            json,
        } => run_inspect(&dump, entries, json),
        Commands::Recover { dump, output } => run_recover(&dump, &output),
        Commands::Cat { trace } => run_cat(&trace),
        Commands::Record {
            output,
            trace_id,
            threads,
            entries,
            slots,
            buffer_file,
        } => run_record(
            &output,
            trace_id,
            threads,
            entries,
            slots,
            buffer_file.as_deref(),
        ),
    }
}
