//! Trace files from buffers left behind by dead processes.
//!
//! A process that traces into a file-backed buffer and dies leaves the
//! buffer file on disk. Its header names the trace that was running, the
//! slots hold whatever had not been overwritten yet. Recovery replays those
//! entries between a pair of fresh sentinel entries into a fresh buffer and drains
//! that through the regular writer, so the result is an ordinary trace file.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use crate::buffer::{Buffer, Snapshot};
use crate::config::WriterConfig;
use crate::entries::{Entry, EntryType, StandardEntry, BYTES_HEADER_SIZE};
use crate::error::Result;
use crate::logger::{monotonic_time, thread_id, Logger, MAX_BYTES_PAYLOAD};
use crate::packet::{write_payload, PACKET_DATA_SIZE};
use crate::writer::{TraceCallbacks, TraceWriter};

const MEMORY_MAPPING_KEY: &str = "mapping";

fn packets_for(bytes: usize) -> usize {
    bytes.div_ceil(PACKET_DATA_SIZE).max(1)
}

fn read_memory_maps(dump_path: &Path, file_name: &str) -> Vec<String> {
    if file_name.is_empty() {
        return Vec::new();
    }
    let path = dump_path
        .parent()
        .map(|dir| dir.join(file_name))
        .unwrap_or_else(|| file_name.into());
    match fs::read_to_string(&path) {
        Ok(text) => text.lines().map(str::to_string).collect(),
        Err(e) => {
            tracing::warn!("Failed to read memory maps {}: {}", path.display(), e);
            Vec::new()
        }
    }
}

fn write_lifecycle(logger: &Logger<'_>, kind: EntryType, trace_id: i64, timestamp: i64) {
    logger.write(StandardEntry {
        id: 0,
        kind,
        timestamp,
        tid: thread_id(),
        callid: 0,
        matchid: 0,
        extra: trace_id,
    });
}

fn write_memory_mappings(logger: &Logger<'_>, lines: &[String], timestamp: i64) {
    let tid = thread_id();
    for line in lines {
        let mapping = logger.write(StandardEntry {
            id: 0,
            kind: EntryType::MAPPING,
            timestamp,
            tid,
            callid: 0,
            matchid: 0,
            extra: 0,
        });
        let key = logger.write_str(EntryType::STRING_KEY, mapping, MEMORY_MAPPING_KEY);
        logger.write_str(EntryType::STRING_VALUE, key, line);
    }
}

/// Turn the buffer file at `dump_path` into a trace file.
///
/// Retained entries are replayed with their original ids; lifecycle entries
/// of the dead process are dropped. Returns the recovered trace id, or `None`
/// when no trace was running when the buffer was abandoned.
pub fn write_trace_from_dump<P: AsRef<Path>>(
    dump_path: P,
    config: &WriterConfig,
    callbacks: Arc<dyn TraceCallbacks>,
) -> Result<Option<i64>> {
    let dump_path = dump_path.as_ref();
    let snapshot = Snapshot::load(dump_path)?;
    let header = snapshot.header;
    if header.trace_id == 0 {
        tracing::info!("No trace was active in {}", dump_path.display());
        return Ok(None);
    }

    let maps = read_memory_maps(dump_path, &header.memory_maps_file());
    let key_packets = packets_for(BYTES_HEADER_SIZE + MEMORY_MAPPING_KEY.len());
    let map_packets: usize = maps
        .iter()
        .map(|line| {
            1 + key_packets + packets_for(BYTES_HEADER_SIZE + line.len().min(MAX_BYTES_PAYLOAD))
        })
        .sum();
    let buffer = Buffer::anonymous(snapshot.packets.len() + map_packets + 2)?;
    let ring = buffer.ring();
    let logger = buffer.logger();
    let start = ring.current_head();
    let timestamp = monotonic_time();

    write_lifecycle(&logger, EntryType::TRACE_START, header.trace_id, timestamp);
    let mut replayed = 0usize;
    for entry in snapshot.entries() {
        // The dead session's own sentinels would close the replay early.
        if matches!(&entry, Entry::Standard(e) if e.kind.is_lifecycle()) {
            continue;
        }
        match entry.to_bytes() {
            Ok(bytes) => {
                write_payload(ring, &bytes);
                replayed += 1;
            }
            Err(e) => tracing::debug!("Skipping {} entry: {}", entry.kind(), e),
        }
    }
    write_memory_mappings(&logger, &maps, timestamp);
    write_lifecycle(&logger, EntryType::TRACE_END, header.trace_id, timestamp);

    let mut config = config.clone();
    config
        .headers
        .push(("session_id".to_string(), header.session_id()));
    config
        .headers
        .push(("config_id".to_string(), header.config_id.to_string()));
    config
        .headers
        .push(("providers".to_string(), header.providers.to_string()));
    config
        .headers
        .push(("long_context".to_string(), header.long_context.to_string()));

    tracing::info!(
        "Recovering trace {} from {} ({} entries)",
        header.trace_id,
        dump_path.display(),
        replayed
    );
    TraceWriter::process_trace(&config, &buffer, callbacks, start, header.trace_id);
    Ok(Some(header.trace_id))
}
