//! Session summaries decoded from the ring buffer
//!
//! Aggregates the entries written during one session into per-thread sample
//! counts, error tallies and the error annotations, for printing as text or
//! JSON.
//!
//! # Architecture
//!
//! ```text
//! RingBuffer ──► TraceReader ──► ParsedEntry ──► SessionReport::record()
//!                                                      │
//!                                         Display / serde_json
//! ```

use crate::buffer::{Cursor, RingBuffer, TraceReader};
use crate::entries::ParsedEntry;
use serde::Serialize;
use sigsampler_common::{annotations, EntryType};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Stack samples attributed to one thread
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ThreadSamples {
    pub samples: usize,
    /// Deepest stack seen
    pub max_depth: usize,
    /// Samples logged as `STKERR_*` instead of frames
    pub errors: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionReport {
    pub entries: usize,
    /// Packets lost to overwrite before they could be read
    pub skipped_packets: u64,
    pub threads: BTreeMap<u32, ThreadSamples>,
    /// Error entries by type name
    pub errors: BTreeMap<&'static str, usize>,
    /// Error annotations by key name, as written at stop
    pub annotations: BTreeMap<&'static str, i64>,
    pub framework_frames: Vec<String>,
}

impl SessionReport {
    /// Read everything from `from` up to the current tail of `buffer`
    pub fn collect(buffer: Arc<RingBuffer>, from: Cursor) -> Self {
        let mut reader = TraceReader::new(buffer, from);
        let mut report = SessionReport::default();
        for entry in reader.drain_entries() {
            report.record(&entry);
        }
        report.skipped_packets = reader.skipped_packets();
        report
    }

    pub fn record(&mut self, entry: &ParsedEntry) {
        self.entries += 1;
        match entry {
            ParsedEntry::Frames(frames) => {
                let tid = u32::try_from(frames.tid).unwrap_or_default();
                let thread = self.threads.entry(tid).or_default();
                if is_sample(frames.entry_type) {
                    thread.samples += 1;
                    thread.max_depth = thread.max_depth.max(frames.frames.len());
                }
            }
            ParsedEntry::Standard(standard) if is_stack_error(standard.entry_type) => {
                let tid = u32::try_from(standard.tid).unwrap_or_default();
                self.threads.entry(tid).or_default().errors += 1;
                *self.errors.entry(standard.entry_type.name()).or_default() += 1;
            }
            ParsedEntry::Standard(standard) if standard.entry_type == EntryType::TraceAnnotation => {
                if let Some(key) = annotation_name(standard.callid) {
                    self.annotations.insert(key, standard.extra);
                }
            }
            ParsedEntry::Bytes(bytes) if bytes.entry_type == EntryType::JavaFrameName => {
                self.framework_frames.push(String::from_utf8_lossy(&bytes.bytes).into_owned());
            }
            ParsedEntry::Standard(_) | ParsedEntry::Bytes(_) => {}
        }
    }

    pub fn total_samples(&self) -> usize {
        self.threads.values().map(|t| t.samples).sum()
    }

    /// Attach thread names, e.g. from `/proc/self/task/<tid>/comm`
    pub fn name_threads(&mut self, mut lookup: impl FnMut(u32) -> Option<String>) {
        for (tid, thread) in &mut self.threads {
            thread.name = lookup(*tid);
        }
    }
}

fn is_sample(entry_type: EntryType) -> bool {
    matches!(entry_type, EntryType::StackFrame | EntryType::JavascriptStackFrame)
}

fn is_stack_error(entry_type: EntryType) -> bool {
    matches!(
        entry_type,
        EntryType::StkerrEmptyStack
            | EntryType::StkerrStackOverflow
            | EntryType::StkerrNoStackForThread
            | EntryType::StkerrSignalInterrupt
            | EntryType::StkerrNestedUnwind
    )
}

fn annotation_name(key: i32) -> Option<&'static str> {
    match key {
        annotations::PROF_ERR_SIG_CRASHES => Some("sig_crashes"),
        annotations::PROF_ERR_SLOT_MISSES => Some("slot_misses"),
        annotations::PROF_ERR_STACK_OVERFLOWS => Some("stack_overflows"),
        _ => None,
    }
}

impl fmt::Display for SessionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} samples in {} entries", self.total_samples(), self.entries)?;
        if self.skipped_packets > 0 {
            writeln!(f, "  ({} packets overwritten before read)", self.skipped_packets)?;
        }

        writeln!(f, "\nTHREADS")?;
        for (tid, thread) in &self.threads {
            let name = thread.name.as_deref().unwrap_or("?");
            writeln!(
                f,
                "  {tid:>8}  {name:<16} {:>6} samples  depth<={:<4} {} errors",
                thread.samples, thread.max_depth, thread.errors
            )?;
        }

        if !self.errors.is_empty() {
            writeln!(f, "\nSTACK ERRORS")?;
            for (kind, count) in &self.errors {
                writeln!(f, "  {kind:<26} {count}")?;
            }
        }

        writeln!(f, "\nANNOTATIONS")?;
        for (key, value) in &self.annotations {
            writeln!(f, "  {key:<16} {value}")?;
        }
        Ok(())
    }
}
