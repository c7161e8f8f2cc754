//! Typed entries on top of the packet layer
//!
//! - `entry`: entry variants and their packed wire encoding
//! - `id_counter`: wraparound-safe id generator
//! - `logger`: signal-safe writer used by tracers and the sampling coordinator
//! - `parser`: decoding for readers and tests

pub mod entry;
pub mod id_counter;
pub mod logger;
pub mod parser;

pub use entry::{BytesEntry, Entry, FramesEntry, StandardEntry, MAX_ENTRY_SIZE};
pub use id_counter::EntryIdCounter;
pub use logger::Logger;
pub use parser::{parse_entry, ParsedBytes, ParsedEntry, ParsedFrames};
