//! Entry records and their packed wire encoding
//!
//! Every payload starts with a one-byte serialization kind, then fields in
//! little-endian order with no padding:
//!
//! ```text
//! Standard: kind(1) id(4) type(1) timestamp(8) tid(4) callid(4) matchid(4) extra(8)
//! Frames:   kind(1) id(4) type(1) timestamp(8) tid(4) depth(1) frames(8 * depth)
//! Bytes:    kind(1) id(4) type(1) matchid(4) len(2) bytes(len)
//! ```
//!
//! Packing writes into a caller-provided buffer so the signal path can use a
//! stack array of [`MAX_ENTRY_SIZE`] bytes.

use crate::domain::WriteError;
use sigsampler_common::{EntryType, MAX_STACK_DEPTH, MAX_VARIABLE_LENGTH_ENTRY};

/// Serialization kind byte leading every payload
pub mod kind {
    pub const STANDARD: u8 = 1;
    pub const FRAMES: u8 = 2;
    pub const BYTES: u8 = 3;
}

pub const STANDARD_ENTRY_SIZE: usize = 1 + 4 + 1 + 8 + 4 + 4 + 4 + 8;
pub const FRAMES_HEADER_SIZE: usize = 1 + 4 + 1 + 8 + 4 + 1;
pub const BYTES_HEADER_SIZE: usize = 1 + 4 + 1 + 4 + 2;

/// Upper bound of any packed entry
pub const MAX_ENTRY_SIZE: usize = {
    let frames = FRAMES_HEADER_SIZE + 8 * MAX_STACK_DEPTH;
    let bytes = BYTES_HEADER_SIZE + MAX_VARIABLE_LENGTH_ENTRY;
    if frames > bytes {
        frames
    } else {
        bytes
    }
};

/// Fixed-shape event record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StandardEntry {
    pub id: i32,
    pub entry_type: EntryType,
    pub timestamp: i64,
    pub tid: i32,
    pub callid: i32,
    pub matchid: i32,
    pub extra: i64,
}

/// One captured stack, innermost frame first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramesEntry<'a> {
    pub id: i32,
    pub entry_type: EntryType,
    pub timestamp: i64,
    pub tid: i32,
    pub frames: &'a [i64],
}

/// Opaque blob linked to another entry through `matchid`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BytesEntry<'a> {
    pub id: i32,
    pub entry_type: EntryType,
    pub matchid: i32,
    pub bytes: &'a [u8],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entry<'a> {
    Standard(StandardEntry),
    Frames(FramesEntry<'a>),
    Bytes(BytesEntry<'a>),
}

impl<'a> Entry<'a> {
    #[must_use]
    pub fn id(&self) -> i32 {
        match self {
            Entry::Standard(e) => e.id,
            Entry::Frames(e) => e.id,
            Entry::Bytes(e) => e.id,
        }
    }

    #[must_use]
    pub fn with_id(self, id: i32) -> Entry<'a> {
        match self {
            Entry::Standard(e) => Entry::Standard(StandardEntry { id, ..e }),
            Entry::Frames(e) => Entry::Frames(FramesEntry { id, ..e }),
            Entry::Bytes(e) => Entry::Bytes(BytesEntry { id, ..e }),
        }
    }

    /// Exact packed size of this entry
    #[must_use]
    pub fn calculate_size(&self) -> usize {
        match self {
            Entry::Standard(_) => STANDARD_ENTRY_SIZE,
            Entry::Frames(e) => FRAMES_HEADER_SIZE + 8 * e.frames.len(),
            Entry::Bytes(e) => BYTES_HEADER_SIZE + e.bytes.len(),
        }
    }

    /// Check the variable-length payload against the wire limits
    ///
    /// # Errors
    /// `Overflow` for more than `MAX_STACK_DEPTH` frames or more than
    /// `MAX_VARIABLE_LENGTH_ENTRY` bytes, `InvalidArgument` for empty bytes
    pub fn validate(&self) -> Result<(), WriteError> {
        match self {
            Entry::Standard(_) => Ok(()),
            Entry::Frames(e) if e.frames.len() > MAX_STACK_DEPTH => {
                Err(WriteError::Overflow { len: e.frames.len(), max: MAX_STACK_DEPTH })
            }
            Entry::Frames(_) => Ok(()),
            Entry::Bytes(e) if e.bytes.is_empty() => Err(WriteError::InvalidArgument("empty bytes entry")),
            Entry::Bytes(e) if e.bytes.len() > MAX_VARIABLE_LENGTH_ENTRY => {
                Err(WriteError::Overflow { len: e.bytes.len(), max: MAX_VARIABLE_LENGTH_ENTRY })
            }
            Entry::Bytes(_) => Ok(()),
        }
    }

    /// Pack into `out`, returning the number of bytes written
    ///
    /// Returns `None` when `out` is shorter than [`Entry::calculate_size`]
    /// or the entry fails [`Entry::validate`].
    pub fn pack(&self, out: &mut [u8]) -> Option<usize> {
        let size = self.calculate_size();
        if out.len() < size || self.validate().is_err() {
            return None;
        }

        let mut w = WireWriter { buf: out, pos: 0 };
        match self {
            Entry::Standard(e) => {
                w.put_u8(kind::STANDARD);
                w.put_i32(e.id);
                w.put_u8(e.entry_type as u8);
                w.put_i64(e.timestamp);
                w.put_i32(e.tid);
                w.put_i32(e.callid);
                w.put_i32(e.matchid);
                w.put_i64(e.extra);
            }
            Entry::Frames(e) => {
                let frames = e.frames;
                w.put_u8(kind::FRAMES);
                w.put_i32(e.id);
                w.put_u8(e.entry_type as u8);
                w.put_i64(e.timestamp);
                w.put_i32(e.tid);
                #[allow(clippy::cast_possible_truncation)]
                w.put_u8(frames.len() as u8);
                for frame in frames {
                    w.put_i64(*frame);
                }
            }
            Entry::Bytes(e) => {
                let bytes = e.bytes;
                w.put_u8(kind::BYTES);
                w.put_i32(e.id);
                w.put_u8(e.entry_type as u8);
                w.put_i32(e.matchid);
                #[allow(clippy::cast_possible_truncation)]
                w.put_u16(bytes.len() as u16);
                w.put_slice(bytes);
            }
        }

        debug_assert_eq!(w.pos, size);
        Some(w.pos)
    }
}

struct WireWriter<'b> {
    buf: &'b mut [u8],
    pos: usize,
}

impl WireWriter<'_> {
    fn put_slice(&mut self, bytes: &[u8]) {
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
    }

    fn put_u8(&mut self, v: u8) {
        self.put_slice(&[v]);
    }

    fn put_u16(&mut self, v: u16) {
        self.put_slice(&v.to_le_bytes());
    }

    fn put_i32(&mut self, v: i32) {
        self.put_slice(&v.to_le_bytes());
    }

    fn put_i64(&mut self, v: i64) {
        self.put_slice(&v.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_entry_size_covers_largest_frames() {
        assert_eq!(MAX_ENTRY_SIZE, FRAMES_HEADER_SIZE + 8 * MAX_STACK_DEPTH);
        assert!(MAX_ENTRY_SIZE >= BYTES_HEADER_SIZE + MAX_VARIABLE_LENGTH_ENTRY);
    }

    #[test]
    fn test_standard_layout() {
        let entry = Entry::Standard(StandardEntry {
            id: 0x0102_0304,
            entry_type: EntryType::TraceAnnotation,
            timestamp: 7,
            tid: 99,
            callid: 5,
            matchid: 6,
            extra: -1,
        });
        let mut out = [0u8; STANDARD_ENTRY_SIZE];
        assert_eq!(entry.pack(&mut out), Some(34));
        assert_eq!(out[0], kind::STANDARD);
        assert_eq!(&out[1..5], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(out[5], EntryType::TraceAnnotation as u8);
        assert_eq!(&out[26..34], &[0xff; 8]);
    }

    #[test]
    fn test_pack_rejects_short_buffer() {
        let frames = [1i64, 2, 3];
        let entry = Entry::Frames(FramesEntry {
            id: 1,
            entry_type: EntryType::StackFrame,
            timestamp: 0,
            tid: 1,
            frames: &frames,
        });
        assert_eq!(entry.calculate_size(), FRAMES_HEADER_SIZE + 24);
        let mut short = [0u8; FRAMES_HEADER_SIZE];
        assert_eq!(entry.pack(&mut short), None);
    }

    #[test]
    fn test_with_id_keeps_payload() {
        let entry = Entry::Bytes(BytesEntry { id: 0, entry_type: EntryType::StringValue, matchid: 3, bytes: b"x" });
        let stamped = entry.with_id(42);
        assert_eq!(stamped.id(), 42);
        assert_eq!(stamped.calculate_size(), entry.calculate_size());
    }
}
