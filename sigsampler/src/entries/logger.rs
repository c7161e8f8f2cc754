//! Entry logger: id assignment, packing, hand-off to the packet logger
//!
//! All write paths pack into a stack array and never allocate or lock, so
//! tracers may call them from the sampling signal handler.

#![allow(unsafe_code)] // write_bytes_raw takes a raw pointer

use super::entry::{BytesEntry, Entry, FramesEntry, StandardEntry, MAX_ENTRY_SIZE};
use super::id_counter::EntryIdCounter;
use crate::buffer::{Cursor, PacketLogger, RingBuffer};
use crate::domain::WriteError;
use crate::os;
use sigsampler_common::{EntryType, MAX_VARIABLE_LENGTH_ENTRY};
use std::sync::Arc;

pub struct Logger {
    packets: PacketLogger,
    ids: EntryIdCounter,
}

impl Logger {
    pub fn new(buffer: Arc<RingBuffer>) -> Self {
        Logger { packets: PacketLogger::new(buffer), ids: EntryIdCounter::default() }
    }

    pub fn buffer(&self) -> &Arc<RingBuffer> {
        self.packets.buffer()
    }

    /// Reserve an id without writing anything
    pub fn next_id(&self) -> i32 {
        self.ids.next()
    }

    /// Write an entry, assigning a fresh id if `entry.id() == 0`
    pub fn write(&self, entry: Entry<'_>) -> Result<i32, WriteError> {
        self.write_and_get_cursor(entry).map(|(id, _)| id)
    }

    /// # Errors
    /// Oversized or empty payloads are rejected before an id is assigned
    pub fn write_and_get_cursor(&self, entry: Entry<'_>) -> Result<(i32, Cursor), WriteError> {
        entry.validate()?;
        let entry = if entry.id() == 0 { entry.with_id(self.ids.next()) } else { entry };

        let mut scratch = [0u8; MAX_ENTRY_SIZE];
        let len = entry.pack(&mut scratch).ok_or(WriteError::Overflow {
            len: entry.calculate_size(),
            max: MAX_ENTRY_SIZE,
        })?;
        let cursor = self.packets.write_and_get_cursor(&scratch[..len])?;
        Ok((entry.id(), cursor))
    }

    /// Write a bytes entry linked to `matchid`
    pub fn write_bytes(&self, entry_type: EntryType, matchid: i32, data: &[u8]) -> Result<i32, WriteError> {
        self.write(Entry::Bytes(BytesEntry { id: 0, entry_type, matchid, bytes: data }))
    }

    /// [`Logger::write_bytes`] for callers holding a raw pointer
    ///
    /// # Safety
    ///
    /// If `data` is non-null it must be valid for reads of `len` bytes.
    pub unsafe fn write_bytes_raw(
        &self,
        entry_type: EntryType,
        matchid: i32,
        data: *const u8,
        len: usize,
    ) -> Result<i32, WriteError> {
        if data.is_null() {
            return Err(WriteError::InvalidArgument("null bytes pointer"));
        }
        if len > MAX_VARIABLE_LENGTH_ENTRY {
            return Err(WriteError::Overflow { len, max: MAX_VARIABLE_LENGTH_ENTRY });
        }
        // SAFETY: non-null and valid for len bytes per the caller contract
        let data = unsafe { std::slice::from_raw_parts(data, len) };
        self.write_bytes(entry_type, matchid, data)
    }

    /// Write one captured stack; failures are dropped
    pub fn write_stack_frames(&self, tid: u32, time: i64, frames: &[i64], entry_type: EntryType) {
        #[allow(clippy::cast_possible_wrap)]
        let entry = Entry::Frames(FramesEntry { id: 0, entry_type, timestamp: time, tid: tid as i32, frames });
        let _ = self.write(entry);
    }

    /// Write a key/value annotation stamped with the calling thread and now
    pub fn write_trace_annotation(&self, key: i32, value: i64) -> Result<i32, WriteError> {
        #[allow(clippy::cast_possible_wrap)]
        let tid = os::thread_id() as i32;
        self.write(Entry::Standard(StandardEntry {
            id: 0,
            entry_type: EntryType::TraceAnnotation,
            timestamp: os::monotonic_time_ns(),
            tid,
            callid: key,
            matchid: 0,
            extra: value,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::TraceReader;
    use crate::entries::ParsedEntry;
    use sigsampler_common::MAX_STACK_DEPTH;

    fn logger() -> Logger {
        Logger::new(Arc::new(RingBuffer::new(256)))
    }

    #[test]
    fn test_bytes_boundaries() {
        let logger = logger();
        assert!(matches!(
            logger.write_bytes(EntryType::StringValue, 0, &[]),
            Err(WriteError::InvalidArgument(_))
        ));
        assert!(logger.write_bytes(EntryType::StringValue, 0, &[7; 1024]).is_ok());
        assert_eq!(
            logger.write_bytes(EntryType::StringValue, 0, &[7; 1025]),
            Err(WriteError::Overflow { len: 1025, max: 1024 })
        );
    }

    #[test]
    fn test_generic_write_rejects_oversized_payloads() {
        let logger = logger();
        let tail = logger.buffer().current_tail();

        let bytes = [9u8; 2000];
        let result = logger.write(Entry::Bytes(BytesEntry { id: 0, entry_type: EntryType::StringValue, matchid: 0, bytes: &bytes }));
        assert_eq!(result, Err(WriteError::Overflow { len: 2000, max: MAX_VARIABLE_LENGTH_ENTRY }));

        let frames: Vec<i64> = (0..200).collect();
        let result = logger.write(Entry::Frames(FramesEntry {
            id: 0,
            entry_type: EntryType::StackFrame,
            timestamp: 1,
            tid: 2,
            frames: &frames,
        }));
        assert_eq!(result, Err(WriteError::Overflow { len: 200, max: MAX_STACK_DEPTH }));

        let result = logger.write(Entry::Bytes(BytesEntry { id: 0, entry_type: EntryType::StringValue, matchid: 0, bytes: &[] }));
        assert!(matches!(result, Err(WriteError::InvalidArgument(_))));

        assert_eq!(logger.buffer().current_tail(), tail);
        assert_eq!(logger.next_id(), 512);
    }

    #[test]
    fn test_full_depth_stack_accepted() {
        let logger = logger();
        let start = logger.buffer().current_tail();
        let frames: Vec<i64> = (0..128).collect();
        logger.write_stack_frames(7, 1, &frames, EntryType::StackFrame);

        let mut reader = TraceReader::new(Arc::clone(logger.buffer()), start);
        match reader.next_entry() {
            Some(Ok(ParsedEntry::Frames(entry))) => assert_eq!(entry.frames.len(), MAX_STACK_DEPTH),
            other => panic!("unexpected entry: {other:?}"),
        }
    }

    #[test]
    fn test_raw_null_rejected() {
        let logger = logger();
        let tail = logger.buffer().current_tail();
        // SAFETY: null is checked before any read
        let result = unsafe { logger.write_bytes_raw(EntryType::StringValue, 0, std::ptr::null(), 4) };
        assert!(matches!(result, Err(WriteError::InvalidArgument(_))));
        assert_eq!(logger.buffer().current_tail(), tail);
    }

    #[test]
    fn test_assigns_ids_only_when_zero() {
        let logger = logger();
        let standard = StandardEntry {
            id: 0,
            entry_type: EntryType::Counter,
            timestamp: 1,
            tid: 2,
            callid: 3,
            matchid: 4,
            extra: 5,
        };
        let fresh = logger.write(Entry::Standard(standard)).unwrap();
        assert_eq!(fresh, 512);
        let kept = logger.write(Entry::Standard(StandardEntry { id: 77, ..standard })).unwrap();
        assert_eq!(kept, 77);
    }

    #[test]
    fn test_annotation_fields() {
        let logger = logger();
        let start = logger.buffer().current_tail();
        let id = logger.write_trace_annotation(8_126_470, 3).unwrap();

        let mut reader = TraceReader::new(Arc::clone(logger.buffer()), start);
        match reader.next_entry() {
            Some(Ok(ParsedEntry::Standard(entry))) => {
                assert_eq!(entry.id, id);
                assert_eq!(entry.entry_type, EntryType::TraceAnnotation);
                assert_eq!(entry.callid, 8_126_470);
                assert_eq!(entry.extra, 3);
                #[allow(clippy::cast_possible_wrap)]
                let tid = os::thread_id() as i32;
                assert_eq!(entry.tid, tid);
            }
            other => panic!("unexpected entry: {other:?}"),
        }
    }

    #[test]
    fn test_stack_frames_spanning_packets() {
        let logger = logger();
        let start = logger.buffer().current_tail();
        let frames: Vec<i64> = (1..=20).collect();
        logger.write_stack_frames(42, 1_000, &frames, EntryType::StackFrame);

        let mut reader = TraceReader::new(Arc::clone(logger.buffer()), start);
        match reader.next_entry() {
            Some(Ok(ParsedEntry::Frames(entry))) => {
                assert_eq!(entry.tid, 42);
                assert_eq!(entry.timestamp, 1_000);
                assert_eq!(entry.frames, frames);
            }
            other => panic!("unexpected entry: {other:?}"),
        }
    }
}
