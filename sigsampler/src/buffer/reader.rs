//! Reassembles logical payloads from the packet ring

use super::ring_buffer::{Cursor, ReadOutcome, RingBuffer};
use crate::domain::ParseError;
use crate::entries::{parse_entry, ParsedEntry};
use log::debug;
use std::collections::HashMap;
use std::sync::Arc;

/// Walks the ring from a cursor, regrouping interleaved packet chains
///
/// A chain whose start packet was overwritten is never surfaced: its
/// continuation packets are orphans and get skipped. When the reader falls
/// behind the writers it jumps to the oldest surviving position and drops
/// every partially assembled chain.
pub struct TraceReader {
    buffer: Arc<RingBuffer>,
    cursor: Cursor,
    partial: HashMap<u32, Vec<u8>>,
    skipped: u64,
}

impl TraceReader {
    pub fn new(buffer: Arc<RingBuffer>, from: Cursor) -> Self {
        TraceReader { buffer, cursor: from, partial: HashMap::new(), skipped: 0 }
    }

    /// Position of the next packet to inspect
    pub fn cursor(&self) -> Cursor {
        self.cursor
    }

    /// Packets lost to overwrites so far
    pub fn skipped_packets(&self) -> u64 {
        self.skipped
    }

    /// Next complete payload, `None` once caught up with the writers
    pub fn next_payload(&mut self) -> Option<Vec<u8>> {
        loop {
            match self.buffer.read(self.cursor) {
                ReadOutcome::Pending => return None,
                ReadOutcome::Overwritten => {
                    let head = self.buffer.current_head().max(self.cursor.next());
                    self.skipped += head.ticket() - self.cursor.ticket();
                    debug!(
                        "Reader overrun: skipping {} packets, dropping {} partial chains",
                        head.ticket() - self.cursor.ticket(),
                        self.partial.len()
                    );
                    self.partial.clear();
                    self.cursor = head;
                }
                ReadOutcome::Ready(packet) => {
                    self.cursor = self.cursor.next();

                    if packet.is_start() {
                        if !packet.has_next() {
                            return Some(packet.payload().to_vec());
                        }
                        self.partial.insert(packet.stream_id, packet.payload().to_vec());
                        continue;
                    }

                    let Some(chain) = self.partial.get_mut(&packet.stream_id) else {
                        continue;
                    };
                    chain.extend_from_slice(packet.payload());
                    if !packet.has_next() {
                        return self.partial.remove(&packet.stream_id);
                    }
                }
            }
        }
    }

    /// Next decoded entry
    pub fn next_entry(&mut self) -> Option<Result<ParsedEntry, ParseError>> {
        self.next_payload().map(|payload| parse_entry(&payload))
    }

    /// Decode everything currently readable, skipping malformed payloads
    pub fn drain_entries(&mut self) -> Vec<ParsedEntry> {
        let mut entries = Vec::new();
        while let Some(result) = self.next_entry() {
            match result {
                Ok(entry) => entries.push(entry),
                Err(e) => debug!("Skipping malformed entry: {e}"),
            }
        }
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::PacketLogger;
    use sigsampler_common::Packet;

    #[test]
    fn test_interleaved_streams() {
        let ring = Arc::new(RingBuffer::new(32));
        let start = ring.current_tail();

        let chunk = |stream_id, first, more, byte: u8| {
            let mut p = Packet { stream_id, start: u8::from(first), next: u8::from(more), size: 1, ..Packet::default() };
            p.data[0] = byte;
            p
        };
        ring.write(&chunk(1, true, true, b'a'));
        ring.write(&chunk(2, true, true, b'x'));
        ring.write(&chunk(1, false, false, b'b'));
        ring.write(&chunk(2, false, false, b'y'));

        let mut reader = TraceReader::new(Arc::clone(&ring), start);
        assert_eq!(reader.next_payload().as_deref(), Some(&b"ab"[..]));
        assert_eq!(reader.next_payload().as_deref(), Some(&b"xy"[..]));
        assert_eq!(reader.next_payload(), None);
    }

    #[test]
    fn test_overwritten_start_is_dropped() {
        let ring = Arc::new(RingBuffer::new(4));
        let logger = PacketLogger::new(Arc::clone(&ring));
        let start = ring.current_tail();

        // 3 packets, then 3 single-packet writes: the first chain loses its start
        logger.write(&[1u8; 150]).unwrap();
        for byte in [7u8, 8, 9] {
            logger.write(&[byte]).unwrap();
        }

        let mut reader = TraceReader::new(Arc::clone(&ring), start);
        let mut payloads = Vec::new();
        while let Some(payload) = reader.next_payload() {
            payloads.push(payload);
        }
        assert_eq!(payloads, vec![vec![7u8], vec![8], vec![9]]);
        assert!(reader.skipped_packets() >= 2);
    }

    #[test]
    fn test_resumes_after_new_writes() {
        let ring = Arc::new(RingBuffer::new(16));
        let logger = PacketLogger::new(Arc::clone(&ring));
        let mut reader = TraceReader::new(Arc::clone(&ring), ring.current_tail());

        assert_eq!(reader.next_payload(), None);
        logger.write(b"late").unwrap();
        assert_eq!(reader.next_payload().as_deref(), Some(&b"late"[..]));
    }
}
