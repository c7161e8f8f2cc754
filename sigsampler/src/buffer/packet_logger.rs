//! Splits logical writes into ring buffer packets

use super::ring_buffer::{Cursor, RingBuffer};
use crate::domain::WriteError;
use sigsampler_common::{Packet, PACKET_DATA_SIZE};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Chunks payloads into packets tagged with a per-write stream id
///
/// Safe to call from signal handlers: no allocation, no locks. Packets of
/// concurrent writes interleave in the ring; readers regroup them by
/// `stream_id`.
pub struct PacketLogger {
    buffer: Arc<RingBuffer>,
    next_stream_id: AtomicU32,
}

impl PacketLogger {
    pub fn new(buffer: Arc<RingBuffer>) -> Self {
        PacketLogger { buffer, next_stream_id: AtomicU32::new(0) }
    }

    pub fn buffer(&self) -> &Arc<RingBuffer> {
        &self.buffer
    }

    pub fn write(&self, payload: &[u8]) -> Result<(), WriteError> {
        self.write_and_get_cursor(payload).map(|_| ())
    }

    /// Write `payload` and return the cursor of its first packet
    pub fn write_and_get_cursor(&self, payload: &[u8]) -> Result<Cursor, WriteError> {
        if payload.is_empty() {
            return Err(WriteError::InvalidArgument("empty packet payload"));
        }

        let stream_id = self.next_stream_id.fetch_add(1, Ordering::Relaxed);
        let mut chunks = payload.chunks(PACKET_DATA_SIZE).peekable();
        let mut first = None;
        let mut start = true;

        while let Some(chunk) = chunks.next() {
            #[allow(clippy::cast_possible_truncation)]
            let size = chunk.len() as u8;
            let mut packet = Packet {
                stream_id,
                start: u8::from(start),
                next: u8::from(chunks.peek().is_some()),
                size,
                ..Packet::default()
            };
            packet.data[..chunk.len()].copy_from_slice(chunk);

            let cursor = self.buffer.write_and_get_cursor(&packet);
            first.get_or_insert(cursor);
            start = false;
        }

        first.ok_or(WriteError::InvalidArgument("empty packet payload"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect_packets(ring: &RingBuffer, from: Cursor) -> Vec<Packet> {
        let mut out = Vec::new();
        let mut cursor = from;
        while let Some(packet) = ring.try_read(cursor) {
            out.push(packet);
            cursor = cursor.next();
        }
        out
    }

    #[test]
    fn test_empty_payload_rejected() {
        let logger = PacketLogger::new(Arc::new(RingBuffer::new(16)));
        assert!(matches!(logger.write(&[]), Err(WriteError::InvalidArgument(_))));
        assert_eq!(logger.buffer().current_tail().ticket(), 0);
    }

    #[test]
    fn test_chunking_round_trip() {
        for len in [1usize, 56, 57, 112, 113, 560] {
            let ring = Arc::new(RingBuffer::new(64));
            let logger = PacketLogger::new(Arc::clone(&ring));
            let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();

            let cursor = logger.write_and_get_cursor(&payload).unwrap();
            let packets = collect_packets(&ring, cursor);

            assert_eq!(packets.len(), len.div_ceil(PACKET_DATA_SIZE), "len {len}");
            assert!(packets[0].is_start());
            assert!(packets[1..].iter().all(|p| !p.is_start()));
            assert!(!packets.last().unwrap().has_next());
            assert!(packets[..packets.len() - 1].iter().all(Packet::has_next));
            assert!(packets.iter().all(|p| p.stream_id == packets[0].stream_id));

            let joined: Vec<u8> = packets.iter().flat_map(|p| p.payload().to_vec()).collect();
            assert_eq!(joined, payload, "len {len}");
        }
    }

    #[test]
    fn test_stream_ids_are_distinct() {
        let ring = Arc::new(RingBuffer::new(16));
        let logger = PacketLogger::new(Arc::clone(&ring));
        let a = logger.write_and_get_cursor(b"first").unwrap();
        let b = logger.write_and_get_cursor(b"second").unwrap();
        assert_ne!(ring.try_read(a).unwrap().stream_id, ring.try_read(b).unwrap().stream_id);
    }
}
