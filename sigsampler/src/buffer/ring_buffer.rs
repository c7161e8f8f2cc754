//! Fixed-capacity packet ring with lock-free append
//!
//! Writers claim a ticket with one `fetch_add` and copy their packet into slot
//! `ticket % capacity`. Every slot carries a sequence word: `2 * turn + 1`
//! while turn `turn` is being written, `2 * turn + 2` once it is complete. A
//! reader holding a [`Cursor`] knows which turn it expects and checks the
//! sequence before and after copying, so a slot that was overwritten (or is
//! mid-write) is reported instead of returned as data.
//!
//! Packets are stored as eight `AtomicU64` words, which keeps the racy copy
//! free of undefined behaviour.

use sigsampler_common::{Packet, PACKET_SIZE};
use std::sync::atomic::{fence, AtomicU64, Ordering};

const WORDS_PER_PACKET: usize = PACKET_SIZE / 8;

/// Absolute position in the ring
///
/// Cursors never wrap in practice (64-bit tickets); the slot index is derived
/// from the ticket modulo the capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Cursor(u64);

impl Cursor {
    #[must_use]
    pub const fn from_ticket(ticket: u64) -> Self {
        Cursor(ticket)
    }

    #[must_use]
    pub const fn ticket(self) -> u64 {
        self.0
    }

    /// The position right after this one
    #[must_use]
    pub const fn next(self) -> Self {
        Cursor(self.0 + 1)
    }
}

/// Outcome of reading one position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    Ready(Packet),
    /// Not written yet, or a writer is still copying into it
    Pending,
    /// A later turn has replaced the packet
    Overwritten,
}

struct Slot {
    seq: AtomicU64,
    words: [AtomicU64; WORDS_PER_PACKET],
}

impl Slot {
    fn new() -> Self {
        Slot { seq: AtomicU64::new(0), words: std::array::from_fn(|_| AtomicU64::new(0)) }
    }
}

pub struct RingBuffer {
    slots: Box<[Slot]>,
    tail: AtomicU64,
}

impl RingBuffer {
    /// Create a ring holding `capacity` packets
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring buffer capacity must be non-zero");
        let slots = (0..capacity).map(|_| Slot::new()).collect::<Vec<_>>().into_boxed_slice();
        RingBuffer { slots, tail: AtomicU64::new(0) }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Position the next write will occupy
    #[must_use]
    pub fn current_tail(&self) -> Cursor {
        Cursor(self.tail.load(Ordering::Acquire))
    }

    /// Oldest position that may still hold its original packet
    #[must_use]
    pub fn current_head(&self) -> Cursor {
        let tail = self.tail.load(Ordering::Acquire);
        Cursor(tail.saturating_sub(self.slots.len() as u64))
    }

    /// Append a packet; signal-safe, never blocks
    pub fn write(&self, packet: &Packet) {
        self.write_and_get_cursor(packet);
    }

    /// Append a packet and return the position it landed at
    pub fn write_and_get_cursor(&self, packet: &Packet) -> Cursor {
        let ticket = self.tail.fetch_add(1, Ordering::AcqRel);
        let (index, turn) = self.locate(ticket);
        let slot = &self.slots[index];

        slot.seq.store(2 * turn + 1, Ordering::Relaxed);
        fence(Ordering::Release);

        let bytes = packet.to_bytes();
        for (word, chunk) in slot.words.iter().zip(bytes.chunks_exact(8)) {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(chunk);
            word.store(u64::from_ne_bytes(raw), Ordering::Relaxed);
        }

        slot.seq.store(2 * turn + 2, Ordering::Release);
        Cursor(ticket)
    }

    /// Read the packet at `cursor`, `None` if it is not (or no longer) there
    #[must_use]
    pub fn try_read(&self, cursor: Cursor) -> Option<Packet> {
        match self.read(cursor) {
            ReadOutcome::Ready(packet) => Some(packet),
            ReadOutcome::Pending | ReadOutcome::Overwritten => None,
        }
    }

    /// Read the packet at `cursor`, telling apart "not yet" from "too late"
    #[must_use]
    pub fn read(&self, cursor: Cursor) -> ReadOutcome {
        let tail = self.tail.load(Ordering::Acquire);
        if cursor.0 >= tail {
            return ReadOutcome::Pending;
        }

        let (index, turn) = self.locate(cursor.0);
        let slot = &self.slots[index];
        let complete = 2 * turn + 2;

        let before = slot.seq.load(Ordering::Acquire);
        if before < complete {
            return ReadOutcome::Pending;
        }
        if before > complete {
            return ReadOutcome::Overwritten;
        }

        let mut bytes = [0u8; PACKET_SIZE];
        for (word, chunk) in slot.words.iter().zip(bytes.chunks_exact_mut(8)) {
            chunk.copy_from_slice(&word.load(Ordering::Relaxed).to_ne_bytes());
        }

        fence(Ordering::Acquire);
        if slot.seq.load(Ordering::Relaxed) != before {
            return ReadOutcome::Overwritten;
        }

        ReadOutcome::Ready(Packet::from_bytes(&bytes))
    }

    fn locate(&self, ticket: u64) -> (usize, u64) {
        let capacity = self.slots.len() as u64;
        #[allow(clippy::cast_possible_truncation)]
        let index = (ticket % capacity) as usize;
        (index, ticket / capacity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn packet(stream_id: u32, fill: u8) -> Packet {
        Packet { stream_id, start: 1, size: 56, data: [fill; 56], ..Packet::default() }
    }

    #[test]
    fn test_write_then_read() {
        let ring = RingBuffer::new(8);
        let start = ring.current_tail();
        let cursor = ring.write_and_get_cursor(&packet(7, 0xab));
        assert_eq!(cursor, start);
        assert_eq!(ring.current_tail(), start.next());

        let read = ring.try_read(cursor).expect("packet should be readable");
        assert_eq!(read.stream_id, 7);
        assert_eq!(read.data, [0xab; 56]);
    }

    #[test]
    fn test_unwritten_position_is_pending() {
        let ring = RingBuffer::new(4);
        assert_eq!(ring.read(ring.current_tail()), ReadOutcome::Pending);
        assert!(ring.try_read(Cursor::from_ticket(100)).is_none());
    }

    #[test]
    fn test_overwrite_is_detected() {
        let ring = RingBuffer::new(4);
        let first = ring.write_and_get_cursor(&packet(1, 1));
        for i in 0..4 {
            ring.write(&packet(2 + i, 2));
        }

        assert_eq!(ring.read(first), ReadOutcome::Overwritten);
        assert_eq!(ring.current_head(), first.next());
        // Same physical slot, newer turn
        let latest = ring.try_read(Cursor::from_ticket(first.ticket() + 4)).expect("latest turn");
        assert_eq!(latest.stream_id, 5);
    }

    #[test]
    fn test_concurrent_writers_get_distinct_cursors() {
        let ring = Arc::new(RingBuffer::new(4096));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let ring = Arc::clone(&ring);
                thread::spawn(move || {
                    (0..500).map(|_| ring.write_and_get_cursor(&packet(t, t as u8)).ticket()).collect::<Vec<_>>()
                })
            })
            .collect();

        let mut tickets: Vec<u64> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        tickets.sort_unstable();
        tickets.dedup();
        assert_eq!(tickets.len(), 2000);

        for ticket in tickets {
            let read = ring.try_read(Cursor::from_ticket(ticket)).unwrap();
            assert_eq!(read.data[0], read.stream_id as u8);
        }
    }
}
