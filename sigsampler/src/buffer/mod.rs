//! Packet transport between writers (signal handlers, the logger loop) and
//! readers
//!
//! - `ring_buffer`: fixed-capacity seqlocked packet ring
//! - `packet_logger`: splits payloads into stream-tagged packets
//! - `reader`: regroups packets into payloads and entries

pub mod packet_logger;
pub mod reader;
pub mod ring_buffer;

pub use packet_logger::PacketLogger;
pub use reader::TraceReader;
pub use ring_buffer::{Cursor, ReadOutcome, RingBuffer};
