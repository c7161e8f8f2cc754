//! Decoding of packed entries back into owned values

use super::entry::{kind, StandardEntry};
use crate::domain::ParseError;
use sigsampler_common::EntryType;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedFrames {
    pub id: i32,
    pub entry_type: EntryType,
    pub timestamp: i64,
    pub tid: i32,
    pub frames: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedBytes {
    pub id: i32,
    pub entry_type: EntryType,
    pub matchid: i32,
    pub bytes: Vec<u8>,
}

/// An entry decoded from a reassembled payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedEntry {
    Standard(StandardEntry),
    Frames(ParsedFrames),
    Bytes(ParsedBytes),
}

impl ParsedEntry {
    #[must_use]
    pub fn id(&self) -> i32 {
        match self {
            ParsedEntry::Standard(e) => e.id,
            ParsedEntry::Frames(e) => e.id,
            ParsedEntry::Bytes(e) => e.id,
        }
    }

    #[must_use]
    pub fn entry_type(&self) -> EntryType {
        match self {
            ParsedEntry::Standard(e) => e.entry_type,
            ParsedEntry::Frames(e) => e.entry_type,
            ParsedEntry::Bytes(e) => e.entry_type,
        }
    }
}

impl fmt::Display for ParsedEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParsedEntry::Standard(e) => write!(
                f,
                "{}|{}|{}|{}|{}|{}|{}",
                e.id,
                e.entry_type.name(),
                e.timestamp,
                e.tid,
                e.callid,
                e.matchid,
                e.extra
            ),
            ParsedEntry::Frames(e) => {
                write!(f, "{}|{}|{}|{}|{}|", e.id, e.entry_type.name(), e.timestamp, e.tid, e.frames.len())?;
                for (i, frame) in e.frames.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{frame:#x}")?;
                }
                Ok(())
            }
            ParsedEntry::Bytes(e) => write!(
                f,
                "{}|{}|{}|{}",
                e.id,
                e.entry_type.name(),
                e.matchid,
                String::from_utf8_lossy(&e.bytes)
            ),
        }
    }
}

/// Decode one payload produced by the entry logger
pub fn parse_entry(payload: &[u8]) -> Result<ParsedEntry, ParseError> {
    let mut r = WireReader { buf: payload, pos: 0 };
    let serialization = r.u8().map_err(|_| ParseError::Empty)?;

    match serialization {
        kind::STANDARD => Ok(ParsedEntry::Standard(StandardEntry {
            id: r.i32()?,
            entry_type: EntryType::from_u8(r.u8()?),
            timestamp: r.i64()?,
            tid: r.i32()?,
            callid: r.i32()?,
            matchid: r.i32()?,
            extra: r.i64()?,
        })),
        kind::FRAMES => {
            let id = r.i32()?;
            let entry_type = EntryType::from_u8(r.u8()?);
            let timestamp = r.i64()?;
            let tid = r.i32()?;
            let depth = usize::from(r.u8()?);
            let frames = (0..depth).map(|_| r.i64()).collect::<Result<Vec<_>, _>>()?;
            Ok(ParsedEntry::Frames(ParsedFrames { id, entry_type, timestamp, tid, frames }))
        }
        kind::BYTES => {
            let id = r.i32()?;
            let entry_type = EntryType::from_u8(r.u8()?);
            let matchid = r.i32()?;
            let len = usize::from(r.u16()?);
            let bytes = r.take(len)?.to_vec();
            Ok(ParsedEntry::Bytes(ParsedBytes { id, entry_type, matchid, bytes }))
        }
        other => Err(ParseError::UnknownKind(other)),
    }
}

struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], ParseError> {
        let end = self.pos + n;
        let slice = self
            .buf
            .get(self.pos..end)
            .ok_or(ParseError::Truncated { needed: end, available: self.buf.len() })?;
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], ParseError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, ParseError> {
        Ok(self.array::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16, ParseError> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    fn i32(&mut self) -> Result<i32, ParseError> {
        Ok(i32::from_le_bytes(self.array()?))
    }

    fn i64(&mut self) -> Result<i64, ParseError> {
        Ok(i64::from_le_bytes(self.array()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entries::{BytesEntry, Entry, FramesEntry, MAX_ENTRY_SIZE};

    fn pack(entry: &Entry<'_>) -> Vec<u8> {
        let mut out = [0u8; MAX_ENTRY_SIZE];
        let len = entry.pack(&mut out).unwrap();
        out[..len].to_vec()
    }

    #[test]
    fn test_standard_display() {
        let entry = StandardEntry {
            id: 600,
            entry_type: EntryType::TraceAnnotation,
            timestamp: 123,
            tid: 45,
            callid: 8_126_471,
            matchid: 0,
            extra: 2,
        };
        let parsed = parse_entry(&pack(&Entry::Standard(entry))).unwrap();
        assert_eq!(parsed, ParsedEntry::Standard(entry));
        assert_eq!(parsed.to_string(), "600|TRACE_ANNOTATION|123|45|8126471|0|2");
    }

    #[test]
    fn test_frames_decode() {
        let frames = [0x1000i64, 0x2000];
        let payload = pack(&Entry::Frames(FramesEntry {
            id: 513,
            entry_type: EntryType::StackFrame,
            timestamp: 9,
            tid: 10,
            frames: &frames,
        }));
        let parsed = parse_entry(&payload).unwrap();
        assert_eq!(parsed.entry_type(), EntryType::StackFrame);
        assert_eq!(parsed.to_string(), "513|STACK_FRAME|9|10|2|0x1000,0x2000");
    }

    #[test]
    fn test_bytes_decode() {
        let payload = pack(&Entry::Bytes(BytesEntry {
            id: 514,
            entry_type: EntryType::JavaFrameName,
            matchid: 513,
            bytes: b"java.lang.Thread.run",
        }));
        let parsed = parse_entry(&payload).unwrap();
        assert_eq!(parsed.id(), 514);
        assert_eq!(parsed.to_string(), "514|JAVA_FRAME_NAME|513|java.lang.Thread.run");
    }

    #[test]
    fn test_malformed_payloads() {
        assert_eq!(parse_entry(&[]), Err(ParseError::Empty));
        assert_eq!(parse_entry(&[9, 0, 0]), Err(ParseError::UnknownKind(9)));
        assert!(matches!(parse_entry(&[kind::STANDARD, 1, 2]), Err(ParseError::Truncated { .. })));
    }
}
