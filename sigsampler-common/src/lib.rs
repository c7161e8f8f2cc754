//! # Shared Wire Types (Sampler ↔ Trace Readers)
//!
//! Defines the constants, packet layout, and enumerations shared between the
//! sampling pipeline and anything that consumes its ring buffer. All wire types
//! use `#[repr(C)]` so a reader built separately sees the same layout.
//!
//! ## Key Types
//!
//! - [`Packet`] - Fixed-size unit stored in the ring buffer
//! - [`EntryType`] - Semantic type tag carried by every logged entry
//! - [`StackCollectionRetcode`] - Result of one stack collection attempt
//! - [`SlotState`] - Lifecycle codes of a stack slot, packed with the owner tid

#![cfg_attr(not(test), no_std)]

// ============================================================================
// Sizing Constants
// ============================================================================

/// Maximum number of frames captured per sample
///
/// Tracers that find more frames than this report `STACK_OVERFLOW` and keep
/// nothing (all-or-nothing).
pub const MAX_STACK_DEPTH: usize = 128;

/// Number of stack slots shared by all sampled threads
///
/// Signal handlers claim a free slot per sample; the logger loop frees it after
/// flushing. When every slot is taken the sample is counted as a slot miss.
pub const MAX_STACKS_COUNT: usize = 128;

/// Filled slots between two wakeups of the logger loop
pub const FLUSH_STACKS_COUNT: u32 = 10;

/// Total size of one [`Packet`] in bytes
pub const PACKET_SIZE: usize = 64;

/// Payload bytes carried by one [`Packet`]
pub const PACKET_DATA_SIZE: usize = PACKET_SIZE - 8;

/// Maximum payload of a bytes entry
pub const MAX_VARIABLE_LENGTH_ENTRY: usize = 1024;

/// First id handed out by a fresh entry id counter
///
/// Ids below this value are left for entries written after a trace has
/// logically completed.
pub const ENTRY_ID_INITIAL: i32 = 512;

// ============================================================================
// Tracer Type Bits
// ============================================================================

/// Tracer type bits
///
/// A tracer is identified by a single bit so that a session can request any
/// combination of them with one mask. Bits not listed here are free for
/// embedders (tests use high bits for synthetic tracers).
pub mod tracers {
    /// Native frame-pointer unwinder
    pub const NATIVE: u32 = 1 << 0;

    /// Interpreted VM stacks with method-name resolution
    pub const JAVA: u32 = 1 << 1;

    /// Externally registered JavaScript engine callback
    pub const JAVASCRIPT: u32 = 1 << 2;

    /// Externally registered Python interpreter callback
    pub const PYTHON: u32 = 1 << 3;

    /// Tracer types driven by an external callback
    pub const EXTERNAL_MASK: u32 = JAVASCRIPT | PYTHON;

    /// Tracer types that produce method names alongside frames
    pub const JAVA_MASK: u32 = JAVA;

    /// Returns true if `tracer` is driven by an externally registered callback
    #[must_use]
    pub const fn is_external(tracer: u32) -> bool {
        tracer & EXTERNAL_MASK != 0
    }
}

// ============================================================================
// Packet
// ============================================================================

/// Fixed-size ring buffer unit
///
/// A serialized entry longer than [`PACKET_DATA_SIZE`] is split over several
/// packets sharing one `stream_id`. Readers reassemble a payload by starting
/// at a packet with `start != 0` and following same-stream packets while
/// `next != 0`.
///
/// **Memory Layout**: 4 + 1 + 1 + 1 + 1 + 56 = 64 bytes, no implicit padding
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Packet {
    /// Identifies the logical write this packet belongs to
    pub stream_id: u32,

    /// Non-zero on the first packet of a logical write
    pub start: u8,

    /// Non-zero if more packets of this logical write follow
    pub next: u8,

    /// Number of meaningful bytes in `data`
    pub size: u8,

    /// Padding to keep `data` 8-byte aligned
    #[allow(clippy::pub_underscore_fields)]
    pub _padding: u8,

    /// Chunk of the serialized entry
    pub data: [u8; PACKET_DATA_SIZE],
}

impl Packet {
    /// Returns the meaningful part of `data`
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        let len = (self.size as usize).min(PACKET_DATA_SIZE);
        &self.data[..len]
    }

    #[must_use]
    pub const fn is_start(&self) -> bool {
        self.start != 0
    }

    #[must_use]
    pub const fn has_next(&self) -> bool {
        self.next != 0
    }

    /// Serialize into the 64-byte wire layout
    #[must_use]
    pub fn to_bytes(&self) -> [u8; PACKET_SIZE] {
        let mut out = [0u8; PACKET_SIZE];
        out[..4].copy_from_slice(&self.stream_id.to_le_bytes());
        out[4] = self.start;
        out[5] = self.next;
        out[6] = self.size;
        out[7] = self._padding;
        out[8..].copy_from_slice(&self.data);
        out
    }

    /// Inverse of [`Packet::to_bytes`]
    #[must_use]
    pub fn from_bytes(bytes: &[u8; PACKET_SIZE]) -> Self {
        let mut data = [0u8; PACKET_DATA_SIZE];
        data.copy_from_slice(&bytes[8..]);
        Self {
            stream_id: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            start: bytes[4],
            next: bytes[5],
            size: bytes[6],
            _padding: bytes[7],
            data,
        }
    }
}

impl Default for Packet {
    fn default() -> Self {
        Self { stream_id: 0, start: 0, next: 0, size: 0, _padding: 0, data: [0; PACKET_DATA_SIZE] }
    }
}

const _: () = assert!(core::mem::size_of::<Packet>() == PACKET_SIZE);

// ============================================================================
// Entry Types
// ============================================================================

/// Semantic type of a logged entry
///
/// Values are stable on the wire; readers built against an older table
/// decode unknown values as [`EntryType::UnknownType`].
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EntryType {
    UnknownType = 0,
    TraceAbort = 38,
    TraceEnd = 39,
    TraceStart = 40,
    Counter = 43,
    /// Native or VM stack sample
    StackFrame = 44,
    /// Key/value annotation (`callid` = key, `extra` = value)
    TraceAnnotation = 51,
    StringKey = 55,
    StringValue = 56,
    /// Stack sample from an external JavaScript engine
    JavascriptStackFrame = 66,
    StringName = 82,
    /// Fully qualified name of a framework frame, logged once per session
    JavaFrameName = 83,
    StkerrEmptyStack = 87,
    StkerrStackOverflow = 88,
    StkerrNoStackForThread = 89,
    StkerrSignalInterrupt = 90,
    StkerrNestedUnwind = 91,
}

impl EntryType {
    /// Upper-case name used when printing entries
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::UnknownType => "UNKNOWN_TYPE",
            Self::TraceAbort => "TRACE_ABORT",
            Self::TraceEnd => "TRACE_END",
            Self::TraceStart => "TRACE_START",
            Self::Counter => "COUNTER",
            Self::StackFrame => "STACK_FRAME",
            Self::TraceAnnotation => "TRACE_ANNOTATION",
            Self::StringKey => "STRING_KEY",
            Self::StringValue => "STRING_VALUE",
            Self::JavascriptStackFrame => "JAVASCRIPT_STACK_FRAME",
            Self::StringName => "STRING_NAME",
            Self::JavaFrameName => "JAVA_FRAME_NAME",
            Self::StkerrEmptyStack => "STKERR_EMPTYSTACK",
            Self::StkerrStackOverflow => "STKERR_STACKOVERFLOW",
            Self::StkerrNoStackForThread => "STKERR_NOSTACKFORTHREAD",
            Self::StkerrSignalInterrupt => "STKERR_SIGNALINTERRUPT",
            Self::StkerrNestedUnwind => "STKERR_NESTEDUNWIND",
        }
    }

    /// Decode a wire value, mapping unknown values to `UnknownType`
    #[must_use]
    pub const fn from_u8(value: u8) -> Self {
        match value {
            38 => Self::TraceAbort,
            39 => Self::TraceEnd,
            40 => Self::TraceStart,
            43 => Self::Counter,
            44 => Self::StackFrame,
            51 => Self::TraceAnnotation,
            55 => Self::StringKey,
            56 => Self::StringValue,
            66 => Self::JavascriptStackFrame,
            82 => Self::StringName,
            83 => Self::JavaFrameName,
            87 => Self::StkerrEmptyStack,
            88 => Self::StkerrStackOverflow,
            89 => Self::StkerrNoStackForThread,
            90 => Self::StkerrSignalInterrupt,
            91 => Self::StkerrNestedUnwind,
            _ => Self::UnknownType,
        }
    }
}

// ============================================================================
// Annotation Keys
// ============================================================================

/// Keys of the per-session error annotations written at stop
pub mod annotations {
    /// Faults recovered while unwinding
    pub const PROF_ERR_SIG_CRASHES: i32 = 8_126_470;

    /// Samples dropped because no slot was free
    pub const PROF_ERR_SLOT_MISSES: i32 = 8_126_471;

    /// Samples dropped because the stack exceeded `MAX_STACK_DEPTH`
    pub const PROF_ERR_STACK_OVERFLOWS: i32 = 8_126_472;
}

// ============================================================================
// Stack Collection Result Codes
// ============================================================================

/// Outcome of one `collect_stack` call
///
/// Stored in the low 16 bits of a slot's state word so the logger loop can
/// tell what happened without any other synchronization.
#[repr(u16)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StackCollectionRetcode {
    Success = 0,
    /// The walk produced zero frames
    EmptyStack = 1,
    /// More frames existed than `max_depth` allowed
    StackOverflow = 2,
    /// The VM has no thread object for the interrupted thread
    NoStackForThread = 3,
    /// A fault was raised while unwinding and recovered
    SignalInterrupt = 4,
    /// The sampling signal arrived while this thread was already unwinding
    NestedUnwind = 5,
    /// The tracer is switched off; the slot is released without a sample
    TracerDisabled = 6,
    /// The tracer flushed on its own; the slot holds nothing to log
    Ignore = 7,
}

/// One past the highest [`StackCollectionRetcode`] value
pub const RETCODE_MAXVAL: u16 = 8;

impl StackCollectionRetcode {
    /// Decode a slot code, returning `None` for lifecycle states
    #[must_use]
    pub const fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(Self::Success),
            1 => Some(Self::EmptyStack),
            2 => Some(Self::StackOverflow),
            3 => Some(Self::NoStackForThread),
            4 => Some(Self::SignalInterrupt),
            5 => Some(Self::NestedUnwind),
            6 => Some(Self::TracerDisabled),
            7 => Some(Self::Ignore),
            _ => None,
        }
    }

    /// Error entry type written in place of frames, `None` for success
    #[must_use]
    pub const fn error_entry_type(self) -> Option<EntryType> {
        match self {
            Self::EmptyStack => Some(EntryType::StkerrEmptyStack),
            Self::StackOverflow => Some(EntryType::StkerrStackOverflow),
            Self::NoStackForThread => Some(EntryType::StkerrNoStackForThread),
            Self::SignalInterrupt => Some(EntryType::StkerrSignalInterrupt),
            Self::NestedUnwind => Some(EntryType::StkerrNestedUnwind),
            Self::Success | Self::TracerDisabled | Self::Ignore => None,
        }
    }
}

// ============================================================================
// Slot State Word
// ============================================================================

/// Lifecycle codes of a stack slot
///
/// Numbered above [`RETCODE_MAXVAL`] so that a state word's low 16 bits are
/// either a lifecycle code or a collection result, never ambiguous.
pub mod slot_state {
    use super::RETCODE_MAXVAL;

    pub const FREE: u16 = RETCODE_MAXVAL + 1;
    pub const BUSY: u16 = RETCODE_MAXVAL + 2;
    pub const BUSY_WITH_METADATA: u16 = RETCODE_MAXVAL + 3;
}

/// Packed `(tid << 16) | code` slot state word
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotState(pub u64);

impl SlotState {
    pub const FREE: Self = Self(slot_state::FREE as u64);

    /// Pack an owner tid and a code
    #[must_use]
    pub const fn new(tid: u32, code: u16) -> Self {
        Self(((tid as u64) << 16) | code as u64)
    }

    #[must_use]
    pub const fn code(self) -> u16 {
        (self.0 & 0xffff) as u16
    }

    #[allow(clippy::cast_possible_truncation)]
    #[must_use]
    pub const fn tid(self) -> u32 {
        (self.0 >> 16) as u32
    }

    /// True for FREE, BUSY and `BUSY_WITH_METADATA`
    #[must_use]
    pub const fn is_lifecycle(self) -> bool {
        self.code() > RETCODE_MAXVAL
    }

    /// The collection result held by a filled slot
    #[must_use]
    pub const fn retcode(self) -> Option<StackCollectionRetcode> {
        StackCollectionRetcode::from_u16(self.code())
    }
}
