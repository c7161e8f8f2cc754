//! Structured error types for sigsampler
//!
//! Using thiserror for automatic Display implementation and error chaining.
//! None of these are ever constructed on the signal path; handlers report
//! through slot codes and counters instead.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SamplerError {
    #[error("A profiling session is already active")]
    AlreadyProfiling,

    #[error("No profiling session is active")]
    NotProfiling,

    #[error("Profiler has not been initialized")]
    NotInitialized,

    #[error("None of the requested tracers ({requested:#x}) are available ({available:#x})")]
    NoTracersEnabled { requested: u32, available: u32 },

    #[error("Tracer type {0:#x} is not a single known tracer bit")]
    UnknownTracer(u32),

    #[error("Signal {signum} already has a handler registered by another component")]
    HandlerConflict { signum: i32 },

    #[error("sigjmp_buf needs {size} bytes aligned to {align}; the slot buffer holds {capacity}")]
    JumpBufferTooSmall { size: usize, align: usize, capacity: usize },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("{op} failed: {source}")]
    Os {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SamplerError {
    /// Wrap the current `errno` with the name of the failing call
    pub(crate) fn last_os_error(op: &'static str) -> Self {
        SamplerError::Os { op, source: std::io::Error::last_os_error() }
    }
}

/// Rejections from the entry logger
///
/// Returned synchronously to the writer; nothing is written when one of these
/// comes back.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WriteError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("Entry payload length {len} exceeds the limit of {max}")]
    Overflow { len: usize, max: usize },
}

/// Failures while decoding serialized entries
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Entry truncated: needed {needed} bytes, had {available}")]
    Truncated { needed: usize, available: usize },

    #[error("Unknown entry kind {0}")]
    UnknownKind(u8),

    #[error("Empty payload")]
    Empty,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_tracers_display() {
        let err = SamplerError::NoTracersEnabled { requested: 0x10, available: 0x3 };
        assert_eq!(err.to_string(), "None of the requested tracers (0x10) are available (0x3)");
    }

    #[test]
    fn test_os_error_keeps_source() {
        use std::error::Error as _;
        let err = SamplerError::Os {
            op: "timer_create",
            source: std::io::Error::from_raw_os_error(libc::EINVAL),
        };
        assert!(err.to_string().starts_with("timer_create failed"));
        assert!(err.source().is_some());
    }

    #[test]
    fn test_jump_buffer_display() {
        let err = SamplerError::JumpBufferTooSmall { size: 600, align: 16, capacity: 512 };
        assert_eq!(err.to_string(), "sigjmp_buf needs 600 bytes aligned to 16; the slot buffer holds 512");
    }

    #[test]
    fn test_overflow_display() {
        let err = WriteError::Overflow { len: 1025, max: 1024 };
        assert!(err.to_string().contains("1025"));
    }
}
