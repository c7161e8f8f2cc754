//! Stack collection strategies
//!
//! A [`Tracer`] turns the context of an interrupted thread into a list of
//! frame ids. Each tracer owns one bit of the tracer mask (see
//! `sigsampler_common::tracers`); a session samples every available tracer
//! whose bit was requested.
//!
//! `collect_stack` runs inside the `SIGPROF` handler. Implementations must be
//! async-signal-safe: no allocation, no locks, no logging, no panics. Faults
//! while reading foreign memory are fine; the sampling coordinator recovers
//! from them and records the sample as `SignalInterrupt`.
//!
//! - `native`: frame-pointer walker for code compiled with frame pointers
//! - `java`: VM stacks with method names, driven by an embedder's walker
//! - `external`: callbacks registered by other runtimes (JS, Python)

pub mod external;
pub mod java;
pub mod native;

pub use external::{register_external_tracer_callback, ExternalStackCallback, ExternalTracer};
pub use java::{JavaStackCollector, JavaTracer, VmFrame, VmStackWalker};
pub use native::NativeTracer;

use sigsampler_common::StackCollectionRetcode;
use std::ffi::c_void;

pub trait Tracer: Send + Sync {
    /// Capture the interrupted thread's stack into `frames`
    ///
    /// `frames.len()` is the maximum depth. On return `depth` holds the
    /// number of valid frames; it is zero for every code but `Success`.
    fn collect_stack(&self, ucontext: *mut c_void, frames: &mut [i64], depth: &mut u16) -> StackCollectionRetcode;

    /// Log a stack previously captured by `collect_stack`
    ///
    /// Runs on the logger loop thread.
    fn flush_stack(&self, frames: &[i64], tid: u32, time: i64);

    fn start_tracing(&self) {}

    fn stop_tracing(&self) {}

    /// Called once when the tracer is installed into a profiler
    fn prepare(&self) {}

    /// VM tracers that also report method names
    fn as_java_tracer(&self) -> Option<&dyn JavaStackCollector> {
        None
    }

    /// Tracers driven by an external callback
    fn as_external(&self) -> Option<&ExternalTracer> {
        None
    }
}
