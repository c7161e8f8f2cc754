//! # sigsampler - Signal-driven In-process Sampling Profiler
//!
//! sigsampler samples the call stacks of every thread of the current process
//! on a timer signal and streams them, as compact binary entries, into a
//! lock-free ring buffer that a reader drains concurrently.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                  Application Threads                            │
//! │          (each armed with a per-thread SIGPROF timer)           │
//! └───────────────────────┬─────────────────────────────────────────┘
//!                         │ SIGPROF
//!                         ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                Sampling Coordinator (signal context)            │
//! │  • claim a stack slot (CAS)                                     │
//! │  • run each active Tracer under a sigsetjmp recovery point      │
//! │  • SIGSEGV/SIGBUS during a walk: siglongjmp back, mark slot     │
//! └───────────────────────┬─────────────────────────────────────────┘
//!                         │ filled slots, sem_post every 10th
//!                         ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    Logger Loop (own thread)                     │
//! │                                                                 │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐         │
//! │  │ Entry Logger │──▶│Packet Logger │──▶│ Ring Buffer  │──▶ reader│
//! │  │ (ids, encode)│   │  (chunking)  │   │  (seqlocked) │         │
//! │  └──────────────┘   └──────────────┘   └──────────────┘         │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Structure
//!
//! ### Core Pipeline Modules
//!
//! - [`profiler`]: session lifecycle, signal handlers, stack slots, timers
//!   - `sampling_profiler`: `start_profiling` / `stop_profiling` / `logger_loop`
//!   - `timer_manager`: per-thread POSIX timers, rescanned by `sampler-detect`
//!   - `jump`: `sigsetjmp`/`siglongjmp` recovery points (C shim in `csrc/`)
//!
//! - [`tracer`]: stack collection strategies behind the [`tracer::Tracer`] trait
//!   - Native frame-pointer walker, VM stacks with method names, external callbacks
//!
//! - [`entries`]: typed entries, id assignment and the packed wire encoding
//!
//! - [`buffer`]: the packet ring buffer, payload chunking and the reader
//!
//! ### Support Modules
//!
//! - [`config`]: [`config::SessionConfig`] for one profiling session
//! - [`report`]: per-thread summaries decoded from the ring buffer
//! - [`cli`]: command-line arguments of the demo binary
//! - [`domain`]: core domain types (Tid, Pid, Timestamp) and errors
//! - [`os`]: signal-safe syscall wrappers
//!
//! ## Signal Safety
//!
//! Everything reachable from the `SIGPROF` handler avoids allocation, locks,
//! logging and panics. Results leave signal context only as slot state codes;
//! errors become `STKERR_*` entries and per-session counters.
//!
//! ## Example
//!
//! ```no_run
//! use sigsampler::buffer::RingBuffer;
//! use sigsampler::config::SessionConfig;
//! use sigsampler::entries::Logger;
//! use sigsampler::profiler::SamplingProfiler;
//! use sigsampler::tracer::{NativeTracer, Tracer};
//! use sigsampler_common::tracers;
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), sigsampler::domain::SamplerError> {
//! let logger = Arc::new(Logger::new(Arc::new(RingBuffer::new(16 * 1024))));
//! let native: Arc<dyn Tracer> = Arc::new(NativeTracer::new(Arc::clone(&logger)));
//! let profiler = SamplingProfiler::new(logger);
//! profiler.initialize(tracers::NATIVE, vec![(tracers::NATIVE, native)])?;
//!
//! profiler.start_profiling(&SessionConfig::default())?;
//! // ... run a logger_loop thread, do work ...
//! profiler.stop_profiling()?;
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod cli;
pub mod config;
pub mod domain;
pub mod entries;
pub mod os;
pub mod profiler;
pub mod report;
pub mod tracer;
