//! Signal-driven sampling
//!
//! - `sampling_profiler`: session lifecycle, `SIGPROF` and fault handlers
//! - `profile_state`: stack slots, per-session counters, logger-loop flushing
//! - `timer_manager`: per-thread POSIX timers and the thread detector
//! - `signal_handler`: process-wide handler registrations with chaining
//! - `jump`: `sigsetjmp`/`siglongjmp` recovery points (C shim)
//! - `phaser`, `semaphore`, `slot`, `thread_list`: building blocks

pub mod jump;
pub mod phaser;
mod profile_state;
pub mod sampling_profiler;
pub mod semaphore;
pub mod signal_handler;
pub mod slot;
pub mod thread_list;
pub mod timer_manager;

pub use profile_state::ErrorCounts;
pub use sampling_profiler::SamplingProfiler;
pub use signal_handler::{HandlerScope, SignalHandler};
pub use slot::{SlotSnapshot, StackSlot};
pub use thread_list::{list_threads, thread_name};
pub use timer_manager::{ThreadTimer, TimerClock, TimerConfig, TimerManager, Whitelist, DETECT_THREAD_NAME};
