//! Session lifecycle and the sampling signal handlers
//!
//! [`SamplingProfiler`] ties the pieces together:
//!
//! ```text
//!  sampler-detect thread            application threads             logger thread
//!  ─────────────────────            ───────────────────             ─────────────
//!  TimerManager ──timer_create──▶   SIGPROF ─▶ sigprof_handler
//!                                     │ claim slot, collect stack
//!                                     │ (SIGSEGV/SIGBUS ─▶ fault_handler
//!                                     │    ─▶ siglongjmp back to slot)
//!                                     └─ every 10th fill ─ sem_post ──▶ logger_loop
//!                                                                       flush slots ─▶ ring buffer
//! ```
//!
//! Signal dispositions are process-wide, so at most one session runs per
//! process at a time, whichever profiler instance owns it.

#![allow(unsafe_code)] // signal handlers dereference the session pointer

use super::jump;
use super::profile_state::{ErrorCounts, ProfileState};
use super::signal_handler::SignalHandler;
use super::slot::SlotSnapshot;
use super::timer_manager::{TimerManager, Whitelist};
use crate::config::SessionConfig;
use crate::domain::{SamplerError, Tid, Timestamp};
use crate::entries::Logger;
use crate::os;
use crate::tracer::Tracer;
use log::{debug, info, warn};
use std::cell::Cell;
use std::ffi::{c_int, c_void};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

thread_local! {
    /// Set while this thread is inside `ProfileState::sample`
    static UNWINDING: Cell<bool> = const { Cell::new(false) };
}

static SESSION_ACTIVE: AtomicBool = AtomicBool::new(false);

extern "C" fn sigprof_handler(signum: c_int, info: *mut libc::siginfo_t, ucontext: *mut c_void) {
    let _errno = os::ErrnoGuard::save();
    let Some(scope) = SignalHandler::enter(signum) else { return };
    if !scope.is_enabled() {
        scope.call_previous_handler(signum, info, ucontext);
        return;
    }

    let data = scope.data();
    if data.is_null() {
        return;
    }
    if UNWINDING.with(|unwinding| unwinding.replace(true)) {
        return;
    }

    // SAFETY: data is the session's ProfileState, kept alive until the
    // handler is disabled and drained
    let state = unsafe { &*data.cast::<ProfileState>() };
    state.sample(ucontext);

    UNWINDING.with(|unwinding| unwinding.set(false));
}

extern "C" fn fault_handler(signum: c_int, info: *mut libc::siginfo_t, ucontext: *mut c_void) {
    let _errno = os::ErrnoGuard::save();
    let Some(scope) = SignalHandler::enter(signum) else { return };

    let data = scope.data();
    if scope.is_enabled() && !data.is_null() && UNWINDING.with(Cell::get) {
        // SAFETY: as in sigprof_handler
        let state = unsafe { &*data.cast::<ProfileState>() };
        if let Some(slot) = state.recovery_slot(os::thread_id()) {
            // SAFETY: the slot's buffer was saved by guarded_call further up
            // this thread's stack, inside the interrupted SIGPROF handler
            unsafe { scope.siglongjmp(slot.jump_buffer(), 1) };
        }
    }

    scope.call_previous_handler(signum, info, ucontext);
}

/// The three registrations a session drives
#[derive(Clone, Copy)]
struct Handlers {
    sigprof: &'static SignalHandler,
    sigsegv: &'static SignalHandler,
    sigbus: &'static SignalHandler,
}

impl Handlers {
    fn initialize() -> Result<Self, SamplerError> {
        Ok(Handlers {
            sigprof: SignalHandler::initialize(libc::SIGPROF, sigprof_handler)?,
            sigsegv: SignalHandler::initialize(libc::SIGSEGV, fault_handler)?,
            sigbus: SignalHandler::initialize(libc::SIGBUS, fault_handler)?,
        })
    }

    /// Fault handlers first, so a collection can never fault unprotected
    fn all(&self) -> [&'static SignalHandler; 3] {
        [self.sigsegv, self.sigbus, self.sigprof]
    }

    fn enable(&self, state: &Arc<ProfileState>) -> Result<(), SamplerError> {
        let data = Arc::as_ptr(state).cast_mut().cast::<c_void>();
        for handler in self.all() {
            handler.set_data(data);
            handler.enable()?;
        }
        Ok(())
    }

    /// Disable and drain, sampling first; clears the session pointer afterwards
    fn disable(&self) {
        for handler in self.all().into_iter().rev() {
            handler.disable();
        }
        for handler in self.all() {
            handler.set_data(std::ptr::null_mut());
        }
    }
}

struct Installed {
    state: Arc<ProfileState>,
    handlers: Handlers,
}

struct Session {
    state: Arc<ProfileState>,
    handlers: Handlers,
    timers: TimerManager,
    active_tracers: u32,
    /// Whitelist entries this session added, removed again at stop
    session_tids: Vec<Tid>,
}

/// Owner of the sampling machinery
///
/// Lifecycle: [`initialize`](Self::initialize) once with the tracers, then
/// any number of [`start_profiling`](Self::start_profiling) /
/// [`stop_profiling`](Self::stop_profiling) pairs. A dedicated thread runs
/// [`logger_loop`](Self::logger_loop) to move samples into the ring buffer.
pub struct SamplingProfiler {
    logger: Arc<Logger>,
    whitelist: Arc<Whitelist>,
    installed: Mutex<Option<Installed>>,
    session: Mutex<Option<Session>>,
}

impl SamplingProfiler {
    pub fn new(logger: Arc<Logger>) -> Self {
        SamplingProfiler {
            logger,
            whitelist: Arc::new(Whitelist::new()),
            installed: Mutex::new(None),
            session: Mutex::new(None),
        }
    }

    pub fn logger(&self) -> &Arc<Logger> {
        &self.logger
    }

    /// Install the tracer table and claim the signal registrations
    ///
    /// `tracers` maps single tracer bits to implementations; `available`
    /// masks which of them sessions may use.
    ///
    /// # Errors
    /// `AlreadyProfiling` during a session, `JumpBufferTooSmall` if fault
    /// recovery cannot work on this platform, `UnknownTracer` for a key that
    /// is not a single bit, `HandlerConflict` if the signals are taken by
    /// other handlers, `Io` if the semaphore cannot be created
    pub fn initialize(&self, available: u32, tracers: Vec<(u32, Arc<dyn Tracer>)>) -> Result<(), SamplerError> {
        let session = lock(&self.session);
        if session.is_some() {
            return Err(SamplerError::AlreadyProfiling);
        }
        if let Some((bit, _)) = tracers.iter().find(|(bit, _)| bit.count_ones() != 1) {
            return Err(SamplerError::UnknownTracer(*bit));
        }
        jump::check_jump_buffer()?;

        let handlers = Handlers::initialize()?;
        let state = ProfileState::new(Arc::clone(&self.logger), available, tracers)?;
        for (_, tracer) in state.tracers_in(state.available_tracers()) {
            tracer.prepare();
        }

        info!("Sampling profiler initialized (tracers {:#x})", state.available_tracers());
        *lock(&self.installed) = Some(Installed { state: Arc::new(state), handlers });
        drop(session);
        Ok(())
    }

    /// Start a session
    ///
    /// On any error the profiler is left exactly as before the call.
    ///
    /// # Errors
    /// `AlreadyProfiling`, `NotInitialized`, `InvalidConfig`,
    /// `NoTracersEnabled` when none of the requested tracers is available,
    /// or the failure to install handlers or spawn the thread detector
    pub fn start_profiling(&self, config: &SessionConfig) -> Result<(), SamplerError> {
        config.validate()?;
        let mut session = lock(&self.session);
        if session.is_some() {
            return Err(SamplerError::AlreadyProfiling);
        }
        let (state, handlers) = {
            let installed = lock(&self.installed);
            let installed = installed.as_ref().ok_or(SamplerError::NotInitialized)?;
            (Arc::clone(&installed.state), installed.handlers)
        };

        if SESSION_ACTIVE.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err() {
            return Err(SamplerError::AlreadyProfiling);
        }

        let active = config.tracers & state.available_tracers();
        if active == 0 {
            SESSION_ACTIVE.store(false, Ordering::Release);
            return Err(SamplerError::NoTracersEnabled {
                requested: config.tracers,
                available: state.available_tracers(),
            });
        }

        let session_tids: Vec<Tid> =
            config.whitelist.iter().map(|&tid| Tid(tid)).filter(|&tid| self.whitelist.add(tid)).collect();

        state.begin_session(active);
        if let Err(e) = handlers.enable(&state) {
            self.rollback(&state, &handlers, &session_tids);
            return Err(e);
        }
        for (_, tracer) in state.tracers_in(active) {
            tracer.start_tracing();
        }

        let whitelist = config.wall_clock_mode.then(|| Arc::clone(&self.whitelist));
        let mut timers = TimerManager::new(config.timer_config(), whitelist);
        if let Err(e) = timers.start() {
            for (_, tracer) in state.tracers_in(active) {
                tracer.stop_tracing();
            }
            self.rollback(&state, &handlers, &session_tids);
            return Err(e);
        }

        info!(
            "Profiling started (tracers {active:#x}, rate {} ms, detect {} ms{})",
            config.sampling_rate_ms,
            config.thread_detect_interval().as_millis(),
            if config.wall_clock_mode { ", wall clock" } else { "" }
        );
        *session = Some(Session { state, handlers, timers, active_tracers: active, session_tids });
        Ok(())
    }

    fn rollback(&self, state: &ProfileState, handlers: &Handlers, session_tids: &[Tid]) {
        handlers.disable();
        state.end_session();
        self.forget_session_tids(session_tids);
        SESSION_ACTIVE.store(false, Ordering::Release);
    }

    fn forget_session_tids(&self, session_tids: &[Tid]) {
        for &tid in session_tids {
            self.whitelist.remove(tid);
        }
    }

    /// End the session and write its error annotations
    ///
    /// Blocks until every in-flight sampling handler has returned.
    ///
    /// # Errors
    /// `NotProfiling` if no session is running
    pub fn stop_profiling(&self) -> Result<ErrorCounts, SamplerError> {
        let mut session = lock(&self.session);
        let Session { state, handlers, mut timers, active_tracers, session_tids } =
            session.take().ok_or(SamplerError::NotProfiling)?;

        timers.stop();
        self.forget_session_tids(&session_tids);
        state.finish_logger_loop();
        let counts = state.log_error_annotations();
        state.end_session();

        for (_, tracer) in state.tracers_in(active_tracers) {
            tracer.stop_tracing();
        }
        handlers.disable();
        SESSION_ACTIVE.store(false, Ordering::Release);

        info!(
            "Profiling stopped ({} signal crashes, {} slot misses, {} stack overflows)",
            counts.signal_crashes, counts.slot_misses, counts.stack_overflows
        );
        Ok(counts)
    }

    /// Flush filled slots into the ring buffer until the session stops
    ///
    /// Meant for a dedicated thread; returns after the final flush that
    /// follows [`stop_profiling`](Self::stop_profiling).
    ///
    /// # Errors
    /// `NotInitialized`, or the semaphore failure
    pub fn logger_loop(&self) -> Result<(), SamplerError> {
        let state = lock(&self.installed)
            .as_ref()
            .map(|installed| Arc::clone(&installed.state))
            .ok_or(SamplerError::NotInitialized)?;

        debug!("Logger loop started");
        loop {
            match state.wait_for_slots() {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(SamplerError::Os { op: "sem_wait", source: e }),
            }

            let flushed = state.flush_stack_traces();
            debug!("Flushed {flushed} stack slots");

            if state.logger_loop_done() {
                break;
            }
        }
        debug!("Logger loop finished");
        Ok(())
    }

    pub fn add_to_whitelist(&self, tid: Tid) {
        self.whitelist.add(tid);
    }

    pub fn remove_from_whitelist(&self, tid: Tid) {
        self.whitelist.remove(tid);
    }

    pub fn whitelist(&self) -> &Arc<Whitelist> {
        &self.whitelist
    }

    /// Forget which framework frames were already named
    pub fn reset_framework_names_set(&self) {
        if let Some(installed) = lock(&self.installed).as_ref() {
            installed.state.clear_framework_names();
        }
    }

    pub fn is_profiling(&self) -> bool {
        lock(&self.session).is_some()
    }

    /// Start of the running session on the monotonic clock
    pub fn session_start_time(&self) -> Option<Timestamp> {
        lock(&self.session).as_ref().map(|session| Timestamp(session.state.profile_start_time()))
    }

    /// Error counts of the running session so far
    pub fn error_counts(&self) -> Option<ErrorCounts> {
        lock(&self.session).as_ref().map(|session| session.state.error_counts())
    }

    /// Metadata of every stack slot, empty before `initialize`
    pub fn slot_snapshots(&self) -> Vec<SlotSnapshot> {
        lock(&self.installed).as_ref().map(|installed| installed.state.slot_snapshots()).unwrap_or_default()
    }
}

impl Drop for SamplingProfiler {
    fn drop(&mut self) {
        if self.is_profiling() {
            if let Err(e) = self.stop_profiling() {
                warn!("Failed to stop profiling on drop: {e}");
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
