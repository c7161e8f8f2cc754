//! State shared between the sampling signal handlers and the logger loop
//!
//! Created by `SamplingProfiler::initialize` and immutable afterwards except
//! through atomics, so signal handlers can read it without locks. The only
//! mutex (the framework-name set) is touched by the logger loop and session
//! control, never from a handler.
//!
//! Slot protocol, all transitions by CAS on the slot's state word:
//!
//! ```text
//! FREE ──claim──▶ tid|BUSY ──metadata──▶ tid|BUSY_WITH_METADATA ──▶ tid|<result>
//!   ▲                                          │  (disabled / ignored)     │
//!   └──────────────────────────────────────────┴──────── logger loop ◀─────┘
//! ```

#![allow(unsafe_code)] // slot arrays and the sigsetjmp trampoline

use super::jump;
use super::semaphore::Semaphore;
use super::slot::{SlotSnapshot, StackSlot};
use crate::entries::{Entry, Logger, StandardEntry};
use crate::os;
use crate::tracer::java::{is_framework_class, qualified_frame_name};
use crate::tracer::Tracer;
use log::{debug, warn};
use sigsampler_common::{
    annotations, slot_state, EntryType, SlotState, StackCollectionRetcode, FLUSH_STACKS_COUNT, MAX_STACKS_COUNT,
};
use std::collections::HashSet;
use std::ffi::c_void;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

const TRACER_BITS: usize = u32::BITS as usize;

/// Per-session error counters, as written at stop
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ErrorCounts {
    pub signal_crashes: u32,
    pub slot_misses: u32,
    pub stack_overflows: u32,
}

pub(crate) struct ProfileState {
    slots: Box<[StackSlot]>,
    current_slot: AtomicUsize,
    available_tracers: u32,
    current_tracers: AtomicU32,
    tracers: [Option<Arc<dyn Tracer>>; TRACER_BITS],

    err_sig_crashes: AtomicU32,
    err_slot_misses: AtomicU32,
    err_stack_overflows: AtomicU32,

    full_slots_counter: AtomicU32,
    slots_counter_sem: Semaphore,
    logger_loop_done: AtomicBool,
    profile_start_time: AtomicI64,

    logger: Arc<Logger>,
    framework_names: Mutex<HashSet<i64>>,
}

impl ProfileState {
    /// `tracers` must hold single-bit keys; bits without an entry are not available
    pub(crate) fn new(
        logger: Arc<Logger>,
        available: u32,
        tracers: impl IntoIterator<Item = (u32, Arc<dyn Tracer>)>,
    ) -> io::Result<Self> {
        let mut table: [Option<Arc<dyn Tracer>>; TRACER_BITS] = std::array::from_fn(|_| None);
        let mut provided = 0u32;
        for (bit, tracer) in tracers {
            debug_assert_eq!(bit.count_ones(), 1);
            provided |= bit;
            table[bit.trailing_zeros() as usize] = Some(tracer);
        }

        Ok(ProfileState {
            slots: (0..MAX_STACKS_COUNT).map(|_| StackSlot::new()).collect(),
            current_slot: AtomicUsize::new(0),
            available_tracers: available & provided,
            current_tracers: AtomicU32::new(0),
            tracers: table,
            err_sig_crashes: AtomicU32::new(0),
            err_slot_misses: AtomicU32::new(0),
            err_stack_overflows: AtomicU32::new(0),
            full_slots_counter: AtomicU32::new(0),
            slots_counter_sem: Semaphore::new(0)?,
            logger_loop_done: AtomicBool::new(false),
            profile_start_time: AtomicI64::new(0),
            logger,
            framework_names: Mutex::new(HashSet::new()),
        })
    }

    pub(crate) fn available_tracers(&self) -> u32 {
        self.available_tracers
    }

    pub(crate) fn current_tracers(&self) -> u32 {
        self.current_tracers.load(Ordering::Acquire)
    }

    pub(crate) fn tracer(&self, bit: u32) -> Option<&Arc<dyn Tracer>> {
        if bit.count_ones() != 1 {
            return None;
        }
        self.tracers[bit.trailing_zeros() as usize].as_ref()
    }

    /// Tracers selected by `mask`, lowest bit first
    pub(crate) fn tracers_in(&self, mask: u32) -> impl Iterator<Item = (u32, &Arc<dyn Tracer>)> {
        (0..u32::BITS).map(|i| 1u32 << i).filter(move |bit| mask & bit != 0).filter_map(move |bit| Some((bit, self.tracer(bit)?)))
    }

    pub(crate) fn profile_start_time(&self) -> i64 {
        self.profile_start_time.load(Ordering::Acquire)
    }

    pub(crate) fn logger(&self) -> &Arc<Logger> {
        &self.logger
    }

    pub(crate) fn slot_snapshots(&self) -> Vec<SlotSnapshot> {
        self.slots.iter().map(StackSlot::snapshot).collect()
    }

    pub(crate) fn error_counts(&self) -> ErrorCounts {
        ErrorCounts {
            signal_crashes: self.err_sig_crashes.load(Ordering::Relaxed),
            slot_misses: self.err_slot_misses.load(Ordering::Relaxed),
            stack_overflows: self.err_stack_overflows.load(Ordering::Relaxed),
        }
    }

    // ------------------------------------------------------------------------
    // Session control (never from signal context)
    // ------------------------------------------------------------------------

    pub(crate) fn begin_session(&self, active_tracers: u32) {
        self.reset_counters();
        self.profile_start_time.store(os::monotonic_time_ns(), Ordering::Release);
        self.logger_loop_done.store(false, Ordering::Release);
        self.clear_framework_names();
        self.current_tracers.store(active_tracers, Ordering::Release);
    }

    /// Wake the logger loop one last time and make it exit afterwards
    pub(crate) fn finish_logger_loop(&self) {
        self.logger_loop_done.store(true, Ordering::Release);
        if let Err(e) = self.slots_counter_sem.post() {
            warn!("Failed to wake the logger loop: {e}");
        }
    }

    pub(crate) fn end_session(&self) {
        self.current_tracers.store(0, Ordering::Release);
        self.reset_counters();
    }

    fn reset_counters(&self) {
        self.err_sig_crashes.store(0, Ordering::Relaxed);
        self.err_slot_misses.store(0, Ordering::Relaxed);
        self.err_stack_overflows.store(0, Ordering::Relaxed);
        self.full_slots_counter.store(0, Ordering::Relaxed);
        self.current_slot.store(0, Ordering::Relaxed);
    }

    /// Write the three per-session error annotations, zeros included
    pub(crate) fn log_error_annotations(&self) -> ErrorCounts {
        let counts = self.error_counts();
        for (key, value) in [
            (annotations::PROF_ERR_SIG_CRASHES, counts.signal_crashes),
            (annotations::PROF_ERR_SLOT_MISSES, counts.slot_misses),
            (annotations::PROF_ERR_STACK_OVERFLOWS, counts.stack_overflows),
        ] {
            if let Err(e) = self.logger.write_trace_annotation(key, i64::from(value)) {
                warn!("Failed to write annotation {key}: {e}");
            }
        }
        counts
    }

    pub(crate) fn clear_framework_names(&self) {
        self.framework_names.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    // ------------------------------------------------------------------------
    // Signal context
    // ------------------------------------------------------------------------

    /// Claim a free slot for `tid`, scanning every slot once from a shared start
    fn claim_slot(&self, tid: u32) -> Option<&StackSlot> {
        let busy = SlotState::new(tid, slot_state::BUSY);
        let count = self.slots.len();
        let start = self.current_slot.fetch_add(1, Ordering::Relaxed);
        for i in 0..count {
            let slot = &self.slots[start.wrapping_add(i) % count];
            if slot.try_transition(SlotState::FREE, busy) {
                return Some(slot);
            }
        }
        None
    }

    /// Take one sample per active tracer; runs in the `SIGPROF` handler
    pub(crate) fn sample(&self, ucontext: *mut c_void) {
        let tid = os::thread_id();
        let busy = SlotState::new(tid, slot_state::BUSY);
        let with_metadata = SlotState::new(tid, slot_state::BUSY_WITH_METADATA);

        let mut remaining = self.current_tracers.load(Ordering::Acquire);
        while remaining != 0 {
            let bit = remaining & remaining.wrapping_neg();
            remaining &= remaining - 1;

            let Some(tracer) = self.tracer(bit) else { continue };
            if tracer.as_external().is_some_and(|external| !external.is_enabled()) {
                continue;
            }

            let Some(slot) = self.claim_slot(tid) else {
                self.err_slot_misses.fetch_add(1, Ordering::Relaxed);
                continue;
            };

            slot.set_time(os::monotonic_time_ns());
            slot.set_depth(0);
            slot.set_profiler_type(bit);
            slot.jump_buffer().clear();
            slot.transition_or_abort(busy, with_metadata);

            let mut ctx = CollectContext {
                tracer: tracer.as_ref(),
                slot,
                ucontext,
                retcode: StackCollectionRetcode::Ignore,
            };
            // SAFETY: ctx outlives the call; collect_trampoline expects a CollectContext
            let jumped =
                unsafe { jump::guarded_call(slot.jump_buffer(), collect_trampoline, std::ptr::addr_of_mut!(ctx).cast()) };

            if jumped != 0 {
                slot.set_time(os::monotonic_time_ns());
                slot.set_depth(0);
                self.err_sig_crashes.fetch_add(1, Ordering::Relaxed);
                slot.transition_or_abort(
                    with_metadata,
                    SlotState::new(tid, StackCollectionRetcode::SignalInterrupt as u16),
                );
                self.notify_reader();
                break;
            }

            match ctx.retcode {
                StackCollectionRetcode::TracerDisabled | StackCollectionRetcode::Ignore => {
                    slot.transition_or_abort(with_metadata, SlotState::FREE);
                }
                code => {
                    if code == StackCollectionRetcode::StackOverflow {
                        self.err_stack_overflows.fetch_add(1, Ordering::Relaxed);
                    }
                    slot.transition_or_abort(with_metadata, SlotState::new(tid, code as u16));
                    self.notify_reader();
                }
            }
        }
    }

    /// Slot to jump back into after a fault on `tid`, the newest one if several
    pub(crate) fn recovery_slot(&self, tid: u32) -> Option<&StackSlot> {
        let target = SlotState::new(tid, slot_state::BUSY_WITH_METADATA);
        let mut newest: Option<&StackSlot> = None;
        for slot in self.slots.iter() {
            if slot.state() == target && !newest.is_some_and(|best| slot.time() < best.time()) {
                newest = Some(slot);
            }
        }
        newest
    }

    fn notify_reader(&self) {
        let filled = self.full_slots_counter.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
        if filled % FLUSH_STACKS_COUNT == 0 && self.slots_counter_sem.post().is_err() {
            std::process::abort();
        }
    }

    // ------------------------------------------------------------------------
    // Logger loop
    // ------------------------------------------------------------------------

    /// Block until the next flush is due
    pub(crate) fn wait_for_slots(&self) -> io::Result<()> {
        self.slots_counter_sem.wait()
    }

    pub(crate) fn logger_loop_done(&self) -> bool {
        self.logger_loop_done.load(Ordering::Acquire)
    }

    /// Log every filled slot of this session and free it; returns slots freed
    pub(crate) fn flush_stack_traces(&self) -> usize {
        let start = self.profile_start_time();
        let mut processed = 0;

        for slot in self.slots.iter() {
            let state = slot.state();
            if state.is_lifecycle() {
                continue;
            }
            if slot.time() > start {
                self.flush_slot(slot, state);
            }
            slot.transition_or_abort(state, SlotState::FREE);
            processed += 1;
        }

        processed
    }

    fn flush_slot(&self, slot: &StackSlot, state: SlotState) {
        let Some(code) = state.retcode() else { return };
        let tid = state.tid();

        if let Some(entry_type) = code.error_entry_type() {
            #[allow(clippy::cast_possible_wrap)]
            let error = Entry::Standard(StandardEntry {
                id: 0,
                entry_type,
                timestamp: slot.time(),
                tid: tid as i32,
                callid: 0,
                matchid: 0,
                extra: 0,
            });
            if let Err(e) = self.logger.write(error) {
                debug!("Failed to log {entry_type:?} for {tid}: {e}");
            }
            return;
        }
        if code != StackCollectionRetcode::Success {
            return;
        }

        let Some(tracer) = self.tracer(slot.profiler_type()) else {
            debug!("Dropping sample from unknown tracer {:#x}", slot.profiler_type());
            return;
        };
        if tracer.as_java_tracer().is_some() {
            self.log_framework_frames(slot, tid);
        }
        // SAFETY: the slot holds a result code, so its owner has finished writing
        let frames = unsafe { slot.frames() };
        tracer.flush_stack(frames, tid, slot.time());
    }

    /// Name each framework frame the first time it shows up in a session
    ///
    /// Writes a `JAVA_FRAME_NAME` standard entry carrying the frame id in
    /// `extra`, followed by a `JAVA_FRAME_NAME` bytes entry with the qualified
    /// name whose `matchid` points at it.
    fn log_framework_frames(&self, slot: &StackSlot, tid: u32) {
        // SAFETY: the slot holds a result code, so its owner has finished writing
        let (frames, methods, classes) = unsafe { (slot.frames(), slot.method_names(), slot.class_descriptors()) };
        let mut seen = self.framework_names.lock().unwrap_or_else(PoisonError::into_inner);

        for ((frame, method), class) in frames.iter().zip(methods).zip(classes) {
            let (Some(method), Some(class)) = (method, class) else { continue };
            if !is_framework_class(class) || !seen.insert(*frame) {
                continue;
            }

            #[allow(clippy::cast_possible_wrap)]
            let link = Entry::Standard(StandardEntry {
                id: 0,
                entry_type: EntryType::JavaFrameName,
                timestamp: slot.time(),
                tid: tid as i32,
                callid: 0,
                matchid: 0,
                extra: *frame,
            });
            let name = qualified_frame_name(class, method);
            let written = self
                .logger
                .write(link)
                .and_then(|id| self.logger.write_bytes(EntryType::JavaFrameName, id, name.as_bytes()));
            if let Err(e) = written {
                debug!("Failed to log frame name {name}: {e}");
            }
        }
    }
}

struct CollectContext<'a> {
    tracer: &'a dyn Tracer,
    slot: &'a StackSlot,
    ucontext: *mut c_void,
    retcode: StackCollectionRetcode,
}

/// Body run under the slot's recovery point
///
/// Everything from here down may be abandoned by a jump, so nothing in these
/// frames may need dropping.
extern "C" fn collect_trampoline(ctx: *mut c_void) {
    // SAFETY: sample passes a live CollectContext
    let ctx = unsafe { &mut *ctx.cast::<CollectContext<'_>>() };
    ctx.retcode = collect_into_slot(ctx.tracer, ctx.slot, ctx.ucontext);
}

fn collect_into_slot(tracer: &dyn Tracer, slot: &StackSlot, ucontext: *mut c_void) -> StackCollectionRetcode {
    // SAFETY: the calling thread owns the slot (BUSY_WITH_METADATA)
    let (frames, methods, classes) = unsafe { slot.arrays_mut() };
    let mut depth = 0u16;

    let code = match tracer.as_java_tracer() {
        Some(java) => {
            methods.fill(None);
            classes.fill(None);
            java.collect_java_stack(ucontext, frames, methods, classes, &mut depth)
        }
        None => tracer.collect_stack(ucontext, frames, &mut depth),
    };

    slot.set_depth(if code == StackCollectionRetcode::Success { depth } else { 0 });
    code
}
