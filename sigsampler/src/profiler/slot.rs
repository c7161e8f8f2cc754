//! Stack slots: the hand-off records between signal handlers and the logger
//!
//! A slot is owned by whoever moved its state word away from FREE. The
//! signal handler that claims it writes the frame arrays and metadata, then
//! publishes a result code with a release CAS; the logger loop reads the
//! contents after an acquire load of that code and releases the slot back to
//! FREE. Nobody else touches the arrays, so they live in `UnsafeCell`s.

#![allow(unsafe_code)] // UnsafeCell slot contents

use super::jump::JumpBuffer;
use sigsampler_common::{SlotState, MAX_STACK_DEPTH};
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicI64, AtomicU16, AtomicU32, AtomicU64, Ordering};

pub type NameArray = [Option<&'static str>; MAX_STACK_DEPTH];

pub struct StackSlot {
    state: AtomicU64,
    depth: AtomicU16,
    time: AtomicI64,
    profiler_type: AtomicU32,
    jump_buffer: JumpBuffer,
    frames: UnsafeCell<[i64; MAX_STACK_DEPTH]>,
    method_names: UnsafeCell<NameArray>,
    class_descriptors: UnsafeCell<NameArray>,
}

// SAFETY: the UnsafeCell contents are only accessed by the current owner of
// the state word, and ownership changes hands through AcqRel CAS
unsafe impl Sync for StackSlot {}

/// Plain copy of a slot's metadata, for diagnostics and tests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotSnapshot {
    pub state: SlotState,
    pub depth: u16,
    pub time: i64,
    pub profiler_type: u32,
}

impl StackSlot {
    pub fn new() -> Self {
        StackSlot {
            state: AtomicU64::new(SlotState::FREE.0),
            depth: AtomicU16::new(0),
            time: AtomicI64::new(0),
            profiler_type: AtomicU32::new(0),
            jump_buffer: JumpBuffer::new(),
            frames: UnsafeCell::new([0; MAX_STACK_DEPTH]),
            method_names: UnsafeCell::new([None; MAX_STACK_DEPTH]),
            class_descriptors: UnsafeCell::new([None; MAX_STACK_DEPTH]),
        }
    }

    pub fn state(&self) -> SlotState {
        SlotState(self.state.load(Ordering::Acquire))
    }

    /// CAS the state word; true if it held `from`
    pub fn try_transition(&self, from: SlotState, to: SlotState) -> bool {
        self.state.compare_exchange(from.0, to.0, Ordering::AcqRel, Ordering::Acquire).is_ok()
    }

    /// CAS that must succeed; a failure means the slot protocol is broken
    pub fn transition_or_abort(&self, from: SlotState, to: SlotState) {
        if !self.try_transition(from, to) {
            std::process::abort();
        }
    }

    pub fn time(&self) -> i64 {
        self.time.load(Ordering::Relaxed)
    }

    pub fn set_time(&self, time: i64) {
        self.time.store(time, Ordering::Relaxed);
    }

    pub fn profiler_type(&self) -> u32 {
        self.profiler_type.load(Ordering::Relaxed)
    }

    pub fn set_profiler_type(&self, tracer: u32) {
        self.profiler_type.store(tracer, Ordering::Relaxed);
    }

    pub fn depth(&self) -> u16 {
        self.depth.load(Ordering::Relaxed)
    }

    pub fn set_depth(&self, depth: u16) {
        self.depth.store(depth, Ordering::Relaxed);
    }

    pub fn jump_buffer(&self) -> &JumpBuffer {
        &self.jump_buffer
    }

    /// Mutable access to the frame arrays
    ///
    /// # Safety
    ///
    /// Caller must own the slot (its tid in a BUSY state) and hold no other
    /// reference into the arrays.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn arrays_mut(&self) -> (&mut [i64; MAX_STACK_DEPTH], &mut NameArray, &mut NameArray) {
        // SAFETY: per the function contract
        unsafe { (&mut *self.frames.get(), &mut *self.method_names.get(), &mut *self.class_descriptors.get()) }
    }

    /// Captured frames, innermost first
    ///
    /// # Safety
    ///
    /// Caller must hold the slot in a terminal (result code) state.
    pub unsafe fn frames(&self) -> &[i64] {
        let depth = usize::from(self.depth()).min(MAX_STACK_DEPTH);
        // SAFETY: per the function contract, no writer is active
        unsafe { &(&*self.frames.get())[..depth] }
    }

    /// Class descriptors captured alongside the frames by VM tracers
    ///
    /// # Safety
    ///
    /// Same as [`StackSlot::frames`].
    pub unsafe fn class_descriptors(&self) -> &[Option<&'static str>] {
        let depth = usize::from(self.depth()).min(MAX_STACK_DEPTH);
        // SAFETY: per the function contract
        unsafe { &(&*self.class_descriptors.get())[..depth] }
    }

    /// Method names captured alongside the frames by VM tracers
    ///
    /// # Safety
    ///
    /// Same as [`StackSlot::frames`].
    pub unsafe fn method_names(&self) -> &[Option<&'static str>] {
        let depth = usize::from(self.depth()).min(MAX_STACK_DEPTH);
        // SAFETY: per the function contract
        unsafe { &(&*self.method_names.get())[..depth] }
    }

    pub fn snapshot(&self) -> SlotSnapshot {
        SlotSnapshot {
            state: self.state(),
            depth: self.depth(),
            time: self.time(),
            profiler_type: self.profiler_type(),
        }
    }
}

impl Default for StackSlot {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sigsampler_common::slot_state;

    #[test]
    fn test_transitions() {
        let slot = StackSlot::new();
        let busy = SlotState::new(12, slot_state::BUSY);
        assert!(slot.try_transition(SlotState::FREE, busy));
        assert!(!slot.try_transition(SlotState::FREE, busy));
        assert_eq!(slot.state(), busy);

        let meta = SlotState::new(12, slot_state::BUSY_WITH_METADATA);
        slot.transition_or_abort(busy, meta);
        assert_eq!(slot.state().tid(), 12);
    }

    #[test]
    fn test_frames_view_follows_depth() {
        let slot = StackSlot::new();
        // SAFETY: single-threaded test owns the slot
        unsafe {
            let (frames, methods, _) = slot.arrays_mut();
            frames[..3].copy_from_slice(&[1, 2, 3]);
            methods[0] = Some("run");
        }
        slot.set_depth(2);
        // SAFETY: as above
        unsafe {
            assert_eq!(slot.frames(), &[1, 2]);
            assert_eq!(slot.method_names()[0], Some("run"));
        }
    }
}
