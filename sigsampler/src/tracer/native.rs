//! Frame-pointer unwinder
//!
//! Starts at the PC and frame pointer saved in the signal's `ucontext_t` and
//! follows the `[saved fp, return address]` records that frame-pointer
//! prologues push on both x86_64 and aarch64. A corrupt chain makes the walk
//! fault; the sampling coordinator turns that into `SignalInterrupt`.

#![allow(unsafe_code)] // reads foreign stack memory

use super::Tracer;
use crate::entries::Logger;
use sigsampler_common::{EntryType, StackCollectionRetcode};
use std::ffi::c_void;
use std::sync::Arc;

/// Frame records further than this above the stack pointer end the walk
const MAX_STACK_SPAN: usize = 8 * 1024 * 1024;

/// Registers needed to start a walk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRegisters {
    pub pc: usize,
    pub fp: usize,
    pub sp: usize,
}

pub struct NativeTracer {
    logger: Arc<Logger>,
}

impl NativeTracer {
    pub fn new(logger: Arc<Logger>) -> Self {
        NativeTracer { logger }
    }
}

impl Tracer for NativeTracer {
    fn collect_stack(&self, ucontext: *mut c_void, frames: &mut [i64], depth: &mut u16) -> StackCollectionRetcode {
        *depth = 0;
        // SAFETY: the kernel hands the handler a valid ucontext or null
        let Some(regs) = (unsafe { registers_from_ucontext(ucontext) }) else {
            return StackCollectionRetcode::EmptyStack;
        };
        // SAFETY: reads stay within [sp, sp + MAX_STACK_SPAN]; a fault is recovered by the caller
        unsafe { walk_frame_chain(regs, frames, depth) }
    }

    fn flush_stack(&self, frames: &[i64], tid: u32, time: i64) {
        self.logger.write_stack_frames(tid, time, frames, EntryType::StackFrame);
    }
}

/// Follow a frame-pointer chain starting at `regs`
///
/// # Safety
///
/// Dereferences candidate frame records between `regs.sp` and
/// `regs.sp + MAX_STACK_SPAN`. Must run where a fault is recoverable, or on a
/// chain known to be valid.
pub unsafe fn walk_frame_chain(regs: FrameRegisters, frames: &mut [i64], depth: &mut u16) -> StackCollectionRetcode {
    let capacity = frames.len().min(usize::from(u16::MAX));
    let mut count = 0usize;

    let mut push = |frame: usize| -> bool {
        if count >= capacity {
            return false;
        }
        #[allow(clippy::cast_possible_wrap)]
        let frame = frame as i64;
        frames[count] = frame;
        count += 1;
        true
    };

    if regs.pc != 0 && !push(regs.pc) {
        *depth = 0;
        return StackCollectionRetcode::StackOverflow;
    }

    let align = std::mem::align_of::<usize>();
    let mut fp = regs.fp;
    while fp != 0 && fp % align == 0 && fp >= regs.sp && fp - regs.sp <= MAX_STACK_SPAN {
        let record = fp as *const usize;
        // SAFETY: per the function contract
        let (next_fp, ret) = unsafe { (std::ptr::read_volatile(record), std::ptr::read_volatile(record.add(1))) };
        if ret == 0 {
            break;
        }
        if !push(ret) {
            *depth = 0;
            return StackCollectionRetcode::StackOverflow;
        }
        if next_fp <= fp {
            break;
        }
        fp = next_fp;
    }

    if count == 0 {
        *depth = 0;
        return StackCollectionRetcode::EmptyStack;
    }
    #[allow(clippy::cast_possible_truncation)]
    let count = count as u16;
    *depth = count;
    StackCollectionRetcode::Success
}

/// Extract PC, FP and SP from a signal `ucontext_t`
///
/// # Safety
///
/// `ucontext` must be null or point to a valid `ucontext_t`.
#[cfg(all(any(target_os = "linux", target_os = "android"), target_arch = "x86_64"))]
pub unsafe fn registers_from_ucontext(ucontext: *mut c_void) -> Option<FrameRegisters> {
    if ucontext.is_null() {
        return None;
    }
    // SAFETY: per the function contract
    let uc = unsafe { &*(ucontext as *const libc::ucontext_t) };
    let gregs = &uc.uc_mcontext.gregs;
    #[allow(clippy::cast_sign_loss)]
    let regs = FrameRegisters {
        pc: gregs[libc::REG_RIP as usize] as usize,
        fp: gregs[libc::REG_RBP as usize] as usize,
        sp: gregs[libc::REG_RSP as usize] as usize,
    };
    Some(regs)
}

/// Extract PC, FP and SP from a signal `ucontext_t`
///
/// # Safety
///
/// `ucontext` must be null or point to a valid `ucontext_t`.
#[cfg(all(any(target_os = "linux", target_os = "android"), target_arch = "aarch64"))]
pub unsafe fn registers_from_ucontext(ucontext: *mut c_void) -> Option<FrameRegisters> {
    if ucontext.is_null() {
        return None;
    }
    // SAFETY: per the function contract
    let uc = unsafe { &*(ucontext as *const libc::ucontext_t) };
    let mc = &uc.uc_mcontext;
    #[allow(clippy::cast_possible_truncation)]
    let regs = FrameRegisters { pc: mc.pc as usize, fp: mc.regs[29] as usize, sp: mc.sp as usize };
    Some(regs)
}

/// Unsupported platform: every sample is empty
///
/// # Safety
///
/// Always safe; `unsafe` only to match the supported-platform signature.
#[cfg(not(all(any(target_os = "linux", target_os = "android"), any(target_arch = "x86_64", target_arch = "aarch64"))))]
pub unsafe fn registers_from_ucontext(_ucontext: *mut c_void) -> Option<FrameRegisters> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::RingBuffer;

    /// Builds a fake downward-growing stack holding a chain of frame records
    fn synthetic_stack(returns: &[usize]) -> (Vec<usize>, FrameRegisters) {
        let mut stack = vec![0usize; 2 * returns.len() + 4];
        let base = stack.as_ptr() as usize;
        let word = std::mem::size_of::<usize>();
        for (i, ret) in returns.iter().enumerate() {
            let slot = 2 + 2 * i;
            let next = if i + 1 < returns.len() { base + (slot + 2) * word } else { 0 };
            stack[slot] = next;
            stack[slot + 1] = *ret;
        }
        let regs = FrameRegisters { pc: 0xaaaa, fp: base + 2 * word, sp: base };
        (stack, regs)
    }

    #[test]
    fn test_walks_synthetic_chain() {
        let (_stack, regs) = synthetic_stack(&[0x1111, 0x2222, 0x3333]);
        let mut frames = [0i64; 16];
        let mut depth = 0;
        let code = unsafe { walk_frame_chain(regs, &mut frames, &mut depth) };
        assert_eq!(code, StackCollectionRetcode::Success);
        assert_eq!(&frames[..usize::from(depth)], &[0xaaaa, 0x1111, 0x2222, 0x3333]);
    }

    #[test]
    fn test_overflow_keeps_nothing() {
        let (_stack, regs) = synthetic_stack(&[1, 2, 3, 4, 5]);
        let mut frames = [0i64; 3];
        let mut depth = 0;
        let code = unsafe { walk_frame_chain(regs, &mut frames, &mut depth) };
        assert_eq!(code, StackCollectionRetcode::StackOverflow);
        assert_eq!(depth, 0);
    }

    #[test]
    fn test_frame_below_sp_stops_walk() {
        let (_stack, mut regs) = synthetic_stack(&[0x1111]);
        regs.sp = regs.fp + 64;
        let mut frames = [0i64; 4];
        let mut depth = 0;
        let code = unsafe { walk_frame_chain(regs, &mut frames, &mut depth) };
        assert_eq!(code, StackCollectionRetcode::Success);
        assert_eq!(depth, 1);
    }

    #[test]
    fn test_null_ucontext_is_empty() {
        let tracer = NativeTracer::new(Arc::new(Logger::new(Arc::new(RingBuffer::new(8)))));
        let mut frames = [0i64; 8];
        let mut depth = 5;
        let code = tracer.collect_stack(std::ptr::null_mut(), &mut frames, &mut depth);
        assert_eq!(code, StackCollectionRetcode::EmptyStack);
        assert_eq!(depth, 0);
    }
}
