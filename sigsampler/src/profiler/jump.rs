//! Non-local jump out of a fault handler
//!
//! `sigsetjmp` returns twice, which Rust cannot model, so the setjmp frame
//! lives in `csrc/jump.c`. [`guarded_call`] runs a body with a recovery
//! point saved into a [`JumpBuffer`]; a fault handler calls [`long_jump`] on
//! the same buffer to abandon the body.
//!
//! Frames between the recovery point and the jump are discarded without
//! unwinding, so they must not own anything with a destructor.

#![allow(unsafe_code)] // FFI to the sigsetjmp shim

use crate::domain::SamplerError;
use std::cell::UnsafeCell;
use std::ffi::{c_int, c_void};

/// Bytes reserved for a `sigjmp_buf` (glibc x86_64 needs 200, aarch64 312)
const JUMP_BUFFER_SIZE: usize = 512;

extern "C" {
    fn sigsampler_sigjmp_buf_size() -> usize;
    fn sigsampler_sigjmp_buf_align() -> usize;
    fn sigsampler_guarded_call(env: *mut c_void, body: extern "C" fn(*mut c_void), ctx: *mut c_void) -> c_int;
    fn sigsampler_siglongjmp(env: *mut c_void, value: c_int) -> !;
}

/// Storage for one saved execution context
#[repr(C, align(16))]
pub struct JumpBuffer(UnsafeCell<[u8; JUMP_BUFFER_SIZE]>);

// SAFETY: only the owning slot's thread saves into or jumps through a buffer
unsafe impl Sync for JumpBuffer {}

impl JumpBuffer {
    #[must_use]
    pub const fn new() -> Self {
        JumpBuffer(UnsafeCell::new([0; JUMP_BUFFER_SIZE]))
    }

    pub fn clear(&self) {
        // SAFETY: only the owning thread touches the buffer
        unsafe { (*self.0.get()).fill(0) };
    }

    fn as_ptr(&self) -> *mut c_void {
        self.0.get().cast()
    }
}

impl Default for JumpBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Check that the platform's `sigjmp_buf` fits in a [`JumpBuffer`]
///
/// # Errors
/// `JumpBufferTooSmall` with the C-side size and alignment
pub fn check_jump_buffer() -> Result<(), SamplerError> {
    // SAFETY: pure queries
    let (size, align) = unsafe { (sigsampler_sigjmp_buf_size(), sigsampler_sigjmp_buf_align()) };
    if size <= JUMP_BUFFER_SIZE && align <= std::mem::align_of::<JumpBuffer>() {
        Ok(())
    } else {
        Err(SamplerError::JumpBufferTooSmall { size, align, capacity: JUMP_BUFFER_SIZE })
    }
}

/// Save a recovery point in `buffer`, then run `body(ctx)`
///
/// Returns 0 if `body` returned, or the value given to [`long_jump`].
///
/// # Safety
///
/// `ctx` must be what `body` expects. `body` must not own values with
/// destructors across a point where it may be jumped out of.
pub unsafe fn guarded_call(buffer: &JumpBuffer, body: extern "C" fn(*mut c_void), ctx: *mut c_void) -> i32 {
    // SAFETY: per the function contract
    unsafe { sigsampler_guarded_call(buffer.as_ptr(), body, ctx) }
}

/// Resume at the recovery point saved in `buffer`
///
/// # Safety
///
/// `buffer` must hold a recovery point saved by a [`guarded_call`] that is
/// still on the current thread's stack.
pub unsafe fn long_jump(buffer: &JumpBuffer, value: i32) -> ! {
    // SAFETY: per the function contract
    unsafe { sigsampler_siglongjmp(buffer.as_ptr(), value) }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Ctx<'a> {
        buffer: &'a JumpBuffer,
        jump: bool,
        reached_end: bool,
    }

    extern "C" fn body(ctx: *mut c_void) {
        let ctx = unsafe { &mut *ctx.cast::<Ctx<'_>>() };
        if ctx.jump {
            unsafe { long_jump(ctx.buffer, 7) };
        }
        ctx.reached_end = true;
    }

    #[test]
    fn test_buffer_is_large_enough() {
        check_jump_buffer().unwrap();
    }

    #[test]
    fn test_normal_return() {
        let buffer = JumpBuffer::new();
        let mut ctx = Ctx { buffer: &buffer, jump: false, reached_end: false };
        let value = unsafe { guarded_call(&buffer, body, std::ptr::addr_of_mut!(ctx).cast()) };
        assert_eq!(value, 0);
        assert!(ctx.reached_end);
    }

    #[test]
    fn test_jump_back() {
        let buffer = JumpBuffer::new();
        let mut ctx = Ctx { buffer: &buffer, jump: true, reached_end: false };
        let value = unsafe { guarded_call(&buffer, body, std::ptr::addr_of_mut!(ctx).cast()) };
        assert_eq!(value, 7);
        assert!(!ctx.reached_end);
    }
}
