//! Tracers backed by callbacks from other runtimes
//!
//! A JavaScript engine or Python interpreter that knows how to walk its own
//! stacks registers a C-ABI callback with [`register_external_tracer_callback`].
//! Registration may happen before the profiler creates the matching
//! [`ExternalTracer`]; such callbacks wait in a pending table and are picked
//! up on construction.

#![allow(unsafe_code)] // callback pointers cross an FFI boundary

use super::Tracer;
use crate::domain::SamplerError;
use crate::entries::Logger;
use log::debug;
use sigsampler_common::{tracers, EntryType, StackCollectionRetcode};
use std::collections::HashMap;
use std::ffi::c_void;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};

/// Stack callback registered by an external runtime
///
/// Called from the `SIGPROF` handler with the interrupted context, a frame
/// array of `max_depth` entries and an out-param for the depth. Returns false
/// if the runtime has no stack for the interrupted thread.
pub type ExternalStackCallback =
    unsafe extern "C" fn(ucontext: *mut c_void, frames: *mut i64, depth: *mut u16, max_depth: u16) -> bool;

#[derive(Default)]
struct Registry {
    live: HashMap<u32, Weak<ExternalTracer>>,
    pending: HashMap<u32, ExternalStackCallback>,
}

fn registry() -> &'static Mutex<Registry> {
    static REGISTRY: OnceLock<Mutex<Registry>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(Registry::default()))
}

fn is_single_external_bit(tracer_type: u32) -> bool {
    tracer_type.count_ones() == 1 && tracers::is_external(tracer_type)
}

/// Install the stack callback for an external tracer type
///
/// Returns false if `tracer_type` is not exactly one external tracer bit.
/// If the tracer does not exist yet the callback is kept until it does.
pub fn register_external_tracer_callback(tracer_type: u32, callback: ExternalStackCallback) -> bool {
    if !is_single_external_bit(tracer_type) {
        return false;
    }

    let mut registry = registry().lock().unwrap_or_else(PoisonError::into_inner);
    match registry.live.get(&tracer_type).and_then(Weak::upgrade) {
        Some(tracer) => tracer.set_callback(callback),
        None => {
            debug!("Tracer {tracer_type:#x} not created yet, keeping callback pending");
            registry.pending.insert(tracer_type, callback);
        }
    }
    true
}

pub struct ExternalTracer {
    tracer_type: u32,
    entry_type: EntryType,
    callback: AtomicPtr<()>,
    enabled: AtomicBool,
    logger: Arc<Logger>,
}

impl ExternalTracer {
    /// Create the tracer for `tracer_type`, adopting any pending callback
    pub fn new(tracer_type: u32, logger: Arc<Logger>) -> Result<Arc<Self>, SamplerError> {
        if !is_single_external_bit(tracer_type) {
            return Err(SamplerError::UnknownTracer(tracer_type));
        }

        let entry_type = if tracer_type == tracers::JAVASCRIPT {
            EntryType::JavascriptStackFrame
        } else {
            EntryType::StackFrame
        };
        let tracer = Arc::new(ExternalTracer {
            tracer_type,
            entry_type,
            callback: AtomicPtr::new(std::ptr::null_mut()),
            enabled: AtomicBool::new(true),
            logger,
        });

        let mut registry = registry().lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(callback) = registry.pending.remove(&tracer_type) {
            tracer.set_callback(callback);
        }
        registry.live.insert(tracer_type, Arc::downgrade(&tracer));
        Ok(tracer)
    }

    pub fn tracer_type(&self) -> u32 {
        self.tracer_type
    }

    pub fn set_callback(&self, callback: ExternalStackCallback) {
        self.callback.store(callback as *mut (), Ordering::Release);
    }

    pub fn clear_callback(&self) {
        self.callback.store(std::ptr::null_mut(), Ordering::Release);
    }

    pub fn has_callback(&self) -> bool {
        !self.callback.load(Ordering::Acquire).is_null()
    }

    /// Disabled tracers are skipped by the sampling signal handler
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }
}

impl Tracer for ExternalTracer {
    fn collect_stack(&self, ucontext: *mut c_void, frames: &mut [i64], depth: &mut u16) -> StackCollectionRetcode {
        *depth = 0;
        let raw = self.callback.load(Ordering::Acquire);
        if raw.is_null() {
            return StackCollectionRetcode::TracerDisabled;
        }
        // SAFETY: only ever stored from a valid ExternalStackCallback
        let callback: ExternalStackCallback = unsafe { std::mem::transmute::<*mut (), ExternalStackCallback>(raw) };

        let max_depth = u16::try_from(frames.len()).unwrap_or(u16::MAX);
        let mut reported = 0u16;
        // SAFETY: frames is valid for max_depth writes; reported is a valid out-param
        let has_stack = unsafe { callback(ucontext, frames.as_mut_ptr(), &mut reported, max_depth) };

        if !has_stack {
            return StackCollectionRetcode::NoStackForThread;
        }
        if reported > max_depth {
            return StackCollectionRetcode::StackOverflow;
        }
        if reported == 0 {
            return StackCollectionRetcode::EmptyStack;
        }
        *depth = reported;
        StackCollectionRetcode::Success
    }

    fn flush_stack(&self, frames: &[i64], tid: u32, time: i64) {
        self.logger.write_stack_frames(tid, time, frames, self.entry_type);
    }

    fn as_external(&self) -> Option<&ExternalTracer> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::RingBuffer;

    unsafe extern "C" fn three_frames(_uc: *mut c_void, frames: *mut i64, depth: *mut u16, max_depth: u16) -> bool {
        if max_depth < 3 {
            unsafe { *depth = max_depth + 1 };
            return true;
        }
        for i in 0..3 {
            unsafe { *frames.add(i) = 100 + i as i64 };
        }
        unsafe { *depth = 3 };
        true
    }

    unsafe extern "C" fn no_stack(_uc: *mut c_void, _frames: *mut i64, _depth: *mut u16, _max: u16) -> bool {
        false
    }

    fn logger() -> Arc<Logger> {
        Arc::new(Logger::new(Arc::new(RingBuffer::new(8))))
    }

    #[test]
    fn test_rejects_non_external_bits() {
        assert!(!register_external_tracer_callback(tracers::NATIVE, three_frames));
        assert!(!register_external_tracer_callback(tracers::EXTERNAL_MASK, three_frames));
        assert!(matches!(ExternalTracer::new(tracers::JAVA, logger()), Err(SamplerError::UnknownTracer(_))));
    }

    // Both external bits are exercised in one test: the registry is process-global
    #[test]
    fn test_pending_and_live_registration() {
        assert!(register_external_tracer_callback(tracers::PYTHON, three_frames));
        let python = ExternalTracer::new(tracers::PYTHON, logger()).unwrap();
        assert!(python.has_callback());

        let mut frames = [0i64; 8];
        let mut depth = 0;
        assert_eq!(python.collect_stack(std::ptr::null_mut(), &mut frames, &mut depth), StackCollectionRetcode::Success);
        assert_eq!(&frames[..usize::from(depth)], &[100, 101, 102]);

        let js = ExternalTracer::new(tracers::JAVASCRIPT, logger()).unwrap();
        js.clear_callback();
        assert_eq!(js.collect_stack(std::ptr::null_mut(), &mut frames, &mut depth), StackCollectionRetcode::TracerDisabled);

        assert!(register_external_tracer_callback(tracers::JAVASCRIPT, no_stack));
        assert_eq!(
            js.collect_stack(std::ptr::null_mut(), &mut frames, &mut depth),
            StackCollectionRetcode::NoStackForThread
        );

        let mut small = [0i64; 2];
        assert_eq!(python.collect_stack(std::ptr::null_mut(), &mut small, &mut depth), StackCollectionRetcode::StackOverflow);
        assert_eq!(depth, 0);
    }
}
