//! VM stacks with method names
//!
//! The VM-specific part (finding the current thread object and walking its
//! interpreter/JIT frames) is supplied by the embedder as a
//! [`VmStackWalker`]. [`JavaTracer`] turns that walk into slot frames plus
//! the parallel method-name and class-descriptor arrays the logger loop uses
//! to name framework frames.

use super::Tracer;
use crate::entries::Logger;
use sigsampler_common::{EntryType, StackCollectionRetcode};
use std::ffi::c_void;
use std::sync::Arc;

/// Class descriptor prefixes of platform code
const FRAMEWORK_PREFIXES: &[&str] = &["Ljava/", "Ljavax/", "Landroid/", "Ldalvik/", "Lkotlin/", "Lcom/android/"];

/// One frame reported by a [`VmStackWalker`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmFrame {
    /// Stable id of the method (logged as the frame value)
    pub method_id: i64,
    pub method_name: Option<&'static str>,
    /// JVM-style descriptor such as `Ljava/lang/Thread;`
    pub class_descriptor: Option<&'static str>,
}

/// Walks the VM stack of the interrupted thread
///
/// Called from signal context: must not allocate, lock or panic. Names must
/// be `'static` because they outlive the signal handler (the logger loop
/// reads them later).
pub trait VmStackWalker: Send + Sync {
    /// Visit frames innermost first until `visit` returns false
    ///
    /// Returns false if the interrupted thread has no VM thread object.
    fn walk(&self, ucontext: *mut c_void, visit: &mut dyn FnMut(VmFrame) -> bool) -> bool;
}

/// Stack collection that also reports method names
pub trait JavaStackCollector {
    fn collect_java_stack(
        &self,
        ucontext: *mut c_void,
        frames: &mut [i64],
        method_names: &mut [Option<&'static str>],
        class_descriptors: &mut [Option<&'static str>],
        depth: &mut u16,
    ) -> StackCollectionRetcode;
}

pub struct JavaTracer<W> {
    walker: W,
    logger: Arc<Logger>,
}

impl<W: VmStackWalker> JavaTracer<W> {
    pub fn new(walker: W, logger: Arc<Logger>) -> Self {
        JavaTracer { walker, logger }
    }

    fn collect(
        &self,
        ucontext: *mut c_void,
        frames: &mut [i64],
        mut names: Option<(&mut [Option<&'static str>], &mut [Option<&'static str>])>,
        depth: &mut u16,
    ) -> StackCollectionRetcode {
        let capacity = frames.len().min(usize::from(u16::MAX));
        let mut count = 0usize;
        let mut overflow = false;

        let has_thread = self.walker.walk(ucontext, &mut |frame| {
            if count >= capacity {
                overflow = true;
                return false;
            }
            frames[count] = frame.method_id;
            if let Some((methods, classes)) = names.as_mut() {
                if let Some(slot) = methods.get_mut(count) {
                    *slot = frame.method_name;
                }
                if let Some(slot) = classes.get_mut(count) {
                    *slot = frame.class_descriptor;
                }
            }
            count += 1;
            true
        });

        *depth = 0;
        if !has_thread {
            return StackCollectionRetcode::NoStackForThread;
        }
        if overflow {
            return StackCollectionRetcode::StackOverflow;
        }
        if count == 0 {
            return StackCollectionRetcode::EmptyStack;
        }
        #[allow(clippy::cast_possible_truncation)]
        let count = count as u16;
        *depth = count;
        StackCollectionRetcode::Success
    }
}

impl<W: VmStackWalker> JavaStackCollector for JavaTracer<W> {
    fn collect_java_stack(
        &self,
        ucontext: *mut c_void,
        frames: &mut [i64],
        method_names: &mut [Option<&'static str>],
        class_descriptors: &mut [Option<&'static str>],
        depth: &mut u16,
    ) -> StackCollectionRetcode {
        self.collect(ucontext, frames, Some((method_names, class_descriptors)), depth)
    }
}

impl<W: VmStackWalker> Tracer for JavaTracer<W> {
    fn collect_stack(&self, ucontext: *mut c_void, frames: &mut [i64], depth: &mut u16) -> StackCollectionRetcode {
        self.collect(ucontext, frames, None, depth)
    }

    fn flush_stack(&self, frames: &[i64], tid: u32, time: i64) {
        self.logger.write_stack_frames(tid, time, frames, EntryType::StackFrame);
    }

    fn as_java_tracer(&self) -> Option<&dyn JavaStackCollector> {
        Some(self)
    }
}

/// True if `descriptor` names a class in a platform namespace
#[must_use]
pub fn is_framework_class(descriptor: &str) -> bool {
    FRAMEWORK_PREFIXES.iter().any(|prefix| descriptor.starts_with(prefix))
}

/// `Ljava/lang/Thread;` + `run` becomes `java.lang.Thread.run`
#[must_use]
pub fn qualified_frame_name(descriptor: &str, method: &str) -> String {
    let class = descriptor.strip_prefix('L').unwrap_or(descriptor);
    let class = class.strip_suffix(';').unwrap_or(class);
    let mut name = class.replace('/', ".");
    name.push('.');
    name.push_str(method);
    name
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::RingBuffer;

    struct FixedWalker(Option<Vec<VmFrame>>);

    impl VmStackWalker for FixedWalker {
        fn walk(&self, _ucontext: *mut c_void, visit: &mut dyn FnMut(VmFrame) -> bool) -> bool {
            let Some(frames) = &self.0 else { return false };
            for frame in frames {
                if !visit(*frame) {
                    break;
                }
            }
            true
        }
    }

    fn frame(id: i64, class: &'static str, method: &'static str) -> VmFrame {
        VmFrame { method_id: id, method_name: Some(method), class_descriptor: Some(class) }
    }

    fn tracer(frames: Option<Vec<VmFrame>>) -> JavaTracer<FixedWalker> {
        JavaTracer::new(FixedWalker(frames), Arc::new(Logger::new(Arc::new(RingBuffer::new(8)))))
    }

    #[test]
    fn test_collects_names_in_parallel() {
        let tracer = tracer(Some(vec![frame(10, "Lcom/example/Foo;", "bar"), frame(20, "Ljava/lang/Thread;", "run")]));
        let mut frames = [0i64; 4];
        let mut methods = [None; 4];
        let mut classes = [None; 4];
        let mut depth = 0;

        let code = tracer.collect_java_stack(std::ptr::null_mut(), &mut frames, &mut methods, &mut classes, &mut depth);
        assert_eq!(code, StackCollectionRetcode::Success);
        assert_eq!(depth, 2);
        assert_eq!(&frames[..2], &[10, 20]);
        assert_eq!(methods[1], Some("run"));
        assert_eq!(classes[0], Some("Lcom/example/Foo;"));
    }

    #[test]
    fn test_result_codes() {
        let mut frames = [0i64; 1];
        let mut depth = 0;

        let no_thread = tracer(None);
        assert_eq!(
            no_thread.collect_stack(std::ptr::null_mut(), &mut frames, &mut depth),
            StackCollectionRetcode::NoStackForThread
        );

        let empty = tracer(Some(Vec::new()));
        assert_eq!(empty.collect_stack(std::ptr::null_mut(), &mut frames, &mut depth), StackCollectionRetcode::EmptyStack);

        let deep = tracer(Some(vec![frame(1, "La;", "a"), frame(2, "Lb;", "b")]));
        assert_eq!(deep.collect_stack(std::ptr::null_mut(), &mut frames, &mut depth), StackCollectionRetcode::StackOverflow);
        assert_eq!(depth, 0);
    }

    #[test]
    fn test_framework_names() {
        assert!(is_framework_class("Landroid/os/Looper;"));
        assert!(is_framework_class("Ljava/lang/Thread;"));
        assert!(!is_framework_class("Lcom/example/App;"));
        assert_eq!(qualified_frame_name("Landroid/os/Looper;", "loop"), "android.os.Looper.loop");
    }
}
