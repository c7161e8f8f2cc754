//! Thin wrappers over the few syscalls the signal path needs
//!
//! Everything here is async-signal-safe.

#![allow(unsafe_code)] // raw syscalls

/// Kernel id of the calling thread
#[must_use]
pub fn thread_id() -> u32 {
    // SAFETY: gettid takes no arguments and cannot fail
    let tid = unsafe { libc::syscall(libc::SYS_gettid) };
    u32::try_from(tid).unwrap_or(0)
}

/// `CLOCK_MONOTONIC` in nanoseconds
#[must_use]
pub fn monotonic_time_ns() -> i64 {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    // SAFETY: ts is a valid out-pointer; CLOCK_MONOTONIC is always supported
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    i64::from(ts.tv_sec) * 1_000_000_000 + i64::from(ts.tv_nsec)
}

/// Restores the calling thread's `errno` when dropped
///
/// Signal handlers hold one so that the interrupted code never observes an
/// `errno` clobbered by the handler's own syscalls.
pub struct ErrnoGuard(libc::c_int);

impl ErrnoGuard {
    #[must_use]
    pub fn save() -> Self {
        // SAFETY: errno_location always returns the calling thread's errno
        ErrnoGuard(unsafe { *errno_location() })
    }
}

impl Drop for ErrnoGuard {
    fn drop(&mut self) {
        // SAFETY: as in save
        unsafe { *errno_location() = self.0 };
    }
}

#[cfg(target_os = "android")]
unsafe fn errno_location() -> *mut libc::c_int {
    // SAFETY: always valid on the calling thread
    unsafe { libc::__errno() }
}

#[cfg(not(target_os = "android"))]
unsafe fn errno_location() -> *mut libc::c_int {
    // SAFETY: always valid on the calling thread
    unsafe { libc::__errno_location() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_ids_differ_between_threads() {
        let main = thread_id();
        let other = std::thread::spawn(thread_id).join().unwrap();
        assert_ne!(main, 0);
        assert_ne!(main, other);
    }

    #[test]
    fn test_monotonic_time_advances() {
        let a = monotonic_time_ns();
        std::thread::sleep(std::time::Duration::from_millis(2));
        assert!(monotonic_time_ns() - a >= 2_000_000);
    }

    #[test]
    fn test_errno_guard_restores() {
        unsafe { *errno_location() = libc::EAGAIN };
        {
            let _guard = ErrnoGuard::save();
            unsafe { *errno_location() = libc::EINTR };
        }
        assert_eq!(std::io::Error::last_os_error().raw_os_error(), Some(libc::EAGAIN));
    }
}
