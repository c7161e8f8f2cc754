//! Counting semaphore whose `post` is async-signal-safe
//!
//! `sem_post` is on the POSIX list of signal-safe functions, which is why
//! this wraps an unnamed libc semaphore rather than a Condvar.

#![allow(unsafe_code)] // sem_t FFI

use std::cell::UnsafeCell;
use std::io;

pub struct Semaphore {
    // Boxed so the sem_t never moves after sem_init
    inner: Box<UnsafeCell<libc::sem_t>>,
}

// SAFETY: sem_t is designed for concurrent use through its C API
unsafe impl Send for Semaphore {}
// SAFETY: as above
unsafe impl Sync for Semaphore {}

impl Semaphore {
    /// # Errors
    /// Returns the `sem_init` failure
    pub fn new(initial: u32) -> io::Result<Self> {
        // SAFETY: all-zero is a valid placeholder; sem_init overwrites it
        let inner = Box::new(UnsafeCell::new(unsafe { std::mem::zeroed::<libc::sem_t>() }));
        // SAFETY: inner points to writable, pinned storage
        if unsafe { libc::sem_init(inner.get(), 0, initial) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Semaphore { inner })
    }

    /// Increment; safe to call from a signal handler
    ///
    /// # Errors
    /// `EOVERFLOW` if the count would exceed `SEM_VALUE_MAX`
    pub fn post(&self) -> io::Result<()> {
        // SAFETY: initialized in new, destroyed only in drop
        if unsafe { libc::sem_post(self.inner.get()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Block until the count is positive, then decrement
    ///
    /// # Errors
    /// `Interrupted` when a signal handler ran during the wait
    pub fn wait(&self) -> io::Result<()> {
        // SAFETY: initialized in new, destroyed only in drop
        if unsafe { libc::sem_wait(self.inner.get()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Decrement if positive, without blocking; returns whether it did
    pub fn try_wait(&self) -> bool {
        // SAFETY: initialized in new, destroyed only in drop
        unsafe { libc::sem_trywait(self.inner.get()) == 0 }
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        // SAFETY: no waiters can remain once we hold &mut self
        unsafe { libc::sem_destroy(self.inner.get()) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_post_then_wait() {
        let sem = Semaphore::new(0).unwrap();
        assert!(!sem.try_wait());
        sem.post().unwrap();
        sem.post().unwrap();
        sem.wait().unwrap();
        assert!(sem.try_wait());
        assert!(!sem.try_wait());
    }

    #[test]
    fn test_wakes_blocked_waiter() {
        let sem = Arc::new(Semaphore::new(0).unwrap());
        let waiter = {
            let sem = Arc::clone(&sem);
            thread::spawn(move || sem.wait())
        };
        thread::sleep(std::time::Duration::from_millis(10));
        sem.post().unwrap();
        waiter.join().unwrap().unwrap();
    }
}
