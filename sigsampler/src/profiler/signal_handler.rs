//! Process-wide signal handler registrations
//!
//! One [`SignalHandler`] exists per signal number for the life of the
//! process. `enable` installs the handler the first time (remembering the
//! previous disposition) and `disable` switches it off and waits for
//! in-flight invocations to finish. A disabled handler stays installed and
//! forwards every signal to the previous disposition, so other components
//! that share the signal keep working.
//!
//! Inside the handler, [`SignalHandler::enter`] returns a [`HandlerScope`]
//! that keeps the registration's phaser held until it is dropped or the
//! handler leaves through [`HandlerScope::siglongjmp`].

#![allow(unsafe_code)] // sigaction FFI and handler data pointers

use super::jump::{self, JumpBuffer};
use super::phaser::{Phase, Phaser};
use crate::domain::SamplerError;
use std::cell::UnsafeCell;
use std::ffi::{c_int, c_void};
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::sync::{Mutex, PoisonError};

/// `sa_sigaction`-style handler
pub type HandlerFn = extern "C" fn(c_int, *mut libc::siginfo_t, *mut c_void);

const MAX_SIGNAL: usize = 65;

#[allow(clippy::declare_interior_mutable_const)]
const NO_HANDLER: AtomicPtr<SignalHandler> = AtomicPtr::new(std::ptr::null_mut());
static HANDLERS: [AtomicPtr<SignalHandler>; MAX_SIGNAL] = [NO_HANDLER; MAX_SIGNAL];

pub struct SignalHandler {
    signum: c_int,
    handler: HandlerFn,
    enabled: AtomicBool,
    installed: AtomicBool,
    data: AtomicPtr<c_void>,
    phaser: Phaser,
    old_action: UnsafeCell<libc::sigaction>,
    install_lock: Mutex<()>,
}

// SAFETY: old_action is written once under install_lock before `installed`
// is published, and only read afterwards
unsafe impl Sync for SignalHandler {}
// SAFETY: as above
unsafe impl Send for SignalHandler {}

impl SignalHandler {
    /// Registration for `signum`, created on first use
    ///
    /// # Errors
    /// `HandlerConflict` if `signum` is already registered with a different
    /// handler function, `InvalidConfig` for an out-of-range signal.
    pub fn initialize(signum: c_int, handler: HandlerFn) -> Result<&'static SignalHandler, SamplerError> {
        let index = usize::try_from(signum)
            .ok()
            .filter(|i| (1..MAX_SIGNAL).contains(i))
            .ok_or_else(|| SamplerError::InvalidConfig(format!("signal number {signum} out of range")))?;

        let existing = HANDLERS[index].load(Ordering::Acquire);
        if !existing.is_null() {
            // SAFETY: registrations are leaked and never freed
            return Self::matching(unsafe { &*existing }, handler);
        }

        let fresh = Box::into_raw(Box::new(SignalHandler {
            signum,
            handler,
            enabled: AtomicBool::new(false),
            installed: AtomicBool::new(false),
            data: AtomicPtr::new(std::ptr::null_mut()),
            phaser: Phaser::new(),
            // SAFETY: all-zero sigaction is a valid SIG_DFL disposition
            old_action: UnsafeCell::new(unsafe { std::mem::zeroed() }),
            install_lock: Mutex::new(()),
        }));

        match HANDLERS[index].compare_exchange(std::ptr::null_mut(), fresh, Ordering::AcqRel, Ordering::Acquire) {
            // SAFETY: just leaked into the table
            Ok(_) => Ok(unsafe { &*fresh }),
            Err(winner) => {
                // SAFETY: fresh was never shared
                drop(unsafe { Box::from_raw(fresh) });
                // SAFETY: registrations are leaked and never freed
                Self::matching(unsafe { &*winner }, handler)
            }
        }
    }

    fn matching(existing: &'static SignalHandler, handler: HandlerFn) -> Result<&'static SignalHandler, SamplerError> {
        if existing.handler as usize == handler as usize {
            Ok(existing)
        } else {
            Err(SamplerError::HandlerConflict { signum: existing.signum })
        }
    }

    pub fn signum(&self) -> c_int {
        self.signum
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Pointer handed to the handler through [`HandlerScope::data`]
    pub fn set_data(&self, data: *mut c_void) {
        self.data.store(data, Ordering::Release);
    }

    /// Start delivering to the handler, installing it on first use
    ///
    /// # Errors
    /// The `sigaction` failure, if installing fails
    pub fn enable(&self) -> Result<(), SamplerError> {
        self.install()?;
        self.enabled.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Stop delivering to the handler and wait for running invocations
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
        self.phaser.drain();
    }

    fn install(&self) -> Result<(), SamplerError> {
        if self.installed.load(Ordering::Acquire) {
            return Ok(());
        }
        let _guard = self.install_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if self.installed.load(Ordering::Acquire) {
            return Ok(());
        }

        // SAFETY: zeroed sigaction plus explicit fields is a valid action
        let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
        action.sa_sigaction = self.handler as usize;
        action.sa_flags = libc::SA_SIGINFO | libc::SA_NODEFER | libc::SA_ONSTACK | libc::SA_RESTART;
        // Block everything while a handler runs except the faults it must survive
        // SAFETY: sa_mask is a valid sigset_t
        unsafe {
            libc::sigfillset(&mut action.sa_mask);
            libc::sigdelset(&mut action.sa_mask, libc::SIGSEGV);
            libc::sigdelset(&mut action.sa_mask, libc::SIGBUS);
        }

        // SAFETY: old_action is only written here, under install_lock, before publication
        if unsafe { libc::sigaction(self.signum, &action, self.old_action.get()) } != 0 {
            return Err(SamplerError::last_os_error("sigaction"));
        }
        self.installed.store(true, Ordering::Release);
        Ok(())
    }

    /// Enter from inside the installed handler
    ///
    /// Returns `None` if no registration exists for `signum`.
    pub fn enter(signum: c_int) -> Option<HandlerScope> {
        let index = usize::try_from(signum).ok().filter(|i| *i < MAX_SIGNAL)?;
        let registration = HANDLERS[index].load(Ordering::Acquire);
        if registration.is_null() {
            return None;
        }
        // SAFETY: registrations are leaked and never freed
        let handler: &'static SignalHandler = unsafe { &*registration };

        let phase = handler.phaser.enter();
        let enabled = handler.enabled.load(Ordering::SeqCst);
        Some(HandlerScope { handler, phase, enabled })
    }
}

/// Live invocation of a registered handler
///
/// While the scope exists, `disable` on its registration blocks.
pub struct HandlerScope {
    handler: &'static SignalHandler,
    phase: Phase,
    enabled: bool,
}

impl HandlerScope {
    /// Whether the registration was enabled when the handler was entered
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn data(&self) -> *mut c_void {
        self.handler.data.load(Ordering::Acquire)
    }

    /// Leave the scope and resume at the recovery point in `buffer`
    ///
    /// # Safety
    ///
    /// Same contract as [`jump::long_jump`].
    pub unsafe fn siglongjmp(self, buffer: &JumpBuffer, value: i32) -> ! {
        self.handler.phaser.exit(self.phase);
        std::mem::forget(self);
        // SAFETY: per the function contract
        unsafe { jump::long_jump(buffer, value) }
    }

    /// Leave the scope and forward the signal to the previous disposition
    ///
    /// `SIG_IGN` is honoured by doing nothing. For a default-action fault the
    /// default disposition is restored and the signal re-raised, so a real
    /// crash still terminates the process.
    pub fn call_previous_handler(self, signum: c_int, info: *mut libc::siginfo_t, ucontext: *mut c_void) {
        let handler = self.handler;
        drop(self);

        // SAFETY: published before the handler could have run
        let old = unsafe { &*handler.old_action.get() };
        let target = old.sa_sigaction;

        if target == libc::SIG_IGN {
            return;
        }
        if target == libc::SIG_DFL {
            if signum == libc::SIGSEGV || signum == libc::SIGBUS {
                // SAFETY: restoring the default action and re-raising is signal-safe
                unsafe {
                    libc::signal(signum, libc::SIG_DFL);
                    libc::raise(signum);
                }
            }
            return;
        }

        // SAFETY: mask manipulation is signal-safe
        let mut saved: libc::sigset_t = unsafe { std::mem::zeroed() };
        unsafe { libc::pthread_sigmask(libc::SIG_SETMASK, &old.sa_mask, &mut saved) };

        if old.sa_flags & libc::SA_SIGINFO != 0 {
            // SAFETY: SA_SIGINFO handlers have the three-argument signature
            let previous: HandlerFn = unsafe { std::mem::transmute::<usize, HandlerFn>(target) };
            previous(signum, info, ucontext);
        } else {
            // SAFETY: plain handlers take just the signal number
            let previous: extern "C" fn(c_int) = unsafe { std::mem::transmute::<usize, extern "C" fn(c_int)>(target) };
            previous(signum);
        }

        // SAFETY: restores the mask saved above
        unsafe { libc::pthread_sigmask(libc::SIG_SETMASK, &saved, std::ptr::null_mut()) };
    }
}

impl Drop for HandlerScope {
    fn drop(&mut self) {
        self.handler.phaser.exit(self.phase);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    static HITS: AtomicUsize = AtomicUsize::new(0);

    extern "C" fn counting_handler(signum: c_int, info: *mut libc::siginfo_t, ucontext: *mut c_void) {
        let Some(scope) = SignalHandler::enter(signum) else { return };
        if !scope.is_enabled() {
            scope.call_previous_handler(signum, info, ucontext);
            return;
        }
        HITS.fetch_add(1, Ordering::SeqCst);
    }

    extern "C" fn other_handler(_: c_int, _: *mut libc::siginfo_t, _: *mut c_void) {}

    #[test]
    fn test_enable_disable_delivery() {
        // SIGUSR2 is not used by anything else in this crate
        let handler = SignalHandler::initialize(libc::SIGUSR2, counting_handler).unwrap();
        assert!(!handler.is_enabled());
        handler.enable().unwrap();

        unsafe { libc::raise(libc::SIGUSR2) };
        assert_eq!(HITS.load(Ordering::SeqCst), 1);

        handler.disable();
        assert!(!handler.is_enabled());

        // Same function twice is fine, a different one is a conflict
        assert!(SignalHandler::initialize(libc::SIGUSR2, counting_handler).is_ok());
        assert!(matches!(
            SignalHandler::initialize(libc::SIGUSR2, other_handler),
            Err(SamplerError::HandlerConflict { signum }) if signum == libc::SIGUSR2
        ));
    }

    #[test]
    fn test_installed_mask_blocks_all_but_faults() {
        let handler = SignalHandler::initialize(libc::SIGUSR1, other_handler).unwrap();
        handler.enable().unwrap();

        let mut current: libc::sigaction = unsafe { std::mem::zeroed() };
        assert_eq!(unsafe { libc::sigaction(libc::SIGUSR1, std::ptr::null(), &mut current) }, 0);
        for blocked in [libc::SIGPROF, libc::SIGUSR2, libc::SIGALRM, libc::SIGINT] {
            assert_eq!(unsafe { libc::sigismember(&current.sa_mask, blocked) }, 1, "signal {blocked}");
        }
        for open in [libc::SIGSEGV, libc::SIGBUS] {
            assert_eq!(unsafe { libc::sigismember(&current.sa_mask, open) }, 0, "signal {open}");
        }
        handler.disable();
    }

    #[test]
    fn test_out_of_range_signal() {
        assert!(SignalHandler::initialize(0, other_handler).is_err());
        assert!(SignalHandler::initialize(1000, other_handler).is_err());
        assert!(SignalHandler::enter(1000).is_none());
    }
}
