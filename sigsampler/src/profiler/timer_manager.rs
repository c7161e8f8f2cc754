//! Per-thread sampling timers and the thread detector
//!
//! Every sampled thread gets its own POSIX timer that delivers `SIGPROF` to
//! exactly that thread (`SIGEV_THREAD_ID`). In CPU mode the timer runs on the
//! thread's CPU-time clock, so idle threads are not sampled; in wall-clock
//! mode it runs on `CLOCK_MONOTONIC`.
//!
//! A detector thread (`sampler-detect`) rescans /proc every detection
//! interval, arming timers for new threads and dropping timers of threads
//! that exited.

#![allow(unsafe_code)] // timer_create FFI

use super::thread_list::list_threads;
use crate::domain::{Pid, SamplerError, Tid};
use crate::os;
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use log::{debug, info, warn};
use rand::Rng;
use std::collections::{BTreeSet, HashMap};
use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

pub const DETECT_THREAD_NAME: &str = "sampler-detect";

/// Thread ids allowed to be sampled in wall-clock mode
#[derive(Debug, Default)]
pub struct Whitelist {
    tids: Mutex<BTreeSet<Tid>>,
}

impl Whitelist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if `tid` was already listed
    pub fn add(&self, tid: Tid) -> bool {
        self.lock().insert(tid)
    }

    pub fn remove(&self, tid: Tid) {
        self.lock().remove(&tid);
    }

    pub fn contains(&self, tid: Tid) -> bool {
        self.lock().contains(&tid)
    }

    pub fn snapshot(&self) -> BTreeSet<Tid> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeSet<Tid>> {
        self.tids.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Clock a [`ThreadTimer`] counts against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerClock {
    /// CPU time consumed by the target thread
    ThreadCpu,
    Monotonic,
}

/// POSIX timer signalling `SIGPROF` to one thread; deleted on drop
#[derive(Debug)]
pub struct ThreadTimer {
    timer: libc::timer_t,
    tid: Tid,
}

impl ThreadTimer {
    /// Arm a periodic timer for `tid`
    ///
    /// The first expiry is spread uniformly over `(0, interval]` so threads
    /// discovered together are not sampled in lockstep.
    ///
    /// # Errors
    /// The `timer_create`/`timer_settime` failure; `ESRCH`/`EINVAL` usually
    /// mean the thread already exited
    pub fn new(tid: Tid, interval: Duration, clock: TimerClock) -> io::Result<Self> {
        let clock_id = match clock {
            TimerClock::ThreadCpu => thread_cpu_clock(tid),
            TimerClock::Monotonic => libc::CLOCK_MONOTONIC,
        };

        let tid_raw = i32::try_from(tid.0).map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
        // SAFETY: zeroed sigevent with the notify fields set is valid input
        let mut sev: libc::sigevent = unsafe { std::mem::zeroed() };
        sev.sigev_notify = libc::SIGEV_THREAD_ID;
        sev.sigev_signo = libc::SIGPROF;
        sev.sigev_notify_thread_id = tid_raw;

        // SAFETY: all pointers are to valid locals
        let mut timer: libc::timer_t = unsafe { std::mem::zeroed() };
        if unsafe { libc::timer_create(clock_id, &mut sev, &mut timer) } != 0 {
            return Err(io::Error::last_os_error());
        }
        let armed = ThreadTimer { timer, tid };

        let interval_ns = u64::try_from(interval.as_nanos()).unwrap_or(u64::MAX).max(1);
        let first_ns = rand::rng().random_range(1..=interval_ns);
        let spec = libc::itimerspec { it_interval: timespec_from_ns(interval_ns), it_value: timespec_from_ns(first_ns) };
        // SAFETY: timer was just created
        if unsafe { libc::timer_settime(armed.timer, 0, &spec, std::ptr::null_mut()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(armed)
    }

    pub fn tid(&self) -> Tid {
        self.tid
    }
}

impl Drop for ThreadTimer {
    fn drop(&mut self) {
        // SAFETY: timer was created in new and is deleted exactly once
        if unsafe { libc::timer_delete(self.timer) } != 0 {
            debug!("timer_delete for {} failed: {}", self.tid, io::Error::last_os_error());
        }
    }
}

/// Kernel clock id of a thread's CPU-time clock (`MAKE_THREAD_CPUCLOCK`)
fn thread_cpu_clock(tid: Tid) -> libc::clockid_t {
    const CPUCLOCK_SCHED: libc::clockid_t = 2;
    const CPUCLOCK_PERTHREAD: libc::clockid_t = 4;
    #[allow(clippy::cast_possible_wrap)]
    let tid = tid.0 as libc::clockid_t;
    (!tid << 3) | CPUCLOCK_PERTHREAD | CPUCLOCK_SCHED
}

#[allow(clippy::cast_possible_wrap, clippy::cast_possible_truncation)]
fn timespec_from_ns(ns: u64) -> libc::timespec {
    libc::timespec { tv_sec: (ns / 1_000_000_000) as libc::time_t, tv_nsec: (ns % 1_000_000_000) as libc::c_long }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerConfig {
    pub thread_detect_interval: Duration,
    pub sampling_rate: Duration,
    pub wall_clock: bool,
}

/// Owns the detector thread and, through it, every thread timer
pub struct TimerManager {
    config: TimerConfig,
    whitelist: Option<Arc<Whitelist>>,
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl TimerManager {
    /// `whitelist`, when set, restricts sampling to the listed threads
    pub fn new(config: TimerConfig, whitelist: Option<Arc<Whitelist>>) -> Self {
        TimerManager { config, whitelist, stop_tx: None, handle: None }
    }

    /// Spawn the detector; it arms timers immediately, then every interval
    ///
    /// # Errors
    /// Returns an error if the thread cannot be spawned
    pub fn start(&mut self) -> Result<(), SamplerError> {
        if self.handle.is_some() {
            return Ok(());
        }
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let config = self.config;
        let whitelist = self.whitelist.clone();

        let handle = std::thread::Builder::new().name(DETECT_THREAD_NAME.into()).spawn(move || {
            let pid = Pid::current();
            let own_tid = Tid(os::thread_id());
            let mut timers = HashMap::new();
            info!("Thread detector started (interval {:?}, rate {:?})", config.thread_detect_interval, config.sampling_rate);

            loop {
                update_thread_timers(&mut timers, pid, own_tid, &config, whitelist.as_deref());
                match stop_rx.recv_timeout(config.thread_detect_interval) {
                    Err(RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }

            debug!("Thread detector stopping, releasing {} timers", timers.len());
        })?;

        self.stop_tx = Some(stop_tx);
        self.handle = Some(handle);
        Ok(())
    }

    /// Stop the detector and delete all timers; idempotent
    pub fn stop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.try_send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Thread detector panicked");
            }
        }
    }
}

impl Drop for TimerManager {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Reconcile `timers` with the live threads of `pid`
fn update_thread_timers(
    timers: &mut HashMap<Tid, ThreadTimer>,
    pid: Pid,
    own_tid: Tid,
    config: &TimerConfig,
    whitelist: Option<&Whitelist>,
) {
    let mut threads = match list_threads(pid) {
        Ok(threads) => threads,
        Err(e) => {
            warn!("Failed to list threads of {pid}: {e}");
            return;
        }
    };
    threads.remove(&own_tid);
    if let Some(whitelist) = whitelist {
        let allowed = whitelist.snapshot();
        threads.retain(|tid| allowed.contains(tid));
    }

    timers.retain(|tid, _| threads.contains(tid));

    let clock = if config.wall_clock { TimerClock::Monotonic } else { TimerClock::ThreadCpu };
    for tid in threads {
        if timers.contains_key(&tid) {
            continue;
        }
        match ThreadTimer::new(tid, config.sampling_rate, clock) {
            Ok(timer) => {
                timers.insert(tid, timer);
            }
            Err(e) if matches!(e.raw_os_error(), Some(libc::ESRCH | libc::EINVAL)) => {
                debug!("{tid} exited before its timer was armed");
            }
            Err(e) => warn!("Failed to create sampling timer for {tid}: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_whitelist_add_remove() {
        let whitelist = Whitelist::new();
        whitelist.add(Tid(10));
        whitelist.add(Tid(11));
        assert!(!whitelist.add(Tid(11)));
        whitelist.remove(Tid(10));
        assert!(!whitelist.contains(Tid(10)));
        assert_eq!(whitelist.snapshot().into_iter().collect::<Vec<_>>(), vec![Tid(11)]);
    }

    #[test]
    fn test_thread_cpu_clock_encoding() {
        // MAKE_THREAD_CPUCLOCK(1, CPUCLOCK_SCHED) from the kernel headers
        assert_eq!(thread_cpu_clock(Tid(1)), -10);
    }

    #[test]
    fn test_timespec_split() {
        let ts = timespec_from_ns(2_500_000_000);
        assert_eq!(ts.tv_sec, 2);
        assert_eq!(ts.tv_nsec, 500_000_000);
    }

    #[test]
    fn test_first_expiry_within_interval() {
        let interval = Duration::from_secs(3600);
        for _ in 0..8 {
            let timer = ThreadTimer::new(Tid(os::thread_id()), interval, TimerClock::Monotonic).unwrap();
            let mut current: libc::itimerspec = unsafe { std::mem::zeroed() };
            assert_eq!(unsafe { libc::timer_gettime(timer.timer, &mut current) }, 0);

            let remaining = Duration::new(current.it_value.tv_sec as u64, current.it_value.tv_nsec as u32);
            assert!(remaining > Duration::ZERO && remaining <= interval, "{remaining:?}");
            assert_eq!(current.it_interval.tv_sec, 3600);
        }
    }

    #[test]
    fn test_update_respects_whitelist_and_exits() {
        let pid = Pid::current();
        let me = Tid(os::thread_id());
        let config = TimerConfig {
            thread_detect_interval: Duration::from_millis(10),
            // Long enough that no SIGPROF fires during the test
            sampling_rate: Duration::from_secs(3600),
            wall_clock: true,
        };
        let whitelist = Whitelist::new();
        whitelist.add(me);
        whitelist.add(Tid(u32::MAX - 1));

        let mut timers = HashMap::new();
        update_thread_timers(&mut timers, pid, Tid(0), &config, Some(&whitelist));
        assert_eq!(timers.keys().copied().collect::<Vec<_>>(), vec![me]);

        whitelist.remove(me);
        update_thread_timers(&mut timers, pid, Tid(0), &config, Some(&whitelist));
        assert!(timers.is_empty());
    }

    #[test]
    fn test_manager_start_stop() {
        let whitelist = Arc::new(Whitelist::new());
        let mut manager = TimerManager::new(
            TimerConfig {
                thread_detect_interval: Duration::from_millis(5),
                sampling_rate: Duration::from_secs(3600),
                wall_clock: true,
            },
            Some(whitelist),
        );
        manager.start().unwrap();
        std::thread::sleep(Duration::from_millis(20));
        manager.stop();
        manager.stop();
    }
}
