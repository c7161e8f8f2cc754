//! Two-phase reader counter for draining signal handlers
//!
//! Handlers `enter` before touching shared state and `exit` afterwards; both
//! are wait-free and signal-safe. `drain` (never called from a handler)
//! returns once every handler that entered before the call has exited.
//!
//! Two counters alternate: while one is being drained (its high bit set) new
//! entries go to the other, so a steady stream of signals cannot starve the
//! drainer.

use std::sync::atomic::{fence, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

const DRAINING: usize = 1 << (usize::BITS - 1);
const DRAIN_POLL: Duration = Duration::from_micros(50);

/// Which counter an `enter` incremented
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Phase(usize);

#[derive(Debug, Default)]
pub struct Phaser {
    counters: [AtomicUsize; 2],
    drain_lock: Mutex<()>,
}

impl Phaser {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter(&self) -> Phase {
        let mut index = 0;
        loop {
            let counter = &self.counters[index];
            if counter.load(Ordering::Relaxed) & DRAINING == 0 {
                counter.fetch_add(1, Ordering::Relaxed);
                break;
            }
            index ^= 1;
        }
        fence(Ordering::SeqCst);
        Phase(index)
    }

    pub fn exit(&self, phase: Phase) {
        fence(Ordering::SeqCst);
        self.counters[phase.0].fetch_sub(1, Ordering::Release);
    }

    /// Wait for every handler that entered before this call to exit
    pub fn drain(&self) {
        let _serialized = self.drain_lock.lock().unwrap_or_else(PoisonError::into_inner);
        for counter in &self.counters {
            counter.fetch_or(DRAINING, Ordering::SeqCst);
            while counter.load(Ordering::Acquire) != DRAINING {
                std::thread::sleep(DRAIN_POLL);
            }
            counter.fetch_and(!DRAINING, Ordering::SeqCst);
        }
    }

    /// Handlers currently inside, across both phases
    pub fn active(&self) -> usize {
        self.counters.iter().map(|c| c.load(Ordering::Acquire) & !DRAINING).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_enter_exit_balance() {
        let phaser = Phaser::new();
        let a = phaser.enter();
        let b = phaser.enter();
        assert_eq!(phaser.active(), 2);
        phaser.exit(a);
        phaser.exit(b);
        assert_eq!(phaser.active(), 0);
        phaser.drain();
    }

    #[test]
    fn test_drain_waits_for_inflight() {
        let phaser = Arc::new(Phaser::new());
        let exited = Arc::new(AtomicBool::new(false));

        let phase = phaser.enter();
        let drainer = {
            let phaser = Arc::clone(&phaser);
            let exited = Arc::clone(&exited);
            thread::spawn(move || {
                phaser.drain();
                assert!(exited.load(Ordering::SeqCst), "drain returned before exit");
            })
        };

        thread::sleep(Duration::from_millis(20));
        exited.store(true, Ordering::SeqCst);
        phaser.exit(phase);
        drainer.join().unwrap();
    }

    #[test]
    fn test_enter_during_drain_uses_other_phase() {
        let phaser = Phaser::new();
        phaser.counters[0].fetch_or(DRAINING, Ordering::SeqCst);
        let phase = phaser.enter();
        assert_eq!(phase, Phase(1));
        phaser.exit(phase);
        phaser.counters[0].fetch_and(!DRAINING, Ordering::SeqCst);
    }
}
