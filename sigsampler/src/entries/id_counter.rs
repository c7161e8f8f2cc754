use sigsampler_common::ENTRY_ID_INITIAL;
use std::sync::atomic::{AtomicI32, Ordering};

/// Hands out positive entry ids
///
/// Wraps from `i32::MAX` back to 1, never yielding zero (which means "assign
/// one for me") or a negative id.
#[derive(Debug)]
pub struct EntryIdCounter {
    next: AtomicI32,
}

impl EntryIdCounter {
    #[must_use]
    pub const fn new(initial: i32) -> Self {
        EntryIdCounter { next: AtomicI32::new(initial) }
    }

    pub fn next(&self) -> i32 {
        let mut current = self.next.load(Ordering::Relaxed);
        loop {
            let emit = if current <= 0 { 1 } else { current };
            let successor = if emit == i32::MAX { 1 } else { emit + 1 };
            match self.next.compare_exchange_weak(current, successor, Ordering::Relaxed, Ordering::Relaxed) {
                Ok(_) => return emit,
                Err(actual) => current = actual,
            }
        }
    }
}

impl Default for EntryIdCounter {
    fn default() -> Self {
        EntryIdCounter::new(ENTRY_ID_INITIAL)
    }
}
