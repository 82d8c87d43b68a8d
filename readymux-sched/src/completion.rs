//! Single-resolution completion promise.
//!
//! A [`Completion`] is resolved at most once; every later resolution attempt
//! is a detectable no-op. It replaces continuation machinery with an explicit
//! promise that one side resolves and the other side waits on.

use parking_lot::{Condvar, Mutex};
use std::time::Duration;

enum Slot<T> {
    Pending,
    Ready(T),
    Taken,
}

/// A value that will be produced exactly once.
///
/// Consumption comes in two shapes: [`Completion::wait`] observes the value
/// by clone (for shared lifetime signals), [`Completion::take_wait`] moves it
/// out (for one-shot operation results). A given completion should stick to
/// one shape.
pub struct Completion<T> {
    slot: Mutex<Slot<T>>,
    cond: Condvar,
}

impl<T> Completion<T> {
    pub fn new() -> Self {
        Completion {
            slot: Mutex::new(Slot::Pending),
            cond: Condvar::new(),
        }
    }

    /// Resolves the completion. Returns true if this call won the resolution;
    /// false if a value was already set (or taken), in which case `value` is
    /// dropped.
    pub fn resolve(&self, value: T) -> bool {
        let mut slot = self.slot.lock();
        match *slot {
            Slot::Pending => {
                *slot = Slot::Ready(value);
                self.cond.notify_all();
                true
            }
            Slot::Ready(_) | Slot::Taken => false,
        }
    }

    /// True once a resolution has happened, whether or not it was taken.
    pub fn is_resolved(&self) -> bool {
        !matches!(*self.slot.lock(), Slot::Pending)
    }

    /// Blocks until resolved and moves the value out. Returns `None` if the
    /// value was already taken by an earlier call.
    pub fn take_wait(&self) -> Option<T> {
        let mut slot = self.slot.lock();
        while matches!(*slot, Slot::Pending) {
            self.cond.wait(&mut slot);
        }
        match std::mem::replace(&mut *slot, Slot::Taken) {
            Slot::Ready(value) => Some(value),
            _ => None,
        }
    }
}

impl<T: Clone> Completion<T> {
    /// Blocks until resolved and returns a clone, leaving the value in place
    /// for other observers.
    pub fn wait(&self) -> T {
        let mut slot = self.slot.lock();
        loop {
            if let Slot::Ready(value) = &*slot {
                return value.clone();
            }
            self.cond.wait(&mut slot);
        }
    }

    /// Like [`Completion::wait`] with an upper bound; `None` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<T> {
        let mut slot = self.slot.lock();
        loop {
            if let Slot::Ready(value) = &*slot {
                return Some(value.clone());
            }
            if self.cond.wait_for(&mut slot, timeout).timed_out() {
                return match &*slot {
                    Slot::Ready(value) => Some(value.clone()),
                    _ => None,
                };
            }
        }
    }

    /// Non-blocking peek.
    pub fn try_get(&self) -> Option<T> {
        match &*self.slot.lock() {
            Slot::Ready(value) => Some(value.clone()),
            _ => None,
        }
    }
}

impl<T> Default for Completion<T> {
    fn default() -> Self {
        Completion::new()
    }
}
