//! One-shot completion slots.
//!
//! A `Ticket<T>` is the caller's handle to a cross-shard (or syscall-pool)
//! result; the matching `Completer<T>` travels with the work and resolves
//! the slot exactly once. State hand-off is a single Release store observed
//! with an Acquire load, so a ticket can be read from any thread.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::Error;

const EMPTY: u8 = 0;
const READY: u8 = 1;
const TAKEN: u8 = 2;

struct Slot<T> {
    state: AtomicU8,
    value: UnsafeCell<Option<Result<T, Error>>>,
}

// SAFETY: `value` is written once before the Release store of READY and
// read once after the matching Acquire; the state machine forbids aliasing.
unsafe impl<T: Send> Send for Slot<T> {}
unsafe impl<T: Send> Sync for Slot<T> {}

/// Caller-side handle to a pending result.
pub struct Ticket<T> {
    slot: Arc<Slot<T>>,
}

/// Producer-side handle; resolves the ticket exactly once. Dropping it
/// unresolved fails the ticket with `request_receiver_down`.
pub struct Completer<T> {
    slot: Option<Arc<Slot<T>>>,
}

/// Creates a connected ticket/completer pair.
#[must_use]
pub fn ticket<T: Send>() -> (Ticket<T>, Completer<T>) {
    let slot = Arc::new(Slot {
        state: AtomicU8::new(EMPTY),
        value: UnsafeCell::new(None),
    });
    (
        Ticket {
            slot: Arc::clone(&slot),
        },
        Completer { slot: Some(slot) },
    )
}

impl<T> Ticket<T> {
    /// Whether a result is available (or was already taken).
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.slot.state.load(Ordering::Acquire) != EMPTY
    }

    /// Takes the result if available. Returns `None` while pending and after
    /// the result has been taken.
    pub fn try_take(&self) -> Option<Result<T, Error>> {
        if self
            .slot
            .state
            .compare_exchange(READY, TAKEN, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return None;
        }
        // SAFETY: we won the READY -> TAKEN transition; the value was
        // published before READY and nobody else will touch it again.
        unsafe { (*self.slot.value.get()).take() }
    }

    /// Blocks until the result arrives or `timeout` passes. For threads
    /// outside the runtime only; reactor code polls [`Ticket::try_take`].
    pub fn wait_blocking(&self, timeout: Duration) -> Option<Result<T, Error>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(r) = self.try_take() {
                return Some(r);
            }
            if Instant::now() >= deadline {
                return None;
            }
            std::thread::yield_now();
        }
    }
}

impl<T> Completer<T> {
    /// Resolves the ticket.
    pub fn complete(mut self, result: Result<T, Error>) {
        let slot = self.slot.take().expect("completer used twice");
        // SAFETY: state is still EMPTY, so no reader touches the value; the
        // Release store below publishes it.
        unsafe {
            *slot.value.get() = Some(result);
        }
        slot.state.store(READY, Ordering::Release);
    }
}

impl<T> Drop for Completer<T> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            // SAFETY: as in `complete`.
            unsafe {
                *slot.value.get() = Some(Err(Error::RequestReceiverDown));
            }
            slot.state.store(READY, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_and_take_once() {
        let (t, c) = ticket::<u32>();
        assert!(!t.is_resolved());
        assert!(t.try_take().is_none());
        c.complete(Ok(5));
        assert!(t.is_resolved());
        assert_eq!(t.try_take().unwrap().unwrap(), 5);
        assert!(t.try_take().is_none());
    }

    #[test]
    fn dropped_completer_fails_receiver_down() {
        let (t, c) = ticket::<u32>();
        drop(c);
        assert!(matches!(
            t.try_take(),
            Some(Err(Error::RequestReceiverDown))
        ));
    }

    #[test]
    fn cross_thread_resolution() {
        let (t, c) = ticket::<String>();
        std::thread::spawn(move || c.complete(Ok("pong".to_string())))
            .join()
            .unwrap();
        let got = t.wait_blocking(Duration::from_secs(1)).unwrap().unwrap();
        assert_eq!(got, "pong");
    }
}
