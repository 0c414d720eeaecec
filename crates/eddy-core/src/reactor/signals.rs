//! Process signal latch.
//!
//! The async-signal-safe handler only sets a bit in a pending mask and
//! pokes the notify fd so a sleeping shard 0 wakes; the signal poller
//! dispatches registered callbacks from the reactor loop, where arbitrary
//! code is allowed again.

use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};

static PENDING: AtomicU64 = AtomicU64::new(0);
static NOTIFY_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn on_signal(signo: libc::c_int) {
    if (0..64).contains(&signo) {
        PENDING.fetch_or(1 << signo, Ordering::Relaxed);
    }
    let fd = NOTIFY_FD.load(Ordering::Relaxed);
    if fd >= 0 {
        let one: u64 = 1;
        // SAFETY: write(2) is async-signal-safe; the fd outlives the
        // process' signal handling.
        unsafe {
            libc::write(fd, std::ptr::addr_of!(one).cast(), 8);
        }
    }
}

/// Points the handler at the fd it pokes on delivery (shard 0's notifier).
pub(crate) fn set_notify_fd(fd: i32) {
    NOTIFY_FD.store(fd, Ordering::Relaxed);
}

/// Installs the latching handler for `signo`.
pub(crate) fn install(signo: i32) {
    // SAFETY: sigaction with a handler that only touches atomics and
    // write(2).
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = on_signal as libc::sighandler_t;
        action.sa_flags = libc::SA_RESTART;
        libc::sigemptyset(&mut action.sa_mask);
        libc::sigaction(signo, &action, std::ptr::null_mut());
    }
}

/// Current pending mask. The latch is process-global, so a reactor only
/// consumes the bits it has handlers for.
pub(crate) fn pending_mask() -> u64 {
    PENDING.load(Ordering::Acquire)
}

/// Clears the given bits.
pub(crate) fn clear(mask: u64) {
    PENDING.fetch_and(!mask, Ordering::AcqRel);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raise_latches_and_clear_drops_only_given_bits() {
        install(libc::SIGUSR2);
        // SAFETY: raising a signal we just installed a handler for.
        unsafe {
            libc::raise(libc::SIGUSR2);
        }
        let mask = pending_mask();
        assert_ne!(mask & (1 << libc::SIGUSR2), 0);
        clear(1 << libc::SIGUSR2);
        assert_eq!(pending_mask() & (1 << libc::SIGUSR2), 0);
    }
}
