//! Clock sources for the timer wheels.
//!
//! All deadlines are nanoseconds on a single monotonic timeline anchored at
//! the first use in the process. The low-resolution clock is a shared atomic
//! refreshed (~10 ms) by the shard-0 tick thread, so reading it is a single
//! load. The manual clock only moves when advanced explicitly.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// Refresh period of the low-resolution clock.
pub const LOWRES_GRANULARITY: Duration = Duration::from_millis(10);

fn epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

/// High-resolution monotonic clock.
#[derive(Debug, Clone, Copy)]
pub struct SteadyClock;

impl SteadyClock {
    /// Nanoseconds since the process timeline origin.
    #[must_use]
    pub fn now() -> u64 {
        #[allow(clippy::cast_possible_truncation)]
        let ns = epoch().elapsed().as_nanos() as u64;
        ns
    }
}

static LOWRES_NOW: AtomicU64 = AtomicU64::new(0);

/// Coarse clock: one atomic load, ~10 ms granularity.
#[derive(Debug, Clone, Copy)]
pub struct LowresClock;

impl LowresClock {
    /// Last refreshed timeline value.
    #[must_use]
    pub fn now() -> u64 {
        let v = LOWRES_NOW.load(Ordering::Relaxed);
        if v == 0 {
            // Nobody has refreshed yet (early boot); fall back once.
            Self::refresh()
        } else {
            v
        }
    }

    /// Refreshes the shared value from the steady clock. Called from the
    /// shard-0 tick thread.
    pub fn refresh() -> u64 {
        let now = SteadyClock::now().max(1);
        LOWRES_NOW.store(now, Ordering::Relaxed);
        now
    }
}

static MANUAL_NOW: AtomicU64 = AtomicU64::new(0);

/// Test-facing clock advanced explicitly by the caller.
#[derive(Debug, Clone, Copy)]
pub struct ManualClock;

impl ManualClock {
    /// Current manual time.
    #[must_use]
    pub fn now() -> u64 {
        MANUAL_NOW.load(Ordering::Relaxed)
    }

    /// Advances the manual clock by `d`.
    pub fn advance(d: Duration) {
        #[allow(clippy::cast_possible_truncation)]
        MANUAL_NOW.fetch_add(d.as_nanos() as u64, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steady_is_monotonic() {
        let a = SteadyClock::now();
        let b = SteadyClock::now();
        assert!(b >= a);
    }

    #[test]
    fn lowres_tracks_steady_after_refresh() {
        let refreshed = LowresClock::refresh();
        assert!(LowresClock::now() >= refreshed);
        let steady = SteadyClock::now();
        assert!(refreshed <= steady);
    }

    #[test]
    fn manual_moves_only_on_advance() {
        let a = ManualClock::now();
        let b = ManualClock::now();
        assert_eq!(a, b);
        ManualClock::advance(Duration::from_millis(5));
        assert_eq!(ManualClock::now(), a + 5_000_000);
    }
}
