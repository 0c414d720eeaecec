//! # Timer Wheels
//!
//! Three independent wheels per shard, one per clock source:
//!
//! | Clock  | Tick source                            | Granularity |
//! |--------|----------------------------------------|-------------|
//! | Steady | OS high-res timer, armed per deadline  | <= 1 us     |
//! | Lowres | shared atomic refreshed every ~10 ms   | ~10 ms      |
//! | Manual | advanced explicitly                    | caller      |
//!
//! The reactor owns the wheels and dispatches expired callbacks as tasks on
//! each timer's owning queue, so callbacks never run inside the expiry walk
//! and may freely arm or cancel timers.

mod clock;
mod wheel;

pub use clock::{LowresClock, ManualClock, SteadyClock, LOWRES_GRANULARITY};
pub use wheel::{Fired, TimerCallback, TimerId, TimerToken, TimerWheel};

/// Which wheel a timer lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockKind {
    /// High-resolution monotonic clock.
    Steady,
    /// Coarse ~10 ms clock.
    Lowres,
    /// Explicitly advanced clock.
    Manual,
}

impl ClockKind {
    /// Reads the current time of this clock.
    #[must_use]
    pub fn now(self) -> u64 {
        match self {
            ClockKind::Steady => SteadyClock::now(),
            ClockKind::Lowres => LowresClock::now(),
            ClockKind::Manual => ManualClock::now(),
        }
    }
}
