//! # Stall Detector
//!
//! Per-shard watchdog that notices when the reactor thread stops making
//! progress. A sibling OS thread observes the shard's task counter through
//! atomics and fires at `threshold * backoff` past the task-run mark:
//!
//! - no task processed since the mark: record a stall (rate limited per
//!   minute), double the backoff, re-arm;
//! - progress seen: refresh the mark and re-arm at `threshold`.
//!
//! The same thread sets the reactor's preemption flag every task quota and,
//! on shard 0, refreshes the low-resolution clock. Sleep disarms the
//! watchdog; wake re-arms it.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::timer::{LowresClock, SteadyClock, LOWRES_GRANULARITY};

/// Stall detector tuning.
#[derive(Debug, Clone, Copy)]
pub struct StallConfig {
    /// Reactor-blocked threshold (`--blocked-reactor-notify-ms`).
    pub threshold: Duration,
    /// Report budget per minute (`--blocked-reactor-reports-per-minute`).
    pub reports_per_minute: u32,
}

impl Default for StallConfig {
    fn default() -> Self {
        Self {
            threshold: Duration::from_millis(25),
            reports_per_minute: 5,
        }
    }
}

/// State shared between the reactor thread and its watchdog.
pub(crate) struct StallShared {
    /// Tasks the reactor has completed; written by the reactor only.
    pub(crate) tasks_processed: AtomicU64,
    /// `tasks_processed + 1` at the last mark; 0 while no task run is
    /// active.
    last_seen: AtomicU64,
    /// Steady-clock start of the current task-run window.
    run_started_at: AtomicU64,
    /// Current backoff factor (power of two).
    report_at: AtomicU32,
    /// Watchdog disarmed while the reactor sleeps.
    sleeping: AtomicBool,
    /// Stall records produced since boot.
    stalls: AtomicU64,
    /// Reports in the current one-minute window.
    reported_this_minute: AtomicU32,
    /// Start of the current one-minute window.
    minute_mark: AtomicU64,
    shutdown: AtomicBool,
}

/// Per-shard stall detector: shared state plus the watchdog thread.
pub(crate) struct StallDetector {
    shared: Arc<StallShared>,
    config: StallConfig,
    watchdog: Option<JoinHandle<()>>,
}

impl StallDetector {
    /// Spawns the watchdog. `preempt` is the reactor's preemption flag, set
    /// every `task_quota`; shard 0 passes `drive_lowres_clock`.
    pub(crate) fn new(
        shard: usize,
        config: StallConfig,
        preempt: Arc<AtomicBool>,
        task_quota: Duration,
        drive_lowres_clock: bool,
    ) -> Self {
        let shared = Arc::new(StallShared {
            tasks_processed: AtomicU64::new(0),
            last_seen: AtomicU64::new(0),
            run_started_at: AtomicU64::new(0),
            report_at: AtomicU32::new(1),
            sleeping: AtomicBool::new(false),
            stalls: AtomicU64::new(0),
            reported_this_minute: AtomicU32::new(0),
            minute_mark: AtomicU64::new(SteadyClock::now()),
            shutdown: AtomicBool::new(false),
        });
        let watchdog = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name(format!("eddy-watchdog-{shard}"))
                .spawn(move || {
                    watchdog_main(
                        shard,
                        &shared,
                        config,
                        &preempt,
                        task_quota,
                        drive_lowres_clock,
                    );
                })
                .expect("spawn watchdog thread")
        };
        Self {
            shared,
            config,
            watchdog: Some(watchdog),
        }
    }

    pub(crate) fn shared(&self) -> &Arc<StallShared> {
        &self.shared
    }

    /// Marks the start of a task-running window.
    pub(crate) fn start_task_run(&self, now: u64) {
        self.flush_suppressions(now);
        self.shared.report_at.store(1, Ordering::Relaxed);
        self.shared.run_started_at.store(now, Ordering::Relaxed);
        let mark = self
            .shared
            .tasks_processed
            .load(Ordering::Relaxed)
            .wrapping_add(1);
        self.shared.last_seen.store(mark, Ordering::Release);
    }

    /// Marks the end of the window; the watchdog goes quiet.
    pub(crate) fn end_task_run(&self) {
        self.shared.last_seen.store(0, Ordering::Release);
    }

    /// Disarms the watchdog for a reactor sleep.
    pub(crate) fn start_sleep(&self) {
        self.shared.sleeping.store(true, Ordering::Release);
    }

    /// Re-arms after wake.
    pub(crate) fn end_sleep(&self) {
        self.shared.sleeping.store(false, Ordering::Release);
    }

    /// Stall records produced so far.
    pub(crate) fn stalls(&self) -> u64 {
        self.shared.stalls.load(Ordering::Relaxed)
    }

    /// Once per minute, logs how many reports the rate limit swallowed.
    fn flush_suppressions(&self, now: u64) {
        let minute_mark = self.shared.minute_mark.load(Ordering::Relaxed);
        if now.saturating_sub(minute_mark) < 60_000_000_000 {
            return;
        }
        let reported = self.shared.reported_this_minute.swap(0, Ordering::Relaxed);
        self.shared.minute_mark.store(now, Ordering::Relaxed);
        if reported > self.config.reports_per_minute {
            let suppressed = reported - self.config.reports_per_minute;
            tracing::warn!(suppressed, "rate-limit: suppressed stall reports");
        }
    }
}

impl Drop for StallDetector {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.watchdog.take() {
            let _ = handle.join();
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
fn watchdog_main(
    shard: usize,
    shared: &StallShared,
    config: StallConfig,
    preempt: &AtomicBool,
    task_quota: Duration,
    drive_lowres_clock: bool,
) {
    let threshold_ns = config.threshold.as_nanos() as u64;
    let mut next_stall_check = SteadyClock::now() + threshold_ns;
    let mut next_clock_refresh = 0u64;
    loop {
        std::thread::sleep(task_quota);
        if shared.shutdown.load(Ordering::Acquire) {
            return;
        }
        // Cooperative preemption: one flag write per quota.
        preempt.store(true, Ordering::Relaxed);

        let now = SteadyClock::now();
        if drive_lowres_clock && now >= next_clock_refresh {
            LowresClock::refresh();
            next_clock_refresh = now + LOWRES_GRANULARITY.as_nanos() as u64;
        }

        if shared.sleeping.load(Ordering::Acquire) {
            next_stall_check = now + threshold_ns;
            continue;
        }
        if now < next_stall_check {
            continue;
        }
        let last_seen = shared.last_seen.load(Ordering::Acquire);
        let processed = shared.tasks_processed.load(Ordering::Relaxed);
        if last_seen == 0 {
            // No task run in progress.
            shared.report_at.store(1, Ordering::Relaxed);
            next_stall_check = now + threshold_ns;
        } else if last_seen == processed.wrapping_add(1) {
            // The mark has not moved: the reactor is stuck in one task.
            shared.stalls.fetch_add(1, Ordering::Relaxed);
            let reported = shared.reported_this_minute.fetch_add(1, Ordering::Relaxed);
            if reported < config.reports_per_minute {
                let stalled_for = now - shared.run_started_at.load(Ordering::Relaxed);
                tracing::warn!(
                    shard,
                    stalled_ms = stalled_for / 1_000_000,
                    "reactor stalled"
                );
            }
            let backoff = shared
                .report_at
                .load(Ordering::Relaxed)
                .saturating_mul(2)
                .min(1 << 16);
            shared.report_at.store(backoff, Ordering::Relaxed);
            next_stall_check = now + threshold_ns.saturating_mul(u64::from(backoff));
        } else {
            shared.last_seen.store(processed.wrapping_add(1), Ordering::Release);
            shared.report_at.store(1, Ordering::Relaxed);
            next_stall_check = now + threshold_ns;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quota() -> Duration {
        Duration::from_micros(500)
    }

    #[test]
    fn busy_loop_produces_a_stall_record() {
        let preempt = Arc::new(AtomicBool::new(false));
        let config = StallConfig {
            threshold: Duration::from_millis(10),
            reports_per_minute: 5,
        };
        let det = StallDetector::new(0, config, Arc::clone(&preempt), quota(), false);
        det.start_task_run(SteadyClock::now());
        // "Run" one task that blocks for 3x the threshold.
        std::thread::sleep(Duration::from_millis(30));
        assert!(det.stalls() >= 1);
        det.shared()
            .tasks_processed
            .fetch_add(1, Ordering::Relaxed);
        det.end_task_run();
        let after = det.stalls();
        // Quiet period: no further records while no run is marked.
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(det.stalls(), after);
    }

    #[test]
    fn progress_resets_the_backoff() {
        let preempt = Arc::new(AtomicBool::new(false));
        let config = StallConfig {
            threshold: Duration::from_millis(5),
            reports_per_minute: 100,
        };
        let det = StallDetector::new(1, config, preempt, quota(), false);
        det.start_task_run(SteadyClock::now());
        for _ in 0..20 {
            det.shared()
                .tasks_processed
                .fetch_add(1, Ordering::Relaxed);
            std::thread::sleep(Duration::from_millis(1));
        }
        det.end_task_run();
        // Steady progress: no stall recorded.
        assert_eq!(det.stalls(), 0);
    }

    #[test]
    fn watchdog_sets_preempt_flag() {
        let preempt = Arc::new(AtomicBool::new(false));
        let det = StallDetector::new(2, StallConfig::default(), Arc::clone(&preempt), quota(), false);
        std::thread::sleep(Duration::from_millis(5));
        assert!(preempt.load(Ordering::Relaxed));
        drop(det);
    }

    #[test]
    fn sleep_disarms_detection() {
        let preempt = Arc::new(AtomicBool::new(false));
        let config = StallConfig {
            threshold: Duration::from_millis(5),
            reports_per_minute: 5,
        };
        let det = StallDetector::new(3, config, preempt, quota(), false);
        det.start_task_run(SteadyClock::now());
        det.start_sleep();
        std::thread::sleep(Duration::from_millis(25));
        assert_eq!(det.stalls(), 0);
        det.end_sleep();
        det.end_task_run();
    }
}
