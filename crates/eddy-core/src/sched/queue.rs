//! Weighted-fair task queues.
//!
//! Each queue carries a share weight and a virtual runtime that rises at a
//! rate inversely proportional to the weight: after running for `d`
//! nanoseconds, `vruntime += (d * (2^32 / shares)) >> 32`. The reactor always
//! picks the active queue with the smallest vruntime, so over time CPU
//! splits proportionally to shares.

use std::collections::VecDeque;

use fxhash::FxHashMap;

use super::task::Task;

/// A per-queue user value slot, keyed by a small id.
pub type QueueValue = Box<dyn std::any::Any>;

/// An ordered list of runnable tasks with a fair-share weight.
pub struct TaskQueue {
    id: usize,
    name: String,
    shares: f32,
    /// `2^32 / shares`, the fixed-point rate vruntime rises at.
    reciprocal_shares_times_2_pow_32: u64,
    pub(crate) vruntime: u64,
    pub(crate) runtime_ns: u64,
    pub(crate) waittime_ns: u64,
    pub(crate) starvetime_ns: u64,
    pub(crate) quota_violation_ns: u64,
    pub(crate) tasks_processed: u64,
    pub(crate) queue: VecDeque<Box<dyn Task>>,
    pub(crate) active: bool,
    /// Timestamp of the last state change, for wait/starve accounting.
    pub(crate) ts: u64,
    values: FxHashMap<u64, QueueValue>,
}

impl TaskQueue {
    /// Creates a queue with the given weight (clamped to at least 1).
    #[must_use]
    pub fn new(id: usize, name: impl Into<String>, shares: f32) -> Self {
        let shares = shares.max(1.0);
        Self {
            id,
            name: name.into(),
            shares,
            reciprocal_shares_times_2_pow_32: reciprocal(shares),
            vruntime: 0,
            runtime_ns: 0,
            waittime_ns: 0,
            starvetime_ns: 0,
            quota_violation_ns: 0,
            tasks_processed: 0,
            queue: VecDeque::new(),
            active: false,
            ts: 0,
            values: FxHashMap::default(),
        }
    }

    /// Queue index within the owning reactor.
    #[must_use]
    pub fn id(&self) -> usize {
        self.id
    }

    /// Queue name, for logs and stats.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Renames the queue.
    pub fn rename(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// Current share weight.
    #[must_use]
    pub fn shares(&self) -> f32 {
        self.shares
    }

    /// Updates the share weight (clamped to at least 1).
    pub fn set_shares(&mut self, shares: f32) {
        self.shares = shares.max(1.0);
        self.reciprocal_shares_times_2_pow_32 = reciprocal(self.shares);
    }

    /// Scales a real runtime into this queue's virtual runtime units.
    #[must_use]
    pub fn to_vruntime(&self, runtime_ns: u64) -> u64 {
        let scaled =
            (u128::from(runtime_ns) * u128::from(self.reciprocal_shares_times_2_pow_32)) >> 32;
        u64::try_from(scaled).unwrap_or(u64::MAX)
    }

    /// Charges a run slice to the queue. Slices longer than twice the task
    /// quota count the overshoot as a quota violation.
    pub fn account_runtime(&mut self, runtime_ns: u64, task_quota_ns: u64) {
        if runtime_ns > 2 * task_quota_ns {
            self.quota_violation_ns += runtime_ns - task_quota_ns;
        }
        self.runtime_ns += runtime_ns;
        self.vruntime = self.vruntime.saturating_add(self.to_vruntime(runtime_ns));
    }

    /// Number of queued tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether no task is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Tasks this queue has run since creation.
    #[must_use]
    pub fn tasks_processed(&self) -> u64 {
        self.tasks_processed
    }

    /// Total real runtime charged to this queue, in nanoseconds.
    #[must_use]
    pub fn runtime_ns(&self) -> u64 {
        self.runtime_ns
    }

    /// Stores a per-queue value under a small id.
    pub fn set_value(&mut self, key: u64, value: QueueValue) {
        self.values.insert(key, value);
    }

    /// Reads a per-queue value.
    #[must_use]
    pub fn value(&self, key: u64) -> Option<&QueueValue> {
        self.values.get(&key)
    }
}

fn reciprocal(shares: f32) -> u64 {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let r = ((1u64 << 32) as f64 / f64::from(shares)) as u64;
    r
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shares_are_clamped_to_one() {
        let q = TaskQueue::new(0, "main", 0.25);
        assert!((q.shares() - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn vruntime_is_inverse_to_shares() {
        let q1 = TaskQueue::new(0, "a", 100.0);
        let q2 = TaskQueue::new(1, "b", 200.0);
        let v1 = q1.to_vruntime(1_000_000);
        let v2 = q2.to_vruntime(1_000_000);
        // Twice the shares: vruntime rises half as fast (within rounding).
        assert!(v1 >= 2 * v2 - 2 && v1 <= 2 * v2 + 2, "{v1} vs {v2}");
    }

    #[test]
    fn fair_split_tracks_share_ratio() {
        // Simulate the reactor's min-vruntime pick over fixed 1 ms slices:
        // the 200-share queue should get about twice the CPU of the
        // 100-share queue.
        let mut a = TaskQueue::new(0, "a", 100.0);
        let mut b = TaskQueue::new(1, "b", 200.0);
        const SLICE_NS: u64 = 1_000_000;
        for _ in 0..3000 {
            let pick_a = a.vruntime <= b.vruntime;
            let q = if pick_a { &mut a } else { &mut b };
            q.account_runtime(SLICE_NS, 500_000);
        }
        let total = (a.runtime_ns + b.runtime_ns) as f64;
        let b_frac = b.runtime_ns as f64 / total;
        assert!(
            (b_frac - 2.0 / 3.0).abs() < 0.05,
            "200-share queue got {b_frac} of CPU"
        );
    }

    #[test]
    fn bounded_fairness_of_scaled_vruntime() {
        // vruntime/inv must stay within one slice of each other across any
        // schedule driven by the min-vruntime rule.
        let mut a = TaskQueue::new(0, "a", 100.0);
        let mut b = TaskQueue::new(1, "b", 300.0);
        const SLICE_NS: u64 = 500_000;
        for _ in 0..1000 {
            let q = if a.vruntime <= b.vruntime { &mut a } else { &mut b };
            q.account_runtime(SLICE_NS, SLICE_NS);
        }
        let va = a.vruntime as i128;
        let vb = b.vruntime as i128;
        let max_slice_v = a.to_vruntime(SLICE_NS).max(b.to_vruntime(SLICE_NS)) as i128;
        assert!((va - vb).abs() <= max_slice_v);
    }

    #[test]
    fn quota_violation_accounting() {
        let mut q = TaskQueue::new(0, "main", 1000.0);
        q.account_runtime(400_000, 500_000);
        assert_eq!(q.quota_violation_ns, 0);
        q.account_runtime(1_500_000, 500_000);
        assert_eq!(q.quota_violation_ns, 1_000_000);
    }

    #[test]
    fn per_queue_values() {
        let mut q = TaskQueue::new(0, "main", 1000.0);
        q.set_value(3, Box::new(42u32));
        let v = q.value(3).and_then(|v| v.downcast_ref::<u32>());
        assert_eq!(v, Some(&42));
        assert!(q.value(4).is_none());
    }
}
