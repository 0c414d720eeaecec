//! Ordered timer wheel.
//!
//! A slab of timer records indexed by a `BTreeMap` keyed `(deadline, seq)`.
//! The sequence number makes same-deadline timers expire in insertion order
//! and keeps keys unique. Insert and remove are `O(log n)`; `expire` walks
//! the ordered prefix once.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use smallvec::SmallVec;

/// Shard-local timer callback. `FnMut` so periodic timers can fire again.
pub type TimerCallback = Rc<RefCell<dyn FnMut()>>;

/// Index into the wheel's record slab.
pub type TimerId = usize;

/// Handle to an armed timer. Stale after the timer fires (one-shot) or is
/// cancelled; cancelling through a stale handle is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerToken {
    pub(crate) id: TimerId,
    pub(crate) generation: u32,
}

struct TimerRecord {
    generation: u32,
    deadline: u64,
    period: Option<u64>,
    seq: u64,
    queued: bool,
    expired: bool,
    /// Task queue the callback is dispatched under.
    queue: usize,
    callback: Option<TimerCallback>,
}

/// A timer ready to fire, detached from the wheel so the callback can arm or
/// cancel other timers freely.
pub struct Fired {
    /// Task queue to dispatch under.
    pub queue: usize,
    /// The callback to run.
    pub callback: TimerCallback,
}

/// Ordered container of timer records for one clock.
#[derive(Default)]
pub struct TimerWheel {
    slots: Vec<Option<TimerRecord>>,
    free: Vec<TimerId>,
    ordered: BTreeMap<(u64, u64), TimerId>,
    next_seq: u64,
    generation: u32,
}

impl TimerWheel {
    /// Creates an empty wheel.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of queued timers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    /// Whether no timer is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }

    /// Earliest queued deadline.
    #[must_use]
    pub fn next_deadline(&self) -> Option<u64> {
        self.ordered.keys().next().map(|&(d, _)| d)
    }

    /// Arms a timer. Returns its token and whether it became the new
    /// earliest deadline (so the caller can re-arm the underlying OS timer).
    pub fn insert(
        &mut self,
        deadline: u64,
        period: Option<u64>,
        queue: usize,
        callback: TimerCallback,
    ) -> (TimerToken, bool) {
        let was_earliest = self.next_deadline();
        let seq = self.next_seq;
        self.next_seq += 1;
        self.generation = self.generation.wrapping_add(1);
        let record = TimerRecord {
            generation: self.generation,
            deadline,
            period,
            seq,
            queued: true,
            expired: false,
            queue,
            callback: Some(callback),
        };
        let id = if let Some(id) = self.free.pop() {
            self.slots[id] = Some(record);
            id
        } else {
            self.slots.push(Some(record));
            self.slots.len() - 1
        };
        self.ordered.insert((deadline, seq), id);
        let new_earliest = was_earliest.is_none_or(|d| deadline < d);
        (
            TimerToken {
                id,
                generation: self.generation,
            },
            new_earliest,
        )
    }

    /// Cancels a timer. Returns true when the timer was still queued (its
    /// callback will not fire).
    pub fn remove(&mut self, token: TimerToken) -> bool {
        let Some(slot) = self.slots.get_mut(token.id) else {
            return false;
        };
        let Some(record) = slot else {
            return false;
        };
        if record.generation != token.generation {
            return false; // stale handle
        }
        let was_queued = record.queued;
        if was_queued {
            self.ordered.remove(&(record.deadline, record.seq));
        }
        *slot = None;
        self.free.push(token.id);
        was_queued
    }

    /// Expires every timer with `deadline <= now` in one pass. Periodic
    /// timers are re-queued at `now + period`; one-shot records are freed.
    /// Same-deadline callbacks come out in insertion order.
    pub fn expire(&mut self, now: u64) -> SmallVec<[Fired; 8]> {
        let mut fired = SmallVec::new();
        while let Some((&(deadline, seq), &id)) = self.ordered.iter().next() {
            if deadline > now {
                break;
            }
            self.ordered.remove(&(deadline, seq));
            let record = self.slots[id]
                .as_mut()
                .expect("queued timer has no record");
            record.queued = false;
            record.expired = true;
            match record.period {
                Some(period) => {
                    let callback = record
                        .callback
                        .clone()
                        .expect("periodic timer lost its callback");
                    fired.push(Fired {
                        queue: record.queue,
                        callback,
                    });
                    let new_seq = self.next_seq;
                    self.next_seq += 1;
                    record.seq = new_seq;
                    record.deadline = now + period;
                    record.queued = true;
                    record.expired = false;
                    self.ordered.insert((now + period, new_seq), id);
                }
                None => {
                    let callback = record
                        .callback
                        .take()
                        .expect("timer fired twice");
                    fired.push(Fired {
                        queue: record.queue,
                        callback,
                    });
                    self.slots[id] = None;
                    self.free.push(id);
                }
            }
        }
        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn noop() -> TimerCallback {
        Rc::new(RefCell::new(|| {}))
    }

    #[test]
    fn insert_reports_new_earliest() {
        let mut wheel = TimerWheel::new();
        let (_, earliest) = wheel.insert(100, None, 0, noop());
        assert!(earliest);
        let (_, earliest) = wheel.insert(200, None, 0, noop());
        assert!(!earliest);
        let (_, earliest) = wheel.insert(50, None, 0, noop());
        assert!(earliest);
        assert_eq!(wheel.next_deadline(), Some(50));
    }

    #[test]
    fn cancel_before_deadline_suppresses_fire() {
        let mut wheel = TimerWheel::new();
        let (token, _) = wheel.insert(100, None, 0, noop());
        assert!(wheel.remove(token));
        assert!(wheel.expire(1000).is_empty());
        // A second cancel through the stale token is a no-op.
        assert!(!wheel.remove(token));
    }

    #[test]
    fn same_deadline_fires_in_insertion_order() {
        let order = Rc::new(RefCell::new(Vec::new()));
        let mut wheel = TimerWheel::new();
        for i in 0..1000 {
            let order = Rc::clone(&order);
            let cb: TimerCallback = Rc::new(RefCell::new(move || order.borrow_mut().push(i)));
            wheel.insert(500, None, 0, cb);
        }
        let fired = wheel.expire(500);
        assert_eq!(fired.len(), 1000);
        for f in &fired {
            (f.callback.borrow_mut())();
        }
        let seen = order.borrow();
        assert_eq!(seen.len(), 1000);
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn periodic_requeues_at_now_plus_period() {
        let count = Rc::new(Cell::new(0u32));
        let mut wheel = TimerWheel::new();
        let c = Rc::clone(&count);
        let cb: TimerCallback = Rc::new(RefCell::new(move || c.set(c.get() + 1)));
        let (token, _) = wheel.insert(10, Some(10), 0, cb);

        let mut now = 10;
        for _ in 0..5 {
            for f in wheel.expire(now) {
                (f.callback.borrow_mut())();
            }
            assert_eq!(wheel.next_deadline(), Some(now + 10));
            now += 10;
        }
        assert_eq!(count.get(), 5);

        // The original token stays valid for a periodic timer.
        assert!(wheel.remove(token));
        assert!(wheel.expire(u64::MAX).is_empty());
    }

    #[test]
    fn one_shot_slot_is_recycled() {
        let mut wheel = TimerWheel::new();
        let (t1, _) = wheel.insert(1, None, 0, noop());
        assert_eq!(wheel.expire(1).len(), 1);
        let (t2, _) = wheel.insert(2, None, 0, noop());
        // Slot reuse must not let the stale token cancel the new timer.
        assert_eq!(t1.id, t2.id);
        assert!(!wheel.remove(t1));
        assert_eq!(wheel.len(), 1);
    }

    #[test]
    fn expire_is_a_single_prefix_pass() {
        let mut wheel = TimerWheel::new();
        wheel.insert(10, None, 0, noop());
        wheel.insert(20, None, 0, noop());
        wheel.insert(30, None, 0, noop());
        assert_eq!(wheel.expire(20).len(), 2);
        assert_eq!(wheel.next_deadline(), Some(30));
    }
}
