//! Cross-shard message queues.
//!
//! An N x N array of SPSC rings: `q[to][from].pending` carries requests from
//! `from` to `to`, and `q[to][from].completed` carries the same items back
//! as responses (producer `to`, consumer `from`). Producers stage messages
//! in a shard-local fifo and flush in batches; after a flush, a producer
//! that observes the destination's sleeping flag clears it and signals the
//! destination's wakeup fd. Within one (from, to) pair and service group,
//! delivery preserves submission order.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{compiler_fence, AtomicBool, Ordering};
use std::sync::Arc;

use fxhash::FxHashMap;

use super::alien::AlienQueue;
use super::group::{GroupSem, ServiceGroup, Waiter};
use super::notify::Notifier;
use super::spsc::{CachePadded, SpscQueue};
use super::ticket::Completer;
use crate::timer::SteadyClock;
use crate::Error;

/// Fixed ring capacity per queue.
pub(crate) const RING_CAPACITY: usize = 128;
/// Producer staging flushes at this batch size.
pub(crate) const BATCH_SIZE: usize = 16;
/// Extra items a consumer may take past the ring capacity per cycle,
/// covering entries published while the batch drains. Bounds latency per
/// peer; this is not the original's cache prefetching.
pub(crate) const DRAIN_SLACK: usize = 2;

/// A typed unit of cross-shard work: `process` runs on the destination,
/// `complete` back on the source.
pub(crate) trait SmpMessage: Send {
    fn process(&mut self);
    fn complete(self: Box<Self>);
    fn fail(self: Box<Self>, err: Error);
    fn group(&self) -> ServiceGroup;
}

/// Placeholder left behind when a waiter's message is moved out.
pub(crate) struct Tombstone;

impl SmpMessage for Tombstone {
    fn process(&mut self) {}
    fn complete(self: Box<Self>) {}
    fn fail(self: Box<Self>, _err: Error) {}
    fn group(&self) -> ServiceGroup {
        super::group::default_service_group()
    }
}

/// The common message shape: run a closure on the destination shard and
/// hand its result to the source-side completer.
pub(crate) struct CallMessage<T, F>
where
    T: Send,
    F: FnOnce() -> Result<T, Error> + Send,
{
    pub(crate) func: Option<F>,
    pub(crate) result: Option<Result<T, Error>>,
    pub(crate) completer: Option<Completer<T>>,
    pub(crate) group: ServiceGroup,
}

impl<T, F> SmpMessage for CallMessage<T, F>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, Error> + Send,
{
    fn process(&mut self) {
        let func = self.func.take().expect("message processed twice");
        let result = match catch_unwind(AssertUnwindSafe(func)) {
            Ok(r) => r,
            Err(panic) => Err(Error::Runtime(crate::panic_message(&panic))),
        };
        self.result = Some(result);
    }

    fn complete(mut self: Box<Self>) {
        let completer = self.completer.take().expect("message completed twice");
        let result = self
            .result
            .take()
            .unwrap_or_else(|| Err(Error::Runtime("response lost its result".into())));
        completer.complete(result);
    }

    fn fail(mut self: Box<Self>, err: Error) {
        if let Some(completer) = self.completer.take() {
            completer.complete(Err(err));
        }
    }

    fn group(&self) -> ServiceGroup {
        self.group
    }
}

struct MessageQueue {
    pending: SpscQueue<Box<dyn SmpMessage>>,
    completed: SpscQueue<Box<dyn SmpMessage>>,
}

impl MessageQueue {
    fn new() -> Self {
        Self {
            pending: SpscQueue::new(RING_CAPACITY),
            completed: SpscQueue::new(RING_CAPACITY),
        }
    }
}

/// Shared fabric for one runtime: rings, sleeping flags, wakeup fds, shard
/// liveness, and the alien queue set.
pub(crate) struct SmpRegistry {
    n: usize,
    /// `q[to][from]` at index `to * n + from`.
    queues: Vec<MessageQueue>,
    pub(crate) sleeping: Vec<CachePadded<AtomicBool>>,
    pub(crate) notifiers: Vec<Notifier>,
    alive: Vec<AtomicBool>,
    pub(crate) alien: Vec<AlienQueue>,
}

impl SmpRegistry {
    pub(crate) fn new(n: usize) -> std::io::Result<Arc<Self>> {
        let mut notifiers = Vec::with_capacity(n);
        for _ in 0..n {
            notifiers.push(Notifier::new()?);
        }
        Ok(Arc::new(Self {
            n,
            queues: (0..n * n).map(|_| MessageQueue::new()).collect(),
            sleeping: (0..n)
                .map(|_| CachePadded::new(AtomicBool::new(false)))
                .collect(),
            notifiers,
            alive: (0..n).map(|_| AtomicBool::new(true)).collect(),
            alien: (0..n).map(|_| AlienQueue::new()).collect(),
        }))
    }

    pub(crate) fn shard_count(&self) -> usize {
        self.n
    }

    fn queue(&self, to: usize, from: usize) -> &MessageQueue {
        &self.queues[to * self.n + from]
    }

    pub(crate) fn is_alive(&self, shard: usize) -> bool {
        self.alive.get(shard).is_some_and(|a| a.load(Ordering::Acquire))
    }

    pub(crate) fn mark_down(&self, shard: usize) {
        self.alive[shard].store(false, Ordering::Release);
    }

    /// Producer-side wakeup handshake. The ring push and the sleeping-flag
    /// load commute, so a compiler barrier pins their order; the systemwide
    /// barrier lives on the sleeper's side of the handshake.
    pub(crate) fn maybe_wakeup(&self, shard: usize) {
        compiler_fence(Ordering::SeqCst);
        if self.sleeping[shard].load(Ordering::Relaxed) {
            self.sleeping[shard].store(false, Ordering::Relaxed);
            self.notifiers[shard].signal();
        }
    }
}

/// Running totals for one shard's cross-shard traffic.
#[derive(Debug, Default, Clone, Copy)]
pub struct SmpStats {
    /// Requests pushed to a peer ring.
    pub sent: u64,
    /// Requests processed on behalf of peers.
    pub received: u64,
    /// Responses completed back on this shard.
    pub completed: u64,
    /// Submissions failed on the admission deadline.
    pub timeouts: u64,
}

/// Per-shard send/receive state: staging fifos, admission semaphores, and
/// the consumer loop.
pub(crate) struct SmpShard {
    id: usize,
    registry: Arc<SmpRegistry>,
    /// Outbound request staging, per destination.
    staging: Vec<std::collections::VecDeque<Box<dyn SmpMessage>>>,
    /// Outbound response staging, per request source.
    response_staging: Vec<std::collections::VecDeque<Box<dyn SmpMessage>>>,
    sems: FxHashMap<(u32, usize), GroupSem>,
    pub(crate) stats: SmpStats,
}

impl SmpShard {
    pub(crate) fn new(id: usize, registry: Arc<SmpRegistry>) -> Self {
        let n = registry.shard_count();
        Self {
            id,
            registry,
            staging: (0..n).map(|_| std::collections::VecDeque::new()).collect(),
            response_staging: (0..n).map(|_| std::collections::VecDeque::new()).collect(),
            sems: FxHashMap::default(),
            stats: SmpStats::default(),
        }
    }

    pub(crate) fn registry(&self) -> &Arc<SmpRegistry> {
        &self.registry
    }

    /// In-flight requests: sent and not yet completed.
    pub(crate) fn queue_length(&self) -> u64 {
        self.stats.sent - self.stats.completed
    }

    /// Submits a message toward `dest`, taking an admission unit first.
    pub(crate) fn submit(
        &mut self,
        dest: usize,
        deadline: Option<u64>,
        msg: Box<dyn SmpMessage>,
    ) {
        if dest >= self.registry.shard_count() || !self.registry.is_alive(dest) {
            msg.fail(Error::RequestReceiverDown);
            return;
        }
        let group = msg.group();
        let sem = self
            .sems
            .entry((group.0, dest))
            .or_insert_with(|| GroupSem::new(group));
        if sem.try_acquire() {
            self.stage(dest, msg);
        } else {
            sem.waiters.push_back(Waiter {
                message: msg,
                deadline,
            });
        }
    }

    fn stage(&mut self, dest: usize, msg: Box<dyn SmpMessage>) {
        self.staging[dest].push_back(msg);
        if self.staging[dest].len() >= BATCH_SIZE {
            self.flush_pending(dest);
        }
    }

    /// Pushes staged requests into the destination ring; what does not fit
    /// stays staged for the next flush.
    fn flush_pending(&mut self, dest: usize) -> bool {
        let mut pushed = 0u64;
        while let Some(msg) = self.staging[dest].pop_front() {
            match self.registry.queue(dest, self.id).pending.push(msg) {
                Ok(()) => pushed += 1,
                Err(msg) => {
                    self.staging[dest].push_front(msg);
                    break;
                }
            }
        }
        if pushed > 0 {
            self.stats.sent += pushed;
            self.registry.maybe_wakeup(dest);
            true
        } else {
            false
        }
    }

    fn flush_responses(&mut self, source: usize) -> bool {
        let mut pushed = false;
        while let Some(msg) = self.response_staging[source].pop_front() {
            match self.registry.queue(self.id, source).completed.push(msg) {
                Ok(()) => pushed = true,
                Err(msg) => {
                    self.response_staging[source].push_front(msg);
                    break;
                }
            }
        }
        if pushed {
            self.registry.maybe_wakeup(source);
        }
        pushed
    }

    /// Forces every staged request and response onto the wire.
    pub(crate) fn flush_all(&mut self) -> bool {
        let mut work = false;
        for peer in 0..self.registry.shard_count() {
            if peer == self.id {
                continue;
            }
            if !self.staging[peer].is_empty() {
                work |= self.flush_pending(peer);
            }
            if !self.response_staging[peer].is_empty() {
                work |= self.flush_responses(peer);
            }
        }
        work
    }

    /// Detaches one batch of responses per destination. The caller runs
    /// `complete()` without holding the shard borrow (completions may touch
    /// the shard again) and reports each via [`SmpShard::note_completed`].
    pub(crate) fn take_completions(&mut self) -> Vec<(usize, Vec<Box<dyn SmpMessage>>)> {
        let n = self.registry.shard_count();
        let mut out = Vec::new();
        for dest in 0..n {
            if dest == self.id {
                continue;
            }
            let mut batch: Vec<Box<dyn SmpMessage>> = Vec::new();
            self.registry
                .queue(dest, self.id)
                .completed
                .pop_each(RING_CAPACITY + DRAIN_SLACK, |msg| {
                    batch.push(msg);
                    true
                });
            if !batch.is_empty() {
                out.push((dest, batch));
            }
        }
        out
    }

    /// Returns a completed request's admission unit and admits the next
    /// waiter, if any.
    pub(crate) fn note_completed(&mut self, dest: usize, group: ServiceGroup) {
        self.stats.completed += 1;
        if let Some(sem) = self.sems.get_mut(&(group.0, dest)) {
            if let Some(next) = sem.release() {
                self.stage(dest, next);
            }
        }
    }

    /// Detaches one batch of pending requests per source. The caller runs
    /// `process()` without holding the shard borrow (handlers may submit)
    /// and hands each message back via [`SmpShard::stage_response`].
    pub(crate) fn take_incoming(&mut self) -> Vec<(usize, Vec<Box<dyn SmpMessage>>)> {
        let n = self.registry.shard_count();
        let mut out = Vec::new();
        for from in 0..n {
            if from == self.id {
                continue;
            }
            let mut batch: Vec<Box<dyn SmpMessage>> = Vec::new();
            self.registry
                .queue(self.id, from)
                .pending
                .pop_each(RING_CAPACITY + DRAIN_SLACK, |msg| {
                    batch.push(msg);
                    true
                });
            if !batch.is_empty() {
                self.stats.received += batch.len() as u64;
                out.push((from, batch));
            }
        }
        out
    }

    /// Queues a processed request for its response trip.
    pub(crate) fn stage_response(&mut self, from: usize, msg: Box<dyn SmpMessage>) {
        self.response_staging[from].push_back(msg);
    }

    pub(crate) fn flush_responses_to(&mut self, from: usize) -> bool {
        self.flush_responses(from)
    }

    /// Detaches work queued by non-shard threads.
    pub(crate) fn take_alien(&mut self) -> Vec<Box<dyn FnOnce() + Send>> {
        self.registry.alien[self.id].drain()
    }

    /// Fails admission waiters whose deadline has passed.
    pub(crate) fn expire_waiters(&mut self) -> bool {
        let now = SteadyClock::now();
        let mut any = false;
        for sem in self.sems.values_mut() {
            for msg in sem.expire(now) {
                msg.fail(Error::QueueTimeout);
                self.stats.timeouts += 1;
                any = true;
            }
        }
        any
    }

    /// One full consumer cycle: completions, then incoming requests, then
    /// alien work, deadline expiry, and a forced flush of staged batches.
    ///
    /// Convenience for direct-drive callers (tests); message bodies that
    /// re-enter the shard must go through the reactor's smp poller, which
    /// runs them with the shard borrow released.
    pub(crate) fn poll(&mut self) -> bool {
        let mut work = false;
        for (dest, batch) in self.take_completions() {
            work = true;
            for msg in batch {
                let group = msg.group();
                msg.complete();
                self.note_completed(dest, group);
            }
        }
        for (from, batch) in self.take_incoming() {
            work = true;
            for mut msg in batch {
                msg.process();
                self.stage_response(from, msg);
            }
            self.flush_responses_to(from);
        }
        for task in self.take_alien() {
            work = true;
            task();
        }
        work |= self.expire_waiters();
        work |= self.flush_all();
        work
    }

    /// Read-only: is there anything a `poll` would find?
    pub(crate) fn pure_poll(&self) -> bool {
        let n = self.registry.shard_count();
        for peer in 0..n {
            if peer == self.id {
                continue;
            }
            if !self.registry.queue(self.id, peer).pending.is_empty() {
                return true;
            }
            if !self.registry.queue(peer, self.id).completed.is_empty() {
                return true;
            }
        }
        !self.registry.alien[self.id].is_empty()
    }

    /// Whether anything is staged but not yet on the wire.
    pub(crate) fn has_unflushed(&self) -> bool {
        self.staging.iter().any(|s| !s.is_empty())
            || self.response_staging.iter().any(|s| !s.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::smp::ticket::ticket;

    fn call_message<T, F>(group: ServiceGroup, f: F) -> (crate::smp::Ticket<T>, Box<dyn SmpMessage>)
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, Error> + Send + 'static,
    {
        let (t, c) = ticket();
        (
            t,
            Box::new(CallMessage {
                func: Some(f),
                result: None,
                completer: Some(c),
                group,
            }),
        )
    }

    fn two_shards() -> (SmpShard, SmpShard) {
        let registry = SmpRegistry::new(2).unwrap();
        (
            SmpShard::new(0, Arc::clone(&registry)),
            SmpShard::new(1, registry),
        )
    }

    #[test]
    fn request_response_round_trip() {
        let (mut s0, mut s1) = two_shards();
        let g = super::super::group::default_service_group();
        let (t, msg) = call_message(g, || Ok(2u32));
        s0.submit(1, None, msg);
        s0.flush_all();
        assert!(s1.poll());
        assert!(s0.poll());
        assert_eq!(t.try_take().unwrap().unwrap(), 2);
        assert_eq!(s0.queue_length(), 0);
        assert_eq!(s0.stats.sent, 1);
        assert_eq!(s1.stats.received, 1);
    }

    #[test]
    fn pair_order_is_preserved() {
        let (mut s0, mut s1) = two_shards();
        let g = super::super::group::default_service_group();
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut tickets = Vec::new();
        for i in 0..50u32 {
            let log = Arc::clone(&log);
            let (t, msg) = call_message(g, move || {
                log.lock().unwrap().push(i);
                Ok(())
            });
            tickets.push(t);
            s0.submit(1, None, msg);
        }
        s0.flush_all();
        // Several cycles: the ring holds 127, batches drain incrementally.
        for _ in 0..8 {
            s1.poll();
            s0.poll();
        }
        let seen = log.lock().unwrap();
        assert_eq!(seen.len(), 50);
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
        assert!(tickets.iter().all(|t| t.is_resolved()));
    }

    #[test]
    fn dead_destination_fails_receiver_down() {
        let (mut s0, _s1) = two_shards();
        s0.registry().mark_down(1);
        let g = super::super::group::default_service_group();
        let (t, msg) = call_message(g, || Ok(()));
        s0.submit(1, None, msg);
        assert!(matches!(
            t.try_take(),
            Some(Err(Error::RequestReceiverDown))
        ));
    }

    #[test]
    fn exhausted_group_times_out_at_deadline() {
        let (mut s0, _s1) = two_shards();
        let g = super::super::group::create_service_group(super::super::ServiceGroupConfig {
            max_nonlocal_requests: 1,
        });
        let (_t1, m1) = call_message(g, || Ok(()));
        s0.submit(1, None, m1); // takes the only unit
        let (t2, m2) = call_message(g, || Ok(()));
        s0.submit(1, Some(SteadyClock::now()), m2); // already expired
        s0.poll();
        assert!(matches!(t2.try_take(), Some(Err(Error::QueueTimeout))));
        assert_eq!(s0.stats.timeouts, 1);
    }

    #[test]
    fn panicking_handler_resolves_runtime_error() {
        let (mut s0, mut s1) = two_shards();
        let g = super::super::group::default_service_group();
        let (t, msg) = call_message::<(), _>(g, || panic!("handler died"));
        s0.submit(1, None, msg);
        s0.flush_all();
        s1.poll();
        s0.poll();
        assert!(matches!(t.try_take(), Some(Err(Error::Runtime(_)))));
    }
}
