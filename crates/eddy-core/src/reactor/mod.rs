//! # Reactor
//!
//! The per-shard event loop: weighted-fair scheduling over task queues,
//! a fixed sequence of pollers for external events, timer service, and a
//! sleep path guarded by a poller handshake.
//!
//! ## Loop shape
//!
//! Each round runs tasks (until the quota preemption flag fires), services
//! the high-resolution and manual timer wheels, then walks the pollers:
//! cross-shard queues, kernel completion reap, I/O submit, kernel submit,
//! reap again, batch flush, execution stages, cross-shard free drain,
//! low-resolution timers, signals, syscall-pool completions. When nothing
//! reports work and the idle handler agrees, the reactor asks every poller
//! to enter interrupt mode and sleeps on its wakeup fd until a peer push,
//! signal, or timer deadline.

mod poller;
mod signals;
mod stage;

pub use stage::ExecutionStage;

use std::cell::{Cell, RefCell};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fxhash::FxHashMap;
use smallvec::SmallVec;

use crate::io::{DeviceId, IoOutcome, IoSink, SyscallPool};
use crate::sched::{make_task, Task, TaskQueue, AT_EXIT_QUEUE, MAIN_QUEUE};
use crate::smp::{SmpRegistry, SmpShard, Ticket};
use crate::stall::{StallConfig, StallDetector};
use crate::timer::{ClockKind, Fired, ManualClock, SteadyClock, TimerToken, TimerWheel};
use crate::Error;

use poller::{
    FlushPoller, IoReapPoller, IoSubmitPoller, KernelSubmitPoller, LowresTimerPoller, MemPoller,
    Poller, SignalPoller, SmpPoller, StagePoller, SyscallPoller,
};
use stage::StageFlush;

/// Reactor tuning knobs.
#[derive(Debug, Clone)]
pub struct ReactorConfig {
    /// Wall-clock budget before the preemption flag fires
    /// (`--task-quota-ms`).
    pub task_quota: Duration,
    /// Queue backlog above which preemption is deferred in favor of
    /// draining (`--max-task-backlog`).
    pub max_task_backlog: usize,
    /// How long to keep polling while idle before trying to sleep
    /// (`--idle-poll-time-us`).
    pub idle_poll_time: Duration,
    /// Never sleep (`--poll-mode`).
    pub poll_mode: bool,
    /// Stall detector tuning.
    pub stall: StallConfig,
    /// Helper threads for blocking syscalls.
    pub syscall_threads: usize,
    /// Route kernel-queue I/O through the syscall pool even when a ring is
    /// available (`--force-aio-syscalls`).
    pub force_syscall_io: bool,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            task_quota: Duration::from_micros(500),
            max_task_backlog: 1000,
            idle_poll_time: Duration::from_micros(200),
            poll_mode: false,
            stall: StallConfig::default(),
            syscall_threads: 1,
            force_syscall_io: false,
        }
    }
}

enum SignalHandler {
    Repeat(Box<dyn FnMut()>),
    Once(Box<dyn FnOnce()>),
}

/// The per-shard reactor. Lives on its shard thread for the whole run;
/// accessed from tasks through the thread-local current-reactor pointer.
pub struct Reactor {
    id: usize,
    cfg: ReactorConfig,
    queues: Vec<TaskQueue>,
    /// Active queues, approximately sorted by vruntime.
    active: std::collections::VecDeque<usize>,
    /// Queues that became runnable since the last scheduling pass.
    activating: Vec<usize>,
    last_vruntime: u64,
    current_queue: usize,
    stopping: bool,
    stopped: bool,
    at_exit: Vec<Box<dyn FnOnce()>>,
    preempt: Arc<AtomicBool>,
    stall: StallDetector,
    steady_wheel: TimerWheel,
    lowres_wheel: TimerWheel,
    manual_wheel: TimerWheel,
    smp: Rc<RefCell<SmpShard>>,
    registry: Arc<SmpRegistry>,
    syscall: Rc<SyscallPool>,
    io: Rc<RefCell<IoSink>>,
    stages: Vec<Rc<dyn StageFlush>>,
    flushers: Vec<Box<dyn FnMut() -> bool>>,
    signal_handlers: FxHashMap<i32, SignalHandler>,
    /// Returns true when it found more work (keep polling).
    idle_handler: Option<Box<dyn FnMut() -> bool>>,
}

thread_local! {
    static CURRENT: Cell<*mut Reactor> = const { Cell::new(std::ptr::null_mut()) };
    static PREEMPT: RefCell<Option<Arc<AtomicBool>>> = const { RefCell::new(None) };
}

impl Reactor {
    /// Builds a reactor for shard `id` over a shared queue fabric. Must run
    /// on the shard's own thread (it installs thread-local handles).
    pub(crate) fn new(id: usize, cfg: ReactorConfig, registry: Arc<SmpRegistry>) -> Box<Self> {
        let preempt = Arc::new(AtomicBool::new(false));
        let stall = StallDetector::new(
            id,
            cfg.stall,
            Arc::clone(&preempt),
            cfg.task_quota,
            id == 0,
        );
        let wake_registry = Arc::clone(&registry);
        let syscall = Rc::new(SyscallPool::new(
            id,
            cfg.syscall_threads,
            Arc::new(move || wake_registry.maybe_wakeup(id)),
        ));
        #[cfg(all(target_os = "linux", feature = "io-uring"))]
        let io = if cfg.force_syscall_io {
            Rc::new(RefCell::new(IoSink::new(Rc::clone(&syscall))))
        } else {
            match crate::io::KernelRing::new(crate::io::RingConfig::default()) {
                Ok(ring) => Rc::new(RefCell::new(IoSink::with_ring(Rc::clone(&syscall), ring))),
                Err(e) => {
                    tracing::warn!(
                        shard = id,
                        "io_uring setup failed, falling back to the syscall pool: {e}"
                    );
                    Rc::new(RefCell::new(IoSink::new(Rc::clone(&syscall))))
                }
            }
        };
        #[cfg(not(all(target_os = "linux", feature = "io-uring")))]
        let io = Rc::new(RefCell::new(IoSink::new(Rc::clone(&syscall))));
        let smp = Rc::new(RefCell::new(SmpShard::new(id, Arc::clone(&registry))));
        crate::smp::install_shard(Rc::clone(&smp));

        let mut queues = Vec::new();
        queues.push(TaskQueue::new(MAIN_QUEUE, "main", 1000.0));
        queues.push(TaskQueue::new(AT_EXIT_QUEUE, "atexit", 1000.0));

        Box::new(Self {
            id,
            cfg,
            queues,
            active: std::collections::VecDeque::new(),
            activating: Vec::new(),
            last_vruntime: 0,
            current_queue: MAIN_QUEUE,
            stopping: false,
            stopped: false,
            at_exit: Vec::new(),
            preempt,
            stall,
            steady_wheel: TimerWheel::new(),
            lowres_wheel: TimerWheel::new(),
            manual_wheel: TimerWheel::new(),
            smp,
            registry,
            syscall,
            io,
            stages: Vec::new(),
            flushers: Vec::new(),
            signal_handlers: FxHashMap::default(),
            idle_handler: None,
        })
    }

    fn wheel_mut(&mut self, clock: ClockKind) -> &mut TimerWheel {
        match clock {
            ClockKind::Steady => &mut self.steady_wheel,
            ClockKind::Lowres => &mut self.lowres_wheel,
            ClockKind::Manual => &mut self.manual_wheel,
        }
    }
}

fn with_current<R>(f: impl FnOnce(&mut Reactor) -> R) -> R {
    let ptr = CURRENT.with(Cell::get);
    assert!(!ptr.is_null(), "no reactor on this thread");
    // SAFETY: the pointer is installed for the lifetime of the run loop on
    // this thread only; callers never hold a second borrow across a call.
    f(unsafe { &mut *ptr })
}

// --- public shard-side API -------------------------------------------------

/// Logical id of the calling shard.
///
/// # Panics
///
/// Panics off-shard.
#[must_use]
pub fn shard_id() -> usize {
    with_current(|r| r.id)
}

/// Number of shards in the runtime.
#[must_use]
pub fn shard_count() -> usize {
    with_current(|r| r.registry.shard_count())
}

/// Cheap cooperative preemption check: has the task quota expired?
#[must_use]
pub fn need_preempt() -> bool {
    PREEMPT.with(|p| {
        p.borrow()
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
    })
}

/// Creates a task queue with the given fair-share weight; returns its id.
pub fn add_task_queue(name: impl Into<String>, shares: f32) -> usize {
    with_current(|r| {
        let id = r.queues.len();
        r.queues.push(TaskQueue::new(id, name, shares));
        id
    })
}

/// Updates a queue's fair-share weight.
pub fn set_shares(qid: usize, shares: f32) {
    with_current(|r| r.queues[qid].set_shares(shares));
}

/// Queue the currently running task belongs to.
#[must_use]
pub fn current_queue() -> usize {
    with_current(|r| r.current_queue)
}

/// Enqueues a task on queue `qid`.
pub fn spawn(qid: usize, task: Box<dyn Task>) {
    with_current(|r| {
        let now = SteadyClock::now();
        r.queues[qid].queue.push_back(task);
        activate(r, qid, now);
    });
}

/// Enqueues a closure on queue `qid`.
pub fn spawn_fn(qid: usize, f: impl FnOnce() + 'static) {
    spawn(qid, make_task(f));
}

/// Enqueues a closure on the caller's own queue (scheduling-group
/// inheritance).
pub fn spawn_local(f: impl FnOnce() + 'static) {
    let qid = current_queue();
    spawn(qid, make_task(f));
}

/// Registers a callback to run during shutdown. Exit callbacks run in
/// reverse registration order.
pub fn at_exit(f: impl FnOnce() + 'static) {
    with_current(|r| r.at_exit.push(Box::new(f)));
}

/// Installs the idle CPU handler; it returns true when it found more work
/// (keep polling) and false when the reactor may sleep.
pub fn set_idle_cpu_handler(f: impl FnMut() -> bool + 'static) {
    with_current(|r| r.idle_handler = Some(Box::new(f)));
}

/// Registers a batch flusher driven by the batch-flush poller.
pub fn register_flusher(f: impl FnMut() -> bool + 'static) {
    with_current(|r| r.flushers.push(Box::new(f)));
}

pub(crate) fn register_stage(stage: Rc<dyn StageFlush>) {
    with_current(|r| r.stages.push(stage));
}

/// Registers `f` to run when `signo` is delivered (dispatched from the
/// signal poller, not from the handler).
pub fn handle_signal(signo: i32, f: impl FnMut() + 'static) {
    signals::install(signo);
    with_current(|r| {
        r.signal_handlers
            .insert(signo, SignalHandler::Repeat(Box::new(f)));
    });
}

/// Like [`handle_signal`] but the callback runs at most once.
pub fn handle_signal_once(signo: i32, f: impl FnOnce() + 'static) {
    signals::install(signo);
    with_current(|r| {
        r.signal_handlers
            .insert(signo, SignalHandler::Once(Box::new(f)));
    });
}

/// Tasks completed by this shard since boot.
#[must_use]
pub fn tasks_processed() -> u64 {
    with_current(|r| r.stall.shared().tasks_processed.load(Ordering::Relaxed))
}

/// Stall records produced by this shard's watchdog.
#[must_use]
pub fn stall_count() -> u64 {
    with_current(|r| r.stall.stalls())
}

/// Snapshot of one task queue for stats and tests.
#[derive(Debug, Clone)]
pub struct TaskQueueStat {
    /// Queue id.
    pub id: usize,
    /// Queue name.
    pub name: String,
    /// Fair-share weight.
    pub shares: f32,
    /// Real runtime charged, in nanoseconds.
    pub runtime_ns: u64,
    /// Tasks completed.
    pub tasks_processed: u64,
}

/// Snapshots every task queue of the calling shard.
#[must_use]
pub fn queue_stats() -> Vec<TaskQueueStat> {
    with_current(|r| {
        r.queues
            .iter()
            .map(|q| TaskQueueStat {
                id: q.id(),
                name: q.name().to_string(),
                shares: q.shares(),
                runtime_ns: q.runtime_ns(),
                tasks_processed: q.tasks_processed(),
            })
            .collect()
    })
}

// --- timers ---------------------------------------------------------------

/// Handle to an armed timer.
#[derive(Debug, Clone, Copy)]
pub struct TimerHandle {
    clock: ClockKind,
    token: TimerToken,
}

/// Arms a timer at an absolute deadline on `clock`'s timeline. A `period`
/// re-arms it after every expiry. The callback is dispatched as a task on
/// the caller's queue; callback panics are logged and swallowed.
pub fn arm_timer_at(
    clock: ClockKind,
    deadline: u64,
    period: Option<Duration>,
    callback: impl FnMut() + 'static,
) -> TimerHandle {
    with_current(|r| {
        let qid = r.current_queue;
        #[allow(clippy::cast_possible_truncation)]
        let period_ns = period.map(|p| p.as_nanos() as u64);
        let (token, _new_earliest) = r.wheel_mut(clock).insert(
            deadline,
            period_ns,
            qid,
            Rc::new(RefCell::new(callback)),
        );
        TimerHandle { clock, token }
    })
}

/// Arms a one-shot timer `delay` from now.
pub fn arm_timer(
    clock: ClockKind,
    delay: Duration,
    callback: impl FnMut() + 'static,
) -> TimerHandle {
    #[allow(clippy::cast_possible_truncation)]
    let deadline = clock.now() + delay.as_nanos() as u64;
    arm_timer_at(clock, deadline, None, callback)
}

/// Arms a periodic timer with the given period.
pub fn arm_periodic(
    clock: ClockKind,
    period: Duration,
    callback: impl FnMut() + 'static,
) -> TimerHandle {
    #[allow(clippy::cast_possible_truncation)]
    let deadline = clock.now() + period.as_nanos() as u64;
    arm_timer_at(clock, deadline, Some(period), callback)
}

/// Cancels a timer. Returns true when it was still queued (the callback
/// will not fire). Timers are owned by their arming shard, so this is
/// race-free.
pub fn cancel_timer(handle: TimerHandle) -> bool {
    with_current(|r| r.wheel_mut(handle.clock).remove(handle.token))
}

// --- I/O ------------------------------------------------------------------

/// Queues a read on the calling shard's I/O sink.
pub fn io_read(device: DeviceId, fd: i32, len: usize, offset: i64) -> Ticket<IoOutcome> {
    with_current(|r| r.io.borrow_mut().submit_read(device, fd, len, offset))
}

/// Queues a write on the calling shard's I/O sink.
pub fn io_write(device: DeviceId, fd: i32, buf: Vec<u8>, offset: i64) -> Ticket<IoOutcome> {
    with_current(|r| r.io.borrow_mut().submit_write(device, fd, buf, offset))
}

/// Queues an fsync on the calling shard's I/O sink.
pub fn io_fsync(device: DeviceId, fd: i32) -> Ticket<IoOutcome> {
    with_current(|r| r.io.borrow_mut().submit_fsync(device, fd))
}

/// Aborts a handle: pending and future operations fail with
/// `connection_aborted`.
pub fn io_shutdown(fd: i32) {
    with_current(|r| r.io.borrow_mut().shutdown(fd));
}

/// Runs a blocking closure on the shard's syscall pool.
pub fn submit_syscall<T, F>(f: F) -> Ticket<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, Error> + Send + 'static,
{
    with_current(|r| r.syscall.submit(f))
}

// --- shutdown -------------------------------------------------------------

/// Marks just the calling shard stopped, bypassing the shard-0 broadcast.
/// Used only to unwind a partially failed boot.
pub(crate) fn stop_local() {
    with_current(|r| r.stopped = true);
}

fn run_exit_tasks_current() {
    let callbacks = with_current(|r| std::mem::take(&mut r.at_exit));
    // Reverse insertion order, preserved by the exit queue's FIFO.
    for callback in callbacks.into_iter().rev() {
        spawn(AT_EXIT_QUEUE, make_task(callback));
    }
}

/// Stops the runtime. Callable only on shard 0: runs local exit tasks,
/// broadcasts the exit request to every other shard, then marks all shards
/// stopped. Each reactor drains its queues before leaving its loop.
pub fn stop() {
    let proceed = with_current(|r| {
        assert_eq!(r.id, 0, "stop() may only be called on shard 0");
        if r.stopping {
            return false;
        }
        r.stopping = true;
        true
    });
    if !proceed {
        return;
    }
    run_exit_tasks_current();
    let n = with_current(|r| r.registry.shard_count());
    for shard in 1..n {
        drop(crate::smp::submit_to(shard, || {
            run_exit_tasks_current();
            with_current(|r| r.stopped = true);
            Ok(())
        }));
    }
    with_current(|r| r.stopped = true);
}

// --- scheduling core ------------------------------------------------------

fn have_more_tasks(r: &Reactor) -> bool {
    !r.active.is_empty() || !r.activating.is_empty()
}

fn activate(r: &mut Reactor, qid: usize, now: u64) {
    if r.queues[qid].active {
        return;
    }
    // A queue that slept would return with a tiny vruntime and dominate the
    // scheduler; lift it to the runqueue's watermark instead.
    let q = &mut r.queues[qid];
    q.vruntime = q.vruntime.max(r.last_vruntime);
    q.waittime_ns += now.saturating_sub(q.ts);
    q.ts = now;
    q.active = true;
    r.activating.push(qid);
}

/// Inserts an activated queue into the (approximately vruntime-sorted)
/// active list.
fn insert_active(r: &mut Reactor, qid: usize) {
    let v = r.queues[qid].vruntime;
    if r.active
        .back()
        .is_none_or(|&b| r.queues[b].vruntime <= v)
    {
        // Common case: CPU-bound queue returning to the back.
        r.active.push_back(qid);
        return;
    }
    // Newly activated queue preempting: start at the front and bubble to
    // its slot, keeping insertion order among equal vruntimes.
    r.active.push_front(qid);
    let mut i = 0;
    while i + 1 < r.active.len()
        && r.queues[r.active[i]].vruntime >= r.queues[r.active[i + 1]].vruntime
    {
        r.active.swap(i, i + 1);
        i += 1;
    }
}

fn insert_activating(r: &mut Reactor) {
    let pending = std::mem::take(&mut r.activating);
    for qid in pending {
        insert_active(r, qid);
    }
}

fn pop_active(r: &mut Reactor, now: u64) -> usize {
    let qid = r.active.pop_front().expect("active list empty");
    let q = &mut r.queues[qid];
    q.starvetime_ns += now.saturating_sub(q.ts);
    qid
}

fn run_tasks(ptr: *mut Reactor, qid: usize) {
    loop {
        let task = {
            // SAFETY: no reactor borrow is live; tasks run detached below.
            let r = unsafe { &mut *ptr };
            r.queues[qid].queue.pop_front()
        };
        let Some(task) = task else { break };
        if let Err(panic) = catch_unwind(AssertUnwindSafe(move || task.run_and_dispose())) {
            tracing::error!(
                "task failed: {}; continuing with the next task",
                crate::panic_message(&panic)
            );
        }
        // SAFETY: the task has returned; re-derive the reactor.
        let r = unsafe { &mut *ptr };
        r.queues[qid].tasks_processed += 1;
        r.stall
            .shared()
            .tasks_processed
            .fetch_add(1, Ordering::Relaxed);
        if r.preempt.load(Ordering::Relaxed) {
            if r.queues[qid].queue.len() <= r.cfg.max_task_backlog {
                break;
            }
            // Deep backlog: draining beats thrashing between queues.
            r.preempt.store(false, Ordering::Relaxed);
        }
    }
}

fn run_some_tasks(ptr: *mut Reactor) {
    // SAFETY: exclusive access between task invocations.
    let r = unsafe { &mut *ptr };
    if !have_more_tasks(r) {
        return;
    }
    r.preempt.store(false, Ordering::Relaxed);
    let mut t_run_completed = SteadyClock::now();
    r.stall.start_task_run(t_run_completed);
    loop {
        let t_run_started = t_run_completed;
        let qid = {
            // SAFETY: as above.
            let r = unsafe { &mut *ptr };
            insert_activating(r);
            let qid = pop_active(r, t_run_started);
            r.last_vruntime = r.last_vruntime.max(r.queues[qid].vruntime);
            r.current_queue = qid;
            qid
        };
        run_tasks(ptr, qid);
        // SAFETY: as above.
        let r = unsafe { &mut *ptr };
        r.current_queue = MAIN_QUEUE;
        t_run_completed = SteadyClock::now();
        let delta = t_run_completed.saturating_sub(t_run_started);
        #[allow(clippy::cast_possible_truncation)]
        let quota_ns = r.cfg.task_quota.as_nanos() as u64;
        r.queues[qid].account_runtime(delta, quota_ns);
        r.queues[qid].ts = t_run_completed;
        if r.queues[qid].is_empty() {
            r.queues[qid].active = false;
        } else {
            insert_active(r, qid);
        }
        if !have_more_tasks(r) || r.preempt.load(Ordering::Relaxed) {
            break;
        }
    }
    // SAFETY: as above.
    let r = unsafe { &mut *ptr };
    r.stall.end_task_run();
}

// --- timer service --------------------------------------------------------

fn dispatch_fired(fired: SmallVec<[Fired; 8]>) {
    for f in fired {
        spawn(
            f.queue,
            make_task(move || {
                let callback = f.callback;
                if let Err(panic) =
                    catch_unwind(AssertUnwindSafe(|| (callback.borrow_mut())()))
                {
                    tracing::error!(
                        "timer callback failed: {}",
                        crate::panic_message(&panic)
                    );
                }
            }),
        );
    }
}

fn service_highres_timers(ptr: *mut Reactor) -> bool {
    let mut work = false;
    // SAFETY: wheel access releases before callbacks are dispatched (they
    // only enqueue tasks).
    let steady_now = SteadyClock::now();
    let fired = {
        let r = unsafe { &mut *ptr };
        if r.steady_wheel.next_deadline().is_some_and(|d| d <= steady_now) {
            r.steady_wheel.expire(steady_now)
        } else {
            SmallVec::new()
        }
    };
    if !fired.is_empty() {
        work = true;
        dispatch_fired(fired);
    }
    let manual_now = ManualClock::now();
    let fired = {
        // SAFETY: as above.
        let r = unsafe { &mut *ptr };
        if r.manual_wheel.next_deadline().is_some_and(|d| d <= manual_now) {
            r.manual_wheel.expire(manual_now)
        } else {
            SmallVec::new()
        }
    };
    if !fired.is_empty() {
        work = true;
        dispatch_fired(fired);
    }
    work
}

pub(crate) fn expire_lowres_timers() -> bool {
    let now = crate::timer::LowresClock::now();
    let fired = with_current(|r| {
        if r.lowres_wheel.next_deadline().is_some_and(|d| d <= now) {
            r.lowres_wheel.expire(now)
        } else {
            SmallVec::new()
        }
    });
    if fired.is_empty() {
        return false;
    }
    dispatch_fired(fired);
    true
}

pub(crate) fn lowres_timers_due() -> bool {
    let now = crate::timer::LowresClock::now();
    with_current(|r| r.lowres_wheel.next_deadline().is_some_and(|d| d <= now))
}

// --- poller helpers -------------------------------------------------------

pub(crate) fn run_flushers() -> bool {
    let mut flushers = with_current(|r| std::mem::take(&mut r.flushers));
    let mut work = false;
    for f in &mut flushers {
        work |= f();
    }
    with_current(|r| {
        let mut registered_during = std::mem::replace(&mut r.flushers, flushers);
        r.flushers.append(&mut registered_during);
    });
    work
}

pub(crate) fn flush_stages() -> bool {
    let stages = with_current(|r| r.stages.clone());
    let mut work = false;
    for stage in stages {
        work |= stage.flush();
    }
    work
}

pub(crate) fn stages_have_items() -> bool {
    with_current(|r| r.stages.iter().any(|s| s.has_items()))
}

/// Bitmask of signals this reactor has handlers for.
fn handled_signal_mask() -> u64 {
    with_current(|r| {
        r.signal_handlers
            .keys()
            .fold(0u64, |mask, &signo| mask | (1 << signo))
    })
}

/// Signals pending for this reactor (the latch is process-global; bits
/// without a local handler belong to some other reactor).
pub(crate) fn pending_handled_signals() -> u64 {
    signals::pending_mask() & handled_signal_mask()
}

pub(crate) fn dispatch_signals() -> bool {
    let mask = pending_handled_signals();
    if mask == 0 {
        return false;
    }
    signals::clear(mask);
    for signo in 0..64 {
        if mask & (1 << signo) == 0 {
            continue;
        }
        let handler = with_current(|r| r.signal_handlers.remove(&signo));
        match handler {
            Some(SignalHandler::Repeat(mut f)) => {
                f();
                with_current(|r| {
                    r.signal_handlers
                        .entry(signo)
                        .or_insert(SignalHandler::Repeat(f));
                });
            }
            Some(SignalHandler::Once(f)) => f(),
            None => tracing::debug!(signo, "signal with no registered handler"),
        }
    }
    true
}

// --- the loop -------------------------------------------------------------

fn build_pollers(r: &Reactor) -> Vec<Box<dyn Poller>> {
    vec![
        Box::new(SmpPoller {
            shard: Rc::clone(&r.smp),
            registry: Arc::clone(&r.registry),
            id: r.id,
        }),
        Box::new(IoReapPoller {
            sink: Rc::clone(&r.io),
        }),
        Box::new(IoSubmitPoller {
            sink: Rc::clone(&r.io),
        }),
        Box::new(KernelSubmitPoller {
            sink: Rc::clone(&r.io),
        }),
        Box::new(IoReapPoller {
            sink: Rc::clone(&r.io),
        }),
        Box::new(FlushPoller),
        Box::new(StagePoller),
        Box::new(MemPoller),
        Box::new(LowresTimerPoller),
        Box::new(SignalPoller),
        Box::new(SyscallPoller {
            pool: Rc::clone(&r.syscall),
        }),
    ]
}

fn run_idle_handler(ptr: *mut Reactor) -> bool {
    // SAFETY: handler is detached while it runs.
    let handler = unsafe { (*ptr).idle_handler.take() };
    let Some(mut handler) = handler else {
        return true; // no handler: sleep freely
    };
    let more_work = match catch_unwind(AssertUnwindSafe(&mut handler)) {
        Ok(more) => more,
        Err(panic) => {
            // Idle-handler failures are reported; the shard keeps running.
            tracing::error!(
                "idle cpu handler failed: {}",
                crate::panic_message(&panic)
            );
            false
        }
    };
    // SAFETY: reinstall after the call returned.
    unsafe {
        if (*ptr).idle_handler.is_none() {
            (*ptr).idle_handler = Some(handler);
        }
    }
    !more_work
}

fn next_timer_deadline(r: &Reactor) -> Option<u64> {
    // Lowres deadlines live on the coarse clock, which lags steady time by
    // up to one granule; pad them so the wake lands after the clock catches
    // up instead of spinning.
    #[allow(clippy::cast_possible_truncation)]
    let slack = crate::timer::LOWRES_GRANULARITY.as_nanos() as u64;
    let lowres = r.lowres_wheel.next_deadline().map(|d| d + slack);
    match (r.steady_wheel.next_deadline(), lowres) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

fn sleep_on_fd(fd: i32, timeout_ns: Option<u64>) {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    #[cfg(target_os = "linux")]
    {
        let ts = timeout_ns.map(|ns| libc::timespec {
            #[allow(clippy::cast_possible_wrap)]
            tv_sec: (ns / 1_000_000_000) as libc::time_t,
            #[allow(clippy::cast_possible_wrap)]
            tv_nsec: (ns % 1_000_000_000) as libc::c_long,
        });
        let ts_ptr = ts
            .as_ref()
            .map_or(std::ptr::null(), std::ptr::from_ref);
        // SAFETY: one valid pollfd; the timespec (if any) outlives the call.
        unsafe {
            libc::ppoll(&mut pfd, 1, ts_ptr, std::ptr::null());
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        #[allow(clippy::cast_possible_truncation)]
        let ms = timeout_ns.map_or(-1i32, |ns| ((ns + 999_999) / 1_000_000) as i32);
        // SAFETY: one valid pollfd.
        unsafe {
            libc::poll(&mut pfd, 1, ms);
        }
    }
}

fn try_sleep(ptr: *mut Reactor, pollers: &mut [Box<dyn Poller>]) {
    let mut entered = 0;
    let mut ok = true;
    for p in pollers.iter_mut() {
        if p.try_enter_interrupt_mode() {
            entered += 1;
        } else {
            ok = false;
            break;
        }
    }
    if ok {
        // SAFETY: read-only peek at loop state.
        let r = unsafe { &*ptr };
        if have_more_tasks(r) || pollers.iter().any(|p| p.pure_poll()) {
            ok = false;
        }
    }
    if ok {
        // SAFETY: as above.
        let r = unsafe { &*ptr };
        let timeout = next_timer_deadline(r).map(|d| d.saturating_sub(SteadyClock::now()));
        r.stall.start_sleep();
        sleep_on_fd(r.registry.notifiers[r.id].poll_fd(), timeout);
        r.stall.end_sleep();
        r.registry.notifiers[r.id].drain();
    }
    for p in pollers[..entered].iter_mut().rev() {
        p.exit_interrupt_mode();
    }
}

/// Runs the reactor loop until the shard is stopped and drained. Returns
/// the reactor for orderly teardown.
pub(crate) fn run(reactor: Box<Reactor>) -> Box<Reactor> {
    let ptr = Box::into_raw(reactor);
    CURRENT.with(|c| c.set(ptr));
    // SAFETY: exclusive access; the loop has not started.
    let preempt = unsafe { Arc::clone(&(*ptr).preempt) };
    PREEMPT.with(|p| *p.borrow_mut() = Some(preempt));

    // Route async reclaim through the reactor when this thread has a heap.
    if crate::mem::shard_memory_layout().is_some() {
        crate::mem::set_reclaim_hook(Box::new(|f| {
            spawn(MAIN_QUEUE, make_task(f));
        }));
    }
    // Shard 0 owns process signals: SIGINT/SIGTERM request an orderly stop.
    // SAFETY: pre-loop exclusive access.
    if unsafe { (*ptr).id } == 0 {
        // SAFETY: as above.
        let fd = unsafe { (&(*ptr).registry).notifiers[0].poll_fd() };
        signals::set_notify_fd(fd);
        handle_signal_once(libc::SIGINT, stop);
        handle_signal_once(libc::SIGTERM, stop);
    }

    // SAFETY: as above.
    let mut pollers = build_pollers(unsafe { &*ptr });
    tracing::trace!(
        shard = unsafe { (*ptr).id },
        pollers = ?pollers.iter().map(|p| p.name()).collect::<Vec<_>>(),
        "reactor pollers registered"
    );
    let mut idle_since: Option<u64> = None;
    #[allow(clippy::cast_possible_truncation)]
    let idle_poll_ns = unsafe { (*ptr).cfg.idle_poll_time.as_nanos() as u64 };

    loop {
        run_some_tasks(ptr);
        {
            // SAFETY: between phases, no other borrow is live.
            let r = unsafe { &mut *ptr };
            if r.stopped && !have_more_tasks(r) && !r.smp.borrow().has_unflushed() {
                break;
            }
        }
        let mut work = service_highres_timers(ptr);
        for p in &mut pollers {
            work |= p.poll();
        }
        // SAFETY: as above.
        let r = unsafe { &mut *ptr };
        if work || have_more_tasks(r) {
            idle_since = None;
            continue;
        }
        if r.cfg.poll_mode {
            continue;
        }
        let now = SteadyClock::now();
        let since = *idle_since.get_or_insert(now);
        if !run_idle_handler(ptr) {
            idle_since = None;
            continue;
        }
        if now.saturating_sub(since) < idle_poll_ns {
            continue;
        }
        try_sleep(ptr, &mut pollers);
        idle_since = None;
    }

    tracing::debug!(shard = unsafe { (*ptr).id }, "reactor loop exited");
    crate::smp::uninstall_shard();
    PREEMPT.with(|p| *p.borrow_mut() = None);
    CURRENT.with(|c| c.set(std::ptr::null_mut()));
    // SAFETY: the loop has exited; reclaim sole ownership.
    unsafe { Box::from_raw(ptr) }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn standalone(cfg: ReactorConfig) -> Box<Reactor> {
        let registry = SmpRegistry::new(1).expect("registry");
        Reactor::new(0, cfg, registry)
    }

    /// Runs `boot` with the reactor installed (before the loop starts) so
    /// it can queue initial tasks, then enters the loop.
    fn run_with_boot(reactor: Box<Reactor>, boot: impl FnOnce()) -> Box<Reactor> {
        let ptr = Box::into_raw(reactor);
        CURRENT.with(|c| c.set(ptr));
        boot();
        CURRENT.with(|c| c.set(std::ptr::null_mut()));
        // SAFETY: boot has returned; sole ownership resumes.
        run(unsafe { Box::from_raw(ptr) })
    }

    #[test]
    fn runs_tasks_and_stops() {
        let reactor = standalone(ReactorConfig::default());
        let _ = run_with_boot(reactor, || {
            spawn_fn(MAIN_QUEUE, || {
                spawn_fn(MAIN_QUEUE, stop);
            });
        });
    }

    #[test]
    fn task_panic_does_not_kill_the_loop() {
        let reactor = standalone(ReactorConfig::default());
        let _ = run_with_boot(reactor, || {
            spawn_fn(MAIN_QUEUE, || panic!("task exploded"));
            spawn_fn(MAIN_QUEUE, stop);
        });
    }

    #[test]
    fn fifo_order_within_a_queue() {
        let reactor = standalone(ReactorConfig::default());
        let order = Rc::new(RefCell::new(Vec::new()));
        let o = Rc::clone(&order);
        let _ = run_with_boot(reactor, move || {
            for i in 0..16 {
                let o = Rc::clone(&o);
                spawn_fn(MAIN_QUEUE, move || o.borrow_mut().push(i));
            }
            spawn_fn(MAIN_QUEUE, stop);
        });
        assert_eq!(*order.borrow(), (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn exit_tasks_run_in_reverse_order() {
        let reactor = standalone(ReactorConfig::default());
        let order = Rc::new(RefCell::new(Vec::new()));
        let o = Rc::clone(&order);
        let _ = run_with_boot(reactor, move || {
            for i in 0..4 {
                let o = Rc::clone(&o);
                at_exit(move || o.borrow_mut().push(i));
            }
            spawn_fn(MAIN_QUEUE, stop);
        });
        assert_eq!(*order.borrow(), vec![3, 2, 1, 0]);
    }

    #[test]
    fn steady_timer_fires_and_cancelled_timer_does_not() {
        let reactor = standalone(ReactorConfig::default());
        let fired = Rc::new(RefCell::new(Vec::new()));
        let f = Rc::clone(&fired);
        let _ = run_with_boot(reactor, move || {
            let f1 = Rc::clone(&f);
            let _keep = arm_timer(ClockKind::Steady, Duration::from_millis(2), move || {
                f1.borrow_mut().push("fired");
            });
            let f2 = Rc::clone(&f);
            let cancel_me = arm_timer(ClockKind::Steady, Duration::from_millis(2), move || {
                f2.borrow_mut().push("cancelled");
            });
            assert!(cancel_timer(cancel_me));
            arm_timer(ClockKind::Steady, Duration::from_millis(10), stop);
        });
        assert_eq!(*fired.borrow(), vec!["fired"]);
    }

    #[test]
    fn periodic_timer_fires_k_times() {
        let reactor = standalone(ReactorConfig::default());
        let count = Rc::new(Cell::new(0u32));
        let c = Rc::clone(&count);
        let _ = run_with_boot(reactor, move || {
            let c2 = Rc::clone(&c);
            let handle = arm_periodic(ClockKind::Steady, Duration::from_millis(2), move || {
                c2.set(c2.get() + 1);
            });
            arm_timer(ClockKind::Steady, Duration::from_millis(11), move || {
                cancel_timer(handle);
                stop();
            });
        });
        // 5 periods in 11 ms of 2 ms each, +-1 at the edges.
        assert!((4..=6).contains(&count.get()), "fired {}", count.get());
    }

    #[test]
    fn execution_stage_preserves_call_order() {
        let reactor = standalone(ReactorConfig::default());
        let seen = Rc::new(RefCell::new(Vec::new()));
        let s = Rc::clone(&seen);
        let _ = run_with_boot(reactor, move || {
            let s2 = Rc::clone(&s);
            let stage = ExecutionStage::new("adder", MAIN_QUEUE, move |v: u32| {
                s2.borrow_mut().push(v);
            });
            for i in 0..10 {
                stage.add(i);
            }
            arm_timer(ClockKind::Steady, Duration::from_millis(5), stop);
        });
        assert_eq!(*seen.borrow(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn fair_share_ratio_between_queues() {
        let reactor = standalone(ReactorConfig {
            task_quota: Duration::from_micros(200),
            ..ReactorConfig::default()
        });
        let stats: Rc<RefCell<Vec<TaskQueueStat>>> = Rc::new(RefCell::new(Vec::new()));
        let out = Rc::clone(&stats);
        let _ = run_with_boot(reactor, move || {
            let qa = add_task_queue("a", 100.0);
            let qb = add_task_queue("b", 200.0);
            let deadline = SteadyClock::now() + 300_000_000; // 300 ms

            fn burn(qid: usize, deadline: u64) {
                // ~1 ms of pure CPU per task.
                let until = SteadyClock::now() + 1_000_000;
                while SteadyClock::now() < until {
                    std::hint::black_box(0u64);
                }
                if SteadyClock::now() < deadline {
                    spawn_fn(qid, move || burn(qid, deadline));
                }
            }
            spawn_fn(qa, move || burn(qa, deadline));
            spawn_fn(qb, move || burn(qb, deadline));
            arm_timer(ClockKind::Steady, Duration::from_millis(320), move || {
                *out.borrow_mut() = queue_stats();
                stop();
            });
        });
        let stats = stats.borrow();
        let a = stats.iter().find(|s| s.name == "a").unwrap().runtime_ns as f64;
        let b = stats.iter().find(|s| s.name == "b").unwrap().runtime_ns as f64;
        let ratio = b / a;
        // The 200-share queue gets about twice the CPU; wide bounds absorb
        // scheduler jitter on loaded CI machines.
        assert!((1.5..=2.6).contains(&ratio), "b/a CPU ratio was {ratio}");
    }

    #[test]
    fn signal_poller_dispatches_registered_handler() {
        let reactor = standalone(ReactorConfig::default());
        let hits = Rc::new(Cell::new(0u32));
        let h = Rc::clone(&hits);
        let _ = run_with_boot(reactor, move || {
            let h2 = Rc::clone(&h);
            handle_signal(libc::SIGUSR1, move || h2.set(h2.get() + 1));
            spawn_fn(MAIN_QUEUE, || {
                // SAFETY: raising a handled signal at ourselves.
                unsafe {
                    libc::raise(libc::SIGUSR1);
                }
                arm_timer(ClockKind::Steady, Duration::from_millis(5), stop);
            });
        });
        assert_eq!(hits.get(), 1);
    }
}
