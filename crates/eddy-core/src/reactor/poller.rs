//! The poller interface and the fixed poller set.
//!
//! Every loop round the reactor walks its pollers in a fixed order. Each
//! poller can do work (`poll`), report whether work exists without doing it
//! (`pure_poll`), and take part in the sleep handshake: before sleeping the
//! reactor asks every poller to enter interrupt mode; any refusal (because
//! new work appeared) rolls the already-entered pollers back and the loop
//! keeps polling.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;

use crate::io::{IoSink, SyscallPool};
use crate::smp::{SmpRegistry, SmpShard};

/// One externally-driven work source of the reactor loop.
pub(crate) trait Poller {
    fn name(&self) -> &'static str;
    /// Does pending work; returns whether any was found.
    fn poll(&mut self) -> bool;
    /// Read-only work check used by the sleep decision.
    fn pure_poll(&self) -> bool;
    /// Prepares for reactor sleep; false refuses (new work was seen).
    fn try_enter_interrupt_mode(&mut self) -> bool {
        true
    }
    fn exit_interrupt_mode(&mut self) {}
}

/// Poller 1: cross-shard inbound queues, completions, and alien work.
pub(crate) struct SmpPoller {
    pub(crate) shard: Rc<RefCell<SmpShard>>,
    pub(crate) registry: Arc<SmpRegistry>,
    pub(crate) id: usize,
}

impl Poller for SmpPoller {
    fn name(&self) -> &'static str {
        "smp"
    }

    fn poll(&mut self) -> bool {
        let mut work = false;

        // Completions first: responses to our own earlier requests. The
        // batches are detached so `complete()` runs with the shard borrow
        // released (a completion may submit follow-up requests).
        let batches = self.shard.borrow_mut().take_completions();
        for (dest, batch) in batches {
            work = true;
            for msg in batch {
                let group = msg.group();
                msg.complete();
                self.shard.borrow_mut().note_completed(dest, group);
            }
        }

        // Then requests from peers; handlers run unborrowed too.
        let batches = self.shard.borrow_mut().take_incoming();
        for (from, batch) in batches {
            work = true;
            for mut msg in batch {
                msg.process();
                self.shard.borrow_mut().stage_response(from, msg);
            }
            self.shard.borrow_mut().flush_responses_to(from);
        }

        // Alien work: closures from non-shard threads. Panics stop at the
        // poller boundary like any task failure.
        let aliens = self.shard.borrow_mut().take_alien();
        for task in aliens {
            work = true;
            if let Err(panic) =
                std::panic::catch_unwind(std::panic::AssertUnwindSafe(task))
            {
                tracing::error!(
                    "alien task failed: {}",
                    crate::panic_message(&panic)
                );
            }
        }

        let mut shard = self.shard.borrow_mut();
        work |= shard.expire_waiters();
        work |= shard.flush_all();
        work
    }

    fn pure_poll(&self) -> bool {
        self.shard.borrow().pure_poll() || self.shard.borrow().has_unflushed()
    }

    fn try_enter_interrupt_mode(&mut self) -> bool {
        // Publish the sleeping flag before the final work check; producers
        // load it after their push. The full fence is the systemwide side
        // of the handshake (producers only use a compiler barrier).
        self.registry.sleeping[self.id].store(true, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        if self.pure_poll() {
            self.registry.sleeping[self.id].store(false, Ordering::Relaxed);
            return false;
        }
        true
    }

    fn exit_interrupt_mode(&mut self) {
        self.registry.sleeping[self.id].store(false, Ordering::Relaxed);
    }
}

/// Pollers 2 and 5: reap kernel completions (and fallback relays).
pub(crate) struct IoReapPoller {
    pub(crate) sink: Rc<RefCell<IoSink>>,
}

impl Poller for IoReapPoller {
    fn name(&self) -> &'static str {
        "io-reap"
    }

    fn poll(&mut self) -> bool {
        let mut work = self.sink.borrow_mut().poll_completions();
        work |= crate::io::poll_relays();
        work
    }

    fn pure_poll(&self) -> bool {
        false // completions are level-triggered via the sink's own state
    }
}

/// Poller 3: move staged requests from device queues into the backend.
pub(crate) struct IoSubmitPoller {
    pub(crate) sink: Rc<RefCell<IoSink>>,
}

impl Poller for IoSubmitPoller {
    fn name(&self) -> &'static str {
        "io-submit"
    }

    fn poll(&mut self) -> bool {
        self.sink.borrow_mut().poll_submit()
    }

    fn pure_poll(&self) -> bool {
        self.sink.borrow().pure_poll()
    }
}

/// Poller 4: push ring submissions to the OS.
pub(crate) struct KernelSubmitPoller {
    pub(crate) sink: Rc<RefCell<IoSink>>,
}

impl Poller for KernelSubmitPoller {
    fn name(&self) -> &'static str {
        "kernel-submit"
    }

    fn poll(&mut self) -> bool {
        self.sink.borrow_mut().kernel_submit()
    }

    fn pure_poll(&self) -> bool {
        false
    }
}

/// Poller 6: registered batch flushers (write coalescing).
pub(crate) struct FlushPoller;

impl Poller for FlushPoller {
    fn name(&self) -> &'static str {
        "batch-flush"
    }

    fn poll(&mut self) -> bool {
        super::run_flushers()
    }

    fn pure_poll(&self) -> bool {
        false
    }
}

/// Poller 7: execution-stage flush.
pub(crate) struct StagePoller;

impl Poller for StagePoller {
    fn name(&self) -> &'static str {
        "execution-stage"
    }

    fn poll(&mut self) -> bool {
        super::flush_stages()
    }

    fn pure_poll(&self) -> bool {
        super::stages_have_items()
    }
}

/// Poller 8: drain the allocator's cross-shard free list.
pub(crate) struct MemPoller;

impl Poller for MemPoller {
    fn name(&self) -> &'static str {
        "mem-drain"
    }

    fn poll(&mut self) -> bool {
        crate::mem::drain_cross_shard_frees()
    }

    fn pure_poll(&self) -> bool {
        crate::mem::has_pending_cross_shard_frees()
    }
}

/// Poller 9: low-resolution timer expiry.
pub(crate) struct LowresTimerPoller;

impl Poller for LowresTimerPoller {
    fn name(&self) -> &'static str {
        "lowres-timer"
    }

    fn poll(&mut self) -> bool {
        super::expire_lowres_timers()
    }

    fn pure_poll(&self) -> bool {
        super::lowres_timers_due()
    }
}

/// Poller 10: process signal dispatch.
pub(crate) struct SignalPoller;

impl Poller for SignalPoller {
    fn name(&self) -> &'static str {
        "signals"
    }

    fn poll(&mut self) -> bool {
        super::dispatch_signals()
    }

    fn pure_poll(&self) -> bool {
        super::pending_handled_signals() != 0
    }

    fn try_enter_interrupt_mode(&mut self) -> bool {
        super::pending_handled_signals() == 0
    }
}

/// Poller 11: syscall thread-pool completions.
pub(crate) struct SyscallPoller {
    pub(crate) pool: Rc<SyscallPool>,
}

impl Poller for SyscallPoller {
    fn name(&self) -> &'static str {
        "syscall-pool"
    }

    fn poll(&mut self) -> bool {
        self.pool.poll_completions()
    }

    fn pure_poll(&self) -> bool {
        self.pool.pure_poll()
    }
}
