//! # Cross-shard Queues
//!
//! Shards communicate exclusively through bounded lock-free SPSC rings, one
//! per ordered pair. A submission is a closure that runs on the destination
//! shard; its result rides the reverse ring and resolves a [`Ticket`] on the
//! source. Admission is governed by [`ServiceGroup`] semaphores with
//! deadlines. Threads outside the runtime go through [`Alien`] handles.
//!
//! Ordering: within one (from, to) pair and one service group, delivery
//! follows submission order; nothing is guaranteed across pairs.

mod alien;
mod group;
mod notify;
mod queue;
mod spsc;
mod ticket;

pub use group::{create_service_group, default_service_group, ServiceGroup, ServiceGroupConfig};
pub use queue::SmpStats;
pub use spsc::{CachePadded, SpscQueue};
pub use ticket::Ticket;

pub(crate) use alien::AlienQueue;
pub(crate) use notify::Notifier;
pub(crate) use queue::{CallMessage, SmpMessage, SmpRegistry, SmpShard};
pub(crate) use ticket::{ticket as new_ticket, Completer};

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::timer::SteadyClock;
use crate::Error;

thread_local! {
    static SHARD: RefCell<Option<Rc<RefCell<SmpShard>>>> = const { RefCell::new(None) };
}

pub(crate) fn install_shard(shard: Rc<RefCell<SmpShard>>) {
    SHARD.with(|s| *s.borrow_mut() = Some(shard));
}

pub(crate) fn uninstall_shard() {
    SHARD.with(|s| *s.borrow_mut() = None);
}

pub(crate) fn with_shard<R>(f: impl FnOnce(&mut SmpShard) -> R) -> Option<R> {
    SHARD.with(|s| {
        s.borrow()
            .as_ref()
            .map(|shard| f(&mut shard.borrow_mut()))
    })
}

/// Runs `func` on shard `dest` under the default service group, with no
/// admission deadline.
///
/// # Panics
///
/// Panics when called from a thread that is not a shard; alien threads use
/// [`Alien`] handles instead.
pub fn submit_to<T, F>(dest: usize, func: F) -> Ticket<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, Error> + Send + 'static,
{
    submit_to_in_group(dest, default_service_group(), None, func)
}

/// Runs `func` on shard `dest` under `group`; when `timeout` elapses before
/// admission, the ticket resolves with `queue_timeout`.
///
/// # Panics
///
/// Panics when called from a thread that is not a shard.
pub fn submit_to_in_group<T, F>(
    dest: usize,
    group: ServiceGroup,
    timeout: Option<Duration>,
    func: F,
) -> Ticket<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, Error> + Send + 'static,
{
    let (t, c) = ticket::ticket();
    let msg = Box::new(CallMessage {
        func: Some(func),
        result: None,
        completer: Some(c),
        group,
    });
    #[allow(clippy::cast_possible_truncation)]
    let deadline = timeout.map(|d| SteadyClock::now() + d.as_nanos() as u64);
    let submitted = with_shard(|shard| shard.submit(dest, deadline, msg)).is_some();
    assert!(
        submitted,
        "smp::submit_to called off-shard; use Runtime::alien() from foreign threads"
    );
    t
}

struct SelectShared<T> {
    remaining: AtomicUsize,
    completer: Mutex<Option<Completer<T>>>,
}

struct SelectMessage<T, F>
where
    T: Send,
    F: FnOnce() -> Result<T, Error> + Send,
{
    func: Option<F>,
    result: Option<Result<T, Error>>,
    shared: Arc<SelectShared<T>>,
    group: ServiceGroup,
}

impl<T, F> SelectMessage<T, F>
where
    T: Send,
    F: FnOnce() -> Result<T, Error> + Send,
{
    fn settle(&mut self, result: Result<T, Error>) {
        let last = self.shared.remaining.fetch_sub(1, Ordering::AcqRel) == 1;
        let mut slot = self
            .shared
            .completer
            .lock()
            .expect("select_any completer poisoned");
        match result {
            Ok(v) => {
                if let Some(c) = slot.take() {
                    c.complete(Ok(v));
                }
            }
            Err(_) if last => {
                if let Some(c) = slot.take() {
                    c.complete(Err(Error::AllRequestsFailed));
                }
            }
            Err(_) => {}
        }
    }
}

impl<T, F> SmpMessage for SelectMessage<T, F>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, Error> + Send,
{
    fn process(&mut self) {
        let func = self.func.take().expect("select message processed twice");
        let result = match std::panic::catch_unwind(std::panic::AssertUnwindSafe(func)) {
            Ok(r) => r,
            Err(panic) => Err(Error::Runtime(crate::panic_message(&panic))),
        };
        self.result = Some(result);
    }

    fn complete(mut self: Box<Self>) {
        let result = self
            .result
            .take()
            .unwrap_or_else(|| Err(Error::Runtime("response lost its result".into())));
        self.settle(result);
    }

    fn fail(mut self: Box<Self>, err: Error) {
        self.settle(Err(err));
    }

    fn group(&self) -> ServiceGroup {
        self.group
    }
}

/// Fans `factory(shard)` out to every shard in `shards`; the first success
/// resolves the ticket. When every attempt fails the ticket resolves with
/// `all_requests_failed`.
///
/// # Panics
///
/// Panics when called from a thread that is not a shard.
pub fn select_any<T, F>(
    shards: &[usize],
    group: ServiceGroup,
    timeout: Option<Duration>,
    factory: impl Fn(usize) -> F,
) -> Ticket<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, Error> + Send + 'static,
{
    let (t, c) = ticket::ticket();
    if shards.is_empty() {
        c.complete(Err(Error::AllRequestsFailed));
        return t;
    }
    let shared = Arc::new(SelectShared {
        remaining: AtomicUsize::new(shards.len()),
        completer: Mutex::new(Some(c)),
    });
    #[allow(clippy::cast_possible_truncation)]
    let deadline = timeout.map(|d| SteadyClock::now() + d.as_nanos() as u64);
    for &dest in shards {
        let msg = Box::new(SelectMessage {
            func: Some(factory(dest)),
            result: None,
            shared: Arc::clone(&shared),
            group,
        });
        let submitted = with_shard(|shard| shard.submit(dest, deadline, msg)).is_some();
        assert!(submitted, "smp::select_any called off-shard");
    }
    t
}

/// In-flight request count of the calling shard (sent minus completed).
#[must_use]
pub fn queue_length() -> u64 {
    with_shard(|s| s.queue_length()).unwrap_or(0)
}

/// Cross-shard traffic counters of the calling shard.
#[must_use]
pub fn stats() -> SmpStats {
    with_shard(|s| s.stats).unwrap_or_default()
}

/// Handle non-shard threads use to inject work into the runtime.
#[derive(Clone)]
pub struct Alien {
    pub(crate) registry: Arc<SmpRegistry>,
}

impl Alien {
    /// Queues `f` to run on shard `shard`.
    ///
    /// # Errors
    ///
    /// `request_receiver_down` when the shard is not running.
    pub fn submit_to(
        &self,
        shard: usize,
        f: impl FnOnce() + Send + 'static,
    ) -> Result<(), Error> {
        if shard >= self.registry.shard_count() || !self.registry.is_alive(shard) {
            return Err(Error::RequestReceiverDown);
        }
        self.registry.alien[shard].push(Box::new(f));
        self.registry.maybe_wakeup(shard);
        Ok(())
    }

    /// Queues `f` on shard `shard` and returns a ticket for its result.
    ///
    /// # Errors
    ///
    /// `request_receiver_down` when the shard is not running.
    pub fn submit_to_with_result<T, F>(&self, shard: usize, f: F) -> Result<Ticket<T>, Error>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, Error> + Send + 'static,
    {
        let (t, c) = ticket::ticket();
        self.submit_to(shard, move || {
            let result = match std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)) {
                Ok(r) => r,
                Err(panic) => Err(Error::Runtime(crate::panic_message(&panic))),
            };
            c.complete(result);
        })?;
        Ok(t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_any_first_success_wins() {
        let registry = SmpRegistry::new(3).unwrap();
        let mut s0 = SmpShard::new(0, Arc::clone(&registry));
        let mut s1 = SmpShard::new(1, Arc::clone(&registry));
        let mut s2 = SmpShard::new(2, Arc::clone(&registry));

        let (t, c) = ticket::ticket::<u32>();
        let shared = Arc::new(SelectShared {
            remaining: AtomicUsize::new(2),
            completer: Mutex::new(Some(c)),
        });
        for (dest, ok) in [(1usize, false), (2usize, true)] {
            let msg = Box::new(SelectMessage {
                func: Some(move || {
                    if ok {
                        Ok(7u32)
                    } else {
                        Err(Error::Runtime("no".into()))
                    }
                }),
                result: None,
                shared: Arc::clone(&shared),
                group: default_service_group(),
            });
            s0.submit(dest, None, msg);
        }
        s0.flush_all();
        s1.poll();
        s2.poll();
        s0.poll();
        assert_eq!(t.try_take().unwrap().unwrap(), 7);
    }

    #[test]
    fn select_all_failures_reports_all_requests_failed() {
        let registry = SmpRegistry::new(2).unwrap();
        let mut s0 = SmpShard::new(0, Arc::clone(&registry));
        let mut s1 = SmpShard::new(1, registry);

        let (t, c) = ticket::ticket::<u32>();
        let shared = Arc::new(SelectShared {
            remaining: AtomicUsize::new(1),
            completer: Mutex::new(Some(c)),
        });
        let msg = Box::new(SelectMessage {
            func: Some(|| Err::<u32, _>(Error::Runtime("down".into()))),
            result: None,
            shared,
            group: default_service_group(),
        });
        s0.submit(1, None, msg);
        s0.flush_all();
        s1.poll();
        s0.poll();
        assert!(matches!(t.try_take(), Some(Err(Error::AllRequestsFailed))));
    }

    #[test]
    fn alien_submit_runs_on_owner_drain() {
        let registry = SmpRegistry::new(1).unwrap();
        let mut s0 = SmpShard::new(0, Arc::clone(&registry));
        let alien = Alien { registry };
        let t = alien
            .submit_to_with_result(0, || Ok::<_, Error>(11u32))
            .unwrap();
        std::thread::spawn(move || drop(alien)).join().unwrap();
        s0.poll();
        assert_eq!(t.try_take().unwrap().unwrap(), 11);
    }

    #[test]
    fn alien_submit_to_dead_shard_fails() {
        let registry = SmpRegistry::new(1).unwrap();
        registry.mark_down(0);
        let alien = Alien { registry };
        assert!(matches!(
            alien.submit_to(0, || {}),
            Err(Error::RequestReceiverDown)
        ));
    }
}
