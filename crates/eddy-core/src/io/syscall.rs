//! Per-shard syscall thread pool.
//!
//! Reactor threads never make blocking syscalls; anything that might block
//! is shipped to a small helper pool and comes back as a completion closure
//! on a lock-free queue, with an eventfd poke so a sleeping reactor wakes.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::smp::{new_ticket, AlienQueue, Ticket};
use crate::Error;

type Job = Box<dyn FnOnce() + Send>;

/// Helper threads executing blocking work off the reactor.
pub(crate) struct SyscallPool {
    tx: Option<mpsc::Sender<Job>>,
    completions: Arc<AlienQueue>,
    wake: Arc<dyn Fn() + Send + Sync>,
    workers: Vec<JoinHandle<()>>,
}

impl SyscallPool {
    pub(crate) fn new(
        shard: usize,
        threads: usize,
        wake: Arc<dyn Fn() + Send + Sync>,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<Job>();
        let rx = Arc::new(Mutex::new(rx));
        let workers = (0..threads.max(1))
            .map(|i| {
                let rx = Arc::clone(&rx);
                std::thread::Builder::new()
                    .name(format!("eddy-syscall-{shard}-{i}"))
                    .spawn(move || loop {
                        let job = {
                            let rx = rx.lock().expect("syscall rx poisoned");
                            rx.recv()
                        };
                        match job {
                            Ok(job) => job(),
                            Err(_) => return, // pool dropped
                        }
                    })
                    .expect("spawn syscall worker")
            })
            .collect();
        Self {
            tx: Some(tx),
            completions: Arc::new(AlienQueue::new()),
            wake,
            workers,
        }
    }

    /// Ships `f` to a helper thread; the ticket resolves after the shard's
    /// completion poller runs.
    pub(crate) fn submit<T, F>(&self, f: F) -> Ticket<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, Error> + Send + 'static,
    {
        let (ticket, completer) = new_ticket();
        let completions = Arc::clone(&self.completions);
        let wake = Arc::clone(&self.wake);
        let job: Job = Box::new(move || {
            let result = match catch_unwind(AssertUnwindSafe(f)) {
                Ok(r) => r,
                Err(panic) => Err(Error::Runtime(crate::panic_message(&panic))),
            };
            completions.push(Box::new(move || completer.complete(result)));
            wake();
        });
        self.tx
            .as_ref()
            .expect("syscall pool already shut down")
            .send(job)
            .expect("syscall workers gone");
        ticket
    }

    /// Runs completion closures queued by the workers. Shard thread only.
    pub(crate) fn poll_completions(&self) -> bool {
        let batch = self.completions.drain();
        if batch.is_empty() {
            return false;
        }
        for completion in batch {
            completion();
        }
        true
    }

    pub(crate) fn pure_poll(&self) -> bool {
        !self.completions.is_empty()
    }
}

impl Drop for SyscallPool {
    fn drop(&mut self) {
        drop(self.tx.take()); // disconnect: workers drain and exit
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        // Late completions still resolve their tickets.
        self.poll_completions();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn pool() -> (SyscallPool, Arc<AtomicUsize>) {
        let wakes = Arc::new(AtomicUsize::new(0));
        let w = Arc::clone(&wakes);
        let pool = SyscallPool::new(0, 1, Arc::new(move || {
            w.fetch_add(1, Ordering::Relaxed);
        }));
        (pool, wakes)
    }

    #[test]
    fn blocking_work_resolves_through_poller() {
        let (pool, wakes) = pool();
        let t = pool.submit(|| {
            std::thread::sleep(Duration::from_millis(5));
            Ok::<_, Error>(123u32)
        });
        // Wait for the worker, then drain completions like the reactor.
        let mut spins = 0;
        while !pool.pure_poll() {
            std::thread::sleep(Duration::from_millis(1));
            spins += 1;
            assert!(spins < 1000, "completion never arrived");
        }
        assert!(pool.poll_completions());
        assert_eq!(t.try_take().unwrap().unwrap(), 123);
        assert!(wakes.load(Ordering::Relaxed) >= 1);
    }

    #[test]
    fn worker_panic_becomes_runtime_error() {
        let (pool, _) = pool();
        let t = pool.submit::<u32, _>(|| panic!("syscall worker blew up"));
        let mut spins = 0;
        while !pool.pure_poll() {
            std::thread::sleep(Duration::from_millis(1));
            spins += 1;
            assert!(spins < 1000);
        }
        pool.poll_completions();
        assert!(matches!(t.try_take(), Some(Err(Error::Runtime(_)))));
    }

    #[test]
    fn drop_flushes_outstanding_completions() {
        let (pool, _) = pool();
        let t = pool.submit(|| Ok::<_, Error>(7u8));
        drop(pool);
        assert_eq!(t.try_take().unwrap().unwrap(), 7);
    }
}
