//! # Runtime boot and teardown
//!
//! Turns a [`RuntimeConfig`] into running shards: discovers the CPU and
//! memory layout, spawns one pinned thread per shard, installs the shard
//! heap before the reactor exists, builds the cross-shard queue fabric, and
//! releases all shards through a boot barrier. Shutdown reverses it: shard
//! 0 runs `stop()`, every shard drains and leaves its loop, the threads
//! join.

mod config;

pub use config::{RuntimeConfig, RuntimeConfigBuilder};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::reactor::Reactor;
use crate::smp::{Alien, SmpRegistry};
use crate::{mem, reactor, resource, Error};

/// A running set of shards.
pub struct Runtime {
    registry: Arc<SmpRegistry>,
    handles: Vec<JoinHandle<()>>,
    shards: usize,
    stopped: bool,
}

impl Runtime {
    /// Boots the runtime: one pinned shard thread per layout slot.
    ///
    /// # Errors
    ///
    /// `bad_config` for rejected configuration or impossible layouts, and
    /// any shard-boot failure (memory mapping, thread spawn).
    pub fn start(config: RuntimeConfig) -> Result<Self, Error> {
        config.validate()?;
        mem::set_abort_on_allocation_failure(config.abort_on_bad_alloc);
        mem::set_dump_diagnostics_kind(config.dump_memory_diagnostics);

        let request = resource::ResourceRequest {
            shards: config.smp,
            cpuset: config.cpuset.clone(),
            memory: config.memory,
            reserve_memory: config.reserve_memory,
            shard0_mem_multiplier: config.shard0_mem_multiplier,
        };
        let layouts = resource::compute_layout(&request)
            .map_err(|e| Error::BadConfig(e.to_string()))?;
        let n = layouts.len();

        let registry = SmpRegistry::new(n)
            .map_err(|e| Error::BadConfig(format!("cannot create queue fabric: {e}")))?;
        // Caller participates in the boot barrier so `start` returns only
        // once every shard has its heap, reactor, and queues in place.
        let barrier = Arc::new(Barrier::new(n + 1));
        let boot_errors: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        // Heaps are installed in shard order so shard ids and heap regions
        // line up deterministically.
        let heap_turn = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::with_capacity(n);
        for (sid, layout) in layouts.iter().copied().enumerate() {
            let config = config.clone();
            let registry = Arc::clone(&registry);
            let barrier = Arc::clone(&barrier);
            let boot_errors = Arc::clone(&boot_errors);
            let heap_turn = Arc::clone(&heap_turn);
            let handle = std::thread::Builder::new()
                .name(format!("eddy-shard-{sid}"))
                .spawn(move || {
                    shard_main(
                        sid,
                        layout,
                        &config,
                        registry,
                        &barrier,
                        &boot_errors,
                        &heap_turn,
                    );
                })
                .map_err(|e| Error::BadConfig(format!("cannot spawn shard {sid}: {e}")))?;
            handles.push(handle);
        }

        barrier.wait();
        let errors = boot_errors.lock().expect("boot errors poisoned");
        if !errors.is_empty() {
            drop(errors);
            // Failed boot: shards that did come up are told to stop.
            let rt = Self {
                registry,
                handles,
                shards: n,
                stopped: false,
            };
            let detail = {
                let errors = rt_boot_errors(&boot_errors);
                errors.join("; ")
            };
            let _ = rt.stop();
            return Err(Error::BadConfig(format!("shard boot failed: {detail}")));
        }
        drop(errors);

        tracing::info!(shards = n, "runtime started");
        Ok(Self {
            registry,
            handles,
            shards: n,
            stopped: false,
        })
    }

    /// Number of running shards.
    #[must_use]
    pub fn shards(&self) -> usize {
        self.shards
    }

    /// Handle for threads outside the runtime to inject work.
    #[must_use]
    pub fn alien(&self) -> Alien {
        Alien {
            registry: Arc::clone(&self.registry),
        }
    }

    /// Runs `f` on shard `shard` and waits for its result. For callers
    /// outside the runtime; shard code uses `smp::submit_to`.
    ///
    /// # Errors
    ///
    /// `request_receiver_down` when the shard is gone, `queue_timeout` when
    /// no result arrives within `timeout`, and whatever `f` returns.
    pub fn run_on<T, F>(&self, shard: usize, timeout: Duration, f: F) -> Result<T, Error>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, Error> + Send + 'static,
    {
        let ticket = self.alien().submit_to_with_result(shard, f)?;
        ticket.wait_blocking(timeout).ok_or(Error::QueueTimeout)?
    }

    /// Stops every shard and joins their threads. Exit code contract: a
    /// clean return here maps to process exit 0.
    ///
    /// # Errors
    ///
    /// `runtime_error` when a shard thread panicked.
    pub fn stop(mut self) -> Result<(), Error> {
        self.stop_inner()
    }

    fn stop_inner(&mut self) -> Result<(), Error> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;
        // stop() must run on shard 0; route it through the alien queue.
        if self.alien().submit_to(0, reactor::stop).is_err() {
            // Shard 0 never came up (failed boot): stop survivors directly.
            for shard in 1..self.shards {
                let _ = self.alien().submit_to(shard, reactor::stop_local);
            }
        }
        let mut panicked = false;
        for handle in self.handles.drain(..) {
            panicked |= handle.join().is_err();
        }
        for shard in 0..self.shards {
            self.registry.mark_down(shard);
        }
        tracing::info!("runtime stopped");
        if panicked {
            return Err(Error::Runtime("a shard thread panicked".into()));
        }
        Ok(())
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        let _ = self.stop_inner();
    }
}

fn rt_boot_errors(errors: &Arc<Mutex<Vec<String>>>) -> Vec<String> {
    errors.lock().map(|e| e.clone()).unwrap_or_default()
}

#[allow(clippy::too_many_arguments)]
fn shard_main(
    sid: usize,
    layout: resource::ShardLayout,
    config: &RuntimeConfig,
    registry: Arc<SmpRegistry>,
    barrier: &Barrier,
    boot_errors: &Mutex<Vec<String>>,
    heap_turn: &AtomicUsize,
) {
    if config.thread_affinity {
        if let Err(e) = pin_to_cpu(layout.cpu) {
            tracing::warn!(shard = sid, cpu = layout.cpu, "cpu pinning failed: {e}");
        }
    }

    while heap_turn.load(Ordering::Acquire) != sid {
        std::thread::yield_now();
    }
    let heap = mem::configure_shard(&mem::ShardMemConfig {
        bytes: layout.memory,
        hugepages: config.hugepages.as_deref(),
        numa_node: config.mbind.then_some(layout.numa_node),
    });
    heap_turn.store(sid + 1, Ordering::Release);

    let mem_shard = match heap {
        Ok(id) => id,
        Err(e) => {
            boot_errors
                .lock()
                .expect("boot errors poisoned")
                .push(format!("shard {sid}: {e}"));
            registry.mark_down(sid);
            barrier.wait();
            return;
        }
    };

    let reactor = Reactor::new(sid, config.reactor_config(), registry.clone());
    barrier.wait();

    let reactor = reactor::run(reactor);
    drop(reactor);
    registry.mark_down(sid);
    mem::mark_shard_down(mem_shard);
    tracing::debug!(shard = sid, "shard thread exiting");
}

fn pin_to_cpu(cpu: usize) -> Result<(), std::io::Error> {
    #[cfg(target_os = "linux")]
    {
        // SAFETY: cpu_set_t is zero-initialized, CPU_SET stays in bounds,
        // and pid 0 targets the calling thread.
        unsafe {
            let mut set: libc::cpu_set_t = std::mem::zeroed();
            libc::CPU_ZERO(&mut set);
            libc::CPU_SET(cpu, &mut set);
            if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
                return Err(std::io::Error::last_os_error());
            }
        }
        Ok(())
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = cpu;
        Ok(())
    }
}
