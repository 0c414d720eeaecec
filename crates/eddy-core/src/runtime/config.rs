//! Runtime configuration.
//!
//! One struct carrying every boot knob, built through a builder and
//! validated before any thread spawns. Option resolution follows a fixed
//! precedence: an explicit value always wins, then `overprovisioned`
//! adjusts the polling defaults, then the library defaults apply.

use std::path::PathBuf;
use std::time::Duration;

use crate::mem::DiagnosticsKind;
use crate::reactor::ReactorConfig;
use crate::stall::StallConfig;
use crate::Error;

/// Boot configuration for a [`Runtime`](super::Runtime).
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Number of shards (`--smp`); default one per usable CPU.
    pub smp: Option<usize>,
    /// CPU restriction (`--cpuset`).
    pub cpuset: Option<Vec<usize>>,
    /// Total memory budget in bytes (`--memory`).
    pub memory: Option<u64>,
    /// Bytes withheld for the OS (`--reserve-memory`).
    pub reserve_memory: Option<u64>,
    /// Hugetlbfs mount backing shard memory (`--hugepages`).
    pub hugepages: Option<PathBuf>,
    /// Pin each shard thread to its CPU (`--thread-affinity`).
    pub thread_affinity: bool,
    /// Bind each shard's memory to its NUMA node (`--mbind`).
    pub mbind: bool,
    /// Relative memory weight of shard 0.
    pub shard0_mem_multiplier: f64,
    /// Scheduler quota (`--task-quota-ms`).
    pub task_quota: Duration,
    /// Backlog bound for deferred preemption (`--max-task-backlog`).
    pub max_task_backlog: usize,
    /// Idle polling window before sleep (`--idle-poll-time-us`); `None`
    /// resolves through `overprovisioned` to the library default.
    pub idle_poll_time: Option<Duration>,
    /// Never sleep (`--poll-mode`).
    pub poll_mode: bool,
    /// The machine is shared with other loads (`--overprovisioned`).
    pub overprovisioned: bool,
    /// Stall threshold (`--blocked-reactor-notify-ms`).
    pub blocked_reactor_notify: Duration,
    /// Stall report budget (`--blocked-reactor-reports-per-minute`).
    pub blocked_reactor_reports_per_minute: u32,
    /// Poll the kernel queue eagerly (`--poll-aio`); `None` resolves
    /// through `overprovisioned`.
    pub poll_aio: Option<bool>,
    /// Use `IOCB_FLAG_NOWAIT` submission (`--linux-aio-nowait`).
    pub linux_aio_nowait: bool,
    /// Ship fsync through the kernel queue (`--aio-fsync`).
    pub aio_fsync: bool,
    /// Route kernel-queue ops through the syscall pool anyway
    /// (`--force-aio-syscalls`).
    pub force_aio_syscalls: bool,
    /// Skip DMA alignment enforcement (`--relaxed-dma`).
    pub relaxed_dma: bool,
    /// Trust the device and elide fsync (`--unsafe-bypass-fsync`).
    pub unsafe_bypass_fsync: bool,
    /// Abort the process on allocation failure (`--abort-on-bad-alloc`).
    pub abort_on_bad_alloc: bool,
    /// Diagnostics dump policy
    /// (`--dump-memory-diagnostics-on-alloc-failure-kind`).
    pub dump_memory_diagnostics: DiagnosticsKind,
    /// Helper threads per shard for blocking syscalls.
    pub syscall_threads: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            smp: None,
            cpuset: None,
            memory: None,
            reserve_memory: None,
            hugepages: None,
            thread_affinity: true,
            mbind: false,
            shard0_mem_multiplier: 1.0,
            task_quota: Duration::from_micros(500),
            max_task_backlog: 1000,
            idle_poll_time: None,
            poll_mode: false,
            overprovisioned: false,
            blocked_reactor_notify: Duration::from_millis(25),
            blocked_reactor_reports_per_minute: 5,
            poll_aio: None,
            linux_aio_nowait: true,
            aio_fsync: false,
            force_aio_syscalls: false,
            relaxed_dma: false,
            unsafe_bypass_fsync: false,
            abort_on_bad_alloc: false,
            dump_memory_diagnostics: DiagnosticsKind::None,
            syscall_threads: 1,
        }
    }
}

impl RuntimeConfig {
    /// Starts a builder.
    #[must_use]
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder {
            config: Self::default(),
        }
    }

    /// Checks the configuration for contradictions.
    ///
    /// # Errors
    ///
    /// `Error::BadConfig` naming the offending knob.
    pub fn validate(&self) -> Result<(), Error> {
        if self.smp == Some(0) {
            return Err(Error::BadConfig("smp must be greater than 0".into()));
        }
        if let Some(smp) = self.smp {
            if smp > crate::mem::MAX_SHARDS {
                return Err(Error::BadConfig(format!(
                    "smp ({smp}) exceeds the shard limit of {}",
                    crate::mem::MAX_SHARDS
                )));
            }
        }
        if let Some(cpuset) = &self.cpuset {
            if cpuset.is_empty() {
                return Err(Error::BadConfig("cpuset must not be empty".into()));
            }
        }
        if self.shard0_mem_multiplier <= 0.0 {
            return Err(Error::BadConfig(
                "shard0 memory multiplier must be positive".into(),
            ));
        }
        if let (Some(mem), Some(reserve)) = (self.memory, self.reserve_memory) {
            if reserve >= mem {
                return Err(Error::BadConfig(format!(
                    "reserve-memory ({reserve}) must be below memory ({mem})"
                )));
            }
        }
        if self.task_quota.is_zero() {
            return Err(Error::BadConfig("task-quota must be non-zero".into()));
        }
        if self.poll_mode && self.overprovisioned {
            return Err(Error::BadConfig(
                "poll-mode and overprovisioned are mutually exclusive".into(),
            ));
        }
        Ok(())
    }

    /// Idle-poll window after precedence resolution: explicit value, then
    /// `overprovisioned` (yield immediately), then the library default.
    #[must_use]
    pub fn resolved_idle_poll_time(&self) -> Duration {
        if let Some(explicit) = self.idle_poll_time {
            return explicit;
        }
        if self.overprovisioned {
            return Duration::ZERO;
        }
        Duration::from_micros(200)
    }

    /// Kernel-queue polling after precedence resolution.
    #[must_use]
    pub fn resolved_poll_aio(&self) -> bool {
        if let Some(explicit) = self.poll_aio {
            return explicit;
        }
        !self.overprovisioned
    }

    pub(crate) fn reactor_config(&self) -> ReactorConfig {
        ReactorConfig {
            task_quota: self.task_quota,
            max_task_backlog: self.max_task_backlog,
            idle_poll_time: self.resolved_idle_poll_time(),
            poll_mode: self.poll_mode,
            stall: StallConfig {
                threshold: self.blocked_reactor_notify,
                reports_per_minute: self.blocked_reactor_reports_per_minute,
            },
            syscall_threads: self.syscall_threads,
            force_syscall_io: self.force_aio_syscalls || !self.resolved_poll_aio(),
        }
    }
}

/// Fluent builder for [`RuntimeConfig`].
#[derive(Debug, Clone)]
pub struct RuntimeConfigBuilder {
    config: RuntimeConfig,
}

impl RuntimeConfigBuilder {
    /// Sets the shard count.
    #[must_use]
    pub fn smp(mut self, shards: usize) -> Self {
        self.config.smp = Some(shards);
        self
    }

    /// Restricts shards to these CPUs.
    #[must_use]
    pub fn cpuset(mut self, cpus: Vec<usize>) -> Self {
        self.config.cpuset = Some(cpus);
        self
    }

    /// Sets the total memory budget in bytes.
    #[must_use]
    pub fn memory(mut self, bytes: u64) -> Self {
        self.config.memory = Some(bytes);
        self
    }

    /// Sets the OS memory reserve in bytes.
    #[must_use]
    pub fn reserve_memory(mut self, bytes: u64) -> Self {
        self.config.reserve_memory = Some(bytes);
        self
    }

    /// Backs shard memory with this hugetlbfs mount.
    #[must_use]
    pub fn hugepages(mut self, path: PathBuf) -> Self {
        self.config.hugepages = Some(path);
        self
    }

    /// Enables or disables CPU pinning.
    #[must_use]
    pub fn thread_affinity(mut self, pin: bool) -> Self {
        self.config.thread_affinity = pin;
        self
    }

    /// Enables NUMA binding of shard memory.
    #[must_use]
    pub fn mbind(mut self, bind: bool) -> Self {
        self.config.mbind = bind;
        self
    }

    /// Sets shard 0's relative memory weight.
    #[must_use]
    pub fn shard0_mem_multiplier(mut self, multiplier: f64) -> Self {
        self.config.shard0_mem_multiplier = multiplier;
        self
    }

    /// Sets the scheduler task quota.
    #[must_use]
    pub fn task_quota(mut self, quota: Duration) -> Self {
        self.config.task_quota = quota;
        self
    }

    /// Sets the preemption backlog bound.
    #[must_use]
    pub fn max_task_backlog(mut self, backlog: usize) -> Self {
        self.config.max_task_backlog = backlog;
        self
    }

    /// Sets the idle polling window explicitly.
    #[must_use]
    pub fn idle_poll_time(mut self, window: Duration) -> Self {
        self.config.idle_poll_time = Some(window);
        self
    }

    /// Never sleep.
    #[must_use]
    pub fn poll_mode(mut self, on: bool) -> Self {
        self.config.poll_mode = on;
        self
    }

    /// Declares the machine shared with other loads.
    #[must_use]
    pub fn overprovisioned(mut self, on: bool) -> Self {
        self.config.overprovisioned = on;
        self
    }

    /// Sets the stall detector threshold.
    #[must_use]
    pub fn blocked_reactor_notify(mut self, threshold: Duration) -> Self {
        self.config.blocked_reactor_notify = threshold;
        self
    }

    /// Sets the stall report budget per minute.
    #[must_use]
    pub fn blocked_reactor_reports_per_minute(mut self, reports: u32) -> Self {
        self.config.blocked_reactor_reports_per_minute = reports;
        self
    }

    /// Polls the kernel I/O queue eagerly (explicitly, overriding the
    /// `overprovisioned` resolution).
    #[must_use]
    pub fn poll_aio(mut self, poll: bool) -> Self {
        self.config.poll_aio = Some(poll);
        self
    }

    /// Uses nowait kernel submission.
    #[must_use]
    pub fn linux_aio_nowait(mut self, nowait: bool) -> Self {
        self.config.linux_aio_nowait = nowait;
        self
    }

    /// Ships fsync through the kernel queue.
    #[must_use]
    pub fn aio_fsync(mut self, fsync: bool) -> Self {
        self.config.aio_fsync = fsync;
        self
    }

    /// Routes kernel-queue I/O through the syscall pool regardless of ring
    /// availability.
    #[must_use]
    pub fn force_aio_syscalls(mut self, force: bool) -> Self {
        self.config.force_aio_syscalls = force;
        self
    }

    /// Skips DMA alignment enforcement.
    #[must_use]
    pub fn relaxed_dma(mut self, relaxed: bool) -> Self {
        self.config.relaxed_dma = relaxed;
        self
    }

    /// Trusts the device and elides fsync.
    #[must_use]
    pub fn unsafe_bypass_fsync(mut self, bypass: bool) -> Self {
        self.config.unsafe_bypass_fsync = bypass;
        self
    }

    /// Sets the helper thread count for blocking syscalls.
    #[must_use]
    pub fn syscall_threads(mut self, threads: usize) -> Self {
        self.config.syscall_threads = threads;
        self
    }

    /// Aborts the process on allocation failure.
    #[must_use]
    pub fn abort_on_bad_alloc(mut self, abort: bool) -> Self {
        self.config.abort_on_bad_alloc = abort;
        self
    }

    /// Selects the allocation-failure diagnostics policy.
    #[must_use]
    pub fn dump_memory_diagnostics(mut self, kind: DiagnosticsKind) -> Self {
        self.config.dump_memory_diagnostics = kind;
        self
    }

    /// Finishes and validates the configuration.
    ///
    /// # Errors
    ///
    /// `Error::BadConfig` when validation fails.
    pub fn build(self) -> Result<RuntimeConfig, Error> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(RuntimeConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_smp_is_rejected() {
        let err = RuntimeConfig::builder().smp(0).build().unwrap_err();
        assert!(matches!(err, Error::BadConfig(_)));
    }

    #[test]
    fn smp_above_the_shard_limit_is_rejected_upfront() {
        let err = RuntimeConfig::builder()
            .smp(crate::mem::MAX_SHARDS + 1)
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::BadConfig(_)));
        // The limit itself is still a valid request.
        assert!(RuntimeConfig::builder()
            .smp(crate::mem::MAX_SHARDS)
            .build()
            .is_ok());
    }

    #[test]
    fn builder_reaches_every_io_and_placement_knob() {
        let cfg = RuntimeConfig::builder()
            .shard0_mem_multiplier(2.5)
            .poll_aio(false)
            .linux_aio_nowait(false)
            .aio_fsync(true)
            .force_aio_syscalls(true)
            .relaxed_dma(true)
            .unsafe_bypass_fsync(true)
            .syscall_threads(3)
            .build()
            .unwrap();
        assert!((cfg.shard0_mem_multiplier - 2.5).abs() < f64::EPSILON);
        assert_eq!(cfg.poll_aio, Some(false));
        assert!(!cfg.resolved_poll_aio());
        assert!(!cfg.linux_aio_nowait);
        assert!(cfg.aio_fsync);
        assert!(cfg.force_aio_syscalls);
        assert!(cfg.relaxed_dma);
        assert!(cfg.unsafe_bypass_fsync);
        assert_eq!(cfg.syscall_threads, 3);
        // Forced syscalls propagate into the reactor's I/O choice.
        assert!(cfg.reactor_config().force_syscall_io);
    }

    #[test]
    fn reserve_must_be_below_memory() {
        let err = RuntimeConfig::builder()
            .memory(1 << 30)
            .reserve_memory(1 << 30)
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::BadConfig(_)));
    }

    #[test]
    fn empty_cpuset_is_rejected() {
        let err = RuntimeConfig::builder().cpuset(vec![]).build().unwrap_err();
        assert!(matches!(err, Error::BadConfig(_)));
    }

    #[test]
    fn explicit_idle_poll_beats_overprovisioned() {
        let cfg = RuntimeConfig::builder()
            .overprovisioned(true)
            .idle_poll_time(Duration::from_micros(777))
            .build()
            .unwrap();
        assert_eq!(cfg.resolved_idle_poll_time(), Duration::from_micros(777));
    }

    #[test]
    fn overprovisioned_beats_library_default() {
        let cfg = RuntimeConfig::builder().overprovisioned(true).build().unwrap();
        assert_eq!(cfg.resolved_idle_poll_time(), Duration::ZERO);
        assert!(!cfg.resolved_poll_aio());
    }

    #[test]
    fn library_defaults_apply_last() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.resolved_idle_poll_time(), Duration::from_micros(200));
        assert!(cfg.resolved_poll_aio());
    }

    #[test]
    fn poll_mode_conflicts_with_overprovisioned() {
        let err = RuntimeConfig::builder()
            .poll_mode(true)
            .overprovisioned(true)
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::BadConfig(_)));
    }
}
