//! Eddy runtime launcher.
//!
//! Boots the shard-per-core runtime with the standard tuning flags, runs a
//! short cross-shard smoke workload, and shuts down. Exit code 0 on clean
//! shutdown, 1 on startup failure.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use eddy_core::mem::DiagnosticsKind;
use eddy_core::resource::parse_cpuset;
use eddy_core::{reactor, smp, Runtime, RuntimeConfig};

/// Eddy - share-nothing shard-per-core runtime
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[allow(clippy::struct_excessive_bools)]
struct Args {
    /// Number of shards (default: one per usable CPU)
    #[arg(long)]
    smp: Option<usize>,

    /// CPU-set restriction, e.g. "0-3,7"
    #[arg(long)]
    cpuset: Option<String>,

    /// Total memory budget in bytes
    #[arg(long)]
    memory: Option<u64>,

    /// Bytes withheld for the OS
    #[arg(long)]
    reserve_memory: Option<u64>,

    /// Hugetlbfs mount to back shard memory
    #[arg(long)]
    hugepages: Option<PathBuf>,

    /// Pin shard threads to their CPUs (0|1)
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u8).range(0..=1))]
    thread_affinity: u8,

    /// Bind shard memory to its NUMA node (0|1)
    #[arg(long, default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=1))]
    mbind: u8,

    /// Scheduler task quota in milliseconds
    #[arg(long, default_value_t = 0.5)]
    task_quota_ms: f64,

    /// Queue backlog above which preemption is deferred
    #[arg(long, default_value_t = 1000)]
    max_task_backlog: usize,

    /// Idle polling window in microseconds before a shard may sleep
    #[arg(long)]
    idle_poll_time_us: Option<u64>,

    /// Never sleep; poll continuously
    #[arg(long, default_value_t = false)]
    poll_mode: bool,

    /// The machine is shared with other loads
    #[arg(long, default_value_t = false)]
    overprovisioned: bool,

    /// Stall detector threshold in milliseconds
    #[arg(long, default_value_t = 25)]
    blocked_reactor_notify_ms: u64,

    /// Stall reports allowed per minute
    #[arg(long, default_value_t = 5)]
    blocked_reactor_reports_per_minute: u32,

    /// Poll the kernel I/O queue eagerly (0|1)
    #[arg(long, value_parser = clap::value_parser!(u8).range(0..=1))]
    poll_aio: Option<u8>,

    /// Use nowait kernel submission (0|1)
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u8).range(0..=1))]
    linux_aio_nowait: u8,

    /// Ship fsync through the kernel queue (0|1)
    #[arg(long, default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=1))]
    aio_fsync: u8,

    /// Route kernel-queue ops through the syscall pool (0|1)
    #[arg(long, default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=1))]
    force_aio_syscalls: u8,

    /// Skip DMA alignment enforcement
    #[arg(long, default_value_t = false)]
    relaxed_dma: bool,

    /// Trust the device and elide fsync
    #[arg(long, default_value_t = false)]
    unsafe_bypass_fsync: bool,

    /// Abort the process when an allocation fails
    #[arg(long, default_value_t = false)]
    abort_on_bad_alloc: bool,

    /// When to dump memory diagnostics on allocation failure
    #[arg(long, default_value = "none", value_parser = parse_diagnostics)]
    dump_memory_diagnostics_on_alloc_failure_kind: DiagnosticsKind,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn parse_diagnostics(s: &str) -> Result<DiagnosticsKind, String> {
    s.parse()
}

fn build_config(args: &Args) -> Result<RuntimeConfig> {
    let mut config = RuntimeConfig {
        smp: args.smp,
        memory: args.memory,
        reserve_memory: args.reserve_memory,
        hugepages: args.hugepages.clone(),
        thread_affinity: args.thread_affinity == 1,
        mbind: args.mbind == 1,
        task_quota: Duration::from_secs_f64(args.task_quota_ms / 1000.0),
        max_task_backlog: args.max_task_backlog,
        idle_poll_time: args.idle_poll_time_us.map(Duration::from_micros),
        poll_mode: args.poll_mode,
        overprovisioned: args.overprovisioned,
        blocked_reactor_notify: Duration::from_millis(args.blocked_reactor_notify_ms),
        blocked_reactor_reports_per_minute: args.blocked_reactor_reports_per_minute,
        poll_aio: args.poll_aio.map(|v| v == 1),
        linux_aio_nowait: args.linux_aio_nowait == 1,
        aio_fsync: args.aio_fsync == 1,
        force_aio_syscalls: args.force_aio_syscalls == 1,
        relaxed_dma: args.relaxed_dma,
        unsafe_bypass_fsync: args.unsafe_bypass_fsync,
        abort_on_bad_alloc: args.abort_on_bad_alloc,
        dump_memory_diagnostics: args.dump_memory_diagnostics_on_alloc_failure_kind,
        ..RuntimeConfig::default()
    };
    if let Some(cpuset) = &args.cpuset {
        config.cpuset = Some(parse_cpuset(cpuset)?);
    }
    config.validate()?;
    Ok(config)
}

/// Cross-shard smoke workload: every shard pings its right neighbor.
fn smoke(rt: &Runtime) -> Result<()> {
    let shards = rt.shards();
    for from in 0..shards {
        let to = (from + 1) % shards;
        if to == from {
            continue;
        }
        // Submit from `from`, hand the ticket back out, and wait here; the
        // shard keeps polling and resolves it when the response lands.
        let answer = rt.run_on(from, Duration::from_secs(10), move || {
            Ok(smp::submit_to(to, move || Ok(to * 10)))
        })?;
        let got = answer
            .wait_blocking(Duration::from_secs(10))
            .ok_or_else(|| anyhow::anyhow!("ping to shard {to} timed out"))??;
        anyhow::ensure!(got == to * 10, "shard {to} answered {got}");
        info!(from, to, "ping-pong ok");
    }
    let processed = rt.run_on(0, Duration::from_secs(10), || Ok(reactor::tasks_processed()))?;
    info!(tasks = processed, "smoke workload done");
    Ok(())
}

fn main() {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("eddy={}", args.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("starting eddy runtime");
    let config = match build_config(&args) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("bad configuration: {e}");
            std::process::exit(1);
        }
    };

    let rt = match Runtime::start(config) {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!("startup failed: {e}");
            std::process::exit(1);
        }
    };
    info!(shards = rt.shards(), "runtime up");

    if let Err(e) = smoke(&rt) {
        tracing::error!("smoke workload failed: {e}");
        let _ = rt.stop();
        std::process::exit(1);
    }

    match rt.stop() {
        Ok(()) => info!("clean shutdown"),
        Err(e) => {
            tracing::error!("shutdown failed: {e}");
            std::process::exit(1);
        }
    }
}
