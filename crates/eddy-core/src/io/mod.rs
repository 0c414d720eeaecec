//! # I/O plumbing
//!
//! The reactor's I/O collaborators: a per-shard sink staging requests into
//! per-device fair queues, the kernel ring behind it (Linux `io-uring`
//! feature; the syscall pool otherwise), and the helper pool blocking
//! syscalls run on so the reactor thread never blocks.
//!
//! Payloads are opaque bytes; nothing here knows about protocols.

#[cfg(all(target_os = "linux", feature = "io-uring"))]
mod ring;
mod sink;
mod syscall;

#[cfg(all(target_os = "linux", feature = "io-uring"))]
pub use ring::RingConfig;
pub use sink::{DeviceId, IoOutcome};

#[cfg(all(target_os = "linux", feature = "io-uring"))]
pub(crate) use ring::KernelRing;
pub(crate) use sink::{poll_relays, IoSink};
pub(crate) use syscall::SyscallPool;
