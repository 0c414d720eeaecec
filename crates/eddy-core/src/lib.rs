//! # Eddy Core
//!
//! A share-nothing, shard-per-core execution engine: one pinned OS thread
//! per shard, each owning its memory, its task queues, its timers, and its
//! reactor loop. Shards communicate exclusively through bounded lock-free
//! queues; nothing is shared mutably.
//!
//! This crate provides:
//! - **`mem`**: per-shard buddy+slab allocator with cross-shard frees
//! - **`reactor`**: weighted-fair cooperative scheduler and event loop
//! - **`timer`**: steady, low-resolution, and manual timer wheels
//! - **`smp`**: SPSC cross-shard message fabric with admission control
//! - **`stall`**: per-shard watchdog for blocked reactors
//! - **`resource`** / **`runtime`**: CPU and memory discovery, shard boot
//!
//! ## Design Principles
//!
//! 1. **No locks on the fast path** - SPSC rings, intrusive free lists
//! 2. **Cooperative scheduling** - preemption only between tasks
//! 3. **Owner-computes** - any pointer names its owning shard in its bits
//! 4. **Blocking work leaves the reactor** - syscall pool + eventfd wake
//!
//! ## Example
//!
//! ```rust,ignore
//! use eddy_core::{Runtime, RuntimeConfig};
//!
//! let rt = Runtime::start(RuntimeConfig::builder().smp(4).build()?)?;
//! let answer = rt.run_on(2, || Ok(21 * 2))?;
//! rt.stop()?;
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
// The allocator, SPSC rings, and region mapping are unavoidably unsafe.
#![allow(unsafe_code)]

pub mod io;
pub mod mem;
pub mod reactor;
pub mod resource;
pub mod runtime;
pub mod sched;
pub mod smp;
pub mod stall;
pub mod timer;

pub use runtime::{Runtime, RuntimeConfig, RuntimeConfigBuilder};

/// Result type for eddy-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error kinds surfaced by the runtime.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Out of memory after reclaim.
    #[error(transparent)]
    AllocationFailed(#[from] mem::MemError),

    /// Cross-shard admission was not granted before the deadline.
    #[error("cross-shard admission not granted in time")]
    QueueTimeout,

    /// A shut-down handle was used by a reader or writer.
    #[error("connection aborted")]
    ConnectionAborted,

    /// The kernel returned a negative code on an I/O completion.
    #[error("i/o error (os error {code})")]
    Io {
        /// The positive errno value.
        code: i32,
    },

    /// The message destination no longer exists.
    #[error("request receiver is down")]
    RequestReceiverDown,

    /// Every attempt of a fan-out submission failed.
    #[error("all requests failed")]
    AllRequestsFailed,

    /// An uncaught panic during task execution, converted at the task
    /// boundary.
    #[error("runtime error: {0}")]
    Runtime(String),

    /// Boot-time configuration was rejected.
    #[error("bad configuration: {0}")]
    BadConfig(String),
}

/// Extracts a printable message from a caught panic payload.
pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_matches_kind() {
        assert_eq!(Error::QueueTimeout.to_string(), "cross-shard admission not granted in time");
        assert_eq!(Error::Io { code: 5 }.to_string(), "i/o error (os error 5)");
        assert_eq!(
            Error::BadConfig("smp must be > 0".into()).to_string(),
            "bad configuration: smp must be > 0"
        );
    }

    #[test]
    fn panic_message_extracts_strings() {
        let p: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(p.as_ref()), "boom");
        let p: Box<dyn std::any::Any + Send> = Box::new(String::from("kapow"));
        assert_eq!(panic_message(p.as_ref()), "kapow");
        let p: Box<dyn std::any::Any + Send> = Box::new(17u32);
        assert_eq!(panic_message(p.as_ref()), "non-string panic payload");
    }
}
