//! # Cooperative scheduling primitives
//!
//! Tasks and weighted-fair task queues. The reactor composes these into the
//! per-shard scheduling loop; nothing here touches OS state.

mod queue;
mod task;

pub use queue::{QueueValue, TaskQueue};
pub use task::{make_fallible_task, make_task, Task};

/// Queue id of the default ("main") queue every reactor creates at boot.
pub const MAIN_QUEUE: usize = 0;

/// Queue id of the at-exit queue, run while the reactor drains on shutdown.
pub const AT_EXIT_QUEUE: usize = 1;

use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide allocator for per-queue value keys, so collaborators on
/// different shards agree on slot ids without coordination.
static NEXT_QUEUE_VALUE_KEY: AtomicU64 = AtomicU64::new(0);

/// Allocates a fresh per-queue value key.
#[must_use]
pub fn new_queue_value_key() -> u64 {
    NEXT_QUEUE_VALUE_KEY.fetch_add(1, Ordering::Relaxed)
}
