//! Allocation statistics.
//!
//! Shard threads account into plain per-heap counters (no atomics on the
//! fast path). Threads that are not shards ("aliens") account into a small
//! sharded table of atomics indexed by a hash of their thread id, so no
//! thread-local registration is needed and contention stays low.

use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of allocation counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AllocStats {
    /// Allocations served by the shard heap.
    pub allocs: u64,
    /// Frees handled by the shard heap (local or drained).
    pub frees: u64,
    /// Frees pushed to another shard's free stack.
    pub cross_shard_frees: u64,
    /// Frees drained from this shard's own cross-shard stack.
    pub cross_shard_frees_received: u64,
    /// Reclaimer passes triggered by page pressure.
    pub reclaims: u64,
    /// Allocations above the large-allocation warning threshold.
    pub large_allocs: u64,
    /// Allocations forwarded to the system allocator (alien threads).
    pub foreign_allocs: u64,
    /// Frees of system-allocator memory.
    pub foreign_frees: u64,
    /// Frees of runtime memory issued by alien threads.
    pub foreign_cross_frees: u64,
}

/// Per-heap counters, owner-thread only.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct LocalStats {
    pub(crate) allocs: u64,
    pub(crate) frees: u64,
    pub(crate) cross_shard_frees: u64,
    pub(crate) cross_shard_frees_received: u64,
    pub(crate) reclaims: u64,
    pub(crate) large_allocs: u64,
}

impl LocalStats {
    pub(crate) fn snapshot(self) -> AllocStats {
        AllocStats {
            allocs: self.allocs,
            frees: self.frees,
            cross_shard_frees: self.cross_shard_frees,
            cross_shard_frees_received: self.cross_shard_frees_received,
            reclaims: self.reclaims,
            large_allocs: self.large_allocs,
            ..AllocStats::default()
        }
    }
}

const ALIEN_TABLE_SIZE: usize = 64;

#[derive(Default)]
struct AlienSlot {
    foreign_allocs: AtomicU64,
    foreign_frees: AtomicU64,
    foreign_cross_frees: AtomicU64,
}

static ALIEN_STATS: [AlienSlot; ALIEN_TABLE_SIZE] = {
    #[allow(clippy::declare_interior_mutable_const)]
    const SLOT: AlienSlot = AlienSlot {
        foreign_allocs: AtomicU64::new(0),
        foreign_frees: AtomicU64::new(0),
        foreign_cross_frees: AtomicU64::new(0),
    };
    [SLOT; ALIEN_TABLE_SIZE]
};

fn alien_slot() -> &'static AlienSlot {
    let mut hasher = fxhash::FxHasher::default();
    std::thread::current().id().hash(&mut hasher);
    &ALIEN_STATS[hasher.finish() as usize % ALIEN_TABLE_SIZE]
}

pub(crate) fn note_foreign_alloc() {
    alien_slot().foreign_allocs.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn note_foreign_free() {
    alien_slot().foreign_frees.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn note_foreign_cross_free() {
    alien_slot()
        .foreign_cross_frees
        .fetch_add(1, Ordering::Relaxed);
}

/// Sums the alien table across all slots.
#[must_use]
pub fn alien_stats() -> AllocStats {
    let mut out = AllocStats::default();
    for slot in &ALIEN_STATS {
        out.foreign_allocs += slot.foreign_allocs.load(Ordering::Relaxed);
        out.foreign_frees += slot.foreign_frees.load(Ordering::Relaxed);
        out.foreign_cross_frees += slot.foreign_cross_frees.load(Ordering::Relaxed);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alien_accounting_is_visible_across_threads() {
        let before = alien_stats();
        std::thread::spawn(|| {
            note_foreign_alloc();
            note_foreign_alloc();
            note_foreign_free();
        })
        .join()
        .unwrap();
        let after = alien_stats();
        assert!(after.foreign_allocs >= before.foreign_allocs + 2);
        assert!(after.foreign_frees >= before.foreign_frees + 1);
    }
}
