//! Memory diagnostics dump.
//!
//! Produces the table printed on allocation failure (when enabled) and on
//! demand: totals, per-pool usage, and a histogram of free spans.

use std::fmt::Write as _;

use super::heap::NR_SPAN_LISTS;
use super::pool::NR_SMALL_POOLS;
use super::PAGE_SIZE;

/// Which allocation failures dump the diagnostics table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DiagnosticsKind {
    /// Never dump.
    None = 0,
    /// Dump only for failures inside a critical allocation section.
    Critical = 1,
    /// Dump for every failed allocation.
    All = 2,
}

impl std::str::FromStr for DiagnosticsKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "critical" => Ok(Self::Critical),
            "all" => Ok(Self::All),
            other => Err(format!(
                "unknown diagnostics kind {other:?} (expected none|critical|all)"
            )),
        }
    }
}

/// Renders the memory diagnostics table for the calling shard.
#[must_use]
pub fn memory_diagnostics_report() -> String {
    super::with_local_heap(|heap| {
        let mut out = String::with_capacity(4096);
        let total_pages = heap.nr_pages;
        let _ = writeln!(
            out,
            "shard {} memory: {} MiB mapped, {} free pages, {} min free pages",
            heap.shard_id,
            total_pages as usize * PAGE_SIZE >> 20,
            heap.nr_free_pages,
            heap.min_free_pages,
        );

        let _ = writeln!(
            out,
            "{:>10} {:>6} {:>6} {:>12} {:>12}",
            "objsz", "sppref", "spfall", "free_objs", "pages_in_use"
        );
        for idx in 0..NR_SMALL_POOLS {
            let pool = &heap.pools[idx];
            if pool.pages_in_use == 0 && pool.free_count == 0 {
                continue;
            }
            let _ = writeln!(
                out,
                "{:>10} {:>6} {:>6} {:>12} {:>12}",
                pool.object_size,
                pool.span_sizes.preferred,
                pool.span_sizes.fallback,
                pool.free_count,
                pool.pages_in_use,
            );
        }

        let _ = writeln!(out, "free span histogram (pages: count):");
        let pages = heap.pages;
        for idx in 0..NR_SPAN_LISTS {
            let mut count = 0usize;
            let mut cursor = heap.free_spans[idx].front();
            while cursor != 0 {
                count += 1;
                // SAFETY: cursor is a linked head page of this heap.
                cursor = unsafe { (*pages.add(cursor as usize)).link_next };
            }
            if count > 0 {
                let _ = writeln!(out, "  {:>10}: {count}", 1u64 << idx);
            }
        }
        out
    })
    .unwrap_or_else(|| "no shard heap on this thread".to_string())
}
