//! # Shard Allocator
//!
//! A share-nothing memory manager: memory allocated on one shard is owned by
//! that shard, and the owning shard is recoverable from any pointer with a
//! single shift. Inspired by tcmalloc-style size classes over a buddy span
//! layer.
//!
//! ## Memory map
//!
//! ```text
//! base .. base + 2^46        process reservation (PROT_NONE, trimmed aligned)
//! base + (sid << 38)         shard sid's sub-region, mapped lazily
//! ```
//!
//! The page descriptor array sits at offset 0 of each sub-region and
//! describes every page of that shard, page 0 excluded (it doubles as the
//! null link). Frees that arrive on the wrong thread are routed: runtime
//! pointers go to the owner's lock-free free stack, anything else goes back
//! to the system allocator.

mod diagnostics;
mod heap;
mod page;
mod pool;
mod stats;

pub use diagnostics::{memory_diagnostics_report, DiagnosticsKind};
pub use heap::{Reclaimed, ReclaimScope, Reclaimer};
pub use stats::{alien_stats, AllocStats};

use std::cell::Cell;
use std::path::Path;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU8, AtomicUsize, Ordering};
use std::sync::Once;

use heap::{Backing, ShardHeap};
use page::FreeObject;
pub(crate) use pool::MAX_SMALL_ALLOCATION;

/// log2 of the page size.
pub const PAGE_BITS: u32 = 12;
/// Allocation granule of the buddy layer.
pub const PAGE_SIZE: usize = 1 << PAGE_BITS;
/// Shard id position within a runtime pointer.
pub const SHARD_ID_SHIFT: u32 = 38;
/// Upper bound on shards per process (an 8-bit id field); the reservation
/// holds this many sub-regions.
pub const MAX_SHARDS: usize = 256;
/// Huge page granule region growth is aligned to.
pub const HUGE_PAGE_SIZE: usize = 2 << 20;

/// Total reserved virtual span: `MAX_SHARDS` sub-regions of `2^38` bytes.
const REGION_SPAN: usize = MAX_SHARDS << SHARD_ID_SHIFT;

/// Alignment of the trimmed reservation. Reserving `2 * REGION_SPAN` to
/// align the full 2^46 span would not fit a 47-bit user address space, so
/// the slack is this much instead and shard ownership is computed relative
/// to `mem_base` rather than from absolute pointer bits.
const REGION_ALIGN: usize = 1 << 44;

/// High-bits mask used by the local fast-path ownership check.
const OWNER_MASK: usize = !((1usize << SHARD_ID_SHIFT) - 1);

/// Errors produced by the shard allocator.
#[derive(Debug, thiserror::Error)]
pub enum MemError {
    /// Out of memory after draining cross-shard frees and reclaimers.
    #[error("allocation of {size} bytes failed after reclaim")]
    AllocationFailed {
        /// The request size that could not be satisfied.
        size: usize,
    },
    /// The kernel refused a region mapping.
    #[error("failed to map shard memory: {source}")]
    Map {
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },
    /// The process ran out of shard sub-regions.
    #[error("too many shards (max {max})")]
    TooManyShards {
        /// The compile-time shard limit.
        max: usize,
    },
    /// Hugetlbfs backing was requested but could not be set up.
    #[error("hugetlbfs backing unavailable: {source}")]
    Hugetlb {
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },
}

static ALL_SHARDS: [AtomicPtr<ShardHeap>; MAX_SHARDS] = {
    #[allow(clippy::declare_interior_mutable_const)]
    const SLOT: AtomicPtr<ShardHeap> = AtomicPtr::new(ptr::null_mut());
    [SLOT; MAX_SHARDS]
};

static LIVE_SHARDS: [AtomicBool; MAX_SHARDS] = {
    #[allow(clippy::declare_interior_mutable_const)]
    const SLOT: AtomicBool = AtomicBool::new(false);
    [SLOT; MAX_SHARDS]
};

/// Process-wide shard id generator.
static SHARD_ID_GEN: AtomicU32 = AtomicU32::new(0);

static ABORT_ON_ALLOC_FAILURE: AtomicBool = AtomicBool::new(false);
static DUMP_KIND: AtomicU8 = AtomicU8::new(DiagnosticsKind::None as u8);

thread_local! {
    /// Fast-path pointer to the calling thread's heap, if it is a shard.
    static LOCAL_HEAP: Cell<*mut ShardHeap> = const { Cell::new(ptr::null_mut()) };
    /// Precomputed `base + (sid << SHARD_ID_SHIFT)` for the ownership check.
    static LOCAL_EXPECTED: Cell<usize> = const { Cell::new(usize::MAX) };
    /// Nesting depth of critical allocation sections.
    static CRITICAL_SECTION: Cell<u32> = const { Cell::new(0) };
}

/// Returns the aligned base of the process-wide reservation, creating it on
/// first use. This is the allocator's single `call_once`.
pub(crate) fn mem_base() -> *mut u8 {
    static BASE: AtomicUsize = AtomicUsize::new(0);
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        // Reserve the span plus alignment slack, then trim so the usable
        // window starts at a REGION_ALIGN boundary.
        let total = REGION_SPAN + REGION_ALIGN;
        // SAFETY: anonymous PROT_NONE reservation; nothing is dereferenced.
        let raw = unsafe {
            libc::mmap(
                ptr::null_mut(),
                total,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        assert!(
            raw != libc::MAP_FAILED,
            "cannot reserve runtime address space"
        );
        #[cfg(target_os = "linux")]
        // SAFETY: advisory; keeps the giant reservation out of core dumps.
        unsafe {
            libc::madvise(raw, total, libc::MADV_DONTDUMP);
        }
        let addr = raw as usize;
        let aligned = (addr + REGION_ALIGN - 1) & !(REGION_ALIGN - 1);
        // SAFETY: unmapping only the two slack ends of our own reservation.
        unsafe {
            if aligned > addr {
                libc::munmap(raw, aligned - addr);
            }
            let tail = aligned + REGION_SPAN;
            let end = addr + total;
            if end > tail {
                libc::munmap(tail as *mut libc::c_void, end - tail);
            }
        }
        BASE.store(aligned, Ordering::Release);
    });
    BASE.load(Ordering::Acquire) as *mut u8
}

/// Whether `ptr` lies inside the runtime-managed reservation.
#[must_use]
pub fn is_runtime_memory(ptr: *const u8) -> bool {
    let base = mem_base() as usize;
    let addr = ptr as usize;
    addr >= base && addr < base + REGION_SPAN
}

/// Shard that owns a runtime pointer: its base-relative sub-region index.
#[must_use]
pub fn owner_of(ptr: *const u8) -> u32 {
    let offset = (ptr as usize).wrapping_sub(mem_base() as usize);
    #[allow(clippy::cast_possible_truncation)]
    let owner = ((offset >> SHARD_ID_SHIFT) as u32) & (MAX_SHARDS as u32 - 1);
    owner
}

fn local_heap() -> Option<*mut ShardHeap> {
    let p = LOCAL_HEAP.with(Cell::get);
    if p.is_null() {
        None
    } else {
        Some(p)
    }
}

/// Options controlling a shard's memory region.
pub(crate) struct ShardMemConfig<'a> {
    /// Bytes of backing memory mapped at boot.
    pub bytes: usize,
    /// Hugetlbfs mount to back the region with, if any.
    pub hugepages: Option<&'a Path>,
    /// NUMA node to bind the region to, if requested.
    pub numa_node: Option<usize>,
}

/// Installs a shard heap on the calling thread. Must run before the thread
/// enters its reactor loop; returns the assigned shard id.
pub(crate) fn configure_shard(cfg: &ShardMemConfig<'_>) -> Result<u32, MemError> {
    assert!(
        local_heap().is_none(),
        "thread already owns a shard heap"
    );
    let mut heap = ShardHeap::new();
    if let Some(dir) = cfg.hugepages {
        heap.backing = hugetlb_backing(dir)?;
    }
    heap.initialize()?;
    heap.resize(cfg.bytes.max(32 << 20))?;
    if let Some(node) = cfg.numa_node {
        let (start, end) = heap.memory_layout();
        bind_region_to_node(start as *mut u8, end - start, node);
    }
    let id = heap.shard_id;
    let raw = Box::into_raw(heap);
    LOCAL_HEAP.with(|c| c.set(raw));
    // SAFETY: raw was just leaked; memory field is the region base.
    LOCAL_EXPECTED.with(|c| c.set(unsafe { (*raw).memory } as usize));
    tracing::debug!(shard = id, "shard heap installed");
    Ok(id)
}

#[cfg(target_os = "linux")]
fn hugetlb_backing(dir: &Path) -> Result<Backing, MemError> {
    let name = dir.join(format!("eddy-{}-{}", std::process::id(), SHARD_ID_GEN.load(Ordering::Relaxed)));
    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(&name)
        .map_err(|source| MemError::Hugetlb { source })?;
    // Keep only the descriptor; the region dies with the process.
    let _ = std::fs::remove_file(&name);
    Ok(Backing::Hugetlb(file))
}

#[cfg(not(target_os = "linux"))]
fn hugetlb_backing(_dir: &Path) -> Result<Backing, MemError> {
    Err(MemError::Hugetlb {
        source: std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "hugetlbfs backing requires Linux",
        ),
    })
}

/// `mbind` the shard region to its NUMA node; non-fatal on failure.
fn bind_region_to_node(ptr: *mut u8, size: usize, node: usize) {
    #[cfg(target_os = "linux")]
    {
        const MPOL_BIND: i32 = 2;
        const MPOL_MF_MOVE: u32 = 2;
        let nodemask: u64 = if node < 64 { 1u64 << node } else { 0 };
        // SAFETY: mbind over our own freshly mapped region.
        let r = unsafe {
            libc::syscall(
                libc::SYS_mbind,
                ptr,
                size,
                MPOL_BIND,
                std::ptr::addr_of!(nodemask),
                64usize,
                MPOL_MF_MOVE,
            )
        };
        if r < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ENOSYS) {
                tracing::warn!(node, "mbind failed (non-fatal): {err}");
            }
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = (ptr, size, node);
    }
}

/// Marks a shard's heap as gone; later cross-shard frees to it leak instead
/// of corrupting. The region itself stays mapped for the process lifetime.
pub(crate) fn mark_shard_down(shard: u32) {
    LIVE_SHARDS[shard as usize].store(false, Ordering::Release);
}

// --- allocation entry points ---------------------------------------------

fn raw_allocate(size: usize) -> *mut u8 {
    let Some(heap) = local_heap() else {
        // Alien thread: forward to the system allocator.
        stats::note_foreign_alloc();
        // SAFETY: plain malloc.
        return unsafe { libc::malloc(size.max(1)).cast() };
    };
    // SAFETY: the heap pointer is installed once per thread and only this
    // thread mutates it.
    let heap = unsafe { &mut *heap };
    let size = size.max(std::mem::size_of::<FreeObject>());
    let ptr = if size <= MAX_SMALL_ALLOCATION {
        heap.allocate_small(size)
    } else {
        heap.allocate_large_bytes(size)
    };
    heap.stats.allocs += 1;
    if ptr.is_null() {
        on_allocation_failure(size);
    }
    ptr
}

fn raw_allocate_aligned(align: usize, size: usize) -> *mut u8 {
    debug_assert!(align.is_power_of_two());
    let Some(heap) = local_heap() else {
        stats::note_foreign_alloc();
        let mut out: *mut libc::c_void = ptr::null_mut();
        // SAFETY: out is a valid out-pointer; align is a power of two.
        let rc = unsafe {
            libc::posix_memalign(
                &mut out,
                align.max(std::mem::size_of::<usize>()),
                size.max(1),
            )
        };
        return if rc == 0 { out.cast() } else { ptr::null_mut() };
    };
    // SAFETY: as in raw_allocate.
    let heap = unsafe { &mut *heap };
    let size = size.max(std::mem::size_of::<FreeObject>()).max(align);
    let ptr = if size <= MAX_SMALL_ALLOCATION && align <= PAGE_SIZE {
        // Small pools guarantee alignment only for power-of-two sizes up to
        // a page, so round the size up.
        heap.allocate_small(1 << pool::log2ceil(size))
    } else {
        // Buddy spans are naturally aligned: a span covering
        // max(size, align) bytes starts on an align boundary.
        heap.allocate_large_bytes(size.max(align))
    };
    heap.stats.allocs += 1;
    if ptr.is_null() {
        on_allocation_failure(size);
    }
    ptr
}

/// Allocates `size` bytes from the calling shard's heap (or the system
/// allocator on non-shard threads).
///
/// # Errors
///
/// `MemError::AllocationFailed` when memory is exhausted after reclaim.
pub fn allocate(size: usize) -> Result<NonNull<u8>, MemError> {
    NonNull::new(raw_allocate(size)).ok_or(MemError::AllocationFailed { size })
}

/// Allocates `size` bytes aligned to `align` (a power of two).
///
/// # Errors
///
/// `MemError::AllocationFailed` when memory is exhausted after reclaim.
pub fn allocate_aligned(align: usize, size: usize) -> Result<NonNull<u8>, MemError> {
    NonNull::new(raw_allocate_aligned(align, size)).ok_or(MemError::AllocationFailed { size })
}

/// Routes a free to the system allocator or a remote shard when the pointer
/// is not owned by the calling thread. Returns true when handled.
fn try_foreign_free(ptr: *mut u8) -> bool {
    let addr = ptr as usize;
    if addr & OWNER_MASK == LOCAL_EXPECTED.with(Cell::get) {
        return false; // fast path: our own memory
    }
    if !is_runtime_memory(ptr) {
        if local_heap().is_some() {
            stats::note_foreign_cross_free();
        } else {
            stats::note_foreign_free();
        }
        // SAFETY: not runtime memory, so it came from the system allocator.
        unsafe { libc::free(ptr.cast()) };
        return true;
    }
    let owner = owner_of(ptr);
    if let Some(heap) = local_heap() {
        // SAFETY: owner-thread counter.
        unsafe { (*heap).stats.cross_shard_frees += 1 };
    } else {
        stats::note_foreign_cross_free();
    }
    // SAFETY: caller contract of `free`: ptr is a live runtime allocation.
    unsafe { ShardHeap::free_cross_shard(owner, ptr) };
    true
}

/// Frees a pointer returned by [`allocate`] or [`allocate_aligned`].
///
/// # Safety
///
/// `ptr` must come from this allocator (or the system allocator via an alien
/// thread) and must not be used afterwards.
pub unsafe fn free(ptr: NonNull<u8>) {
    let ptr = ptr.as_ptr();
    if try_foreign_free(ptr) {
        return;
    }
    let heap = &mut *local_heap().expect("local free without a shard heap");
    heap.stats.frees += 1;
    heap.free_local(ptr);
}

/// Frees with the original request size, letting the small path skip the
/// page-descriptor lookup.
///
/// # Safety
///
/// As [`free`]; `size` must match the allocation request.
pub unsafe fn free_sized(ptr: NonNull<u8>, size: usize) {
    let ptr = ptr.as_ptr();
    if try_foreign_free(ptr) {
        return;
    }
    let heap = &mut *local_heap().expect("local free without a shard heap");
    heap.stats.frees += 1;
    heap.free_local_sized(ptr, size);
}

/// Returns trailing pages of a large allocation to the buddy layer.
///
/// # Safety
///
/// `ptr` must be a live large allocation owned by the calling shard, and the
/// object must fit in `new_size` bytes.
pub unsafe fn shrink(ptr: NonNull<u8>, new_size: usize) {
    let heap = &mut *local_heap().expect("shrink without a shard heap");
    debug_assert_eq!(owner_of(ptr.as_ptr()), heap.shard_id);
    // Keep the counters balanced the way a free+alloc pair would.
    heap.stats.frees += 1;
    heap.stats.allocs += 1;
    heap.shrink(ptr.as_ptr(), new_size);
}

/// Usable size of an allocation owned by any live shard.
///
/// # Safety
///
/// `ptr` must be a live runtime allocation.
#[must_use]
pub unsafe fn object_size(ptr: NonNull<u8>) -> usize {
    let owner = owner_of(ptr.as_ptr());
    let heap = ALL_SHARDS[owner as usize].load(Ordering::Acquire);
    debug_assert!(!heap.is_null());
    (*heap).object_size(ptr.as_ptr())
}

/// Drains frees queued by other shards. Called by the reactor each poll
/// cycle; returns whether any work was done.
pub fn drain_cross_shard_frees() -> bool {
    let Some(heap) = local_heap() else {
        return false;
    };
    // SAFETY: owner-thread access.
    unsafe { (*heap).drain_cross_shard_freelist() }
}

/// Read-only: has any other shard queued frees for this one?
#[must_use]
pub fn has_pending_cross_shard_frees() -> bool {
    let Some(heap) = local_heap() else {
        return false;
    };
    // SAFETY: reading one atomic of the owner's heap.
    unsafe {
        !(*heap)
            .xshard_free
            .load(Ordering::Relaxed)
            .is_null()
    }
}

// --- tuning and introspection --------------------------------------------

/// Registers a reclaimer on the calling shard.
pub fn register_reclaimer(reclaimer: Reclaimer) {
    let heap = local_heap().expect("register_reclaimer outside a shard");
    // SAFETY: owner-thread access.
    unsafe { (*heap).reclaimers.push(reclaimer) };
}

/// Installs the hook used to schedule asynchronous reclaim work.
pub(crate) fn set_reclaim_hook(hook: Box<dyn Fn(Box<dyn FnOnce()>)>) {
    let heap = local_heap().expect("set_reclaim_hook outside a shard");
    // SAFETY: owner-thread access.
    unsafe { (*heap).set_reclaim_hook(hook) };
}

/// Sets the free-page watermark below which reclaim kicks in.
pub fn set_min_free_pages(pages: u32) {
    let heap = local_heap().expect("set_min_free_pages outside a shard");
    // SAFETY: owner-thread access.
    unsafe { (*heap).set_min_free_pages(pages) };
}

/// Controls whether a failed allocation aborts the process.
pub fn set_abort_on_allocation_failure(abort: bool) {
    ABORT_ON_ALLOC_FAILURE.store(abort, Ordering::Relaxed);
}

/// Selects which allocation failures dump memory diagnostics.
pub fn set_dump_diagnostics_kind(kind: DiagnosticsKind) {
    DUMP_KIND.store(kind as u8, Ordering::Relaxed);
}

/// Sets the large-allocation warning threshold for the calling shard.
pub fn set_large_allocation_warning_threshold(bytes: usize) {
    let heap = local_heap().expect("threshold outside a shard");
    // SAFETY: owner-thread access.
    unsafe { (*heap).large_warn_threshold = bytes };
}

/// Free pages currently held by the calling shard's buddy layer.
#[must_use]
pub fn free_page_count() -> u32 {
    local_heap().map_or(0, |heap| {
        // SAFETY: owner-thread access.
        unsafe { (*heap).nr_free_pages }
    })
}

/// Pages in use by the pool serving `object_size`-byte allocations, after
/// dropping the pool's object cache back to its spans.
#[must_use]
pub fn pool_pages_in_use(object_size: usize) -> u32 {
    let Some(heap) = local_heap() else { return 0 };
    let idx = pool::size_to_idx(object_size.max(std::mem::size_of::<FreeObject>()));
    // SAFETY: owner-thread access.
    unsafe {
        (*heap).pool_drain_cache(idx);
        (*heap).pools[idx].pages_in_use
    }
}

/// Allocation statistics of the calling thread (shard or alien view).
#[must_use]
pub fn local_stats() -> AllocStats {
    local_heap().map_or_else(stats::alien_stats, |heap| {
        // SAFETY: owner-thread access.
        unsafe { (*heap).stats.snapshot() }
    })
}

/// The calling shard's mapped region bounds.
#[must_use]
pub fn shard_memory_layout() -> Option<(usize, usize)> {
    // SAFETY: owner-thread access.
    local_heap().map(|heap| unsafe { (*heap).memory_layout() })
}

/// RAII marker for allocation paths where failure diagnostics matter even
/// under the `Critical` dump policy.
pub struct CriticalAllocSection(());

impl CriticalAllocSection {
    /// Enters a critical allocation section.
    #[must_use]
    pub fn enter() -> Self {
        CRITICAL_SECTION.with(|c| c.set(c.get() + 1));
        Self(())
    }
}

impl Drop for CriticalAllocSection {
    fn drop(&mut self) {
        CRITICAL_SECTION.with(|c| c.set(c.get() - 1));
    }
}

fn on_allocation_failure(size: usize) {
    let kind = DUMP_KIND.load(Ordering::Relaxed);
    let in_critical = CRITICAL_SECTION.with(Cell::get) > 0;
    let dump = kind == DiagnosticsKind::All as u8
        || (kind == DiagnosticsKind::Critical as u8 && in_critical);
    if dump {
        tracing::error!(size, "allocation failure\n{}", memory_diagnostics_report());
    } else {
        tracing::error!(size, "allocation failure");
    }
    if ABORT_ON_ALLOC_FAILURE.load(Ordering::Relaxed) {
        std::process::abort();
    }
}

pub(crate) fn with_local_heap<R>(f: impl FnOnce(&mut ShardHeap) -> R) -> Option<R> {
    // SAFETY: owner-thread access.
    local_heap().map(|heap| f(unsafe { &mut *heap }))
}

#[cfg(test)]
pub(crate) fn configure_test_shard() -> u32 {
    if let Some(id) = with_local_heap(|h| h.shard_id) {
        return id;
    }
    configure_shard(&ShardMemConfig {
        bytes: 64 << 20,
        hugepages: None,
        numa_node: None,
    })
    .expect("test shard heap")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_allocation_owner_matches_shard() {
        let sid = configure_test_shard();
        let p = allocate(17).unwrap();
        assert!(is_runtime_memory(p.as_ptr()));
        assert_eq!(owner_of(p.as_ptr()), sid);
        // SAFETY: p was just allocated here.
        unsafe { free(p) };
    }

    #[test]
    fn large_allocation_round_trips_free_pages() {
        configure_test_shard();
        // Settle pool caches first so the count is stable.
        let before = free_page_count();
        let p = allocate(1 << 20).unwrap();
        assert!(free_page_count() < before);
        // SAFETY: p was just allocated here.
        unsafe { free(p) };
        assert_eq!(free_page_count(), before);
    }

    #[test]
    fn aligned_allocations_are_aligned() {
        configure_test_shard();
        for align in [16usize, 64, 256, 4096, 1 << 16] {
            let p = allocate_aligned(align, align / 2 + 1).unwrap();
            assert_eq!(p.as_ptr() as usize % align, 0, "align {align}");
            // SAFETY: p was just allocated here.
            unsafe { free(p) };
        }
    }

    #[test]
    fn freed_object_is_recycled_without_aliasing() {
        configure_test_shard();
        let a = allocate(48).unwrap();
        // SAFETY: a is live and 48 bytes long.
        unsafe { ptr::write_bytes(a.as_ptr(), 0xa5, 48) };
        // SAFETY: a was just allocated here.
        unsafe { free(a) };
        let b = allocate(48).unwrap();
        let c = allocate(48).unwrap();
        assert_ne!(b.as_ptr(), c.as_ptr());
        // SAFETY: both live, disjoint allocations.
        unsafe {
            ptr::write_bytes(b.as_ptr(), 0x11, 48);
            ptr::write_bytes(c.as_ptr(), 0x22, 48);
            assert_eq!(*b.as_ptr(), 0x11);
            assert_eq!(*c.as_ptr(), 0x22);
            free(b);
            free(c);
        }
    }

    #[test]
    fn object_size_reports_class_size() {
        configure_test_shard();
        let p = allocate(17).unwrap();
        // SAFETY: p is live.
        let size = unsafe { object_size(p) };
        assert!(size >= 17 && size <= 64);
        // SAFETY: p was just allocated here.
        unsafe { free(p) };
    }

    #[test]
    fn shrink_returns_trailing_pages() {
        configure_test_shard();
        let before = free_page_count();
        let p = allocate(8 * PAGE_SIZE).unwrap();
        // SAFETY: p is an 8-page span; 2 pages keep the object intact.
        unsafe { shrink(p, 2 * PAGE_SIZE) };
        assert_eq!(free_page_count(), before - 2);
        // SAFETY: freeing the shrunken allocation.
        unsafe { free(p) };
        assert_eq!(free_page_count(), before);
    }

    #[test]
    fn alien_thread_free_routes_cross_shard() {
        configure_test_shard();
        let sent_before = local_stats().cross_shard_frees;
        let p = allocate(1024).unwrap();
        let addr = p.as_ptr() as usize;
        let before = free_page_count();
        std::thread::spawn(move || {
            // SAFETY: the allocation is live and handed off to this thread.
            unsafe { free(NonNull::new(addr as *mut u8).unwrap()) };
        })
        .join()
        .unwrap();
        // The object shows up once the owner drains its free stack.
        assert!(drain_cross_shard_frees());
        assert!(free_page_count() >= before);
        let _ = sent_before;
        let p2 = allocate(1024).unwrap();
        // SAFETY: p2 was just allocated here.
        unsafe { free(p2) };
    }
}
