//! Per-shard heap: buddy span layer plus small pools.
//!
//! One `ShardHeap` owns a contiguous sub-region of the process reservation.
//! Free spans live in 32 lists indexed by `log2(pages)`; each list holds
//! naturally aligned spans of that exact power-of-two size. Small pools sit
//! on top and carve spans into fixed-size objects. Frees arriving from other
//! shards are pushed onto a lock-free stack and drained by the owner.

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use super::page::{FreeObject, Page, PageList};
use super::pool::{
    idx_to_size, log2ceil, size_to_idx, SmallPool, MAX_SMALL_ALLOCATION, NR_SMALL_POOLS,
};
use super::stats::LocalStats;
use super::{MemError, HUGE_PAGE_SIZE, MAX_SHARDS, PAGE_BITS, PAGE_SIZE, SHARD_ID_SHIFT};

/// Number of buddy free lists; list `i` holds spans of `2^i` pages.
pub(crate) const NR_SPAN_LISTS: usize = 32;

/// Node of the cross-shard free stack. Reuses the freed object's first word.
#[repr(C)]
pub(crate) struct XShardFreeItem {
    next: *mut XShardFreeItem,
}

/// Scope a reclaimer may run under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReclaimScope {
    /// May only run from an explicit reclaim task scheduled on the reactor.
    Async,
    /// May run synchronously inside an allocation that found no free span.
    Sync,
}

/// Outcome of one reclaimer invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reclaimed {
    /// No memory was released.
    Nothing,
    /// At least some memory was released.
    Something,
}

/// A registered memory reclaimer. The callback receives a byte target.
pub struct Reclaimer {
    pub(crate) scope: ReclaimScope,
    pub(crate) reclaim: Box<dyn FnMut(usize) -> Reclaimed>,
}

impl Reclaimer {
    /// Creates a reclaimer for the given scope.
    pub fn new(scope: ReclaimScope, reclaim: impl FnMut(usize) -> Reclaimed + 'static) -> Self {
        Self {
            scope,
            reclaim: Box::new(reclaim),
        }
    }
}

/// Hook used to schedule an asynchronous reclaim pass on the shard reactor.
pub(crate) type ReclaimHook = Box<dyn Fn(Box<dyn FnOnce()>)>;

/// How the shard region is backed.
pub(crate) enum Backing {
    /// Anonymous private memory (`MAP_ANONYMOUS`), huge pages advised.
    Anonymous,
    /// A file on a hugetlbfs mount; grows by `ftruncate` + fixed `mmap`.
    #[cfg(target_os = "linux")]
    Hugetlb(std::fs::File),
}

pub(crate) struct ShardHeap {
    pub(crate) memory: *mut u8,
    pub(crate) pages: *mut Page,
    pub(crate) nr_pages: u32,
    pub(crate) nr_free_pages: u32,
    pub(crate) min_free_pages: u32,
    pub(crate) current_min_free_pages: u32,
    pub(crate) large_warn_threshold: usize,
    pub(crate) shard_id: u32,
    pub(crate) free_spans: [PageList; NR_SPAN_LISTS],
    pub(crate) pools: [SmallPool; NR_SMALL_POOLS],
    pub(crate) reclaimers: Vec<Reclaimer>,
    pub(crate) reclaim_hook: Option<ReclaimHook>,
    pub(crate) backing: Backing,
    pub(crate) stats: LocalStats,
    /// Lock-free stack of objects freed by other shards. Only field written
    /// by foreign threads; everything else is owner-only.
    pub(crate) xshard_free: AtomicPtr<XShardFreeItem>,
}

impl ShardHeap {
    pub(crate) fn new() -> Box<Self> {
        Box::new(Self {
            memory: ptr::null_mut(),
            pages: ptr::null_mut(),
            nr_pages: 0,
            nr_free_pages: 0,
            min_free_pages: 0,
            current_min_free_pages: 0,
            large_warn_threshold: usize::MAX,
            shard_id: u32::MAX,
            free_spans: [PageList::new(); NR_SPAN_LISTS],
            pools: std::array::from_fn(|i| {
                SmallPool::new(u32::try_from(idx_to_size(i)).unwrap_or(u32::MAX))
            }),
            reclaimers: Vec::new(),
            reclaim_hook: None,
            backing: Backing::Anonymous,
            stats: LocalStats::default(),
            xshard_free: AtomicPtr::new(ptr::null_mut()),
        })
    }

    pub(crate) fn is_initialized(&self) -> bool {
        self.nr_pages != 0
    }

    /// Smallest list index whose spans are all `>= pages` long.
    pub(crate) fn index_of(pages: u32) -> usize {
        if pages == 1 {
            0
        } else {
            (u32::BITS - (pages - 1).leading_zeros()) as usize
        }
    }

    fn page(&self, idx: u32) -> &Page {
        // SAFETY: callers only pass indices within [0, nr_pages], and the
        // descriptor array covers nr_pages + 1 entries (sentinel included).
        unsafe { &*self.pages.add(idx as usize) }
    }

    #[allow(clippy::mut_from_ref)]
    fn page_mut(&mut self, idx: u32) -> &mut Page {
        // SAFETY: as `page`, and `&mut self` guarantees exclusivity.
        unsafe { &mut *self.pages.add(idx as usize) }
    }

    pub(crate) fn addr_to_page_idx(&self, ptr: *const u8) -> u32 {
        debug_assert!(ptr >= self.memory.cast_const());
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let idx = (unsafe { ptr.offset_from(self.memory.cast_const()) } as usize >> PAGE_BITS)
            as u32;
        idx
    }

    fn page_idx_to_addr(&self, idx: u32) -> *mut u8 {
        // SAFETY: idx is within the mapped region.
        unsafe { self.memory.add(idx as usize * PAGE_SIZE) }
    }

    // --- buddy layer -----------------------------------------------------

    fn free_span_no_merge(&mut self, span_start: u32, nr_pages: u32) {
        debug_assert!(nr_pages > 0);
        self.nr_free_pages += nr_pages;
        let tail = span_start + nr_pages - 1;
        {
            let head = self.page_mut(span_start);
            head.free = true;
            head.span_size = nr_pages;
        }
        {
            let tail = self.page_mut(tail);
            tail.free = true;
            tail.span_size = nr_pages;
        }
        let idx = Self::index_of(nr_pages);
        let pages = self.pages;
        // SAFETY: span_start is a valid, unlinked head page.
        unsafe { self.free_spans[idx].push_front(pages, span_start) };
    }

    /// Tries to merge the span with its buddy; on success the span doubles
    /// and the walk continues one list up.
    fn grow_span(&mut self, span_start: &mut u32, nr_pages: &mut u32, idx: usize) -> bool {
        let which = (*span_start >> idx) & 1; // 0 = lower buddy, 1 = upper
        // Probe the first page of the upper buddy or the last page of the
        // lower buddy; span_size is valid at both span ends.
        let probe = if which == 0 {
            *span_start + *nr_pages
        } else {
            *span_start - 1
        };
        let p = self.page(probe);
        if p.free && p.span_size == *nr_pages {
            let buddy_head = *span_start ^ *nr_pages;
            let pages = self.pages;
            // SAFETY: the buddy's head page is linked in the size-idx list.
            unsafe { self.free_spans[idx].erase(pages, buddy_head) };
            self.nr_free_pages -= *nr_pages; // free_span_no_merge restores
            *span_start &= !*nr_pages;
            *nr_pages *= 2;
            return true;
        }
        false
    }

    pub(crate) fn free_span(&mut self, mut span_start: u32, mut nr_pages: u32) {
        debug_assert!(nr_pages > 0);
        let mut idx = Self::index_of(nr_pages);
        while self.grow_span(&mut span_start, &mut nr_pages, idx) {
            idx += 1;
        }
        self.free_span_no_merge(span_start, nr_pages);
    }

    /// Frees an arbitrary page run by breaking it into aligned power-of-two
    /// chunks. Used for boot spans and region growth only.
    pub(crate) fn free_span_unaligned(&mut self, mut span_start: u32, mut nr_pages: u32) {
        debug_assert!(nr_pages > 0);
        while nr_pages > 0 {
            let start_bits = if span_start == 0 {
                32
            } else {
                span_start.trailing_zeros()
            };
            let size_bits = nr_pages.trailing_zeros();
            let now = 1u32 << start_bits.min(size_bits);
            self.free_span(span_start, now);
            span_start += now;
            nr_pages -= now;
        }
    }

    fn find_and_unlink_span(&mut self, n_pages: u32) -> Option<u32> {
        let idx = Self::index_of(n_pages);
        if u64::from(n_pages) >= (2u64 << idx) {
            return None; // request too large for any list
        }
        let mut i = idx;
        while i < NR_SPAN_LISTS && self.free_spans[i].is_empty() {
            i += 1;
        }
        if i == NR_SPAN_LISTS {
            return None;
        }
        let pages = self.pages;
        // SAFETY: the list is non-empty.
        Some(unsafe { self.free_spans[i].pop_front(pages) })
    }

    fn find_and_unlink_span_reclaiming(&mut self, n_pages: u32) -> Option<u32> {
        loop {
            if let Some(span) = self.find_and_unlink_span(n_pages) {
                return Some(span);
            }
            if self.run_reclaimers(ReclaimScope::Sync, n_pages) == Reclaimed::Nothing {
                return None;
            }
        }
    }

    fn allocate_large_and_trim(&mut self, n_pages: u32) -> *mut u8 {
        // Don't exercise the reclaimers for requests we can never satisfy.
        if self.nr_pages != 0 && n_pages >= self.nr_pages {
            return ptr::null_mut();
        }
        let Some(span_idx) = self.find_and_unlink_span_reclaiming(n_pages) else {
            return ptr::null_mut();
        };
        let mut span_size = self.page(span_idx).span_size;
        self.nr_free_pages -= span_size;
        while span_size >= n_pages * 2 {
            span_size /= 2;
            self.free_span_no_merge(span_idx + span_size, span_size);
        }
        {
            let head = self.page_mut(span_idx);
            head.free = false;
            head.span_size = span_size;
            head.pool = 0;
        }
        {
            let tail = self.page_mut(span_idx + span_size - 1);
            tail.free = false;
            tail.span_size = span_size;
        }
        self.maybe_reclaim();
        self.page_idx_to_addr(span_idx)
    }

    fn warn_large_allocation(&mut self, size: usize) {
        self.stats.large_allocs += 1;
        tracing::warn!(
            shard = self.shard_id,
            size,
            "oversized allocation; this is non-fatal but can cause latency and fragmentation"
        );
        // Golden-ratio growth keeps repeat warnings rare without a timer.
        self.large_warn_threshold = (self.large_warn_threshold as f64 * 1.618) as usize;
    }

    fn check_large_allocation(&mut self, size: usize) {
        if size > self.large_warn_threshold {
            self.warn_large_allocation(size);
        }
    }

    pub(crate) fn allocate_large(&mut self, n_pages: u32) -> *mut u8 {
        self.check_large_allocation(n_pages as usize * PAGE_SIZE);
        self.allocate_large_and_trim(n_pages)
    }

    pub(crate) fn allocate_large_bytes(&mut self, size: usize) -> *mut u8 {
        let n_pages = (size + PAGE_SIZE - 1) >> PAGE_BITS;
        let Ok(n_pages) = u32::try_from(n_pages) else {
            return ptr::null_mut();
        };
        if (n_pages as usize) << PAGE_BITS < size {
            return ptr::null_mut(); // rounding overflowed
        }
        self.allocate_large(n_pages)
    }

    pub(crate) fn free_large(&mut self, ptr: *mut u8) {
        let idx = self.addr_to_page_idx(ptr);
        let span_size = self.page(idx).span_size;
        debug_assert!(span_size > 0);
        debug_assert_eq!(self.page(idx + span_size - 1).span_size, span_size);
        self.free_span(idx, span_size);
    }

    // --- small pools -----------------------------------------------------

    pub(crate) fn allocate_small(&mut self, size: usize) -> *mut u8 {
        let idx = size_to_idx(size);
        debug_assert!(size <= self.pools[idx].object_size as usize);
        self.pool_allocate(idx)
    }

    fn pool_allocate(&mut self, idx: usize) -> *mut u8 {
        if self.pools[idx].free.is_null() {
            self.pool_add_more_objects(idx);
        }
        let obj = self.pools[idx].free;
        if obj.is_null() {
            return ptr::null_mut();
        }
        // SAFETY: obj came off the pool free list, so it points at a free
        // object whose first word is the next link.
        self.pools[idx].free = unsafe { (*obj).next };
        self.pools[idx].free_count -= 1;
        obj.cast()
    }

    pub(crate) fn pool_deallocate(&mut self, idx: usize, obj: *mut u8) {
        let obj: *mut FreeObject = obj.cast();
        // SAFETY: the object is dead; its first word becomes the link.
        unsafe { (*obj).next = self.pools[idx].free };
        self.pools[idx].free = obj;
        self.pools[idx].free_count += 1;
        if self.pools[idx].free_count >= self.pools[idx].max_free {
            self.pool_trim_free_list(idx);
        }
    }

    fn pool_add_more_objects(&mut self, idx: usize) {
        let goal = self.pools[idx].free_goal();
        let pages = self.pages;

        // First adopt objects parked on partially-used spans.
        while !self.pools[idx].span_list.is_empty() && self.pools[idx].free_count < goal {
            // SAFETY: list is non-empty; the front is a linked span head.
            let span_idx = unsafe { self.pools[idx].span_list.pop_front(pages) };
            // SAFETY: span_idx indexes the live descriptor array, which is
            // disjoint from the heap struct itself.
            let span = unsafe { &mut *pages.add(span_idx as usize) };
            while !span.freelist.is_null() {
                let obj = span.freelist;
                // SAFETY: freelist links live inside free objects.
                unsafe {
                    span.freelist = (*obj).next;
                    (*obj).next = self.pools[idx].free;
                }
                span.nr_small_alloc += 1;
                self.pools[idx].free = obj;
                self.pools[idx].free_count += 1;
            }
        }

        // Then carve fresh spans from the buddy layer.
        let (preferred, fallback, object_size) = {
            let p = &self.pools[idx];
            (
                p.span_sizes.preferred,
                p.span_sizes.fallback,
                p.object_size as usize,
            )
        };
        while self.pools[idx].free_count < goal {
            let mut data = self.allocate_large(preferred);
            if data.is_null() {
                data = self.allocate_large(fallback);
                if data.is_null() {
                    return;
                }
            }
            let span_idx = self.addr_to_page_idx(data);
            let span_size = self.page(span_idx).span_size;
            self.pools[idx].pages_in_use += span_size;
            for i in 0..span_size {
                let p = self.page_mut(span_idx + i);
                #[allow(clippy::cast_possible_truncation)]
                {
                    p.offset_in_span = i as u8;
                    p.pool = (idx + 1) as u16;
                }
            }
            {
                let head = self.page_mut(span_idx);
                head.nr_small_alloc = 0;
                head.freelist = ptr::null_mut();
            }
            let mut offset = 0usize;
            while offset + object_size <= span_size as usize * PAGE_SIZE {
                // SAFETY: offset stays within the span just allocated.
                let obj: *mut FreeObject = unsafe { data.add(offset) }.cast();
                let pool = &mut self.pools[idx];
                // SAFETY: the span memory is unused; first word is the link.
                unsafe { (*obj).next = pool.free };
                pool.free = obj;
                pool.free_count += 1;
                self.page_mut(span_idx).nr_small_alloc += 1;
                offset += object_size;
            }
        }
    }

    fn pool_trim_free_list(&mut self, idx: usize) {
        let goal = self.pools[idx].free_goal();
        let pages = self.pages;
        while !self.pools[idx].free.is_null() && self.pools[idx].free_count > goal {
            let obj = self.pools[idx].free;
            // SAFETY: obj is the free-list head.
            self.pools[idx].free = unsafe { (*obj).next };
            self.pools[idx].free_count -= 1;

            let obj_page = self.addr_to_page_idx(obj.cast());
            let span_idx = obj_page - u32::from(self.page(obj_page).offset_in_span);
            // SAFETY: span_idx indexes the live descriptor array, disjoint
            // from the heap struct.
            let span = unsafe { &mut *pages.add(span_idx as usize) };
            if span.freelist.is_null() {
                span.link_prev = 0;
                span.link_next = 0;
                // SAFETY: a span head with an empty freelist is not listed.
                unsafe { self.pools[idx].span_list.push_front(pages, span_idx) };
            }
            // SAFETY: the object is free; first word is the link.
            unsafe { (*obj).next = span.freelist };
            span.freelist = obj;
            span.nr_small_alloc -= 1;
            if span.nr_small_alloc == 0 {
                let span_size = span.span_size;
                self.pools[idx].pages_in_use -= span_size;
                // SAFETY: the span head was linked above or on a prior trim.
                unsafe { self.pools[idx].span_list.erase(pages, span_idx) };
                self.free_span(span_idx, span_size);
            }
        }
    }

    /// Drops every cached free object back to its span. Used by diagnostics
    /// and tests to make `pages_in_use` reflect live objects only.
    pub(crate) fn pool_drain_cache(&mut self, idx: usize) {
        let (saved_min, saved_max) = (self.pools[idx].min_free, self.pools[idx].max_free);
        self.pools[idx].min_free = 0;
        self.pools[idx].max_free = 0;
        self.pool_trim_free_list(idx);
        self.pools[idx].min_free = saved_min;
        self.pools[idx].max_free = saved_max;
    }

    // --- frees and sizing ------------------------------------------------

    pub(crate) fn free_local(&mut self, ptr: *mut u8) {
        let page_idx = self.addr_to_page_idx(ptr);
        let pool = self.page(page_idx).pool;
        if pool != 0 {
            self.pool_deallocate(pool as usize - 1, ptr);
        } else {
            self.free_large(ptr);
        }
    }

    pub(crate) fn free_local_sized(&mut self, ptr: *mut u8, size: usize) {
        // Mirror the routing in allocate() so the object returns to the
        // pool it came from.
        let size = size.max(std::mem::size_of::<FreeObject>());
        if size <= MAX_SMALL_ALLOCATION {
            self.pool_deallocate(size_to_idx(size), ptr);
        } else {
            self.free_large(ptr);
        }
    }

    pub(crate) fn object_size(&self, ptr: *const u8) -> usize {
        let page_idx = self.addr_to_page_idx(ptr);
        let page = self.page(page_idx);
        if page.pool != 0 {
            self.pools[page.pool as usize - 1].object_size as usize
        } else {
            page.span_size as usize * PAGE_SIZE
        }
    }

    /// Returns the trailing pages of an over-sized span without moving the
    /// object. No-op for small-pool objects.
    pub(crate) fn shrink(&mut self, ptr: *mut u8, new_size: usize) {
        let span_idx = self.addr_to_page_idx(ptr);
        if self.page(span_idx).pool != 0 {
            return;
        }
        let old_size_pages = self.page(span_idx).span_size;
        let mut new_size_pages = old_size_pages;
        while (new_size_pages / 2) as usize * PAGE_SIZE >= new_size {
            new_size_pages /= 2;
        }
        if new_size_pages == old_size_pages {
            return;
        }
        {
            let head = self.page_mut(span_idx);
            head.span_size = new_size_pages;
        }
        {
            let tail = self.page_mut(span_idx + new_size_pages - 1);
            tail.free = false;
            tail.span_size = new_size_pages;
        }
        self.free_span_unaligned(span_idx + new_size_pages, old_size_pages - new_size_pages);
    }

    // --- cross-shard free list -------------------------------------------

    /// Pushes an object onto a remote shard's free stack.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live allocation owned by shard `owner`.
    pub(crate) unsafe fn free_cross_shard(owner: u32, ptr: *mut u8) {
        debug_assert!((owner as usize) < MAX_SHARDS);
        if !super::LIVE_SHARDS[owner as usize].load(Ordering::Relaxed) {
            // Shard already torn down; leak rather than corrupt.
            return;
        }
        let heap = super::ALL_SHARDS[owner as usize].load(Ordering::Acquire);
        debug_assert!(!heap.is_null());
        let item: *mut XShardFreeItem = ptr.cast();
        let list = &(*heap).xshard_free;
        let mut old = list.load(Ordering::Relaxed);
        loop {
            (*item).next = old;
            match list.compare_exchange_weak(old, item, Ordering::Release, Ordering::Relaxed) {
                Ok(_) => break,
                Err(cur) => old = cur,
            }
        }
    }

    /// Drains objects freed by other shards. Returns whether any work ran.
    pub(crate) fn drain_cross_shard_freelist(&mut self) -> bool {
        if self.xshard_free.load(Ordering::Relaxed).is_null() {
            return false;
        }
        let mut p = self.xshard_free.swap(ptr::null_mut(), Ordering::Acquire);
        while !p.is_null() {
            // SAFETY: every node was a live allocation of this shard.
            let next = unsafe { (*p).next };
            self.stats.frees += 1;
            self.stats.cross_shard_frees_received += 1;
            self.free_local(p.cast());
            p = next;
        }
        true
    }

    // --- reclaim ---------------------------------------------------------

    fn maybe_reclaim(&mut self) {
        if self.nr_free_pages < self.current_min_free_pages {
            self.drain_cross_shard_freelist();
            if self.nr_free_pages < self.current_min_free_pages {
                self.run_reclaimers(
                    ReclaimScope::Sync,
                    self.current_min_free_pages - self.nr_free_pages,
                );
            }
            if self.nr_free_pages < self.current_min_free_pages {
                self.schedule_reclaim();
            }
        }
    }

    pub(crate) fn run_reclaimers(&mut self, scope: ReclaimScope, n_pages: u32) -> Reclaimed {
        let target = (self.nr_free_pages + n_pages).max(self.min_free_pages);
        let mut result = Reclaimed::Nothing;
        while self.nr_free_pages < target {
            self.stats.reclaims += 1;
            // Callbacks may re-enter the allocator; keep them out of `self`
            // while they run.
            let mut reclaimers = std::mem::take(&mut self.reclaimers);
            let mut made_progress = false;
            let want = (target - self.nr_free_pages) as usize * PAGE_SIZE;
            for r in &mut reclaimers {
                if r.scope >= scope {
                    made_progress |= (r.reclaim)(want) == Reclaimed::Something;
                }
            }
            let mut registered_during = std::mem::replace(&mut self.reclaimers, reclaimers);
            self.reclaimers.append(&mut registered_during);
            if !made_progress {
                return result;
            }
            result = Reclaimed::Something;
        }
        result
    }

    fn schedule_reclaim(&mut self) {
        self.current_min_free_pages = 0;
        let Some(hook) = self.reclaim_hook.as_ref() else {
            self.current_min_free_pages = self.min_free_pages;
            return;
        };
        let shard = self.shard_id;
        hook(Box::new(move || {
            // Runs on the owning reactor; re-derive the heap pointer.
            let heap = super::ALL_SHARDS[shard as usize].load(Ordering::Acquire);
            if heap.is_null() {
                return;
            }
            // SAFETY: the hook schedules onto the owning shard thread, the
            // only thread that mutates this heap.
            unsafe {
                let heap = &mut *heap;
                if heap.nr_free_pages < heap.min_free_pages {
                    let deficit = heap.min_free_pages - heap.nr_free_pages;
                    heap.run_reclaimers(ReclaimScope::Async, deficit);
                }
                heap.current_min_free_pages = heap.min_free_pages;
            }
        }));
    }

    pub(crate) fn set_reclaim_hook(&mut self, hook: ReclaimHook) {
        self.reclaim_hook = Some(hook);
        self.current_min_free_pages = self.min_free_pages;
    }

    pub(crate) fn set_min_free_pages(&mut self, pages: u32) {
        self.min_free_pages = pages;
        self.maybe_reclaim();
    }

    // --- region mapping --------------------------------------------------

    /// Maps `bytes` of backing memory at the fixed address `at`.
    fn map_fixed(&mut self, at: *mut u8, bytes: usize) -> Result<(), MemError> {
        match &self.backing {
            Backing::Anonymous => {
                // SAFETY: `at` lies inside this shard's reserved window, so
                // MAP_FIXED only replaces our own PROT_NONE reservation.
                let r = unsafe {
                    libc::mmap(
                        at.cast(),
                        bytes,
                        libc::PROT_READ | libc::PROT_WRITE,
                        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED,
                        -1,
                        0,
                    )
                };
                if r == libc::MAP_FAILED {
                    return Err(MemError::Map {
                        source: std::io::Error::last_os_error(),
                    });
                }
                #[cfg(target_os = "linux")]
                // SAFETY: advisory only; the range was just mapped.
                unsafe {
                    libc::madvise(at.cast(), bytes, libc::MADV_HUGEPAGE);
                }
                Ok(())
            }
            #[cfg(target_os = "linux")]
            Backing::Hugetlb(file) => {
                use std::os::unix::io::AsRawFd;
                let offset = at as usize - self.memory as usize;
                let new_len = offset + bytes;
                // SAFETY: plain ftruncate on a file we own.
                let r = unsafe {
                    libc::ftruncate(
                        file.as_raw_fd(),
                        libc::off_t::try_from(new_len).unwrap_or(libc::off_t::MAX),
                    )
                };
                if r != 0 {
                    return Err(MemError::Map {
                        source: std::io::Error::last_os_error(),
                    });
                }
                // SAFETY: fixed map over our own reservation, file extended
                // to cover the range above.
                let r = unsafe {
                    libc::mmap(
                        at.cast(),
                        bytes,
                        libc::PROT_READ | libc::PROT_WRITE,
                        libc::MAP_SHARED | libc::MAP_POPULATE | libc::MAP_FIXED,
                        file.as_raw_fd(),
                        libc::off_t::try_from(offset).unwrap_or(0),
                    )
                };
                if r == libc::MAP_FAILED {
                    return Err(MemError::Map {
                        source: std::io::Error::last_os_error(),
                    });
                }
                Ok(())
            }
        }
    }

    /// First mapping of the shard sub-region: a small bootstrap window that
    /// holds the descriptor array at offset zero.
    pub(crate) fn initialize(&mut self) -> Result<(), MemError> {
        debug_assert!(!self.is_initialized());
        let shard_id = super::SHARD_ID_GEN.fetch_add(1, Ordering::Relaxed);
        if shard_id as usize >= MAX_SHARDS {
            return Err(MemError::TooManyShards { max: MAX_SHARDS });
        }
        self.shard_id = shard_id;

        let base = super::mem_base().wrapping_add((shard_id as usize) << SHARD_ID_SHIFT);
        let size = 32usize << 20;
        self.memory = base;
        self.map_fixed(base, size)?;
        self.pages = base.cast();
        #[allow(clippy::cast_possible_truncation)]
        {
            self.nr_pages = (size / PAGE_SIZE) as u32;
        }

        // Reserve the descriptor array (rounded to a power of two so it can
        // later be freed as aligned spans) plus the one-past-last sentinel
        // that spares the buddy walk a bounds check at the region top.
        let descr_bytes = std::mem::size_of::<Page>() * (self.nr_pages as usize + 1);
        let descr_pages = (descr_bytes + PAGE_SIZE - 1) / PAGE_SIZE;
        let reserved = 1u32 << log2ceil(descr_pages);
        for i in 0..reserved {
            self.page_mut(i).free = false;
        }
        let sentinel = self.nr_pages;
        self.page_mut(sentinel).free = false;
        debug_assert!(self.nr_pages > reserved);
        self.free_span_unaligned(reserved, self.nr_pages - reserved);

        super::ALL_SHARDS[shard_id as usize].store(self as *mut _, Ordering::Release);
        super::LIVE_SHARDS[shard_id as usize].store(true, Ordering::Release);
        Ok(())
    }

    fn do_resize(&mut self, new_size: usize) -> Result<(), MemError> {
        let new_pages = new_size / PAGE_SIZE;
        if new_pages <= self.nr_pages as usize {
            return Ok(());
        }
        let old_size = self.nr_pages as usize * PAGE_SIZE;
        let map_start = unsafe { self.memory.add(old_size) };
        self.map_fixed(map_start, new_size - old_size)?;

        // Relocate the descriptor array through the buddy allocator.
        let new_descr_bytes = std::mem::size_of::<Page>() * (new_pages + 1);
        let new_descr_pages = (new_descr_bytes + PAGE_SIZE - 1) / PAGE_SIZE;
        let new_array: *mut Page = self
            .allocate_large(u32::try_from(new_descr_pages).map_err(|_| MemError::AllocationFailed {
                size: new_descr_bytes,
            })?)
            .cast();
        if new_array.is_null() {
            return Err(MemError::AllocationFailed {
                size: new_descr_bytes,
            });
        }
        // SAFETY: new_array spans new_pages + 1 descriptors; the old array
        // covers nr_pages of them. Descriptors for not-yet-freed pages must
        // read as zero so buddy merges cannot probe stale state.
        unsafe {
            ptr::copy_nonoverlapping(self.pages, new_array, self.nr_pages as usize);
            ptr::write_bytes(
                new_array.add(self.nr_pages as usize),
                0,
                new_pages + 1 - self.nr_pages as usize,
            );
            (*new_array.add(new_pages)).free = false;
        }

        let old_array: *mut u8 = self.pages.cast();
        let old_nr_pages = self.nr_pages;
        let old_descr_bytes = std::mem::size_of::<Page>() * (old_nr_pages as usize + 1);
        let old_descr_pages_aligned =
            1u32 << log2ceil((old_descr_bytes + PAGE_SIZE - 1) / PAGE_SIZE);

        self.pages = new_array;
        #[allow(clippy::cast_possible_truncation)]
        {
            self.nr_pages = new_pages as u32;
        }

        let mut old_start = self.addr_to_page_idx(old_array);
        let mut old_len = old_descr_pages_aligned;
        if old_start == 0 {
            // Keep page 0 out of circulation; it doubles as the list null.
            old_start = 1;
            old_len -= 1;
        }
        if old_len > 0 {
            self.free_span_unaligned(old_start, old_len);
        }
        debug_assert!(self.nr_pages > old_nr_pages);
        self.free_span_unaligned(old_nr_pages, self.nr_pages - old_nr_pages);
        Ok(())
    }

    /// Grows the shard map to `new_size` bytes (huge-page aligned), in at
    /// most 4x steps so the descriptor array can always be relocated.
    pub(crate) fn resize(&mut self, new_size: usize) -> Result<(), MemError> {
        let new_size = new_size & !(HUGE_PAGE_SIZE - 1);
        while (self.nr_pages as usize) * PAGE_SIZE < new_size {
            let step = new_size.min(4 * self.nr_pages as usize * PAGE_SIZE);
            self.do_resize(step)?;
        }
        Ok(())
    }

    pub(crate) fn memory_layout(&self) -> (usize, usize) {
        debug_assert!(self.is_initialized());
        (
            self.memory as usize,
            self.memory as usize + self.nr_pages as usize * PAGE_SIZE,
        )
    }
}

// SAFETY: the heap is owned by its shard thread; the only concurrently
// accessed field is the lock-free cross-shard stack, which is atomic.
unsafe impl Send for ShardHeap {}
unsafe impl Sync for ShardHeap {}
