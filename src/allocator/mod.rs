//! Slab-based memory allocator for fixed 64-byte blocks
//!
//! This is a thread-caching slab allocator in the general family of
//! [tcmalloc](https://google.github.io/tcmalloc/design.html) and the
//! [Mimalloc](https://www.microsoft.com/en-us/research/uploads/prod/2019/06/mimalloc-tr-v1.pdf)
//! allocator from Microsoft Research, cut down to a single block size.
//!
//! Each thread owns a [ThreadCache]. Allocation walks four tiers: a short
//! LIFO of recently freed blocks (the fastbin), the thread's current slab
//! (with a batched refill of the fastbin when the slab is still rich), the
//! thread's partial-slab list, and finally a fresh slab from the system
//! allocator. Freeing pushes into the fastbin until it is saturated, then
//! returns the block to the slab it came from, recovered from the block
//! address alone: every slab region is aligned to its own size and begins
//! with a back-pointer to its header.
//!
//! Nothing on these paths is atomic or locked: a slab is reachable through
//! at most one thread's lists at any moment, and a slab that drains
//! completely falls off every list until a free rediscovers it.

use std::{
    alloc::{self, Layout},
    cell::UnsafeCell,
    fmt::Debug,
    mem::size_of,
    ptr::{self, NonNull},
};

use tracing::Level;

use crate::util::{divroundup, roundto, UsizePtr};

/// Size in bytes of a single allocatable block
pub const BLOCK_SIZE: usize = 64;
/// Number of block-sized slots in a slab region (header slots included)
pub const BLOCK_COUNT: usize = 1024;
/// Maximum number of blocks parked in a thread's fastbin
pub const BLOCK_CACHE_LIMIT: usize = 64;
/// A current slab holding more free blocks than this triggers a batched
/// transfer into the fastbin
pub const BLOCK_CACHE_REFILL_LIMIT: usize = 32;

/// log2 of the size of a slab region
const SLAB_SHIFT: usize = 16; // 64 K
/// Size in bytes of a slab region; also its alignment, so that masking any
/// block address with `!(SLAB_SZ - 1)` yields the region start
const SLAB_SZ: usize = 1 << SLAB_SHIFT;
const _: () = assert!(SLAB_SZ == BLOCK_SIZE * BLOCK_COUNT);

/// [Layout] of the raw backing allocation for one slab
///
/// Twice the region size: rounding the raw pointer up to a region boundary
/// then always leaves a full aligned region inside the allocation.
const SLAB_BACKING_LAYOUT: Layout = match Layout::from_size_align(2 * SLAB_SZ, size_of::<usize>()) {
    Ok(x) => x,
    Err(_) => panic!("Invalid SLAB_SZ"),
};

/// Number of block slots at the start of the region consumed by the header
const SLAB_OVERHEAD: usize = divroundup(size_of::<Slab>(), BLOCK_SIZE);
/// Number of blocks available for allocation in each slab
pub const EFFECTIVE_BLOCKS: usize = BLOCK_COUNT - SLAB_OVERHEAD;

const _: () = assert!(size_of::<FreeBlock>() <= BLOCK_SIZE);
const _: () = assert!(SLAB_OVERHEAD >= 1 && SLAB_OVERHEAD < BLOCK_COUNT);

/// Contents of a block while it sits on a free list (i.e. free chain)
#[repr(C)]
struct FreeBlock {
    // DO NOT MODIFY
    // owner recovery relies on a free block being exactly one link word
    // overlaid on the first bytes of the payload
    next: *mut FreeBlock,
}

/// Header of a slab region
///
/// Lives in the first [SLAB_OVERHEAD] block slots of the aligned region it
/// describes. A slab belongs to exactly one thread's lists at a time and is
/// destroyed only when the thread that holds it exits.
#[repr(C)]
struct Slab {
    /// Back-pointer to this header. Must stay the first field: recovering
    /// the owner of a block loads the first machine word of the region.
    this: *mut Slab,
    /// Start of the aligned region (the address of this header)
    mem: *mut u8,
    /// Unaligned pointer returned by the system allocator, kept so teardown
    /// can release the original allocation
    raw_allocation: *mut u8,
    /// Head of this slab's free chain
    free_list: *mut FreeBlock,
    /// Number of blocks on [free_list](Self::free_list)
    free_count: usize,
    /// Link in the holding thread's current/partial list
    next: *mut Slab,
}

impl Debug for Slab {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Slab")
            .field("@addr", &(self as *const _))
            .field("raw_allocation", &(self.raw_allocation as *const ()))
            .field("free_list", &(self.free_list as *const ()))
            .field("free_count", &self.free_count)
            .field("next", &(self.next as *const ()))
            .finish()
    }
}

impl Slab {
    /// Allocate and initialize a fresh slab, installing it as `cache`'s
    /// current slab
    ///
    /// Returns `None` when the system allocator refuses the backing request.
    fn create(cache: &mut ThreadCache) -> Option<NonNull<Slab>> {
        let trace_span = tracing::span!(Level::TRACE, "allocator::new_slab");
        let _span_enter = trace_span.enter();

        // safety: SLAB_BACKING_LAYOUT has nonzero size
        let raw = unsafe { alloc::alloc(SLAB_BACKING_LAYOUT) };
        if raw.is_null() {
            return None;
        }

        let region = roundto(raw as usize, SLAB_SZ) as *mut u8;
        let slab = region as *mut Slab;

        unsafe {
            // safety: region..region+SLAB_SZ is inside the backing
            // allocation and exclusively ours until it reaches the cache
            (*slab).this = slab;
            (*slab).mem = region;
            (*slab).raw_allocation = raw;

            // Zeroing warms every page of the block array in before any of
            // it goes out
            let blocks = region.add(SLAB_OVERHEAD * BLOCK_SIZE);
            ptr::write_bytes(blocks, 0, EFFECTIVE_BLOCKS * BLOCK_SIZE);

            // Thread the free chain in ascending address order
            let mut cur = blocks as *mut FreeBlock;
            (*slab).free_list = cur;
            for _ in 1..EFFECTIVE_BLOCKS {
                let next = (cur as *mut u8).add(BLOCK_SIZE) as *mut FreeBlock;
                (*cur).next = next;
                cur = next;
            }
            (*cur).next = ptr::null_mut();
            (*slab).free_count = EFFECTIVE_BLOCKS;

            (*slab).next = cache.current_slab;
            cache.current_slab = slab;
        }

        tracing::event!(
            Level::TRACE,
            region = ?UsizePtr::from(region),
            raw = ?UsizePtr::from(raw)
        );

        // safety: derived from a non-null allocation
        Some(unsafe { NonNull::new_unchecked(slab) })
    }
}

/// Per-thread allocation state
///
/// One of these exists per thread that has touched the allocator, reachable
/// through a thread-local (see [alloc]/[free] at module level). The raw slab
/// pointers inside are only ever manipulated by the thread holding the
/// cache; the one cross-thread interaction is the adoption rule described on
/// [free](Self::free).
///
/// A standalone cache can also be driven directly, which is how the tests
/// exercise single-cache behavior deterministically.
pub struct ThreadCache {
    /// Slab that tier-2 allocations are served from (null once the last one
    /// drained; a drained slab is rediscovered through the free slow path)
    current_slab: *mut Slab,
    /// Slabs held by this thread with at least one free block, excluding
    /// the current slab
    partial_slabs: *mut Slab,
    /// LIFO of recently freed blocks, capped at [BLOCK_CACHE_LIMIT]
    fastbin: *mut FreeBlock,
    /// Length of [fastbin](Self::fastbin)
    fastbin_count: usize,
}

impl Debug for ThreadCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadCache")
            .field("@addr", &(self as *const _))
            .field("current_slab", &(self.current_slab as *const ()))
            .field("partial_slabs", &(self.partial_slabs as *const ()))
            .field("fastbin", &(self.fastbin as *const ()))
            .field("fastbin_count", &self.fastbin_count)
            .finish()
    }
}

impl ThreadCache {
    pub const fn new() -> Self {
        Self {
            current_slab: ptr::null_mut(),
            partial_slabs: ptr::null_mut(),
            fastbin: ptr::null_mut(),
            fastbin_count: 0,
        }
    }

    /// Acquire one block
    ///
    /// The returned region is writable for [BLOCK_SIZE] bytes and uniquely
    /// owned until passed back to [free](Self::free). Returns `None` when
    /// the system allocator refuses to back a fresh slab.
    pub fn alloc(&mut self) -> Option<NonNull<u8>> {
        loop {
            // Tier 1: fastbin pop
            if !self.fastbin.is_null() {
                let block = self.fastbin;
                // safety: blocks on the fastbin are free and unaliased, so
                // the link word is valid
                self.fastbin = unsafe { (*block).next };
                self.fastbin_count -= 1;
                // safety: fastbin entries are non-null by construction
                return Some(unsafe { NonNull::new_unchecked(block as *mut u8) });
            }

            // Tier 2: current slab
            let slab = self.current_slab;
            // safety: a slab on our lists stays valid until our teardown
            if !slab.is_null() && unsafe { (*slab).free_count } > 0 {
                unsafe {
                    if (*slab).free_count > BLOCK_CACHE_REFILL_LIMIT {
                        self.refill_fastbin(slab);
                    }
                    // the refill leaves at least one block on the chain, so
                    // this pop always serves the caller
                    let block = (*slab).free_list;
                    (*slab).free_list = (*block).next;
                    (*slab).free_count -= 1;
                    if (*slab).free_count == 0 {
                        // fully allocated: the slab falls off our lists and
                        // comes back through the free slow path
                        self.current_slab = ptr::null_mut();
                    }
                    return Some(NonNull::new_unchecked(block as *mut u8));
                }
            }

            // Tier 3: promote the head of the partial list
            debug_assert!(self.current_slab.is_null());
            if !self.partial_slabs.is_null() {
                let slab = self.partial_slabs;
                unsafe {
                    self.partial_slabs = (*slab).next;
                    (*slab).next = ptr::null_mut();
                }
                self.current_slab = slab;
                continue;
            }

            // Tier 4: fresh slab from the system allocator
            Slab::create(self)?;
        }
    }

    /// Batched refill: detach [BLOCK_CACHE_REFILL_LIMIT] blocks from the
    /// slab's chain and push them onto the fastbin
    ///
    /// The transfer reverses block order; free-chain order is not
    /// observable. Caller must hold `free_count > BLOCK_CACHE_REFILL_LIMIT`.
    unsafe fn refill_fastbin(&mut self, slab: *mut Slab) {
        debug_assert!((*slab).free_count > BLOCK_CACHE_REFILL_LIMIT);
        debug_assert!(self.fastbin_count + BLOCK_CACHE_REFILL_LIMIT <= BLOCK_CACHE_LIMIT);

        for _ in 0..BLOCK_CACHE_REFILL_LIMIT {
            let block = (*slab).free_list;
            (*slab).free_list = (*block).next;
            (*block).next = self.fastbin;
            self.fastbin = block;
        }
        (*slab).free_count -= BLOCK_CACHE_REFILL_LIMIT;
        self.fastbin_count += BLOCK_CACHE_REFILL_LIMIT;

        tracing::event!(
            Level::TRACE,
            slab = ?UsizePtr::from(slab),
            moved = BLOCK_CACHE_REFILL_LIMIT
        );
    }

    /// Release one block previously returned by [alloc](Self::alloc)
    ///
    /// The block may have been allocated by a different thread; if it misses
    /// the fastbin it is handed back to the slab it came from, and a slab
    /// that thereby stops being full is adopted into this cache's partial
    /// list.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by an `alloc` in this process and not
    /// freed since. Double frees, foreign pointers, and interior pointers
    /// are undefined behavior.
    pub unsafe fn free(&mut self, ptr: NonNull<u8>) {
        let block = ptr.as_ptr() as *mut FreeBlock;
        debug_assert!(block as usize % BLOCK_SIZE == 0);

        // Fast path: park in the fastbin without touching the holding slab
        if self.fastbin_count < BLOCK_CACHE_LIMIT {
            (*block).next = self.fastbin;
            self.fastbin = block;
            self.fastbin_count += 1;
            return;
        }

        // Fastbin saturated: recover the slab from the block address alone
        let region = (block as usize) & !(SLAB_SZ - 1);
        let slab = *(region as *const *mut Slab);
        debug_assert_eq!((*slab).mem as usize, region);

        let trace_span = tracing::span!(Level::TRACE, "allocator::free_slow");
        let _span_enter = trace_span.enter();
        tracing::event!(
            Level::TRACE,
            block = ?UsizePtr::from(block),
            slab = ?UsizePtr::from(slab)
        );

        (*block).next = (*slab).free_list;
        (*slab).free_list = block;
        (*slab).free_count += 1;

        // A full slab just became partial again. It fell off every list
        // when it drained, so the freeing thread adopts it now.
        if (*slab).free_count == 1 && slab != self.current_slab {
            (*slab).next = self.partial_slabs;
            self.partial_slabs = slab;
        }
    }

    /// Return every slab on this cache's lists to the system allocator
    ///
    /// Runs from the thread-local destructor on thread exit. Blocks parked
    /// in the fastbin are reclaimed together with the slabs that contain
    /// them; nothing is freed twice because each slab is on exactly one
    /// list.
    fn release_slabs(&mut self) {
        let trace_span = tracing::span!(Level::TRACE, "allocator::teardown");
        let _span_enter = trace_span.enter();

        for head in [self.current_slab, self.partial_slabs] {
            let mut slab = head;
            while !slab.is_null() {
                // safety: slabs on our lists are held exclusively by this
                // cache and nobody frees them but us
                unsafe {
                    let next = (*slab).next;
                    let raw = (*slab).raw_allocation;
                    tracing::event!(
                        Level::TRACE,
                        slab = ?UsizePtr::from(slab),
                        raw = ?UsizePtr::from(raw)
                    );
                    alloc::dealloc(raw, SLAB_BACKING_LAYOUT);
                    slab = next;
                }
            }
        }
        self.current_slab = ptr::null_mut();
        self.partial_slabs = ptr::null_mut();
        self.fastbin = ptr::null_mut();
        self.fastbin_count = 0;
    }

    /// Walk every list and validate the bookkeeping: each slab's
    /// `free_count` matches the length of its chain and its header
    /// self-describes, and the fastbin length matches `fastbin_count` and
    /// respects the cap. Panics on violation.
    ///
    /// Test support, not part of the allocation paths.
    pub fn _debug_check_consistency(&self) {
        let mut n = 0usize;
        let mut block = self.fastbin;
        while !block.is_null() {
            n += 1;
            assert!(n <= BLOCK_CACHE_LIMIT, "fastbin chain exceeds cap");
            block = unsafe { (*block).next };
        }
        assert_eq!(n, self.fastbin_count);

        for head in [self.current_slab, self.partial_slabs] {
            let mut slab = head;
            while !slab.is_null() {
                unsafe {
                    let mut chain = 0usize;
                    let mut b = (*slab).free_list;
                    while !b.is_null() {
                        chain += 1;
                        assert!(chain <= EFFECTIVE_BLOCKS, "free chain exceeds slab");
                        b = (*b).next;
                    }
                    assert_eq!(
                        chain,
                        (*slab).free_count,
                        "free_count mismatch on {:?}",
                        UsizePtr::from(slab)
                    );
                    assert_eq!((*slab).this, slab);
                    assert_eq!((*slab).mem, slab as *mut u8);
                    slab = (*slab).next;
                }
            }
        }
    }
}

impl Drop for ThreadCache {
    fn drop(&mut self) {
        self.release_slabs();
    }
}

thread_local! {
    /// Built on a thread's first alloc or free; dropped (returning every
    /// held slab to the system allocator) when the thread exits.
    static THREAD_CACHE: UnsafeCell<ThreadCache> = UnsafeCell::new(ThreadCache::new());
}

/// Acquire one [BLOCK_SIZE]-byte block for the calling thread
///
/// Returns `None` when the system allocator refuses to back a fresh slab.
/// The first call on a thread builds that thread's cache; a threading
/// runtime that cannot do so (or a call after the cache was already torn
/// down at thread exit) is fatal.
pub fn alloc() -> Option<NonNull<u8>> {
    THREAD_CACHE.with(|cache| {
        // safety: the cache is only ever touched from its own thread, and
        // nothing in the engine re-enters the thread-local
        unsafe { (*cache.get()).alloc() }
    })
}

/// Release a block previously returned by [alloc], from any thread
///
/// # Safety
///
/// `ptr` must have been returned by [alloc] in this process and not freed
/// since. Double frees, foreign pointers, and interior pointers are
/// undefined behavior, as is releasing a block whose allocating thread has
/// already exited while the block's slab was still on that thread's lists.
pub unsafe fn free(ptr: NonNull<u8>) {
    THREAD_CACHE.with(|cache| {
        // safety: same single-thread access as alloc; the pointer contract
        // is the caller's
        unsafe { (*cache.get()).free(ptr) }
    })
}
