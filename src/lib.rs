//! slabcache: a fixed-size-block slab allocator with thread-local caching.
//!
//! Serves 64-byte blocks out of per-thread slab caches, with a design that
//! borrows the thread-cache tiering of
//! [tcmalloc](https://google.github.io/tcmalloc/design.html) and the
//! aligned-region owner recovery of
//! [Mimalloc](https://www.microsoft.com/en-us/research/uploads/prod/2019/06/mimalloc-tr-v1.pdf):
//! every slab occupies a region aligned to its own size, so releasing a block
//! needs nothing but a bit-mask and one load to find the slab it came from.
//!
//! In the steady state neither [alloc] nor [free] performs any cross-thread
//! synchronization or reaches the system allocator; the system allocator is
//! only involved when a thread needs a fresh slab and when a thread exits and
//! its cache returns everything it owns.
//!
//! # Usage
//!
//! ```
//! let block = slabcache::alloc().expect("out of memory");
//! // block is writable for slabcache::BLOCK_SIZE bytes
//! unsafe { slabcache::free(block) };
//! ```

pub mod allocator;
pub mod util;

pub use allocator::{alloc, free, ThreadCache};
pub use allocator::{
    BLOCK_CACHE_LIMIT, BLOCK_CACHE_REFILL_LIMIT, BLOCK_COUNT, BLOCK_SIZE, EFFECTIVE_BLOCKS,
};
