//! Segregated free-list memory allocator over a single growable region.
//!
//! Memory is taken from the operating system in big steps (the program break on
//! unix) and carved into chunks. Every chunk starts with a 16 byte header and free
//! chunks keep their free list links in a footer at the end of their own payload,
//! so the allocator needs no storage besides the heap itself:
//!
//! ```text
//! +--------+-----------------+--------+-----------------------------+
//! | header |  payload (used) | header |  payload (free)  | footer  |
//! +--------+-----------------+--------+-----------------------------+
//!                                                            |
//!                                       prev/next free chunk <+
//! ```
//!
//! Free chunks are spread over ten lists by size, so small requests are served in
//! constant time and big ones with a best-fit search. Freed chunks are merged with
//! free neighbours right away.
//!
//! The engine is [`Heap`]. It is single-threaded and its state lives in the
//! instance, nothing is global. [`MemAlloc`] puts a heap behind a mutex so it can be
//! installed as the `#[global_allocator]`:
//!
//! ```rust,ignore
//! use segalloc::MemAlloc;
//!
//! #[global_allocator]
//! static ALLOCATOR: MemAlloc = MemAlloc::new();
//! ```

use std::{
    alloc::{GlobalAlloc, Layout},
    ptr::{self, NonNull},
    sync::{Mutex, MutexGuard, PoisonError},
};

/// Per-operation tracing, only compiled in with the `trace` feature. It runs while
/// [`MemAlloc`] holds its lock.
macro_rules! trace {
    ($($arg:tt)*) => {
        #[cfg(feature = "trace")]
        {
            log::trace!($($arg)*);
        }
    };
}

mod arena;
mod chunk;
mod config;
mod error;
mod freelist;
mod heap;
mod inspect;
mod kernel;
mod realloc;
mod utils;

pub use arena::Arena;
pub use chunk::{
    ALIGNMENT, CHUNK_HEADER_SIZE, Header, MIN_CHUNK_SIZE, SIZE_CLASSES, round_to_alignment,
    size_class,
};
pub use config::{Config, EXPANSION_SIZE, MAX_CHUNK_SIZE};
pub use error::HeapError;
pub use heap::Heap;
pub use inspect::{ChunkInfo, Chunks, Corruption, HeapStats};
pub use kernel::{PlatformMemory, SystemBreak, growth_increment};

/// Global allocator built on a [`Heap`] over the program break.
///
/// Every call takes a lock, so the heap is never touched by two threads at once.
/// Alignments above [`ALIGNMENT`] can't be served and get null.
///
/// Requests the heap can never serve, like anything above [`MAX_CHUNK_SIZE`], get
/// null as well, so `try_reserve` and friends see an ordinary failure.
///
/// The heap logs growth and misuse through the [`log`] facade while the lock is held.
/// A logger that allocates for those records would wait for that same lock. The
/// per-operation `trace!` records are only emitted with the `trace` feature, which
/// should stay off when this is the global allocator.
pub struct MemAlloc {
    heap: Mutex<Heap<SystemBreak>>,
}

impl MemAlloc {
    pub const fn new() -> Self {
        Self {
            heap: Mutex::new(Heap::new()),
        }
    }

    fn heap(&self) -> MutexGuard<'_, Heap<SystemBreak>> {
        // The heap is consistent between calls, a panic elsewhere doesn't change that.
        self.heap.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MemAlloc {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl GlobalAlloc for MemAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return ptr::null_mut();
        }

        // The lock is released before any error gets logged.
        let result = self.heap().try_allocate(layout.size());
        match result {
            Ok(payload) => payload.map_or(ptr::null_mut(), NonNull::as_ptr),
            Err(err) => unserviceable(err),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        unsafe { self.heap().deallocate(ptr) }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return ptr::null_mut();
        }

        let result = unsafe { self.heap().try_resize(ptr, new_size) };
        match result {
            Ok(payload) => payload.map_or(ptr::null_mut(), NonNull::as_ptr),
            Err(err) => unserviceable(err),
        }
    }
}

/// A size no chunk can hold is the caller's problem and gets null. Everything else
/// keeps the usual null-or-abort contract.
fn unserviceable(err: HeapError) -> *mut u8 {
    match err {
        HeapError::TooLarge { .. } => {
            log::warn!("{err}");
            ptr::null_mut()
        }
        err => heap::recover(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refuses_big_alignments() {
        let allocator = MemAlloc::new();

        unsafe {
            let layout = Layout::from_size_align(64, 4096).unwrap();
            assert!(allocator.alloc(layout).is_null());
        }
    }

    #[test]
    fn oversized_layouts_get_null() {
        let allocator = MemAlloc::new();

        // None of these reach the platform, they're refused before growing.
        for size in [MAX_CHUNK_SIZE, Header::MAX_SIZE + 1, 1 << 30] {
            let layout = Layout::from_size_align(size, ALIGNMENT).unwrap();
            assert!(unsafe { allocator.alloc(layout) }.is_null(), "size {size}");
        }
        assert_eq!(0, allocator.heap().obtained_bytes());
    }
}
