use std::ptr::{self, NonNull};

use crate::{
    chunk::{ALIGNMENT, CHUNK_HEADER_SIZE, Chunk, Header, round_to_alignment},
    config::Config,
    error::HeapError,
    freelist::FreeList,
    kernel::{PlatformMemory, SystemBreak, growth_increment},
    utils::is_aligned,
};

/// Segregated free-list allocator over a growable linear region.
///
/// The region is obtained from a [`PlatformMemory`] in steps of
/// [`Config::expansion_size`] and carved into chunks. Each grown span starts as a
/// single free chunk:
///
/// ```text
///   base                                                      region end
///    |                                                             |
///    v                                                             v
///    +--------+---------+--------+--------+--------+---------------+
///    | header | payload | header | payload| header |    payload    |
///    |  used  |         |  free  |  ...   |  used  |   ... last    |
///    +--------+---------+--------+--------+--------+---------------+
///                            |
///                            +---> size class list (links in its footer)
/// ```
///
/// Free chunks are kept in ten lists by size (see [`crate::size_class`]) and two free
/// chunks are never left next to each other: they're merged as soon as one of them
/// is released.
///
/// The heap assumes exclusive access for the whole duration of every call. To share
/// it between threads, wrap it in a mutex (see [`crate::MemAlloc`]).
pub struct Heap<G: PlatformMemory = SystemBreak> {
    /// Lists of free chunks by size class.
    pub(crate) free_list: FreeList,
    /// Start of the first region, `None` until the first growth.
    pub(crate) base: Option<NonNull<u8>>,
    /// End of the most recent region.
    pub(crate) end: usize,
    /// Whether every region was placed right after the previous one.
    pub(crate) contiguous: bool,
    /// Number of times the heap grew.
    pub(crate) regions: usize,
    /// Payload bytes created by growth.
    pub(crate) size: usize,
    /// Bytes obtained from the platform, headers included.
    pub(crate) obtained: usize,
    config: Config,
    platform: G,
}

// The heap owns every chunk it points to.
unsafe impl<G: PlatformMemory + Send> Send for Heap<G> {}

impl Heap<SystemBreak> {
    /// Creates a heap over the program break. Nothing is requested from the
    /// operating system until the first allocation.
    pub const fn new() -> Self {
        Self::with_platform(SystemBreak::new())
    }
}

impl Default for Heap<SystemBreak> {
    fn default() -> Self {
        Self::new()
    }
}

impl<G: PlatformMemory> Heap<G> {
    pub const fn with_platform(platform: G) -> Self {
        Self {
            free_list: FreeList::new(),
            base: None,
            end: 0,
            contiguous: true,
            regions: 0,
            size: 0,
            obtained: 0,
            config: Config::new(),
            platform,
        }
    }

    pub fn with_config(platform: G, config: Config) -> Result<Self, HeapError> {
        config.validate()?;

        Ok(Self {
            config,
            ..Self::with_platform(platform)
        })
    }

    #[inline]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[inline]
    pub fn platform(&self) -> &G {
        &self.platform
    }

    /// Payload bytes currently sitting in the free lists.
    #[inline]
    pub fn free_bytes(&self) -> usize {
        self.free_list.free_bytes()
    }

    /// Payload bytes added by every growth so far.
    #[inline]
    pub fn region_size(&self) -> usize {
        self.size
    }

    /// Bytes obtained from the platform so far, chunk headers included.
    #[inline]
    pub fn obtained_bytes(&self) -> usize {
        self.obtained
    }

    /// Allocates at least `size` bytes aligned to [`ALIGNMENT`].
    ///
    /// Returns null if `size` is zero or if no memory is left. A failure to grow the
    /// region is fatal and aborts the process, see [`Heap::try_allocate`] to handle it.
    pub fn allocate(&mut self, size: usize) -> *mut u8 {
        match self.try_allocate(size) {
            Ok(Some(payload)) => payload.as_ptr(),
            Ok(None) => ptr::null_mut(),
            Err(err) => recover(err),
        }
    }

    /// Allocates at least `size` bytes aligned to [`ALIGNMENT`], `Ok(None)` if `size`
    /// is zero.
    pub fn try_allocate(&mut self, size: usize) -> Result<Option<NonNull<u8>>, HeapError> {
        if size == 0 {
            return Ok(None);
        }
        if size > Header::MAX_SIZE {
            return Err(HeapError::TooLarge { requested: size });
        }

        let size = round_to_alignment(size);

        if self.obtained == 0 {
            self.grow(size)?;
        }

        let chunk = match self.free_list.find(size) {
            Some(chunk) => chunk,
            None => {
                // One more growth must be enough, otherwise we give up.
                self.grow(size)?;
                self.free_list
                    .find(size)
                    .ok_or(HeapError::Exhausted { requested: size })?
            }
        };

        self.free_list.remove(chunk);
        chunk.set_used(true);

        if let Some(rest) = chunk.split(size) {
            trace!("split {:p}: {size} + {}", chunk.as_ptr(), rest.size());
            self.free_list.insert(rest);
        }
        if let Some(next) = chunk.next() {
            next.set_prev_used(true);
        }

        trace!("allocate({size}) -> {:p}", chunk.payload());

        Ok(Some(chunk.payload()))
    }

    /// Releases the memory behind `ptr`. Null is ignored.
    ///
    /// Releasing a chunk twice is reported and otherwise ignored. Pointers that can't
    /// come from this heap because they are misaligned are reported and ignored too.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a pointer returned by this heap. Any other pointer is
    /// undefined behaviour.
    pub unsafe fn deallocate(&mut self, ptr: *mut u8) {
        let Some(payload) = NonNull::new(ptr) else {
            return;
        };
        let Some(mut chunk) = (unsafe { self.chunk_of(payload) }) else {
            return;
        };

        if !chunk.is_used() {
            log::warn!("chunk already freed: {ptr:p}");
            return;
        }

        let prev = chunk.prev_if_free();
        let next = chunk.next();

        chunk.set_used(false);

        if let Some(next) = next {
            next.set_prev_used(false);

            if !next.is_used() {
                self.free_list.remove(next);
                chunk.merge(next);
            }
        }

        if let Some(prev) = prev {
            self.free_list.remove(prev);
            prev.merge(chunk);
            chunk = prev;
        }

        self.free_list.insert(chunk);

        trace!("deallocate({ptr:p}) -> free chunk of {}", chunk.size());
    }

    /// Locates the chunk of a payload handed out by us.
    ///
    /// # Safety
    ///
    /// `payload` must be a pointer returned by this heap unless it is misaligned or the
    /// heap never grew, which are the only cases we can detect.
    pub(crate) unsafe fn chunk_of(&self, payload: NonNull<u8>) -> Option<Chunk> {
        if self.obtained == 0 || !is_aligned(payload.as_ptr() as usize, ALIGNMENT) {
            log::warn!("pointer {payload:p} was not allocated by this heap");
            return None;
        }

        Some(unsafe { Chunk::from_payload(payload) })
    }

    /// Grows the region so that a chunk of at least `size` bytes becomes free.
    pub(crate) fn grow(&mut self, size: usize) -> Result<(), HeapError> {
        let increment = growth_increment(size, &self.config)?;
        let len = increment + CHUNK_HEADER_SIZE;

        let addr = self
            .platform
            .request_memory(len)
            .ok_or(HeapError::GrowthFailed { len })?;
        debug_assert!(is_aligned(addr.as_ptr() as usize, ALIGNMENT));

        let header = Header {
            size: increment,
            used: false,
            last: true,
            prev_used: true,
        };
        let chunk = unsafe { Chunk::init(addr, header) };

        let start = addr.as_ptr() as usize;
        if self.base.is_none() {
            self.base = Some(addr);
        } else if start != self.end {
            self.contiguous = false;
        }

        self.end = start + len;
        self.regions += 1;
        self.size += increment;
        self.obtained += len;

        self.free_list.insert(chunk);

        log::debug!("heap grew by {len} bytes at {addr:p}, {} bytes in total", self.obtained);

        Ok(())
    }
}

/// Turns an error of the `try_` API into the null-returning contract: exhaustion
/// becomes null, anything else terminates the process.
pub(crate) fn recover(err: HeapError) -> *mut u8 {
    if err.is_fatal() {
        log::error!("{err}");
        std::process::abort();
    }

    log::warn!("{err}");
    ptr::null_mut()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{arena::Arena, chunk::MIN_CHUNK_SIZE};

    use test_log::test;

    pub(crate) const KIB: usize = 1024;

    /// Heap over an arena with a small expansion unit, so growth is easy to trigger.
    pub(crate) fn small_heap(capacity: usize) -> Heap<Arena> {
        let config = Config::new().with_expansion_size(KIB);
        Heap::with_config(Arena::new(capacity), config).unwrap()
    }

    #[test]
    fn zero_size_returns_null() {
        let mut heap = small_heap(16 * KIB);

        assert!(heap.allocate(0).is_null());
        // No growth happened.
        assert_eq!(0, heap.obtained_bytes());
    }

    #[test]
    fn first_allocation_grows_the_heap() {
        let mut heap = small_heap(16 * KIB);

        let ptr = heap.allocate(10);
        assert!(!ptr.is_null());
        assert!(heap.platform().contains(ptr));

        assert_eq!(KIB + CHUNK_HEADER_SIZE, heap.obtained_bytes());
        assert_eq!(KIB, heap.region_size());
        // 16 bytes used, the rest of the region was split off.
        assert_eq!(KIB - MIN_CHUNK_SIZE - CHUNK_HEADER_SIZE, heap.free_bytes());
    }

    #[test]
    fn allocations_are_laid_out_in_order() {
        let mut heap = small_heap(16 * KIB);

        let a = heap.allocate(32);
        let b = heap.allocate(64);
        let c = heap.allocate(1);

        assert_eq!(a as usize + 32 + CHUNK_HEADER_SIZE, b as usize);
        assert_eq!(b as usize + 64 + CHUNK_HEADER_SIZE, c as usize);
    }

    #[test]
    fn same_size_reuses_the_address() {
        let mut heap = small_heap(16 * KIB);

        let a = heap.allocate(64);
        unsafe { heap.deallocate(a) };
        let b = heap.allocate(64);

        assert_eq!(a, b);
    }

    #[test]
    fn exact_class_is_reused_before_splitting() {
        let mut heap = small_heap(16 * KIB);

        let a = heap.allocate(48);
        let _guard = heap.allocate(16);
        unsafe { heap.deallocate(a) };

        let b = heap.allocate(40);
        assert_eq!(a, b);
    }

    #[test]
    fn no_split_below_threshold() {
        let mut heap = small_heap(16 * KIB);

        let a = heap.allocate(64);
        let _guard = heap.allocate(16);
        unsafe { heap.deallocate(a) };

        // 64 - 48 = 16 bytes left over: too small to become a chunk, so the whole
        // 64 byte chunk is handed out.
        let free_before = heap.free_bytes();
        let b = heap.allocate(48);
        assert_eq!(a, b);
        assert_eq!(free_before - 64, heap.free_bytes());
    }

    #[test]
    fn grows_again_when_nothing_fits() {
        let mut heap = small_heap(16 * KIB);

        let a = heap.allocate(900);
        let b = heap.allocate(900);

        assert!(!a.is_null() && !b.is_null());
        assert_eq!(2, heap.regions);
        // The region is sized for the request: the smallest multiple of 1 KiB above 900.
        assert_eq!(2 * (KIB + CHUNK_HEADER_SIZE), heap.obtained_bytes());

        let big = heap.allocate(3000);
        assert!(!big.is_null());
        assert_eq!(3, heap.regions);
        assert_eq!(2 * KIB + 3 * KIB + 3 * CHUNK_HEADER_SIZE, heap.obtained_bytes());
    }

    #[test]
    fn failed_growth_is_reported() {
        let mut heap = small_heap(2 * KIB);

        assert!(heap.try_allocate(100).unwrap().is_some());
        assert_eq!(
            Err(HeapError::GrowthFailed { len: KIB + CHUNK_HEADER_SIZE }),
            heap.try_allocate(1000)
        );
    }

    #[test]
    fn oversized_request_is_too_large() {
        let mut heap = small_heap(2 * KIB);

        let max = heap.config().max_chunk_size();
        assert_eq!(Err(HeapError::TooLarge { requested: max }), heap.try_allocate(max));
        assert_eq!(
            Err(HeapError::TooLarge { requested: usize::MAX }),
            heap.try_allocate(usize::MAX)
        );
        assert_eq!(0, heap.obtained_bytes());
    }

    #[test]
    fn free_merges_with_both_neighbours() {
        let mut heap = small_heap(16 * KIB);

        let a = heap.allocate(32);
        let b = heap.allocate(32);
        let c = heap.allocate(32);
        let _guard = heap.allocate(32);
        let free_before = heap.free_bytes();

        unsafe {
            heap.deallocate(a);
            heap.deallocate(c);
            // Merging with both sides gives one chunk of three payloads and two headers.
            heap.deallocate(b);
        }

        assert_eq!(free_before + 96 + 2 * CHUNK_HEADER_SIZE, heap.free_bytes());
        let merged = heap.allocate(96 + 2 * CHUNK_HEADER_SIZE);
        assert_eq!(a, merged);
    }

    #[test]
    fn free_merges_with_the_tail() {
        let mut heap = small_heap(16 * KIB);

        let a = heap.allocate(100);
        unsafe { heap.deallocate(a) };

        // Everything is back to one free chunk covering the whole region.
        assert_eq!(KIB, heap.free_bytes());
        assert_eq!(a, heap.allocate(KIB));
    }

    #[test]
    fn double_free_is_ignored() {
        let mut heap = small_heap(16 * KIB);

        let a = heap.allocate(64);
        let _b = heap.allocate(64);
        unsafe {
            heap.deallocate(a);
            let free = heap.free_bytes();
            heap.deallocate(a);
            assert_eq!(free, heap.free_bytes());
        }
    }

    #[test]
    fn null_and_misaligned_pointers_are_ignored() {
        let mut heap = small_heap(16 * KIB);

        unsafe { heap.deallocate(ptr::null_mut()) };

        let a = heap.allocate(64);
        let free = heap.free_bytes();
        unsafe { heap.deallocate(a.add(3)) };
        assert_eq!(free, heap.free_bytes());
    }

    #[test]
    fn rejects_invalid_config() {
        let config = Config::new().with_expansion_size(100);
        assert!(Heap::with_config(Arena::new(KIB), config).is_err());
    }

    #[test]
    fn exhaustion_maps_to_null() {
        assert!(recover(HeapError::Exhausted { requested: 16 }).is_null());
    }
}
