//! Read-only views over the heap, used to check its invariants.

use std::{fmt, ptr::NonNull};

use crate::{
    chunk::{CHUNK_HEADER_SIZE, Chunk, Header, SIZE_CLASSES, size_class},
    heap::Heap,
    kernel::PlatformMemory,
};

/// A chunk as seen by [`Heap::chunks`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkInfo {
    /// Address of the chunk header.
    pub addr: usize,
    pub header: Header,
}

impl ChunkInfo {
    /// Address of the payload, what the caller got from the allocator.
    pub fn payload(&self) -> usize {
        self.addr + CHUNK_HEADER_SIZE
    }
}

/// Physical walk over every chunk, in address order.
pub struct Chunks<'a, G: PlatformMemory> {
    heap: &'a Heap<G>,
    current: Option<Chunk>,
}

impl<G: PlatformMemory> Iterator for Chunks<'_, G> {
    type Item = ChunkInfo;

    fn next(&mut self) -> Option<Self::Item> {
        let chunk = self.current?;

        self.current = match chunk.next() {
            Some(next) => Some(next),
            // The last chunk of a region. If the next region was placed right after
            // it, keep going from there.
            None if self.heap.contiguous && chunk.end() < self.heap.end => unsafe {
                Some(Chunk::from_addr(NonNull::new_unchecked(chunk.end() as *mut u8)))
            },
            None => None,
        };

        Some(ChunkInfo {
            addr: chunk.addr(),
            header: chunk.header(),
        })
    }
}

/// Summary of the heap built by walking every chunk.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    pub regions: usize,
    pub chunks: usize,
    pub used_chunks: usize,
    pub free_chunks: usize,
    /// Payload bytes handed out to callers.
    pub used_bytes: usize,
    /// Payload bytes of free chunks.
    pub free_bytes: usize,
    /// Bytes obtained from the platform, headers included.
    pub obtained_bytes: usize,
}

/// A broken heap invariant, found by [`Heap::verify`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Corruption {
    /// Chunk where the problem was found, `0` when it is about the whole heap.
    pub addr: usize,
    pub reason: &'static str,
}

impl fmt::Display for Corruption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "heap corrupted at {:#x}: {}", self.addr, self.reason)
    }
}

impl std::error::Error for Corruption {}

impl<G: PlatformMemory> Heap<G> {
    /// Walks every chunk of the heap in address order.
    ///
    /// Regions are only walked across while they were placed back to back. If the
    /// platform ever returned a span that doesn't follow the previous one (someone
    /// else moved the program break in between) the walk stops at the first gap.
    pub fn chunks(&self) -> Chunks<'_, G> {
        Chunks {
            heap: self,
            current: self.base.map(|base| unsafe { Chunk::from_addr(base) }),
        }
    }

    /// Number of chunks in each free list.
    pub fn class_lengths(&self) -> [usize; SIZE_CLASSES] {
        std::array::from_fn(|class| self.free_list.links(class).count())
    }

    /// Walks the whole heap and the free lists, checking that:
    ///
    /// - chunks tile the obtained memory: payloads plus headers add up to what the
    ///   platform gave us,
    /// - every `prev_used` flag matches its predecessor,
    /// - no two free chunks are adjacent,
    /// - every free chunk is in the list of its size class and nothing else is.
    pub fn verify(&self) -> Result<HeapStats, Corruption> {
        let fail = |addr, reason| Err(Corruption { addr, reason });

        if !self.contiguous {
            return fail(0, "regions are not contiguous, the heap can't be walked");
        }

        let mut stats = HeapStats::default();
        let mut prev: Option<ChunkInfo> = None;

        for info in self.chunks() {
            let header = info.header;
            stats.chunks += 1;
            stats.obtained_bytes += CHUNK_HEADER_SIZE + header.size;

            if header.used {
                stats.used_chunks += 1;
                stats.used_bytes += header.size;
            } else {
                stats.free_chunks += 1;
                stats.free_bytes += header.size;
            }

            match prev {
                // First chunk of a region.
                None => {
                    stats.regions += 1;
                    if !header.prev_used {
                        return fail(info.addr, "first chunk of a region follows a free chunk");
                    }
                }
                Some(prev) if prev.header.last => {
                    stats.regions += 1;
                    if !header.prev_used {
                        return fail(info.addr, "first chunk of a region follows a free chunk");
                    }
                }
                Some(prev) => {
                    if header.prev_used != prev.header.used {
                        return fail(info.addr, "prev_used doesn't match the previous chunk");
                    }
                    if !header.used && !prev.header.used {
                        return fail(info.addr, "two adjacent free chunks");
                    }
                }
            }

            prev = Some(info);
        }

        if stats.obtained_bytes != self.obtained {
            return fail(0, "chunks don't add up to the obtained memory");
        }
        if stats.regions != self.regions {
            return fail(0, "number of regions doesn't match the growths");
        }

        let mut listed = 0;
        for class in 0..SIZE_CLASSES {
            let mut prev_link = None;
            for chunk in self.free_list.links(class) {
                if chunk.is_used() {
                    return fail(chunk.addr(), "used chunk in a free list");
                }
                if size_class(chunk.size()) != class {
                    return fail(chunk.addr(), "chunk in the wrong size class");
                }
                if chunk.prev_link() != prev_link {
                    return fail(chunk.addr(), "broken back link in a free list");
                }
                prev_link = Some(chunk);
                listed += 1;
            }
        }

        if listed != stats.free_chunks {
            return fail(0, "free chunks missing from the free lists");
        }
        if stats.free_bytes != self.free_list.free_bytes() {
            return fail(0, "free byte counter is off");
        }

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        chunk::{CHUNK_HEADER_SIZE, SIZE_CLASSES},
        heap::tests::{KIB, small_heap},
    };

    use test_log::test;

    #[test]
    fn empty_heap_has_no_chunks() {
        let heap = small_heap(4 * KIB);

        assert_eq!(0, heap.chunks().count());
        let stats = heap.verify().unwrap();
        assert_eq!(0, stats.chunks);
        assert_eq!([0; SIZE_CLASSES], heap.class_lengths());
    }

    #[test]
    fn walk_sees_every_chunk() {
        let mut heap = small_heap(4 * KIB);

        let a = heap.allocate(16);
        let b = heap.allocate(200);
        let c = heap.allocate(16);
        unsafe { heap.deallocate(b) };

        let chunks: Vec<_> = heap.chunks().collect();
        assert_eq!(4, chunks.len());
        assert_eq!(a as usize, chunks[0].payload());
        assert_eq!(b as usize, chunks[1].payload());
        assert_eq!(c as usize, chunks[2].payload());
        assert!(chunks[0].header.used);
        assert!(!chunks[1].header.used);
        assert!(!chunks[2].header.prev_used);
        assert!(chunks[3].header.last);

        let stats = heap.verify().unwrap();
        assert_eq!(2, stats.used_chunks);
        assert_eq!(2, stats.free_chunks);
        assert_eq!(32, stats.used_bytes);
        assert_eq!(1, heap.class_lengths()[8]);
    }

    #[test]
    fn walk_crosses_contiguous_regions() {
        let mut heap = small_heap(8 * KIB);

        let _a = heap.allocate(1000);
        let _b = heap.allocate(1000);
        let _c = heap.allocate(2000);

        let stats = heap.verify().unwrap();
        assert_eq!(3, stats.regions);
        assert_eq!(heap.obtained_bytes(), stats.obtained_bytes);
        assert_eq!(
            heap.obtained_bytes(),
            stats.used_bytes + stats.free_bytes + stats.chunks * CHUNK_HEADER_SIZE
        );
    }

    #[test]
    fn detects_a_broken_flag() {
        let mut heap = small_heap(4 * KIB);

        let a = heap.allocate(32);
        let _b = heap.allocate(32);

        // Pretend `a` was freed without telling its successor.
        let chunk = heap.chunks().next().unwrap();
        let header = crate::Header { used: false, ..chunk.header };
        unsafe { (a.sub(CHUNK_HEADER_SIZE) as *mut u32).write(header.encode()) };

        assert!(heap.verify().is_err());
    }
}
