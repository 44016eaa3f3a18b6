use crate::chunk::{Chunk, SIZE_CLASSES, size_class};

/// Segregated lists of free [`Chunk`].
///
/// There is one doubly linked list per size class. The list nodes are the free
/// chunks themselves and the links live in their footers, so the allocator doesn't
/// need any storage of its own to keep track of them:
///
/// ```text
///  classes
/// +---+
/// | 0 | -> [16] <-> [16] <-> [16]
/// +---+
/// | 1 | -> [32]
/// +---+
/// |...|
/// +---+
/// | 8 | -> [208] <-> [144] <-> [256]
/// +---+
/// | 9 | -> [4096] <-> [131040] <-> [512]
/// +---+
/// ```
///
/// Classes 0 to 7 hold a single payload size each, so their first chunk is always an
/// exact fit. Classes 8 and 9 mix sizes and are searched with best-fit.
pub(crate) struct FreeList {
    /// First chunk of every class.
    classes: [Option<Chunk>; SIZE_CLASSES],
    /// Sum of the payload sizes of every chunk in the lists.
    free_bytes: usize,
}

/// Iterator over the chunks of one class, following the footer links.
pub(crate) struct Links {
    current: Option<Chunk>,
}

impl FreeList {
    pub const fn new() -> Self {
        Self {
            classes: [None; SIZE_CLASSES],
            free_bytes: 0,
        }
    }

    #[inline]
    pub fn free_bytes(&self) -> usize {
        self.free_bytes
    }

    #[inline]
    pub fn first(&self, class: usize) -> Option<Chunk> {
        self.classes[class]
    }

    pub fn links(&self, class: usize) -> Links {
        Links {
            current: self.classes[class],
        }
    }

    /// Pushes `chunk` at the front of its class list.
    pub fn insert(&mut self, chunk: Chunk) {
        let class = size_class(chunk.size());
        let first = self.classes[class];

        chunk.write_footer(None, first);
        if let Some(first) = first {
            first.write_footer(Some(chunk), first.next_link());
        }

        self.classes[class] = Some(chunk);
        self.free_bytes += chunk.size();
    }

    /// Unlinks `chunk` from its class list. Only the footers of its list neighbours
    /// are rewritten, nothing is scanned.
    pub fn remove(&mut self, chunk: Chunk) {
        let prev = chunk.prev_link();
        let next = chunk.next_link();

        if let Some(prev) = prev {
            prev.write_footer(prev.prev_link(), next);
        }
        if let Some(next) = next {
            next.write_footer(prev, next.next_link());
        }

        let class = size_class(chunk.size());
        if self.classes[class] == Some(chunk) {
            self.classes[class] = next;
        }

        self.free_bytes -= chunk.size();
    }

    /// Returns a free chunk with at least `size` bytes of payload, if any.
    ///
    /// `size` must already be aligned. The search starts at the class of `size` and
    /// walks up, so the first hit is also the smallest class that can serve it.
    pub fn find(&self, size: usize) -> Option<Chunk> {
        (size_class(size)..SIZE_CLASSES).find_map(|class| {
            if class < 8 {
                self.first(class)
            } else {
                self.best_fit(class, size)
            }
        })
    }

    /// Smallest chunk of `class` that can hold `size`, stopping early on an exact match.
    fn best_fit(&self, class: usize, size: usize) -> Option<Chunk> {
        let mut best: Option<Chunk> = None;

        for chunk in self.links(class) {
            let chunk_size = chunk.size();
            if chunk_size < size {
                continue;
            }
            if chunk_size == size {
                return Some(chunk);
            }
            if best.is_none_or(|best| chunk_size < best.size()) {
                best = Some(chunk);
            }
        }

        best
    }
}

impl Iterator for Links {
    type Item = Chunk;

    fn next(&mut self) -> Option<Self::Item> {
        let chunk = self.current?;
        self.current = chunk.next_link();
        Some(chunk)
    }
}
