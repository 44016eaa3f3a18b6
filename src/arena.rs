use std::{
    alloc::{self, Layout},
    ptr::NonNull,
};

use crate::{chunk::ALIGNMENT, kernel::PlatformMemory, utils::align};

/// A fixed-size buffer that grows linearly, like a private program break.
///
/// Useful to run a [`crate::Heap`] inside memory the caller controls and to test the
/// allocator without touching the real program break. The buffer itself is taken
/// from the global allocator and given back when the arena is dropped, so a heap
/// over an `Arena` must not be the global allocator.
pub struct Arena {
    start: NonNull<u8>,
    capacity: usize,
    used: usize,
}

// The arena owns its buffer.
unsafe impl Send for Arena {}

impl Arena {
    /// Creates an arena able to hand out `capacity` bytes in total.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is too big to be described by a [`Layout`]. Aborts if the
    /// global allocator can't provide the buffer.
    pub fn new(capacity: usize) -> Self {
        let capacity = align(capacity, ALIGNMENT);
        if capacity == 0 {
            return Self {
                start: NonNull::dangling(),
                capacity,
                used: 0,
            };
        }

        let layout = Self::layout(capacity);
        let start = unsafe { alloc::alloc(layout) };

        match NonNull::new(start) {
            Some(start) => Self {
                start,
                capacity,
                used: 0,
            },
            None => alloc::handle_alloc_error(layout),
        }
    }

    fn layout(capacity: usize) -> Layout {
        Layout::from_size_align(capacity, ALIGNMENT).expect("arena capacity overflows a layout")
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes handed out so far.
    #[inline]
    pub fn used(&self) -> usize {
        self.used
    }

    /// Returns `true` if `addr` lies inside the part of the buffer handed out so far.
    pub fn contains(&self, addr: *const u8) -> bool {
        let start = self.start.as_ptr() as usize;
        (start..start + self.used).contains(&(addr as usize))
    }
}

unsafe impl PlatformMemory for Arena {
    fn request_memory(&mut self, len: usize) -> Option<NonNull<u8>> {
        let len = align(len, ALIGNMENT);
        if len > self.capacity - self.used {
            log::debug!("arena of {} bytes can't grow by {len}", self.capacity);
            return None;
        }

        let addr = unsafe { self.start.add(self.used) };
        self.used += len;

        Some(addr)
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        if self.capacity != 0 {
            unsafe { alloc::dealloc(self.start.as_ptr(), Self::layout(self.capacity)) }
        }
    }
}
