use std::ptr::{self, NonNull};

use crate::{
    chunk::{CHUNK_HEADER_SIZE, Chunk, Header, round_to_alignment},
    error::HeapError,
    heap::{Heap, recover},
    kernel::PlatformMemory,
};

impl<G: PlatformMemory> Heap<G> {
    /// Changes the size of the block behind `ptr` to `new_size` bytes and returns
    /// where it lives now. The first `min(old, new)` bytes are preserved.
    ///
    /// - A null `ptr` is the same as [`Heap::allocate`].
    /// - A `new_size` of zero is the same as [`Heap::deallocate`] and returns null.
    /// - If no memory is left, null is returned and the old block is left as it was.
    ///
    /// A failure to grow the region is fatal and aborts the process, see
    /// [`Heap::try_resize`] to handle it.
    ///
    /// # Safety
    ///
    /// Same contract as [`Heap::deallocate`].
    pub unsafe fn resize(&mut self, ptr: *mut u8, new_size: usize) -> *mut u8 {
        match unsafe { self.try_resize(ptr, new_size) } {
            Ok(Some(payload)) => payload.as_ptr(),
            Ok(None) => ptr::null_mut(),
            Err(err) => recover(err),
        }
    }

    /// Fallible version of [`Heap::resize`].
    ///
    /// # Safety
    ///
    /// Same contract as [`Heap::deallocate`].
    pub unsafe fn try_resize(
        &mut self,
        ptr: *mut u8,
        new_size: usize,
    ) -> Result<Option<NonNull<u8>>, HeapError> {
        let Some(payload) = NonNull::new(ptr) else {
            return self.try_allocate(new_size);
        };

        if new_size == 0 {
            unsafe { self.deallocate(ptr) };
            return Ok(None);
        }

        let Some(chunk) = (unsafe { self.chunk_of(payload) }) else {
            return Ok(None);
        };
        if !chunk.is_used() {
            log::warn!("resize of a chunk already freed: {ptr:p}");
            return Ok(None);
        }
        if new_size > Header::MAX_SIZE {
            return Err(HeapError::TooLarge { requested: new_size });
        }

        let size = round_to_alignment(new_size);
        let old_size = chunk.size();

        if size <= old_size {
            self.release_tail(chunk, size);
            trace!("resize({ptr:p}, {new_size}) shrank in place");
            return Ok(Some(payload));
        }

        if self.grow_in_place(chunk, size) {
            trace!("resize({ptr:p}, {new_size}) grew in place");
            return Ok(Some(payload));
        }

        let Some(moved) = self.try_allocate(new_size)? else {
            return Ok(None);
        };

        unsafe {
            ptr::copy_nonoverlapping(payload.as_ptr(), moved.as_ptr(), old_size.min(new_size));
            self.deallocate(ptr);
        }

        trace!("resize({ptr:p}, {new_size}) moved to {moved:p}");

        Ok(Some(moved))
    }

    /// Absorbs the physical successor of `chunk` if it is free and big enough to
    /// reach `size` bytes, giving the excess back.
    fn grow_in_place(&mut self, chunk: Chunk, size: usize) -> bool {
        let Some(next) = chunk.next() else {
            return false;
        };
        if next.is_used() || chunk.size() + CHUNK_HEADER_SIZE + next.size() < size {
            return false;
        }

        self.free_list.remove(next);
        chunk.merge(next);
        self.release_tail(chunk, size);

        true
    }

    /// Cuts the used `chunk` down to `size` bytes and frees whatever is left, merging
    /// it with a free successor so no two free chunks end up adjacent.
    fn release_tail(&mut self, chunk: Chunk, size: usize) {
        let Some(rest) = chunk.split(size) else {
            return;
        };

        if let Some(next) = rest.next() {
            if !next.is_used() {
                self.free_list.remove(next);
                rest.merge(next);
            }
        }

        self.free_list.insert(rest);
    }
}
