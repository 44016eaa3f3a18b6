use std::ptr::NonNull;

use crate::{config::Config, error::HeapError};

/// This trait provides an abstraction over the primitive that grows the heap's
/// linear region. As the allocator, our top level view of this has nothing to do
/// with the concrete syscalls offered by each kernel.
///
/// # Safety
///
/// Implementors must hand out memory that is aligned to [`crate::ALIGNMENT`], at
/// least `len` bytes long, readable and writable, not in use by anybody else, and
/// that stays valid for as long as the implementor is alive. Consecutive requests
/// may or may not be adjacent.
pub unsafe trait PlatformMemory {
    /// Extends the region by `len` bytes. It returns a pointer to the start of the
    /// new span or `None` if the platform refuses.
    fn request_memory(&mut self, len: usize) -> Option<NonNull<u8>>;
}

/// Returns the number of payload bytes the next growth needs to hold `requested`:
/// the smallest multiple of [`Config::expansion_size`] strictly bigger than it.
///
/// Fails with [`HeapError::TooLarge`] when that multiple would not fit in a single
/// chunk.
pub fn growth_increment(requested: usize, config: &Config) -> Result<usize, HeapError> {
    let unit = config.expansion_size;

    (requested / unit)
        .checked_add(1)
        .and_then(|units| units.checked_mul(unit))
        .filter(|&increment| increment <= config.max_chunk_size())
        .ok_or(HeapError::TooLarge { requested })
}

/// The process-wide growable region given by the operating system.
///
/// On unix this is the program break, moved with [`libc::sbrk`]. On windows there is
/// no such thing, so we reserve a big range of address space the first time and
/// commit it piece by piece, which gives us the same linear growth.
///
/// There should only be one heap built over `SystemBreak` per process. Memory taken
/// from it is never given back.
pub struct SystemBreak {
    #[cfg(windows)]
    base: usize,
    #[cfg(windows)]
    committed: usize,
}

impl SystemBreak {
    pub const fn new() -> Self {
        Self {
            #[cfg(windows)]
            base: 0,
            #[cfg(windows)]
            committed: 0,
        }
    }
}

impl Default for SystemBreak {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
mod unix {
    use super::{PlatformMemory, SystemBreak};
    use crate::{chunk::ALIGNMENT, utils::align};

    use libc::{c_void, intptr_t, sbrk};
    use std::ptr::NonNull;

    /// Value returned by `sbrk` on failure.
    const SBRK_FAILED: *mut c_void = usize::MAX as *mut c_void;

    unsafe impl PlatformMemory for SystemBreak {
        fn request_memory(&mut self, len: usize) -> Option<NonNull<u8>> {
            unsafe {
                let current = sbrk(0);
                if current == SBRK_FAILED {
                    return None;
                }

                // Somebody else may have left the break unaligned.
                let padding = align(current as usize, ALIGNMENT) - current as usize;
                let total = len.checked_add(padding)?;
                if total > intptr_t::MAX as usize {
                    return None;
                }

                let addr = sbrk(total as intptr_t);
                if addr == SBRK_FAILED {
                    return None;
                }

                // The break may have moved since we looked at it, so align the span we
                // actually got and top it up if the padding guess was short.
                let (start, missing) = place(addr as usize, total, len);
                if missing > 0 {
                    let more = sbrk(missing as intptr_t);
                    if more as usize != addr as usize + total {
                        return None;
                    }
                }

                NonNull::new(start as *mut u8)
            }
        }
    }

    /// Start of an aligned span of `len` bytes inside the `reserved` bytes found at
    /// `returned`, and how many bytes past their end it still needs.
    fn place(returned: usize, reserved: usize, len: usize) -> (usize, usize) {
        let start = align(returned, ALIGNMENT);
        (start, (start + len).saturating_sub(returned + reserved))
    }

    #[cfg(test)]
    mod tests {
        use super::place;

        #[test]
        fn aligned_break_needs_nothing_more() {
            assert_eq!((0x1000, 0), place(0x1000, 64, 64));
            // Padding computed from the same break it was applied to.
            assert_eq!((0x1010, 0), place(0x1008, 72, 64));
        }

        #[test]
        fn moved_break_is_topped_up() {
            // We saw an aligned break but got an unaligned one.
            assert_eq!((0x1010, 8), place(0x1008, 64, 64));
            // We padded by 8 for a break that moved to 0x1004 meanwhile.
            assert_eq!((0x1010, 4), place(0x1004, 72, 64));
        }
    }
}

#[cfg(windows)]
mod windows {
    use super::{PlatformMemory, SystemBreak};

    use std::{os::raw::c_void, ptr::NonNull};

    use windows::Win32::System::Memory;

    /// Address space reserved up front. The heap can't grow past it.
    const RESERVATION_SIZE: usize = 1 << 30;

    unsafe impl PlatformMemory for SystemBreak {
        fn request_memory(&mut self, len: usize) -> Option<NonNull<u8>> {
            unsafe {
                if self.base == 0 {
                    let addr = Memory::VirtualAlloc(
                        None,
                        RESERVATION_SIZE,
                        Memory::MEM_RESERVE,
                        Memory::PAGE_NOACCESS,
                    );
                    if addr.is_null() {
                        return None;
                    }
                    self.base = addr as usize;
                }

                if len > RESERVATION_SIZE - self.committed {
                    return None;
                }

                let start = self.base + self.committed;
                // Commit works on whole pages, committing a page twice is fine.
                let addr = Memory::VirtualAlloc(
                    Some(start as *const c_void),
                    len,
                    Memory::MEM_COMMIT,
                    Memory::PAGE_READWRITE,
                );
                if addr.is_null() {
                    return None;
                }

                self.committed += len;
                NonNull::new(start as *mut u8)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KIB: usize = 1024;

    #[test]
    fn increment_is_strictly_bigger() {
        let config = Config::default();

        assert_eq!(Ok(128 * KIB), growth_increment(16, &config));
        assert_eq!(Ok(128 * KIB), growth_increment(128 * KIB - 16, &config));
        assert_eq!(Ok(256 * KIB), growth_increment(128 * KIB, &config));
        assert_eq!(Ok(384 * KIB), growth_increment(300 * KIB, &config));
    }

    #[test]
    fn increment_is_capped() {
        let config = Config::default();
        let max = config.max_chunk_size();

        assert_eq!(Ok(max), growth_increment(max - 1, &config));
        assert_eq!(
            Err(HeapError::TooLarge { requested: max }),
            growth_increment(max, &config)
        );
        assert!(growth_increment(usize::MAX, &config).is_err());
    }

    #[test]
    fn increment_follows_config() {
        let config = Config::new().with_expansion_size(4096);

        assert_eq!(Ok(4096), growth_increment(64, &config));
        assert_eq!(Ok(8192), growth_increment(4096, &config));
    }
}
