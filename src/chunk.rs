use std::ptr::NonNull;

use crate::utils::align;

/// Alignment of every payload and every payload size, in bytes.
pub const ALIGNMENT: usize = 16;

/// Bytes taken by the [`Header`] in front of every payload.
///
/// Only the first 32-bit word carries information, the rest is padding that keeps
/// the payload aligned to [`ALIGNMENT`].
pub const CHUNK_HEADER_SIZE: usize = 16;

/// Smallest payload a chunk can have. A free chunk of this size still has room for
/// the compact footer.
pub const MIN_CHUNK_SIZE: usize = ALIGNMENT;

/// Number of segregated free lists.
pub const SIZE_CLASSES: usize = 10;

/// Low bit of the next-link word that marks the two-word footer of a 16 byte chunk.
const COMPACT_TAG: usize = 1;

/// Returns the free list a chunk with a payload of `size` bytes belongs to.
///
/// ```text
///  class | payload sizes
/// -------+---------------
///   0-7  | 16, 32, ..., 128 (one exact size per class)
///    8   | 144 ..= 256
///    9   | > 256
/// ```
#[inline]
pub const fn size_class(size: usize) -> usize {
    if size <= 128 {
        (size.saturating_sub(ALIGNMENT)) / ALIGNMENT
    } else if size <= 256 {
        8
    } else {
        9
    }
}

/// Rounds `size` up to a multiple of [`ALIGNMENT`], never below [`MIN_CHUNK_SIZE`].
#[inline]
pub const fn round_to_alignment(size: usize) -> usize {
    if size < MIN_CHUNK_SIZE {
        MIN_CHUNK_SIZE
    } else {
        align(size, ALIGNMENT)
    }
}

/// Decoded chunk header.
///
/// The header is stored as a single 32-bit word with an explicit layout, so
/// nothing depends on how a compiler would pack bitfields:
///
/// ```text
///  31                               8   7       6      5     4     0
/// +----------------------------------+-------+------+------+--------+
/// |          size (24 bits)          | prev  | last | used |  zero  |
/// |                                  | used  |      |      |        |
/// +----------------------------------+-------+------+------+--------+
/// ```
///
/// `size` is the payload size and always a multiple of [`ALIGNMENT`], so the largest
/// value the field holds is `0xFF_FFF0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Payload size in bytes.
    pub size: usize,
    /// The chunk is handed out to a caller.
    pub used: bool,
    /// The chunk has no physical successor.
    pub last: bool,
    /// Cached `used` flag of the physical predecessor.
    pub prev_used: bool,
}

impl Header {
    const USED: u32 = 1 << 5;
    const LAST: u32 = 1 << 6;
    const PREV_USED: u32 = 1 << 7;
    const SIZE_SHIFT: u32 = 8;

    /// Largest payload size the 24-bit field can represent.
    pub const MAX_SIZE: usize = 0xFF_FFFF & !(ALIGNMENT - 1);

    pub const fn encode(self) -> u32 {
        let mut word = ((self.size as u32) & 0xFF_FFFF) << Self::SIZE_SHIFT;
        if self.used {
            word |= Self::USED;
        }
        if self.last {
            word |= Self::LAST;
        }
        if self.prev_used {
            word |= Self::PREV_USED;
        }
        word
    }

    pub const fn decode(word: u32) -> Self {
        Self {
            size: (word >> Self::SIZE_SHIFT) as usize,
            used: word & Self::USED != 0,
            last: word & Self::LAST != 0,
            prev_used: word & Self::PREV_USED != 0,
        }
    }
}

/// Handle to a chunk living inside the heap's region.
///
/// This is the only place where the allocator does raw pointer arithmetic. A `Chunk`
/// can only be built through its `unsafe` constructors, whose contract is that the
/// address points at a chunk header inside memory owned by the heap. Every other
/// method relies on that contract, which is why they are safe to call.
///
/// Memory layout of a chunk:
///
/// ```text
/// +----------------------+ <- Chunk::addr()
/// |   Header (16 bytes)  |
/// +----------------------+ <- Chunk::payload()
/// |                      |
/// |   Payload (size)     |
/// |                      |
/// |  ..................  | <- footer, only while free:
/// |  [size] [prev] [next]|      size >  16: 3 words
/// +----------------------+      size == 16: [prev] [next | 1]
/// |  next chunk header   |
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Chunk(NonNull<u8>);

impl Chunk {
    /// Writes `header` at `addr` and returns the chunk.
    ///
    /// **SAFETY**: `addr` must be aligned to [`ALIGNMENT`] and followed by at least
    /// `CHUNK_HEADER_SIZE + header.size` bytes the heap owns.
    pub unsafe fn init(addr: NonNull<u8>, header: Header) -> Self {
        let chunk = Self(addr);
        chunk.set_header(header);
        chunk
    }

    /// **SAFETY**: `addr` must point at the header of a chunk of the heap.
    #[inline]
    pub unsafe fn from_addr(addr: NonNull<u8>) -> Self {
        Self(addr)
    }

    /// Recovers the chunk a payload pointer was handed out from.
    ///
    /// **SAFETY**: `payload` must have been returned by [`Chunk::payload`].
    #[inline]
    pub unsafe fn from_payload(payload: NonNull<u8>) -> Self {
        unsafe { Self(NonNull::new_unchecked(payload.as_ptr().sub(CHUNK_HEADER_SIZE))) }
    }

    /// Decodes a footer link word. `0` is the end of the list.
    #[inline]
    fn from_link(word: usize) -> Option<Self> {
        NonNull::new((word & !COMPACT_TAG) as *mut u8).map(Self)
    }

    #[inline]
    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    #[inline]
    pub fn as_ptr(self) -> *mut u8 {
        self.0.as_ptr()
    }

    #[inline]
    pub fn payload(self) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked(self.0.as_ptr().add(CHUNK_HEADER_SIZE)) }
    }

    /// Address one past the end of the payload, i.e. where the physical successor
    /// starts.
    #[inline]
    pub fn end(self) -> usize {
        self.addr() + CHUNK_HEADER_SIZE + self.size()
    }

    #[inline]
    pub fn header(self) -> Header {
        unsafe { Header::decode(self.0.cast::<u32>().as_ptr().read()) }
    }

    #[inline]
    pub fn set_header(self, header: Header) {
        unsafe { self.0.cast::<u32>().as_ptr().write(header.encode()) }
    }

    #[inline]
    pub fn size(self) -> usize {
        self.header().size
    }

    #[inline]
    pub fn is_used(self) -> bool {
        self.header().used
    }

    #[inline]
    pub fn is_last(self) -> bool {
        self.header().last
    }

    #[inline]
    pub fn prev_used(self) -> bool {
        self.header().prev_used
    }

    pub fn set_used(self, used: bool) {
        self.set_header(Header { used, ..self.header() });
    }

    pub fn set_prev_used(self, prev_used: bool) {
        self.set_header(Header { prev_used, ..self.header() });
    }

    /// Physical successor, `None` for the last chunk of a region.
    #[inline]
    pub fn next(self) -> Option<Self> {
        if self.is_last() {
            return None;
        }
        unsafe { Some(Self(NonNull::new_unchecked(self.end() as *mut u8))) }
    }

    /// Physical predecessor if it is free.
    ///
    /// The predecessor is found through the size stored in its footer, which only
    /// exists while it is free. That's why we look at the cached `prev_used` flag
    /// first and never touch the memory behind a used chunk.
    pub fn prev_if_free(self) -> Option<Self> {
        if self.prev_used() {
            return None;
        }

        unsafe {
            let footer_end = self.as_ptr().cast::<usize>();
            let prev_size = if footer_end.sub(1).read() & COMPACT_TAG != 0 {
                MIN_CHUNK_SIZE
            } else {
                footer_end.sub(3).read()
            };

            let prev = self.as_ptr().sub(prev_size + CHUNK_HEADER_SIZE);
            Some(Self(NonNull::new_unchecked(prev)))
        }
    }

    /// Carves `self` down to `size` bytes of payload and turns the leftover into a new
    /// free chunk, which is returned. The leftover must be able to hold a header and
    /// the smallest payload, otherwise nothing is split and we return `None`.
    ///
    /// The new chunk takes over the `last` flag and becomes the physical predecessor
    /// of our old successor. It is not inserted in any free list.
    pub fn split(self, size: usize) -> Option<Self> {
        let header = self.header();
        let extra = header.size.checked_sub(size)?;
        if extra < CHUNK_HEADER_SIZE + MIN_CHUNK_SIZE {
            return None;
        }

        let rest = Header {
            size: extra - CHUNK_HEADER_SIZE,
            used: false,
            last: header.last,
            prev_used: header.used,
        };

        let rest = unsafe {
            let addr = self.as_ptr().add(CHUNK_HEADER_SIZE + size);
            Self::init(NonNull::new_unchecked(addr), rest)
        };
        if let Some(next) = rest.next() {
            next.set_prev_used(false);
        }

        self.set_header(Header {
            size,
            last: false,
            ..header
        });

        Some(rest)
    }

    /// Absorbs `right`, which must be our physical successor. The successor of
    /// `right` learns about its new predecessor.
    pub fn merge(self, right: Self) {
        debug_assert_eq!(self.end(), right.addr());

        let header = self.header();
        self.set_header(Header {
            size: header.size + CHUNK_HEADER_SIZE + right.size(),
            last: right.is_last(),
            ..header
        });

        if let Some(next) = self.next() {
            next.set_prev_used(header.used);
        }
    }

    /// Pointer one word past the footer.
    #[inline]
    fn footer_end(self) -> *mut usize {
        self.end() as *mut usize
    }

    /// Writes the free list links in the footer, in the compact form for 16 byte
    /// chunks and in the extended form (with the size) otherwise.
    pub fn write_footer(self, prev: Option<Self>, next: Option<Self>) {
        let size = self.size();
        let prev = prev.map_or(0, Self::addr);
        let next = next.map_or(0, Self::addr);

        unsafe {
            let footer_end = self.footer_end();
            if size == MIN_CHUNK_SIZE {
                footer_end.sub(2).write(prev);
                footer_end.sub(1).write(next | COMPACT_TAG);
            } else {
                footer_end.sub(3).write(size);
                footer_end.sub(2).write(prev);
                footer_end.sub(1).write(next);
            }
        }
    }

    /// Previous chunk in the free list.
    #[inline]
    pub fn prev_link(self) -> Option<Self> {
        unsafe { Self::from_link(self.footer_end().sub(2).read()) }
    }

    /// Next chunk in the free list.
    #[inline]
    pub fn next_link(self) -> Option<Self> {
        unsafe { Self::from_link(self.footer_end().sub(1).read()) }
    }
}
