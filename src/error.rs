use std::fmt;

/// Errors the heap can run into.
///
/// [`HeapError::Exhausted`] is recoverable, the caller may try again later. Every other
/// variant means the heap can't get the memory it needs, and the null-returning API
/// ([`crate::Heap::allocate`], [`crate::Heap::resize`]) aborts the process on them.
/// Use the `try_` variants to handle them yourself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapError {
    /// No free chunk could serve the request, even after growing the heap.
    Exhausted { requested: usize },
    /// A single request needs a chunk bigger than [`crate::MAX_CHUNK_SIZE`].
    TooLarge { requested: usize },
    /// The platform refused to extend the region.
    GrowthFailed { len: usize },
    /// The [`crate::Config`] can't be used to build a heap.
    InvalidConfig(&'static str),
}

impl HeapError {
    /// Whether a null-returning caller should treat this error as fatal.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Exhausted { .. })
    }
}

impl fmt::Display for HeapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exhausted { requested } => {
                write!(f, "memory allocation failed: no chunk can hold {requested} bytes")
            }
            Self::TooLarge { requested } => {
                write!(f, "size requested is too large: {requested} bytes")
            }
            Self::GrowthFailed { len } => {
                write!(f, "could not grow the heap region by {len} bytes")
            }
            Self::InvalidConfig(reason) => write!(f, "invalid heap configuration: {reason}"),
        }
    }
}

impl std::error::Error for HeapError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_exhaustion_is_recoverable() {
        assert!(!HeapError::Exhausted { requested: 16 }.is_fatal());
        assert!(HeapError::TooLarge { requested: 1 << 30 }.is_fatal());
        assert!(HeapError::GrowthFailed { len: 4096 }.is_fatal());
        assert!(HeapError::InvalidConfig("zero").is_fatal());
    }

    #[test]
    fn display_names_the_size() {
        let message = HeapError::TooLarge { requested: 33554432 }.to_string();
        assert!(message.contains("33554432"), "{message}");
    }
}
