use crate::{
    chunk::{ALIGNMENT, Header},
    error::HeapError,
};

/// Default step by which the heap region grows: 128 KiB.
pub const EXPANSION_SIZE: usize = 128 * 1024;

/// Largest chunk a heap with the default [`Config`] creates.
pub const MAX_CHUNK_SIZE: usize = Config::new().max_chunk_size();

/// Tunables of a [`crate::Heap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Unit of heap growth. Every growth asks the platform for the smallest multiple
    /// of this value that is bigger than the request (plus one chunk header).
    pub expansion_size: usize,
}

impl Config {
    pub const fn new() -> Self {
        Self {
            expansion_size: EXPANSION_SIZE,
        }
    }

    pub const fn with_expansion_size(mut self, expansion_size: usize) -> Self {
        self.expansion_size = expansion_size;
        self
    }

    /// Largest chunk the heap will ever create with this configuration: the biggest
    /// multiple of the expansion unit that still fits the header's size field.
    pub const fn max_chunk_size(&self) -> usize {
        (Header::MAX_SIZE / self.expansion_size) * self.expansion_size
    }

    pub fn validate(&self) -> Result<(), HeapError> {
        if self.expansion_size == 0 {
            return Err(HeapError::InvalidConfig("expansion size must not be zero"));
        }
        if self.expansion_size % ALIGNMENT != 0 {
            return Err(HeapError::InvalidConfig(
                "expansion size must be a multiple of the alignment",
            ));
        }
        if self.expansion_size > Header::MAX_SIZE {
            return Err(HeapError::InvalidConfig(
                "expansion size does not fit a chunk header",
            ));
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();

        assert_eq!(Ok(()), config.validate());
        assert_eq!(128 * 1024, config.expansion_size);
        // 16 MiB itself doesn't fit 24 bits, the last multiple below it does.
        assert_eq!(16 * 1024 * 1024 - 128 * 1024, config.max_chunk_size());
        assert_eq!(MAX_CHUNK_SIZE, config.max_chunk_size());
    }

    #[test]
    fn rejects_bad_expansion_sizes() {
        for size in [0, 24, 1 << 24] {
            let config = Config::new().with_expansion_size(size);
            assert!(config.validate().is_err(), "size {size}");
        }
        assert!(Config::new().with_expansion_size(4096).validate().is_ok());
    }
}
