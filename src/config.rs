use crate::{
    align::ALIGNMENT,
    error::HeapInitError,
    integrity::IntegrityLevel,
    scrub::{ZeroDepth, ZeroOnFree},
    segment::{HEADER_SIZE, SEGMENT_OVERHEAD},
};

/// Heap configuration. All sizes are in bytes.
///
/// ```rust
/// use segheap::{HeapConfig, IntegrityLevel};
///
/// let config = HeapConfig::new()
///     .with_heap_size(1 << 20)
///     .with_block_size(256)
///     .with_integrity(IntegrityLevel::Thorough);
///
/// assert!(config.validate().is_ok());
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeapConfig {
    /// Size of the backing buffer acquired for the segment store.
    pub heap_size: usize,
    /// Allocation granularity of the segment store. Power of 2.
    pub block_size: usize,
    /// Requests of at most this many bytes try the small pool first.
    pub small_threshold: usize,
    /// Slot size of the small pool. Power of 2, at least
    /// [`ALIGNMENT`](crate::align::ALIGNMENT).
    pub slot_size: usize,
    /// Size of the small pool buffer. 0 disables the pool.
    pub pool_size: usize,
    pub integrity: IntegrityLevel,
    pub debug: bool,
    pub track_allocations: bool,
    pub zero_on_free: ZeroOnFree,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl HeapConfig {
    pub const DEFAULT_HEAP_SIZE: usize = 64 * 1024 * 1024;
    pub const DEFAULT_BLOCK_SIZE: usize = 4096;
    pub const DEFAULT_SMALL_THRESHOLD: usize = 256;
    pub const DEFAULT_SLOT_SIZE: usize = 32;
    pub const DEFAULT_POOL_SIZE: usize = 1024 * 1024;

    pub const fn new() -> Self {
        Self {
            heap_size: Self::DEFAULT_HEAP_SIZE,
            block_size: Self::DEFAULT_BLOCK_SIZE,
            small_threshold: Self::DEFAULT_SMALL_THRESHOLD,
            slot_size: Self::DEFAULT_SLOT_SIZE,
            pool_size: Self::DEFAULT_POOL_SIZE,
            integrity: IntegrityLevel::Basic,
            debug: false,
            track_allocations: false,
            zero_on_free: ZeroOnFree::new(ZeroDepth::None, crate::scrub::DEFAULT_SHALLOW_BYTES),
        }
    }

    pub const fn with_heap_size(mut self, heap_size: usize) -> Self {
        self.heap_size = heap_size;
        self
    }

    pub const fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    pub const fn with_small_threshold(mut self, small_threshold: usize) -> Self {
        self.small_threshold = small_threshold;
        self
    }

    pub const fn with_slot_size(mut self, slot_size: usize) -> Self {
        self.slot_size = slot_size;
        self
    }

    pub const fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    /// Disables the small pool, every request goes to the segment store.
    pub const fn without_small_pool(mut self) -> Self {
        self.pool_size = 0;
        self
    }

    pub const fn with_integrity(mut self, integrity: IntegrityLevel) -> Self {
        self.integrity = integrity;
        self
    }

    pub const fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub const fn with_tracking(mut self, track_allocations: bool) -> Self {
        self.track_allocations = track_allocations;
        self
    }

    pub const fn with_zero_on_free(mut self, zero_on_free: ZeroOnFree) -> Self {
        self.zero_on_free = zero_on_free;
        self
    }

    /// Whether small requests are served from the pool.
    pub const fn small_pool_enabled(&self) -> bool {
        self.pool_size > 0 && self.small_threshold > 0
    }

    /// Smallest buffer that can hold one segment header plus one block.
    pub const fn min_heap_size(&self) -> usize {
        HEADER_SIZE + self.block_size
    }

    /// Checks that the sizes are consistent with each other.
    pub fn validate(&self) -> Result<(), HeapInitError> {
        if !self.block_size.is_power_of_two() || self.block_size <= SEGMENT_OVERHEAD {
            return Err(HeapInitError::InvalidConfig(
                "block size must be a power of two larger than the segment overhead",
            ));
        }

        if self.heap_size < self.min_heap_size() {
            return Err(HeapInitError::InvalidConfig(
                "heap size must fit at least one segment header and one block",
            ));
        }

        if !self.small_pool_enabled() {
            return Ok(());
        }

        // Every slot starts a possible allocation, so it has to keep the
        // alignment user pointers are promised.
        if !self.slot_size.is_power_of_two() || self.slot_size < ALIGNMENT {
            return Err(HeapInitError::InvalidConfig(
                "slot size must be a power of two of at least the alignment",
            ));
        }

        if self.pool_size % self.slot_size != 0 {
            return Err(HeapInitError::InvalidConfig(
                "small pool size must be a multiple of the slot size",
            ));
        }

        if self.small_threshold > self.pool_size {
            return Err(HeapInitError::InvalidConfig(
                "small allocation threshold cannot exceed the small pool size",
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = HeapConfig::default();

        assert_eq!(config.heap_size, 64 * 1024 * 1024);
        assert_eq!(config.block_size, 4096);
        assert_eq!(config.small_threshold, 256);
        assert_eq!(config.slot_size, 32);
        assert_eq!(config.pool_size, 1024 * 1024);
        assert_eq!(config.integrity, IntegrityLevel::Basic);
        assert_eq!(config.zero_on_free.shallow_bytes, 64);
        assert!(config.small_pool_enabled());
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn rejects_inconsistent_sizes() {
        let base = HeapConfig::new();

        let invalid = [
            base.with_block_size(3000),
            base.with_block_size(SEGMENT_OVERHEAD.next_power_of_two() / 2),
            base.with_heap_size(base.block_size),
            base.with_slot_size(24),
            base.with_slot_size(8).with_small_threshold(64),
            base.with_pool_size(1000),
            base.with_pool_size(128).with_small_threshold(256),
        ];

        for config in invalid {
            assert!(
                matches!(config.validate(), Err(HeapInitError::InvalidConfig(_))),
                "{config:?}"
            );
        }
    }

    #[test]
    fn disabled_pool_skips_pool_checks() {
        let config = HeapConfig::new().without_small_pool().with_slot_size(3);
        assert!(!config.small_pool_enabled());
        assert_eq!(config.validate(), Ok(()));

        let config = HeapConfig::new().with_small_threshold(0).with_pool_size(7);
        assert!(!config.small_pool_enabled());
        assert_eq!(config.validate(), Ok(()));
    }
}
