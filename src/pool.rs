use std::ptr::NonNull;

use crate::{
    align::{blocks_for, bytes_for},
    config::HeapConfig,
    logging::HeapLog,
    platform::Mapping,
    scrub::ZeroOnFree,
};

/// Fixed size bit set backed by 64 bit words.
#[derive(Debug)]
struct Bitmap(Box<[u64]>);

impl Bitmap {
    fn new(bits: usize) -> Self {
        Self(vec![0; blocks_for(bits, u64::BITS as usize)].into_boxed_slice())
    }

    #[inline]
    fn get(&self, bit: usize) -> bool {
        self.0[bit / 64] & (1 << (bit % 64)) != 0
    }

    #[inline]
    fn set(&mut self, bit: usize) {
        self.0[bit / 64] |= 1 << (bit % 64);
    }

    #[inline]
    fn clear(&mut self, bit: usize) {
        self.0[bit / 64] &= !(1 << (bit % 64));
    }
}

/// Sub-allocator for small requests. A separate buffer divided into equally
/// sized slots, each allocation takes a run of consecutive slots:
///
/// ```text
///            +------+------+------+------+------+------+------+------+
/// buffer  -> |  A   |  A   |  B   |      |  C   |  C   |  C   |      |
///            +------+------+------+------+------+------+------+------+
/// used    ->    1      1      1      0      1      1      1      0
/// starts  ->    1      0      1      0      1      0      0      0
/// ```
///
/// The `starts` bitmap is what tells `A` and `B` apart. A run begins at a
/// start bit and goes on while slots are used and not the start of another
/// run.
///
/// The buffer is only requested from the platform when the first small
/// allocation happens.
#[derive(Debug)]
pub(crate) struct SmallPool {
    slot_size: usize,
    threshold: usize,
    slots: usize,
    used: Bitmap,
    starts: Bitmap,
    mapping: Option<Mapping>,
    pub log: HeapLog,
}

impl SmallPool {
    pub fn new(config: &HeapConfig, log: HeapLog) -> Self {
        let slots = if config.small_pool_enabled() {
            config.pool_size / config.slot_size
        } else {
            0
        };

        Self {
            slot_size: config.slot_size,
            threshold: config.small_threshold,
            slots,
            used: Bitmap::new(slots),
            starts: Bitmap::new(slots),
            mapping: None,
            log,
        }
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.slots > 0 && self.threshold > 0
    }

    /// Bytes managed by the pool.
    #[inline]
    pub fn capacity(&self) -> usize {
        bytes_for(self.slots, self.slot_size)
    }

    /// Whether a request of `size` bytes should try the pool.
    #[inline]
    pub fn accepts(&self, size: usize) -> bool {
        self.is_enabled() && size > 0 && size <= self.threshold
    }

    /// Whether `address` points into the pool buffer.
    pub fn contains(&self, address: NonNull<u8>) -> bool {
        let Some(mapping) = &self.mapping else {
            return false;
        };

        let start = mapping.address().as_ptr() as usize;
        let address = address.as_ptr() as usize;

        address >= start && address - start < self.capacity()
    }

    fn mapped(&mut self) -> Option<NonNull<u8>> {
        if let Some(mapping) = &self.mapping {
            return Some(mapping.address());
        }

        let Some(mapping) = Mapping::new(self.capacity()) else {
            heap_log!(
                self.log,
                Warn,
                "small pool could not acquire {} bytes of memory",
                self.capacity()
            );
            return None;
        };

        let address = mapping.address();
        self.mapping = Some(mapping);

        heap_log!(
            self.log,
            Debug,
            "small pool initialized: address={address:p}, size={} bytes, slots={}",
            self.capacity(),
            self.slots
        );

        Some(address)
    }

    /// First fit search for `count` consecutive free slots.
    fn find_run(&self, count: usize) -> Option<usize> {
        let mut run = 0;

        for slot in 0..self.slots {
            if self.used.get(slot) {
                run = 0;
                continue;
            }

            run += 1;
            if run == count {
                return Some(slot + 1 - count);
            }
        }

        None
    }

    /// Number of slots in the run that begins at `first`.
    fn run_length(&self, first: usize) -> usize {
        let mut end = first + 1;

        while end < self.slots && self.used.get(end) && !self.starts.get(end) {
            end += 1;
        }

        end - first
    }

    /// Index of the slot where the allocation at `address` begins. `None` if
    /// `address` is not the beginning of a live allocation.
    fn slot_of(&self, address: NonNull<u8>) -> Option<usize> {
        let start = self.mapping.as_ref()?.address().as_ptr() as usize;

        if !self.contains(address) {
            return None;
        }

        let offset = address.as_ptr() as usize - start;

        if offset % self.slot_size != 0 {
            return None;
        }

        let slot = offset / self.slot_size;

        (self.used.get(slot) && self.starts.get(slot)).then_some(slot)
    }

    /// Claims enough slots for `size` bytes. The returned slice covers the
    /// whole run, so it can be longer than `size`.
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<[u8]>> {
        if !self.accepts(size) {
            return None;
        }

        let base = self.mapped()?;
        let count = blocks_for(size, self.slot_size);
        let first = self.find_run(count)?;

        for slot in first..first + count {
            self.used.set(slot);
        }
        self.starts.set(first);

        let bytes = bytes_for(count, self.slot_size);
        let address = unsafe {
            NonNull::new_unchecked(base.as_ptr().add(bytes_for(first, self.slot_size)))
        };

        heap_log!(
            self.log,
            Debug,
            "small allocation: {size} bytes at {address:p} (slots {first}-{})",
            first + count - 1
        );

        Some(NonNull::slice_from_raw_parts(address, bytes))
    }

    /// Size in bytes of the run that starts at `address`.
    pub fn run_size(&self, address: NonNull<u8>) -> Option<usize> {
        let slot = self.slot_of(address)?;
        Some(bytes_for(self.run_length(slot), self.slot_size))
    }

    /// Releases the run that starts at `address`, zeroing it according to
    /// `scrub`. Returns the bytes released, or `None` if `address` is not a
    /// live pool allocation.
    ///
    /// # Safety
    ///
    /// The run must not be used after this call.
    pub unsafe fn free(&mut self, address: NonNull<u8>, scrub: &ZeroOnFree) -> Option<usize> {
        let Some(first) = self.slot_of(address) else {
            heap_log!(
                self.log,
                Warn,
                "invalid pointer {address:p} passed to small pool free (double free?)"
            );
            return None;
        };

        let count = self.run_length(first);
        let bytes = bytes_for(count, self.slot_size);

        scrub.apply(address, bytes);

        for slot in first..first + count {
            self.used.clear(slot);
        }
        self.starts.clear(first);

        heap_log!(
            self.log,
            Debug,
            "small free: {bytes} bytes at {address:p} (slots {first}-{})",
            first + count - 1
        );

        Some(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{align::ALIGNMENT, scrub::ZeroDepth};

    fn pool() -> SmallPool {
        let config = HeapConfig::new()
            .with_pool_size(1024)
            .with_slot_size(32)
            .with_small_threshold(256);

        SmallPool::new(&config, HeapLog::new(true))
    }

    fn address_of(slice: NonNull<[u8]>) -> NonNull<u8> {
        slice.cast()
    }

    #[test]
    fn bitmap_bits() {
        let mut bitmap = Bitmap::new(130);
        assert_eq!(bitmap.0.len(), 3);

        bitmap.set(0);
        bitmap.set(64);
        bitmap.set(129);
        assert!(bitmap.get(0) && bitmap.get(64) && bitmap.get(129));
        assert!(!bitmap.get(1) && !bitmap.get(63));

        bitmap.clear(64);
        assert!(!bitmap.get(64));
    }

    #[test]
    fn rounds_up_to_whole_slots() {
        let mut pool = pool();

        let a = pool.allocate(1).unwrap();
        let b = pool.allocate(33).unwrap();
        let c = pool.allocate(256).unwrap();

        assert_eq!(a.len(), 32);
        assert_eq!(b.len(), 64);
        assert_eq!(c.len(), 256);

        let a = address_of(a).as_ptr() as usize;
        let b = address_of(b).as_ptr() as usize;
        assert_eq!(b - a, 32);
    }

    #[test]
    fn rejects_sizes_outside_threshold() {
        let mut pool = pool();

        assert!(pool.allocate(0).is_none());
        assert!(pool.allocate(257).is_none());
        // Nothing was requested from the platform yet.
        assert!(pool.mapping.is_none());

        let disabled = SmallPool::new(&HeapConfig::new().without_small_pool(), HeapLog::new(false));
        assert!(!disabled.is_enabled());
        assert!(!disabled.accepts(16));
        assert_eq!(disabled.capacity(), 0);
    }

    #[test]
    fn adjacent_allocations_are_independent() {
        let mut pool = pool();

        let a = address_of(pool.allocate(64).unwrap());
        let b = address_of(pool.allocate(64).unwrap());

        unsafe {
            assert_eq!(pool.free(a, &ZeroOnFree::default()), Some(64));
        }

        assert_eq!(pool.run_size(b), Some(64));
        assert_eq!(pool.run_size(a), None);

        // The hole left by `a` is reused first.
        let c = address_of(pool.allocate(32).unwrap());
        assert_eq!(c, a);
    }

    #[test]
    fn smallest_slots_keep_alignment() {
        let config = HeapConfig::new()
            .with_pool_size(1024)
            .with_slot_size(ALIGNMENT)
            .with_small_threshold(64);
        assert_eq!(config.validate(), Ok(()));

        let mut pool = SmallPool::new(&config, HeapLog::new(false));

        for size in [1, 8, 16, 24, 64, 8] {
            let address = address_of(pool.allocate(size).unwrap());
            assert_eq!(address.as_ptr() as usize % ALIGNMENT, 0, "{size}");
        }
    }

    #[test]
    fn rejects_invalid_frees() {
        let mut pool = pool();
        let a = address_of(pool.allocate(64).unwrap());

        unsafe {
            let interior = NonNull::new_unchecked(a.as_ptr().add(32));
            assert_eq!(pool.free(interior, &ZeroOnFree::default()), None);

            let mut outside = 0u8;
            assert_eq!(pool.free(NonNull::from(&mut outside), &ZeroOnFree::default()), None);

            assert_eq!(pool.free(a, &ZeroOnFree::default()), Some(64));
            assert_eq!(pool.free(a, &ZeroOnFree::default()), None);
        }
    }

    #[test]
    fn exhaustion_and_reuse() {
        let mut pool = pool();

        let runs: Vec<_> = (0..4).map(|_| pool.allocate(256).unwrap()).collect();
        assert!(pool.allocate(1).is_none());

        unsafe {
            pool.free(address_of(runs[2]), &ZeroOnFree::default()).unwrap();
        }

        let reused = pool.allocate(200).unwrap();
        assert_eq!(address_of(reused), address_of(runs[2]));
        assert_eq!(reused.len(), 224);
    }

    #[test]
    fn free_zeroes_run() {
        let mut pool = pool();
        let run = pool.allocate(96).unwrap();
        let address = address_of(run);

        unsafe {
            address.as_ptr().write_bytes(0xAA, run.len());
            pool.free(address, &ZeroOnFree::new(ZeroDepth::Deep, 64)).unwrap();

            let data = std::slice::from_raw_parts(address.as_ptr(), run.len());
            assert!(data.iter().all(|byte| *byte == 0));
        }
    }
}
