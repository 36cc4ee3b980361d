use std::{
    fmt,
    ptr::NonNull,
    sync::{Arc, OnceLock},
};

use log::Level;
use parking_lot::{Mutex, MutexGuard};

use crate::{
    config::HeapConfig,
    error::{HeapInitError, IntegrityError},
    header::Header,
    integrity::{IntegrityLevel, IntegrityReport},
    logging::{HeapLog, LogSink},
    memory,
    pool::SmallPool,
    realloc::{Resize, ResizeOutcome},
    report::{ActiveAllocation, StatusReport},
    scrub::{ZeroDepth, ZeroOnFree},
    stats::{self, HeapStats},
    store::{SegmentInfo, SegmentStore},
    tracking::{AllocationSite, Tracker},
    Pointer,
};

/// A complete heap. Requests go to one of two places depending on their size:
///
/// ```text
///                          size <= small_threshold
///                     +-----------------------------------+
///                     |                                   v
///                     |      +------+------+------+------+------+------+
///                     |      | slot | slot | slot | slot | slot | slot |  Small pool
///  allocate(size) ----+      +------+------+------+------+------+------+
///                     |
///                     |      +--------+    +--------+    +--------------+
///                     +----> |  Used  | -> |  Free  | -> |     Used     |  Segment store
///                            +--------+    +--------+    +--------------+
///                    size > small_threshold or pool exhausted
/// ```
///
/// See [`crate::store`] and [`crate::pool`] for how each one works. Both
/// buffers are requested from the platform the first time they're needed,
/// unless [`Heap::init`] hands the segment store a buffer of its own.
///
/// This struct is not thread safe, every operation needs `&mut self`. Use
/// [`SharedHeap`] to share a heap between threads.
///
/// # Drop
///
/// There's no [`Drop`] implementation here. Owned buffers are returned to the
/// platform when their [`crate::platform::Mapping`] is dropped along with the
/// rest of the fields. Buffers given to [`Heap::init`] are left alone.
///
/// # Examples
///
/// ```rust
/// use segheap::{Heap, HeapConfig};
///
/// let mut heap = Heap::with_config(HeapConfig::new().with_heap_size(1 << 20)).unwrap();
///
/// let address = heap.allocate(1024).unwrap();
///
/// unsafe {
///     address.as_ptr().write_bytes(0xAA, 1024);
///
///     let address = heap.reallocate(Some(address), 2048).unwrap();
///     assert_eq!(*address.as_ptr().add(1023), 0xAA);
///
///     heap.free(Some(address));
/// }
///
/// assert_eq!(heap.stats().allocated, 0);
/// ```
pub struct Heap {
    config: HeapConfig,
    store: SegmentStore,
    pool: SmallPool,
    stats: HeapStats,
    zero_on_free: ZeroOnFree,
    tracker: Tracker,
    log: HeapLog,
}

// All the raw pointers point into memory exclusively owned by this heap, or
// memory the caller promised not to touch in `Heap::init`.
unsafe impl Send for Heap {}

impl fmt::Debug for Heap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap")
            .field("config", &self.config)
            .field("initialized", &self.store.is_initialized())
            .field("segments", &self.store.len())
            .field("stats", &self.stats)
            .finish()
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    /// Heap with the default configuration, see [`HeapConfig`].
    pub fn new() -> Self {
        Self::build(HeapConfig::new())
    }

    /// Heap with a custom configuration. Fails if the configuration doesn't
    /// pass [`HeapConfig::validate`].
    pub fn with_config(config: HeapConfig) -> Result<Self, HeapInitError> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: HeapConfig) -> Self {
        let log = HeapLog::new(config.debug);

        Self {
            store: SegmentStore::new(config.block_size, config.integrity, log.clone()),
            pool: SmallPool::new(&config, log.clone()),
            stats: HeapStats::default(),
            zero_on_free: config.zero_on_free,
            tracker: Tracker::new(config.track_allocations),
            config,
            log,
        }
    }

    /// Uses `size` bytes at `buffer` as the segment store instead of
    /// acquiring memory from the platform.
    ///
    /// # Safety
    ///
    /// `buffer` must be valid for reads and writes of `size` bytes and must
    /// not be used by anything else while this heap exists.
    pub unsafe fn init(&mut self, buffer: *mut u8, size: usize) -> Result<(), HeapInitError> {
        let Some(buffer) = NonNull::new(buffer) else {
            heap_log!(self.log, Warn, "heap initialization failed: buffer is null");
            return Err(HeapInitError::NullBuffer);
        };

        // Statistics are kept. Small pool allocations made before this call
        // are still live and must stay counted.
        self.store.init(buffer, size, None)
    }

    /// Acquires the segment store buffer if that didn't happen yet.
    pub fn ensure_initialized(&mut self) -> Result<(), HeapInitError> {
        if self.store.is_initialized() {
            return Ok(());
        }

        self.store.init_owned(self.config.heap_size)
    }

    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.store.is_initialized()
    }

    /// Bytes managed by the segment store. Before initialization this is the
    /// configured heap size.
    pub fn capacity(&self) -> usize {
        if self.store.is_initialized() {
            self.store.capacity()
        } else {
            self.config.heap_size
        }
    }

    #[inline]
    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    /// Returns an address where `size` bytes can be written, aligned to
    /// [`crate::align::ALIGNMENT`]. `None` if `size` is 0 or there's no
    /// memory left. With tracking enabled the caller's location is recorded.
    #[track_caller]
    pub fn allocate(&mut self, size: usize) -> Pointer<u8> {
        self.allocate_at(size, AllocationSite::caller())
    }

    /// Same as [`Heap::allocate`] but records `site` as the allocation site.
    pub fn allocate_at(&mut self, size: usize, site: AllocationSite) -> Pointer<u8> {
        if size == 0 {
            heap_log!(self.log, Debug, "zero-size allocation requested");
            return None;
        }

        if self.pool.accepts(size) {
            if let Some(run) = self.pool.allocate(size) {
                self.stats.record_pool_allocation(run.len());
                return Some(run.cast());
            }

            heap_log!(
                self.log,
                Debug,
                "small pool cannot serve {size} bytes, falling back to segments"
            );
        }

        if let Err(error) = self.ensure_initialized() {
            heap_log!(self.log, Error, "{error}");
            return None;
        }

        unsafe {
            let segment = self.store.allocate(size)?;
            let header = segment.as_ref();

            self.stats
                .record_allocation(header.total_size(self.store.block_size));
            self.tracker.record(header.data.allocation_id, site);

            Some(Header::user_address_of(segment))
        }
    }

    /// Releases the allocation at `address`. `None` does nothing. Unknown
    /// pointers and double frees are reported and ignored.
    ///
    /// # Safety
    ///
    /// `address` must not be used after this call.
    pub unsafe fn free(&mut self, address: Pointer<u8>) {
        let Some(address) = address else {
            heap_log!(self.log, Debug, "free called with null pointer");
            return;
        };

        if self.pool.contains(address) {
            if let Some(bytes) = self.pool.free(address, &self.zero_on_free) {
                self.stats.record_pool_free(bytes);
            }
            return;
        }

        let Some(segment) = self.store.segment_of(address) else {
            heap_log!(self.log, Warn, "invalid pointer {address:p} passed to free");
            return;
        };

        if let Some(released) = self.store.deallocate(segment, &self.zero_on_free) {
            self.stats.record_free(released.bytes);
            self.tracker.forget(released.allocation_id);
        }
    }

    /// Changes the size of the allocation at `address`, keeping the first
    /// `min(old size, size)` bytes. `None` behaves like [`Heap::allocate`]
    /// and a `size` of 0 behaves like [`Heap::free`] and returns `None`. On
    /// failure `None` is returned and the original allocation is untouched.
    ///
    /// # Safety
    ///
    /// If the returned address differs from `address`, `address` must not be
    /// used anymore.
    #[track_caller]
    pub unsafe fn reallocate(&mut self, address: Pointer<u8>, size: usize) -> Pointer<u8> {
        self.reallocate_at(address, size, AllocationSite::caller())
    }

    /// Same as [`Heap::reallocate`] but records `site` if the allocation has
    /// to be created from scratch.
    ///
    /// # Safety
    ///
    /// See [`Heap::reallocate`].
    pub unsafe fn reallocate_at(
        &mut self,
        address: Pointer<u8>,
        size: usize,
        site: AllocationSite,
    ) -> Pointer<u8> {
        let Some(address) = address else {
            return self.allocate_at(size, site);
        };

        if size == 0 {
            self.free(Some(address));
            return None;
        }

        if size > self.capacity() / 2 {
            heap_log!(
                self.log,
                Warn,
                "reallocation to {size} bytes exceeds half of the heap capacity"
            );
            return None;
        }

        if self.pool.contains(address) {
            return self.reallocate_small(address, size, site);
        }

        let Some(segment) = self.store.segment_of(address) else {
            heap_log!(self.log, Warn, "invalid pointer {address:p} passed to reallocate");
            return None;
        };

        if segment.as_ref().is_free() {
            heap_log!(self.log, Warn, "reallocation of freed pointer {address:p}");
            return None;
        }

        let required = self.store.required_blocks(size);
        let resize = Resize::new(segment, address, size, required, self.store.block_size);

        match self.store.resize(&resize) {
            ResizeOutcome::Unchanged => Some(address),

            ResizeOutcome::Shrunk(bytes) => {
                self.stats.record_shrink(bytes);
                Some(address)
            }

            ResizeOutcome::Grown(bytes) => {
                self.stats.record_growth(bytes);
                Some(address)
            }

            ResizeOutcome::Move => self.move_segment(&resize, site),
        }
    }

    /// Last resort of a reallocation: new segment, copy, free the old one.
    /// The new allocation inherits the tracked site of the old one.
    unsafe fn move_segment(&mut self, resize: &Resize, site: AllocationSite) -> Pointer<u8> {
        let id = resize.segment.as_ref().data.allocation_id;
        let site = self.tracker.site_of(id).unwrap_or(site);

        let Some(new_address) = self.allocate_at(resize.new_size, site) else {
            heap_log!(
                self.log,
                Debug,
                "reallocation of {:p} to {} bytes failed, original kept",
                resize.address,
                resize.new_size
            );
            return None;
        };

        memory::copy(new_address, resize.address, resize.count());
        self.free(Some(resize.address));

        heap_log!(
            self.log,
            Debug,
            "moved {:p} to {new_address:p}, {} bytes copied",
            resize.address,
            resize.count()
        );

        Some(new_address)
    }

    /// Pool allocations stay where they are while the run is big enough,
    /// otherwise they move wherever [`Heap::allocate_at`] puts them.
    unsafe fn reallocate_small(
        &mut self,
        address: NonNull<u8>,
        size: usize,
        site: AllocationSite,
    ) -> Pointer<u8> {
        let Some(run) = self.pool.run_size(address) else {
            heap_log!(self.log, Warn, "invalid pointer {address:p} passed to reallocate");
            return None;
        };

        if size <= run {
            return Some(address);
        }

        let new_address = self.allocate_at(size, site)?;
        memory::copy(new_address, address, run.min(size));
        self.free(Some(address));

        Some(new_address)
    }

    /// Bytes that can actually be written at `address`, which may be more
    /// than what was requested. `None` for pointers this heap doesn't own.
    pub fn usable_size(&self, address: NonNull<u8>) -> Option<usize> {
        if self.pool.contains(address) {
            return self.pool.run_size(address);
        }

        let segment = self.store.segment_of(address)?;

        unsafe {
            let header = segment.as_ref();
            (!header.is_free()).then(|| header.usable_size(self.store.block_size))
        }
    }

    /// Debug mode turns on `Debug` and `Trace` messages and makes the
    /// segment store inspect every segment it touches.
    pub fn set_debug(&mut self, debug: bool) {
        self.log.verbose = debug;
        self.config.debug = debug;
        self.sync_log();
    }

    /// Turning tracking off forgets every recorded site.
    pub fn set_tracking(&mut self, enabled: bool) {
        self.tracker.set_enabled(enabled);
        self.config.track_allocations = enabled;
    }

    /// `shallow_bytes == 0` keeps the current shallow size.
    pub fn set_zero_on_free(&mut self, depth: ZeroDepth, shallow_bytes: usize) {
        self.zero_on_free.depth = depth;
        if shallow_bytes > 0 {
            self.zero_on_free.shallow_bytes = shallow_bytes;
        }
        self.config.zero_on_free = self.zero_on_free;

        heap_log!(
            self.log,
            Debug,
            "zero-on-free set to {depth}, shallow size {} bytes",
            self.zero_on_free.shallow_bytes
        );
    }

    pub fn set_integrity_level(&mut self, level: IntegrityLevel) {
        // Every segment in the list lives in memory owned by this heap.
        unsafe { self.store.set_integrity(level) };
        self.config.integrity = level;

        heap_log!(self.log, Debug, "integrity check level set to {level}");
    }

    /// Sends diagnostics of this heap to `sink` instead of the [`log`]
    /// facade.
    pub fn set_log_sink(&mut self, sink: impl LogSink + 'static) {
        self.log.set_sink(Arc::new(sink));
        self.sync_log();
    }

    /// Goes back to logging through the [`log`] facade.
    pub fn clear_log_sink(&mut self) {
        self.log.clear_sink();
        self.sync_log();
    }

    fn sync_log(&mut self) {
        self.store.debug = self.log.verbose;
        self.store.log = self.log.clone();
        self.pool.log = self.log.clone();
    }

    #[inline]
    pub fn stats(&self) -> HeapStats {
        self.stats
    }

    /// See [`crate::fragmentation`].
    pub fn fragmentation(&self) -> f64 {
        let (segments, bytes) = self.store.free_space();
        stats::fragmentation(segments, bytes)
    }

    /// Walks the whole segment list checking every segment at the current
    /// integrity level, fixing what can be fixed if `repair` is set.
    pub fn verify_integrity(&mut self, repair: bool) -> Result<IntegrityReport, IntegrityError> {
        self.store.verify(repair)
    }

    /// Snapshot of all the segments in address order.
    pub fn segments(&self) -> Vec<SegmentInfo> {
        self.store.segments()
    }

    /// Used segments with their tracked sites, in address order.
    pub fn tracked_allocations(&self) -> Vec<ActiveAllocation> {
        self.store
            .segments()
            .into_iter()
            .filter(|segment| !segment.is_free)
            .map(|segment| ActiveAllocation {
                id: segment.allocation_id,
                blocks: segment.blocks,
                site: self.tracker.site_of(segment.allocation_id),
            })
            .collect()
    }

    pub fn status(&self) -> StatusReport {
        StatusReport {
            stats: self.stats,
            pool_capacity: self.pool.capacity(),
            fragmentation: self.fragmentation(),
            zero_on_free: self.zero_on_free,
            integrity: self.store.integrity,
            segments: self.store.len(),
            active: self
                .tracker
                .is_enabled()
                .then(|| self.tracked_allocations()),
        }
    }

    /// Writes [`Heap::status`] to the log at `Info` level, debug mode or
    /// not.
    pub fn print_status(&self) {
        let report = self.status().to_string();

        for line in report.lines() {
            self.log.report(Level::Info, format_args!("{line}"));
        }
    }
}

/// [`Heap`] behind a single [`Mutex`]. Every operation locks the whole heap,
/// so they're all serialized.
///
/// ```rust
/// use std::thread;
///
/// use segheap::{HeapConfig, SharedHeap};
///
/// let heap = SharedHeap::with_config(HeapConfig::new().with_heap_size(1 << 20)).unwrap();
///
/// thread::scope(|scope| {
///     for _ in 0..4 {
///         scope.spawn(|| unsafe {
///             let address = heap.allocate(512).unwrap();
///             address.as_ptr().write_bytes(1, 512);
///             heap.free(Some(address));
///         });
///     }
/// });
///
/// assert_eq!(heap.lock().stats().count, 0);
/// ```
#[derive(Debug, Default)]
pub struct SharedHeap {
    heap: Mutex<Heap>,
}

impl SharedHeap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: HeapConfig) -> Result<Self, HeapInitError> {
        Ok(Self {
            heap: Mutex::new(Heap::with_config(config)?),
        })
    }

    /// Exclusive access to the heap for everything else, such as settings,
    /// statistics or integrity checks.
    pub fn lock(&self) -> MutexGuard<'_, Heap> {
        self.heap.lock()
    }

    /// See [`Heap::init`].
    ///
    /// # Safety
    ///
    /// Same as [`Heap::init`].
    pub unsafe fn init(&self, buffer: *mut u8, size: usize) -> Result<(), HeapInitError> {
        self.heap.lock().init(buffer, size)
    }

    #[track_caller]
    pub fn allocate(&self, size: usize) -> Pointer<u8> {
        let site = AllocationSite::caller();
        self.heap.lock().allocate_at(size, site)
    }

    /// # Safety
    ///
    /// Same as [`Heap::free`].
    pub unsafe fn free(&self, address: Pointer<u8>) {
        self.heap.lock().free(address)
    }

    /// # Safety
    ///
    /// Same as [`Heap::reallocate`].
    #[track_caller]
    pub unsafe fn reallocate(&self, address: Pointer<u8>, size: usize) -> Pointer<u8> {
        let site = AllocationSite::caller();
        self.heap.lock().reallocate_at(address, size, site)
    }
}

static GLOBAL: OnceLock<SharedHeap> = OnceLock::new();

/// Process wide heap with the default configuration, created the first time
/// it's needed.
pub fn global() -> &'static SharedHeap {
    GLOBAL.get_or_init(SharedHeap::new)
}

/// Makes the global heap use `size` bytes at `buffer`. Must happen before
/// the first global allocation, otherwise the heap has already acquired its
/// own memory and this fails with [`HeapInitError::AlreadyInitialized`].
///
/// # Safety
///
/// Same as [`Heap::init`], and the buffer must live for the rest of the
/// process.
pub unsafe fn heap_init(buffer: *mut u8, size: usize) -> Result<(), HeapInitError> {
    global().init(buffer, size)
}

/// [`Heap::allocate`] on the global heap.
#[track_caller]
pub fn allocate(size: usize) -> Pointer<u8> {
    global().allocate(size)
}

/// [`Heap::free`] on the global heap.
///
/// # Safety
///
/// Same as [`Heap::free`].
pub unsafe fn free(address: Pointer<u8>) {
    global().free(address)
}

/// [`Heap::reallocate`] on the global heap.
///
/// # Safety
///
/// Same as [`Heap::reallocate`].
#[track_caller]
pub unsafe fn reallocate(address: Pointer<u8>, size: usize) -> Pointer<u8> {
    global().reallocate(address, size)
}
