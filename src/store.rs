use std::ptr::NonNull;

use crate::{
    align::{align_down, align_up, blocks_for, bytes_for, ALIGNMENT},
    error::HeapInitError,
    header::Header,
    integrity::IntegrityLevel,
    list::LinkedList,
    logging::HeapLog,
    platform::Mapping,
    realloc::{Resize, ResizeMethod, ResizeOutcome},
    scrub::ZeroOnFree,
    segment::{Segment, HEADER_SIZE, SEGMENT_MAGIC, SEGMENT_OVERHEAD, USER_OFFSET},
    Pointer,
};

/// What [`SegmentStore::deallocate`] gave back.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Released {
    pub allocation_id: u32,
    /// Size of the freed segment in bytes, header included.
    pub bytes: usize,
}

/// Snapshot of one segment, see [`crate::Heap::segments`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SegmentInfo {
    /// Distance from the start of the heap in bytes.
    pub offset: usize,
    pub blocks: usize,
    /// `blocks * block_size`.
    pub bytes: usize,
    pub is_free: bool,
    pub allocation_id: u32,
}

/// The core heap. One contiguous buffer carved into segments that are always
/// a whole number of blocks in size. Every byte of the buffer belongs to
/// exactly one segment and the segments are linked in address order:
///
/// ```text
/// +---------------------------------------------------------------------+
/// | +---------+    +---------+    +---------+    +---------------------+ |
/// | |  Used   | -> |  Free   | -> |  Used   | -> |        Free         | |
/// | +---------+    +---------+    +---------+    +---------------------+ |
/// +---------------------------------------------------------------------+
/// ^ start                                                          end ^
/// ```
///
/// There is no separate free list. Searching walks the segment list and
/// picks the smallest free segment that fits (best fit). Two free segments
/// are never left next to each other after a free, they get merged.
pub(crate) struct SegmentStore {
    /// All segments in address order.
    pub segments: LinkedList<Segment>,
    /// Start of the buffer, aligned to [`ALIGNMENT`]. `None` until
    /// initialized.
    pub start: Pointer<u8>,
    /// Bytes managed, always a multiple of `block_size`.
    pub length: usize,
    pub block_size: usize,
    /// Most recently freed segment. Always free or `None`.
    pub last_free: Pointer<Header<Segment>>,
    pub integrity: IntegrityLevel,
    /// Debug mode, segments are inspected whenever they're touched.
    pub debug: bool,
    pub log: HeapLog,
    next_allocation_id: u32,
    /// Memory acquired by the heap itself. `None` when the buffer was
    /// provided by the caller, in which case it's not ours to release.
    backing: Option<Mapping>,
}

impl SegmentStore {
    /// Builds an uninitialized store. No memory is touched until
    /// [`Self::init`] is called.
    pub fn new(block_size: usize, integrity: IntegrityLevel, log: HeapLog) -> Self {
        Self {
            segments: LinkedList::new(),
            start: None,
            length: 0,
            block_size,
            last_free: None,
            integrity,
            debug: log.verbose,
            log,
            next_allocation_id: 1,
            backing: None,
        }
    }

    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.start.is_some()
    }

    /// Bytes managed by the store.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.length
    }

    /// First address after the heap.
    #[inline]
    pub fn end_address(&self) -> usize {
        self.start
            .map_or(0, |start| start.as_ptr() as usize + self.length)
    }

    /// Takes over `size` bytes at `buffer` and turns them into one free
    /// segment. The start is aligned up to [`ALIGNMENT`] and whatever doesn't
    /// fill a whole block at the end is left unused. `backing` is kept alive
    /// as long as the store.
    ///
    /// # Safety
    ///
    /// `buffer` must be valid for reads and writes of `size` bytes for as
    /// long as this store exists.
    pub unsafe fn init(
        &mut self,
        buffer: NonNull<u8>,
        size: usize,
        backing: Option<Mapping>,
    ) -> Result<(), HeapInitError> {
        if self.is_initialized() {
            return Err(HeapInitError::AlreadyInitialized);
        }

        let address = buffer.as_ptr() as usize;
        let adjustment = align_up(address, ALIGNMENT) - address;
        let required = HEADER_SIZE + self.block_size;

        if size < adjustment + required {
            heap_log!(
                self.log,
                Warn,
                "heap initialization failed: buffer {buffer:p} of {size} bytes is too small"
            );
            return Err(HeapInitError::BufferTooSmall { size, required });
        }

        if adjustment > 0 {
            heap_log!(
                self.log,
                Debug,
                "heap address adjusted for alignment: adjustment={adjustment} bytes"
            );
        }

        let start = NonNull::new_unchecked(buffer.as_ptr().add(adjustment));
        let blocks = (size - adjustment) / self.block_size;

        self.segments = LinkedList::new();
        let first = self.segments.append(Segment::free(blocks), start);

        self.start = Some(start);
        self.length = bytes_for(blocks, self.block_size);
        self.last_free = Some(first);
        self.next_allocation_id = 1;
        self.backing = backing;

        self.seal(first);

        heap_log!(
            self.log,
            Debug,
            "heap initialized: address={start:p}, size={} bytes, blocks={blocks}",
            self.length
        );

        Ok(())
    }

    /// Acquires `size` bytes from the platform and initializes the store on
    /// top of them.
    pub fn init_owned(&mut self, size: usize) -> Result<(), HeapInitError> {
        if self.is_initialized() {
            return Err(HeapInitError::AlreadyInitialized);
        }

        let mapping = Mapping::new(size).ok_or(HeapInitError::OutOfMemory(size))?;
        let address = mapping.address();

        heap_log!(
            self.log,
            Debug,
            "acquired {} bytes of backing memory at {address:p}",
            mapping.len()
        );

        unsafe { self.init(address, size, Some(mapping)) }
    }

    /// Blocks needed for a segment that can hold `size` user bytes.
    #[inline]
    pub fn required_blocks(&self, size: usize) -> usize {
        blocks_for(size.saturating_add(SEGMENT_OVERHEAD), self.block_size)
    }

    /// Slack that justifies splitting a segment after resizing it.
    #[inline]
    fn split_threshold(&self) -> usize {
        blocks_for(HEADER_SIZE + ALIGNMENT, self.block_size)
    }

    /// Best fit search starting at `from`. Returns as soon as a free segment
    /// of exactly `required` blocks shows up, otherwise the smallest free
    /// segment that fits after scanning everything. With `perfect_only` the
    /// smallest candidate is discarded and only exact fits count.
    unsafe fn find_best_fit(
        &mut self,
        from: Pointer<Header<Segment>>,
        required: usize,
        perfect_only: bool,
    ) -> Pointer<Header<Segment>> {
        let mut best: Pointer<Header<Segment>> = None;
        let mut best_blocks = usize::MAX;
        let mut current = from;

        while let Some(segment) = current {
            if segment.as_ref().is_free() && segment.as_ref().blocks() >= required {
                self.inspect(segment);

                let blocks = segment.as_ref().blocks();

                if blocks == required {
                    heap_log!(self.log, Trace, "perfect fit found at {segment:p}");
                    return Some(segment);
                }

                if blocks > required && blocks < best_blocks {
                    best = Some(segment);
                    best_blocks = blocks;
                }
            }

            current = segment.as_ref().next;
        }

        if perfect_only {
            None
        } else {
            best
        }
    }

    /// Finds, claims and possibly splits a segment for `size` user bytes.
    /// Returns the claimed segment, or `None` if nothing fits.
    pub unsafe fn allocate(&mut self, size: usize) -> Pointer<Header<Segment>> {
        let required = self.required_blocks(size);

        heap_log!(self.log, Trace, "allocating {size} bytes, {required} blocks");

        // The cache only short-circuits when it leads to a perfect fit,
        // anything else could miss a smaller segment before it.
        let cached = match self.last_free {
            Some(cached) => self.find_best_fit(Some(cached), required, true),
            None => None,
        };

        let segment = match cached {
            Some(segment) => segment,
            None => {
                let first = self.segments.first();
                match self.find_best_fit(first, required, false) {
                    Some(segment) => segment,
                    None => {
                        heap_log!(
                            self.log,
                            Debug,
                            "no free segment found for {size} bytes ({required} blocks)"
                        );
                        return None;
                    }
                }
            }
        };

        let mut segment = segment;
        segment.as_mut().data.is_free = false;
        segment.as_mut().data.allocation_id = self.next_allocation_id();

        if segment.as_ref().blocks() > required + 1 {
            let remainder = self.split(segment, required);
            self.last_free = Some(remainder);
        } else {
            if self.last_free == Some(segment) {
                self.last_free = None;
            }
            self.seal(segment);
        }

        heap_log!(
            self.log,
            Debug,
            "allocated segment {segment:p}: {} blocks, id {}",
            segment.as_ref().blocks(),
            segment.as_ref().data.allocation_id
        );

        Some(segment)
    }

    fn next_allocation_id(&mut self) -> u32 {
        let id = self.next_allocation_id;
        // 0 means "never allocated", skip it after wrapping around.
        self.next_allocation_id = id.checked_add(1).unwrap_or(1);
        id
    }

    /// Segment splitting. The first `keep` blocks stay in `segment` and the
    /// rest becomes a new free segment right after it.
    ///
    /// **Before**:
    ///
    /// ```text
    /// +--------+-----------------------------------------+
    /// | Header |                 N blocks                |
    /// +--------+-----------------------------------------+
    /// ```
    ///
    /// **After**:
    ///
    /// ```text
    /// +--------+---------------+--------+----------------+
    /// | Header |  keep blocks  | Header | N - keep, free |
    /// +--------+---------------+--------+----------------+
    /// ```
    unsafe fn split(
        &mut self,
        mut segment: NonNull<Header<Segment>>,
        keep: usize,
    ) -> NonNull<Header<Segment>> {
        let remainder_blocks = segment.as_ref().blocks() - keep;
        let address = NonNull::new_unchecked(
            segment
                .as_ptr()
                .cast::<u8>()
                .add(bytes_for(keep, self.block_size)),
        );

        segment.as_mut().data.blocks = keep;

        let remainder = self
            .segments
            .insert_after(segment, Segment::free(remainder_blocks), address);

        self.seal(segment);
        self.seal(remainder);
        if let Some(next) = remainder.as_ref().next {
            self.seal(next);
        }

        heap_log!(
            self.log,
            Trace,
            "segment split: {segment:p} keeps {keep} blocks, {remainder:p} gets {remainder_blocks}"
        );

        remainder
    }

    /// Merges the segment right after `segment` into `segment`. Segments can
    /// only be merged from right to left because the bigger segment has to
    /// start where the first one starts.
    ///
    /// ```text
    /// +----------------+---------------+
    /// |   Segment A    |   Segment B   |
    /// +----------------+---------------+
    ///        ^                 |
    ///        |                 |
    ///        +-----------------+
    ///           Merge B into A
    /// ```
    unsafe fn merge_next(&mut self, mut segment: NonNull<Header<Segment>>) {
        let Some(mut next) = segment.as_ref().next else {
            return;
        };

        self.inspect(segment);
        self.inspect(next);

        if self.last_free == Some(next) {
            self.last_free = Some(segment);
        }

        segment.as_mut().data.blocks += next.as_ref().blocks();
        self.segments.remove(next);

        // Whatever tries to use B as a segment from now on should fail.
        if self.debug {
            next.as_mut().data.magic = 0;
        }

        self.seal(segment);
        if let Some(after) = segment.as_ref().next {
            self.seal(after);
        }

        heap_log!(
            self.log,
            Trace,
            "segments merged: {segment:p} absorbed {next:p}, now {} blocks",
            segment.as_ref().blocks()
        );
    }

    /// Merges `segment` with its free neighbours. Returns the segment that
    /// contains `segment` afterwards, which is the previous one if that was
    /// free.
    unsafe fn coalesce(&mut self, segment: NonNull<Header<Segment>>) -> NonNull<Header<Segment>> {
        if let Some(next) = segment.as_ref().next {
            if next.as_ref().is_free() {
                self.merge_next(segment);
            }
        }

        if let Some(prev) = segment.as_ref().prev {
            if prev.as_ref().is_free() {
                self.merge_next(prev);
                return prev;
            }
        }

        segment
    }

    /// Frees `segment`, zeroing it first according to `scrub`, and merges it
    /// with its free neighbours. Returns `None` on double free.
    pub unsafe fn deallocate(
        &mut self,
        mut segment: NonNull<Header<Segment>>,
        scrub: &ZeroOnFree,
    ) -> Option<Released> {
        self.inspect(segment);

        let address = Header::user_address_of(segment);

        if segment.as_ref().is_free() {
            heap_log!(self.log, Warn, "double free detected for pointer {address:p}");
            return None;
        }

        let released = Released {
            allocation_id: segment.as_ref().data.allocation_id,
            bytes: segment.as_ref().total_size(self.block_size),
        };

        heap_log!(
            self.log,
            Debug,
            "freeing segment {segment:p}: {} blocks, id {}",
            segment.as_ref().blocks(),
            released.allocation_id
        );

        let zeroed = scrub.apply(address, segment.as_ref().usable_size(self.block_size));
        if zeroed > 0 {
            heap_log!(self.log, Trace, "zeroed {zeroed} bytes at {address:p}");
        }

        segment.as_mut().data.is_free = true;
        self.seal(segment);
        self.last_free = Some(segment);

        let merged = self.coalesce(segment);
        self.last_free = Some(merged);

        Some(released)
    }

    /// In-place part of a reallocation. Shrinks or grows the segment when
    /// that's possible without moving the contents, otherwise tells the
    /// caller to move them with [`ResizeOutcome::Move`].
    pub unsafe fn resize(&mut self, resize: &Resize) -> ResizeOutcome {
        let mut segment = resize.segment;
        let blocks = segment.as_ref().blocks();
        let required = resize.required;

        match resize.method {
            ResizeMethod::Same => ResizeOutcome::Unchanged,

            ResizeMethod::Shrink => {
                if blocks <= required + self.split_threshold() {
                    return ResizeOutcome::Unchanged;
                }

                let remainder = self.split(segment, required);
                self.last_free = Some(remainder);
                self.coalesce_forward(remainder);

                heap_log!(
                    self.log,
                    Debug,
                    "shrunk {segment:p} in place from {blocks} to {required} blocks"
                );

                ResizeOutcome::Shrunk(bytes_for(blocks - required, self.block_size))
            }

            ResizeMethod::Grow => {
                let Some(next) = segment.as_ref().next else {
                    return ResizeOutcome::Move;
                };

                if !next.as_ref().is_free() || blocks + next.as_ref().blocks() < required {
                    return ResizeOutcome::Move;
                }

                self.merge_next(segment);

                // The free successor is gone, it belongs to a used segment now.
                if self.last_free == Some(segment) {
                    self.last_free = None;
                }

                if segment.as_ref().blocks() > required + self.split_threshold() {
                    let remainder = self.split(segment, required);
                    self.last_free = Some(remainder);
                    self.coalesce_forward(remainder);
                }

                segment.as_mut().data.is_free = false;
                self.seal(segment);

                let grown = segment.as_ref().blocks() - blocks;

                heap_log!(
                    self.log,
                    Debug,
                    "grew {segment:p} in place from {blocks} to {} blocks",
                    segment.as_ref().blocks()
                );

                ResizeOutcome::Grown(bytes_for(grown, self.block_size))
            }
        }
    }

    /// Merges a freshly split free `segment` with a free successor.
    unsafe fn coalesce_forward(&mut self, segment: NonNull<Header<Segment>>) {
        if let Some(next) = segment.as_ref().next {
            if next.as_ref().is_free() {
                self.merge_next(segment);
            }
        }
    }

    /// Translates a user pointer back into its segment. Rejects addresses
    /// outside of the heap, addresses that don't map to a block boundary and,
    /// in debug mode, segments with a bad magic number.
    pub fn segment_of(&self, address: NonNull<u8>) -> Pointer<Header<Segment>> {
        let base = self.start?.as_ptr() as usize;
        let raw = address.as_ptr() as usize;

        if raw < base + USER_OFFSET || raw >= self.end_address() {
            return None;
        }

        if (align_down(raw, ALIGNMENT) - USER_OFFSET - base) % self.block_size != 0 {
            return None;
        }

        // Inside the heap and at a block boundary, safe to translate.
        let segment = unsafe { Header::from_user_address(address) };

        if self.debug {
            let magic = unsafe { segment.as_ref().data.magic };
            if magic != SEGMENT_MAGIC {
                heap_log!(
                    self.log,
                    Error,
                    "invalid magic number {magic:#010X} in segment {segment:p}"
                );
                return None;
            }
        }

        Some(segment)
    }

    /// Changes the integrity level. Records are only maintained from
    /// [`IntegrityLevel::Standard`] upwards, so they're rewritten for every
    /// segment when the level goes up.
    pub unsafe fn set_integrity(&mut self, level: IntegrityLevel) {
        let previous = self.integrity;
        self.integrity = level;

        if level > previous && level >= IntegrityLevel::Standard {
            self.seal_all();
        }
    }

    /// Snapshot of every segment in address order.
    pub fn segments(&self) -> Vec<SegmentInfo> {
        let Some(start) = self.start else {
            return Vec::new();
        };

        unsafe {
            self.segments
                .iter()
                .map(|segment| {
                    let header = segment.as_ref();
                    SegmentInfo {
                        offset: segment.as_ptr() as usize - start.as_ptr() as usize,
                        blocks: header.blocks(),
                        bytes: header.total_size(self.block_size),
                        is_free: header.is_free(),
                        allocation_id: header.data.allocation_id,
                    }
                })
                .collect()
        }
    }

    /// Number of free segments and the bytes they span.
    pub fn free_space(&self) -> (usize, usize) {
        unsafe {
            self.segments
                .iter()
                .filter(|segment| segment.as_ref().is_free())
                .fold((0, 0), |(count, bytes), segment| {
                    (count + 1, bytes + segment.as_ref().total_size(self.block_size))
                })
        }
    }

    /// Number of segments in the heap.
    #[inline]
    pub fn len(&self) -> usize {
        self.segments.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{scrub::ZeroDepth, test_utils::Arena};

    const BLOCK_SIZE: usize = 256;

    fn store(arena: &mut Arena) -> SegmentStore {
        let mut store = SegmentStore::new(BLOCK_SIZE, IntegrityLevel::Thorough, HeapLog::new(true));
        unsafe { store.init(arena.address(), arena.len(), None).unwrap() };
        store
    }

    /// Smallest allocation that needs exactly `blocks` blocks.
    fn size_for(blocks: usize) -> usize {
        (blocks - 1) * BLOCK_SIZE + 1
    }

    fn layout(store: &SegmentStore) -> Vec<(usize, bool)> {
        store
            .segments()
            .iter()
            .map(|info| (info.blocks, info.is_free))
            .collect()
    }

    /// Adjacent segments end exactly where the next one begins, links are
    /// mutual and the whole heap is covered.
    fn assert_no_gaps(store: &SegmentStore) {
        let segments = store.segments();
        let mut expected_offset = 0;

        for info in &segments {
            assert_eq!(info.offset, expected_offset);
            expected_offset += info.bytes;
        }

        assert_eq!(expected_offset, store.capacity());

        unsafe {
            for segment in store.segments.iter() {
                if let Some(next) = segment.as_ref().next {
                    assert_eq!(next.as_ref().prev, Some(segment));
                }
            }
        }
    }

    #[test]
    fn init_creates_single_free_segment() {
        let mut arena = Arena::new(BLOCK_SIZE * 16);
        let store = store(&mut arena);

        assert_eq!(layout(&store), vec![(16, true)]);
        assert_eq!(store.capacity(), BLOCK_SIZE * 16);
        assert_eq!(store.last_free, store.segments.first());
    }

    #[test]
    fn init_rejects_small_and_repeated_buffers() {
        let mut arena = Arena::new(BLOCK_SIZE * 4);
        let mut store = SegmentStore::new(BLOCK_SIZE, IntegrityLevel::Basic, HeapLog::new(false));

        unsafe {
            assert_eq!(
                store.init(arena.address(), BLOCK_SIZE, None),
                Err(HeapInitError::BufferTooSmall {
                    size: BLOCK_SIZE,
                    required: HEADER_SIZE + BLOCK_SIZE
                })
            );
            assert!(!store.is_initialized());

            store.init(arena.address(), arena.len(), None).unwrap();
            assert_eq!(
                store.init(arena.address(), arena.len(), None),
                Err(HeapInitError::AlreadyInitialized)
            );
        }
    }

    #[test]
    fn init_aligns_start() {
        let mut arena = Arena::new(BLOCK_SIZE * 4);
        let mut store = SegmentStore::new(BLOCK_SIZE, IntegrityLevel::Basic, HeapLog::new(false));

        unsafe {
            let unaligned = NonNull::new_unchecked(arena.address().as_ptr().add(3));
            store.init(unaligned, arena.len() - 3, None).unwrap();

            let start = store.start.unwrap().as_ptr() as usize;
            assert_eq!(start % ALIGNMENT, 0);
            assert_eq!(start - arena.address().as_ptr() as usize, ALIGNMENT);
            // Losing the alignment adjustment costs the last partial block.
            assert_eq!(layout(&store), vec![(3, true)]);
        }
    }

    #[test]
    fn allocate_splits_and_tracks_last_free() {
        let mut arena = Arena::new(BLOCK_SIZE * 16);
        let mut store = store(&mut arena);

        unsafe {
            let first = store.allocate(100).unwrap();
            assert_eq!(layout(&store), vec![(1, false), (15, true)]);
            assert_eq!(store.last_free, first.as_ref().next);
            assert_eq!(first.as_ref().data.allocation_id, 1);

            let second = store.allocate(size_for(3)).unwrap();
            assert_eq!(second.as_ref().data.allocation_id, 2);
            assert_eq!(layout(&store), vec![(1, false), (3, false), (12, true)]);

            // One block of slack is not worth a segment.
            let third = store.allocate(size_for(11)).unwrap();
            assert_eq!(layout(&store), vec![(1, false), (3, false), (12, false)]);
            assert_eq!(store.last_free, None);
            assert_eq!(third.as_ref().blocks(), 12);

            assert_eq!(store.allocate(1), None);
        }

        assert_no_gaps(&store);
        assert!(store.verify(false).unwrap().is_clean());
    }

    #[test]
    fn required_blocks_include_overhead() {
        let mut arena = Arena::new(BLOCK_SIZE * 4);
        let store = store(&mut arena);

        assert_eq!(store.required_blocks(1), 1);
        assert_eq!(store.required_blocks(BLOCK_SIZE - SEGMENT_OVERHEAD), 1);
        assert_eq!(store.required_blocks(BLOCK_SIZE - SEGMENT_OVERHEAD + 1), 2);
        assert_eq!(store.required_blocks(usize::MAX), blocks_for(usize::MAX, BLOCK_SIZE));
    }

    #[test]
    fn usable_size_covers_request() {
        let mut arena = Arena::new(BLOCK_SIZE * 64);
        let mut store = store(&mut arena);

        for size in [1, 17, 100, BLOCK_SIZE, 3 * BLOCK_SIZE - 7, 10 * BLOCK_SIZE] {
            unsafe {
                let segment = store.allocate(size).unwrap();
                assert!(segment.as_ref().usable_size(BLOCK_SIZE) >= size);
                assert!(!segment.as_ref().is_free());

                let address = Header::user_address_of(segment);
                assert_eq!(store.segment_of(address), Some(segment));
            }
        }
    }

    #[test]
    fn best_fit_prefers_exact_match() {
        // Free segments of 5, 3 and 8 blocks separated by used ones.
        let mut arena = Arena::new(BLOCK_SIZE * 20);
        let mut store = store(&mut arena);

        unsafe {
            let a = store.allocate(size_for(5)).unwrap();
            let _b = store.allocate(size_for(1)).unwrap();
            let c = store.allocate(size_for(3)).unwrap();
            let _d = store.allocate(size_for(1)).unwrap();
            let e = store.allocate(size_for(8)).unwrap();
            let _f = store.allocate(size_for(2)).unwrap();
            assert_eq!(store.segments.len(), 6);

            let scrub = ZeroOnFree::default();
            store.deallocate(a, &scrub).unwrap();
            store.deallocate(c, &scrub).unwrap();
            store.deallocate(e, &scrub).unwrap();

            let chosen = store.allocate(size_for(3)).unwrap();
            assert_eq!(chosen, c);
        }
    }

    #[test]
    fn best_fit_picks_smallest_adequate() {
        let mut arena = Arena::new(BLOCK_SIZE * 20);
        let mut store = store(&mut arena);

        unsafe {
            let a = store.allocate(size_for(8)).unwrap();
            let _b = store.allocate(size_for(1)).unwrap();
            let c = store.allocate(size_for(5)).unwrap();
            let _d = store.allocate(size_for(6)).unwrap();

            let scrub = ZeroOnFree::default();
            store.deallocate(a, &scrub).unwrap();
            store.deallocate(c, &scrub).unwrap();

            // Last free is `c`, but only a perfect fit would short-circuit.
            let chosen = store.allocate(size_for(2)).unwrap();
            assert_eq!(chosen, c);
            assert_eq!(layout(&store)[2..], [(2, false), (3, true), (6, false)]);
        }

        assert_no_gaps(&store);
    }

    #[test]
    fn coalescing_in_any_order() {
        let orders: [[usize; 3]; 6] = [
            [0, 1, 2],
            [0, 2, 1],
            [1, 0, 2],
            [1, 2, 0],
            [2, 0, 1],
            [2, 1, 0],
        ];

        for order in orders {
            let mut arena = Arena::new(BLOCK_SIZE * 16);
            let mut store = store(&mut arena);

            unsafe {
                let segments = [
                    store.allocate(size_for(2)).unwrap(),
                    store.allocate(size_for(3)).unwrap(),
                    store.allocate(size_for(4)).unwrap(),
                ];
                let guard = store.allocate(size_for(1)).unwrap();

                for index in order {
                    store.deallocate(segments[index], &ZeroOnFree::default()).unwrap();
                    assert_no_gaps(&store);
                }

                assert_eq!(layout(&store), vec![(9, true), (1, false), (6, true)]);
                assert_eq!(store.last_free, Some(segments[0]));

                store.deallocate(guard, &ZeroOnFree::default()).unwrap();
                assert_eq!(layout(&store), vec![(16, true)]);
            }

            assert!(store.verify(false).unwrap().is_clean(), "{order:?}");
        }
    }

    #[test]
    fn double_free_is_ignored() {
        let mut arena = Arena::new(BLOCK_SIZE * 8);
        let mut store = store(&mut arena);

        unsafe {
            let a = store.allocate(100).unwrap();
            let _b = store.allocate(100).unwrap();

            assert!(store.deallocate(a, &ZeroOnFree::default()).is_some());
            assert_eq!(store.deallocate(a, &ZeroOnFree::default()), None);
        }

        assert_eq!(layout(&store), vec![(1, true), (1, false), (6, true)]);
    }

    #[test]
    fn deallocate_zeroes_user_data() {
        let mut arena = Arena::new(BLOCK_SIZE * 8);
        let mut store = store(&mut arena);

        unsafe {
            let a = store.allocate(100).unwrap();
            let _b = store.allocate(100).unwrap();
            let usable = a.as_ref().usable_size(BLOCK_SIZE);
            let address = Header::user_address_of(a);
            address.as_ptr().write_bytes(0xAA, usable);

            let scrub = ZeroOnFree::new(ZeroDepth::Deep, 64);
            let released = store.deallocate(a, &scrub).unwrap();
            assert_eq!(released.bytes, BLOCK_SIZE);
            assert_eq!(released.allocation_id, 1);

            let data = std::slice::from_raw_parts(address.as_ptr(), usable);
            assert!(data.iter().all(|byte| *byte == 0));
        }

        // The footer survived, zeroing stops before it.
        assert!(store.verify(false).unwrap().is_clean());
    }

    #[test]
    fn shrink_returns_slack() {
        let mut arena = Arena::new(BLOCK_SIZE * 16);
        let mut store = store(&mut arena);

        unsafe {
            let segment = store.allocate(size_for(6)).unwrap();
            let address = Header::user_address_of(segment);
            let required = store.required_blocks(100);

            let resize = Resize::new(segment, address, 100, required, BLOCK_SIZE);
            assert_eq!(store.resize(&resize), ResizeOutcome::Shrunk(5 * BLOCK_SIZE));

            // The slack merged with the free tail.
            assert_eq!(layout(&store), vec![(1, false), (15, true)]);
            assert_eq!(store.last_free, segment.as_ref().next);
        }

        assert_no_gaps(&store);
        assert!(store.verify(false).unwrap().is_clean());
    }

    #[test]
    fn shrink_keeps_small_slack() {
        let mut arena = Arena::new(BLOCK_SIZE * 16);
        let mut store = store(&mut arena);

        unsafe {
            let segment = store.allocate(size_for(2)).unwrap();
            let address = Header::user_address_of(segment);

            let resize = Resize::new(segment, address, 1, 1, BLOCK_SIZE);
            assert_eq!(store.resize(&resize), ResizeOutcome::Unchanged);
            assert_eq!(segment.as_ref().blocks(), 2);
        }
    }

    #[test]
    fn grow_in_place_uses_free_successor() {
        let mut arena = Arena::new(BLOCK_SIZE * 16);
        let mut store = store(&mut arena);

        unsafe {
            let segment = store.allocate(size_for(2)).unwrap();
            let address = Header::user_address_of(segment);
            let required = store.required_blocks(size_for(5));

            let resize = Resize::new(segment, address, size_for(5), required, BLOCK_SIZE);
            assert_eq!(store.resize(&resize), ResizeOutcome::Grown(3 * BLOCK_SIZE));

            assert_eq!(layout(&store), vec![(5, false), (11, true)]);
            assert_eq!(store.last_free, segment.as_ref().next);
            assert!(!segment.as_ref().is_free());
        }

        assert!(store.verify(false).unwrap().is_clean());
    }

    #[test]
    fn grow_in_place_consumes_whole_successor() {
        let mut arena = Arena::new(BLOCK_SIZE * 16);
        let mut store = store(&mut arena);

        unsafe {
            let segment = store.allocate(size_for(2)).unwrap();
            let next = store.allocate(size_for(3)).unwrap();
            let _tail = store.allocate(size_for(11)).unwrap();
            store.deallocate(next, &ZeroOnFree::default()).unwrap();
            assert_eq!(store.last_free, Some(next));

            let address = Header::user_address_of(segment);
            let required = store.required_blocks(size_for(5));
            let resize = Resize::new(segment, address, size_for(5), required, BLOCK_SIZE);

            assert_eq!(store.resize(&resize), ResizeOutcome::Grown(3 * BLOCK_SIZE));
            assert_eq!(layout(&store), vec![(5, false), (11, false)]);
            assert_eq!(store.last_free, None);
        }
    }

    #[test]
    fn grow_needs_move_when_successor_is_used() {
        let mut arena = Arena::new(BLOCK_SIZE * 16);
        let mut store = store(&mut arena);

        unsafe {
            let segment = store.allocate(size_for(2)).unwrap();
            let _next = store.allocate(size_for(1)).unwrap();

            let address = Header::user_address_of(segment);
            let required = store.required_blocks(size_for(4));
            let resize = Resize::new(segment, address, size_for(4), required, BLOCK_SIZE);

            assert_eq!(store.resize(&resize), ResizeOutcome::Move);
            assert_eq!(layout(&store), vec![(2, false), (1, false), (13, true)]);
        }
    }

    #[test]
    fn segment_of_rejects_foreign_addresses() {
        let mut arena = Arena::new(BLOCK_SIZE * 8);
        let mut store = store(&mut arena);

        unsafe {
            let segment = store.allocate(100).unwrap();
            let address = Header::user_address_of(segment);

            assert_eq!(store.segment_of(address), Some(segment));

            let inside = NonNull::new_unchecked(address.as_ptr().add(ALIGNMENT * 2));
            assert_eq!(store.segment_of(inside), None);

            let before = arena.address();
            assert_eq!(store.segment_of(before), None);

            let mut outside = [0u8; 4];
            assert_eq!(store.segment_of(NonNull::from(&mut outside).cast()), None);

            // Merged away segments lose their magic in debug mode.
            let next = store.allocate(100).unwrap();
            let next_address = Header::user_address_of(next);
            store.deallocate(next, &ZeroOnFree::default()).unwrap();
            store.deallocate(segment, &ZeroOnFree::default()).unwrap();
            assert_eq!(store.segment_of(next_address), None);
        }
    }

    #[test]
    fn free_space_and_snapshot() {
        let mut arena = Arena::new(BLOCK_SIZE * 8);
        let mut store = store(&mut arena);

        unsafe {
            let a = store.allocate(100).unwrap();
            let _b = store.allocate(100).unwrap();
            store.deallocate(a, &ZeroOnFree::default()).unwrap();
        }

        assert_eq!(store.free_space(), (2, 7 * BLOCK_SIZE));

        let snapshot = store.segments();
        assert_eq!(snapshot.len(), 3);
        assert_eq!(
            snapshot[1],
            SegmentInfo {
                offset: BLOCK_SIZE,
                blocks: 1,
                bytes: BLOCK_SIZE,
                is_free: false,
                allocation_id: 2,
            }
        );
    }
}
