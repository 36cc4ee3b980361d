//! Corruption detection for segment metadata.
//!
//! Every level includes the checks of the levels below it:
//!
//! | Level        | Checks                                                  |
//! |--------------|---------------------------------------------------------|
//! | `Disabled`   | nothing                                                 |
//! | `Basic`      | magic number, block count sanity                        |
//! | `Standard`   | header guard, checksum of the header fields             |
//! | `Thorough`   | footer guard, `next.prev`/`prev.next` links, bounds     |
//!
//! The guard and the checksum live in an [`IntegrityRecord`] between the
//! header and the user data, the footer guard in the last 4 bytes of the
//! segment. They are rewritten by [`SegmentStore::seal`] every time the store
//! changes a header, so a mismatch always means someone else wrote there.

use std::{fmt, hash::Hasher, mem, ptr::NonNull};

use crate::{
    error::{IntegrityError, SettingError},
    header::Header,
    segment::{Segment, HEADER_SIZE, SEGMENT_MAGIC},
    store::SegmentStore,
};

pub(crate) const HEADER_GUARD: u32 = 0xFEED_FACE;
pub(crate) const FOOTER_GUARD: u32 = 0xDEAD_C0DE;

/// How strict the integrity checks are. See the module documentation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum IntegrityLevel {
    Disabled = 0,
    #[default]
    Basic = 1,
    Standard = 2,
    Thorough = 3,
}

impl TryFrom<u8> for IntegrityLevel {
    type Error = SettingError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Disabled),
            1 => Ok(Self::Basic),
            2 => Ok(Self::Standard),
            3 => Ok(Self::Thorough),
            _ => Err(SettingError::InvalidIntegrityLevel(value)),
        }
    }
}

impl fmt::Display for IntegrityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disabled => "disabled",
            Self::Basic => "basic",
            Self::Standard => "standard",
            Self::Thorough => "thorough",
        };

        write!(f, "{} ({name})", *self as u8)
    }
}

/// Stored right after every [`Header<Segment>`].
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct IntegrityRecord {
    pub header_guard: u32,
    pub checksum: u32,
}

pub(crate) const INTEGRITY_RECORD_SIZE: usize = mem::size_of::<IntegrityRecord>();

/// Result of a whole heap scan.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IntegrityReport {
    pub segments_verified: usize,
    /// Problems found. When repairing, this still counts every problem found,
    /// not the ones left behind.
    pub errors: usize,
    /// Segments that had at least one problem fixed.
    pub segments_repaired: usize,
}

impl IntegrityReport {
    pub fn is_clean(&self) -> bool {
        self.errors == 0
    }
}

/// 32 bit FNV-1a.
pub(crate) struct Fnv1a(u32);

impl Fnv1a {
    const OFFSET_BASIS: u32 = 2_166_136_261;
    const PRIME: u32 = 16_777_619;
}

impl Default for Fnv1a {
    fn default() -> Self {
        Self(Self::OFFSET_BASIS)
    }
}

impl Hasher for Fnv1a {
    fn write(&mut self, bytes: &[u8]) {
        for byte in bytes {
            self.0 ^= u32::from(*byte);
            self.0 = self.0.wrapping_mul(Self::PRIME);
        }
    }

    fn finish(&self) -> u64 {
        u64::from(self.0)
    }
}

/// Checksum over the identity fields of a segment header. Guards are not
/// included, so repairing a guard never invalidates the checksum.
pub(crate) fn checksum(header: &Header<Segment>) -> u32 {
    let address_of =
        |link: Option<NonNull<Header<Segment>>>| link.map_or(0, |node| node.as_ptr() as usize);

    let mut hasher = Fnv1a::default();
    hasher.write_u8(u8::from(header.data.is_free));
    hasher.write_usize(header.data.blocks);
    hasher.write_usize(address_of(header.next));
    hasher.write_usize(address_of(header.prev));
    hasher.write_u32(header.data.allocation_id);
    hasher.write_u32(header.data.magic);

    hasher.finish() as u32
}

impl SegmentStore {
    /// Rewrites the integrity record and the footer guard of `segment`. Only
    /// does something from [`IntegrityLevel::Standard`] upwards.
    pub(crate) unsafe fn seal(&self, segment: NonNull<Header<Segment>>) {
        if self.integrity < IntegrityLevel::Standard {
            return;
        }

        Header::integrity_of(segment).as_ptr().write(IntegrityRecord {
            header_guard: HEADER_GUARD,
            checksum: checksum(segment.as_ref()),
        });

        if self.has_sane_size(segment) {
            Header::footer_of(segment, self.block_size)
                .as_ptr()
                .write(FOOTER_GUARD);
        }
    }

    /// Seals every segment in the heap. Used when checks get stricter, since
    /// records were not maintained below [`IntegrityLevel::Standard`].
    pub(crate) unsafe fn seal_all(&self) {
        for segment in self.segments.iter() {
            self.seal(segment);
        }
    }

    /// Whether `segment` could be a header of this heap: inside the buffer
    /// and at a block boundary.
    pub(crate) fn contains_segment(&self, segment: NonNull<Header<Segment>>) -> bool {
        let Some(start) = self.start else {
            return false;
        };

        let start = start.as_ptr() as usize;
        let address = segment.as_ptr() as usize;

        address >= start
            && address - start < self.length
            && (address - start) % self.block_size == 0
    }

    /// At least one block and not past the end of the heap.
    pub(crate) unsafe fn has_sane_size(&self, segment: NonNull<Header<Segment>>) -> bool {
        segment.as_ref().blocks() >= 1
            && Header::end_address_of(segment, self.block_size) <= self.end_address()
    }

    /// Block count derived from where the next segment starts, or from the
    /// end of the heap for the last segment.
    unsafe fn inferred_blocks(&self, segment: NonNull<Header<Segment>>) -> Option<usize> {
        let address = segment.as_ptr() as usize;

        let end = match segment.as_ref().next {
            Some(next) if self.contains_segment(next) => next.as_ptr() as usize,
            Some(_) => return None,
            None => self.end_address(),
        };

        let blocks = end.checked_sub(address)? / self.block_size;

        (blocks >= 1).then_some(blocks)
    }

    /// Checks one segment at the configured level and returns the number of
    /// problems found. With `repair` every problem is fixed as soon as it's
    /// found, so later checks see the fixed values.
    pub(crate) unsafe fn verify_segment(
        &mut self,
        mut segment: NonNull<Header<Segment>>,
        repair: bool,
    ) -> usize {
        if self.integrity == IntegrityLevel::Disabled {
            return 0;
        }

        // Nothing else can be read safely from outside the heap.
        if self.integrity >= IntegrityLevel::Thorough && !self.contains_segment(segment) {
            heap_log!(self.log, Error, "corruption: segment {segment:p} is outside of the heap");
            return 1;
        }

        let mut errors = 0;

        let magic = segment.as_ref().data.magic;
        if magic != SEGMENT_MAGIC {
            errors += 1;
            heap_log!(
                self.log,
                Error,
                "corruption: invalid magic number in segment {segment:p}: {magic:#010X}"
            );
            if repair {
                segment.as_mut().data.magic = SEGMENT_MAGIC;
            }
        }

        if !self.has_sane_size(segment) {
            errors += 1;
            heap_log!(
                self.log,
                Error,
                "corruption: unreasonable size in segment {segment:p}: {} blocks",
                segment.as_ref().blocks()
            );
            if repair {
                if let Some(blocks) = self.inferred_blocks(segment) {
                    segment.as_mut().data.blocks = blocks;
                    heap_log!(self.log, Debug, "repaired size of {segment:p}: {blocks} blocks");
                }
            }
        }

        if self.integrity < IntegrityLevel::Standard {
            return errors;
        }

        let mut record = Header::integrity_of(segment);

        let guard = record.as_ref().header_guard;
        if guard != HEADER_GUARD {
            errors += 1;
            heap_log!(
                self.log,
                Error,
                "corruption: invalid header guard in segment {segment:p}: {guard:#010X}"
            );
            if repair {
                record.as_mut().header_guard = HEADER_GUARD;
            }
        }

        let expected = checksum(segment.as_ref());
        let stored = record.as_ref().checksum;
        if stored != expected {
            errors += 1;
            heap_log!(
                self.log,
                Error,
                "corruption: invalid checksum in segment {segment:p}: {stored:#010X} != {expected:#010X}"
            );
            if repair {
                record.as_mut().checksum = expected;
            }
        }

        if self.integrity < IntegrityLevel::Thorough {
            return errors;
        }

        if self.has_sane_size(segment) {
            let mut footer = Header::footer_of(segment, self.block_size);
            let value = *footer.as_ref();
            if value != FOOTER_GUARD {
                errors += 1;
                heap_log!(
                    self.log,
                    Error,
                    "corruption: invalid footer guard in segment {segment:p}: {value:#010X}"
                );
                if repair {
                    *footer.as_mut() = FOOTER_GUARD;
                }
            }
        }

        if let Some(mut next) = segment.as_ref().next {
            if self.contains_segment(next) && next.as_ref().prev != Some(segment) {
                errors += 1;
                heap_log!(
                    self.log,
                    Error,
                    "corruption: broken link, {segment:p}->next->prev != {segment:p}"
                );
                if repair {
                    next.as_mut().prev = Some(segment);
                    self.seal(next);
                }
            }
        }

        if let Some(mut prev) = segment.as_ref().prev {
            if self.contains_segment(prev) && prev.as_ref().next != Some(segment) {
                errors += 1;
                heap_log!(
                    self.log,
                    Error,
                    "corruption: broken link, {segment:p}->prev->next != {segment:p}"
                );
                if repair {
                    prev.as_mut().next = Some(segment);
                    self.seal(prev);
                }
            }
        }

        errors
    }

    /// Eager check done by the store whenever it touches a segment in debug
    /// mode. Problems are repaired on the spot.
    pub(crate) unsafe fn inspect(&mut self, segment: NonNull<Header<Segment>>) {
        if !self.debug {
            return;
        }

        let errors = self.verify_segment(segment, true);

        if errors > 0 {
            heap_log!(
                self.log,
                Warn,
                "corruption: found and repaired {errors} errors in segment {segment:p}"
            );
        }
    }

    /// Walks the whole segment list verifying every segment.
    ///
    /// The walk stops early, counting one more error, when a `next` link
    /// leaves the heap, points backwards or is not at a block boundary,
    /// because following it would read garbage.
    pub(crate) fn verify(&mut self, repair: bool) -> Result<IntegrityReport, IntegrityError> {
        if !self.is_initialized() {
            heap_log!(self.log, Warn, "cannot verify heap integrity, heap not initialized");
            return Err(IntegrityError::Uninitialized);
        }

        let mut report = IntegrityReport::default();
        let max_segments = self.length / self.block_size;
        let mut current = self.segments.first();

        while let Some(segment) = current {
            if report.segments_verified >= max_segments {
                report.errors += 1;
                heap_log!(self.log, Error, "corruption: segment list has a cycle");
                break;
            }

            let errors = unsafe { self.verify_segment(segment, repair) };
            report.segments_verified += 1;
            report.errors += errors;
            if errors > 0 && repair {
                report.segments_repaired += 1;
            }

            let next = unsafe { segment.as_ref().next };

            if let Some(next) = next {
                if !self.contains_segment(next) || next <= segment {
                    report.errors += 1;
                    heap_log!(
                        self.log,
                        Error,
                        "corruption: segment {segment:p} links to invalid next segment {next:p}"
                    );
                    break;
                }
            }

            current = next;
        }

        if report.errors > 0 {
            heap_log!(
                self.log,
                Warn,
                "integrity scan: {} segments checked, {} errors found, {} segments repaired",
                report.segments_verified,
                report.errors,
                report.segments_repaired
            );
        } else {
            heap_log!(
                self.log,
                Debug,
                "integrity scan: {} segments checked, no errors",
                report.segments_verified
            );
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use log::Level;

    use super::*;
    use crate::{align::ALIGNMENT, logging::HeapLog, test_utils::Arena};

    fn store(level: IntegrityLevel, arena: &mut Arena) -> SegmentStore {
        let mut store = SegmentStore::new(256, level, HeapLog::new(false));
        unsafe { store.init(arena.address(), arena.len(), None).unwrap() };
        store
    }

    #[test]
    fn fnv1a_reference_values() {
        let mut hasher = Fnv1a::default();
        assert_eq!(hasher.finish(), 0x811C_9DC5);

        hasher.write(b"a");
        assert_eq!(hasher.finish(), 0xE40C_292C);

        let mut hasher = Fnv1a::default();
        hasher.write(b"foobar");
        assert_eq!(hasher.finish(), 0xBF9C_F968);
    }

    #[test]
    fn level_conversion() {
        assert_eq!(IntegrityLevel::try_from(3), Ok(IntegrityLevel::Thorough));
        assert_eq!(
            IntegrityLevel::try_from(4),
            Err(SettingError::InvalidIntegrityLevel(4))
        );
        assert!(IntegrityLevel::Basic < IntegrityLevel::Standard);
        assert_eq!(IntegrityLevel::Standard.to_string(), "2 (standard)");
    }

    #[test]
    fn checksum_covers_identity_fields() {
        let mut arena = Arena::new(4096);
        let store = store(IntegrityLevel::Thorough, &mut arena);

        unsafe {
            let mut segment = store.segments.first().unwrap();
            let before = checksum(segment.as_ref());

            segment.as_mut().data.allocation_id = 7;
            assert_ne!(checksum(segment.as_ref()), before);

            segment.as_mut().data.allocation_id = 0;
            assert_eq!(checksum(segment.as_ref()), before);
        }
    }

    #[test]
    fn fresh_heap_is_clean_at_every_level() {
        for level in [
            IntegrityLevel::Disabled,
            IntegrityLevel::Basic,
            IntegrityLevel::Standard,
            IntegrityLevel::Thorough,
        ] {
            let mut arena = Arena::new(8192);
            let mut store = store(level, &mut arena);

            unsafe {
                let a = store.allocate(100).unwrap();
                let _b = store.allocate(300).unwrap();
                store.deallocate(a, &Default::default());
            }

            let report = store.verify(false).unwrap();
            assert_eq!(report.segments_verified, 3);
            assert!(report.is_clean(), "{level:?}: {report:?}");
        }
    }

    #[test]
    fn magic_corruption_is_repaired_once() {
        let mut arena = Arena::new(8192);
        let mut store = store(IntegrityLevel::Standard, &mut arena);

        unsafe {
            let mut segment = store.allocate(100).unwrap();
            segment.as_mut().data.magic = 0xBAD;
        }

        // Without repair the checksum disagrees too.
        assert_eq!(store.verify(false).unwrap().errors, 2);

        // The magic is fixed before the checksum is computed, so the stored
        // checksum matches again.
        let first = store.verify(true).unwrap();
        assert_eq!(first.errors, 1);
        assert_eq!(first.segments_repaired, 1);

        let second = store.verify(true).unwrap();
        assert!(second.is_clean());
    }

    #[test]
    fn guards_and_size_are_repaired() {
        let mut arena = Arena::new(8192);
        let mut store = store(IntegrityLevel::Thorough, &mut arena);

        unsafe {
            let mut first = store.allocate(100).unwrap();
            let second = store.allocate(100).unwrap();

            Header::integrity_of(second).as_mut().header_guard = 0;
            Header::footer_of(second, store.block_size).as_ptr().write(0);
            first.as_mut().data.blocks = 0;
        }

        let report = store.verify(true).unwrap();
        // First: size, inferred back from the next segment before the
        // checksum is computed. Second: header guard and footer guard.
        assert_eq!(report.errors, 3);
        assert_eq!(report.segments_repaired, 2);

        unsafe {
            let first = store.segments.first().unwrap();
            assert_eq!(first.as_ref().blocks(), 1);
        }

        assert!(store.verify(true).unwrap().is_clean());
    }

    #[test]
    fn detection_without_repair_is_stable() {
        let mut arena = Arena::new(8192);
        let mut store = store(IntegrityLevel::Standard, &mut arena);

        unsafe {
            let segment = store.allocate(100).unwrap();
            Header::integrity_of(segment).as_mut().checksum ^= 1;
        }

        assert_eq!(store.verify(false).unwrap().errors, 1);
        assert_eq!(store.verify(false).unwrap().errors, 1);
    }

    #[test]
    fn broken_link_is_repaired() {
        let mut arena = Arena::new(8192);
        let mut store = store(IntegrityLevel::Thorough, &mut arena);

        unsafe {
            let first = store.allocate(100).unwrap();
            let mut second = first.as_ref().next.unwrap();
            second.as_mut().prev = None;
        }

        let report = store.verify(true).unwrap();
        assert!(report.errors > 0);
        assert!(store.verify(true).unwrap().is_clean());
    }

    #[test]
    fn walk_stops_on_link_outside_heap() {
        let mut arena = Arena::new(8192);
        let mut store = store(IntegrityLevel::Basic, &mut arena);

        unsafe {
            let mut segment = store.allocate(100).unwrap();
            segment.as_mut().next = Some(NonNull::dangling());
        }

        let report = store.verify(false).unwrap();
        assert_eq!(report.segments_verified, 1);
        assert_eq!(report.errors, 1);
    }

    #[test]
    fn raising_level_seals_existing_segments() {
        let mut arena = Arena::new(8192);
        let mut store = store(IntegrityLevel::Basic, &mut arena);

        unsafe {
            store.allocate(100).unwrap();
            store.set_integrity(IntegrityLevel::Thorough);
        }

        assert!(store.verify(false).unwrap().is_clean());
    }

    /// Debug mode store whose warnings end up in the returned vector.
    fn debug_store(
        level: IntegrityLevel,
        arena: &mut Arena,
    ) -> (SegmentStore, Arc<Mutex<Vec<(Level, String)>>>) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink_lines = Arc::clone(&lines);

        let mut log = HeapLog::new(true);
        log.set_sink(Arc::new(move |level: Level, message: &fmt::Arguments<'_>| {
            if level <= Level::Warn {
                sink_lines.lock().unwrap().push((level, message.to_string()));
            }
        }));

        let mut store = SegmentStore::new(256, level, log);
        unsafe { store.init(arena.address(), arena.len(), None).unwrap() };

        (store, lines)
    }

    fn repair_warnings(lines: &Mutex<Vec<(Level, String)>>) -> usize {
        lines
            .lock()
            .unwrap()
            .iter()
            .filter(|(level, message)| *level == Level::Warn && message.contains("found and repaired"))
            .count()
    }

    #[test]
    fn debug_mode_repairs_segments_touched_by_merge() {
        let mut arena = Arena::new(8192);
        let (mut store, lines) = debug_store(IntegrityLevel::Standard, &mut arena);

        unsafe {
            let a = store.allocate(100).unwrap();
            let b = store.allocate(100).unwrap();
            store.deallocate(a, &Default::default()).unwrap();

            Header::integrity_of(a).as_mut().header_guard = 0;

            // Freeing the neighbour merges it into the corrupted segment.
            store.deallocate(b, &Default::default()).unwrap();

            assert_eq!(store.segments.len(), 1);
            assert_eq!(store.segments.first(), Some(a));
        }

        assert_eq!(repair_warnings(&lines), 1);
        assert!(store.verify(false).unwrap().is_clean());
    }

    #[test]
    fn debug_mode_repairs_segments_touched_by_search() {
        let mut arena = Arena::new(8192);
        let (mut store, lines) = debug_store(IntegrityLevel::Standard, &mut arena);

        unsafe {
            let a = store.allocate(100).unwrap();
            let _b = store.allocate(100).unwrap();
            store.deallocate(a, &Default::default()).unwrap();

            let mut free = a;
            free.as_mut().data.magic = 0xBAD;

            // Perfect fit through the last free cache.
            assert_eq!(store.allocate(100), Some(a));
            assert_eq!(a.as_ref().data.magic, SEGMENT_MAGIC);
        }

        assert_eq!(repair_warnings(&lines), 1);
        assert!(store.verify(false).unwrap().is_clean());
    }

    #[test]
    fn segment_outside_heap_is_rejected() {
        let mut arena = Arena::new(8192);
        let mut store = store(IntegrityLevel::Thorough, &mut arena);

        unsafe {
            // Neither address is ever read.
            let first = store.segments.first().unwrap();
            let misaligned = NonNull::new_unchecked(first.as_ptr().cast::<u8>().add(ALIGNMENT)).cast();

            assert_eq!(store.verify_segment(NonNull::dangling(), true), 1);
            assert_eq!(store.verify_segment(misaligned, true), 1);
        }

        assert!(store.verify(false).unwrap().is_clean());
    }

    #[test]
    fn uninitialized_heap() {
        let mut store = SegmentStore::new(256, IntegrityLevel::Basic, HeapLog::new(false));
        assert_eq!(store.verify(false), Err(IntegrityError::Uninitialized));
    }

    #[test]
    fn header_size_leaves_room_for_record() {
        assert!(HEADER_SIZE % mem::align_of::<IntegrityRecord>() == 0);
    }
}
