use std::ptr::NonNull;

use crate::{header::Header, segment::Segment};

/// Carries resize metadata around so that we don't pass the same parameters
/// over and over again. For the actual resizing, see
/// [`crate::store::SegmentStore::resize`] and [`crate::allocator::Heap`].
pub(crate) struct Resize {
    /// Segment whose contents we are resizing.
    pub segment: NonNull<Header<Segment>>,
    /// Current user pointer of `segment`.
    pub address: NonNull<u8>,
    /// Requested size in bytes.
    pub new_size: usize,
    /// Bytes the user could write before resizing.
    pub old_usable: usize,
    /// Blocks the segment needs to hold `new_size` bytes.
    pub required: usize,
    pub method: ResizeMethod,
}

/// Whether the segment needs fewer, more or the same number of blocks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ResizeMethod {
    Same,
    Shrink,
    Grow,
}

/// What the store managed to do in place.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ResizeOutcome {
    /// Nothing changed, the current segment already fits.
    Unchanged,
    /// The segment gave this many bytes back to the free list.
    Shrunk(usize),
    /// The segment absorbed this many bytes from its free successor.
    Grown(usize),
    /// Growing in place is not possible, contents have to move.
    Move,
}

impl Resize {
    /// Builds a new [`Resize`]. `required` is the block count computed by the
    /// store for `new_size`.
    ///
    /// # Safety
    ///
    /// `segment` must be a valid used segment and `address` its user pointer.
    pub unsafe fn new(
        segment: NonNull<Header<Segment>>,
        address: NonNull<u8>,
        new_size: usize,
        required: usize,
        block_size: usize,
    ) -> Self {
        let header = segment.as_ref();

        let method = match required.cmp(&header.blocks()) {
            std::cmp::Ordering::Less => ResizeMethod::Shrink,
            std::cmp::Ordering::Equal => ResizeMethod::Same,
            std::cmp::Ordering::Greater => ResizeMethod::Grow,
        };

        Self {
            segment,
            address,
            new_size,
            old_usable: header.usable_size(block_size),
            required,
            method,
        }
    }

    /// Number of bytes that should be copied when the contents move. If we
    /// are shrinking, we only need enough bytes to fill the new size,
    /// otherwise everything the old segment could hold.
    pub fn count(&self) -> usize {
        self.old_usable.min(self.new_size)
    }
}
