use std::ptr::NonNull;

use crate::{
    align::{align_down, ALIGNMENT},
    integrity::IntegrityRecord,
    list::Node,
    segment::{Segment, FOOTER_SIZE, HEADER_SIZE, USER_OFFSET},
};

/// Since all the headers we store point to their previous and next header we
/// might as well consider them linked list nodes. This is just a type alias
/// that we use when we want to refer to a segment header without thinking
/// about linked list nodes.
pub(crate) type Header<T> = Node<T>;

impl Header<Segment> {
    /// Returns the address handed to the user for the segment at `header`.
    ///
    /// ```text
    /// +-----------------+
    /// | Header<Segment> | <- Given address points here.
    /// +-----------------+
    /// | IntegrityRecord |
    /// +-----------------+
    /// |     Padding     |
    /// +-----------------+
    /// |    User data    | <- Returned address points here.
    /// +-----------------+
    /// ```
    ///
    /// # Safety
    ///
    /// `header` must point to a segment inside the heap.
    ///
    /// # Notes
    ///
    /// Used as `Header::user_address_of(header)` instead of a method on
    /// `&self` so that we don't create intermediary references to the header
    /// and keep Miri happy. See
    /// [Stacked Borrows](https://github.com/rust-lang/unsafe-code-guidelines/blob/master/wip/stacked-borrows.md).
    #[inline]
    pub unsafe fn user_address_of(header: NonNull<Self>) -> NonNull<u8> {
        NonNull::new_unchecked(header.as_ptr().cast::<u8>().add(USER_OFFSET))
    }

    /// Inverse of [`Self::user_address_of`]. Rounds `address` down to
    /// [`ALIGNMENT`] and steps back over the metadata.
    ///
    /// # Safety
    ///
    /// `address` must have been returned by [`Self::user_address_of`]. Callers
    /// that receive addresses from the outside check bounds first, see
    /// [`crate::store::SegmentStore::segment_of`].
    #[inline]
    pub unsafe fn from_user_address(address: NonNull<u8>) -> NonNull<Self> {
        let aligned = align_down(address.as_ptr() as usize, ALIGNMENT);
        let back = address.as_ptr() as usize - aligned + USER_OFFSET;

        NonNull::new_unchecked(address.as_ptr().sub(back).cast())
    }

    /// Integrity record stored right after the header.
    #[inline]
    pub unsafe fn integrity_of(header: NonNull<Self>) -> NonNull<IntegrityRecord> {
        NonNull::new_unchecked(header.as_ptr().cast::<u8>().add(HEADER_SIZE).cast())
    }

    /// Footer guard stored in the last [`FOOTER_SIZE`] bytes of the segment.
    ///
    /// # Safety
    ///
    /// The block count stored in the header must be sane, otherwise the
    /// returned address lies outside of the segment.
    #[inline]
    pub unsafe fn footer_of(header: NonNull<Self>, block_size: usize) -> NonNull<u32> {
        let total = header.as_ref().total_size(block_size);
        NonNull::new_unchecked(header.as_ptr().cast::<u8>().add(total - FOOTER_SIZE).cast())
    }

    /// First address after the segment, which is the next segment or the end
    /// of the heap.
    #[inline]
    pub unsafe fn end_address_of(header: NonNull<Self>, block_size: usize) -> usize {
        (header.as_ptr() as usize).saturating_add(header.as_ref().total_size(block_size))
    }
}
