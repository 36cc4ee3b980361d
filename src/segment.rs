use std::mem;

use crate::{
    align::{align_up, bytes_for, ALIGNMENT},
    header::Header,
    integrity::INTEGRITY_RECORD_SIZE,
};

/// Written into every live segment header. Anything else in that field means
/// the header was overwritten or the address never was a segment.
pub(crate) const SEGMENT_MAGIC: u32 = 0xCAFE_BABE;

/// Segment header size in bytes. See [`Header<T>`] and [`Segment`].
pub(crate) const HEADER_SIZE: usize = mem::size_of::<Header<Segment>>();

/// Distance from the start of a segment to the pointer handed to the user.
/// The integrity record always sits in between, even when integrity checks
/// are disabled, so the distance never changes and translating pointers back
/// and forth stays exact.
pub(crate) const USER_OFFSET: usize = align_up(HEADER_SIZE + INTEGRITY_RECORD_SIZE, ALIGNMENT);

/// Size of the footer guard stored in the last bytes of a segment.
pub(crate) const FOOTER_SIZE: usize = mem::size_of::<u32>();

/// Bytes every segment spends on metadata. Allocation sizes are padded with
/// at least this much before converting them into blocks.
pub(crate) const SEGMENT_OVERHEAD: usize = {
    let requested = HEADER_SIZE + ALIGNMENT;
    let layout = USER_OFFSET + FOOTER_SIZE;

    if requested > layout {
        requested
    } else {
        layout
    }
};

/// Segment specific data. The complete header is [`Header<Segment>`], which
/// is also a [`crate::list::Node<Segment>`]. Every segment starts at a block
/// boundary of the heap and spans `blocks` blocks, so in memory it looks like
/// this:
///
/// ```text
/// +----------------------------+ <- block boundary
/// | pointer to next segment    |
/// +----------------------------+
/// | pointer to prev segment    |
/// +----------------------------+
/// | Segment                    |
/// +----------------------------+
/// | IntegrityRecord            |
/// +----------------------------+
/// | padding up to 16 bytes     |
/// +----------------------------+ <- USER_OFFSET, user pointer
/// |         User data          |
/// |            ...             |
/// +----------------------------+
/// | footer guard (u32)         |
/// +----------------------------+ <- next block boundary, next segment
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Segment {
    /// Whether this segment can be handed out.
    pub is_free: bool,
    /// Size of the whole segment, header included, in blocks.
    pub blocks: usize,
    /// Identifier of the allocation currently living here. 0 when the
    /// segment was never allocated.
    pub allocation_id: u32,
    /// Always [`SEGMENT_MAGIC`] unless corrupted.
    pub magic: u32,
}

impl Segment {
    /// New free segment spanning `blocks` blocks.
    pub const fn free(blocks: usize) -> Self {
        Self {
            is_free: true,
            blocks,
            allocation_id: 0,
            magic: SEGMENT_MAGIC,
        }
    }
}

impl Header<Segment> {
    #[inline]
    pub fn is_free(&self) -> bool {
        self.data.is_free
    }

    /// Segment size in blocks.
    #[inline]
    pub fn blocks(&self) -> usize {
        self.data.blocks
    }

    /// Segment size in bytes, header included.
    #[inline]
    pub fn total_size(&self, block_size: usize) -> usize {
        bytes_for(self.data.blocks, block_size)
    }

    /// Bytes the user can write starting at the user pointer without
    /// touching the footer.
    #[inline]
    pub fn usable_size(&self, block_size: usize) -> usize {
        self.total_size(block_size)
            .saturating_sub(USER_OFFSET + FOOTER_SIZE)
    }
}
