//! Block arithmetic. Pure functions, no state. Everything the heap stores is
//! measured either in bytes or in blocks of `block_size` bytes, and these are
//! the only places where we convert between the two.

use std::mem;

/// Minimum alignment of every pointer returned by the heap and of every
/// segment header inside the backing buffer.
pub const ALIGNMENT: usize = 16;

/// Machine word size in bytes. 8 on most computers these days.
pub(crate) const WORD_SIZE: usize = mem::size_of::<usize>();

/// Rounds `value` up to the next multiple of `alignment`, which must be a
/// power of 2.
///
/// ```rust
/// use segheap::align::align_up;
///
/// assert_eq!(align_up(13, 16), 16);
/// assert_eq!(align_up(32, 16), 32);
/// ```
#[inline]
pub const fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

/// Rounds `value` down to the previous multiple of `alignment`, which must be
/// a power of 2.
#[inline]
pub const fn align_down(value: usize, alignment: usize) -> usize {
    value & !(alignment - 1)
}

/// Number of blocks needed to store `size` bytes. Rounds up, so any non-zero
/// size needs at least one block.
///
/// ```rust
/// use segheap::align::blocks_for;
///
/// assert_eq!(blocks_for(1, 4096), 1);
/// assert_eq!(blocks_for(4096, 4096), 1);
/// assert_eq!(blocks_for(4097, 4096), 2);
/// ```
#[inline]
pub const fn blocks_for(size: usize, block_size: usize) -> usize {
    size.div_ceil(block_size)
}

/// Number of bytes spanned by `blocks` blocks. Saturates instead of wrapping
/// so that a corrupted block count can never produce a small size.
#[inline]
pub const fn bytes_for(blocks: usize, block_size: usize) -> usize {
    blocks.saturating_mul(block_size)
}

/// Whether `address` is a multiple of [`WORD_SIZE`].
#[inline]
pub(crate) fn is_word_aligned(address: usize) -> bool {
    address & (WORD_SIZE - 1) == 0
}
