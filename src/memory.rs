//! Raw memory operations used by the heap itself: copying user data when a
//! reallocation has to move, and zeroing freed memory. Both work one machine
//! word at a time when the addresses allow it and fall back to single bytes
//! otherwise. The result is always byte-for-byte identical to a naive loop.

use std::ptr::NonNull;

use crate::align::{is_word_aligned, WORD_SIZE};

/// Copies `count` bytes from `src` to `dest`.
///
/// Word-sized copies are only used when `dest`, `src` and `count` are all
/// multiples of the word size. Any other combination is copied byte by byte.
///
/// # Safety
///
/// `src` must be valid for reads and `dest` valid for writes of `count`
/// bytes, and the two ranges must not overlap.
pub unsafe fn copy(dest: NonNull<u8>, src: NonNull<u8>, count: usize) {
    let dest = dest.as_ptr();
    let src = src.as_ptr() as *const u8;

    let mut copied = 0;

    if is_word_aligned(dest as usize | src as usize | count) {
        let words = count / WORD_SIZE;
        let word_dest = dest.cast::<usize>();
        let word_src = src.cast::<usize>();

        for i in 0..words {
            word_dest.add(i).write(word_src.add(i).read());
        }

        copied = words * WORD_SIZE;
    }

    for i in copied..count {
        dest.add(i).write(src.add(i).read());
    }
}

/// Sets `count` bytes starting at `dest` to `value`.
///
/// Zeroing a word-aligned range of at least one word stores whole zero words.
/// Otherwise the unaligned head is filled byte by byte, the aligned middle is
/// filled with a repeated byte pattern one word at a time and the tail byte
/// by byte again.
///
/// # Safety
///
/// `dest` must be valid for writes of `count` bytes.
pub unsafe fn fill(dest: NonNull<u8>, value: u8, count: usize) {
    let dest = dest.as_ptr();

    if value == 0 && count >= WORD_SIZE && is_word_aligned(dest as usize) {
        let words = count / WORD_SIZE;
        let word_dest = dest.cast::<usize>();

        for i in 0..words {
            word_dest.add(i).write(0);
        }

        for i in words * WORD_SIZE..count {
            dest.add(i).write(0);
        }

        return;
    }

    let mut i = 0;

    while i < count && !is_word_aligned(dest as usize + i) {
        dest.add(i).write(value);
        i += 1;
    }

    if count - i >= WORD_SIZE {
        let pattern = usize::from_ne_bytes([value; WORD_SIZE]);
        let words = (count - i) / WORD_SIZE;
        let word_dest = dest.add(i).cast::<usize>();

        for w in 0..words {
            word_dest.add(w).write(pattern);
        }

        i += words * WORD_SIZE;
    }

    while i < count {
        dest.add(i).write(value);
        i += 1;
    }
}
