//! Zero-on-free policy. Freed memory can be overwritten with zeroes so that
//! stale data does not leak into the next allocation, at a configurable cost.

use std::{fmt, ptr::NonNull};

use crate::{error::SettingError, memory};

/// How much of a freed allocation gets zeroed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ZeroDepth {
    /// Nothing is zeroed.
    #[default]
    None = 0,
    /// Only the first `shallow_bytes` bytes, where headers and pointers of
    /// user data structures usually live.
    Shallow = 1,
    /// The first half.
    Medium = 2,
    /// Everything.
    Deep = 3,
}

impl TryFrom<u8> for ZeroDepth {
    type Error = SettingError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::Shallow),
            2 => Ok(Self::Medium),
            3 => Ok(Self::Deep),
            _ => Err(SettingError::InvalidZeroDepth(value)),
        }
    }
}

impl fmt::Display for ZeroDepth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "none (best performance)",
            Self::Shallow => "shallow (headers/pointers only)",
            Self::Medium => "medium (50% of memory)",
            Self::Deep => "deep (entire memory block)",
        })
    }
}

/// Default number of bytes zeroed by [`ZeroDepth::Shallow`].
pub const DEFAULT_SHALLOW_BYTES: usize = 64;

/// Zero-on-free configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ZeroOnFree {
    pub depth: ZeroDepth,
    pub shallow_bytes: usize,
}

impl Default for ZeroOnFree {
    fn default() -> Self {
        Self::new(ZeroDepth::None, DEFAULT_SHALLOW_BYTES)
    }
}

impl ZeroOnFree {
    pub const fn new(depth: ZeroDepth, shallow_bytes: usize) -> Self {
        Self {
            depth,
            shallow_bytes,
        }
    }

    /// Number of bytes that should be zeroed out of `usable` freed bytes.
    pub fn bytes_to_zero(&self, usable: usize) -> usize {
        match self.depth {
            ZeroDepth::None => 0,
            ZeroDepth::Shallow => self.shallow_bytes.min(usable),
            ZeroDepth::Medium => usable / 2,
            ZeroDepth::Deep => usable,
        }
    }

    /// Zeroes the prefix of `address` selected by the policy and returns how
    /// many bytes were written.
    ///
    /// # Safety
    ///
    /// `address` must be valid for writes of `usable` bytes.
    pub(crate) unsafe fn apply(&self, address: NonNull<u8>, usable: usize) -> usize {
        let count = self.bytes_to_zero(usable);

        if count > 0 {
            memory::fill(address, 0, count);
        }

        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_conversion() {
        assert_eq!(ZeroDepth::try_from(2), Ok(ZeroDepth::Medium));
        assert_eq!(ZeroDepth::try_from(4), Err(SettingError::InvalidZeroDepth(4)));
    }

    #[test]
    fn bytes_per_depth() {
        let usable = 1000;

        assert_eq!(ZeroOnFree::new(ZeroDepth::None, 64).bytes_to_zero(usable), 0);
        assert_eq!(ZeroOnFree::new(ZeroDepth::Shallow, 64).bytes_to_zero(usable), 64);
        assert_eq!(ZeroOnFree::new(ZeroDepth::Shallow, 4096).bytes_to_zero(usable), 1000);
        assert_eq!(ZeroOnFree::new(ZeroDepth::Medium, 64).bytes_to_zero(usable), 500);
        assert_eq!(ZeroOnFree::new(ZeroDepth::Deep, 64).bytes_to_zero(usable), 1000);
    }

    #[test]
    fn apply_only_touches_prefix() {
        let mut buffer = [0xAAu8; 128];
        let address = NonNull::new(buffer.as_mut_ptr()).unwrap();

        let zeroed = unsafe { ZeroOnFree::new(ZeroDepth::Medium, 64).apply(address, 100) };

        assert_eq!(zeroed, 50);
        assert!(buffer[..50].iter().all(|byte| *byte == 0));
        assert!(buffer[50..].iter().all(|byte| *byte == 0xAA));
    }
}
