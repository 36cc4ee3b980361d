use thiserror::Error;

/// Reasons why a heap could not be set up.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapInitError {
    #[error("heap is already initialized")]
    AlreadyInitialized,

    #[error("backing buffer is null")]
    NullBuffer,

    #[error("backing buffer of {size} bytes is too small, at least {required} bytes are required")]
    BufferTooSmall { size: usize, required: usize },

    #[error("invalid heap configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("platform could not provide {0} bytes of backing memory")]
    OutOfMemory(usize),
}

/// Failure of a whole heap integrity scan. Individual corruptions are not
/// errors, they are counted in [`crate::IntegrityReport`].
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrityError {
    #[error("heap is not initialized")]
    Uninitialized,
}

/// Out of range values for numeric debug settings.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingError {
    #[error("invalid integrity check level {0}, valid range is 0-3")]
    InvalidIntegrityLevel(u8),

    #[error("invalid zero-on-free depth {0}, valid range is 0-3")]
    InvalidZeroDepth(u8),
}
