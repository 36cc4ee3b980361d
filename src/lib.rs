//! Segment based heap allocator with best-fit search, coalescing, a small
//! object pool and corruption detection.
//!
//! A [`Heap`] manages one contiguous buffer divided into fixed size blocks.
//! Allocations take whole segments of consecutive blocks, each one starting
//! with a header that links it to its neighbours. Freed segments merge with
//! free neighbours, and requests below a threshold are served from a separate
//! bitmap managed pool instead. In debug mode every segment header the heap
//! touches is checked (and repaired) before it's trusted.
//!
//! ```rust
//! use segheap::{Heap, HeapConfig, IntegrityLevel};
//!
//! let config = HeapConfig::new()
//!     .with_heap_size(1 << 20)
//!     .with_integrity(IntegrityLevel::Thorough);
//!
//! let mut heap = Heap::with_config(config).unwrap();
//!
//! let small = heap.allocate(24).unwrap();
//! let large = heap.allocate(10_000).unwrap();
//!
//! unsafe {
//!     heap.free(Some(small));
//!     heap.free(Some(large));
//! }
//!
//! assert!(heap.verify_integrity(false).unwrap().is_clean());
//! assert_eq!(heap.stats().count, 0);
//! ```
//!
//! There's also a process wide heap behind a lock, see [`global`].

#[macro_use]
mod logging;

pub mod align;
pub mod memory;

mod allocator;
mod config;
mod error;
mod header;
mod integrity;
mod list;
mod platform;
mod pool;
mod realloc;
mod report;
mod scrub;
mod segment;
mod stats;
mod store;
mod tracking;

use std::ptr::NonNull;

/// Non-null pointer to `T`. We use this in most cases instead of `*mut T`
/// because the compiler will yell at us if we don't write code for the `None`
/// case. The public API uses it as well, `None` is what C would call `NULL`.
pub type Pointer<T> = Option<NonNull<T>>;

pub use allocator::{allocate, free, global, heap_init, reallocate, Heap, SharedHeap};
pub use config::HeapConfig;
pub use error::{HeapInitError, IntegrityError, SettingError};
pub use integrity::{IntegrityLevel, IntegrityReport};
pub use logging::{LogSink, LOG_TARGET};
pub use report::{ActiveAllocation, StatusReport};
pub use scrub::{ZeroDepth, ZeroOnFree, DEFAULT_SHALLOW_BYTES};
pub use stats::{fragmentation, HeapStats};
pub use store::SegmentInfo;
pub use tracking::AllocationSite;
