use std::fmt;

use crate::{
    integrity::IntegrityLevel,
    scrub::{ZeroDepth, ZeroOnFree},
    stats::HeapStats,
    tracking::AllocationSite,
};

/// Live segment allocation listed in a [`StatusReport`] when tracking is on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ActiveAllocation {
    pub id: u32,
    pub blocks: usize,
    /// `None` if the allocation was made while tracking was off.
    pub site: Option<AllocationSite>,
}

/// Human readable heap status, see [`crate::Heap::status`].
#[derive(Clone, Debug, PartialEq)]
pub struct StatusReport {
    pub stats: HeapStats,
    pub pool_capacity: usize,
    /// Between 0 and 1.
    pub fragmentation: f64,
    pub zero_on_free: ZeroOnFree,
    pub integrity: IntegrityLevel,
    pub segments: usize,
    /// `None` when tracking is disabled.
    pub active: Option<Vec<ActiveAllocation>>,
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Memory Allocator Status ===")?;
        writeln!(f, "Total allocated: {} bytes", self.stats.allocated)?;
        writeln!(f, "Total freed: {} bytes", self.stats.freed)?;
        writeln!(f, "Active allocations: {}", self.stats.count)?;
        writeln!(f, "Peak memory usage: {} bytes", self.stats.peak)?;
        writeln!(
            f,
            "Small pool usage: {}/{} bytes",
            self.stats.small_pool_used, self.pool_capacity
        )?;
        writeln!(f, "Fragmentation: {:.2}%", self.fragmentation * 100.0)?;
        writeln!(f, "Zero-on-free depth: {}", self.zero_on_free.depth)?;
        if self.zero_on_free.depth == ZeroDepth::Shallow {
            writeln!(f, "Shallow zero size: {} bytes", self.zero_on_free.shallow_bytes)?;
        }
        writeln!(f, "Integrity check level: {}", self.integrity)?;
        writeln!(f, "Segments: {}", self.segments)?;

        if let Some(active) = &self.active {
            writeln!(f)?;
            writeln!(f, "=== Active Allocations ===")?;
            for allocation in active {
                write!(f, "ID: {}, Size: {} blocks, Location: ", allocation.id, allocation.blocks)?;
                match allocation.site {
                    Some(site) => writeln!(f, "{site}")?,
                    None => writeln!(f, "unknown")?,
                }
            }
        }

        write!(f, "==============================")
    }
}
