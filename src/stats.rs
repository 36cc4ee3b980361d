/// Aggregate allocation counters. Segment allocations are counted in whole
/// segment bytes (`blocks * block_size`) and small pool allocations in whole
/// slot bytes, so the numbers describe heap usage rather than requested
/// sizes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Bytes currently in use.
    pub allocated: usize,
    /// Bytes given back over the lifetime of the heap.
    pub freed: usize,
    /// Bytes handed out over the lifetime of the heap. Always equals
    /// `allocated + freed`.
    pub lifetime_allocated: usize,
    /// Live allocations.
    pub count: usize,
    /// Highest value `allocated` ever reached.
    pub peak: usize,
    /// Bytes currently in use in the small pool. Also part of `allocated`.
    pub small_pool_used: usize,
}

impl HeapStats {
    pub(crate) fn record_allocation(&mut self, bytes: usize) {
        self.count += 1;
        self.record_growth(bytes);
    }

    /// Counts a free. Never goes below zero, freeing more than what's
    /// allocated only frees what's left.
    pub(crate) fn record_free(&mut self, bytes: usize) {
        self.count = self.count.saturating_sub(1);
        self.record_shrink(bytes);
    }

    /// An allocation got bigger without moving.
    pub(crate) fn record_growth(&mut self, bytes: usize) {
        self.allocated += bytes;
        self.lifetime_allocated += bytes;
        self.peak = self.peak.max(self.allocated);
    }

    /// An allocation got smaller without moving.
    pub(crate) fn record_shrink(&mut self, bytes: usize) {
        let bytes = bytes.min(self.allocated);
        self.allocated -= bytes;
        self.freed += bytes;
    }

    pub(crate) fn record_pool_allocation(&mut self, bytes: usize) {
        self.small_pool_used += bytes;
        self.record_allocation(bytes);
    }

    pub(crate) fn record_pool_free(&mut self, bytes: usize) {
        self.small_pool_used = self.small_pool_used.saturating_sub(bytes);
        self.record_free(bytes);
    }
}

/// `1 - average free segment / total free bytes`. 0 means all free memory
/// is one segment, values close to 1 mean it's scattered in many small
/// pieces. 0 as well when there's no free memory.
pub fn fragmentation(free_segments: usize, free_bytes: usize) -> f64 {
    if free_segments == 0 || free_bytes == 0 {
        return 0.0;
    }

    let average = free_bytes as f64 / free_segments as f64;

    1.0 - average / free_bytes as f64
}
