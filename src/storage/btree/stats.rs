use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

/// Snapshot of tree statistics at a point in time.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct BTreeStatsSnapshot {
    /// Pages decoded from the log
    pub page_loads: u64,
    /// Page lookups answered by the decoded page cache
    pub cache_hits: u64,
    /// Pages written by `save`
    pub pages_written: u64,
    /// Page splits performed
    pub splits: u64,
    /// Sibling merges performed
    pub merges: u64,
}

/// Thread-safe statistics shared by every tree of one environment.
#[derive(Default, Debug)]
pub struct BTreeStats {
    page_loads: AtomicU64,
    cache_hits: AtomicU64,
    pages_written: AtomicU64,
    splits: AtomicU64,
    merges: AtomicU64,
}

impl BTreeStats {
    /// Returns a copy of all counters.
    pub fn snapshot(&self) -> BTreeStatsSnapshot {
        BTreeStatsSnapshot {
            page_loads: self.page_loads.load(AtomicOrdering::Relaxed),
            cache_hits: self.cache_hits.load(AtomicOrdering::Relaxed),
            pages_written: self.pages_written.load(AtomicOrdering::Relaxed),
            splits: self.splits.load(AtomicOrdering::Relaxed),
            merges: self.merges.load(AtomicOrdering::Relaxed),
        }
    }

    pub(crate) fn inc_page_loads(&self) {
        self.page_loads.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_cache_hits(&self) {
        self.cache_hits.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_pages_written(&self) {
        self.pages_written.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_splits(&self) {
        self.splits.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_merges(&self) {
        self.merges.fetch_add(1, AtomicOrdering::Relaxed);
    }
}
