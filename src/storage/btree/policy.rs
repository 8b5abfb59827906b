use serde::{Deserialize, Serialize};

/// Decides when a page splits or merges.
///
/// Both bounds apply at once: a page splits when it holds too many entries
/// *or* too many encoded bytes, so pages with long values split early.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct BalancePolicy {
    /// Maximum number of entries (leaf) or children (internal) per page.
    pub max_page_entries: usize,
    /// Maximum encoded payload size per page.
    pub max_page_bytes: usize,
}

impl Default for BalancePolicy {
    fn default() -> Self {
        Self {
            max_page_entries: 128,
            max_page_bytes: 8192,
        }
    }
}

impl BalancePolicy {
    /// Creates a policy, clamping bounds to workable minimums.
    pub fn new(max_page_entries: usize, max_page_bytes: usize) -> Self {
        Self {
            max_page_entries,
            max_page_bytes,
        }
        .normalize()
    }

    /// Clamps bounds so every split yields two non-empty halves.
    pub fn normalize(mut self) -> Self {
        if self.max_page_entries < 4 {
            self.max_page_entries = 4;
        }
        if self.max_page_bytes < 64 {
            self.max_page_bytes = 64;
        }
        self
    }

    /// Whether a page of `entries` items and `bytes` encoded bytes must split.
    pub fn needs_split(&self, entries: usize, bytes: usize) -> bool {
        entries > 1 && (entries > self.max_page_entries || bytes > self.max_page_bytes)
    }

    /// Whether a page is underfull enough to be merged into a sibling.
    pub fn needs_merge(&self, entries: usize, bytes: usize) -> bool {
        entries * 4 < self.max_page_entries && bytes * 4 < self.max_page_bytes
    }

    /// Index at which items with the given encoded sizes are divided.
    ///
    /// Balances bytes rather than counts; the result is always in `1..len`.
    pub fn split_point(&self, sizes: &[usize]) -> usize {
        debug_assert!(sizes.len() > 1);
        let total: usize = sizes.iter().sum();
        let mut acc = 0usize;
        for (idx, size) in sizes.iter().enumerate() {
            acc += size;
            if acc * 2 >= total {
                let at = if acc * 2 - total > *size { idx } else { idx + 1 };
                return at.clamp(1, sizes.len() - 1);
            }
        }
        sizes.len() / 2
    }
}
