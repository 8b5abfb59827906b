use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;

use super::page::Page;
use crate::types::{Address, StructureId};

/// A decoded page plus the record metadata it was read with.
#[derive(Clone)]
pub(crate) struct CachedPage {
    pub page: Arc<Page>,
    /// Entry count carried by root records.
    pub root_size: Option<u64>,
    pub structure_id: StructureId,
    pub duplicates: bool,
}

/// Sharded LRU of decoded pages keyed by log address.
///
/// Pages at an address never change unless the log is rolled back, which
/// evicts every address past the rollback point.
pub(crate) struct PageCache {
    shards: Vec<Mutex<LruCache<Address, CachedPage>>>,
}

impl PageCache {
    pub(crate) fn new(shards: usize, capacity: usize) -> Self {
        let shard_count = shards.max(1);
        let per_shard_cap =
            NonZeroUsize::new(capacity / shard_count).unwrap_or(NonZeroUsize::MIN);
        let shards = (0..shard_count)
            .map(|_| Mutex::new(LruCache::new(per_shard_cap)))
            .collect();
        Self { shards }
    }

    pub(crate) fn get(&self, address: Address) -> Option<CachedPage> {
        self.shard_for(address).lock().get(&address).cloned()
    }

    pub(crate) fn insert(&self, address: Address, page: CachedPage) {
        self.shard_for(address).lock().put(address, page);
    }

    /// Evicts every page at or after `address`.
    pub(crate) fn evict_from(&self, address: Address) -> usize {
        let mut evicted = 0;
        for shard in &self.shards {
            let mut shard = shard.lock();
            let stale: Vec<Address> = shard
                .iter()
                .map(|(cached, _)| *cached)
                .filter(|cached| *cached >= address)
                .collect();
            for cached in stale {
                shard.pop(&cached);
                evicted += 1;
            }
        }
        evicted
    }

    fn shard_for(&self, address: Address) -> &Mutex<LruCache<Address, CachedPage>> {
        // Records are at least 32 bytes apart; drop the low bits before sharding.
        let idx = ((address.0 >> 5) as usize) % self.shards.len();
        &self.shards[idx]
    }
}
