use std::cmp::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use tracing::trace;

use super::cache::{CachedPage, PageCache};
use super::cursor::{ChunkSource, Cursor, Seek};
use super::mutable::BTreeMutable;
use super::page::{compare, Child, Entry, Node, Page, PageRef};
use super::stats::{BTreeStats, BTreeStatsSnapshot};
use super::BalancePolicy;
use crate::primitives::log::{Log, LogMark};
use crate::types::{Address, EnvError, Result, StructureId};

const CACHE_SHARDS: usize = 8;

/// Everything the trees of one environment share: the log they live in,
/// the decoded page cache and the balance policy.
pub struct TreeContext {
    log: Arc<Log>,
    cache: PageCache,
    policy: BalancePolicy,
    stats: BTreeStats,
}

impl TreeContext {
    /// Creates a context caching up to `cache_pages` decoded pages.
    pub fn new(log: Arc<Log>, policy: BalancePolicy, cache_pages: usize) -> Self {
        Self {
            log,
            cache: PageCache::new(CACHE_SHARDS, cache_pages),
            policy: policy.normalize(),
            stats: BTreeStats::default(),
        }
    }

    /// The log pages are read from and written to.
    pub fn log(&self) -> &Arc<Log> {
        &self.log
    }

    /// Split/merge bounds applied by mutable trees.
    pub fn policy(&self) -> BalancePolicy {
        self.policy
    }

    /// Tree counters.
    pub fn stats(&self) -> BTreeStatsSnapshot {
        self.stats.snapshot()
    }

    pub(crate) fn raw_stats(&self) -> &BTreeStats {
        &self.stats
    }

    /// Drops every page written after `mark` from the log and the cache.
    pub fn rollback_to(&self, mark: LogMark) -> Result<()> {
        let evicted = self.cache.evict_from(mark.address());
        trace!(address = mark.address().0, evicted, "btree.rollback");
        self.log.rollback_to(mark)
    }

    pub(crate) fn load(
        &self,
        address: Address,
        structure_id: StructureId,
        duplicates: bool,
    ) -> Result<CachedPage> {
        let cached = match self.cache.get(address) {
            Some(hit) => {
                self.stats.inc_cache_hits();
                hit
            }
            None => {
                let record = self.log.read(address)?;
                let (page, root_size) = Page::decode(&record)?;
                let cached = CachedPage {
                    page: Arc::new(page),
                    root_size,
                    structure_id: record.structure_id,
                    duplicates: record.kind.is_duplicates(),
                };
                self.stats.inc_page_loads();
                self.cache.insert(address, cached.clone());
                cached
            }
        };
        if cached.structure_id != structure_id {
            return Err(EnvError::Corruption("page belongs to another tree"));
        }
        if cached.duplicates != duplicates {
            return Err(EnvError::Corruption("page duplicate flag mismatch"));
        }
        Ok(cached)
    }

    pub(crate) fn write(
        &self,
        page: Page,
        root_size: Option<u64>,
        structure_id: StructureId,
        duplicates: bool,
    ) -> Result<Address> {
        let kind = page.record_kind(root_size.is_some(), duplicates);
        let payload = page.encode(root_size)?;
        let address = self.log.append(kind, structure_id, &payload)?;
        self.stats.inc_pages_written();
        self.cache.insert(
            address,
            CachedPage {
                page: Arc::new(page),
                root_size,
                structure_id,
                duplicates,
            },
        );
        Ok(address)
    }
}

/// Read access to one tree's pages, shared by immutable and mutable trees.
#[derive(Clone, Copy)]
pub(crate) struct TreeView<'a> {
    pub ctx: &'a TreeContext,
    pub structure_id: StructureId,
    pub duplicates: bool,
}

impl<'a> TreeView<'a> {
    pub fn resolve<'n>(&self, node: &'n Node) -> Result<PageRef<'n>> {
        match node {
            Node::Saved(address) => Ok(PageRef::Shared(
                self.ctx
                    .load(*address, self.structure_id, self.duplicates)?
                    .page,
            )),
            Node::Dirty(page) => Ok(PageRef::Borrowed(page)),
        }
    }

    /// Appends up to `limit` entries positioned by `seek` to `out`.
    pub fn collect(
        &self,
        root: Option<&Node>,
        seek: &Seek,
        limit: usize,
        out: &mut Vec<Entry>,
    ) -> Result<()> {
        let Some(root) = root else {
            return Ok(());
        };
        let page = self.resolve(root)?;
        self.collect_page(&page, Some(seek), limit, out)
    }

    fn collect_page(
        &self,
        page: &Page,
        seek: Option<&Seek>,
        limit: usize,
        out: &mut Vec<Entry>,
    ) -> Result<()> {
        let dup = self.duplicates;
        match page {
            Page::Leaf(entries) => {
                let start = match seek {
                    None | Some(Seek::Start) => 0,
                    Some(Seek::AtOrAfter(target)) => {
                        entries.partition_point(|e| compare(e, target, dup) == Ordering::Less)
                    }
                    Some(Seek::After(target)) => {
                        entries.partition_point(|e| compare(e, target, dup) != Ordering::Greater)
                    }
                };
                let room = limit.saturating_sub(out.len());
                out.extend(entries[start..].iter().take(room).cloned());
            }
            Page::Internal(children) => {
                let start = match seek {
                    None | Some(Seek::Start) => 0,
                    Some(Seek::AtOrAfter(target)) | Some(Seek::After(target)) => {
                        child_index(children, target, dup)
                    }
                };
                for (offset, child) in children[start..].iter().enumerate() {
                    if out.len() >= limit {
                        break;
                    }
                    let child_page = self.resolve(&child.node)?;
                    // Only the first visited child can hold entries before the target.
                    let child_seek = if offset == 0 { seek } else { None };
                    self.collect_page(&child_page, child_seek, limit, out)?;
                }
            }
        }
        Ok(())
    }

    fn first_at_or_after(&self, root: Option<&Node>, target: Entry) -> Result<Option<Entry>> {
        let mut out = Vec::with_capacity(1);
        self.collect(root, &Seek::AtOrAfter(target), 1, &mut out)?;
        Ok(out.pop())
    }

    pub fn get(&self, root: Option<&Node>, key: &[u8]) -> Result<Option<Bytes>> {
        Ok(self
            .first_at_or_after(root, Entry::lookup(key))?
            .filter(|entry| &entry.key[..] == key)
            .map(|entry| entry.value))
    }

    pub fn has_pair(&self, root: Option<&Node>, key: &[u8], value: &[u8]) -> Result<bool> {
        if !self.duplicates {
            return Ok(self.get(root, key)?.as_deref() == Some(value));
        }
        let target = Entry::new(Bytes::copy_from_slice(key), Bytes::copy_from_slice(value));
        Ok(self
            .first_at_or_after(root, target)?
            .is_some_and(|entry| &entry.key[..] == key && &entry.value[..] == value))
    }
}

/// Index of the child whose subtree may hold `target`.
pub(crate) fn child_index(children: &[Child], target: &Entry, duplicates: bool) -> usize {
    children
        .partition_point(|child| compare(&child.first, target, duplicates) != Ordering::Greater)
        .saturating_sub(1)
}

/// An immutable, versioned tree addressed by its root record.
///
/// Cloning is cheap; clones share the context and page cache.
#[derive(Clone)]
pub struct BTree {
    pub(crate) ctx: Arc<TreeContext>,
    pub(crate) root: Option<Address>,
    pub(crate) structure_id: StructureId,
    pub(crate) duplicates: bool,
    pub(crate) size: u64,
}

impl BTree {
    /// The zero-page tree.
    pub fn empty(ctx: Arc<TreeContext>, structure_id: StructureId, duplicates: bool) -> Self {
        Self {
            ctx,
            root: None,
            structure_id,
            duplicates,
            size: 0,
        }
    }

    /// Opens the tree whose root record is at `root`.
    pub fn open(
        ctx: Arc<TreeContext>,
        structure_id: StructureId,
        duplicates: bool,
        root: Option<Address>,
    ) -> Result<Self> {
        let Some(address) = root else {
            return Ok(Self::empty(ctx, structure_id, duplicates));
        };
        let cached = ctx.load(address, structure_id, duplicates)?;
        let size = cached
            .root_size
            .ok_or(EnvError::Corruption("tree root is not a root record"))?;
        Ok(Self {
            ctx,
            root: Some(address),
            structure_id,
            duplicates,
            size,
        })
    }

    /// Address of the root record, `None` for the empty tree.
    pub fn root_address(&self) -> Option<Address> {
        self.root
    }

    /// Stable identity of this tree across versions.
    pub fn structure_id(&self) -> StructureId {
        self.structure_id
    }

    /// Whether several values may share a key.
    pub fn allows_duplicates(&self) -> bool {
        self.duplicates
    }

    /// Number of entries.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Returns `true` when the tree holds no entries.
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Value stored under `key`; the smallest one in duplicate trees.
    pub fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        self.view().get(self.root_node().as_ref(), key)
    }

    /// Returns `true` if any entry carries `key`.
    pub fn has_key(&self, key: &[u8]) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Returns `true` if the exact pair is stored.
    pub fn has_pair(&self, key: &[u8], value: &[u8]) -> Result<bool> {
        self.view().has_pair(self.root_node().as_ref(), key, value)
    }

    /// Ordered cursor over this version of the tree.
    pub fn open_cursor(&self) -> Cursor<BTree> {
        Cursor::new(self.clone())
    }

    /// Copy-on-write overlay based on this version.
    pub fn mutable_copy(&self) -> BTreeMutable {
        BTreeMutable::new(self.clone())
    }

    pub(crate) fn view(&self) -> TreeView<'_> {
        TreeView {
            ctx: &self.ctx,
            structure_id: self.structure_id,
            duplicates: self.duplicates,
        }
    }

    fn root_node(&self) -> Option<Node> {
        self.root.map(Node::Saved)
    }
}

impl ChunkSource for BTree {
    fn fill(&self, seek: &Seek, limit: usize, out: &mut Vec<Entry>) -> Result<()> {
        self.view()
            .collect(self.root_node().as_ref(), seek, limit, out)
    }
}

impl std::fmt::Debug for BTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BTree")
            .field("structure_id", &self.structure_id)
            .field("root", &self.root)
            .field("duplicates", &self.duplicates)
            .field("size", &self.size)
            .finish()
    }
}
