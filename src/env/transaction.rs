use std::collections::hash_map::Entry as MapEntry;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, ThreadId};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::trace;

use super::environment::Environment;
use super::meta::TreeMetaInfo;
use super::root::DatabaseRoot;
use crate::storage::btree::{BTree, BTreeMutable, ChunkSource, Entry, Seek, TreeContext};
use crate::types::{EnvError, Result, StructureId, TxnId};

/// Lifecycle state of a transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionState {
    /// Reads and writes are allowed.
    Active,
    /// Published by `commit`.
    Committed,
    /// Discarded by `abort`.
    Aborted,
}

/// Mutable half of a transaction, shared with the environment's registry.
pub(crate) struct TxnInner {
    pub snapshot: Arc<DatabaseRoot>,
    pub trees: HashMap<StructureId, BTreeMutable>,
    readers: HashMap<StructureId, BTree>,
    pub created: u64,
    pub thread: ThreadId,
    pub state: TransactionState,
    pub readonly: bool,
    pub depth: usize,
}

impl TxnInner {
    pub fn new(
        snapshot: Arc<DatabaseRoot>,
        created: u64,
        thread: ThreadId,
        readonly: bool,
        depth: usize,
    ) -> Self {
        Self {
            snapshot,
            trees: HashMap::new(),
            readers: HashMap::new(),
            created,
            thread,
            state: TransactionState::Active,
            readonly,
            depth,
        }
    }

    pub fn ensure_active(&self) -> Result<()> {
        if self.state != TransactionState::Active {
            return Err(EnvError::TransactionAlreadyFinished);
        }
        Ok(())
    }

    /// Stores whose tree differs from the snapshot: unsaved changes, or a
    /// replaced or already saved tree whose root moved.
    pub fn dirty_structures(&self) -> Vec<StructureId> {
        let mut dirty: Vec<StructureId> = self
            .trees
            .iter()
            .filter(|(sid, tree)| {
                tree.has_changes() || tree.base().root_address() != self.snapshot.root_of(**sid)
            })
            .map(|(sid, _)| *sid)
            .collect();
        dirty.sort_unstable();
        dirty
    }

    /// Drops local state and reads from `snapshot` from now on.
    pub fn rebase(&mut self, snapshot: Arc<DatabaseRoot>, created: u64) {
        self.trees.clear();
        self.readers.clear();
        self.snapshot = snapshot;
        self.created = created;
    }

    pub fn discard(&mut self) {
        self.trees.clear();
        self.readers.clear();
    }

    pub fn reader(&mut self, ctx: &Arc<TreeContext>, meta: &TreeMetaInfo) -> Result<TreeRef<'_>> {
        let sid = meta.structure_id;
        if meta.temporary {
            return Ok(TreeRef::Snapshot(BTree::empty(
                Arc::clone(ctx),
                sid,
                meta.duplicates,
            )));
        }
        if let Some(tree) = self.trees.get(&sid) {
            return Ok(TreeRef::Overlay(tree));
        }
        if let Some(tree) = self.readers.get(&sid) {
            return Ok(TreeRef::Snapshot(tree.clone()));
        }
        let tree = open_snapshot_tree(ctx, &self.snapshot, meta)?;
        self.readers.insert(sid, tree.clone());
        Ok(TreeRef::Snapshot(tree))
    }

    pub fn writer(
        &mut self,
        ctx: &Arc<TreeContext>,
        meta: &TreeMetaInfo,
    ) -> Result<&mut BTreeMutable> {
        let sid = meta.structure_id;
        let tree = match self.trees.entry(sid) {
            MapEntry::Occupied(entry) => entry.into_mut(),
            MapEntry::Vacant(slot) => {
                let base = match self.readers.remove(&sid) {
                    Some(tree) => tree,
                    None => open_snapshot_tree(ctx, &self.snapshot, meta)?,
                };
                slot.insert(base.mutable_copy())
            }
        };
        Ok(tree)
    }

    /// Replaces the tree with an empty one; saved as "no root".
    pub fn clear_tree(&mut self, ctx: &Arc<TreeContext>, meta: &TreeMetaInfo) {
        let sid = meta.structure_id;
        self.readers.remove(&sid);
        let empty = BTree::empty(Arc::clone(ctx), sid, meta.duplicates);
        self.trees.insert(sid, empty.mutable_copy());
    }
}

fn open_snapshot_tree(
    ctx: &Arc<TreeContext>,
    snapshot: &DatabaseRoot,
    meta: &TreeMetaInfo,
) -> Result<BTree> {
    BTree::open(
        Arc::clone(ctx),
        meta.structure_id,
        meta.duplicates,
        snapshot.root_of(meta.structure_id),
    )
}

/// A tree as seen by one transaction.
pub(crate) enum TreeRef<'a> {
    Snapshot(BTree),
    Overlay(&'a BTreeMutable),
}

impl TreeRef<'_> {
    pub fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        match self {
            TreeRef::Snapshot(tree) => tree.get(key),
            TreeRef::Overlay(tree) => tree.get(key),
        }
    }

    pub fn has_key(&self, key: &[u8]) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    pub fn has_pair(&self, key: &[u8], value: &[u8]) -> Result<bool> {
        match self {
            TreeRef::Snapshot(tree) => tree.has_pair(key, value),
            TreeRef::Overlay(tree) => tree.has_pair(key, value),
        }
    }

    pub fn size(&self) -> u64 {
        match self {
            TreeRef::Snapshot(tree) => tree.size(),
            TreeRef::Overlay(tree) => tree.size(),
        }
    }
}

impl ChunkSource for TreeRef<'_> {
    fn fill(&self, seek: &Seek, limit: usize, out: &mut Vec<Entry>) -> Result<()> {
        match self {
            TreeRef::Snapshot(tree) => tree.fill(seek, limit, out),
            TreeRef::Overlay(tree) => tree.fill(seek, limit, out),
        }
    }
}

/// A snapshot of the environment plus private, buffered writes.
///
/// Handles are cheap to clone and all refer to the same transaction. A
/// transaction must be committed or aborted on the thread that began it, and
/// nested transactions of a thread finish in reverse begin order.
#[derive(Clone)]
pub struct Transaction {
    pub(crate) env: Environment,
    pub(crate) id: TxnId,
    pub(crate) inner: Arc<Mutex<TxnInner>>,
}

impl Transaction {
    /// Registry id of this transaction.
    pub fn id(&self) -> TxnId {
        self.id
    }

    /// The environment this transaction belongs to.
    pub fn environment(&self) -> &Environment {
        &self.env
    }

    /// Returns `true` if the transaction or the environment rejects writes.
    pub fn is_readonly(&self) -> bool {
        self.inner.lock().readonly || self.env.is_readonly()
    }

    /// Milliseconds since the Unix epoch at begin, or at the last successful
    /// `flush` or `revert`. Strictly increasing across the environment.
    pub fn created(&self) -> u64 {
        self.inner.lock().created
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TransactionState {
        self.inner.lock().state
    }

    /// Returns `true` once committed or aborted.
    pub fn is_finished(&self) -> bool {
        self.state() != TransactionState::Active
    }

    /// Number of transactions that were active on the creating thread when
    /// this one began.
    pub fn depth(&self) -> usize {
        self.inner.lock().depth
    }

    /// The database root reads are served from.
    pub fn snapshot(&self) -> Arc<DatabaseRoot> {
        Arc::clone(&self.inner.lock().snapshot)
    }

    /// Returns `true` if the transaction holds writes not yet published.
    pub fn has_changes(&self) -> bool {
        !self.inner.lock().dirty_structures().is_empty()
    }

    /// Publishes all writes and ends the transaction.
    ///
    /// On [`EnvError::TransactionConflict`] nothing is written and the
    /// transaction stays active, so it can be reverted and retried.
    pub fn commit(&self) -> Result<()> {
        self.env.finish(self, true)
    }

    /// Discards all writes and ends the transaction.
    pub fn abort(&self) -> Result<()> {
        self.env.finish(self, false)
    }

    /// Publishes all writes and keeps the transaction active on top of the
    /// new root. Returns `false` on conflict, with the writes kept.
    pub fn flush(&self) -> Result<bool> {
        self.env.flush(self)
    }

    /// Drops all writes and moves the snapshot to the latest root.
    pub fn revert(&self) -> Result<()> {
        self.env.revert(self)
    }

    pub(crate) fn read<R>(
        &self,
        meta: &TreeMetaInfo,
        f: impl FnOnce(&TreeRef<'_>) -> Result<R>,
    ) -> Result<R> {
        let mut inner = self.inner.lock();
        inner.ensure_active()?;
        let tree = inner.reader(self.env.tree_context(), meta)?;
        f(&tree)
    }

    pub(crate) fn write<R>(
        &self,
        meta: &TreeMetaInfo,
        f: impl FnOnce(&mut BTreeMutable) -> Result<R>,
    ) -> Result<R> {
        let mut inner = self.inner.lock();
        inner.ensure_active()?;
        self.ensure_writable(&inner, meta)?;
        let tree = inner.writer(self.env.tree_context(), meta)?;
        let out = f(tree)?;
        trace!(txn = self.id.0, structure_id = meta.structure_id.0, "env.txn.write");
        Ok(out)
    }

    pub(crate) fn clear(&self, meta: &TreeMetaInfo) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.ensure_active()?;
        self.ensure_writable(&inner, meta)?;
        inner.clear_tree(self.env.tree_context(), meta);
        Ok(())
    }

    fn ensure_writable(&self, inner: &TxnInner, meta: &TreeMetaInfo) -> Result<()> {
        if self.env.is_readonly() {
            return Err(EnvError::ReadonlyTransactionViolation(
                "environment is read-only",
            ));
        }
        if inner.readonly {
            return Err(EnvError::ReadonlyTransactionViolation(
                "transaction is read-only",
            ));
        }
        if meta.temporary {
            return Err(EnvError::ReadonlyTransactionViolation(
                "temporary empty store is read-only",
            ));
        }
        Ok(())
    }

    pub(crate) fn on_creating_thread(&self, inner: &TxnInner) -> bool {
        inner.thread == thread::current().id()
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("state", &inner.state)
            .field("readonly", &inner.readonly)
            .field("depth", &inner.depth)
            .field("created", &inner.created)
            .finish()
    }
}
