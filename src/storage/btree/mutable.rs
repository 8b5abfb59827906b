use std::sync::Arc;

use bytes::Bytes;
use smallvec::SmallVec;
use tracing::trace;

use super::cursor::{ChunkSource, Cursor, Seek};
use super::page::{compare, Child, Entry, Node, Page};
use super::tree::{child_index, BTree, TreeContext, TreeView};
use super::BalancePolicy;
use crate::types::{Address, EnvError, Result, StructureId};

/// Copy-on-write overlay over an immutable [`BTree`].
///
/// The first write to a saved page clones it into a dirty node; untouched
/// subtrees stay `Saved` and keep their addresses when the tree is saved.
#[derive(Clone)]
pub struct BTreeMutable {
    base: BTree,
    root: Option<Node>,
    size: u64,
    changed: bool,
}

impl BTreeMutable {
    pub(crate) fn new(base: BTree) -> Self {
        Self {
            root: base.root.map(Node::Saved),
            size: base.size,
            changed: false,
            base,
        }
    }

    /// The version this overlay started from, or was last saved as.
    pub fn base(&self) -> &BTree {
        &self.base
    }

    /// Stable identity of the tree.
    pub fn structure_id(&self) -> StructureId {
        self.base.structure_id
    }

    /// Whether several values may share a key.
    pub fn allows_duplicates(&self) -> bool {
        self.base.duplicates
    }

    /// Number of entries, local changes included.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Returns `true` when the tree holds no entries.
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Returns `true` if a mutation changed the tree since the last save.
    pub fn has_changes(&self) -> bool {
        self.changed
    }

    /// Value stored under `key`; the smallest one in duplicate trees.
    pub fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        self.view().get(self.root.as_ref(), key)
    }

    /// Returns `true` if any entry carries `key`.
    pub fn has_key(&self, key: &[u8]) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Returns `true` if the exact pair is stored.
    pub fn has_pair(&self, key: &[u8], value: &[u8]) -> Result<bool> {
        self.view().has_pair(self.root.as_ref(), key, value)
    }

    /// Ordered cursor over the overlay as it is now.
    pub fn open_cursor(&self) -> Cursor<&BTreeMutable> {
        Cursor::new(self)
    }

    /// Stores `value` under `key`.
    ///
    /// Unique-key trees replace an existing value; duplicate trees add the
    /// pair. Returns `false` when the tree already held exactly this.
    pub fn put(&mut self, key: Bytes, value: Bytes) -> Result<bool> {
        if self.allows_duplicates() {
            if self.has_pair(&key, &value)? {
                return Ok(false);
            }
            self.upsert(Entry { key, value }, false)?;
            return Ok(true);
        }
        match self.get(&key)? {
            Some(existing) if existing == value => Ok(false),
            Some(_) => {
                self.upsert(Entry { key, value }, true)?;
                Ok(true)
            }
            None => {
                self.upsert(Entry { key, value }, false)?;
                Ok(true)
            }
        }
    }

    /// Stores the pair only if `key` is absent.
    pub fn add(&mut self, key: Bytes, value: Bytes) -> Result<bool> {
        if self.has_key(&key)? {
            return Ok(false);
        }
        self.upsert(Entry { key, value }, false)?;
        Ok(true)
    }

    /// Removes `key`, every value of it in duplicate trees.
    pub fn delete(&mut self, key: &[u8]) -> Result<bool> {
        let mut deleted = false;
        while let Some(value) = self.get(key)? {
            let target = Entry {
                key: Bytes::copy_from_slice(key),
                value,
            };
            self.remove(&target)?;
            deleted = true;
            if !self.allows_duplicates() {
                break;
            }
        }
        Ok(deleted)
    }

    /// Removes one exact pair.
    pub fn delete_pair(&mut self, key: &[u8], value: &[u8]) -> Result<bool> {
        if !self.has_pair(key, value)? {
            return Ok(false);
        }
        let target = Entry::new(Bytes::copy_from_slice(key), Bytes::copy_from_slice(value));
        self.remove(&target)?;
        Ok(true)
    }

    /// Writes dirty pages in post-order and returns the new root address,
    /// `None` when the tree became empty.
    ///
    /// Without changes nothing is written and the base root is returned.
    /// Afterwards the overlay is based on the saved version.
    pub fn save(&mut self) -> Result<Option<Address>> {
        if !self.changed {
            return Ok(self.base.root);
        }
        let ctx = Arc::clone(&self.base.ctx);
        let writer = Writer::new(&ctx, &self.base);
        let root = match self.root.as_mut() {
            None => None,
            Some(node) => {
                // Root records carry the size, so the root is always rewritten.
                writer.make_dirty(node)?;
                Some(writer.save_node(node, Some(self.size))?)
            }
        };
        trace!(
            structure_id = self.base.structure_id.0,
            root = root.map(|a| a.0),
            size = self.size,
            "btree.save"
        );
        self.base.root = root;
        self.base.size = self.size;
        self.changed = false;
        Ok(root)
    }

    fn view(&self) -> TreeView<'_> {
        self.base.view()
    }

    fn upsert(&mut self, entry: Entry, replaces: bool) -> Result<()> {
        let ctx = Arc::clone(&self.base.ctx);
        let writer = Writer::new(&ctx, &self.base);
        match self.root.as_mut() {
            None => {
                self.root = Some(Node::Dirty(Box::new(Page::Leaf(vec![entry]))));
            }
            Some(node) => {
                let page = writer.make_dirty(node)?;
                writer.insert_into(page, entry)?;
                writer.split_root(page)?;
            }
        }
        if !replaces {
            self.size += 1;
        }
        self.changed = true;
        Ok(())
    }

    fn remove(&mut self, target: &Entry) -> Result<()> {
        let ctx = Arc::clone(&self.base.ctx);
        let writer = Writer::new(&ctx, &self.base);
        let Some(node) = self.root.as_mut() else {
            return Err(EnvError::Corruption("delete from empty tree"));
        };
        let page = writer.make_dirty(node)?;
        if !writer.delete_from(page, target)? {
            return Err(EnvError::Corruption("entry vanished during delete"));
        }
        self.collapse_root();
        self.size = self.size.saturating_sub(1);
        self.changed = true;
        Ok(())
    }

    /// Replaces an internal root with a single child by that child and an
    /// empty root by the empty tree.
    fn collapse_root(&mut self) {
        loop {
            let Some(Node::Dirty(page)) = self.root.as_mut() else {
                break;
            };
            match page.as_mut() {
                Page::Internal(children) if children.len() == 1 => {
                    let only = children.pop();
                    self.root = only.map(|child| child.node);
                }
                page if page.is_empty() => {
                    self.root = None;
                    break;
                }
                _ => break,
            }
        }
    }
}

impl ChunkSource for BTreeMutable {
    fn fill(&self, seek: &Seek, limit: usize, out: &mut Vec<Entry>) -> Result<()> {
        self.view().collect(self.root.as_ref(), seek, limit, out)
    }
}

impl std::fmt::Debug for BTreeMutable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BTreeMutable")
            .field("base", &self.base)
            .field("size", &self.size)
            .field("changed", &self.changed)
            .finish()
    }
}

/// Mutation helpers bound to one tree.
struct Writer<'a> {
    view: TreeView<'a>,
    policy: BalancePolicy,
}

impl<'a> Writer<'a> {
    fn new(ctx: &'a TreeContext, tree: &BTree) -> Self {
        Self {
            view: TreeView {
                ctx,
                structure_id: tree.structure_id,
                duplicates: tree.duplicates,
            },
            policy: ctx.policy(),
        }
    }

    fn dup(&self) -> bool {
        self.view.duplicates
    }

    /// Clones a saved page into the overlay on first write.
    fn make_dirty<'n>(&self, node: &'n mut Node) -> Result<&'n mut Page> {
        if let Node::Saved(address) = *node {
            let loaded =
                self.view
                    .ctx
                    .load(address, self.view.structure_id, self.view.duplicates)?;
            *node = Node::Dirty(Box::new((*loaded.page).clone()));
        }
        match node {
            Node::Dirty(page) => Ok(&mut **page),
            Node::Saved(_) => Err(EnvError::Corruption("page not materialized")),
        }
    }

    fn into_page(&self, node: Node) -> Result<Page> {
        match node {
            Node::Dirty(page) => Ok(*page),
            Node::Saved(address) => {
                let loaded =
                    self.view
                        .ctx
                        .load(address, self.view.structure_id, self.view.duplicates)?;
                Ok((*loaded.page).clone())
            }
        }
    }

    fn needs_split(&self, page: &Page) -> bool {
        let (len, bytes) = (page.len(), page.encoded_len());
        if page.is_leaf() {
            self.policy.needs_split(len, bytes)
        } else {
            // Two children with huge separators cannot be split usefully.
            len > 2 && self.policy.needs_split(len, bytes)
        }
    }

    fn child_of(&self, page: Page) -> Result<Child> {
        let first = page
            .first(self.dup())
            .ok_or(EnvError::Corruption("empty page has no separator"))?;
        Ok(Child {
            first,
            node: Node::Dirty(Box::new(page)),
        })
    }

    /// Splits `page` until every piece satisfies the policy; pieces stay in order.
    fn split_to_fit(&self, page: Page) -> SmallVec<[Page; 2]> {
        let mut done = SmallVec::new();
        let mut pending: SmallVec<[Page; 4]> = SmallVec::new();
        pending.push(page);
        while let Some(mut page) = pending.pop() {
            if self.needs_split(&page) {
                let at = page.split_index(&self.policy);
                let right = page.split(at);
                self.view.ctx.raw_stats().inc_splits();
                pending.push(right);
                pending.push(page);
            } else {
                done.push(page);
            }
        }
        done
    }

    fn split_root(&self, root: &mut Page) -> Result<()> {
        while self.needs_split(root) {
            let whole = std::mem::replace(root, Page::Internal(Vec::new()));
            let children = self
                .split_to_fit(whole)
                .into_iter()
                .map(|piece| self.child_of(piece))
                .collect::<Result<Vec<_>>>()?;
            *root = Page::Internal(children);
        }
        Ok(())
    }

    /// Replaces child `idx` with its split pieces.
    fn split_child(&self, children: &mut Vec<Child>, idx: usize) -> Result<()> {
        let node = std::mem::replace(&mut children[idx].node, Node::Saved(Address(0)));
        let page = self.into_page(node)?;
        let pieces = self
            .split_to_fit(page)
            .into_iter()
            .map(|piece| self.child_of(piece))
            .collect::<Result<Vec<_>>>()?;
        children.splice(idx..=idx, pieces);
        Ok(())
    }

    fn insert_into(&self, page: &mut Page, entry: Entry) -> Result<()> {
        let dup = self.dup();
        match page {
            Page::Leaf(entries) => {
                match entries.binary_search_by(|e| compare(e, &entry, dup)) {
                    Ok(idx) => entries[idx] = entry,
                    Err(idx) => entries.insert(idx, entry),
                }
                Ok(())
            }
            Page::Internal(children) => {
                let idx = child_index(children, &entry, dup);
                let child = &mut children[idx];
                let child_page = self.make_dirty(&mut child.node)?;
                self.insert_into(child_page, entry)?;
                let split = self.needs_split(child_page);
                if let Some(first) = child_page.first(dup) {
                    child.first = first;
                }
                if split {
                    self.split_child(children, idx)?;
                }
                Ok(())
            }
        }
    }

    fn delete_from(&self, page: &mut Page, target: &Entry) -> Result<bool> {
        let dup = self.dup();
        match page {
            Page::Leaf(entries) => match entries.binary_search_by(|e| compare(e, target, dup)) {
                Ok(idx) => {
                    entries.remove(idx);
                    Ok(true)
                }
                Err(_) => Ok(false),
            },
            Page::Internal(children) => {
                let idx = child_index(children, target, dup);
                let child = &mut children[idx];
                let child_page = self.make_dirty(&mut child.node)?;
                if !self.delete_from(child_page, target)? {
                    return Ok(false);
                }
                match child_page.first(dup) {
                    None => {
                        children.remove(idx);
                    }
                    Some(first) => {
                        child.first = first;
                        let underfull = self
                            .policy
                            .needs_merge(child_page.len(), child_page.encoded_len());
                        if underfull && children.len() > 1 {
                            self.merge_child(children, idx)?;
                        }
                    }
                }
                Ok(true)
            }
        }
    }

    /// Merges child `idx` with a neighbour, re-splitting if the result is too big.
    fn merge_child(&self, children: &mut Vec<Child>, idx: usize) -> Result<()> {
        let left = if idx + 1 < children.len() { idx } else { idx - 1 };
        let right = children.remove(left + 1);
        let right_page = self.into_page(right.node)?;
        let left_page = self.make_dirty(&mut children[left].node)?;
        left_page.absorb(right_page)?;
        self.view.ctx.raw_stats().inc_merges();
        let split = self.needs_split(left_page);
        if let Some(first) = left_page.first(self.dup()) {
            children[left].first = first;
        }
        if split {
            self.split_child(children, left)?;
        }
        Ok(())
    }

    fn save_node(&self, node: &mut Node, root_size: Option<u64>) -> Result<Address> {
        let page = match node {
            Node::Saved(address) => return Ok(*address),
            Node::Dirty(page) => page,
        };
        if let Page::Internal(children) = page.as_mut() {
            for child in children.iter_mut() {
                let address = self.save_node(&mut child.node, None)?;
                child.node = Node::Saved(address);
            }
        }
        let Node::Dirty(page) = std::mem::replace(node, Node::Saved(Address(0))) else {
            return Err(EnvError::Corruption("page not materialized"));
        };
        let address =
            self.view
                .ctx
                .write(*page, root_size, self.view.structure_id, self.view.duplicates)?;
        *node = Node::Saved(address);
        Ok(address)
    }
}
