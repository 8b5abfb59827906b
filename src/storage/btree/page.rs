#![forbid(unsafe_code)]

//! In-memory page representation and its record encoding.
//!
//! Leaf payload: `varint count` then `count` entries, each a varint-prefixed
//! key followed by a varint-prefixed value. Internal payload: `varint count`
//! then per child the varint-prefixed key and value of its first entry and
//! the child's big-endian `u64` address. Root records prepend the tree's
//! entry count as a varint.

use std::cmp::Ordering;
use std::ops::Deref;
use std::sync::Arc;

use bytes::Bytes;

use crate::primitives::bytes::{buf, var};
use crate::primitives::log::{Loggable, RecordKind};
use crate::types::{Address, EnvError, Result};

/// A key/value pair stored in a tree.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Entry {
    /// Entry key.
    pub key: Bytes,
    /// Entry value.
    pub value: Bytes,
}

impl Entry {
    /// Creates an entry from anything convertible into [`Bytes`].
    pub fn new(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Search key that sorts before every entry carrying `key`.
    pub fn lookup(key: &[u8]) -> Self {
        Self {
            key: Bytes::copy_from_slice(key),
            value: Bytes::new(),
        }
    }

    fn encoded_len(&self) -> usize {
        var::encoded_len(self.key.len() as u64)
            + self.key.len()
            + var::encoded_len(self.value.len() as u64)
            + self.value.len()
    }
}

/// Orders entries by key, or by `(key, value)` in duplicate trees.
pub(crate) fn compare(a: &Entry, b: &Entry, duplicates: bool) -> Ordering {
    match a.key.cmp(&b.key) {
        Ordering::Equal if duplicates => a.value.cmp(&b.value),
        other => other,
    }
}

/// Separator stored for a child; unique-key trees drop the value.
pub(crate) fn separator(entry: &Entry, duplicates: bool) -> Entry {
    if duplicates {
        entry.clone()
    } else {
        Entry {
            key: entry.key.clone(),
            value: Bytes::new(),
        }
    }
}

/// Pointer from an internal page to a child.
#[derive(Clone, Debug)]
pub(crate) enum Node {
    /// Child persisted at this address.
    Saved(Address),
    /// Child modified in the current mutable tree.
    Dirty(Box<Page>),
}

#[derive(Clone, Debug)]
pub(crate) struct Child {
    /// Smallest entry of the child's subtree, see [`separator`].
    pub first: Entry,
    pub node: Node,
}

#[derive(Clone, Debug)]
pub(crate) enum Page {
    Leaf(Vec<Entry>),
    Internal(Vec<Child>),
}

impl Page {
    pub fn len(&self) -> usize {
        match self {
            Page::Leaf(entries) => entries.len(),
            Page::Internal(children) => children.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, Page::Leaf(_))
    }

    /// Encoded payload size, excluding the root size prefix.
    pub fn encoded_len(&self) -> usize {
        var::encoded_len(self.len() as u64) + self.item_sizes().iter().sum::<usize>()
    }

    fn item_sizes(&self) -> Vec<usize> {
        match self {
            Page::Leaf(entries) => entries.iter().map(Entry::encoded_len).collect(),
            Page::Internal(children) => children
                .iter()
                .map(|child| child.first.encoded_len() + 8)
                .collect(),
        }
    }

    /// Separator for this page as a child of its parent.
    pub fn first(&self, duplicates: bool) -> Option<Entry> {
        match self {
            Page::Leaf(entries) => entries.first().map(|e| separator(e, duplicates)),
            Page::Internal(children) => children.first().map(|c| c.first.clone()),
        }
    }

    /// Moves the upper part of this page into a new right sibling.
    pub fn split(&mut self, at: usize) -> Page {
        match self {
            Page::Leaf(entries) => Page::Leaf(entries.split_off(at)),
            Page::Internal(children) => Page::Internal(children.split_off(at)),
        }
    }

    /// Index at which [`Page::split`] should divide this page.
    pub fn split_index(&self, policy: &super::BalancePolicy) -> usize {
        policy.split_point(&self.item_sizes())
    }

    /// Appends every item of `right`; both pages must be on the same level.
    pub fn absorb(&mut self, right: Page) -> Result<()> {
        match (self, right) {
            (Page::Leaf(entries), Page::Leaf(more)) => entries.extend(more),
            (Page::Internal(children), Page::Internal(more)) => children.extend(more),
            _ => return Err(EnvError::Corruption("sibling pages on different levels")),
        }
        Ok(())
    }

    /// Record kind used when this page is written.
    pub fn record_kind(&self, root: bool, duplicates: bool) -> RecordKind {
        match (self.is_leaf(), root, duplicates) {
            (true, false, false) => RecordKind::Leaf,
            (false, false, false) => RecordKind::Internal,
            (true, true, false) => RecordKind::BottomRoot,
            (false, true, false) => RecordKind::Root,
            (true, false, true) => RecordKind::DupLeaf,
            (false, false, true) => RecordKind::DupInternal,
            (true, true, true) => RecordKind::DupBottomRoot,
            (false, true, true) => RecordKind::DupRoot,
        }
    }

    /// Encodes the page; every child must already be saved.
    pub fn encode(&self, root_size: Option<u64>) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.encoded_len() + var::MAX_LEN);
        if let Some(size) = root_size {
            var::encode_u64(size, &mut out);
        }
        var::encode_u64(self.len() as u64, &mut out);
        match self {
            Page::Leaf(entries) => {
                for entry in entries {
                    buf::put_prefixed(&mut out, &entry.key);
                    buf::put_prefixed(&mut out, &entry.value);
                }
            }
            Page::Internal(children) => {
                for child in children {
                    let Node::Saved(address) = child.node else {
                        return Err(EnvError::Invalid("cannot encode page with unsaved child"));
                    };
                    buf::put_prefixed(&mut out, &child.first.key);
                    buf::put_prefixed(&mut out, &child.first.value);
                    out.extend_from_slice(&address.0.to_be_bytes());
                }
            }
        }
        Ok(out)
    }

    /// Decodes a tree page record, returning the root size for root kinds.
    pub fn decode(record: &Loggable) -> Result<(Page, Option<u64>)> {
        if record.kind == RecordKind::DatabaseRoot {
            return Err(EnvError::Corruption("expected tree page record"));
        }
        let payload = &record.payload;
        let mut reader = buf::Reader::new(payload);
        let size = if record.kind.is_root() {
            Some(reader.varint()?)
        } else {
            None
        };
        let count = reader.varint_len()?;
        // Each item takes at least two bytes; reject absurd counts early.
        if count > reader.remaining() / 2 {
            return Err(EnvError::Corruption("page item count exceeds payload"));
        }
        let page = if record.kind.is_leaf() {
            let mut entries = Vec::with_capacity(count);
            for _ in 0..count {
                let key = payload.slice_ref(reader.prefixed()?);
                let value = payload.slice_ref(reader.prefixed()?);
                entries.push(Entry { key, value });
            }
            Page::Leaf(entries)
        } else {
            let mut children = Vec::with_capacity(count);
            for _ in 0..count {
                let key = payload.slice_ref(reader.prefixed()?);
                let value = payload.slice_ref(reader.prefixed()?);
                let address = Address(reader.u64_be()?);
                children.push(Child {
                    first: Entry { key, value },
                    node: Node::Saved(address),
                });
            }
            if children.is_empty() {
                return Err(EnvError::Corruption("internal page without children"));
            }
            Page::Internal(children)
        };
        reader.finish()?;
        Ok((page, size))
    }
}

/// A page that is either shared from the cache or borrowed from a dirty node.
pub(crate) enum PageRef<'a> {
    Shared(Arc<Page>),
    Borrowed(&'a Page),
}

impl Deref for PageRef<'_> {
    type Target = Page;

    fn deref(&self) -> &Page {
        match self {
            PageRef::Shared(page) => page,
            PageRef::Borrowed(page) => page,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StructureId;

    fn loggable(kind: RecordKind, payload: Vec<u8>) -> Loggable {
        Loggable {
            kind,
            address: Address(32),
            structure_id: StructureId(2),
            payload: Bytes::from(payload),
        }
    }

    #[test]
    fn leaf_root_roundtrip() -> Result<()> {
        let page = Page::Leaf(vec![Entry::new("a", "1"), Entry::new("b", "")]);
        let encoded = page.encode(Some(2))?;
        let (decoded, size) = Page::decode(&loggable(RecordKind::BottomRoot, encoded))?;
        assert_eq!(size, Some(2));
        match decoded {
            Page::Leaf(entries) => {
                assert_eq!(entries, vec![Entry::new("a", "1"), Entry::new("b", "")]);
            }
            Page::Internal(_) => panic!("expected leaf"),
        }
        Ok(())
    }

    #[test]
    fn internal_page_keeps_child_addresses() -> Result<()> {
        let page = Page::Internal(vec![
            Child {
                first: Entry::lookup(b"a"),
                node: Node::Saved(Address(100)),
            },
            Child {
                first: Entry::lookup(b"m"),
                node: Node::Saved(Address(200)),
            },
        ]);
        let encoded = page.encode(None)?;
        let (decoded, size) = Page::decode(&loggable(RecordKind::Internal, encoded))?;
        assert_eq!(size, None);
        let Page::Internal(children) = decoded else {
            panic!("expected internal page");
        };
        assert!(matches!(children[1].node, Node::Saved(Address(200))));
        assert_eq!(&children[1].first.key[..], b"m");
        Ok(())
    }

    #[test]
    fn unsaved_child_cannot_be_encoded() {
        let page = Page::Internal(vec![Child {
            first: Entry::lookup(b"a"),
            node: Node::Dirty(Box::new(Page::Leaf(Vec::new()))),
        }]);
        assert!(page.encode(None).is_err());
    }

    #[test]
    fn truncated_payload_is_corruption() -> Result<()> {
        let page = Page::Leaf(vec![Entry::new("key", "value")]);
        let mut encoded = page.encode(None)?;
        encoded.pop();
        assert!(matches!(
            Page::decode(&loggable(RecordKind::Leaf, encoded)),
            Err(EnvError::Corruption(_))
        ));
        Ok(())
    }

    #[test]
    fn duplicate_order_includes_value() {
        let a = Entry::new("k", "1");
        let b = Entry::new("k", "2");
        assert_eq!(compare(&a, &b, false), Ordering::Equal);
        assert_eq!(compare(&a, &b, true), Ordering::Less);
        assert!(separator(&b, false).value.is_empty());
    }
}
