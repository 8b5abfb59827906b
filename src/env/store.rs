use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info};

use super::config::StoreConfig;
use super::environment::Environment;
use super::meta::TreeMetaInfo;
use super::transaction::Transaction;
use crate::storage::btree::{ChunkSource, Cursor, Entry, Seek};
use crate::types::{EnvError, Result, StructureId};

/// A named key-value collection.
///
/// The handle is not bound to a transaction: every operation takes the
/// transaction it runs in.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Store {
    name: Arc<str>,
    meta: TreeMetaInfo,
}

impl Store {
    fn new(name: &str, meta: TreeMetaInfo) -> Self {
        Self {
            name: Arc::from(name),
            meta,
        }
    }

    /// Name the store was opened with.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Identity of the store's tree.
    pub fn structure_id(&self) -> StructureId {
        self.meta.structure_id
    }

    /// Whether several values may share a key.
    pub fn allows_duplicates(&self) -> bool {
        self.meta.duplicates
    }

    /// Returns `true` for the empty stand-in of a missing store in read-only mode.
    pub fn is_temporary(&self) -> bool {
        self.meta.temporary
    }

    /// Stored settings.
    pub fn meta(&self) -> TreeMetaInfo {
        self.meta
    }

    /// Value under `key`; the smallest one in stores with duplicates.
    pub fn get(&self, txn: &Transaction, key: &[u8]) -> Result<Option<Bytes>> {
        txn.read(&self.meta, |tree| tree.get(key))
    }

    /// Returns `true` if `key` has a value.
    pub fn has_key(&self, txn: &Transaction, key: &[u8]) -> Result<bool> {
        txn.read(&self.meta, |tree| tree.has_key(key))
    }

    /// Returns `true` if the exact pair is stored.
    pub fn exists(&self, txn: &Transaction, key: &[u8], value: &[u8]) -> Result<bool> {
        txn.read(&self.meta, |tree| tree.has_pair(key, value))
    }

    /// Number of entries as seen by `txn`.
    pub fn count(&self, txn: &Transaction) -> Result<u64> {
        txn.read(&self.meta, |tree| Ok(tree.size()))
    }

    /// Stores `value` under `key`, replacing the value in stores without
    /// duplicates. Returns `false` if the store already held exactly this.
    pub fn put(&self, txn: &Transaction, key: &[u8], value: &[u8]) -> Result<bool> {
        txn.write(&self.meta, |tree| {
            tree.put(Bytes::copy_from_slice(key), Bytes::copy_from_slice(value))
        })
    }

    /// Stores the pair only if `key` has no value yet.
    pub fn add(&self, txn: &Transaction, key: &[u8], value: &[u8]) -> Result<bool> {
        txn.write(&self.meta, |tree| {
            tree.add(Bytes::copy_from_slice(key), Bytes::copy_from_slice(value))
        })
    }

    /// Removes `key` with all its values.
    pub fn delete(&self, txn: &Transaction, key: &[u8]) -> Result<bool> {
        txn.write(&self.meta, |tree| tree.delete(key))
    }

    /// Removes one exact pair.
    pub fn delete_pair(&self, txn: &Transaction, key: &[u8], value: &[u8]) -> Result<bool> {
        txn.write(&self.meta, |tree| tree.delete_pair(key, value))
    }

    /// Ordered cursor over the store as `txn` sees it, its own writes included.
    pub fn open_cursor(&self, txn: &Transaction) -> Cursor<StoreCursorSource> {
        Cursor::new(StoreCursorSource {
            txn: txn.clone(),
            meta: self.meta,
        })
    }
}

/// Feeds a store cursor from its transaction.
pub struct StoreCursorSource {
    txn: Transaction,
    meta: TreeMetaInfo,
}

impl ChunkSource for StoreCursorSource {
    fn fill(&self, seek: &Seek, limit: usize, out: &mut Vec<Entry>) -> Result<()> {
        self.txn.read(&self.meta, |tree| tree.fill(seek, limit, out))
    }
}

impl Environment {
    /// Opens the store `name`, creating it unless `config` is
    /// [`StoreConfig::UseExisting`].
    ///
    /// In read-only mode a missing store is an error, or with
    /// `env_readonly_empty_stores` a temporary empty store that rejects writes.
    pub fn open_store(&self, name: &str, config: StoreConfig, txn: &Transaction) -> Result<Store> {
        if let Some(meta) = self.load_store_meta(name, txn)? {
            if let Some(duplicates) = config.duplicates() {
                if duplicates != meta.duplicates {
                    return Err(EnvError::InvalidOwned(format!(
                        "store {name} was created with duplicates = {}",
                        meta.duplicates
                    )));
                }
            }
            return Ok(Store::new(name, meta));
        }
        let Some(duplicates) = config.duplicates() else {
            return Err(EnvError::StoreNotFound(name.to_owned()));
        };
        if txn.is_readonly() {
            if self.config().env_readonly_empty_stores {
                debug!(store = name, "env.store.temporary");
                return Ok(Store::new(name, TreeMetaInfo::temporary(duplicates)));
            }
            return Err(EnvError::ReadonlyTransactionViolation(
                "can't create a store in read-only mode",
            ));
        }
        let meta = TreeMetaInfo {
            structure_id: self.allocate_structure_id(),
            duplicates,
            temporary: false,
        };
        txn.write(&TreeMetaInfo::META_TREE, |tree| {
            tree.put(
                Bytes::copy_from_slice(name.as_bytes()),
                Bytes::from(meta.encode()),
            )
        })?;
        info!(
            store = name,
            structure_id = meta.structure_id.0,
            duplicates,
            "env.store.created"
        );
        Ok(Store::new(name, meta))
    }

    /// Opens the store `name` if it exists.
    pub fn open_store_if_exists(&self, name: &str, txn: &Transaction) -> Result<Option<Store>> {
        Ok(self
            .load_store_meta(name, txn)?
            .map(|meta| Store::new(name, meta)))
    }

    /// Returns `true` if a store called `name` exists in `txn`'s view.
    pub fn store_exists(&self, name: &str, txn: &Transaction) -> Result<bool> {
        Ok(self.load_store_meta(name, txn)?.is_some())
    }

    /// Names of all stores in `txn`'s view, in byte order.
    pub fn get_all_store_names(&self, txn: &Transaction) -> Result<Vec<String>> {
        let mut cursor = Cursor::new(StoreCursorSource {
            txn: txn.clone(),
            meta: TreeMetaInfo::META_TREE,
        });
        let mut names = Vec::new();
        while let Some((key, _)) = cursor.next()? {
            let name = String::from_utf8(key.to_vec())
                .map_err(|_| EnvError::Corruption("store name is not valid UTF-8"))?;
            names.push(name);
        }
        Ok(names)
    }

    /// Deletes the store `name` with its contents.
    pub fn remove_store(&self, name: &str, txn: &Transaction) -> Result<()> {
        let meta = self
            .load_store_meta(name, txn)?
            .ok_or_else(|| EnvError::StoreNotFound(name.to_owned()))?;
        txn.write(&TreeMetaInfo::META_TREE, |tree| tree.delete(name.as_bytes()))?;
        txn.clear(&meta)?;
        info!(store = name, structure_id = meta.structure_id.0, "env.store.removed");
        Ok(())
    }

    /// Removes every entry of the store `name`, keeping the store.
    pub fn truncate_store(&self, name: &str, txn: &Transaction) -> Result<()> {
        let meta = self
            .load_store_meta(name, txn)?
            .ok_or_else(|| EnvError::StoreNotFound(name.to_owned()))?;
        txn.clear(&meta)?;
        debug!(store = name, structure_id = meta.structure_id.0, "env.store.truncated");
        Ok(())
    }

    fn load_store_meta(&self, name: &str, txn: &Transaction) -> Result<Option<TreeMetaInfo>> {
        let raw = txn.read(&TreeMetaInfo::META_TREE, |tree| tree.get(name.as_bytes()))?;
        raw.map(|bytes| TreeMetaInfo::decode(&bytes)).transpose()
    }
}
