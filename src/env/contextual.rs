use bytes::Bytes;
use tracing::{trace, warn};

use super::config::StoreConfig;
use super::environment::Environment;
use super::store::{Store, StoreCursorSource};
use super::transaction::{Transaction, TransactionState};
use crate::storage::btree::Cursor;
use crate::types::{EnvError, Result};

impl Environment {
    /// The innermost unfinished transaction of the calling thread, or
    /// [`EnvError::NoCurrentTransaction`].
    pub fn get_and_check_current_transaction(&self) -> Result<Transaction> {
        self.current_transaction().ok_or(EnvError::NoCurrentTransaction)
    }

    /// A view of this environment whose calls run in the calling thread's
    /// current transaction instead of taking one.
    pub fn contextual(&self) -> ContextualEnvironment {
        ContextualEnvironment { env: self.clone() }
    }
}

/// Environment calls bound to the calling thread's current transaction.
///
/// Cloning is cheap; clones share the same environment.
#[derive(Clone, Debug)]
pub struct ContextualEnvironment {
    env: Environment,
}

impl ContextualEnvironment {
    /// The wrapped environment.
    pub fn environment(&self) -> &Environment {
        &self.env
    }

    /// See [`Environment::get_and_check_current_transaction`].
    pub fn get_and_check_current_transaction(&self) -> Result<Transaction> {
        self.env.get_and_check_current_transaction()
    }

    /// Opens or creates the store `name` in a transaction of its own, which
    /// is committed before returning.
    pub fn open_store(&self, name: &str, config: StoreConfig) -> Result<ContextualStore> {
        self.in_own_transaction(|txn| self.env.open_store(name, config, txn))
            .map(|store| self.bind(store))
    }

    /// Opens the store `name` if it exists, in a transaction of its own.
    pub fn open_store_if_exists(&self, name: &str) -> Result<Option<ContextualStore>> {
        let store = self.in_own_transaction(|txn| self.env.open_store_if_exists(name, txn))?;
        Ok(store.map(|store| self.bind(store)))
    }

    /// Returns `true` if `name` exists in the current transaction's view.
    pub fn store_exists(&self, name: &str) -> Result<bool> {
        let txn = self.get_and_check_current_transaction()?;
        self.env.store_exists(name, &txn)
    }

    /// Names of all stores in the current transaction's view, in byte order.
    pub fn get_all_store_names(&self) -> Result<Vec<String>> {
        let txn = self.get_and_check_current_transaction()?;
        self.env.get_all_store_names(&txn)
    }

    /// Binds an already opened store to this view.
    pub fn bind(&self, store: Store) -> ContextualStore {
        ContextualStore {
            env: self.env.clone(),
            store,
        }
    }

    fn in_own_transaction<T>(&self, f: impl FnOnce(&Transaction) -> Result<T>) -> Result<T> {
        let txn = self.env.begin_transaction()?;
        let result = f(&txn).and_then(|value| {
            txn.commit()?;
            Ok(value)
        });
        if result.is_err() && txn.state() == TransactionState::Active {
            if let Err(err) = txn.abort() {
                warn!(txn = txn.id().0, error = %err, "env.contextual.abort_failed");
            }
        }
        result
    }
}

/// A [`Store`] whose operations run in the calling thread's current
/// transaction.
///
/// Every operation fails with [`EnvError::NoCurrentTransaction`] when the
/// thread has none.
#[derive(Clone, Debug)]
pub struct ContextualStore {
    env: Environment,
    store: Store,
}

impl ContextualStore {
    /// The underlying store handle.
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Name the store was opened with.
    pub fn name(&self) -> &str {
        self.store.name()
    }

    fn current(&self) -> Result<Transaction> {
        let txn = self.env.get_and_check_current_transaction()?;
        trace!(store = self.store.name(), txn = txn.id().0, "env.contextual.resolve");
        Ok(txn)
    }

    /// See [`Store::get`].
    pub fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        self.store.get(&self.current()?, key)
    }

    /// See [`Store::has_key`].
    pub fn has_key(&self, key: &[u8]) -> Result<bool> {
        self.store.has_key(&self.current()?, key)
    }

    /// See [`Store::exists`].
    pub fn exists(&self, key: &[u8], value: &[u8]) -> Result<bool> {
        self.store.exists(&self.current()?, key, value)
    }

    /// See [`Store::count`].
    pub fn count(&self) -> Result<u64> {
        self.store.count(&self.current()?)
    }

    /// See [`Store::put`].
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<bool> {
        self.store.put(&self.current()?, key, value)
    }

    /// See [`Store::add`].
    pub fn add(&self, key: &[u8], value: &[u8]) -> Result<bool> {
        self.store.add(&self.current()?, key, value)
    }

    /// See [`Store::delete`].
    pub fn delete(&self, key: &[u8]) -> Result<bool> {
        self.store.delete(&self.current()?, key)
    }

    /// See [`Store::delete_pair`].
    pub fn delete_pair(&self, key: &[u8], value: &[u8]) -> Result<bool> {
        self.store.delete_pair(&self.current()?, key, value)
    }

    /// Cursor bound to the transaction that is current when it is opened.
    pub fn open_cursor(&self) -> Result<Cursor<StoreCursorSource>> {
        Ok(self.store.open_cursor(&self.current()?))
    }
}
