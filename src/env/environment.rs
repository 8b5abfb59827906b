use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::SystemTime;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, trace, warn};

use super::config::{EnvironmentConfig, Synchronous};
use super::registry::{Registry, SafeTask};
use super::root::DatabaseRoot;
use super::transaction::{Transaction, TransactionState, TxnInner};
use crate::primitives::io::{FileIo, MemFileIo, StdFileIo};
use crate::primitives::log::{Log, LogOptions, LogStats, RecordKind};
use crate::storage::btree::{BTreeStatsSnapshot, TreeContext};
use crate::types::{Address, EnvError, Result, StructureId, TxnId};

/// Structure id stamped on database root records, which belong to no tree.
const ROOT_RECORD_STRUCTURE: StructureId = StructureId(0);

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[derive(Default)]
struct EnvCounters {
    commits: AtomicU64,
    aborts: AtomicU64,
    flushes: AtomicU64,
    reverts: AtomicU64,
    conflicts: AtomicU64,
    safe_tasks_run: AtomicU64,
}

/// Point-in-time environment counters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EnvStats {
    /// Successful commits, empty ones included.
    pub commits: u64,
    /// Aborted transactions.
    pub aborts: u64,
    /// Successful flushes.
    pub flushes: u64,
    /// Reverts.
    pub reverts: u64,
    /// Commits and flushes rejected by a conflict.
    pub conflicts: u64,
    /// Safe tasks executed.
    pub safe_tasks_run: u64,
    /// Transactions currently active on any thread.
    pub active_transactions: usize,
    /// Safe tasks waiting for the active count to drop to zero.
    pub queued_safe_tasks: usize,
    /// Log counters.
    pub log: LogStats,
    /// Tree page counters.
    pub trees: BTreeStatsSnapshot,
}

pub(crate) struct EnvShared {
    log: Arc<Log>,
    ctx: Arc<TreeContext>,
    config: RwLock<EnvironmentConfig>,
    current: RwLock<Arc<DatabaseRoot>>,
    commit_lock: Mutex<()>,
    registry: Mutex<Registry>,
    next_txn_id: AtomicU64,
    next_structure_id: AtomicU64,
    last_created: AtomicU64,
    counters: EnvCounters,
}

/// A transactional key-value environment backed by one append-only log.
///
/// Cloning is cheap; clones share the same environment.
#[derive(Clone)]
pub struct Environment {
    shared: Arc<EnvShared>,
}

impl Environment {
    /// Opens or creates the environment stored in the log file at `path`.
    ///
    /// With `env_is_readonly` the file is opened read-only and must exist.
    pub fn open(path: impl AsRef<Path>, config: EnvironmentConfig) -> Result<Self> {
        let path = path.as_ref();
        let io: Arc<dyn FileIo> = if config.env_is_readonly {
            Arc::new(StdFileIo::open_readonly(path)?)
        } else {
            Arc::new(StdFileIo::open(path)?)
        };
        info!(path = %path.display(), readonly = config.env_is_readonly, "env.open");
        Self::open_with_io(io, config)
    }

    /// Creates an environment that lives in memory only.
    pub fn in_memory(config: EnvironmentConfig) -> Result<Self> {
        Self::open_with_io(Arc::new(MemFileIo::new()), config)
    }

    /// Opens an environment on any [`FileIo`] backend.
    pub fn open_with_io(io: Arc<dyn FileIo>, config: EnvironmentConfig) -> Result<Self> {
        let options = LogOptions::new(config.log_salt).readonly(config.env_is_readonly);
        let log = Arc::new(Log::open(io, options)?);
        let ctx = Arc::new(TreeContext::new(
            Arc::clone(&log),
            config.balance_policy(),
            config.page_cache_size,
        ));
        let root = match log.recovered_root() {
            Some(address) => DatabaseRoot::decode(&log.read(address)?)?,
            None => DatabaseRoot::initial(),
        };
        let next_structure_id = root.next_structure_id().max(StructureId::FIRST_USER);
        info!(
            sequence = root.sequence(),
            trees = root.tree_count(),
            next_structure_id = next_structure_id.0,
            "env.open.root"
        );
        Ok(Self {
            shared: Arc::new(EnvShared {
                log,
                ctx,
                config: RwLock::new(config),
                last_created: AtomicU64::new(root.timestamp_ms()),
                current: RwLock::new(Arc::new(root)),
                commit_lock: Mutex::new(()),
                registry: Mutex::new(Registry::default()),
                next_txn_id: AtomicU64::new(1),
                next_structure_id: AtomicU64::new(next_structure_id.0),
                counters: EnvCounters::default(),
            }),
        })
    }

    /// Copy of the current settings.
    pub fn config(&self) -> EnvironmentConfig {
        self.shared.config.read().clone()
    }

    /// Changes settings at runtime.
    ///
    /// Only the read-only flags and the synchronous mode take effect; the
    /// tree and log settings were consumed at open.
    pub fn update_config(&self, f: impl FnOnce(&mut EnvironmentConfig)) {
        let mut config = self.shared.config.write();
        f(&mut config);
        debug!(
            readonly = config.env_is_readonly,
            readonly_empty_stores = config.env_readonly_empty_stores,
            synchronous = config.synchronous.as_str(),
            "env.config.updated"
        );
    }

    /// Returns `true` if the environment rejects every write.
    pub fn is_readonly(&self) -> bool {
        self.shared.config.read().env_is_readonly
    }

    /// The most recently published database root.
    pub fn current_root(&self) -> Arc<DatabaseRoot> {
        Arc::clone(&*self.shared.current.read())
    }

    /// Begins a read-write transaction on the calling thread.
    pub fn begin_transaction(&self) -> Result<Transaction> {
        self.begin(false)
    }

    /// Begins a transaction that rejects every write.
    pub fn begin_readonly_transaction(&self) -> Result<Transaction> {
        self.begin(true)
    }

    /// The innermost unfinished transaction of the calling thread.
    pub fn current_transaction(&self) -> Option<Transaction> {
        let (id, inner) = self.shared.registry.lock().top(thread::current().id())?;
        Some(Transaction {
            env: self.clone(),
            id,
            inner,
        })
    }

    /// Runs `task` now if no transaction is active, otherwise once the last
    /// active transaction finishes. Queued tasks run in submission order.
    pub fn execute_transaction_safe_task(&self, task: impl FnOnce() + Send + 'static) {
        let deferred = self.shared.registry.lock().defer(Box::new(task));
        match deferred {
            Some(task) => self.run_safe_tasks(vec![task]),
            None => trace!("env.safe_task.queued"),
        }
    }

    /// Runs `f` in the calling thread's current transaction, or in a new one
    /// that is committed afterwards.
    ///
    /// A new transaction is reverted and `f` re-run while the commit
    /// conflicts; it is aborted if `f` fails or panics.
    pub fn compute_in_transaction<T>(
        &self,
        mut f: impl FnMut(&Transaction) -> Result<T>,
    ) -> Result<T> {
        if let Some(txn) = self.current_transaction() {
            return f(&txn);
        }
        let txn = self.begin_transaction()?;
        let _guard = AbortOnDrop(&txn);
        loop {
            let value = f(&txn)?;
            match txn.commit() {
                Ok(()) => return Ok(value),
                Err(err) if err.is_retryable() => {
                    debug!(txn = txn.id().0, error = %err, "env.txn.retry");
                    txn.revert()?;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// [`Environment::compute_in_transaction`] without a result.
    pub fn execute_in_transaction(&self, f: impl FnMut(&Transaction) -> Result<()>) -> Result<()> {
        self.compute_in_transaction(f)
    }

    /// Runs `f` in a new read-only transaction that is aborted afterwards.
    pub fn compute_in_readonly_transaction<T>(
        &self,
        f: impl FnOnce(&Transaction) -> Result<T>,
    ) -> Result<T> {
        let txn = self.begin_readonly_transaction()?;
        let _guard = AbortOnDrop(&txn);
        f(&txn)
    }

    /// [`Environment::compute_in_readonly_transaction`] without a result.
    pub fn execute_in_readonly_transaction(
        &self,
        f: impl FnOnce(&Transaction) -> Result<()>,
    ) -> Result<()> {
        self.compute_in_readonly_transaction(f)
    }

    /// Forces every appended record to persistent storage.
    pub fn sync(&self) -> Result<()> {
        self.shared.log.sync()
    }

    /// Syncs the log and rejects further transactions.
    ///
    /// Fails while any transaction is active.
    pub fn close(&self) -> Result<()> {
        {
            let mut registry = self.shared.registry.lock();
            if registry.closed {
                return Ok(());
            }
            if registry.active() > 0 {
                return Err(EnvError::InvalidOwned(format!(
                    "can't close environment: {} transactions are active",
                    registry.active()
                )));
            }
            registry.closed = true;
        }
        if !self.is_readonly() && self.shared.config.read().synchronous != Synchronous::Off {
            self.shared.log.sync()?;
        }
        info!(stats = ?self.shared.log.stats(), "env.close");
        Ok(())
    }

    /// Returns `true` once [`Environment::close`] succeeded.
    pub fn is_closed(&self) -> bool {
        self.shared.registry.lock().closed
    }

    /// Environment counters.
    pub fn stats(&self) -> EnvStats {
        let counters = &self.shared.counters;
        let (active_transactions, queued_safe_tasks) = {
            let registry = self.shared.registry.lock();
            (registry.active(), registry.queued_tasks())
        };
        EnvStats {
            commits: counters.commits.load(Ordering::Relaxed),
            aborts: counters.aborts.load(Ordering::Relaxed),
            flushes: counters.flushes.load(Ordering::Relaxed),
            reverts: counters.reverts.load(Ordering::Relaxed),
            conflicts: counters.conflicts.load(Ordering::Relaxed),
            safe_tasks_run: counters.safe_tasks_run.load(Ordering::Relaxed),
            active_transactions,
            queued_safe_tasks,
            log: self.shared.log.stats(),
            trees: self.shared.ctx.stats(),
        }
    }

    pub(crate) fn tree_context(&self) -> &Arc<TreeContext> {
        &self.shared.ctx
    }

    pub(crate) fn allocate_structure_id(&self) -> StructureId {
        StructureId(self.shared.next_structure_id.fetch_add(1, Ordering::SeqCst))
    }

    fn begin(&self, readonly: bool) -> Result<Transaction> {
        let shared = &self.shared;
        let snapshot = Arc::clone(&*shared.current.read());
        let id = TxnId(shared.next_txn_id.fetch_add(1, Ordering::Relaxed));
        let thread = thread::current().id();
        let created = self.next_created();
        let inner = {
            let mut registry = shared.registry.lock();
            if registry.closed {
                return Err(EnvError::EnvironmentClosed);
            }
            let depth = registry.depth(thread);
            let inner = Arc::new(Mutex::new(TxnInner::new(
                snapshot, created, thread, readonly, depth,
            )));
            registry.push(thread, id, Arc::clone(&inner));
            inner
        };
        trace!(txn = id.0, readonly, "env.txn.begin");
        Ok(Transaction {
            env: self.clone(),
            id,
            inner,
        })
    }

    /// Current time in ms, bumped past the previous value handed out.
    fn next_created(&self) -> u64 {
        let now = now_millis();
        let previous = self
            .shared
            .last_created
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or(now);
        now.max(previous + 1)
    }

    pub(crate) fn finish(&self, txn: &Transaction, commit: bool) -> Result<()> {
        let mut inner = txn.inner.lock();
        inner.ensure_active()?;
        if !txn.on_creating_thread(&inner) {
            return Err(EnvError::WrongThread);
        }
        if !self.shared.registry.lock().is_top(inner.thread, txn.id) {
            return Err(EnvError::NestedTransactionNotFinished);
        }
        if commit {
            self.publish(&inner)?;
            inner.state = TransactionState::Committed;
            self.shared.counters.commits.fetch_add(1, Ordering::Relaxed);
        } else {
            inner.state = TransactionState::Aborted;
            self.shared.counters.aborts.fetch_add(1, Ordering::Relaxed);
        }
        inner.discard();
        let thread = inner.thread;
        drop(inner);
        let tasks = self.shared.registry.lock().pop(thread, txn.id);
        trace!(txn = txn.id.0, commit, "env.txn.finished");
        self.run_safe_tasks(tasks);
        Ok(())
    }

    pub(crate) fn flush(&self, txn: &Transaction) -> Result<bool> {
        let mut inner = txn.inner.lock();
        inner.ensure_active()?;
        match self.publish(&inner) {
            Ok(published) => {
                let root = published.unwrap_or_else(|| self.current_root());
                inner.rebase(root, self.next_created());
                self.shared.counters.flushes.fetch_add(1, Ordering::Relaxed);
                Ok(true)
            }
            Err(err) if err.is_retryable() => Ok(false),
            Err(err) => Err(err),
        }
    }

    pub(crate) fn revert(&self, txn: &Transaction) -> Result<()> {
        let mut inner = txn.inner.lock();
        inner.ensure_active()?;
        inner.rebase(self.current_root(), self.next_created());
        self.shared.counters.reverts.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Validates the transaction's dirty stores against the current root and
    /// publishes them as a new database root.
    ///
    /// Returns `None` without writing anything when nothing changed.
    fn publish(&self, inner: &TxnInner) -> Result<Option<Arc<DatabaseRoot>>> {
        let dirty = inner.dirty_structures();
        if dirty.is_empty() {
            return Ok(None);
        }
        if inner.readonly || self.is_readonly() {
            return Err(EnvError::ReadonlyTransactionViolation(
                "can't publish writes of a read-only transaction",
            ));
        }
        let shared = &self.shared;
        let _commit = shared.commit_lock.lock();
        let current = Arc::clone(&*shared.current.read());
        for &structure_id in &dirty {
            if current.root_of(structure_id) != inner.snapshot.root_of(structure_id) {
                shared.counters.conflicts.fetch_add(1, Ordering::Relaxed);
                debug!(structure_id = structure_id.0, "env.commit.conflict");
                return Err(EnvError::TransactionConflict { structure_id });
            }
        }
        let mark = shared.ctx.log().mark();
        let (root, address) = match self.write_root(inner, &current, dirty) {
            Ok(written) => written,
            Err(err) => {
                match shared.ctx.rollback_to(mark) {
                    Ok(()) => debug!(error = %err, "env.commit.rolled_back"),
                    Err(rollback) => warn!(
                        error = %err,
                        rollback_error = %rollback,
                        "env.commit.rollback_failed"
                    ),
                }
                return Err(err);
            }
        };
        let root = Arc::new(root.with_address(address));
        *shared.current.write() = Arc::clone(&root);
        debug!(
            sequence = root.sequence(),
            address = address.0,
            trees = root.tree_count(),
            "env.commit.published"
        );
        Ok(Some(root))
    }

    /// Saves copies of the dirty trees and appends the root record over them.
    ///
    /// The transaction's own trees are left untouched, so a failure leaves
    /// it exactly as it was.
    fn write_root(
        &self,
        inner: &TxnInner,
        current: &DatabaseRoot,
        dirty: Vec<StructureId>,
    ) -> Result<(DatabaseRoot, Address)> {
        let shared = &self.shared;
        let mut updates = Vec::with_capacity(dirty.len());
        for structure_id in dirty {
            let mut tree = inner
                .trees
                .get(&structure_id)
                .ok_or(EnvError::Corruption("dirty tree missing from transaction"))?
                .clone();
            updates.push((structure_id, tree.save()?));
        }
        let next_structure_id = StructureId(shared.next_structure_id.load(Ordering::SeqCst));
        let root = current.advance(updates, next_structure_id, now_millis());
        let address = shared.log.append(
            RecordKind::DatabaseRoot,
            ROOT_RECORD_STRUCTURE,
            &root.encode(),
        )?;
        if shared.config.read().synchronous == Synchronous::Full {
            shared.log.sync()?;
        }
        Ok((root, address))
    }

    fn run_safe_tasks(&self, tasks: Vec<SafeTask>) {
        for task in tasks {
            if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(task)) {
                warn!(panic = %panic_message(&*panic), "env.safe_task.panicked");
            }
            self.shared
                .counters
                .safe_tasks_run
                .fetch_add(1, Ordering::Relaxed);
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("root", &self.current_root())
            .field("config", &self.config())
            .finish()
    }
}

/// Aborts a still active transaction when dropped, panics included.
struct AbortOnDrop<'a>(&'a Transaction);

impl Drop for AbortOnDrop<'_> {
    fn drop(&mut self) {
        if self.0.state() == TransactionState::Active {
            if let Err(err) = self.0.abort() {
                warn!(txn = self.0.id().0, error = %err, "env.txn.abort_failed");
            }
        }
    }
}
