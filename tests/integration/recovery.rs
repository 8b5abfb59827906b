//! Crash recovery: torn commits, garbage tails and reopening on-disk logs.

#![allow(missing_docs)]

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};

use sombra_env::primitives::io::{FileIo, MemFileIo};
use sombra_env::storage::btree::BalancePolicy;
use sombra_env::{
    EnvError, Environment, EnvironmentConfig, Result, Store, StoreConfig, Synchronous,
    TransactionState,
};
use tempfile::tempdir;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("sombra_env=debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .try_init();
    });
}

fn config() -> EnvironmentConfig {
    EnvironmentConfig::default().balance(BalancePolicy::new(16, 4096))
}

fn open_mem(io: &MemFileIo, config: EnvironmentConfig) -> Result<Environment> {
    Environment::open_with_io(Arc::new(io.clone()), config)
}

fn put_one(env: &Environment, store: &Store, key: &[u8], value: &[u8]) -> Result<()> {
    env.execute_in_transaction(|txn| store.put(txn, key, value).map(|_| ()))
}

fn read(env: &Environment, name: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
    env.compute_in_readonly_transaction(|txn| {
        let store = env.open_store(name, StoreConfig::UseExisting, txn)?;
        Ok(store.get(txn, key)?.map(|v| v.to_vec()))
    })
}

/// Two commits on a fresh in-memory log; returns the log and the length it
/// had right after the first one.
fn two_commits() -> Result<(MemFileIo, usize)> {
    let io = MemFileIo::new();
    let env = open_mem(&io, config())?;
    let store = env.compute_in_transaction(|txn| {
        let store = env.open_store("s", StoreConfig::WithoutDuplicates, txn)?;
        store.put(txn, b"k", b"1")?;
        Ok(store)
    })?;
    let first_len = io.contents().len();
    env.execute_in_transaction(|txn| {
        store.put(txn, b"k", b"2")?;
        for i in 0u32..64 {
            store.put(txn, &i.to_be_bytes(), &[7u8; 100])?;
        }
        Ok(())
    })?;
    env.close()?;
    Ok((io, first_len))
}

#[test]
fn torn_commit_falls_back_to_previous_root() -> Result<()> {
    init_tracing();
    let (io, first_len) = two_commits()?;
    let full = io.contents();
    assert!(full.len() > first_len);

    for cut in [first_len + 1, (first_len + full.len()) / 2, full.len() - 1] {
        let damaged = MemFileIo::from_bytes(full[..cut].to_vec());
        let env = open_mem(&damaged, config())?;
        assert_eq!(read(&env, "s", b"k")?.as_deref(), Some(&b"1"[..]));
        assert_eq!(read(&env, "s", &3u32.to_be_bytes())?, None);
        assert_eq!(damaged.len()?, first_len as u64);
        assert_eq!(env.stats().log.truncated_bytes, (cut - first_len) as u64);

        // The recovered environment accepts new commits.
        let store = env.compute_in_transaction(|txn| {
            env.open_store("s", StoreConfig::UseExisting, txn)
        })?;
        put_one(&env, &store, b"k", b"3")?;
        assert_eq!(read(&env, "s", b"k")?.as_deref(), Some(&b"3"[..]));
    }
    Ok(())
}

#[test]
fn garbage_tail_is_discarded() -> Result<()> {
    init_tracing();
    let (io, _) = two_commits()?;
    let mut bytes = io.contents();
    let clean_len = bytes.len();
    bytes.extend_from_slice(&[0xAB; 100]);
    let damaged = MemFileIo::from_bytes(bytes);

    let env = open_mem(&damaged, config())?;
    assert_eq!(read(&env, "s", b"k")?.as_deref(), Some(&b"2"[..]));
    assert_eq!(
        read(&env, "s", &63u32.to_be_bytes())?.as_deref(),
        Some(&[7u8; 100][..])
    );
    assert_eq!(damaged.len()?, clean_len as u64);
    assert_eq!(env.stats().log.truncated_bytes, 100);
    Ok(())
}

#[test]
fn readonly_open_keeps_the_damaged_tail() -> Result<()> {
    let (io, first_len) = two_commits()?;
    let full = io.contents();
    let damaged = MemFileIo::from_bytes(full[..full.len() - 3].to_vec());
    let env = open_mem(&damaged, config().readonly(true))?;
    assert_eq!(read(&env, "s", b"k")?.as_deref(), Some(&b"1"[..]));
    assert_eq!(damaged.len()?, (full.len() - 3) as u64);
    assert!(env.current_root().address().is_some());
    assert!(first_len < full.len());
    Ok(())
}

#[test]
fn log_without_commits_opens_empty() -> Result<()> {
    let io = MemFileIo::new();
    {
        let env = open_mem(&io, config())?;
        let txn = env.begin_transaction()?;
        let store = env.open_store("never", StoreConfig::WithoutDuplicates, &txn)?;
        store.put(&txn, b"k", b"v")?;
        txn.abort()?;
    }
    let env = open_mem(&io, config())?;
    assert_eq!(env.current_root().sequence(), 0);
    let names = env.compute_in_readonly_transaction(|txn| env.get_all_store_names(txn))?;
    assert!(names.is_empty());
    Ok(())
}

#[test]
fn reopen_recovers_stores_and_names() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let path = dir.path().join("env.log");

    let (users, tags) = {
        let env = Environment::open(&path, config())?;
        let stores = env.compute_in_transaction(|txn| {
            let users = env.open_store("users", StoreConfig::WithoutDuplicates, txn)?;
            let tags = env.open_store("tags", StoreConfig::WithDuplicates, txn)?;
            for i in 0u32..500 {
                users.put(txn, &i.to_be_bytes(), format!("user-{i}").as_bytes())?;
            }
            for tag in ["red", "green", "blue"] {
                tags.put(txn, b"colors", tag.as_bytes())?;
            }
            Ok((users, tags))
        })?;
        env.execute_in_transaction(|txn| {
            for i in (0u32..500).step_by(5) {
                stores.0.delete(txn, &i.to_be_bytes())?;
            }
            Ok(())
        })?;
        env.close()?;
        stores
    };

    let env = Environment::open(&path, config())?;
    env.execute_in_readonly_transaction(|txn| {
        assert_eq!(env.get_all_store_names(txn)?, vec!["tags", "users"]);
        let reopened = env.open_store("users", StoreConfig::UseExisting, txn)?;
        assert_eq!(reopened.structure_id(), users.structure_id());
        assert_eq!(reopened.count(txn)?, 400);
        assert_eq!(reopened.get(txn, &0u32.to_be_bytes())?, None);
        assert_eq!(
            reopened.get(txn, &499u32.to_be_bytes())?.as_deref(),
            Some(&b"user-499"[..])
        );
        let colors = env.open_store("tags", StoreConfig::UseExisting, txn)?;
        assert!(colors.allows_duplicates());
        assert_eq!(colors.structure_id(), tags.structure_id());
        let values: Vec<Vec<u8>> = colors
            .open_cursor(txn)
            .collect_remaining()?
            .into_iter()
            .map(|(_, v)| v.to_vec())
            .collect();
        assert_eq!(values, vec![b"blue".to_vec(), b"green".to_vec(), b"red".to_vec()]);
        Ok(())
    })?;

    let fresh = env.compute_in_transaction(|txn| {
        env.open_store("fresh", StoreConfig::WithoutDuplicates, txn)
    })?;
    assert!(fresh.structure_id() > users.structure_id());
    assert!(fresh.structure_id() > tags.structure_id());
    Ok(())
}

#[test]
fn synchronous_mode_controls_syncs() -> Result<()> {
    for (mode, expected) in [
        (Synchronous::Full, 3),
        (Synchronous::Normal, 0),
        (Synchronous::Off, 0),
    ] {
        let io = MemFileIo::new();
        let env = open_mem(&io, config().synchronous(mode))?;
        let store = env.compute_in_transaction(|txn| {
            env.open_store("s", StoreConfig::WithoutDuplicates, txn)
        })?;
        put_one(&env, &store, b"a", b"1")?;
        put_one(&env, &store, b"b", b"2")?;
        assert_eq!(env.stats().log.syncs, expected, "mode {}", mode.as_str());
    }
    Ok(())
}

/// In-memory file whose `sync_all` fails while `fail_sync` is set.
#[derive(Clone, Default)]
struct FailingSyncIo {
    inner: MemFileIo,
    fail_sync: Arc<AtomicBool>,
}

impl FileIo for FailingSyncIo {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        self.inner.read_at(off, dst)
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
        self.inner.write_at(off, src)
    }

    fn sync_all(&self) -> Result<()> {
        if self.fail_sync.load(Ordering::SeqCst) {
            return Err(EnvError::Io(io::Error::new(io::ErrorKind::Other, "fsync failed")));
        }
        self.inner.sync_all()
    }

    fn len(&self) -> Result<u64> {
        self.inner.len()
    }

    fn truncate(&self, len: u64) -> Result<()> {
        self.inner.truncate(len)
    }
}

#[test]
fn failed_sync_leaves_no_commit_behind() -> Result<()> {
    init_tracing();
    let io = FailingSyncIo::default();
    let env = Environment::open_with_io(
        Arc::new(io.clone()),
        config().synchronous(Synchronous::Full),
    )?;
    let store = env.compute_in_transaction(|txn| {
        env.open_store("s", StoreConfig::WithoutDuplicates, txn)
    })?;
    put_one(&env, &store, b"kept", b"1")?;
    let len_before = io.len()?;

    io.fail_sync.store(true, Ordering::SeqCst);
    let txn = env.begin_transaction()?;
    for i in 0u32..40 {
        store.put(&txn, &i.to_be_bytes(), &[9u8; 64])?;
    }
    store.put(&txn, b"k", b"v")?;
    assert!(matches!(txn.commit(), Err(EnvError::Io(_))));
    assert_eq!(txn.state(), TransactionState::Active);
    assert!(txn.has_changes());
    assert_eq!(store.get(&txn, b"k")?.as_deref(), Some(&b"v"[..]));
    txn.abort()?;
    assert_eq!(io.len()?, len_before);
    assert!(env.stats().log.rolled_back_bytes > 0);
    assert_eq!(read(&env, "s", b"k")?, None);

    // The log keeps working once syncs succeed again.
    io.fail_sync.store(false, Ordering::SeqCst);
    put_one(&env, &store, b"after", b"2")?;
    assert_eq!(read(&env, "s", b"after")?.as_deref(), Some(&b"2"[..]));
    env.close()?;

    let reopened = open_mem(&io.inner, config())?;
    assert_eq!(read(&reopened, "s", b"k")?, None);
    assert_eq!(read(&reopened, "s", &3u32.to_be_bytes())?, None);
    assert_eq!(read(&reopened, "s", b"kept")?.as_deref(), Some(&b"1"[..]));
    assert_eq!(read(&reopened, "s", b"after")?.as_deref(), Some(&b"2"[..]));
    Ok(())
}

#[test]
fn failed_flush_keeps_the_writes_for_a_retry() -> Result<()> {
    let io = FailingSyncIo::default();
    let env = Environment::open_with_io(
        Arc::new(io.clone()),
        config().synchronous(Synchronous::Full),
    )?;
    let store = env.compute_in_transaction(|txn| {
        env.open_store("s", StoreConfig::WithoutDuplicates, txn)
    })?;
    let txn = env.begin_transaction()?;
    store.put(&txn, b"k", b"v")?;
    io.fail_sync.store(true, Ordering::SeqCst);
    assert!(matches!(txn.flush(), Err(EnvError::Io(_))));
    io.fail_sync.store(false, Ordering::SeqCst);
    assert!(txn.flush()?);
    txn.commit()?;
    env.close()?;

    let reopened = open_mem(&io.inner, config())?;
    assert_eq!(read(&reopened, "s", b"k")?.as_deref(), Some(&b"v"[..]));
    Ok(())
}
