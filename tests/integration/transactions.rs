//! Transaction lifecycle: nesting, termination rules, flush and revert.

#![allow(missing_docs)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use sombra_env::{
    EnvError, Environment, EnvironmentConfig, Result, Store, StoreConfig, TransactionState,
};

fn open_env() -> Result<Environment> {
    Environment::in_memory(EnvironmentConfig::ephemeral())
}

fn create_store(env: &Environment, name: &str) -> Result<Store> {
    env.compute_in_transaction(|txn| env.open_store(name, StoreConfig::WithoutDuplicates, txn))
}

#[test]
fn nested_transactions_finish_in_reverse_order() -> Result<()> {
    let env = open_env()?;
    let outer = env.begin_transaction()?;
    let inner = env.begin_transaction()?;
    assert_eq!(outer.depth(), 0);
    assert_eq!(inner.depth(), 1);

    assert!(matches!(
        outer.commit(),
        Err(EnvError::NestedTransactionNotFinished)
    ));
    assert!(matches!(
        outer.abort(),
        Err(EnvError::NestedTransactionNotFinished)
    ));
    assert_eq!(outer.state(), TransactionState::Active);

    inner.commit()?;
    outer.commit()?;
    assert_eq!(env.stats().active_transactions, 0);
    Ok(())
}

#[test]
fn finishing_twice_is_rejected() -> Result<()> {
    let env = open_env()?;
    let txn = env.begin_transaction()?;
    txn.commit()?;
    assert!(matches!(txn.commit(), Err(EnvError::TransactionAlreadyFinished)));
    assert!(matches!(txn.abort(), Err(EnvError::TransactionAlreadyFinished)));
    assert!(matches!(txn.flush(), Err(EnvError::TransactionAlreadyFinished)));
    assert!(matches!(txn.revert(), Err(EnvError::TransactionAlreadyFinished)));

    let txn = env.begin_transaction()?;
    txn.abort()?;
    assert_eq!(txn.state(), TransactionState::Aborted);
    assert!(matches!(txn.abort(), Err(EnvError::TransactionAlreadyFinished)));
    Ok(())
}

#[test]
fn current_transaction_tracks_the_thread_stack() -> Result<()> {
    let env = open_env()?;
    assert!(env.current_transaction().is_none());
    let outer = env.begin_transaction()?;
    let inner = env.begin_readonly_transaction()?;
    assert_eq!(env.current_transaction().map(|t| t.id()), Some(inner.id()));

    let other = env.clone();
    let seen = thread::spawn(move || other.current_transaction().map(|t| t.id()))
        .join()
        .expect("thread panicked");
    assert_eq!(seen, None);

    inner.abort()?;
    assert_eq!(env.current_transaction().map(|t| t.id()), Some(outer.id()));
    outer.abort()?;
    assert!(env.current_transaction().is_none());
    Ok(())
}

#[test]
fn finishing_on_another_thread_is_rejected() -> Result<()> {
    let env = open_env()?;
    let txn = env.begin_transaction()?;
    let remote = txn.clone();
    let (commit, abort) = thread::spawn(move || (remote.commit(), remote.abort()))
        .join()
        .expect("thread panicked");
    assert!(matches!(commit, Err(EnvError::WrongThread)));
    assert!(matches!(abort, Err(EnvError::WrongThread)));
    assert_eq!(txn.state(), TransactionState::Active);
    txn.abort()?;
    Ok(())
}

#[test]
fn flush_publishes_and_keeps_the_transaction() -> Result<()> {
    let env = open_env()?;
    let store = create_store(&env, "s")?;
    let txn = env.begin_transaction()?;
    store.put(&txn, b"k", b"v1")?;
    assert!(txn.has_changes());
    assert!(txn.flush()?);
    assert!(!txn.has_changes());
    assert_eq!(txn.state(), TransactionState::Active);

    let other = env.clone();
    let seen = thread::spawn(move || {
        other.compute_in_readonly_transaction(|reader| store_get(&other, reader, b"k"))
    })
    .join()
    .expect("thread panicked")?;
    assert_eq!(seen.as_deref(), Some(&b"v1"[..]));

    store.put(&txn, b"k", b"v2")?;
    txn.abort()?;
    let value = env.compute_in_readonly_transaction(|reader| store.get(reader, b"k"))?;
    assert_eq!(value.as_deref(), Some(&b"v1"[..]));
    Ok(())
}

fn store_get(
    env: &Environment,
    txn: &sombra_env::Transaction,
    key: &[u8],
) -> Result<Option<bytes::Bytes>> {
    let store = env.open_store("s", StoreConfig::UseExisting, txn)?;
    store.get(txn, key)
}

#[test]
fn revert_discards_writes_and_moves_to_latest() -> Result<()> {
    let env = open_env()?;
    let store = create_store(&env, "new_store")?;
    let txn = env.begin_transaction()?;
    store.put(&txn, b"key1", b"value1")?;

    let other = env.clone();
    let parallel = store.clone();
    thread::spawn(move || {
        other.execute_in_transaction(|t| parallel.put(t, b"key2", b"value2").map(|_| ()))
    })
    .join()
    .expect("thread panicked")?;

    assert_eq!(store.get(&txn, b"key1")?.as_deref(), Some(&b"value1"[..]));
    assert_eq!(store.get(&txn, b"key2")?, None);
    txn.revert()?;
    assert_eq!(store.get(&txn, b"key1")?, None);
    assert_eq!(store.get(&txn, b"key2")?.as_deref(), Some(&b"value2"[..]));
    txn.abort()?;
    Ok(())
}

#[test]
fn created_advances_on_flush_and_revert() -> Result<()> {
    let env = open_env()?;
    let store = env.compute_in_transaction(|txn| {
        env.open_store("store", StoreConfig::WithDuplicates, txn)
    })?;
    let txn = env.begin_transaction()?;
    let started = txn.created();
    store.put(&txn, b"key", b"value")?;
    thread::sleep(Duration::from_millis(60));
    assert!(txn.flush()?);
    assert!(txn.created() >= started + 50);
    let flushed = txn.created();

    store.put(&txn, b"key", b"new value")?;
    thread::sleep(Duration::from_millis(60));
    txn.revert()?;
    assert!(txn.created() >= flushed + 50);
    assert!(!store.exists(&txn, b"key", b"new value")?);
    assert!(store.exists(&txn, b"key", b"value")?);
    txn.abort()?;
    Ok(())
}

#[test]
fn compute_reuses_the_current_transaction() -> Result<()> {
    let env = open_env()?;
    let store = create_store(&env, "s")?;
    let outer = env.begin_transaction()?;
    let inner_id = env.compute_in_transaction(|txn| {
        store.put(txn, b"k", b"v")?;
        Ok(txn.id())
    })?;
    assert_eq!(inner_id, outer.id());
    // Nothing published until the outer transaction commits.
    assert_eq!(
        env.compute_in_readonly_transaction(|reader| store.get(reader, b"k"))?,
        None
    );
    outer.commit()?;
    assert!(env
        .compute_in_readonly_transaction(|reader| store.has_key(reader, b"k"))?);
    Ok(())
}

#[test]
fn compute_aborts_when_the_closure_panics() -> Result<()> {
    let env = open_env()?;
    let store = create_store(&env, "s")?;
    let worker = env.clone();
    let handle = thread::spawn(move || {
        let _ = worker.execute_in_transaction(|txn| {
            store.put(txn, b"k", b"v")?;
            panic!("closure failed");
        });
    });
    assert!(handle.join().is_err());
    assert_eq!(env.stats().active_transactions, 0);
    assert_eq!(env.stats().aborts, 1);
    Ok(())
}

#[test]
fn safe_tasks_wait_for_all_transactions() -> Result<()> {
    let env = open_env()?;
    let log = Arc::new(Mutex::new(Vec::new()));

    let immediate = Arc::clone(&log);
    env.execute_transaction_safe_task(move || immediate.lock().unwrap().push("immediate"));
    assert_eq!(*log.lock().unwrap(), vec!["immediate"]);

    let outer = env.begin_transaction()?;
    let inner = env.begin_transaction()?;
    for name in ["first", "second", "third"] {
        let log = Arc::clone(&log);
        env.execute_transaction_safe_task(move || log.lock().unwrap().push(name));
    }
    inner.commit()?;
    assert_eq!(log.lock().unwrap().len(), 1);
    outer.abort()?;
    assert_eq!(
        *log.lock().unwrap(),
        vec!["immediate", "first", "second", "third"]
    );
    Ok(())
}

#[test]
fn safe_tasks_wait_for_other_threads() -> Result<()> {
    let env = open_env()?;
    let ran = Arc::new(AtomicUsize::new(0));
    let txn = env.begin_transaction()?;

    let other = env.clone();
    let counter = Arc::clone(&ran);
    thread::spawn(move || {
        other.execute_transaction_safe_task(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
    })
    .join()
    .expect("thread panicked");
    assert_eq!(ran.load(Ordering::SeqCst), 0);
    txn.commit()?;
    assert_eq!(ran.load(Ordering::SeqCst), 1);
    Ok(())
}
