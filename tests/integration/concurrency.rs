//! Snapshot isolation and per-store write conflicts across threads.

#![allow(missing_docs)]

use std::sync::{Arc, Barrier};
use std::thread;

use sombra_env::{EnvError, Environment, EnvironmentConfig, Result, Store, StoreConfig};

fn open_env() -> Result<Environment> {
    Environment::in_memory(EnvironmentConfig::ephemeral())
}

fn create_stores(env: &Environment, names: &[&str]) -> Result<Vec<Store>> {
    env.compute_in_transaction(|txn| {
        names
            .iter()
            .map(|name| env.open_store(name, StoreConfig::WithoutDuplicates, txn))
            .collect()
    })
}

#[test]
fn readers_keep_their_snapshot() -> Result<()> {
    let env = open_env()?;
    let store = create_stores(&env, &["s"])?.remove(0);
    env.execute_in_transaction(|txn| store.put(txn, b"k", b"old").map(|_| ()))?;

    let reader = env.begin_readonly_transaction()?;
    let writer_env = env.clone();
    let writer_store = store.clone();
    thread::spawn(move || {
        writer_env.execute_in_transaction(|txn| {
            writer_store.put(txn, b"k", b"new")?;
            writer_store.put(txn, b"k2", b"added")?;
            Ok(())
        })
    })
    .join()
    .expect("writer panicked")?;

    assert_eq!(store.get(&reader, b"k")?.as_deref(), Some(&b"old"[..]));
    assert!(!store.has_key(&reader, b"k2")?);
    assert_eq!(store.count(&reader)?, 1);
    reader.abort()?;

    let latest = env.begin_readonly_transaction()?;
    assert_eq!(store.get(&latest, b"k")?.as_deref(), Some(&b"new"[..]));
    assert_eq!(store.count(&latest)?, 2);
    latest.abort()?;
    Ok(())
}

#[test]
fn writers_to_the_same_store_conflict() -> Result<()> {
    let env = open_env()?;
    let store = create_stores(&env, &["shared"])?.remove(0);
    let first = env.begin_transaction()?;
    store.put(&first, b"k", b"first")?;

    let other_env = env.clone();
    let other_store = store.clone();
    thread::spawn(move || -> Result<()> {
        let second = other_env.begin_transaction()?;
        other_store.put(&second, b"k", b"second")?;
        second.commit()
    })
    .join()
    .expect("writer panicked")?;

    let before = env.stats().log.records_appended;
    let err = first.commit().unwrap_err();
    assert!(matches!(
        err,
        EnvError::TransactionConflict { structure_id } if structure_id == store.structure_id()
    ));
    assert!(err.is_retryable());
    assert_eq!(env.stats().log.records_appended, before);
    assert_eq!(env.stats().conflicts, 1);

    // The loser is still active and keeps its write until reverted.
    assert_eq!(store.get(&first, b"k")?.as_deref(), Some(&b"first"[..]));
    assert!(!first.flush()?);
    first.revert()?;
    assert_eq!(store.get(&first, b"k")?.as_deref(), Some(&b"second"[..]));
    store.put(&first, b"k", b"third")?;
    first.commit()?;
    Ok(())
}

#[test]
fn writers_to_different_stores_both_commit() -> Result<()> {
    let env = open_env()?;
    let stores = create_stores(&env, &["left", "right"])?;
    let barrier = Arc::new(Barrier::new(2));

    let handles: Vec<_> = stores
        .iter()
        .cloned()
        .map(|store| {
            let env = env.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || -> Result<()> {
                let txn = env.begin_transaction()?;
                for i in 0u32..50 {
                    store.put(&txn, &i.to_be_bytes(), store.name().as_bytes())?;
                }
                // Both snapshots predate both commits.
                barrier.wait();
                txn.commit()
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("writer panicked")?;
    }

    env.execute_in_readonly_transaction(|txn| {
        for store in &stores {
            assert_eq!(store.count(txn)?, 50);
            assert_eq!(
                store.get(txn, &9u32.to_be_bytes())?.as_deref(),
                Some(store.name().as_bytes())
            );
        }
        Ok(())
    })?;
    assert_eq!(env.stats().conflicts, 0);
    Ok(())
}

#[test]
fn concurrent_store_creation_conflicts_on_the_catalog() -> Result<()> {
    let env = open_env()?;
    let first = env.begin_transaction()?;
    env.open_store("a", StoreConfig::WithoutDuplicates, &first)?;

    let other = env.clone();
    thread::spawn(move || {
        other.execute_in_transaction(|txn| {
            other
                .open_store("b", StoreConfig::WithoutDuplicates, txn)
                .map(|_| ())
        })
    })
    .join()
    .expect("writer panicked")?;

    assert!(matches!(
        first.commit(),
        Err(EnvError::TransactionConflict { .. })
    ));
    first.abort()?;
    let names = env.compute_in_readonly_transaction(|txn| env.get_all_store_names(txn))?;
    assert_eq!(names, vec!["b"]);
    Ok(())
}

#[test]
fn retrying_counters_never_lose_increments() -> Result<()> {
    const THREADS: usize = 4;
    const ROUNDS: u64 = 25;

    let env = open_env()?;
    let store = create_stores(&env, &["counter"])?.remove(0);
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let env = env.clone();
            let store = store.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || -> Result<()> {
                barrier.wait();
                for _ in 0..ROUNDS {
                    env.execute_in_transaction(|txn| {
                        let current = match store.get(txn, b"n")? {
                            Some(raw) => u64::from_be_bytes(
                                raw[..].try_into().map_err(|_| EnvError::Invalid("counter"))?,
                            ),
                            None => 0,
                        };
                        store.put(txn, b"n", &(current + 1).to_be_bytes())?;
                        Ok(())
                    })?;
                }
                Ok(())
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("worker panicked")?;
    }

    let total = env.compute_in_readonly_transaction(|txn| store.get(txn, b"n"))?;
    let total = total.map(|raw| u64::from_be_bytes(raw[..].try_into().unwrap()));
    assert_eq!(total, Some(THREADS as u64 * ROUNDS));
    Ok(())
}
