//! Read-only environments and transactions never append to the log.

#![allow(missing_docs)]

use sombra_env::{EnvError, Environment, EnvironmentConfig, Result, StoreConfig};

fn env_with_store() -> Result<Environment> {
    let env = Environment::in_memory(EnvironmentConfig::ephemeral())?;
    env.execute_in_transaction(|txn| {
        let store = env.open_store("existing", StoreConfig::WithoutDuplicates, txn)?;
        store.put(txn, b"k", b"v").map(|_| ())
    })?;
    Ok(env)
}

fn records(env: &Environment) -> u64 {
    env.stats().log.records_appended
}

fn is_readonly_violation<T>(result: &Result<T>) -> bool {
    matches!(result, Err(EnvError::ReadonlyTransactionViolation(_)))
}

#[test]
fn readonly_transaction_rejects_store_creation() -> Result<()> {
    let env = env_with_store()?;
    let before = records(&env);
    let result = env.execute_in_readonly_transaction(|txn| {
        env.open_store("WTF", StoreConfig::WithoutDuplicates, txn)
            .map(|_| ())
    });
    assert!(is_readonly_violation(&result));
    assert_eq!(records(&env), before);
    Ok(())
}

#[test]
fn readonly_transaction_rejects_mutations() -> Result<()> {
    let env = env_with_store()?;
    let before = records(&env);
    let txn = env.begin_readonly_transaction()?;
    assert!(txn.is_readonly());
    let store = env.open_store("existing", StoreConfig::UseExisting, &txn)?;
    assert_eq!(store.get(&txn, b"k")?.as_deref(), Some(&b"v"[..]));
    assert!(is_readonly_violation(&store.put(&txn, b"k", b"x")));
    assert!(is_readonly_violation(&store.add(&txn, b"new", b"x")));
    assert!(is_readonly_violation(&store.delete(&txn, b"k")));
    assert!(is_readonly_violation(&store.delete_pair(&txn, b"k", b"v")));
    assert!(is_readonly_violation(&env.truncate_store("existing", &txn)));
    assert!(is_readonly_violation(&env.remove_store("existing", &txn)));
    assert!(!txn.has_changes());
    txn.commit()?;
    assert_eq!(records(&env), before);
    Ok(())
}

#[test]
fn readonly_environment_rejects_put_on_empty_store() -> Result<()> {
    let env = env_with_store()?;
    env.update_config(|config| {
        config.env_is_readonly = true;
        config.env_readonly_empty_stores = true;
    });
    let before = records(&env);
    let result = env.execute_in_transaction(|txn| {
        let store = env.open_store("WTF", StoreConfig::WithoutDuplicates, txn)?;
        assert!(store.is_temporary());
        assert_eq!(store.get(txn, b"WTF")?, None);
        assert_eq!(store.count(txn)?, 0);
        store.put(txn, b"WTF", b"WTF").map(|_| ())
    });
    assert!(is_readonly_violation(&result));
    assert_eq!(records(&env), before);
    Ok(())
}

#[test]
fn readonly_environment_rejects_delete_on_empty_store() -> Result<()> {
    let env = env_with_store()?;
    env.update_config(|config| {
        config.env_is_readonly = true;
        config.env_readonly_empty_stores = true;
    });
    let before = records(&env);
    let result = env.execute_in_transaction(|txn| {
        let store = env.open_store("WTF", StoreConfig::WithoutDuplicates, txn)?;
        store.delete(txn, b"WTF").map(|_| ())
    });
    assert!(is_readonly_violation(&result));
    assert_eq!(records(&env), before);
    Ok(())
}

#[test]
fn readonly_environment_without_empty_stores_rejects_missing_store() -> Result<()> {
    let env = env_with_store()?;
    env.update_config(|config| config.env_is_readonly = true);
    let result = env.execute_in_transaction(|txn| {
        env.open_store("missing", StoreConfig::WithoutDuplicates, txn)
            .map(|_| ())
    });
    assert!(is_readonly_violation(&result));

    // Existing stores stay readable.
    let value = env.compute_in_transaction(|txn| {
        let store = env.open_store("existing", StoreConfig::UseExisting, txn)?;
        store.get(txn, b"k")
    })?;
    assert_eq!(value.as_deref(), Some(&b"v"[..]));
    Ok(())
}

#[test]
fn writes_resume_after_leaving_readonly_mode() -> Result<()> {
    let env = env_with_store()?;
    env.update_config(|config| config.env_is_readonly = true);
    assert!(env.is_readonly());
    env.update_config(|config| config.env_is_readonly = false);
    let before = records(&env);
    env.execute_in_transaction(|txn| {
        let store = env.open_store("existing", StoreConfig::UseExisting, txn)?;
        store.put(txn, b"k", b"v2").map(|_| ())
    })?;
    assert!(records(&env) > before);
    Ok(())
}
