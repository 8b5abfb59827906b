//! Sombra environment: an embedded, log-structured transactional key-value store.
//!
//! Every committed version of the database is a set of copy-on-write B-trees
//! appended to a single log and tied together by a database root record.
//! Transactions read an immutable snapshot and publish their writes
//! atomically; see [`env::Environment`] for the entry point.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod env;
pub mod primitives;
pub mod storage;
pub mod types;

pub use env::{
    ContextualEnvironment, ContextualStore, DatabaseRoot, EnvStats, Environment,
    EnvironmentConfig, Store, StoreConfig, Synchronous, Transaction, TransactionState,
};
pub use types::{EnvError, Result};
