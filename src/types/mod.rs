#![forbid(unsafe_code)]

//! Identifiers, the crate error type and checksum helpers shared by every layer.

use std::fmt;

mod checksum;

pub use checksum::{crc32_of, Checksum, Crc32Fast};

/// Byte offset of a record inside the log.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct Address(pub u64);

/// Stable identity of a store's tree across all of its versions.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct StructureId(pub u64);

/// Identifier handed out to every transaction for registry bookkeeping.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct TxnId(pub u64);

impl StructureId {
    /// Structure id reserved for the tree that maps store names to metadata.
    pub const META: StructureId = StructureId(1);
    /// First structure id handed to user stores.
    pub const FIRST_USER: StructureId = StructureId(2);
    /// Placeholder id used by temporary empty stores in read-only environments.
    pub const TEMPORARY: StructureId = StructureId(0);
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Display for StructureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors surfaced by the log, the trees and the transaction layer.
#[derive(thiserror::Error, Debug)]
pub enum EnvError {
    /// Underlying file I/O failed.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// A log record is unreadable, out of range or fails its checksum.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// A caller supplied an argument the operation cannot accept.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// Same as [`EnvError::Invalid`] with a formatted message.
    #[error("invalid argument: {0}")]
    InvalidOwned(String),
    /// `commit` or `abort` was called on a transaction that already finished.
    #[error("transaction already finished")]
    TransactionAlreadyFinished,
    /// An outer transaction was finished while a nested one is still active.
    #[error("can't finish transaction: nested transaction is not finished")]
    NestedTransactionNotFinished,
    /// A transaction was finished on a thread other than the one that began it.
    #[error("can't finish transaction in a thread different from the one which it was created in")]
    WrongThread,
    /// Another transaction committed a write to the same store first.
    #[error("transaction conflict on store {structure_id}")]
    TransactionConflict {
        /// Store whose root moved since the snapshot was taken.
        structure_id: StructureId,
    },
    /// A mutation was attempted under a read-only environment or transaction.
    #[error("read-only transaction violation: {0}")]
    ReadonlyTransactionViolation(&'static str),
    /// `open_store` with `StoreConfig::UseExisting` named a missing store.
    #[error("store not found: {0}")]
    StoreNotFound(String),
    /// A contextual call ran on a thread without an active transaction.
    #[error("no transaction started in current thread")]
    NoCurrentTransaction,
    /// The environment was closed.
    #[error("environment is closed")]
    EnvironmentClosed,
}

impl EnvError {
    /// Returns `true` for errors a caller is expected to retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EnvError::TransactionConflict { .. })
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, EnvError>;
