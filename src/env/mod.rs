//! Transactions, stores and the environment that ties them to one log.
//!
//! An [`Environment`] publishes versions of the database as
//! [`DatabaseRoot`] records. A [`Transaction`] reads one such version and
//! buffers its writes in copy-on-write trees until `commit` or `flush`
//! validates them against the latest version and appends a new root.

mod config;
mod contextual;
mod environment;
mod meta;
mod registry;
mod root;
mod store;
mod transaction;

pub use config::{EnvironmentConfig, StoreConfig, Synchronous};
pub use contextual::{ContextualEnvironment, ContextualStore};
pub use environment::{EnvStats, Environment};
pub use meta::TreeMetaInfo;
pub use root::DatabaseRoot;
pub use store::{Store, StoreCursorSource};
pub use transaction::{Transaction, TransactionState};
