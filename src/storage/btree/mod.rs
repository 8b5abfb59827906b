#![forbid(unsafe_code)]

//! Copy-on-write B-trees stored as records in the log.

mod cache;
mod cursor;
mod mutable;
mod page;
mod policy;
mod stats;
mod tree;

pub use cursor::{ChunkSource, Cursor, Seek};
pub use mutable::BTreeMutable;
pub use page::Entry;
pub use policy::BalancePolicy;
pub use stats::{BTreeStats, BTreeStatsSnapshot};
pub use tree::{BTree, TreeContext};
