use serde::{Deserialize, Serialize};

use crate::storage::btree::BalancePolicy;

/// Durability mode for database root records.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Synchronous {
    /// Sync the log after every published database root (most durable).
    #[default]
    Full,
    /// Leave syncing to [`Environment::sync`](super::Environment::sync) and close.
    Normal,
    /// Never sync (fastest, for tests and bulk loads).
    Off,
}

impl Synchronous {
    /// Returns the string representation of the synchronous mode.
    pub fn as_str(self) -> &'static str {
        match self {
            Synchronous::Full => "full",
            Synchronous::Normal => "normal",
            Synchronous::Off => "off",
        }
    }

    /// Parses a synchronous mode from a string (case-insensitive).
    pub fn from_str(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "full" => Some(Synchronous::Full),
            "normal" => Some(Synchronous::Normal),
            "off" => Some(Synchronous::Off),
            _ => None,
        }
    }
}

/// Environment settings.
///
/// `env_is_readonly`, `env_readonly_empty_stores` and `synchronous` may be
/// changed at runtime with [`Environment::update_config`](super::Environment::update_config);
/// the tree and log settings are read once at open.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentConfig {
    /// Reject every mutation and store creation.
    pub env_is_readonly: bool,
    /// In read-only mode, open missing stores as temporary empty stores.
    pub env_readonly_empty_stores: bool,
    /// When published roots are synced to disk.
    pub synchronous: Synchronous,
    /// Maximum entries per tree page.
    pub tree_max_page_entries: usize,
    /// Maximum encoded bytes per tree page.
    pub tree_max_page_bytes: usize,
    /// Number of decoded pages kept in memory.
    pub page_cache_size: usize,
    /// Salt written into a new log.
    pub log_salt: u64,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        let policy = BalancePolicy::default();
        Self {
            env_is_readonly: false,
            env_readonly_empty_stores: false,
            synchronous: Synchronous::Full,
            tree_max_page_entries: policy.max_page_entries,
            tree_max_page_bytes: policy.max_page_bytes,
            page_cache_size: 4096,
            log_salt: 0x534f_4d4c_0000_0001,
        }
    }
}

impl EnvironmentConfig {
    /// Settings for throwaway environments: no syncing, small cache.
    pub fn ephemeral() -> Self {
        Self {
            synchronous: Synchronous::Off,
            page_cache_size: 512,
            ..Self::default()
        }
    }

    /// Sets the read-only flag.
    pub fn readonly(mut self, readonly: bool) -> Self {
        self.env_is_readonly = readonly;
        self
    }

    /// Sets the read-only empty stores flag.
    pub fn readonly_empty_stores(mut self, enabled: bool) -> Self {
        self.env_readonly_empty_stores = enabled;
        self
    }

    /// Sets the durability mode.
    pub fn synchronous(mut self, synchronous: Synchronous) -> Self {
        self.synchronous = synchronous;
        self
    }

    /// Sets the page split bounds.
    pub fn balance(mut self, policy: BalancePolicy) -> Self {
        self.tree_max_page_entries = policy.max_page_entries;
        self.tree_max_page_bytes = policy.max_page_bytes;
        self
    }

    /// Sets the decoded page cache capacity.
    pub fn page_cache_size(mut self, pages: usize) -> Self {
        self.page_cache_size = pages;
        self
    }

    /// Sets the salt for a newly created log.
    pub fn log_salt(mut self, salt: u64) -> Self {
        self.log_salt = salt;
        self
    }

    /// Balance policy built from the tree settings.
    pub fn balance_policy(&self) -> BalancePolicy {
        BalancePolicy::new(self.tree_max_page_entries, self.tree_max_page_bytes)
    }
}

/// How [`Environment::open_store`](super::Environment::open_store) treats a name.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum StoreConfig {
    /// Unique keys; created if missing.
    WithoutDuplicates,
    /// Several values per key; created if missing.
    WithDuplicates,
    /// Open an existing store with whatever settings it was created with.
    UseExisting,
}

impl StoreConfig {
    /// Duplicate setting demanded by this config, `None` for `UseExisting`.
    pub fn duplicates(self) -> Option<bool> {
        match self {
            StoreConfig::WithoutDuplicates => Some(false),
            StoreConfig::WithDuplicates => Some(true),
            StoreConfig::UseExisting => None,
        }
    }
}
