//! Tablet configuration
//!
//! A [`TabletConfig`] can be built in code, loaded from a TOML file with
//! [`TabletConfig::from_file`], or left at its defaults. Call
//! [`TabletConfig::validate`] before booting a tablet with it.

pub mod defaults;

use crate::error::{Result, TabletError};
use crate::storage::{FileTxStore, InMemoryTxStore, TxStore};
use crate::types::TabletId;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use defaults::{
    DEFAULT_DATA_DIR, DEFAULT_LOG_LEVEL, DEFAULT_MAX_IN_FLIGHT_TXS,
    DEFAULT_PRODUCER_TXN_DELETE_DELAY_MS, DEFAULT_PRODUCER_TXN_TIMEOUT_MS,
    DEFAULT_SUPPORTIVE_PARTITION_BASE, DEFAULT_WAKEUP_INTERVAL_MS,
};

/// Where transaction records are kept
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    /// Process memory, lost on exit
    Memory,
    /// Append-only batch log under `data_dir`
    File,
}

impl Default for StorageBackend {
    fn default() -> Self {
        StorageBackend::File
    }
}

/// Expiry settings for supportive partitions of producer transactions
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProducerTxnConfig {
    /// Producer transaction timeout (default: 15 minutes)
    pub timeout_ms: i64,

    /// Fixed grace delay added to the timeout before reaping (default: 1 hour)
    ///
    /// A supportive partition of a producer transaction is removed once its
    /// age, measured from creation, exceeds `timeout_ms + delete_delay_ms`.
    /// Later writes under the same producer do not extend it.
    pub delete_delay_ms: i64,
}

impl Default for ProducerTxnConfig {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_PRODUCER_TXN_TIMEOUT_MS,
            delete_delay_ms: DEFAULT_PRODUCER_TXN_DELETE_DELAY_MS,
        }
    }
}

impl ProducerTxnConfig {
    /// Age after which an unbound producer-transaction record is reaped
    pub fn expiry_ms(&self) -> i64 {
        self.timeout_ms.saturating_add(self.delete_delay_ms)
    }
}

/// Runtime configuration for one tablet
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TabletConfig {
    /// Identity of this tablet
    pub tablet_id: TabletId,

    /// Directory holding the transaction store when `storage` is `file`
    pub data_dir: PathBuf,

    /// Storage backend for transaction records
    pub storage: StorageBackend,

    /// Hard cap on transactions that are proposed and not yet deleted
    /// (default: 1000)
    ///
    /// A proposal arriving at the cap is answered OVERLOADED and nothing is
    /// persisted for it.
    pub max_in_flight_txs: usize,

    /// Interval between periodic wake-ups that run the supportive partition
    /// reaper (default: 5s)
    pub wakeup_interval_ms: u64,

    /// Producer transaction expiry
    pub producer_txn: ProducerTxnConfig,

    /// First id handed out to supportive partitions (default: 100000)
    ///
    /// Must be above every regular partition id of the topic.
    pub supportive_partition_base: u32,

    /// Log filter used by binaries
    pub log_level: String,
}

impl Default for TabletConfig {
    fn default() -> Self {
        Self {
            tablet_id: 1,
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            storage: StorageBackend::default(),
            max_in_flight_txs: DEFAULT_MAX_IN_FLIGHT_TXS,
            wakeup_interval_ms: DEFAULT_WAKEUP_INTERVAL_MS,
            producer_txn: ProducerTxnConfig::default(),
            supportive_partition_base: DEFAULT_SUPPORTIVE_PARTITION_BASE,
            log_level: DEFAULT_LOG_LEVEL.to_string(),
        }
    }
}

impl TabletConfig {
    /// In-memory configuration for the given tablet
    pub fn in_memory(tablet_id: TabletId) -> Self {
        Self {
            tablet_id,
            storage: StorageBackend::Memory,
            ..Self::default()
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            TabletError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: TabletConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_in_flight_txs == 0 {
            return Err(TabletError::Config(
                "max_in_flight_txs must be greater than 0".to_string(),
            ));
        }

        if self.wakeup_interval_ms == 0 {
            return Err(TabletError::Config(
                "wakeup_interval_ms must be greater than 0".to_string(),
            ));
        }

        if self.producer_txn.timeout_ms < 0 || self.producer_txn.delete_delay_ms < 0 {
            return Err(TabletError::Config(
                "producer_txn timeouts must not be negative".to_string(),
            ));
        }

        if self.storage == StorageBackend::File && self.data_dir.as_os_str().is_empty() {
            return Err(TabletError::Config(
                "data_dir is required for the file storage backend".to_string(),
            ));
        }

        Ok(())
    }

    pub fn wakeup_interval(&self) -> Duration {
        Duration::from_millis(self.wakeup_interval_ms)
    }

    /// Directory of this tablet's transaction store
    pub fn store_dir(&self) -> PathBuf {
        self.data_dir.join(format!("tablet-{}", self.tablet_id))
    }

    /// Open the configured transaction store
    pub fn open_store(&self) -> Result<Arc<dyn TxStore>> {
        match self.storage {
            StorageBackend::Memory => Ok(Arc::new(InMemoryTxStore::new())),
            StorageBackend::File => Ok(Arc::new(FileTxStore::open(&self.store_dir())?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TabletConfig::default();
        assert_eq!(config.max_in_flight_txs, 1000);
        assert_eq!(config.supportive_partition_base, 100_000);
        assert_eq!(config.producer_txn.expiry_ms(), 900_000 + 3_600_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml_partial() {
        let config = TabletConfig::from_toml(
            r#"
            tablet_id = 72075186224037888
            storage = "memory"
            max_in_flight_txs = 10

            [producer_txn]
            timeout_ms = 1000
            "#,
        )
        .unwrap();

        assert_eq!(config.tablet_id, 72075186224037888);
        assert_eq!(config.storage, StorageBackend::Memory);
        assert_eq!(config.max_in_flight_txs, 10);
        assert_eq!(config.producer_txn.timeout_ms, 1000);
        assert_eq!(
            config.producer_txn.delete_delay_ms,
            DEFAULT_PRODUCER_TXN_DELETE_DELAY_MS
        );
    }

    #[test]
    fn test_validate_rejects_zero_cap() {
        let config = TabletConfig {
            max_in_flight_txs: 0,
            ..TabletConfig::default()
        };
        assert!(matches!(config.validate(), Err(TabletError::Config(_))));
    }

    #[test]
    fn test_from_toml_rejects_garbage() {
        let err = TabletConfig::from_toml("tablet_id = \"abc\"").unwrap_err();
        assert!(matches!(err, TabletError::ConfigParse(_)));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tablet.toml");
        std::fs::write(&path, "tablet_id = 5\nwakeup_interval_ms = 250\n").unwrap();

        let config = TabletConfig::from_file(&path).unwrap();
        assert_eq!(config.tablet_id, 5);
        assert_eq!(config.wakeup_interval(), Duration::from_millis(250));
        assert!(config.store_dir().ends_with("tablet-5"));
    }
}
