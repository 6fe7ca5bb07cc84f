//! Configuration for the wallet ledger

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory for RocksDB; `None` keeps the ledger in memory
    pub data_dir: Option<PathBuf>,

    /// Service name
    pub service_name: String,

    /// Writer mailbox capacity (messages)
    pub mailbox_capacity: usize,

    /// Sync the write-ahead log on every write
    pub sync_writes: bool,

    /// RocksDB configuration
    pub rocksdb: RocksDBConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: None,
            service_name: "wallet-ledger".to_string(),
            mailbox_capacity: 1024,
            sync_writes: true,
            rocksdb: RocksDBConfig::default(),
        }
    }
}

/// RocksDB configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RocksDBConfig {
    /// Write buffer size (MB)
    pub write_buffer_size_mb: usize,

    /// Max write buffers
    pub max_write_buffer_number: i32,

    /// Target file size (MB)
    pub target_file_size_mb: u64,

    /// Max background jobs (compaction + flush)
    pub max_background_jobs: i32,

    /// Level 0 file num compaction trigger
    pub level0_file_num_compaction_trigger: i32,

    /// Enable statistics
    pub enable_statistics: bool,
}

impl Default for RocksDBConfig {
    fn default() -> Self {
        Self {
            write_buffer_size_mb: 64,
            max_write_buffer_number: 4,
            target_file_size_mb: 64,
            max_background_jobs: 2,
            level0_file_num_compaction_trigger: 4,
            enable_statistics: false,
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Override fields from `WALLET_*` environment variables
    pub fn apply_env(&mut self) -> crate::Result<()> {
        if let Ok(data_dir) = std::env::var("WALLET_DATA_DIR") {
            self.data_dir = Some(PathBuf::from(data_dir));
        }

        if let Ok(capacity) = std::env::var("WALLET_MAILBOX_CAPACITY") {
            self.mailbox_capacity = capacity.parse().map_err(|e| {
                crate::Error::Config(format!("Invalid WALLET_MAILBOX_CAPACITY: {}", e))
            })?;
        }

        if let Ok(sync) = std::env::var("WALLET_SYNC_WRITES") {
            self.sync_writes = matches!(sync.as_str(), "1" | "true");
        }

        Ok(())
    }
}
