//! Configuration for the bank

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Bank configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Data directory for RocksDB
    pub data_dir: PathBuf,

    /// Service name
    pub service_name: String,

    /// RocksDB configuration
    #[serde(default)]
    pub rocksdb: RocksDBConfig,

    /// Transaction configuration
    #[serde(default)]
    pub transactions: TransactionConfig,

    /// Export outbox configuration
    #[serde(default)]
    pub outbox: OutboxConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/bank"),
            service_name: "bank-core".to_string(),
            rocksdb: RocksDBConfig::default(),
            transactions: TransactionConfig::default(),
            outbox: OutboxConfig::default(),
        }
    }
}

/// RocksDB configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RocksDBConfig {
    /// Write buffer size (MB)
    pub write_buffer_size_mb: usize,

    /// Max background jobs (compaction + flush)
    pub max_background_jobs: i32,

    /// Enable statistics
    pub enable_statistics: bool,
}

impl Default for RocksDBConfig {
    fn default() -> Self {
        Self {
            write_buffer_size_mb: 64,
            max_background_jobs: 2,
            enable_statistics: false,
        }
    }
}

/// Transaction configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionConfig {
    /// How long a transaction waits for a row lock (milliseconds)
    pub lock_timeout_ms: i64,

    /// Attempts before lock contention surfaces as an error
    pub max_retries: u32,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 1_000,
            max_retries: 5,
        }
    }
}

/// Export outbox configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
    /// Consumer group the export coordinator reads with
    pub consumer_group: String,

    /// Name of this process within the group
    pub consumer_name: String,

    /// Longest a single read blocks waiting for a record (milliseconds)
    pub block_timeout_ms: u64,

    /// Pending entries idle this long may be claimed by another reader
    /// (milliseconds)
    pub claim_idle_ms: u64,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            consumer_group: "bank.exports".to_string(),
            consumer_name: default_consumer_name(),
            block_timeout_ms: 1_000,
            claim_idle_ms: 30_000,
        }
    }
}

impl OutboxConfig {
    /// Block timeout as a Duration
    pub fn block_timeout(&self) -> Duration {
        Duration::from_millis(self.block_timeout_ms)
    }

    /// Claim idle threshold as a Duration
    pub fn claim_idle(&self) -> Duration {
        Duration::from_millis(self.claim_idle_ms)
    }
}

fn default_consumer_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Override fields from `BANK_*` environment variables
    pub fn apply_env(&mut self) {
        if let Ok(data_dir) = std::env::var("BANK_DATA_DIR") {
            self.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(group) = std::env::var("BANK_CONSUMER_GROUP") {
            self.outbox.consumer_group = group;
        }

        if let Ok(name) = std::env::var("BANK_CONSUMER_NAME") {
            self.outbox.consumer_name = name;
        }
    }

    /// Reject settings the bank cannot run with
    pub fn validate(&self) -> crate::Result<()> {
        if self.outbox.consumer_group.is_empty() {
            return Err(crate::Error::Config("outbox.consumer_group is empty".into()));
        }
        if self.outbox.consumer_group.contains('\0') {
            return Err(crate::Error::Config(
                "outbox.consumer_group may not contain NUL".into(),
            ));
        }
        if self.outbox.consumer_name.is_empty() {
            return Err(crate::Error::Config("outbox.consumer_name is empty".into()));
        }
        if self.outbox.block_timeout_ms == 0 {
            return Err(crate::Error::Config("outbox.block_timeout_ms must be > 0".into()));
        }
        if self.outbox.claim_idle_ms == 0 {
            return Err(crate::Error::Config("outbox.claim_idle_ms must be > 0".into()));
        }
        if self.outbox.claim_idle_ms > i64::MAX as u64 {
            return Err(crate::Error::Config(format!(
                "outbox.claim_idle_ms must be <= {}",
                i64::MAX
            )));
        }
        if self.transactions.max_retries == 0 {
            return Err(crate::Error::Config("transactions.max_retries must be > 0".into()));
        }
        Ok(())
    }
}
