use crate::service::QuotaHolderService;
use anyhow::{bail, Context, Result};
use quotaholder_ledger::LedgerConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Where the ledger keeps its tables
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Process-local tables, lost on exit
    Memory,

    /// A SQLite database file, created when missing
    Sqlite { path: PathBuf },
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Memory
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ControllerConfig {
    /// Age after which another worker may take over a controller row lock.
    /// `None` keeps locks until their holder releases them.
    pub lock_timeout_ms: Option<u64>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: Some(30_000),
        }
    }
}

/// Everything needed to open a quotaholder
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QuotaHolderConfig {
    pub storage: StorageConfig,
    pub ledger: LedgerConfig,
    pub controller: ControllerConfig,
}

impl QuotaHolderConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to parse quotaholder configuration")
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file {}", path.display()))?;
        Self::from_json_str(&json)
            .with_context(|| format!("Invalid configuration file {}", path.display()))
    }

    /// Build the storage backend and open the ledger on it
    pub fn open(&self) -> Result<QuotaHolderService> {
        if self.ledger.timeline_chunk == 0 {
            bail!("ledger.timeline_chunk must be positive");
        }
        match &self.storage {
            StorageConfig::Memory => QuotaHolderService::in_memory(self),
            #[cfg(feature = "sqlite")]
            StorageConfig::Sqlite { path } => QuotaHolderService::sqlite(self, path),
            #[cfg(not(feature = "sqlite"))]
            StorageConfig::Sqlite { .. } => {
                bail!("quotaholder was built without the sqlite feature")
            }
        }
    }
}
