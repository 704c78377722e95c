// Engine Configuration
//
// Where the ledger lives and how patient the engine is with it and with
// drivers. Loaded from JSON; every field has a default.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ledger::{FileLedger, LedgerBackend, LedgerError, LogLedger};
use crate::log::FileLog;

/// Reserved name of the log holding topic migration history.
pub const MIGRATION_LOG_NAME: &str = "_topic_migrations";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

fn default_log_name() -> String {
    MIGRATION_LOG_NAME.to_owned()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum LedgerConfig {
    /// One JSON file per resource under `path`. Single writer only.
    File { path: PathBuf },

    /// Shared migration log `<dir>/<name>.log`.
    Log {
        dir: PathBuf,
        #[serde(default = "default_log_name")]
        name: String,
    },
}

impl LedgerConfig {
    pub fn open(&self, read_batch_size: usize) -> Result<Arc<dyn LedgerBackend>, LedgerError> {
        let ledger: Arc<dyn LedgerBackend> = match self {
            LedgerConfig::File { path } => Arc::new(FileLedger::open(path)?),
            LedgerConfig::Log { dir, name } => {
                let log = FileLog::open(dir, name.clone())?;
                Arc::new(LogLedger::with_batch_size(log, read_batch_size))
            }
        };
        Ok(ledger)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub ledger: LedgerConfig,

    /// Audit identity written into every record. Defaults to
    /// `$USER@<run id>`.
    pub applied_by: Option<String>,

    pub driver_timeout_ms: u64,
    pub ledger_timeout_ms: u64,

    /// Replans allowed per key after losing a commit race.
    pub max_conflict_retries: u32,

    /// Resource keys migrated at the same time.
    pub concurrency: usize,

    /// Entries read per request while catching up on the log.
    pub read_batch_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl EngineConfig {
    /// Built-in configuration (used if no config file is given).
    pub fn default_config() -> Self {
        Self {
            ledger: LedgerConfig::Log {
                dir: PathBuf::from(".kmigrate"),
                name: default_log_name(),
            },
            applied_by: None,
            driver_timeout_ms: 120_000,
            ledger_timeout_ms: 30_000,
            max_conflict_retries: 5,
            concurrency: 4,
            read_batch_size: 500,
        }
    }

    pub fn from_json(data: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&data)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.driver_timeout_ms == 0 || self.ledger_timeout_ms == 0 {
            return Err(ConfigError::Invalid("timeouts must be positive".into()));
        }
        if self.concurrency == 0 {
            return Err(ConfigError::Invalid("concurrency must be at least 1".into()));
        }
        if self.read_batch_size == 0 {
            return Err(ConfigError::Invalid("read_batch_size must be at least 1".into()));
        }
        Ok(())
    }

    pub fn driver_timeout(&self) -> Duration {
        Duration::from_millis(self.driver_timeout_ms)
    }

    pub fn ledger_timeout(&self) -> Duration {
        Duration::from_millis(self.ledger_timeout_ms)
    }

    pub fn applied_by(&self, run_id: Uuid) -> String {
        match &self.applied_by {
            Some(identity) => identity.clone(),
            None => {
                let user = std::env::var("USER").unwrap_or_else(|_| "unknown".into());
                format!("{user}@{run_id}")
            }
        }
    }

    pub fn open_ledger(&self) -> Result<Arc<dyn LedgerBackend>, LedgerError> {
        self.ledger.open(self.read_batch_size)
    }
}
