use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Top-level Membank configuration, matching `.membank/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemBankConfig {
    #[serde(default)]
    pub database: DatabaseSection,
    #[serde(default)]
    pub connection: ConnectionSection,
    #[serde(default)]
    pub retry: RetrySection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSection {
    /// Directory under the project root holding the embedded database.
    pub directory: String,
    /// Database file name inside [`DatabaseSection::directory`].
    pub file_name: String,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            directory: ".membank".to_string(),
            file_name: "memory.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSection {
    /// Connections older than this are stale regardless of probe result.
    pub max_age_secs: u64,
    /// Minimum interval between liveness probes; inside it the cached
    /// validity flag is returned.
    pub probe_interval_secs: u64,
    /// A leftover lock artifact older than this is removed before open.
    pub stale_lock_secs: u64,
}

impl Default for ConnectionSection {
    fn default() -> Self {
        Self {
            max_age_secs: 3600,
            probe_interval_secs: 30,
            stale_lock_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySection {
    /// Maximum attempts for `transaction_with_retry`.
    pub max_retries: u32,
    /// Fixed delay between attempts, in milliseconds.
    pub delay_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retries: 3,
            delay_ms: 200,
        }
    }
}

impl MemBankConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|_| ConfigError::NotFound(path.display().to_string()))?;
        toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Load `.membank/config.toml` under `root`, falling back to defaults
    /// when the file does not exist.
    pub fn load_or_default(root: &Path) -> Result<Self, ConfigError> {
        let path = root.join(".membank").join("config.toml");
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Resolve the database file path for a project root.
    pub fn db_path(&self, root: &Path) -> PathBuf {
        root.join(&self.database.directory).join(&self.database.file_name)
    }

    /// Connection max age as a [`Duration`].
    pub fn max_connection_age(&self) -> Duration {
        Duration::from_secs(self.connection.max_age_secs)
    }

    /// Probe interval as a [`Duration`].
    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.connection.probe_interval_secs)
    }

    /// Stale lock threshold as a [`Duration`].
    pub fn stale_lock_age(&self) -> Duration {
        Duration::from_secs(self.connection.stale_lock_secs)
    }

    /// Retry delay as a [`Duration`].
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry.delay_ms)
    }
}
