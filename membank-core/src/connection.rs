//! Connection lifecycle management.
//!
//! One [`ConnectionManager`] owns the single connection handle for a
//! project root. Initialization is idempotent and serialized process-wide;
//! health checks combine an age cutoff with a time-boxed liveness probe;
//! close and reset never fail on native cleanup.

use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant, SystemTime};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, warn};

use crate::config::MemBankConfig;
use crate::engine::{Connection, Database};
use crate::error::{ConnectionError, Result};

/// Serializes the filesystem-touching critical section of initialization
/// (directory check, stale-lock cleanup, open, connect, probe) across all
/// managers in the process, so no two roots race on filesystem side effects.
static INIT_LOCK: LazyLock<AsyncMutex<()>> = LazyLock::new(|| AsyncMutex::new(()));

/// Tunable connection health thresholds.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Connections older than this are stale regardless of probe result.
    pub max_age: Duration,
    /// Minimum interval between liveness probes.
    pub probe_interval: Duration,
    /// Lock artifacts older than this are removed before open.
    pub stale_lock_age: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self::from_config(&MemBankConfig::default())
    }
}

impl ConnectionSettings {
    /// Thresholds from the `[connection]` config section.
    pub fn from_config(config: &MemBankConfig) -> Self {
        Self {
            max_age: config.max_connection_age(),
            probe_interval: config.probe_interval(),
            stale_lock_age: config.stale_lock_age(),
        }
    }
}

#[derive(Debug, Default)]
struct ConnectionState {
    live: Option<LiveConnection>,
}

#[derive(Debug)]
struct LiveConnection {
    #[allow(dead_code)] // held so the opened database outlives its connection
    database: Database,
    connection: Connection,
    created_at: Instant,
    last_probe: Instant,
    valid: bool,
}

/// Owns the one connection handle for a project root.
#[derive(Debug)]
pub struct ConnectionManager {
    root: PathBuf,
    db_path: PathBuf,
    settings: ConnectionSettings,
    state: Arc<AsyncMutex<ConnectionState>>,
}

impl ConnectionManager {
    pub fn new(root: PathBuf, db_path: PathBuf, settings: ConnectionSettings) -> Self {
        Self {
            root,
            db_path,
            settings,
            state: Arc::new(AsyncMutex::new(ConnectionState::default())),
        }
    }

    /// Project root this manager serves.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the embedded database file.
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self.db_path.as_os_str().to_os_string();
        name.push(".lock");
        PathBuf::from(name)
    }

    /// Open the database and establish the connection.
    ///
    /// Idempotent: a manager that already holds a live connection returns
    /// immediately. The critical section runs under the process-wide
    /// initialization lock.
    pub async fn initialize(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.live.is_some() {
            return Ok(());
        }
        let _init = INIT_LOCK.lock().await;

        let dir = self
            .db_path
            .parent()
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        std::fs::create_dir_all(&dir).map_err(|source| ConnectionError::DirectoryAccess {
            path: dir.clone(),
            source,
        })?;

        self.clear_stale_lock();

        let database =
            Database::open(&self.db_path).map_err(|source| ConnectionError::Open {
                path: self.db_path.clone(),
                source,
            })?;
        let connection = database.connect().map_err(|source| ConnectionError::Connect {
            path: self.db_path.clone(),
            source,
        })?;

        // Liveness probe before the handle is published.
        connection
            .query("SELECT 1")
            .map_err(|err| ConnectionError::ValidationFailed(err.to_string()))?;

        self.write_lock_marker();

        let now = Instant::now();
        state.live = Some(LiveConnection {
            database,
            connection,
            created_at: now,
            last_probe: now,
            valid: true,
        });
        debug!(root = %self.root.display(), "connection initialized");
        Ok(())
    }

    /// Remove a leftover lock artifact from an ungraceful shutdown if it is
    /// older than the configured threshold.
    fn clear_stale_lock(&self) {
        let lock_path = self.lock_path();
        let Ok(metadata) = std::fs::metadata(&lock_path) else {
            return;
        };
        let age = metadata
            .modified()
            .ok()
            .and_then(|mtime| SystemTime::now().duration_since(mtime).ok());
        if age.is_some_and(|age| age >= self.settings.stale_lock_age) {
            warn!(path = %lock_path.display(), "removing stale database lock artifact");
            if let Err(err) = std::fs::remove_file(&lock_path) {
                warn!(path = %lock_path.display(), %err, "failed to remove stale lock");
            }
        }
    }

    /// Advisory lock marker; removed on graceful close.
    fn write_lock_marker(&self) {
        if let Err(err) = std::fs::write(self.lock_path(), std::process::id().to_string()) {
            warn!(path = %self.lock_path().display(), %err, "failed to write lock marker");
        }
    }

    /// Whether a live, last-known-valid connection exists.
    pub async fn is_connected(&self) -> bool {
        let state = self.state.lock().await;
        state.live.as_ref().is_some_and(|live| live.valid)
    }

    /// Health-check the connection.
    ///
    /// Age beyond `max_age` is stale regardless of probe result. Within the
    /// probe interval the cached validity flag is returned; otherwise a
    /// lightweight liveness query is re-issued.
    pub async fn validate_connection(&self) -> bool {
        let mut state = self.state.lock().await;
        let Some(live) = state.live.as_mut() else {
            return false;
        };
        if live.created_at.elapsed() >= self.settings.max_age {
            live.valid = false;
            return false;
        }
        if live.last_probe.elapsed() < self.settings.probe_interval {
            return live.valid;
        }
        live.last_probe = Instant::now();
        live.valid = live.connection.query("SELECT 1").is_ok();
        if !live.valid {
            warn!(root = %self.root.display(), "connection liveness probe failed");
        }
        live.valid
    }

    /// Validate, and reinitialize if the connection is missing or invalid.
    pub async fn ensure_ready(&self) -> Result<()> {
        if self.validate_connection().await {
            return Ok(());
        }
        self.reset_connection().await;
        self.initialize().await
    }

    /// Exclusive lease on the live connection, or `NotInitialized`.
    ///
    /// The lease holds the connection lock; statements issued through it
    /// cannot interleave with any other caller until it is dropped.
    pub async fn lease(&self) -> Result<ConnectionLease> {
        let guard = Arc::clone(&self.state).lock_owned().await;
        if guard.live.is_none() {
            return Err(ConnectionError::NotInitialized.into());
        }
        Ok(ConnectionLease { guard })
    }

    /// Non-blocking variant of [`ConnectionManager::lease`]; `None` when the
    /// connection is currently held elsewhere.
    pub fn try_lease(&self) -> Option<ConnectionLease> {
        let guard = Arc::clone(&self.state).try_lock_owned().ok()?;
        if guard.live.is_none() {
            return None;
        }
        Some(ConnectionLease { guard })
    }

    /// Drop the connection so the manager can be reinitialized.
    /// Native cleanup failures are logged, never propagated.
    pub async fn reset_connection(&self) {
        self.close().await;
    }

    /// Close the connection and clear all internal state.
    /// Never fails: cleanup errors are logged and shutdown continues.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        if state.live.take().is_some() {
            if let Err(err) = std::fs::remove_file(self.lock_path()) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %self.lock_path().display(), %err, "failed to remove lock marker");
                }
            }
            debug!(root = %self.root.display(), "connection closed");
        }
    }
}

/// Exclusive access to the live connection for the lifetime of the guard.
#[derive(Debug)]
pub struct ConnectionLease {
    guard: OwnedMutexGuard<ConnectionState>,
}

impl ConnectionLease {
    /// The leased connection handle.
    pub fn connection(&self) -> &Connection {
        &self
            .guard
            .live
            .as_ref()
            .expect("lease always holds a live connection")
            .connection
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager_in(dir: &Path, settings: ConnectionSettings) -> ConnectionManager {
        ConnectionManager::new(
            dir.to_path_buf(),
            dir.join(".membank").join("memory.db"),
            settings,
        )
    }

    #[tokio::test]
    async fn initialize_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_in(dir.path(), ConnectionSettings::default());
        manager.initialize().await.unwrap();
        manager.initialize().await.unwrap();
        assert!(manager.is_connected().await);
    }

    #[tokio::test]
    async fn lease_before_initialize_is_not_initialized() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_in(dir.path(), ConnectionSettings::default());
        let err = manager.lease().await.unwrap_err();
        assert!(matches!(
            err,
            crate::error::MemBankError::Connection(ConnectionError::NotInitialized)
        ));
    }

    #[tokio::test]
    async fn close_clears_state_and_allows_reinit() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_in(dir.path(), ConnectionSettings::default());
        manager.initialize().await.unwrap();
        assert!(manager.lock_path().exists());
        manager.close().await;
        assert!(!manager.is_connected().await);
        assert!(!manager.lock_path().exists());
        manager.initialize().await.unwrap();
        assert!(manager.is_connected().await);
    }

    #[tokio::test]
    async fn aged_out_connection_fails_validation() {
        let dir = tempfile::tempdir().unwrap();
        let settings = ConnectionSettings {
            max_age: Duration::ZERO,
            ..ConnectionSettings::default()
        };
        let manager = manager_in(dir.path(), settings);
        manager.initialize().await.unwrap();
        assert!(!manager.validate_connection().await);
        // ensure_ready recovers by reinitializing, which resets the age.
        manager.ensure_ready().await.unwrap();
        assert!(manager.is_connected().await);
    }

    #[tokio::test]
    async fn cached_validity_is_returned_inside_probe_interval() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_in(dir.path(), ConnectionSettings::default());
        manager.initialize().await.unwrap();
        assert!(manager.validate_connection().await);
        assert!(manager.validate_connection().await);
    }

    #[tokio::test]
    async fn stale_lock_artifact_is_removed_before_open() {
        let dir = tempfile::tempdir().unwrap();
        let settings = ConnectionSettings {
            stale_lock_age: Duration::ZERO,
            ..ConnectionSettings::default()
        };
        let manager = manager_in(dir.path(), settings);
        std::fs::create_dir_all(manager.db_path().parent().unwrap()).unwrap();
        std::fs::write(manager.lock_path(), "12345").unwrap();

        manager.initialize().await.unwrap();
        // The stale artifact was replaced by this process's marker.
        let contents = std::fs::read_to_string(manager.lock_path()).unwrap();
        assert_eq!(contents, std::process::id().to_string());
    }
}
