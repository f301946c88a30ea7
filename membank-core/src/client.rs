//! Top-level client handle and the process-wide client registry.
//!
//! A [`Client`] wires the connection manager, executor, transaction
//! manager, schema manager, and snapshot engine together for one project
//! root. The registry guarantees one client per normalized root and
//! deduplicates concurrent initialization: racing callers await the same
//! in-flight open instead of opening twice.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, LazyLock, Mutex};

use futures::future::{BoxFuture, FutureExt, Shared};
use tracing::debug;

use crate::config::MemBankConfig;
use crate::connection::{ConnectionManager, ConnectionSettings};
use crate::error::{MemBankError, Result};
use crate::executor::{QueryExecutor, QueryOptions};
use crate::schema::SchemaManager;
use crate::snapshot::SnapshotEngine;
use crate::transaction::{TransactionContext, TransactionManager};
use crate::value::{PropertyValue, Row};

type SharedOpen = Shared<BoxFuture<'static, std::result::Result<Arc<Client>, Arc<MemBankError>>>>;

enum RegistryEntry {
    Ready(Arc<Client>),
    Pending(SharedOpen),
}

static REGISTRY: LazyLock<Mutex<HashMap<PathBuf, RegistryEntry>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Canonical form of a project root: absolute, with `.` and `..`
/// components folded lexically. Two spellings of the same directory map to
/// the same registry key without touching the filesystem.
pub(crate) fn normalize_root(root: &Path) -> PathBuf {
    let absolute = std::path::absolute(root).unwrap_or_else(|_| root.to_path_buf());
    let mut normalized = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other),
        }
    }
    normalized
}

/// One fully wired store handle for a project root.
#[derive(Debug)]
pub struct Client {
    root: PathBuf,
    config: MemBankConfig,
    manager: Arc<ConnectionManager>,
    executor: Arc<QueryExecutor>,
    transactions: Arc<TransactionManager>,
    schema: SchemaManager,
    snapshots: SnapshotEngine,
}

impl Client {
    /// Open a client for `root` using its on-disk configuration (or the
    /// defaults when `.membank/config.toml` is absent).
    pub async fn open(root: &Path) -> Result<Self> {
        let config = MemBankConfig::load_or_default(root)?;
        Self::open_with_config(root, config).await
    }

    /// Open a client with an explicit configuration.
    ///
    /// Initializes the connection and bootstraps the schema before the
    /// handle is returned, so a successful open always yields a usable
    /// store.
    pub async fn open_with_config(root: &Path, config: MemBankConfig) -> Result<Self> {
        let root = normalize_root(root);
        let db_path = config.db_path(&root);
        let manager = Arc::new(ConnectionManager::new(
            root.clone(),
            db_path,
            ConnectionSettings::from_config(&config),
        ));
        manager.initialize().await?;

        let executor = Arc::new(QueryExecutor::new(Arc::clone(&manager)));
        let schema = SchemaManager::new(Arc::clone(&executor));
        schema.initialize_schema().await?;

        let transactions = Arc::new(TransactionManager::new(Arc::clone(&manager)));
        let snapshots = SnapshotEngine::new(Arc::clone(&executor), Arc::clone(&transactions));

        debug!(root = %root.display(), "client opened");
        Ok(Self {
            root,
            config,
            manager,
            executor,
            transactions,
            schema,
            snapshots,
        })
    }

    /// Normalized project root this client serves.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Effective configuration.
    pub fn config(&self) -> &MemBankConfig {
        &self.config
    }

    /// Execute a query through the managed connection.
    pub async fn execute_query(
        &self,
        query: &str,
        params: Option<&[(String, PropertyValue)]>,
        options: QueryOptions,
    ) -> Result<Vec<Row>> {
        self.executor.execute(query, params, options).await
    }

    /// Run `body` inside an explicit transaction.
    pub async fn transaction<T, F, Fut>(&self, body: F) -> Result<T>
    where
        F: FnOnce(TransactionContext) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.transactions.transaction(body).await
    }

    /// Run `body` inside a transaction, retrying per the `[retry]` config
    /// section.
    pub async fn transaction_with_retry<T, F, Fut>(&self, body: F) -> Result<T>
    where
        F: Fn(TransactionContext) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.transactions
            .transaction_with_retry(body, self.config.retry.max_retries, self.config.retry_delay())
            .await
    }

    /// The connection manager backing this client.
    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// The query executor backing this client.
    pub fn executor(&self) -> &Arc<QueryExecutor> {
        &self.executor
    }

    /// The transaction manager backing this client.
    pub fn transactions(&self) -> &Arc<TransactionManager> {
        &self.transactions
    }

    /// Schema bootstrap and introspection.
    pub fn schema(&self) -> &SchemaManager {
        &self.schema
    }

    /// Snapshot and rollback operations.
    pub fn snapshots(&self) -> &SnapshotEngine {
        &self.snapshots
    }

    /// Close the underlying connection. Never fails; the client can be
    /// reopened implicitly by the next executor call.
    pub async fn close(&self) {
        self.manager.close().await;
    }
}

/// One client per normalized root, created on first request.
///
/// Concurrent callers for the same root share a single in-flight open; a
/// failed open is not cached, so the next caller retries from scratch.
pub async fn get_or_create_client(root: &Path) -> Result<Arc<Client>> {
    let key = normalize_root(root);

    let open = {
        let mut registry = REGISTRY.lock().expect("client registry mutex poisoned");
        match registry.get(&key) {
            Some(RegistryEntry::Ready(client)) => return Ok(Arc::clone(client)),
            Some(RegistryEntry::Pending(open)) => open.clone(),
            None => {
                let opening = key.clone();
                let open: SharedOpen = async move {
                    Client::open(&opening)
                        .await
                        .map(Arc::new)
                        .map_err(Arc::new)
                }
                .boxed()
                .shared();
                registry.insert(key.clone(), RegistryEntry::Pending(open.clone()));
                open
            }
        }
    };

    match open.await {
        Ok(client) => {
            let mut registry = REGISTRY.lock().expect("client registry mutex poisoned");
            registry.insert(key, RegistryEntry::Ready(Arc::clone(&client)));
            Ok(client)
        }
        Err(err) => {
            let mut registry = REGISTRY.lock().expect("client registry mutex poisoned");
            if matches!(registry.get(&key), Some(RegistryEntry::Pending(_))) {
                registry.remove(&key);
            }
            Err(MemBankError::Shared(err))
        }
    }
}

/// The registered client for `root`, if one has been created.
pub fn registered_client(root: &Path) -> Option<Arc<Client>> {
    let registry = REGISTRY.lock().expect("client registry mutex poisoned");
    match registry.get(&normalize_root(root)) {
        Some(RegistryEntry::Ready(client)) => Some(Arc::clone(client)),
        _ => None,
    }
}

/// Drop every registered client. In-flight opens are left to finish; their
/// results are simply never re-registered.
pub fn clear_registry() {
    let mut registry = REGISTRY.lock().expect("client registry mutex poisoned");
    registry.retain(|_, entry| matches!(entry, RegistryEntry::Pending(_)));
}

impl std::fmt::Debug for RegistryEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ready(client) => f.debug_tuple("Ready").field(&client.root).finish(),
            Self::Pending(_) => f.debug_tuple("Pending").finish(),
        }
    }
}
