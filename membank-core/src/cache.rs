//! Process-wide cache of typed repositories, keyed by project root.
//!
//! Repositories are handed out as shared handles so every caller for the
//! same (kind, root) pair sees the same instance. Roots must be explicitly
//! initialized before repositories can be requested; asking earlier is a
//! caller bug and fails loudly instead of lazily initializing.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, Mutex};

use tracing::debug;

use crate::client::{clear_registry, normalize_root, Client};
use crate::error::{CacheError, Result};
use crate::repository::{EntityKind, EntityRepository};

static CACHE: LazyLock<RepositoryCache> = LazyLock::new(RepositoryCache::new);

#[derive(Debug, Default)]
struct CacheState {
    repositories: HashMap<(EntityKind, PathBuf), Arc<EntityRepository>>,
    initialized: HashSet<PathBuf>,
}

/// Singleton registry of typed repositories.
#[derive(Debug)]
pub struct RepositoryCache {
    state: Mutex<CacheState>,
}

impl RepositoryCache {
    fn new() -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
        }
    }

    /// The process-wide cache instance.
    pub fn instance() -> &'static Self {
        &CACHE
    }

    /// Create and cache one repository per entity kind for `root`, built
    /// over the caller-supplied client. Initialization order stays explicit:
    /// the caller obtains the client first, then registers repositories.
    ///
    /// Idempotent: an already-initialized root keeps its existing handles.
    pub fn initialize_repositories(&self, root: &Path, client: &Arc<Client>) {
        let key = normalize_root(root);
        let mut state = self.state.lock().expect("repository cache mutex poisoned");
        if state.initialized.insert(key.clone()) {
            for kind in EntityKind::ALL {
                state.repositories.insert(
                    (kind, key.clone()),
                    Arc::new(EntityRepository::new(kind, Arc::clone(client))),
                );
            }
            debug!(root = %key.display(), "repositories initialized");
        }
    }

    /// Whether `root` has been initialized.
    pub fn is_initialized(&self, root: &Path) -> bool {
        self.state
            .lock()
            .expect("repository cache mutex poisoned")
            .initialized
            .contains(&normalize_root(root))
    }

    /// The cached repository for `(kind, root)`.
    ///
    /// Fails with [`CacheError::NotInitialized`] when the root has not been
    /// initialized; the cache never initializes implicitly.
    pub fn repository(&self, kind: EntityKind, root: &Path) -> Result<Arc<EntityRepository>> {
        let key = normalize_root(root);
        let state = self.state.lock().expect("repository cache mutex poisoned");
        state
            .repositories
            .get(&(kind, key.clone()))
            .map(Arc::clone)
            .ok_or_else(|| CacheError::NotInitialized(key).into())
    }

    /// Component repository for `root`.
    pub fn components(&self, root: &Path) -> Result<Arc<EntityRepository>> {
        self.repository(EntityKind::Component, root)
    }

    /// Decision repository for `root`.
    pub fn decisions(&self, root: &Path) -> Result<Arc<EntityRepository>> {
        self.repository(EntityKind::Decision, root)
    }

    /// Rule repository for `root`.
    pub fn rules(&self, root: &Path) -> Result<Arc<EntityRepository>> {
        self.repository(EntityKind::Rule, root)
    }

    /// File repository for `root`.
    pub fn files(&self, root: &Path) -> Result<Arc<EntityRepository>> {
        self.repository(EntityKind::File, root)
    }

    /// Tag repository for `root`.
    pub fn tags(&self, root: &Path) -> Result<Arc<EntityRepository>> {
        self.repository(EntityKind::Tag, root)
    }

    /// Context repository for `root`.
    pub fn contexts(&self, root: &Path) -> Result<Arc<EntityRepository>> {
        self.repository(EntityKind::Context, root)
    }

    /// Drop all cached repositories for one root. Other roots are untouched.
    pub fn clear_for_root(&self, root: &Path) {
        let key = normalize_root(root);
        let mut state = self.state.lock().expect("repository cache mutex poisoned");
        state.repositories.retain(|(_, cached_root), _| *cached_root != key);
        state.initialized.remove(&key);
        debug!(root = %key.display(), "repositories cleared");
    }

    /// Drop every cached repository and the underlying client registry.
    pub fn clear_all(&self) {
        {
            let mut state = self.state.lock().expect("repository cache mutex poisoned");
            state.repositories.clear();
            state.initialized.clear();
        }
        clear_registry();
        debug!("repository cache cleared");
    }
}
