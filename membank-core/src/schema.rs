//! Idempotent schema bootstrap and validation.
//!
//! The schema descriptor is fixed: one node table per entity label, one
//! relationship table per edge type, plus two optional engine extensions.
//! All DDL uses "if not exists" semantics so initialization can run any
//! number of times; validation re-checks the live catalog and reports
//! exactly which tables are missing without repairing them.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{QueryError, Result, SchemaError};
use crate::executor::QueryExecutor;

/// Node tables in creation order.
pub const NODE_TABLES: &[&str] = &[
    "Repository",
    "Component",
    "Decision",
    "Rule",
    "File",
    "Tag",
    "Context",
    "Metadata",
];

/// Relationship tables in creation order.
pub const RELATIONSHIP_TABLES: &[&str] = &[
    "DEPENDS_ON",
    "IMPLEMENTS",
    "TAGGED_WITH",
    "GOVERNS",
    "AFFECTS",
    "CONTEXT_OF",
    "PART_OF",
];

/// Optional query-engine extensions. Soft dependencies: schema bootstrap
/// degrades gracefully when one is unavailable.
pub const EXTENSIONS: &[&str] = &["fts5", "json1"];

/// Outcome of installing or probing one optional extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtensionStatus {
    /// The extension was already installed and loaded.
    AlreadySatisfied,
    /// The extension was installed by this call.
    Installed,
    /// The engine build does not provide the extension.
    NotSupported,
}

/// Result of re-checking the descriptor against the live catalog.
#[derive(Debug, Clone, Default)]
pub struct SchemaValidation {
    /// True when no descriptor table is missing.
    pub valid: bool,
    /// Tables named by the descriptor but absent from the catalog.
    pub missing_tables: Vec<String>,
}

/// Full schema introspection: live catalog plus extension availability.
#[derive(Debug, Clone)]
pub struct SchemaInfo {
    pub tables: Vec<String>,
    pub relationships: Vec<String>,
    pub extensions: Vec<(String, ExtensionStatus)>,
}

fn node_table_ddl(name: &str) -> [String; 2] {
    [
        format!(
            "CREATE TABLE IF NOT EXISTS {name} (
                id TEXT PRIMARY KEY,
                repository TEXT NOT NULL,
                branch TEXT NOT NULL DEFAULT 'main',
                properties TEXT NOT NULL DEFAULT '{{}}'
            )"
        ),
        format!("CREATE INDEX IF NOT EXISTS idx_{name}_scope ON {name}(repository, branch)"),
    ]
}

fn relationship_table_ddl(name: &str) -> [String; 2] {
    [
        format!(
            "CREATE TABLE IF NOT EXISTS {name} (
                source_id TEXT NOT NULL,
                target_id TEXT NOT NULL,
                properties TEXT NOT NULL DEFAULT '{{}}',
                PRIMARY KEY (source_id, target_id)
            )"
        ),
        format!("CREATE INDEX IF NOT EXISTS idx_{name}_target ON {name}(target_id)"),
    ]
}

/// Bootstraps and validates the graph schema.
#[derive(Debug)]
pub struct SchemaManager {
    executor: Arc<QueryExecutor>,
}

impl SchemaManager {
    pub fn new(executor: Arc<QueryExecutor>) -> Self {
        Self { executor }
    }

    /// Run the three bootstrap phases in order: extensions, node tables,
    /// relationship tables. Failure at any phase aborts with one wrapped
    /// error; a missing extension only warns.
    pub async fn initialize_schema(&self) -> Result<()> {
        for name in EXTENSIONS {
            match self.setup_extension(name).await? {
                ExtensionStatus::AlreadySatisfied => {
                    debug!(extension = name, "extension already satisfied");
                }
                ExtensionStatus::Installed => {
                    debug!(extension = name, "extension installed");
                }
                ExtensionStatus::NotSupported => {
                    warn!(extension = name, "extension not supported; continuing without it");
                }
            }
        }

        for table in NODE_TABLES {
            for statement in node_table_ddl(table) {
                self.executor.execute_simple(&statement).await.map_err(|source| {
                    SchemaError::NodeTable {
                        table: (*table).to_string(),
                        source: Box::new(source),
                    }
                })?;
            }
        }

        for table in RELATIONSHIP_TABLES {
            for statement in relationship_table_ddl(table) {
                self.executor.execute_simple(&statement).await.map_err(|source| {
                    SchemaError::RelationshipTable {
                        table: (*table).to_string(),
                        source: Box::new(source),
                    }
                })?;
            }
        }

        debug!("schema initialized");
        Ok(())
    }

    /// Install or probe one optional extension.
    ///
    /// "Already satisfied" and "installed" are both success; a build
    /// without the extension degrades to `NotSupported`; any other engine
    /// error is a hard failure and aborts schema bootstrap.
    async fn setup_extension(&self, name: &str) -> Result<ExtensionStatus> {
        match name {
            "fts5" => {
                if !self.executor.module_available("fts5").await? {
                    return Ok(ExtensionStatus::NotSupported);
                }
                let existed = self.executor.table_exists("membank_search").await?;
                self.executor
                    .execute_simple(
                        "CREATE VIRTUAL TABLE IF NOT EXISTS membank_search
                         USING fts5(entity_id, content)",
                    )
                    .await
                    .map_err(|err| match err {
                        crate::error::MemBankError::Query(QueryError::Engine(source)) => {
                            SchemaError::Extension {
                                name: name.to_string(),
                                source,
                            }
                            .into()
                        }
                        other => other,
                    })?;
                if existed {
                    Ok(ExtensionStatus::AlreadySatisfied)
                } else {
                    Ok(ExtensionStatus::Installed)
                }
            }
            "json1" => {
                // JSON support is built in when the probe evaluates.
                match self.executor.execute("SELECT json('{}')", None, Default::default()).await {
                    Ok(_) => Ok(ExtensionStatus::AlreadySatisfied),
                    Err(_) => Ok(ExtensionStatus::NotSupported),
                }
            }
            other => {
                warn!(extension = other, "unknown extension in descriptor");
                Ok(ExtensionStatus::NotSupported)
            }
        }
    }

    /// Re-check every descriptor table against the live catalog.
    pub async fn validate_schema(&self) -> Result<SchemaValidation> {
        let mut missing = Vec::new();
        for table in NODE_TABLES.iter().chain(RELATIONSHIP_TABLES) {
            if !self.executor.table_exists(table).await? {
                missing.push((*table).to_string());
            }
        }
        Ok(SchemaValidation {
            valid: missing.is_empty(),
            missing_tables: missing,
        })
    }

    /// Introspect actual state: live catalog listing plus extension
    /// availability. Never consults the static descriptor for the listing.
    pub async fn schema_info(&self) -> Result<SchemaInfo> {
        let catalog = self.executor.schema_info().await?;
        let mut extensions = Vec::with_capacity(EXTENSIONS.len());
        for name in EXTENSIONS {
            let status = match *name {
                "fts5" => {
                    if self.executor.table_exists("membank_search").await? {
                        ExtensionStatus::AlreadySatisfied
                    } else if self.executor.module_available("fts5").await? {
                        ExtensionStatus::Installed
                    } else {
                        ExtensionStatus::NotSupported
                    }
                }
                _ => match self
                    .executor
                    .execute("SELECT json('{}')", None, Default::default())
                    .await
                {
                    Ok(_) => ExtensionStatus::AlreadySatisfied,
                    Err(_) => ExtensionStatus::NotSupported,
                },
            };
            extensions.push(((*name).to_string(), status));
        }
        Ok(SchemaInfo {
            tables: catalog.tables,
            relationships: catalog.relationships,
            extensions,
        })
    }
}
