//! Application-level backup: full graph export, transactional restore,
//! integrity validation, and statistics.
//!
//! Snapshots are self-hosted: each one is a durable node in the same graph
//! it backs up, holding a serialized payload of every in-scope entity and
//! relationship. The engine offers no backup tooling of its own, so
//! atomicity comes from running the entire restore inside one explicit
//! transaction.
#![allow(clippy::cast_sign_loss, clippy::cast_possible_wrap)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Result, SnapshotError};
use crate::executor::{QueryExecutor, QueryOptions};
use crate::schema::{NODE_TABLES, RELATIONSHIP_TABLES};
use crate::transaction::TransactionManager;
use crate::value::{properties_from_json, properties_to_json, PropertyMap, PropertyValue, Row};

/// Table holding snapshot records, created on first use.
const SNAPSHOT_TABLE: &str = "Snapshot";

/// Ids per DELETE statement during restore, well under the engine's bound
/// parameter limit.
const RESTORE_ID_BATCH: usize = 100;

const SNAPSHOT_TABLE_DDL: &str = "CREATE TABLE IF NOT EXISTS Snapshot (
    id TEXT PRIMARY KEY,
    repository TEXT NOT NULL,
    branch TEXT NOT NULL,
    description TEXT,
    created TEXT NOT NULL,
    entity_count INTEGER NOT NULL,
    relationship_count INTEGER NOT NULL,
    size_bytes INTEGER NOT NULL,
    payload TEXT NOT NULL
)";

/// One exported entity: id, label(s), and the full property bag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityExport {
    pub id: String,
    pub labels: Vec<String>,
    pub properties: PropertyMap,
}

/// One exported relationship, matched by endpoint ids on restore.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipExport {
    pub source_id: String,
    pub target_id: String,
    pub rel_type: String,
    pub properties: PropertyMap,
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotMetadata {
    repository: String,
    branch: String,
    captured_at: DateTime<Utc>,
    node_tables: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotPayload {
    entities: Vec<EntityExport>,
    relationships: Vec<RelationshipExport>,
    metadata: SnapshotMetadata,
}

/// Returned by [`SnapshotEngine::create_snapshot`].
#[derive(Debug, Clone)]
pub struct SnapshotSummary {
    pub id: String,
    pub entity_count: u64,
    pub relationship_count: u64,
    pub created: DateTime<Utc>,
    pub description: Option<String>,
}

/// One row of [`SnapshotEngine::list_snapshots`].
#[derive(Debug, Clone)]
pub struct SnapshotListing {
    pub id: String,
    pub repository: String,
    pub branch: String,
    pub description: Option<String>,
    pub created: DateTime<Utc>,
    pub entity_count: u64,
    pub relationship_count: u64,
    pub size_bytes: u64,
}

/// Returned by [`SnapshotEngine::rollback_to_snapshot`].
#[derive(Debug, Clone)]
pub struct RollbackReport {
    pub success: bool,
    pub restored_entities: u64,
    pub restored_relationships: u64,
    pub duration: Duration,
}

/// Integrity-check result for a stored payload.
#[derive(Debug, Clone, Default)]
pub struct SnapshotValidation {
    pub valid: bool,
    pub issues: Vec<String>,
}

/// Type histograms and payload size, derived without mutating the record.
#[derive(Debug, Clone)]
pub struct SnapshotStats {
    pub entity_count: u64,
    pub relationship_count: u64,
    pub size_bytes: u64,
    pub entities_by_label: HashMap<String, u64>,
    pub relationships_by_type: HashMap<String, u64>,
}

/// Exports and restores full graph state for a (repository, branch) pair.
#[derive(Debug)]
pub struct SnapshotEngine {
    executor: Arc<QueryExecutor>,
    transactions: Arc<TransactionManager>,
}

impl SnapshotEngine {
    pub fn new(executor: Arc<QueryExecutor>, transactions: Arc<TransactionManager>) -> Self {
        Self {
            executor,
            transactions,
        }
    }

    /// Node tables whose rows are exported. Metadata nodes are captured in
    /// the payload's metadata section and never deleted on restore, and the
    /// snapshot table must not back itself up.
    fn export_tables() -> impl Iterator<Item = &'static str> {
        NODE_TABLES
            .iter()
            .copied()
            .filter(|table| *table != "Metadata" && *table != SNAPSHOT_TABLE)
    }

    async fn ensure_snapshot_table(&self) -> Result<()> {
        self.executor.execute_simple(SNAPSHOT_TABLE_DDL).await?;
        Ok(())
    }

    fn scope_params(repository: &str, branch: &str) -> Vec<(String, PropertyValue)> {
        vec![
            (
                "repository".to_string(),
                PropertyValue::Text(repository.to_string()),
            ),
            ("branch".to_string(), PropertyValue::Text(branch.to_string())),
        ]
    }

    /// Export every in-scope entity and relationship and persist them as a
    /// single durable snapshot record inside the graph itself.
    pub async fn create_snapshot(
        &self,
        repository: &str,
        branch: &str,
        description: Option<&str>,
    ) -> Result<SnapshotSummary> {
        self.ensure_snapshot_table().await?;

        let scope = Self::scope_params(repository, branch);
        let mut entities = Vec::new();
        let mut in_scope: HashSet<String> = HashSet::new();
        for table in Self::export_tables() {
            let rows = self
                .executor
                .execute(
                    &format!(
                        "SELECT id, properties FROM {table}
                         WHERE repository = :repository AND branch = :branch"
                    ),
                    Some(&scope),
                    QueryOptions::default(),
                )
                .await?;
            for row in rows {
                let id = text_column(&row, "id");
                let properties = row
                    .get("properties")
                    .and_then(PropertyValue::as_text)
                    .map(properties_from_json)
                    .unwrap_or_default();
                in_scope.insert(id.clone());
                entities.push(EntityExport {
                    id,
                    labels: vec![table.to_string()],
                    properties,
                });
            }
        }

        // Only edges with both endpoints in scope belong to the snapshot.
        let mut relationships = Vec::new();
        for table in RELATIONSHIP_TABLES {
            let rows = self
                .executor
                .execute(
                    &format!("SELECT source_id, target_id, properties FROM {table}"),
                    None,
                    QueryOptions::default(),
                )
                .await?;
            for row in rows {
                let source_id = text_column(&row, "source_id");
                let target_id = text_column(&row, "target_id");
                if !in_scope.contains(&source_id) || !in_scope.contains(&target_id) {
                    continue;
                }
                relationships.push(RelationshipExport {
                    source_id,
                    target_id,
                    rel_type: (*table).to_string(),
                    properties: row
                        .get("properties")
                        .and_then(PropertyValue::as_text)
                        .map(properties_from_json)
                        .unwrap_or_default(),
                });
            }
        }

        let created = Utc::now();
        let payload = SnapshotPayload {
            metadata: SnapshotMetadata {
                repository: repository.to_string(),
                branch: branch.to_string(),
                captured_at: created,
                node_tables: Self::export_tables().map(str::to_string).collect(),
            },
            entities,
            relationships,
        };
        let serialized = serde_json::to_string(&payload).map_err(SnapshotError::Payload)?;

        let id = Uuid::new_v4().to_string();
        let entity_count = payload.entities.len() as u64;
        let relationship_count = payload.relationships.len() as u64;
        let params: Vec<(String, PropertyValue)> = vec![
            ("id".to_string(), PropertyValue::Text(id.clone())),
            (
                "repository".to_string(),
                PropertyValue::Text(repository.to_string()),
            ),
            ("branch".to_string(), PropertyValue::Text(branch.to_string())),
            (
                "description".to_string(),
                description.map_or(PropertyValue::Null, |d| PropertyValue::Text(d.to_string())),
            ),
            ("created".to_string(), PropertyValue::Date(created)),
            ("entity_count".to_string(), PropertyValue::Int(entity_count as i64)),
            (
                "relationship_count".to_string(),
                PropertyValue::Int(relationship_count as i64),
            ),
            (
                "size_bytes".to_string(),
                PropertyValue::Int(serialized.len() as i64),
            ),
            ("payload".to_string(), PropertyValue::Text(serialized)),
        ];
        self.executor
            .execute(
                "INSERT INTO Snapshot
                 (id, repository, branch, description, created,
                  entity_count, relationship_count, size_bytes, payload)
                 VALUES (:id, :repository, :branch, :description, :created,
                         :entity_count, :relationship_count, :size_bytes, :payload)",
                Some(&params),
                QueryOptions::default(),
            )
            .await?;

        debug!(%id, repository, branch, entity_count, relationship_count, "snapshot created");
        Ok(SnapshotSummary {
            id,
            entity_count,
            relationship_count,
            created,
            description: description.map(str::to_string),
        })
    }

    async fn load_record(&self, id: &str) -> Result<Option<Row>> {
        self.ensure_snapshot_table().await?;
        let rows = self
            .executor
            .execute(
                "SELECT * FROM Snapshot WHERE id = :id",
                Some(&[("id".to_string(), PropertyValue::Text(id.to_string()))]),
                QueryOptions::default(),
            )
            .await?;
        Ok(rows.into_iter().next())
    }

    fn parse_payload(record: &Row, id: &str) -> Result<SnapshotPayload> {
        let raw = record
            .get("payload")
            .and_then(PropertyValue::as_text)
            .ok_or_else(|| SnapshotError::Restore(format!("snapshot {id} has no payload")))?;
        serde_json::from_str(raw)
            .map_err(SnapshotError::Payload)
            .map_err(Into::into)
    }

    /// Restore the graph to the snapshot's recorded state.
    ///
    /// The snapshot is validated first; an invalid one is refused before
    /// any destructive statement runs. The restore itself is a single
    /// transaction: on any failure the graph is left exactly as it was.
    pub async fn rollback_to_snapshot(&self, id: &str) -> Result<RollbackReport> {
        let record = self
            .load_record(id)
            .await?
            .ok_or_else(|| SnapshotError::NotFound(id.to_string()))?;
        let validation = self.validate_snapshot(id).await?;
        if !validation.valid {
            return Err(SnapshotError::Invalid {
                id: id.to_string(),
                issues: validation.issues,
            }
            .into());
        }

        let payload = Self::parse_payload(&record, id)?;
        let repository = payload.metadata.repository.clone();
        let branch = payload.metadata.branch.clone();
        let started = Instant::now();

        let (restored_entities, restored_relationships) = self
            .transactions
            .transaction(move |ctx| async move {
                let scope = Self::scope_params(&repository, &branch);
                let scope_subquery = Self::export_tables()
                    .map(|table| {
                        format!(
                            "SELECT id FROM {table}
                             WHERE repository = :repository AND branch = :branch"
                        )
                    })
                    .collect::<Vec<_>>()
                    .join(" UNION ");

                // Edges first, to keep referential integrity while nodes go.
                // Scope on the current graph is not enough: a node deleted
                // after the snapshot can leave its edge rows behind, and a
                // surviving row would collide with the recreate phase. Any
                // edge touching a recorded entity id goes too.
                let recorded_ids: Vec<String> =
                    payload.entities.iter().map(|e| e.id.clone()).collect();
                for table in RELATIONSHIP_TABLES {
                    ctx.execute(
                        &format!(
                            "DELETE FROM {table}
                             WHERE source_id IN ({scope_subquery})
                                OR target_id IN ({scope_subquery})"
                        ),
                        Some(&scope),
                    )
                    .await?;
                    for chunk in recorded_ids.chunks(RESTORE_ID_BATCH) {
                        let names: Vec<String> =
                            (0..chunk.len()).map(|i| format!("id{i}")).collect();
                        let list = names
                            .iter()
                            .map(|name| format!(":{name}"))
                            .collect::<Vec<_>>()
                            .join(", ");
                        let params: Vec<(String, PropertyValue)> = names
                            .into_iter()
                            .zip(chunk)
                            .map(|(name, id)| (name, PropertyValue::Text(id.clone())))
                            .collect();
                        ctx.execute(
                            &format!(
                                "DELETE FROM {table}
                                 WHERE source_id IN ({list}) OR target_id IN ({list})"
                            ),
                            Some(&params),
                        )
                        .await?;
                    }
                }
                // Then every in-scope node, leaving snapshot and metadata
                // nodes untouched.
                for table in Self::export_tables() {
                    ctx.execute(
                        &format!(
                            "DELETE FROM {table}
                             WHERE repository = :repository AND branch = :branch"
                        ),
                        Some(&scope),
                    )
                    .await?;
                }

                // Recreate entities, one statement each, by recorded label.
                for entity in &payload.entities {
                    let label = entity
                        .labels
                        .first()
                        .map(String::as_str)
                        .ok_or_else(|| SnapshotError::Restore(format!(
                            "entity {} has no label",
                            entity.id
                        )))?;
                    if !NODE_TABLES.contains(&label) {
                        return Err(SnapshotError::Restore(format!(
                            "entity {} has unknown label {label}",
                            entity.id
                        ))
                        .into());
                    }
                    let properties =
                        properties_to_json(&entity.properties).map_err(SnapshotError::Payload)?;
                    let params = vec![
                        ("id".to_string(), PropertyValue::Text(entity.id.clone())),
                        (
                            "repository".to_string(),
                            PropertyValue::Text(payload.metadata.repository.clone()),
                        ),
                        (
                            "branch".to_string(),
                            PropertyValue::Text(payload.metadata.branch.clone()),
                        ),
                        ("properties".to_string(), PropertyValue::Text(properties)),
                    ];
                    ctx.execute(
                        &format!(
                            "INSERT INTO {label} (id, repository, branch, properties)
                             VALUES (:id, :repository, :branch, :properties)"
                        ),
                        Some(&params),
                    )
                    .await?;
                }

                // Then relationships, matched by endpoint ids.
                for rel in &payload.relationships {
                    if !RELATIONSHIP_TABLES.contains(&rel.rel_type.as_str()) {
                        return Err(SnapshotError::Restore(format!(
                            "relationship {} -> {} has unknown type {}",
                            rel.source_id, rel.target_id, rel.rel_type
                        ))
                        .into());
                    }
                    let properties =
                        properties_to_json(&rel.properties).map_err(SnapshotError::Payload)?;
                    let params = vec![
                        (
                            "source_id".to_string(),
                            PropertyValue::Text(rel.source_id.clone()),
                        ),
                        (
                            "target_id".to_string(),
                            PropertyValue::Text(rel.target_id.clone()),
                        ),
                        ("properties".to_string(), PropertyValue::Text(properties)),
                    ];
                    ctx.execute(
                        &format!(
                            "INSERT INTO {} (source_id, target_id, properties)
                             VALUES (:source_id, :target_id, :properties)",
                            rel.rel_type
                        ),
                        Some(&params),
                    )
                    .await?;
                }

                Ok((
                    payload.entities.len() as u64,
                    payload.relationships.len() as u64,
                ))
            })
            .await?;

        let duration = started.elapsed();
        debug!(%id, restored_entities, restored_relationships, ?duration, "rollback complete");
        Ok(RollbackReport {
            success: true,
            restored_entities,
            restored_relationships,
            duration,
        })
    }

    /// List snapshot records for a repository, newest first, optionally
    /// filtered by branch.
    pub async fn list_snapshots(
        &self,
        repository: &str,
        branch: Option<&str>,
    ) -> Result<Vec<SnapshotListing>> {
        self.ensure_snapshot_table().await?;
        let mut params = vec![(
            "repository".to_string(),
            PropertyValue::Text(repository.to_string()),
        )];
        let mut sql = String::from(
            "SELECT id, repository, branch, description, created,
                    entity_count, relationship_count, size_bytes
             FROM Snapshot WHERE repository = :repository",
        );
        if let Some(branch) = branch {
            sql.push_str(" AND branch = :branch");
            params.push(("branch".to_string(), PropertyValue::Text(branch.to_string())));
        }
        sql.push_str(" ORDER BY created DESC");

        let rows = self
            .executor
            .execute(&sql, Some(&params), QueryOptions::default())
            .await?;
        Ok(rows.iter().map(listing_from_row).collect())
    }

    /// Recompute integrity checks from the stored payload: entity ids
    /// present and unique, at least one label each, and relationship
    /// required fields non-empty.
    pub async fn validate_snapshot(&self, id: &str) -> Result<SnapshotValidation> {
        let record = self
            .load_record(id)
            .await?
            .ok_or_else(|| SnapshotError::NotFound(id.to_string()))?;
        let payload = Self::parse_payload(&record, id)?;

        let mut issues = Vec::new();
        let mut seen = HashSet::new();
        for entity in &payload.entities {
            if entity.id.is_empty() {
                issues.push("entity with empty id".to_string());
            }
            if entity.labels.is_empty() {
                issues.push(format!("entity {} has no labels", entity.id));
            }
            if !seen.insert(entity.id.clone()) {
                issues.push(format!("duplicate entity id {}", entity.id));
            }
        }
        for rel in &payload.relationships {
            if rel.source_id.is_empty() {
                issues.push("relationship with empty source id".to_string());
            }
            if rel.target_id.is_empty() {
                issues.push("relationship with empty target id".to_string());
            }
            if rel.rel_type.is_empty() {
                issues.push(format!(
                    "relationship {} -> {} has empty type",
                    rel.source_id, rel.target_id
                ));
            }
        }
        if !issues.is_empty() {
            warn!(%id, issue_count = issues.len(), "snapshot failed validation");
        }
        Ok(SnapshotValidation {
            valid: issues.is_empty(),
            issues,
        })
    }

    /// Delete a snapshot record. Returns whether a record existed.
    pub async fn delete_snapshot(&self, id: &str) -> Result<bool> {
        if self.load_record(id).await?.is_none() {
            return Ok(false);
        }
        self.executor
            .execute(
                "DELETE FROM Snapshot WHERE id = :id",
                Some(&[("id".to_string(), PropertyValue::Text(id.to_string()))]),
                QueryOptions::default(),
            )
            .await?;
        debug!(%id, "snapshot deleted");
        Ok(true)
    }

    /// Histograms and size for a snapshot, or `None` if it does not exist.
    pub async fn snapshot_stats(&self, id: &str) -> Result<Option<SnapshotStats>> {
        let Some(record) = self.load_record(id).await? else {
            return Ok(None);
        };
        let payload = Self::parse_payload(&record, id)?;
        let mut entities_by_label: HashMap<String, u64> = HashMap::new();
        for entity in &payload.entities {
            for label in &entity.labels {
                *entities_by_label.entry(label.clone()).or_default() += 1;
            }
        }
        let mut relationships_by_type: HashMap<String, u64> = HashMap::new();
        for rel in &payload.relationships {
            *relationships_by_type.entry(rel.rel_type.clone()).or_default() += 1;
        }
        let size_bytes = record
            .get("size_bytes")
            .and_then(PropertyValue::as_int)
            .unwrap_or(0) as u64;
        Ok(Some(SnapshotStats {
            entity_count: payload.entities.len() as u64,
            relationship_count: payload.relationships.len() as u64,
            size_bytes,
            entities_by_label,
            relationships_by_type,
        }))
    }
}

fn text_column(row: &Row, column: &str) -> String {
    row.get(column)
        .and_then(PropertyValue::as_text)
        .unwrap_or_default()
        .to_string()
}

fn listing_from_row(row: &Row) -> SnapshotListing {
    let created = row
        .get("created")
        .and_then(PropertyValue::as_text)
        .and_then(|text| DateTime::parse_from_rfc3339(text).ok())
        .map_or_else(Utc::now, |dt| dt.with_timezone(&Utc));
    SnapshotListing {
        id: text_column(row, "id"),
        repository: text_column(row, "repository"),
        branch: text_column(row, "branch"),
        description: row
            .get("description")
            .and_then(PropertyValue::as_text)
            .map(str::to_string),
        created,
        entity_count: row
            .get("entity_count")
            .and_then(PropertyValue::as_int)
            .unwrap_or(0) as u64,
        relationship_count: row
            .get("relationship_count")
            .and_then(PropertyValue::as_int)
            .unwrap_or(0) as u64,
        size_bytes: row
            .get("size_bytes")
            .and_then(PropertyValue::as_int)
            .unwrap_or(0) as u64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionManager, ConnectionSettings};
    use crate::schema::SchemaManager;

    async fn engine_in(dir: &std::path::Path) -> (Arc<QueryExecutor>, SnapshotEngine) {
        let manager = Arc::new(ConnectionManager::new(
            dir.to_path_buf(),
            dir.join("snap.db"),
            ConnectionSettings::default(),
        ));
        let executor = Arc::new(QueryExecutor::new(Arc::clone(&manager)));
        SchemaManager::new(Arc::clone(&executor))
            .initialize_schema()
            .await
            .unwrap();
        let transactions = Arc::new(TransactionManager::new(manager));
        let engine = SnapshotEngine::new(Arc::clone(&executor), transactions);
        (executor, engine)
    }

    async fn insert_node(executor: &QueryExecutor, table: &str, id: &str) {
        executor
            .execute(
                &format!(
                    "INSERT INTO {table} (id, repository, branch, properties)
                     VALUES (:id, 'repo', 'main', '{{\"name\":{{\"kind\":\"text\",\"value\":\"n\"}}}}')"
                ),
                Some(&[("id".to_string(), PropertyValue::Text(id.to_string()))]),
                QueryOptions::default(),
            )
            .await
            .unwrap();
    }

    async fn insert_edge(executor: &QueryExecutor, table: &str, source: &str, target: &str) {
        executor
            .execute(
                &format!(
                    "INSERT INTO {table} (source_id, target_id) VALUES (:source, :target)"
                ),
                Some(&[
                    ("source".to_string(), PropertyValue::Text(source.to_string())),
                    ("target".to_string(), PropertyValue::Text(target.to_string())),
                ]),
                QueryOptions::default(),
            )
            .await
            .unwrap();
    }

    async fn count(executor: &QueryExecutor, table: &str) -> i64 {
        let rows = executor
            .execute(
                &format!("SELECT count(*) AS n FROM {table}"),
                None,
                QueryOptions::default(),
            )
            .await
            .unwrap();
        rows[0].get("n").and_then(PropertyValue::as_int).unwrap()
    }

    #[tokio::test]
    async fn snapshot_round_trip_restores_deleted_graph() {
        let dir = tempfile::tempdir().unwrap();
        let (executor, engine) = engine_in(dir.path()).await;
        insert_node(&executor, "Component", "c1").await;
        insert_node(&executor, "Component", "c2").await;
        insert_node(&executor, "Decision", "d1").await;
        insert_edge(&executor, "DEPENDS_ON", "c1", "c2").await;
        insert_edge(&executor, "AFFECTS", "d1", "c1").await;

        let summary = engine
            .create_snapshot("repo", "main", Some("before wipe"))
            .await
            .unwrap();
        assert_eq!(summary.entity_count, 3);
        assert_eq!(summary.relationship_count, 2);

        for table in ["Component", "Decision", "DEPENDS_ON", "AFFECTS"] {
            executor
                .execute_simple(&format!("DELETE FROM {table}"))
                .await
                .unwrap();
        }
        assert_eq!(count(&executor, "Component").await, 0);

        let report = engine.rollback_to_snapshot(&summary.id).await.unwrap();
        assert!(report.success);
        assert_eq!(report.restored_entities, 3);
        assert_eq!(report.restored_relationships, 2);
        assert_eq!(count(&executor, "Component").await, 2);
        assert_eq!(count(&executor, "Decision").await, 1);
        assert_eq!(count(&executor, "DEPENDS_ON").await, 1);
        assert_eq!(count(&executor, "AFFECTS").await, 1);
    }

    #[tokio::test]
    async fn rollback_replaces_edges_that_outlived_their_endpoints() {
        let dir = tempfile::tempdir().unwrap();
        let (executor, engine) = engine_in(dir.path()).await;
        insert_node(&executor, "Component", "c1").await;
        insert_node(&executor, "Component", "c2").await;
        insert_edge(&executor, "DEPENDS_ON", "c1", "c2").await;

        let summary = engine.create_snapshot("repo", "main", None).await.unwrap();

        // Delete only the nodes; the edge row stays behind.
        executor.execute_simple("DELETE FROM Component").await.unwrap();
        assert_eq!(count(&executor, "Component").await, 0);
        assert_eq!(count(&executor, "DEPENDS_ON").await, 1);

        let report = engine.rollback_to_snapshot(&summary.id).await.unwrap();
        assert!(report.success);
        assert_eq!(report.restored_entities, 2);
        assert_eq!(report.restored_relationships, 1);
        assert_eq!(count(&executor, "Component").await, 2);
        assert_eq!(count(&executor, "DEPENDS_ON").await, 1);
    }

    #[tokio::test]
    async fn dangling_relationships_are_excluded_from_export() {
        let dir = tempfile::tempdir().unwrap();
        let (executor, engine) = engine_in(dir.path()).await;
        insert_node(&executor, "Component", "c1").await;
        // Edge whose target is out of scope.
        insert_edge(&executor, "DEPENDS_ON", "c1", "missing").await;

        let summary = engine.create_snapshot("repo", "main", None).await.unwrap();
        assert_eq!(summary.entity_count, 1);
        assert_eq!(summary.relationship_count, 0);
    }

    #[tokio::test]
    async fn duplicate_entity_ids_fail_validation_and_block_rollback() {
        let dir = tempfile::tempdir().unwrap();
        let (executor, engine) = engine_in(dir.path()).await;
        // Same id under two labels produces a duplicate in the export.
        insert_node(&executor, "Component", "x").await;
        insert_node(&executor, "Decision", "x").await;

        let summary = engine.create_snapshot("repo", "main", None).await.unwrap();
        let validation = engine.validate_snapshot(&summary.id).await.unwrap();
        assert!(!validation.valid);
        assert!(validation.issues.iter().any(|i| i.contains("duplicate")));

        let err = engine.rollback_to_snapshot(&summary.id).await.unwrap_err();
        assert!(matches!(
            err,
            crate::error::MemBankError::Snapshot(SnapshotError::Invalid { .. })
        ));
        // Nothing was deleted: the invalid snapshot was refused up front.
        assert_eq!(count(&executor, "Component").await, 1);
    }

    #[tokio::test]
    async fn rollback_of_unknown_id_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let (_executor, engine) = engine_in(dir.path()).await;
        let err = engine.rollback_to_snapshot("nope").await.unwrap_err();
        assert!(matches!(
            err,
            crate::error::MemBankError::Snapshot(SnapshotError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn listing_is_scoped_and_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let (executor, engine) = engine_in(dir.path()).await;
        insert_node(&executor, "Component", "c1").await;
        let first = engine.create_snapshot("repo", "main", Some("one")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = engine.create_snapshot("repo", "main", Some("two")).await.unwrap();
        engine.create_snapshot("other", "main", None).await.unwrap();

        let listed = engine.list_snapshots("repo", Some("main")).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, second.id);
        assert_eq!(listed[1].id, first.id);
        assert_eq!(engine.list_snapshots("other", None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn delete_reports_whether_record_existed() {
        let dir = tempfile::tempdir().unwrap();
        let (_executor, engine) = engine_in(dir.path()).await;
        let summary = engine.create_snapshot("repo", "main", None).await.unwrap();
        assert!(engine.delete_snapshot(&summary.id).await.unwrap());
        assert!(!engine.delete_snapshot(&summary.id).await.unwrap());
    }

    #[tokio::test]
    async fn stats_histogram_counts_by_label_and_type() {
        let dir = tempfile::tempdir().unwrap();
        let (executor, engine) = engine_in(dir.path()).await;
        insert_node(&executor, "Component", "c1").await;
        insert_node(&executor, "Component", "c2").await;
        insert_node(&executor, "Rule", "r1").await;
        insert_edge(&executor, "GOVERNS", "r1", "c1").await;
        let summary = engine.create_snapshot("repo", "main", None).await.unwrap();

        let stats = engine.snapshot_stats(&summary.id).await.unwrap().unwrap();
        assert_eq!(stats.entities_by_label.get("Component"), Some(&2));
        assert_eq!(stats.entities_by_label.get("Rule"), Some(&1));
        assert_eq!(stats.relationships_by_type.get("GOVERNS"), Some(&1));
        assert!(stats.size_bytes > 0);
        assert!(engine.snapshot_stats("nope").await.unwrap().is_none());
    }
}
