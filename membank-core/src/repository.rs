//! Typed repositories: one thin CRUD surface per entity kind.
//!
//! Repositories never talk to the engine directly; every statement goes
//! through the shared [`Client`] so connection health, reinitialization,
//! and locking stay in one place.

use std::sync::Arc;

use async_trait::async_trait;

use crate::client::Client;
use crate::error::Result;
use crate::executor::QueryOptions;
use crate::value::{properties_from_json, properties_to_json, PropertyMap, PropertyValue, Row};

/// Entity kinds exposed through typed repositories.
///
/// `Repository`, `Metadata`, and `Snapshot` nodes are managed by the store
/// itself and deliberately have no repository here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Component,
    Decision,
    Rule,
    File,
    Tag,
    Context,
}

impl EntityKind {
    /// All kinds with a typed repository.
    pub const ALL: [Self; 6] = [
        Self::Component,
        Self::Decision,
        Self::Rule,
        Self::File,
        Self::Tag,
        Self::Context,
    ];

    /// Node table backing this kind.
    pub fn table(self) -> &'static str {
        match self {
            Self::Component => "Component",
            Self::Decision => "Decision",
            Self::Rule => "Rule",
            Self::File => "File",
            Self::Tag => "Tag",
            Self::Context => "Context",
        }
    }
}

/// A stored entity: identity, scope, and its property bag.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    pub id: String,
    pub repository: String,
    pub branch: String,
    pub properties: PropertyMap,
}

/// CRUD surface shared by every typed repository.
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Insert the entity, or replace it wholesale if the id exists.
    async fn upsert(&self, entity: &Entity) -> Result<()>;

    /// Fetch one entity by id.
    async fn get(&self, id: &str) -> Result<Option<Entity>>;

    /// All entities in a (repository, branch) scope.
    async fn find_in_scope(&self, repository: &str, branch: &str) -> Result<Vec<Entity>>;

    /// Delete by id, reporting whether the entity existed.
    async fn delete(&self, id: &str) -> Result<bool>;
}

/// Typed repository for one [`EntityKind`], bound to one client.
#[derive(Debug)]
pub struct EntityRepository {
    kind: EntityKind,
    client: Arc<Client>,
}

impl EntityRepository {
    pub fn new(kind: EntityKind, client: Arc<Client>) -> Self {
        Self { kind, client }
    }

    /// The kind this repository serves.
    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    fn entity_from_row(&self, row: &Row) -> Entity {
        let text = |column: &str| {
            row.get(column)
                .and_then(PropertyValue::as_text)
                .unwrap_or_default()
                .to_string()
        };
        Entity {
            id: text("id"),
            repository: text("repository"),
            branch: text("branch"),
            properties: row
                .get("properties")
                .and_then(PropertyValue::as_text)
                .map(properties_from_json)
                .unwrap_or_default(),
        }
    }
}

#[async_trait]
impl EntityStore for EntityRepository {
    async fn upsert(&self, entity: &Entity) -> Result<()> {
        let properties = properties_to_json(&entity.properties)
            .map_err(crate::error::QueryError::Properties)?;
        let params = vec![
            ("id".to_string(), PropertyValue::Text(entity.id.clone())),
            (
                "repository".to_string(),
                PropertyValue::Text(entity.repository.clone()),
            ),
            (
                "branch".to_string(),
                PropertyValue::Text(entity.branch.clone()),
            ),
            ("properties".to_string(), PropertyValue::Text(properties)),
        ];
        self.client
            .execute_query(
                &format!(
                    "INSERT OR REPLACE INTO {} (id, repository, branch, properties)
                     VALUES (:id, :repository, :branch, :properties)",
                    self.kind.table()
                ),
                Some(&params),
                QueryOptions::default(),
            )
            .await?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Entity>> {
        let rows = self
            .client
            .execute_query(
                &format!(
                    "SELECT id, repository, branch, properties FROM {} WHERE id = :id",
                    self.kind.table()
                ),
                Some(&[("id".to_string(), PropertyValue::Text(id.to_string()))]),
                QueryOptions::default(),
            )
            .await?;
        Ok(rows.first().map(|row| self.entity_from_row(row)))
    }

    async fn find_in_scope(&self, repository: &str, branch: &str) -> Result<Vec<Entity>> {
        let params = vec![
            (
                "repository".to_string(),
                PropertyValue::Text(repository.to_string()),
            ),
            ("branch".to_string(), PropertyValue::Text(branch.to_string())),
        ];
        let rows = self
            .client
            .execute_query(
                &format!(
                    "SELECT id, repository, branch, properties FROM {}
                     WHERE repository = :repository AND branch = :branch
                     ORDER BY id",
                    self.kind.table()
                ),
                Some(&params),
                QueryOptions::default(),
            )
            .await?;
        Ok(rows.iter().map(|row| self.entity_from_row(row)).collect())
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        if self.get(id).await?.is_none() {
            return Ok(false);
        }
        self.client
            .execute_query(
                &format!("DELETE FROM {} WHERE id = :id", self.kind.table()),
                Some(&[("id".to_string(), PropertyValue::Text(id.to_string()))]),
                QueryOptions::default(),
            )
            .await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::get_or_create_client;

    fn entity(id: &str) -> Entity {
        let mut properties = PropertyMap::new();
        properties.insert("name".into(), PropertyValue::Text(id.to_string()));
        Entity {
            id: id.to_string(),
            repository: "repo".to_string(),
            branch: "main".to_string(),
            properties,
        }
    }

    #[tokio::test]
    async fn upsert_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let client = get_or_create_client(dir.path()).await.unwrap();
        let repo = EntityRepository::new(EntityKind::Component, client);

        let original = entity("comp-1");
        repo.upsert(&original).await.unwrap();
        let fetched = repo.get("comp-1").await.unwrap().unwrap();
        assert_eq!(fetched, original);
        assert!(repo.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn upsert_replaces_existing_properties() {
        let dir = tempfile::tempdir().unwrap();
        let client = get_or_create_client(dir.path()).await.unwrap();
        let repo = EntityRepository::new(EntityKind::Decision, client);

        repo.upsert(&entity("d1")).await.unwrap();
        let mut updated = entity("d1");
        updated
            .properties
            .insert("status".into(), PropertyValue::Text("accepted".into()));
        repo.upsert(&updated).await.unwrap();

        let fetched = repo.get("d1").await.unwrap().unwrap();
        assert_eq!(
            fetched.properties.get("status"),
            Some(&PropertyValue::Text("accepted".into()))
        );
    }

    #[tokio::test]
    async fn scope_query_filters_by_repository_and_branch() {
        let dir = tempfile::tempdir().unwrap();
        let client = get_or_create_client(dir.path()).await.unwrap();
        let repo = EntityRepository::new(EntityKind::Rule, client);

        repo.upsert(&entity("r1")).await.unwrap();
        let mut other_branch = entity("r2");
        other_branch.branch = "feature".to_string();
        repo.upsert(&other_branch).await.unwrap();

        let in_main = repo.find_in_scope("repo", "main").await.unwrap();
        assert_eq!(in_main.len(), 1);
        assert_eq!(in_main[0].id, "r1");
        assert_eq!(repo.find_in_scope("repo", "feature").await.unwrap().len(), 1);
        assert!(repo.find_in_scope("other", "main").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_reports_existence() {
        let dir = tempfile::tempdir().unwrap();
        let client = get_or_create_client(dir.path()).await.unwrap();
        let repo = EntityRepository::new(EntityKind::Tag, client);

        repo.upsert(&entity("t1")).await.unwrap();
        assert!(repo.delete("t1").await.unwrap());
        assert!(!repo.delete("t1").await.unwrap());
        assert!(repo.get("t1").await.unwrap().is_none());
    }
}
