//! Uniform query-execution surface over a [`ConnectionManager`].
//!
//! Every call validates the connection first and transparently
//! reinitializes it when invalid, so callers never see a stale-connection
//! error under normal operation.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::connection::{ConnectionLease, ConnectionManager};
use crate::error::{QueryError, Result};
use crate::value::{PropertyValue, Row};

/// Per-call execution options.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryOptions {
    /// Bound on the caller's wait. The in-flight native call is abandoned
    /// on expiry, not cancelled.
    pub timeout: Option<Duration>,
}

/// Catalog-derived table listing, split by shape.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CatalogInfo {
    /// Node tables (entity storage).
    pub tables: Vec<String>,
    /// Relationship tables (recognized by their endpoint columns).
    pub relationships: Vec<String>,
}

/// Executes queries against the managed connection.
#[derive(Debug)]
pub struct QueryExecutor {
    manager: Arc<ConnectionManager>,
}

impl QueryExecutor {
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        Self { manager }
    }

    /// The connection manager backing this executor.
    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// Execute a query, optionally parameterized and timeout-bounded,
    /// returning materialized rows.
    pub async fn execute(
        &self,
        query: &str,
        params: Option<&[(String, PropertyValue)]>,
        options: QueryOptions,
    ) -> Result<Vec<Row>> {
        self.manager.ensure_ready().await?;
        let lease = self.manager.lease().await?;

        match options.timeout {
            None => run_on_lease(&lease, query, params)
                .map_err(QueryError::Engine)
                .map_err(Into::into),
            Some(timeout) => {
                let sql = query.to_string();
                let params: Option<Vec<(String, PropertyValue)>> = params.map(<[_]>::to_vec);
                let task = tokio::task::spawn_blocking(move || {
                    run_on_lease(&lease, &sql, params.as_deref())
                });
                match tokio::time::timeout(timeout, task).await {
                    Ok(Ok(rows)) => rows.map_err(QueryError::Engine).map_err(Into::into),
                    Ok(Err(_join)) => Err(QueryError::Interrupted.into()),
                    Err(_elapsed) => {
                        debug!(timeout_ms = timeout.as_millis() as u64, "query abandoned on timeout");
                        Err(QueryError::Timeout {
                            timeout_ms: timeout.as_millis() as u64,
                        }
                        .into())
                    }
                }
            }
        }
    }

    /// Execute a single statement through the no-parameter path, returning
    /// the raw affected-row count.
    pub async fn execute_simple(&self, query: &str) -> Result<usize> {
        self.manager.ensure_ready().await?;
        let lease = self.manager.lease().await?;
        lease
            .connection()
            .execute(query)
            .map_err(QueryError::Engine)
            .map_err(Into::into)
    }

    /// Execute statements strictly in order, short-circuiting on the first
    /// failure; the error reports how many statements completed.
    pub async fn execute_batch(&self, queries: &[String]) -> Result<Vec<usize>> {
        self.manager.ensure_ready().await?;
        let lease = self.manager.lease().await?;
        let mut completed = Vec::with_capacity(queries.len());
        for (index, query) in queries.iter().enumerate() {
            match lease.connection().execute(query) {
                Ok(affected) => completed.push(affected),
                Err(source) => {
                    return Err(QueryError::Batch {
                        index,
                        completed: completed.len(),
                        source,
                    }
                    .into());
                }
            }
        }
        Ok(completed)
    }

    /// Whether a table exists in the engine catalog.
    pub async fn table_exists(&self, name: &str) -> Result<bool> {
        self.manager.ensure_ready().await?;
        let lease = self.manager.lease().await?;
        let tables = lease
            .connection()
            .table_names()
            .map_err(QueryError::Engine)?;
        Ok(tables.iter().any(|table| table == name))
    }

    /// Whether a loadable engine module (e.g. full-text search) is
    /// compiled in.
    pub async fn module_available(&self, name: &str) -> Result<bool> {
        self.manager.ensure_ready().await?;
        let lease = self.manager.lease().await?;
        lease
            .connection()
            .module_available(name)
            .map_err(QueryError::Engine)
            .map_err(Into::into)
    }

    /// List tables from the live catalog, classifying relationship tables
    /// by their endpoint-column shape rather than by any static descriptor.
    pub async fn schema_info(&self) -> Result<CatalogInfo> {
        self.manager.ensure_ready().await?;
        let lease = self.manager.lease().await?;
        let connection = lease.connection();
        let mut info = CatalogInfo::default();
        for table in connection.table_names().map_err(QueryError::Engine)? {
            let columns = connection
                .table_columns(&table)
                .map_err(QueryError::Engine)?;
            let is_relationship = columns.iter().any(|c| c == "source_id")
                && columns.iter().any(|c| c == "target_id");
            if is_relationship {
                info.relationships.push(table);
            } else {
                info.tables.push(table);
            }
        }
        Ok(info)
    }
}

fn run_on_lease(
    lease: &ConnectionLease,
    sql: &str,
    params: Option<&[(String, PropertyValue)]>,
) -> rusqlite::Result<Vec<Row>> {
    match params {
        Some(params) if !params.is_empty() => lease.connection().query_with_params(sql, params),
        _ => lease.connection().query(sql),
    }
}
