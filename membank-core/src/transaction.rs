//! Scoped multi-statement execution with explicit framing.
//!
//! A transaction takes an exclusive lease on the connection for its whole
//! lifetime, so statements submitted through the context can never
//! interleave with other callers. The active-transaction set is
//! bookkeeping only: every exit path removes the transaction's id, even
//! when rollback itself fails.

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::connection::{ConnectionLease, ConnectionManager};
use crate::error::{QueryError, Result, TransactionError};
use crate::value::{PropertyValue, Row};

/// A boxed transaction body, used by [`TransactionManager::sequential_transactions`].
pub type TransactionFn<T> =
    Box<dyn FnOnce(TransactionContext) -> BoxFuture<'static, Result<T>> + Send>;

/// Capability object valid only inside a transaction body.
///
/// All statements of the transaction must go through this context; calling
/// back into the executor from inside a transaction would deadlock on the
/// connection lease.
#[derive(Debug, Clone)]
pub struct TransactionContext {
    id: Uuid,
    session: Arc<AsyncMutex<ConnectionLease>>,
}

impl TransactionContext {
    /// Id tracked in the active-transaction set.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Execute a query, optionally parameterized, bound to the open
    /// transaction.
    pub async fn execute(
        &self,
        query: &str,
        params: Option<&[(String, PropertyValue)]>,
    ) -> Result<Vec<Row>> {
        let lease = self.session.lock().await;
        let result = match params {
            Some(params) if !params.is_empty() => {
                lease.connection().query_with_params(query, params)
            }
            _ => lease.connection().query(query),
        };
        result.map_err(QueryError::Engine).map_err(Into::into)
    }
}

/// Drives explicit transactions over the managed connection.
#[derive(Debug)]
pub struct TransactionManager {
    manager: Arc<ConnectionManager>,
    active: Arc<Mutex<HashSet<Uuid>>>,
}

impl TransactionManager {
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        Self {
            manager,
            active: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    fn track(&self, id: Uuid) {
        self.active
            .lock()
            .expect("active transaction set mutex poisoned")
            .insert(id);
    }

    fn untrack(&self, id: Uuid) {
        self.active
            .lock()
            .expect("active transaction set mutex poisoned")
            .remove(&id);
    }

    /// Run `body` inside an explicit transaction.
    ///
    /// On success the transaction commits; on any failure (including inside
    /// `body`) rollback is attempted and the original error is re-raised. A
    /// failed rollback is logged, never masks the triggering error, and
    /// never leaves a dangling active entry.
    pub async fn transaction<T, F, Fut>(&self, body: F) -> Result<T>
    where
        F: FnOnce(TransactionContext) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.manager.ensure_ready().await?;
        let lease = self.manager.lease().await?;
        lease
            .connection()
            .run("BEGIN")
            .map_err(TransactionError::Begin)?;

        let id = Uuid::new_v4();
        self.track(id);
        debug!(%id, "transaction started");

        let session = Arc::new(AsyncMutex::new(lease));
        let ctx = TransactionContext {
            id,
            session: Arc::clone(&session),
        };
        let outcome = body(ctx).await;

        let lease = session.lock().await;
        match outcome {
            Ok(value) => match lease.connection().run("COMMIT") {
                Ok(()) => {
                    self.untrack(id);
                    debug!(%id, "transaction committed");
                    Ok(value)
                }
                Err(source) => {
                    if let Err(rollback_err) = lease.connection().run("ROLLBACK") {
                        warn!(%id, %rollback_err, "rollback after failed commit also failed");
                    }
                    self.untrack(id);
                    Err(TransactionError::Commit(source).into())
                }
            },
            Err(err) => {
                if let Err(rollback_err) = lease.connection().run("ROLLBACK") {
                    warn!(%id, %rollback_err, "rollback failed after transaction error");
                }
                self.untrack(id);
                debug!(%id, "transaction rolled back");
                Err(err)
            }
        }
    }

    /// Re-run the whole transaction up to `max_retries` times with a fixed
    /// delay between attempts, surfacing the last error if all fail.
    pub async fn transaction_with_retry<T, F, Fut>(
        &self,
        body: F,
        max_retries: u32,
        delay: Duration,
    ) -> Result<T>
    where
        F: Fn(TransactionContext) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = max_retries.max(1);
        let mut last_err = None;
        for attempt in 1..=attempts {
            match self.transaction(&body).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    warn!(attempt, attempts, %err, "transaction attempt failed");
                    last_err = Some(err);
                    if attempt < attempts {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
        Err(last_err.expect("at least one attempt ran"))
    }

    /// Run transactions one after another, stopping at the first failure.
    pub async fn sequential_transactions<T>(
        &self,
        bodies: Vec<TransactionFn<T>>,
    ) -> Result<Vec<T>> {
        let mut results = Vec::with_capacity(bodies.len());
        for body in bodies {
            results.push(self.transaction(body).await?);
        }
        Ok(results)
    }

    /// Give `body` a uniform execution-context shape without transaction
    /// framing. No begin/commit/rollback is issued and no id is tracked.
    pub async fn read_only_transaction<T, F, Fut>(&self, body: F) -> Result<T>
    where
        F: FnOnce(TransactionContext) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.manager.ensure_ready().await?;
        let lease = self.manager.lease().await?;
        let ctx = TransactionContext {
            id: Uuid::new_v4(),
            session: Arc::new(AsyncMutex::new(lease)),
        };
        body(ctx).await
    }

    /// Whether any transaction id is currently tracked.
    pub fn has_active_transactions(&self) -> bool {
        !self
            .active
            .lock()
            .expect("active transaction set mutex poisoned")
            .is_empty()
    }

    /// Emergency rollback: issue a ROLLBACK if the connection can be
    /// grabbed, then unconditionally clear the active set. The set's job is
    /// bookkeeping, not correctness enforcement.
    pub async fn force_rollback_all(&self) {
        match self.manager.try_lease() {
            Some(lease) => {
                if let Err(err) = lease.connection().run("ROLLBACK") {
                    warn!(%err, "forced rollback failed");
                }
            }
            None => warn!("connection busy or uninitialized; skipping forced rollback"),
        }
        self.active
            .lock()
            .expect("active transaction set mutex poisoned")
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::connection::ConnectionSettings;
    use crate::error::MemBankError;
    use crate::executor::{QueryExecutor, QueryOptions};

    async fn setup(dir: &std::path::Path) -> (Arc<QueryExecutor>, TransactionManager) {
        let manager = Arc::new(ConnectionManager::new(
            dir.to_path_buf(),
            dir.join("tx.db"),
            ConnectionSettings::default(),
        ));
        let executor = Arc::new(QueryExecutor::new(Arc::clone(&manager)));
        executor
            .execute_simple("CREATE TABLE IF NOT EXISTS items (id TEXT PRIMARY KEY)")
            .await
            .unwrap();
        (executor, TransactionManager::new(manager))
    }

    async fn count_items(executor: &QueryExecutor) -> i64 {
        let rows = executor
            .execute("SELECT count(*) AS n FROM items", None, QueryOptions::default())
            .await
            .unwrap();
        rows[0].get("n").and_then(PropertyValue::as_int).unwrap()
    }

    #[tokio::test]
    async fn committed_transaction_persists_writes() {
        let dir = tempfile::tempdir().unwrap();
        let (executor, tx) = setup(dir.path()).await;
        tx.transaction(|ctx| async move {
            ctx.execute("INSERT INTO items (id) VALUES ('a')", None).await?;
            ctx.execute("INSERT INTO items (id) VALUES ('b')", None).await?;
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(count_items(&executor).await, 2);
        assert!(!tx.has_active_transactions());
    }

    #[tokio::test]
    async fn failing_body_leaves_state_unchanged_and_set_empty() {
        let dir = tempfile::tempdir().unwrap();
        let (executor, tx) = setup(dir.path()).await;
        let result: Result<()> = tx
            .transaction(|ctx| async move {
                ctx.execute("INSERT INTO items (id) VALUES ('a')", None).await?;
                Err(MemBankError::Snapshot(crate::error::SnapshotError::Restore(
                    "boom".into(),
                )))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(count_items(&executor).await, 0);
        assert!(!tx.has_active_transactions());
    }

    #[tokio::test]
    async fn retry_runs_at_most_n_times_and_surfaces_last_error() {
        let dir = tempfile::tempdir().unwrap();
        let (_executor, tx) = setup(dir.path()).await;
        let attempts = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&attempts);
        let result: Result<()> = tx
            .transaction_with_retry(
                move |_ctx| {
                    let seen = Arc::clone(&seen);
                    async move {
                        seen.fetch_add(1, Ordering::SeqCst);
                        Err(MemBankError::Snapshot(
                            crate::error::SnapshotError::Restore("always fails".into()),
                        ))
                    }
                },
                3,
                Duration::from_millis(1),
            )
            .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_stops_after_first_success() {
        let dir = tempfile::tempdir().unwrap();
        let (_executor, tx) = setup(dir.path()).await;
        let attempts = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&attempts);
        tx.transaction_with_retry(
            move |_ctx| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
            5,
            Duration::from_millis(1),
        )
        .await
        .unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn sequential_transactions_preserve_order_and_stop_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let (executor, tx) = setup(dir.path()).await;
        let bodies: Vec<TransactionFn<()>> = vec![
            Box::new(|ctx| {
                Box::pin(async move {
                    ctx.execute("INSERT INTO items (id) VALUES ('first')", None).await?;
                    Ok(())
                })
            }),
            Box::new(|ctx| {
                Box::pin(async move {
                    // Duplicate key, fails and rolls back this transaction only.
                    ctx.execute("INSERT INTO items (id) VALUES ('first')", None).await?;
                    Ok(())
                })
            }),
            Box::new(|ctx| {
                Box::pin(async move {
                    ctx.execute("INSERT INTO items (id) VALUES ('never')", None).await?;
                    Ok(())
                })
            }),
        ];
        assert!(tx.sequential_transactions(bodies).await.is_err());
        assert_eq!(count_items(&executor).await, 1);
    }

    #[tokio::test]
    async fn read_only_transaction_skips_framing() {
        let dir = tempfile::tempdir().unwrap();
        let (_executor, tx) = setup(dir.path()).await;
        let n = tx
            .read_only_transaction(|ctx| async move {
                let rows = ctx.execute("SELECT count(*) AS n FROM items", None).await?;
                Ok(rows[0].get("n").and_then(PropertyValue::as_int).unwrap_or(-1))
            })
            .await
            .unwrap();
        assert_eq!(n, 0);
        assert!(!tx.has_active_transactions());
    }

    #[tokio::test]
    async fn force_rollback_all_clears_the_set() {
        let dir = tempfile::tempdir().unwrap();
        let (_executor, tx) = setup(dir.path()).await;
        tx.force_rollback_all().await;
        assert!(!tx.has_active_transactions());
    }
}
