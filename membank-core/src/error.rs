use std::path::PathBuf;
use std::sync::Arc;

/// Top-level Membank error type.
///
/// All fallible operations in `membank-core` return [`Result<T, MemBankError>`](Result).
/// Each variant wraps a domain-specific error enum, allowing callers to
/// match on the error source without losing type information.
#[derive(thiserror::Error, Debug)]
pub enum MemBankError {
    /// Error in the connection lifecycle (open, connect, validation, locks).
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Error executing a query or batch.
    #[error("Query error: {0}")]
    Query(#[from] QueryError),

    /// Error in explicit transaction framing (begin/commit/rollback).
    #[error("Transaction error: {0}")]
    Transaction(#[from] TransactionError),

    /// Error during schema bootstrap or extension setup.
    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    /// Error in the snapshot engine (export, restore, validation).
    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    /// Error from the repository cache (tenant bookkeeping).
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    /// Error in configuration parsing or validation.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A shared initialization outcome observed by a concurrent caller.
    ///
    /// When several callers await the same in-flight client initialization,
    /// they all receive the single failure behind an `Arc`.
    #[error("{0}")]
    Shared(Arc<MemBankError>),
}

/// Errors in the connection lifecycle.
#[derive(thiserror::Error, Debug)]
pub enum ConnectionError {
    /// The embedded database file could not be opened.
    #[error("Failed to open database at {path}: {source}")]
    Open {
        /// Path of the database file.
        path: PathBuf,
        /// Underlying driver error.
        #[source]
        source: rusqlite::Error,
    },

    /// A connection to an opened database could not be established.
    #[error("Failed to connect to database at {path}: {source}")]
    Connect {
        /// Path of the database file.
        path: PathBuf,
        /// Underlying driver error.
        #[source]
        source: rusqlite::Error,
    },

    /// An operation required a live connection but none exists.
    #[error("Connection is not initialized")]
    NotInitialized,

    /// The liveness probe after open/connect failed.
    #[error("Connection validation failed: {0}")]
    ValidationFailed(String),

    /// The database directory could not be created or accessed.
    #[error("Database directory {path} is not accessible: {source}")]
    DirectoryAccess {
        /// Directory that failed the access check.
        path: PathBuf,
        /// Underlying filesystem error.
        #[source]
        source: std::io::Error,
    },
}

/// Errors executing queries.
#[derive(thiserror::Error, Debug)]
pub enum QueryError {
    /// The underlying engine rejected or failed the statement.
    #[error("Query failed: {0}")]
    Engine(#[from] rusqlite::Error),

    /// The caller-supplied timeout elapsed before the query returned.
    ///
    /// The in-flight native call is abandoned, not cancelled; only the
    /// caller's wait is bounded.
    #[error("Query timed out after {timeout_ms} ms")]
    Timeout {
        /// Timeout that was exceeded, in milliseconds.
        timeout_ms: u64,
    },

    /// A batch stopped at the first failing statement.
    #[error("Batch failed at statement {index} after {completed} completed: {source}")]
    Batch {
        /// Zero-based index of the failing statement.
        index: usize,
        /// Number of statements that completed before the failure.
        completed: usize,
        /// Underlying driver error.
        #[source]
        source: rusqlite::Error,
    },

    /// The worker running the query terminated without producing a result.
    #[error("Query execution was interrupted")]
    Interrupted,

    /// A property bag could not be serialized for storage.
    #[error("Property serialization failed: {0}")]
    Properties(#[source] serde_json::Error),
}

/// Errors in explicit transaction framing.
#[derive(thiserror::Error, Debug)]
pub enum TransactionError {
    /// BEGIN failed.
    #[error("Failed to begin transaction: {0}")]
    Begin(#[source] rusqlite::Error),

    /// COMMIT failed.
    #[error("Failed to commit transaction: {0}")]
    Commit(#[source] rusqlite::Error),

    /// ROLLBACK failed.
    #[error("Failed to roll back transaction: {0}")]
    Rollback(#[source] rusqlite::Error),
}

/// Errors during schema bootstrap.
#[derive(thiserror::Error, Debug)]
pub enum SchemaError {
    /// An optional extension failed in a way other than "not supported".
    #[error("Extension setup failed for {name}: {source}")]
    Extension {
        /// Extension name from the descriptor.
        name: String,
        /// Underlying driver error.
        #[source]
        source: rusqlite::Error,
    },

    /// A node table could not be created.
    #[error("Failed to create node table {table}: {source}")]
    NodeTable {
        /// Table name from the descriptor.
        table: String,
        /// Error surfaced by the executor.
        #[source]
        source: Box<MemBankError>,
    },

    /// A relationship table could not be created.
    #[error("Failed to create relationship table {table}: {source}")]
    RelationshipTable {
        /// Table name from the descriptor.
        table: String,
        /// Error surfaced by the executor.
        #[source]
        source: Box<MemBankError>,
    },
}

/// Errors in the snapshot engine.
#[derive(thiserror::Error, Debug)]
pub enum SnapshotError {
    /// No snapshot record exists for the given id.
    #[error("Snapshot not found: {0}")]
    NotFound(String),

    /// The snapshot payload failed integrity validation.
    #[error("Snapshot {id} failed validation: {issues:?}")]
    Invalid {
        /// Id of the offending snapshot.
        id: String,
        /// All detected integrity issues.
        issues: Vec<String>,
    },

    /// The payload could not be serialized or deserialized.
    #[error("Snapshot payload serialization failed: {0}")]
    Payload(#[from] serde_json::Error),

    /// Restore aborted; the graph was left untouched.
    #[error("Restore failed: {0}")]
    Restore(String),
}

/// Errors from the repository cache.
#[derive(thiserror::Error, Debug)]
pub enum CacheError {
    /// A repository was requested before `initialize_repositories` for its root.
    #[error("Repositories are not initialized for project root {0}")]
    NotInitialized(PathBuf),
}

/// Errors in Membank configuration parsing and validation.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    /// The configuration file does not exist at the expected path.
    #[error("Config file not found: {0}")]
    NotFound(String),

    /// Configuration values are present but semantically invalid.
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// Configuration file syntax could not be parsed (TOML error).
    #[error("Parse error: {0}")]
    Parse(String),
}

/// Convenience alias for `Result<T, MemBankError>`.
pub type Result<T> = std::result::Result<T, MemBankError>;
