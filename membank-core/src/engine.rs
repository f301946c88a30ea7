//! Thin wrapper over the embedded database driver.
//!
//! This module is the only place that talks to `rusqlite` directly. It
//! exposes the narrow surface the rest of the core consumes: open a
//! database file, derive a connection from it, run statements through a
//! simple or a prepare-then-execute path, and introspect the catalog.
//! Cursor-style results are always materialized into plain rows before
//! they leave this module.

use std::path::{Path, PathBuf};

use crate::value::{PropertyValue, Row};

/// An opened database file. Opaque to callers; connections are derived
/// from it via [`Database::connect`].
#[derive(Debug)]
pub struct Database {
    path: PathBuf,
}

impl Database {
    /// Open the database file, creating it if absent.
    ///
    /// A short-lived probe connection surfaces unreadable or corrupt files
    /// at open time rather than on first query.
    pub fn open(path: &Path) -> rusqlite::Result<Self> {
        let probe = rusqlite::Connection::open(path)?;
        probe.close().map_err(|(_, err)| err)?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    /// Derive a connection from the opened database.
    pub fn connect(&self) -> rusqlite::Result<Connection> {
        let inner = rusqlite::Connection::open(&self.path)?;
        inner.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA synchronous = NORMAL;",
        )?;
        // WAL is best-effort; some filesystems reject it.
        let _ = inner.execute_batch("PRAGMA journal_mode = WAL;");
        Ok(Connection { inner })
    }

    /// Path of the underlying database file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// A live connection handle. Exclusively owned by its `ConnectionManager`.
#[derive(Debug)]
pub struct Connection {
    inner: rusqlite::Connection,
}

impl Connection {
    /// Run one or more statements with no result and no parameters.
    /// Control statements (BEGIN/COMMIT/ROLLBACK) and DDL go through here.
    pub fn run(&self, sql: &str) -> rusqlite::Result<()> {
        self.inner.execute_batch(sql)
    }

    /// Execute a single statement, returning the number of affected rows.
    pub fn execute(&self, sql: &str) -> rusqlite::Result<usize> {
        self.inner.execute(sql, [])
    }

    /// Run a query through the no-parameter path, materializing all rows.
    pub fn query(&self, sql: &str) -> rusqlite::Result<Vec<Row>> {
        let mut stmt = self.inner.prepare(sql)?;
        collect_rows(&mut stmt, [])
    }

    /// Run a query through the prepare-then-execute path with named
    /// parameters. Parameter objects must not be routed through the simple
    /// path; the driver cannot bind them there.
    pub fn query_with_params(
        &self,
        sql: &str,
        params: &[(String, PropertyValue)],
    ) -> rusqlite::Result<Vec<Row>> {
        let mut stmt = self.inner.prepare(sql)?;
        let names: Vec<String> = params.iter().map(|(name, _)| qualify(name)).collect();
        let bound: Vec<(&str, &dyn rusqlite::types::ToSql)> = names
            .iter()
            .zip(params.iter())
            .map(|(name, (_, value))| (name.as_str(), value as &dyn rusqlite::types::ToSql))
            .collect();
        collect_rows(&mut stmt, bound.as_slice())
    }

    /// List user tables from the engine catalog.
    pub fn table_names(&self) -> rusqlite::Result<Vec<String>> {
        let mut stmt = self.inner.prepare(
            "SELECT name FROM sqlite_master
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
             ORDER BY name",
        )?;
        stmt.query_map([], |row| row.get(0))?.collect()
    }

    /// Column names of a table, from the engine's table-info procedure.
    pub fn table_columns(&self, table: &str) -> rusqlite::Result<Vec<String>> {
        let mut stmt = self
            .inner
            .prepare("SELECT name FROM pragma_table_info(?1)")?;
        stmt.query_map([table], |row| row.get(0))?.collect()
    }

    /// Whether a loadable module (e.g. full-text search) is compiled in.
    pub fn module_available(&self, name: &str) -> rusqlite::Result<bool> {
        let mut stmt = self
            .inner
            .prepare("SELECT count(*) FROM pragma_module_list WHERE name = ?1")?;
        let count: i64 = stmt.query_row([name], |row| row.get(0))?;
        Ok(count > 0)
    }
}

/// Prefix a bare parameter name so it matches the statement's `:name` form.
fn qualify(name: &str) -> String {
    if name.starts_with(':') || name.starts_with('@') || name.starts_with('$') {
        name.to_string()
    } else {
        format!(":{name}")
    }
}

/// Materialize a prepared statement's cursor into plain rows.
fn collect_rows(
    stmt: &mut rusqlite::Statement<'_>,
    params: impl rusqlite::Params,
) -> rusqlite::Result<Vec<Row>> {
    let columns: Vec<String> = stmt
        .column_names()
        .iter()
        .map(ToString::to_string)
        .collect();
    let mut rows = stmt.query(params)?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut record = Row::with_capacity(columns.len());
        for (index, name) in columns.iter().enumerate() {
            record.insert(name.clone(), PropertyValue::from_sql_ref(row.get_ref(index)?));
        }
        out.push(record);
    }
    Ok(out)
}
