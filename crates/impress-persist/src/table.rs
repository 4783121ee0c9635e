//! Table creation and lazy schema evolution.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, PoisonError};

use rusqlite::Connection;

use crate::config::TableCreatedCallback;
use crate::entity::EntityMetadata;
use crate::error::{DbError, Result};
use crate::manager::execute;
use crate::sql_builder;
use crate::sql_info::quote_identifier;
use crate::value::ColumnKind;

/// Result of [`TableManager::ensure_table`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
    /// The table did not exist and was created.
    Created,
    /// The table already existed in the file; missing columns were added.
    Existing,
    /// The table was already verified on this connection. No SQL was run.
    Known,
}

/// Tracks which tables have been verified on one connection.
#[derive(Debug, Default)]
pub struct TableManager {
    known: Mutex<HashSet<String>>,
}

impl TableManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Guarantee the entity's table exists with every mapped column.
    pub fn ensure_table<E>(
        &self,
        conn: &Connection,
        meta: &EntityMetadata<E>,
        on_created: Option<&TableCreatedCallback>,
    ) -> Result<EnsureOutcome> {
        let key = meta.table().to_ascii_lowercase();
        if self.is_known(&key) {
            return Ok(EnsureOutcome::Known);
        }

        let outcome = if table_exists(conn, meta.table())? {
            let existing = existing_columns(conn, meta.table())?;
            for column in meta.columns() {
                match existing.get(&column.name.to_ascii_lowercase()) {
                    None => {
                        add_column_if_missing(
                            conn,
                            meta.table(),
                            &sql_builder::column_definition(column),
                        );
                    }
                    Some(&declared) if declared != column.kind => {
                        tracing::warn!(
                            table = meta.table(),
                            column = %column.name,
                            declared = %declared,
                            mapped = %column.kind,
                            "column type differs from mapping"
                        );
                    }
                    Some(_) => {}
                }
            }
            EnsureOutcome::Existing
        } else {
            create_table(conn, meta, on_created)?;
            EnsureOutcome::Created
        };

        self.known
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key);
        Ok(outcome)
    }

    pub fn is_known(&self, table: &str) -> bool {
        self.known
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&table.to_ascii_lowercase())
    }

    /// Forget a table so the next use re-verifies it.
    pub fn forget(&self, table: &str) {
        self.known
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&table.to_ascii_lowercase());
    }

    pub fn clear(&self) {
        self.known
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

// Creation, post-create SQL and the callback run in one savepoint.
fn create_table<E>(
    conn: &Connection,
    meta: &EntityMetadata<E>,
    on_created: Option<&TableCreatedCallback>,
) -> Result<()> {
    conn.execute_batch("SAVEPOINT impress_create_table")?;
    let result = create_table_body(conn, meta, on_created);

    match result {
        Ok(()) => {
            conn.execute_batch("RELEASE impress_create_table")?;
            tracing::debug!(table = meta.table(), "created table");
            Ok(())
        }
        Err(e) => {
            if let Err(rollback) = conn
                .execute_batch("ROLLBACK TO impress_create_table; RELEASE impress_create_table")
            {
                tracing::warn!(table = meta.table(), error = %rollback, "rollback of table creation failed");
            }
            Err(e)
        }
    }
}

fn create_table_body<E>(
    conn: &Connection,
    meta: &EntityMetadata<E>,
    on_created: Option<&TableCreatedCallback>,
) -> Result<()> {
    execute(conn, &sql_builder::create_table(meta), &[])?;
    for sql in meta.post_create() {
        tracing::debug!(table = meta.table(), sql = %sql, "post-create");
        conn.execute_batch(sql)
            .map_err(|e| DbError::statement(sql, &[], e))?;
    }
    if let Some(callback) = on_created {
        callback(conn, meta.table())?;
    }
    Ok(())
}

/// Whether a table with this name exists in the database file.
pub fn table_exists(conn: &Connection, table: &str) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1 COLLATE NOCASE",
        [table],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Columns of an existing table, lowercased name to declared kind.
pub fn existing_columns(conn: &Connection, table: &str) -> Result<HashMap<String, ColumnKind>> {
    let sql = format!("PRAGMA table_info({})", quote_identifier(table));
    let mut stmt = conn.prepare(&sql).map_err(|e| DbError::statement(&sql, &[], e))?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, String>(1)?, row.get::<_, String>(2)?)))
        .map_err(|e| DbError::statement(&sql, &[], e))?;
    let mut columns = HashMap::new();
    for row in rows {
        let (name, declared) = row?;
        columns.insert(name.to_ascii_lowercase(), ColumnKind::from_declared(&declared));
    }
    Ok(columns)
}

/// Best-effort `ALTER TABLE ... ADD COLUMN`.
///
/// Returns whether the column was added. Failures (duplicate column, a NOT
/// NULL column without default on a populated table) are logged and
/// swallowed.
pub fn add_column_if_missing(conn: &Connection, table: &str, column_ddl: &str) -> bool {
    let sql = sql_builder::add_column(table, column_ddl);
    match execute(conn, &sql, &[]) {
        Ok(_) => {
            tracing::debug!(table, column = column_ddl, "added column");
            true
        }
        Err(e) => {
            tracing::debug!(table, column = column_ddl, error = %e, "add column skipped");
            false
        }
    }
}

/// User tables in the database, excluding SQLite's internal ones.
pub fn managed_tables(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
    )?;
    let names = stmt.query_map([], |row| row.get::<_, String>(0))?;
    let mut tables = Vec::new();
    for name in names {
        tables.push(name?);
    }
    Ok(tables)
}
