//! Connection and transaction management for one logical database.
//!
//! A [`DbManager`] owns at most one SQLite connection. The connection is
//! opened on first use; opening runs the open callback and reconciles the
//! stored schema version (`PRAGMA user_version`) with the configured one.
//! Every statement goes through the manager's lock, so a transaction holds
//! the connection for its whole duration.

use std::ops::ControlFlow;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use rusqlite::{params_from_iter, Connection, Row};

use crate::config::DbConfig;
use crate::context::{DbIdentity, ManagerMap};
use crate::converter::ConverterRegistry;
use crate::entity::{Entity, EntityMetadata, MetadataCache};
use crate::error::{DbError, Result};
use crate::model::DbModel;
use crate::query::{Predicate, StatementSpec};
use crate::selector::Selector;
use crate::sql_builder;
use crate::sql_info::{KeyValue, SqlInfo};
use crate::table::{self, EnsureOutcome, TableManager};
use crate::value::{SqlValue, ToSqlValue};

/// Execute one statement and return the number of affected rows.
pub(crate) fn execute(conn: &Connection, sql: &str, args: &[SqlValue]) -> Result<usize> {
    tracing::debug!(sql, args = ?args, "execute");
    conn.execute(sql, params_from_iter(args.iter()))
        .map_err(|e| DbError::statement(sql, args, e))
}

/// Run a query and map every row.
pub(crate) fn query_rows<R>(
    conn: &Connection,
    info: &SqlInfo,
    mut map: impl FnMut(&Row<'_>) -> Result<R>,
) -> Result<Vec<R>> {
    let mut out = Vec::new();
    for_each_row(conn, info, |row| {
        out.push(map(row)?);
        Ok(ControlFlow::Continue(()))
    })?;
    Ok(out)
}

fn for_each_row(
    conn: &Connection,
    info: &SqlInfo,
    mut visit: impl FnMut(&Row<'_>) -> Result<ControlFlow<()>>,
) -> Result<()> {
    tracing::debug!(sql = info.sql(), args = ?info.args(), "query");
    let to_err = |e| DbError::statement(info.sql(), info.args(), e);
    let mut stmt = conn.prepare(info.sql()).map_err(to_err)?;
    let mut rows = stmt.query(params_from_iter(info.args().iter())).map_err(to_err)?;
    while let Some(row) = rows.next().map_err(to_err)? {
        if visit(row)?.is_break() {
            break;
        }
    }
    Ok(())
}

fn read_user_version(conn: &Connection) -> Result<u32> {
    Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?)
}

fn write_user_version(conn: &Connection, version: u32) -> Result<()> {
    conn.pragma_update(None, "user_version", version)?;
    Ok(())
}

/// Schema access handed to upgrade and downgrade callbacks.
///
/// Runs inside the version-change transaction; returning an error from the
/// callback rolls back everything done through it.
pub struct SchemaUpgrade<'a> {
    conn: &'a Connection,
    old_version: u32,
    new_version: u32,
}

impl<'a> SchemaUpgrade<'a> {
    pub fn old_version(&self) -> u32 {
        self.old_version
    }

    pub fn new_version(&self) -> u32 {
        self.new_version
    }

    pub fn connection(&self) -> &'a Connection {
        self.conn
    }

    pub fn execute(&self, info: &SqlInfo) -> Result<usize> {
        execute(self.conn, info.sql(), info.args())
    }

    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        tracing::debug!(sql, "execute batch");
        self.conn
            .execute_batch(sql)
            .map_err(|e| DbError::statement(sql, &[], e))
    }

    pub fn table_exists(&self, table: &str) -> Result<bool> {
        table::table_exists(self.conn, table)
    }

    pub fn managed_tables(&self) -> Result<Vec<String>> {
        table::managed_tables(self.conn)
    }

    /// Best-effort column addition, see [`table::add_column_if_missing`].
    pub fn add_column(&self, table: &str, column_ddl: &str) -> bool {
        table::add_column_if_missing(self.conn, table, column_ddl)
    }

    pub fn drop_table(&self, table: &str) -> Result<()> {
        execute(self.conn, &sql_builder::drop_table(table), &[]).map(|_| ())
    }

    /// The default upgrade policy.
    pub fn drop_all_tables(&self) -> Result<()> {
        for table in self.managed_tables()? {
            self.drop_table(&table)?;
        }
        Ok(())
    }
}

enum ConnState {
    Unopened,
    Open(Connection),
    Closed,
}

/// Manager of one logical database.
pub struct DbManager {
    config: DbConfig,
    identity: DbIdentity,
    registry: Arc<ConverterRegistry>,
    metadata: Arc<MetadataCache>,
    tables: TableManager,
    state: Mutex<ConnState>,
    owner: Weak<ManagerMap>,
}

impl DbManager {
    pub(crate) fn new(
        config: DbConfig,
        registry: Arc<ConverterRegistry>,
        metadata: Arc<MetadataCache>,
        owner: Weak<ManagerMap>,
    ) -> Self {
        let identity = config.identity();
        Self {
            config,
            identity,
            registry,
            metadata,
            tables: TableManager::new(),
            state: Mutex::new(ConnState::Unopened),
            owner,
        }
    }

    pub fn config(&self) -> &DbConfig {
        &self.config
    }

    pub fn identity(&self) -> &DbIdentity {
        &self.identity
    }

    pub fn converters(&self) -> &ConverterRegistry {
        &self.registry
    }

    /// Configured schema version.
    pub fn version(&self) -> u32 {
        self.config.version
    }

    /// Schema version stored in the database file.
    pub fn stored_version(&self) -> Result<u32> {
        self.with_conn(read_user_version)
    }

    pub fn is_open(&self) -> bool {
        matches!(*self.lock_state(), ConnState::Open(_))
    }

    pub fn is_closed(&self) -> bool {
        matches!(*self.lock_state(), ConnState::Closed)
    }

    // Connection lifecycle

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ConnState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` with the connection, opening it first if needed.
    pub(crate) fn with_conn<R>(&self, f: impl FnOnce(&Connection) -> Result<R>) -> Result<R> {
        let mut state = self.lock_state();
        if matches!(*state, ConnState::Unopened) {
            let conn = self.open_connection()?;
            *state = ConnState::Open(conn);
        }
        match &*state {
            ConnState::Open(conn) => f(conn),
            _ => Err(DbError::Closed(self.identity.name().to_string())),
        }
    }

    fn open_connection(&self) -> Result<Connection> {
        let conn = match self.config.db_path() {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                Connection::open(&path)?
            }
            None => Connection::open_in_memory()?,
        };
        self.tables.clear();

        if let Some(callback) = self.config.open_callback() {
            callback(&conn)?;
        }
        self.reconcile_version(&conn)?;

        tracing::info!(
            db = self.identity.name(),
            path = ?self.config.db_path(),
            version = self.config.version,
            "opened database"
        );
        Ok(conn)
    }

    fn reconcile_version(&self, conn: &Connection) -> Result<()> {
        let stored = read_user_version(conn)?;
        let target = self.config.version;

        if stored == 0 {
            return write_user_version(conn, target);
        }
        if stored < target {
            self.change_version(conn, stored, target, true)?;
            tracing::info!(
                db = self.identity.name(),
                from = stored,
                to = target,
                "upgraded schema version"
            );
        } else if stored > target {
            if self.config.downgrade_callback().is_some() {
                self.change_version(conn, stored, target, false)?;
            } else {
                tracing::warn!(
                    db = self.identity.name(),
                    stored,
                    configured = target,
                    "stored schema version is newer than configured, no downgrade callback"
                );
            }
        }
        Ok(())
    }

    fn change_version(&self, conn: &Connection, from: u32, to: u32, upgrade: bool) -> Result<()> {
        let tx = conn.unchecked_transaction().map_err(|e| DbError::Transaction {
            message: "begin version change".to_string(),
            source: e,
        })?;

        let schema = SchemaUpgrade {
            conn: &tx,
            old_version: from,
            new_version: to,
        };
        let result = if upgrade {
            let migrated = match self.config.upgrade_callback() {
                Some(callback) => callback(&schema),
                None => schema.drop_all_tables(),
            };
            migrated.and_then(|_| write_user_version(&tx, to))
        } else {
            match self.config.downgrade_callback() {
                Some(callback) => callback(&schema),
                None => Ok(()),
            }
        };

        match result {
            Ok(()) => tx.commit().map_err(|e| DbError::Transaction {
                message: "commit version change".to_string(),
                source: e,
            }),
            Err(e) => {
                if let Err(rollback) = tx.rollback() {
                    tracing::warn!(db = self.identity.name(), error = %rollback, "rollback failed");
                }
                Err(DbError::Upgrade {
                    from,
                    to,
                    source: Box::new(e),
                })
            }
        }
    }

    /// Close the connection and remove this manager from its context.
    ///
    /// Every later operation fails with [`DbError::Closed`].
    pub fn close(&self) {
        let previous = std::mem::replace(&mut *self.lock_state(), ConnState::Closed);
        self.tables.clear();
        if let Some(managers) = self.owner.upgrade() {
            let mut managers = managers.write().unwrap_or_else(PoisonError::into_inner);
            let is_self = managers
                .get(&self.identity)
                .map_or(false, |m| std::ptr::eq(Arc::as_ptr(m), self));
            if is_self {
                managers.remove(&self.identity);
            }
        }
        if !matches!(previous, ConnState::Closed) {
            tracing::info!(db = self.identity.name(), "closed database");
        }
    }

    // Transactions

    /// Run `f` inside one transaction when transactions are enabled.
    ///
    /// The manager's lock is held for the whole call; `f` must not call back
    /// into this manager.
    pub fn transaction<R>(&self, f: impl FnOnce(&Connection) -> Result<R>) -> Result<R> {
        self.with_conn(|conn| self.in_transaction(conn, f))
    }

    fn in_transaction<R>(
        &self,
        conn: &Connection,
        f: impl FnOnce(&Connection) -> Result<R>,
    ) -> Result<R> {
        if !self.config.allow_transaction {
            return f(conn);
        }

        let tx = conn.unchecked_transaction().map_err(|e| DbError::Transaction {
            message: "begin".to_string(),
            source: e,
        })?;
        match f(&tx) {
            Ok(value) => {
                tx.commit().map_err(|e| DbError::Transaction {
                    message: "commit".to_string(),
                    source: e,
                })?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback() {
                    tracing::warn!(db = self.identity.name(), error = %rollback, "rollback failed");
                }
                // Tables created inside the transaction are gone again
                self.tables.clear();
                Err(e)
            }
        }
    }

    // Schema

    pub(crate) fn metadata<E: Entity>(&self) -> Result<Arc<EntityMetadata<E>>> {
        self.metadata.get_or_derive::<E>(&self.registry)
    }

    fn ensure<E>(&self, conn: &Connection, meta: &EntityMetadata<E>) -> Result<EnsureOutcome> {
        self.tables
            .ensure_table(conn, meta, self.config.table_created_callback())
    }

    /// Make sure `E`'s table exists with all mapped columns.
    pub fn ensure_table<E: Entity>(&self) -> Result<EnsureOutcome> {
        let meta = self.metadata::<E>()?;
        self.with_conn(|conn| self.ensure(conn, &meta))
    }

    pub fn table_exists<E: Entity>(&self) -> Result<bool> {
        let meta = self.metadata::<E>()?;
        self.with_conn(|conn| table::table_exists(conn, meta.table()))
    }

    /// Add one mapped column to an existing table. Returns whether it was
    /// added; failures are swallowed.
    pub fn add_column<E: Entity>(&self, column: &str) -> Result<bool> {
        let meta = self.metadata::<E>()?;
        let descriptor = meta
            .columns()
            .find(|c| c.name.eq_ignore_ascii_case(column))
            .ok_or_else(|| DbError::UnknownColumn {
                table: meta.table().to_string(),
                column: column.to_string(),
            })?;
        let ddl = sql_builder::column_definition(descriptor);
        self.with_conn(|conn| Ok(table::add_column_if_missing(conn, meta.table(), &ddl)))
    }

    pub fn drop_table<E: Entity>(&self) -> Result<()> {
        let meta = self.metadata::<E>()?;
        self.with_conn(|conn| {
            execute(conn, &sql_builder::drop_table(meta.table()), &[])?;
            self.tables.forget(meta.table());
            Ok(())
        })
    }

    /// Drop every managed table.
    pub fn drop_db(&self) -> Result<()> {
        self.with_conn(|conn| {
            let tables = table::managed_tables(conn)?;
            let dropped = self.in_transaction(conn, |tx| {
                for table in &tables {
                    execute(tx, &sql_builder::drop_table(table), &[])?;
                }
                Ok(tables.len())
            })?;
            self.tables.clear();
            tracing::info!(db = self.identity.name(), tables = dropped, "dropped database tables");
            Ok(())
        })
    }

    // Writes

    fn insert_one<E>(
        &self,
        conn: &Connection,
        meta: &EntityMetadata<E>,
        entity: &mut E,
        replace: bool,
    ) -> Result<bool> {
        let info = sql_builder::insert(meta, entity, &self.registry, replace)?;
        execute(conn, info.sql(), info.args())?;
        if meta.is_auto_increment() && !meta.id_is_bound(entity, &self.registry)? {
            meta.bind_generated_id(entity, conn.last_insert_rowid(), &self.registry)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Insert a batch in one transaction. Ids generated before a failure are
    /// unbound again.
    fn insert_batch<E>(
        &self,
        conn: &Connection,
        meta: &EntityMetadata<E>,
        entities: &mut [E],
        replace: bool,
    ) -> Result<()> {
        let mut generated = Vec::new();
        let result = self.in_transaction(conn, |tx| {
            for (i, entity) in entities.iter_mut().enumerate() {
                if self.insert_one(tx, meta, entity, replace)? {
                    generated.push(i);
                }
            }
            Ok(())
        });
        if result.is_err() {
            self.unbind_rolled_back(meta, entities, &generated);
        }
        result
    }

    // Ids generated inside a rolled-back transaction point at rows that no
    // longer exist. The original error is what the caller sees.
    fn unbind_rolled_back<E>(&self, meta: &EntityMetadata<E>, entities: &mut [E], generated: &[usize]) {
        if !self.config.allow_transaction {
            return;
        }
        for &i in generated {
            if let Err(e) = meta.unbind_generated_id(&mut entities[i], &self.registry) {
                tracing::warn!(table = meta.table(), error = %e, "could not unbind generated id");
            }
        }
    }

    /// Insert an entity. An unbound auto-increment id is assigned by the
    /// database and written back.
    pub fn save<E: Entity>(&self, entity: &mut E) -> Result<()> {
        let meta = self.metadata::<E>()?;
        self.with_conn(|conn| {
            self.ensure(conn, &meta)?;
            self.insert_one(conn, &meta, entity, false).map(|_| ())
        })
    }

    pub fn save_all<E: Entity>(&self, entities: &mut [E]) -> Result<()> {
        let meta = self.metadata::<E>()?;
        self.with_conn(|conn| {
            self.ensure(conn, &meta)?;
            self.insert_batch(conn, &meta, entities, false)
        })
    }

    /// INSERT OR REPLACE an entity.
    pub fn replace<E: Entity>(&self, entity: &mut E) -> Result<()> {
        let meta = self.metadata::<E>()?;
        self.with_conn(|conn| {
            self.ensure(conn, &meta)?;
            self.insert_one(conn, &meta, entity, true).map(|_| ())
        })
    }

    pub fn replace_all<E: Entity>(&self, entities: &mut [E]) -> Result<()> {
        let meta = self.metadata::<E>()?;
        self.with_conn(|conn| {
            self.ensure(conn, &meta)?;
            self.insert_batch(conn, &meta, entities, true)
        })
    }

    /// Returns whether an id was generated.
    fn upsert_one<E>(&self, conn: &Connection, meta: &EntityMetadata<E>, entity: &mut E) -> Result<bool> {
        if !meta.id_is_bound(entity, &self.registry)? {
            return self.insert_one(conn, meta, entity, false);
        }
        if meta.columns().next().is_none() {
            return self.insert_one(conn, meta, entity, true);
        }
        let info = sql_builder::update_by_id(meta, entity, &[], &self.registry)?;
        if execute(conn, info.sql(), info.args())? == 0 {
            return self.insert_one(conn, meta, entity, false);
        }
        Ok(false)
    }

    /// Update by id when the row exists, otherwise insert.
    pub fn save_or_update<E: Entity>(&self, entity: &mut E) -> Result<()> {
        let meta = self.metadata::<E>()?;
        self.with_conn(|conn| {
            self.ensure(conn, &meta)?;
            if meta.id_is_bound(entity, &self.registry)? {
                self.in_transaction(conn, |tx| self.upsert_one(tx, &meta, entity))
                    .map(|_| ())
            } else {
                self.insert_one(conn, &meta, entity, false).map(|_| ())
            }
        })
    }

    pub fn save_or_update_all<E: Entity>(&self, entities: &mut [E]) -> Result<()> {
        let meta = self.metadata::<E>()?;
        self.with_conn(|conn| {
            self.ensure(conn, &meta)?;
            let mut generated = Vec::new();
            let result = self.in_transaction(conn, |tx| {
                for (i, entity) in entities.iter_mut().enumerate() {
                    if self.upsert_one(tx, &meta, entity)? {
                        generated.push(i);
                    }
                }
                Ok(())
            });
            if result.is_err() {
                self.unbind_rolled_back(&meta, entities, &generated);
            }
            result
        })
    }

    /// Update an entity's row by id. An empty `columns` list writes every
    /// mapped column. Returns the number of rows changed.
    pub fn update<E: Entity>(&self, entity: &E, columns: &[&str]) -> Result<usize> {
        let meta = self.metadata::<E>()?;
        let info = sql_builder::update_by_id(&meta, entity, columns, &self.registry)?;
        self.with_conn(|conn| {
            self.ensure(conn, &meta)?;
            execute(conn, info.sql(), info.args())
        })
    }

    /// Set `values` on every row matching `predicate`; `None` matches all.
    pub fn update_where<E: Entity>(
        &self,
        predicate: Option<Predicate>,
        values: &[KeyValue],
    ) -> Result<usize> {
        let meta = self.metadata::<E>()?;
        if let Some(unknown) = values.iter().find(|kv| meta.column(&kv.column).is_none()) {
            return Err(DbError::UnknownColumn {
                table: meta.table().to_string(),
                column: unknown.column.clone(),
            });
        }
        let info = sql_builder::update_where(meta.table(), predicate.as_ref(), values)?;
        self.with_conn(|conn| {
            self.ensure(conn, &meta)?;
            execute(conn, info.sql(), info.args())
        })
    }

    // Deletes

    pub fn delete<E: Entity>(&self, entity: &E) -> Result<usize> {
        let meta = self.metadata::<E>()?;
        if !meta.id_is_bound(entity, &self.registry)? {
            return Err(DbError::UnboundId {
                table: meta.table().to_string(),
            });
        }
        let info = sql_builder::delete_by_id(&meta, meta.encode_id(entity, &self.registry)?);
        self.with_conn(|conn| {
            self.ensure(conn, &meta)?;
            execute(conn, info.sql(), info.args())
        })
    }

    pub fn delete_by_id<E: Entity>(&self, id: impl ToSqlValue) -> Result<usize> {
        let meta = self.metadata::<E>()?;
        let info = sql_builder::delete_by_id(&meta, id.to_sql_value());
        self.with_conn(|conn| {
            self.ensure(conn, &meta)?;
            execute(conn, info.sql(), info.args())
        })
    }

    /// Delete every row matching `predicate`; `None` deletes all rows.
    pub fn delete_where<E: Entity>(&self, predicate: Option<Predicate>) -> Result<usize> {
        let meta = self.metadata::<E>()?;
        let info = sql_builder::delete_where(meta.table(), predicate.as_ref());
        self.with_conn(|conn| {
            self.ensure(conn, &meta)?;
            execute(conn, info.sql(), info.args())
        })
    }

    /// Delete the given entities by id in one transaction.
    pub fn delete_all<E: Entity>(&self, entities: &[E]) -> Result<usize> {
        let meta = self.metadata::<E>()?;
        let mut statements = Vec::with_capacity(entities.len());
        for entity in entities {
            if !meta.id_is_bound(entity, &self.registry)? {
                return Err(DbError::UnboundId {
                    table: meta.table().to_string(),
                });
            }
            statements.push(sql_builder::delete_by_id(
                &meta,
                meta.encode_id(entity, &self.registry)?,
            ));
        }
        self.with_conn(|conn| {
            self.ensure(conn, &meta)?;
            self.in_transaction(conn, |tx| {
                let mut deleted = 0;
                for info in &statements {
                    deleted += execute(tx, info.sql(), info.args())?;
                }
                Ok(deleted)
            })
        })
    }

    // Reads

    pub fn find_by_id<E: Entity>(&self, id: impl ToSqlValue) -> Result<Option<E>> {
        let meta = self.metadata::<E>()?;
        let info = sql_builder::select_by_id(&meta, id.to_sql_value());
        let mut found = self.query_with_meta(&meta, &info)?;
        Ok(found.pop())
    }

    pub fn find_first<E: Entity>(&self, predicate: Option<Predicate>) -> Result<Option<E>> {
        self.selector::<E>().filter(predicate).find_first()
    }

    pub fn find_all<E: Entity>(&self, predicate: Option<Predicate>) -> Result<Vec<E>> {
        self.selector::<E>().filter(predicate).find_all()
    }

    pub fn count<E: Entity>(&self, predicate: Option<Predicate>) -> Result<u64> {
        self.selector::<E>().filter(predicate).count()
    }

    /// Start a typed query against `E`'s table.
    pub fn selector<E: Entity>(&self) -> Selector<'_, E> {
        Selector::new(self)
    }

    pub(crate) fn query_entities<E: Entity>(
        &self,
        meta: &EntityMetadata<E>,
        spec: &StatementSpec,
    ) -> Result<Vec<E>> {
        self.query_with_meta(meta, &spec.render())
    }

    fn query_with_meta<E: Entity>(&self, meta: &EntityMetadata<E>, info: &SqlInfo) -> Result<Vec<E>> {
        self.with_conn(|conn| {
            self.ensure(conn, meta)?;
            query_rows(conn, info, |row| meta.decode_row(row, &self.registry))
        })
    }

    pub(crate) fn count_rows<E: Entity>(
        &self,
        meta: &EntityMetadata<E>,
        spec: &StatementSpec,
    ) -> Result<u64> {
        let info = spec.render_count();
        self.with_conn(|conn| {
            self.ensure(conn, meta)?;
            let counts = query_rows(conn, &info, |row| Ok(row.get::<_, i64>(0)?))?;
            Ok(counts.first().copied().unwrap_or(0).max(0) as u64)
        })
    }

    // Raw SQL

    /// Execute a statement and return the number of affected rows.
    pub fn exec_non_query(&self, info: &SqlInfo) -> Result<usize> {
        self.with_conn(|conn| execute(conn, info.sql(), info.args()))
    }

    /// Run a query, handing each row to `visit` until it breaks.
    ///
    /// The manager is locked while rows are visited; `visit` must not call
    /// back into this manager.
    pub fn exec_query<F>(&self, info: &SqlInfo, visit: F) -> Result<()>
    where
        F: FnMut(&Row<'_>) -> Result<ControlFlow<()>>,
    {
        self.with_conn(|conn| for_each_row(conn, info, visit))
    }

    pub fn find_model_first(&self, info: &SqlInfo) -> Result<Option<DbModel>> {
        let mut first = None;
        self.exec_query(info, |row| {
            first = Some(DbModel::from_row(row)?);
            Ok(ControlFlow::Break(()))
        })?;
        Ok(first)
    }

    pub fn find_model_all(&self, info: &SqlInfo) -> Result<Vec<DbModel>> {
        self.with_conn(|conn| query_rows(conn, info, DbModel::from_row))
    }
}

impl std::fmt::Debug for DbManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbManager")
            .field("identity", &self.identity)
            .field("version", &self.config.version)
            .finish()
    }
}
