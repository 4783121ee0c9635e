//! Fluent queries against one entity table.
//!
//! ```no_run
//! # use impress_persist::{query::greater_than, DbManager, Entity, Result};
//! # fn demo<Person: Entity>(db: &DbManager) -> Result<()> {
//! let top: Vec<Person> = db
//!     .selector::<Person>()
//!     .where_(greater_than("score", 1.0))
//!     .order_by_desc("score")
//!     .limit(10)
//!     .find_all()?;
//! # Ok(())
//! # }
//! ```

use std::marker::PhantomData;

use crate::entity::Entity;
use crate::error::Result;
use crate::manager::DbManager;
use crate::model::DbModel;
use crate::query::{OrderBy, Predicate, StatementSpec};
use crate::sql_builder;
use crate::sql_info::SqlInfo;
use crate::value::SqlValue;

/// Typed query builder returned by [`DbManager::selector`].
///
/// Execution borrows the builder, so one selector can run several times.
pub struct Selector<'db, E> {
    db: &'db DbManager,
    spec: StatementSpec,
    _entity: PhantomData<fn() -> E>,
}

impl<'db, E: Entity> Selector<'db, E> {
    pub(crate) fn new(db: &'db DbManager) -> Self {
        Self {
            db,
            spec: StatementSpec::default(),
            _entity: PhantomData,
        }
    }

    /// Replace the WHERE condition.
    pub fn where_(mut self, predicate: Predicate) -> Self {
        self.spec.predicate = Some(predicate);
        self
    }

    /// Optional form of [`where_`](Self::where_); `None` clears the condition.
    pub fn filter(mut self, predicate: Option<Predicate>) -> Self {
        self.spec.predicate = predicate;
        self
    }

    pub fn and(mut self, predicate: Predicate) -> Self {
        self.spec.and_where(predicate);
        self
    }

    pub fn or(mut self, predicate: Predicate) -> Self {
        self.spec.or_where(predicate);
        self
    }

    /// AND a raw SQL condition. Fails when placeholders and arguments differ
    /// in number.
    pub fn expr(mut self, sql: &str, args: Vec<SqlValue>) -> Result<Self> {
        self.spec.and_where(Predicate::raw(sql, args)?);
        Ok(self)
    }

    pub fn order_by(mut self, column: &str) -> Self {
        self.spec.order_by.push(OrderBy::asc(column));
        self
    }

    pub fn order_by_desc(mut self, column: &str) -> Self {
        self.spec.order_by.push(OrderBy::desc(column));
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.spec.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.spec.offset = Some(offset);
        self
    }

    pub fn find_first(&self) -> Result<Option<E>> {
        let meta = self.db.metadata::<E>()?;
        let mut spec = self.resolved(&sql_builder::select_all(&meta));
        spec.limit = Some(1);
        Ok(self.db.query_entities(&meta, &spec)?.pop())
    }

    pub fn find_all(&self) -> Result<Vec<E>> {
        let meta = self.db.metadata::<E>()?;
        let spec = self.resolved(&sql_builder::select_all(&meta));
        self.db.query_entities(&meta, &spec)
    }

    /// Number of rows [`find_all`](Self::find_all) would return.
    pub fn count(&self) -> Result<u64> {
        let meta = self.db.metadata::<E>()?;
        let spec = self.resolved(&sql_builder::select_all(&meta));
        self.db.count_rows(&meta, &spec)
    }

    /// The SELECT this selector runs.
    pub fn to_sql(&self) -> Result<SqlInfo> {
        let meta = self.db.metadata::<E>()?;
        Ok(self.resolved(&sql_builder::select_all(&meta)).render())
    }

    /// Switch to an untyped query projecting `columns`. Plain column names
    /// are quoted as needed; expressions such as `count(*) AS n` pass through.
    pub fn select(self, columns: &[&str]) -> ModelSelector<'db> {
        let mut model = self.into_models();
        model.spec.columns = columns.iter().map(|c| c.to_string()).collect();
        model
    }

    /// Switch to an untyped, grouped query.
    pub fn group_by(self, columns: &[&str]) -> ModelSelector<'db> {
        self.into_models().group_by(columns)
    }

    fn into_models(self) -> ModelSelector<'db> {
        ModelSelector {
            db: self.db,
            spec: self.spec,
            prepare: prepare_table::<E>,
        }
    }

    // Fill table and projection from the entity's select-all statement.
    fn resolved(&self, base: &StatementSpec) -> StatementSpec {
        let mut spec = self.spec.clone();
        spec.table = base.table.clone();
        spec.columns = base.columns.clone();
        spec
    }
}

impl<E> std::fmt::Debug for Selector<'_, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Selector")
            .field("entity", &std::any::type_name::<E>())
            .field("spec", &self.spec)
            .finish()
    }
}

type Prepare = fn(&DbManager, &mut StatementSpec) -> Result<()>;

fn prepare_table<E: Entity>(db: &DbManager, spec: &mut StatementSpec) -> Result<()> {
    let meta = db.metadata::<E>()?;
    db.ensure_table::<E>()?;
    spec.table = meta.table().to_string();
    Ok(())
}

/// Untyped query returning [`DbModel`] rows.
pub struct ModelSelector<'db> {
    db: &'db DbManager,
    spec: StatementSpec,
    prepare: Prepare,
}

impl<'db> ModelSelector<'db> {
    /// Replace the projection.
    pub fn select(mut self, columns: &[&str]) -> Self {
        self.spec.columns = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn group_by(mut self, columns: &[&str]) -> Self {
        self.spec
            .group_by
            .extend(columns.iter().map(|c| c.to_string()));
        self
    }

    pub fn having(mut self, predicate: Predicate) -> Self {
        self.spec.having = Some(match self.spec.having.take() {
            Some(existing) => existing.and_also(predicate),
            None => predicate,
        });
        self
    }

    pub fn distinct(mut self) -> Self {
        self.spec.distinct = true;
        self
    }

    pub fn where_(mut self, predicate: Predicate) -> Self {
        self.spec.predicate = Some(predicate);
        self
    }

    pub fn and(mut self, predicate: Predicate) -> Self {
        self.spec.and_where(predicate);
        self
    }

    pub fn or(mut self, predicate: Predicate) -> Self {
        self.spec.or_where(predicate);
        self
    }

    pub fn order_by(mut self, column: &str) -> Self {
        self.spec.order_by.push(OrderBy::asc(column));
        self
    }

    pub fn order_by_desc(mut self, column: &str) -> Self {
        self.spec.order_by.push(OrderBy::desc(column));
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.spec.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.spec.offset = Some(offset);
        self
    }

    pub fn find_first(&self) -> Result<Option<DbModel>> {
        let mut spec = self.prepared()?;
        spec.limit = Some(1);
        self.db.find_model_first(&spec.render())
    }

    pub fn find_all(&self) -> Result<Vec<DbModel>> {
        let spec = self.prepared()?;
        self.db.find_model_all(&spec.render())
    }

    pub fn count(&self) -> Result<u64> {
        let spec = self.prepared()?;
        let count = self
            .db
            .find_model_first(&spec.render_count())?
            .and_then(|model| match model.iter().next() {
                Some((_, SqlValue::Integer(n))) => Some(*n),
                _ => None,
            })
            .unwrap_or(0);
        Ok(count.max(0) as u64)
    }

    pub fn to_sql(&self) -> Result<SqlInfo> {
        Ok(self.prepared()?.render())
    }

    fn prepared(&self) -> Result<StatementSpec> {
        let mut spec = self.spec.clone();
        (self.prepare)(self.db, &mut spec)?;
        Ok(spec)
    }
}

impl std::fmt::Debug for ModelSelector<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelSelector")
            .field("spec", &self.spec)
            .finish()
    }
}
