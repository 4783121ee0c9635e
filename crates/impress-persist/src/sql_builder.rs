//! DDL and DML statements derived from entity metadata.

use crate::converter::ConverterRegistry;
use crate::entity::{ColumnDescriptor, EntityMetadata};
use crate::error::{DbError, Result};
use crate::query::{Operator, Predicate, StatementSpec};
use crate::sql_info::{quote_identifier, KeyValue, SqlInfo};
use crate::sql_query::compile_where;
use crate::value::{ColumnKind, SqlValue};

/// `CREATE TABLE IF NOT EXISTS` for an entity.
pub(crate) fn create_table<E>(meta: &EntityMetadata<E>) -> String {
    let id = meta.id_column();
    let mut defs = Vec::new();
    let key = if meta.is_auto_increment() && id.kind == ColumnKind::Integer {
        "PRIMARY KEY AUTOINCREMENT"
    } else {
        "PRIMARY KEY"
    };
    defs.push(format!("{} {} {}", quote_identifier(&id.name), id.kind, key));
    defs.extend(meta.columns().map(column_definition));

    format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        quote_identifier(meta.table()),
        defs.join(", ")
    )
}

/// Column definition as it appears in `CREATE TABLE` and `ADD COLUMN`.
pub(crate) fn column_definition(column: &ColumnDescriptor) -> String {
    let mut def = format!("{} {}", quote_identifier(&column.name), column.kind);
    if !column.nullable {
        def.push_str(" NOT NULL");
    }
    if column.unique {
        def.push_str(" UNIQUE");
    }
    if let Some(ref default) = column.default_value {
        def.push_str(" DEFAULT ");
        def.push_str(default);
    }
    if let Some((ref table, ref col)) = column.references {
        def.push_str(&format!(
            " REFERENCES {}({})",
            quote_identifier(table),
            quote_identifier(col)
        ));
    }
    def
}

pub(crate) fn add_column(table: &str, column_ddl: &str) -> String {
    format!("ALTER TABLE {} ADD COLUMN {}", quote_identifier(table), column_ddl)
}

pub(crate) fn drop_table(table: &str) -> String {
    format!("DROP TABLE IF EXISTS {}", quote_identifier(table))
}

/// INSERT (or INSERT OR REPLACE) of one entity.
///
/// An unbound auto-increment id is left out so the database assigns one.
pub(crate) fn insert<E>(
    meta: &EntityMetadata<E>,
    entity: &E,
    registry: &ConverterRegistry,
    replace: bool,
) -> Result<SqlInfo> {
    let mut names = Vec::new();
    let mut args = Vec::new();

    let include_id = !meta.is_auto_increment() || meta.id_is_bound(entity, registry)?;
    if include_id {
        names.push(quote_identifier(&meta.id_column().name));
        args.push(meta.encode_id(entity, registry)?);
    }
    for (column, value) in meta.columns().zip(meta.encode_columns(entity, registry)?) {
        names.push(quote_identifier(&column.name));
        args.push(value);
    }

    let verb = if replace { "INSERT OR REPLACE" } else { "INSERT" };
    let sql = if names.is_empty() {
        format!("{} INTO {} DEFAULT VALUES", verb, quote_identifier(meta.table()))
    } else {
        format!(
            "{} INTO {} ({}) VALUES ({})",
            verb,
            quote_identifier(meta.table()),
            names.join(", "),
            vec!["?"; names.len()].join(", ")
        )
    };
    Ok(SqlInfo::with_args(sql, args))
}

/// UPDATE one entity by id. An empty `columns` list updates every mapped
/// column; otherwise exactly the named subset.
pub(crate) fn update_by_id<E>(
    meta: &EntityMetadata<E>,
    entity: &E,
    columns: &[&str],
    registry: &ConverterRegistry,
) -> Result<SqlInfo> {
    if !meta.id_is_bound(entity, registry)? {
        return Err(DbError::UnboundId {
            table: meta.table().to_string(),
        });
    }

    let mut assignments = Vec::new();
    let mut args = Vec::new();
    if columns.is_empty() {
        for (column, value) in meta.columns().zip(meta.encode_columns(entity, registry)?) {
            assignments.push(format!("{} = ?", quote_identifier(&column.name)));
            args.push(value);
        }
    } else {
        for name in columns {
            let value = meta.encode_column(entity, name, registry)?;
            assignments.push(format!("{} = ?", quote_identifier(name)));
            args.push(value);
        }
    }
    if assignments.is_empty() {
        return Err(DbError::InvalidQuery(format!(
            "table '{}' has no columns to update",
            meta.table()
        )));
    }

    args.push(meta.encode_id(entity, registry)?);
    let sql = format!(
        "UPDATE {} SET {} WHERE {} = ?",
        quote_identifier(meta.table()),
        assignments.join(", "),
        quote_identifier(&meta.id_column().name)
    );
    Ok(SqlInfo::with_args(sql, args))
}

/// UPDATE every row matching `predicate` (all rows when `None`).
pub(crate) fn update_where(
    table: &str,
    predicate: Option<&Predicate>,
    values: &[KeyValue],
) -> Result<SqlInfo> {
    if values.is_empty() {
        return Err(DbError::InvalidQuery(format!(
            "update of '{}' without any column values",
            table
        )));
    }
    let mut args: Vec<SqlValue> = values.iter().map(|kv| kv.value.clone()).collect();
    let assignments: Vec<String> = values
        .iter()
        .map(|kv| format!("{} = ?", quote_identifier(&kv.column)))
        .collect();
    let where_clause = compile_where(predicate, &mut args);
    let sql = format!(
        "UPDATE {} SET {}{}",
        quote_identifier(table),
        assignments.join(", "),
        where_clause
    );
    Ok(SqlInfo::with_args(sql, args))
}

pub(crate) fn delete_by_id<E>(meta: &EntityMetadata<E>, id: SqlValue) -> SqlInfo {
    let sql = format!(
        "DELETE FROM {} WHERE {} = ?",
        quote_identifier(meta.table()),
        quote_identifier(&meta.id_column().name)
    );
    SqlInfo::with_args(sql, vec![id])
}

pub(crate) fn delete_where(table: &str, predicate: Option<&Predicate>) -> SqlInfo {
    let mut args = Vec::new();
    let where_clause = compile_where(predicate, &mut args);
    SqlInfo::with_args(
        format!("DELETE FROM {}{}", quote_identifier(table), where_clause),
        args,
    )
}

/// SELECT of every mapped column, in decode order.
pub(crate) fn select_all<E>(meta: &EntityMetadata<E>) -> StatementSpec {
    let mut spec = StatementSpec::new(meta.table());
    spec.columns = meta
        .select_columns()
        .into_iter()
        .map(str::to_string)
        .collect();
    spec
}

pub(crate) fn select_by_id<E>(meta: &EntityMetadata<E>, id: SqlValue) -> SqlInfo {
    let mut spec = select_all(meta);
    spec.predicate = Some(Predicate::compare(&meta.id_column().name, Operator::Eq, id));
    spec.limit = Some(1);
    spec.render()
}
