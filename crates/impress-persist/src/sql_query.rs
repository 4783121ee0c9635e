//! Rendering of predicates and statements into parameterized SQL.

use crate::query::{Operator, OrderBy, Predicate, StatementSpec};
use crate::sql_info::{projection_term, quote_column_ref, quote_identifier, SqlInfo};
use crate::value::SqlValue;

/// Rendered predicate: SQL text with `?` placeholders plus its arguments.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SqlFragment {
    pub sql: String,
    pub args: Vec<SqlValue>,
}

impl Predicate {
    /// Render into a SQL fragment. Arguments are in placeholder order.
    pub fn render(&self) -> SqlFragment {
        let mut args = Vec::new();
        let sql = compile_predicate(self, &mut args, false);
        SqlFragment { sql, args }
    }
}

impl StatementSpec {
    /// Render the full SELECT statement.
    pub fn render(&self) -> SqlInfo {
        let mut args = Vec::new();
        let mut sql = String::from("SELECT ");
        if self.distinct {
            sql.push_str("DISTINCT ");
        }
        sql.push_str(&compile_projection(&self.columns));
        sql.push_str(" FROM ");
        sql.push_str(&quote_identifier(&self.table));

        if let Some(ref predicate) = self.predicate {
            sql.push_str(" WHERE ");
            sql.push_str(&compile_predicate(predicate, &mut args, false));
        }
        if !self.group_by.is_empty() {
            let terms: Vec<String> = self.group_by.iter().map(|g| projection_term(g)).collect();
            sql.push_str(" GROUP BY ");
            sql.push_str(&terms.join(", "));
        }
        if let Some(ref having) = self.having {
            sql.push_str(" HAVING ");
            sql.push_str(&compile_predicate(having, &mut args, false));
        }
        let order = compile_sort(&self.order_by);
        if !order.is_empty() {
            sql.push(' ');
            sql.push_str(&order);
        }
        sql.push_str(&compile_limit_offset(self.limit, self.offset));

        SqlInfo::with_args(sql, args)
    }

    /// Render a statement counting the rows [`render`](Self::render) returns.
    pub fn render_count(&self) -> SqlInfo {
        let wrapped = self.distinct
            || !self.group_by.is_empty()
            || self.limit.is_some()
            || self.offset.is_some();
        if wrapped {
            let (inner, args) = self.render().into_parts();
            return SqlInfo::with_args(format!("SELECT COUNT(*) FROM ({})", inner), args);
        }

        let mut args = Vec::new();
        let mut sql = format!("SELECT COUNT(*) FROM {}", quote_identifier(&self.table));
        if let Some(ref predicate) = self.predicate {
            sql.push_str(" WHERE ");
            sql.push_str(&compile_predicate(predicate, &mut args, false));
        }
        SqlInfo::with_args(sql, args)
    }
}

/// Render an optional WHERE clause, including the leading keyword.
pub(crate) fn compile_where(predicate: Option<&Predicate>, args: &mut Vec<SqlValue>) -> String {
    match predicate {
        Some(p) => format!(" WHERE {}", compile_predicate(p, args, false)),
        None => String::new(),
    }
}

fn compile_predicate(pred: &Predicate, params: &mut Vec<SqlValue>, nested: bool) -> String {
    match pred {
        Predicate::Compare { column, op, value } => {
            let col = quote_column_ref(column);
            match (op, value) {
                (Operator::Eq, SqlValue::Null) => format!("{} IS NULL", col),
                (Operator::Ne, SqlValue::Null) => format!("{} IS NOT NULL", col),
                _ => {
                    params.push(value.clone());
                    format!("{} {} ?", col, op.as_sql())
                }
            }
        }
        Predicate::In {
            column,
            values,
            negated,
        } => {
            if values.is_empty() {
                // Nothing matches IN (), everything matches NOT IN ()
                return if *negated { "1 = 1" } else { "1 = 0" }.to_string();
            }
            params.extend(values.iter().cloned());
            let placeholders = vec!["?"; values.len()].join(", ");
            let keyword = if *negated { "NOT IN" } else { "IN" };
            format!("{} {} ({})", quote_column_ref(column), keyword, placeholders)
        }
        Predicate::Between {
            column,
            low,
            high,
            negated,
        } => {
            params.push(low.clone());
            params.push(high.clone());
            let keyword = if *negated { "NOT BETWEEN" } else { "BETWEEN" };
            format!("{} {} ? AND ?", quote_column_ref(column), keyword)
        }
        Predicate::IsNull { column, negated } => {
            let keyword = if *negated { "IS NOT NULL" } else { "IS NULL" };
            format!("{} {}", quote_column_ref(column), keyword)
        }
        Predicate::Raw { sql, args } => {
            params.extend(args.iter().cloned());
            if nested {
                format!("({})", sql)
            } else {
                sql.clone()
            }
        }
        Predicate::And(preds) => compile_group(preds, " AND ", "1 = 1", params),
        Predicate::Or(preds) => compile_group(preds, " OR ", "1 = 0", params),
        Predicate::Not(inner) => {
            format!("NOT ({})", compile_predicate(inner, params, false))
        }
    }
}

fn compile_group(
    preds: &[Predicate],
    separator: &str,
    empty: &str,
    params: &mut Vec<SqlValue>,
) -> String {
    if preds.is_empty() {
        return empty.to_string();
    }
    let parts: Vec<String> = preds
        .iter()
        .map(|p| compile_predicate(p, params, true))
        .collect();
    format!("({})", parts.join(separator))
}

fn compile_projection(columns: &[String]) -> String {
    if columns.is_empty() {
        return "*".to_string();
    }
    columns
        .iter()
        .map(|c| projection_term(c))
        .collect::<Vec<_>>()
        .join(", ")
}

fn compile_sort(sorts: &[OrderBy]) -> String {
    if sorts.is_empty() {
        return String::new();
    }
    let parts: Vec<String> = sorts
        .iter()
        .map(|s| {
            let dir = if s.descending { "DESC" } else { "ASC" };
            format!("{} {}", projection_term(&s.column), dir)
        })
        .collect();
    format!("ORDER BY {}", parts.join(", "))
}

fn compile_limit_offset(limit: Option<u64>, offset: Option<u64>) -> String {
    match (limit, offset) {
        (Some(limit), Some(offset)) => format!(" LIMIT {} OFFSET {}", limit, offset),
        (Some(limit), None) => format!(" LIMIT {}", limit),
        // SQLite needs a LIMIT before OFFSET
        (None, Some(offset)) => format!(" LIMIT -1 OFFSET {}", offset),
        (None, None) => String::new(),
    }
}
