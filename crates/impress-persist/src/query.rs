//! Query predicates and statement specifications.
//!
//! A [`Predicate`] is a boolean expression tree over columns. It is rendered
//! by [`sql_query`](crate::sql_query) into a SQL fragment with `?`
//! placeholders plus the argument list, in placeholder order:
//!
//! ```
//! use impress_persist::query::{and, equal_to, greater_than};
//!
//! let fragment = and([equal_to("name", "a"), greater_than("score", 1.0)]).render();
//! assert_eq!(fragment.sql, "(name = ? AND score > ?)");
//! assert_eq!(fragment.args.len(), 2);
//! ```

use std::fmt;

use crate::error::{DbError, Result};
use crate::sql_info::{count_placeholders, find_bound_name};
use crate::value::{SqlValue, ToSqlValue};

/// Binary comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Like,
    NotLike,
}

impl Operator {
    pub fn as_sql(self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::Ne => "!=",
            Operator::Gt => ">",
            Operator::Ge => ">=",
            Operator::Lt => "<",
            Operator::Le => "<=",
            Operator::Like => "LIKE",
            Operator::NotLike => "NOT LIKE",
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

/// Filter predicate for queries, updates and deletes.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    // Leaves
    Compare {
        column: String,
        op: Operator,
        value: SqlValue,
    },
    In {
        column: String,
        values: Vec<SqlValue>,
        negated: bool,
    },
    Between {
        column: String,
        low: SqlValue,
        high: SqlValue,
        negated: bool,
    },
    IsNull {
        column: String,
        negated: bool,
    },
    Raw {
        sql: String,
        args: Vec<SqlValue>,
    },

    // Logical
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    /// Generic comparison leaf.
    pub fn compare(column: impl Into<String>, op: Operator, value: impl ToSqlValue) -> Self {
        Predicate::Compare {
            column: column.into(),
            op,
            value: value.to_sql_value(),
        }
    }

    /// A raw SQL fragment with its own arguments.
    ///
    /// Fails when the number of `?` placeholders outside quoted text differs
    /// from the number of arguments, or when the fragment uses numbered or
    /// named parameters.
    pub fn raw(sql: impl Into<String>, args: Vec<SqlValue>) -> Result<Self> {
        let sql = sql.into();
        if let Some(name) = find_bound_name(&sql) {
            return Err(DbError::InvalidQuery(format!(
                "fragment '{}' uses parameter {}; only positional '?' is supported",
                sql, name
            )));
        }
        let placeholders = count_placeholders(&sql);
        if placeholders != args.len() {
            return Err(DbError::InvalidQuery(format!(
                "fragment '{}' has {} placeholders but {} arguments",
                sql,
                placeholders,
                args.len()
            )));
        }
        Ok(Predicate::Raw { sql, args })
    }

    /// Conjoin with another predicate, flattening an existing AND group.
    pub fn and_also(self, other: Predicate) -> Predicate {
        match self {
            Predicate::And(mut parts) => {
                parts.push(other);
                Predicate::And(parts)
            }
            first => Predicate::And(vec![first, other]),
        }
    }

    /// Disjoin with another predicate, flattening an existing OR group.
    pub fn or_else(self, other: Predicate) -> Predicate {
        match self {
            Predicate::Or(mut parts) => {
                parts.push(other);
                Predicate::Or(parts)
            }
            first => Predicate::Or(vec![first, other]),
        }
    }

    /// Negate this predicate.
    pub fn negate(self) -> Predicate {
        Predicate::Not(Box::new(self))
    }
}

pub fn equal_to(column: impl Into<String>, value: impl ToSqlValue) -> Predicate {
    Predicate::compare(column, Operator::Eq, value)
}

pub fn not_equal_to(column: impl Into<String>, value: impl ToSqlValue) -> Predicate {
    Predicate::compare(column, Operator::Ne, value)
}

pub fn greater_than(column: impl Into<String>, value: impl ToSqlValue) -> Predicate {
    Predicate::compare(column, Operator::Gt, value)
}

pub fn greater_or_equal(column: impl Into<String>, value: impl ToSqlValue) -> Predicate {
    Predicate::compare(column, Operator::Ge, value)
}

pub fn less_than(column: impl Into<String>, value: impl ToSqlValue) -> Predicate {
    Predicate::compare(column, Operator::Lt, value)
}

pub fn less_or_equal(column: impl Into<String>, value: impl ToSqlValue) -> Predicate {
    Predicate::compare(column, Operator::Le, value)
}

pub fn like(column: impl Into<String>, pattern: impl ToSqlValue) -> Predicate {
    Predicate::compare(column, Operator::Like, pattern)
}

pub fn not_like(column: impl Into<String>, pattern: impl ToSqlValue) -> Predicate {
    Predicate::compare(column, Operator::NotLike, pattern)
}

pub fn in_list<I, V>(column: impl Into<String>, values: I) -> Predicate
where
    I: IntoIterator<Item = V>,
    V: ToSqlValue,
{
    Predicate::In {
        column: column.into(),
        values: values.into_iter().map(|v| v.to_sql_value()).collect(),
        negated: false,
    }
}

pub fn not_in<I, V>(column: impl Into<String>, values: I) -> Predicate
where
    I: IntoIterator<Item = V>,
    V: ToSqlValue,
{
    Predicate::In {
        column: column.into(),
        values: values.into_iter().map(|v| v.to_sql_value()).collect(),
        negated: true,
    }
}

pub fn between(column: impl Into<String>, low: impl ToSqlValue, high: impl ToSqlValue) -> Predicate {
    Predicate::Between {
        column: column.into(),
        low: low.to_sql_value(),
        high: high.to_sql_value(),
        negated: false,
    }
}

pub fn not_between(
    column: impl Into<String>,
    low: impl ToSqlValue,
    high: impl ToSqlValue,
) -> Predicate {
    Predicate::Between {
        column: column.into(),
        low: low.to_sql_value(),
        high: high.to_sql_value(),
        negated: true,
    }
}

pub fn is_null(column: impl Into<String>) -> Predicate {
    Predicate::IsNull {
        column: column.into(),
        negated: false,
    }
}

pub fn is_not_null(column: impl Into<String>) -> Predicate {
    Predicate::IsNull {
        column: column.into(),
        negated: true,
    }
}

pub fn and(parts: impl IntoIterator<Item = Predicate>) -> Predicate {
    Predicate::And(parts.into_iter().collect())
}

pub fn or(parts: impl IntoIterator<Item = Predicate>) -> Predicate {
    Predicate::Or(parts.into_iter().collect())
}

pub fn not(inner: Predicate) -> Predicate {
    inner.negate()
}

/// Sort descriptor for query results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    pub column: String,
    pub descending: bool,
}

impl OrderBy {
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            descending: false,
        }
    }

    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            descending: true,
        }
    }
}

/// A fully composed SELECT against one table.
///
/// An empty `columns` list selects `*`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatementSpec {
    pub table: String,
    pub columns: Vec<String>,
    pub distinct: bool,
    pub predicate: Option<Predicate>,
    pub group_by: Vec<String>,
    pub having: Option<Predicate>,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

impl StatementSpec {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            ..Default::default()
        }
    }

    /// AND `predicate` onto the current WHERE condition.
    pub fn and_where(&mut self, predicate: Predicate) {
        self.predicate = Some(match self.predicate.take() {
            Some(existing) => existing.and_also(predicate),
            None => predicate,
        });
    }

    /// OR `predicate` onto the current WHERE condition.
    pub fn or_where(&mut self, predicate: Predicate) {
        self.predicate = Some(match self.predicate.take() {
            Some(existing) => existing.or_else(predicate),
            None => predicate,
        });
    }
}
