//! Executable statements and identifier handling.

use std::fmt;

use lazy_static::lazy_static;
use regex::Regex;

use crate::value::{describe_value, SqlValue, ToSqlValue};

lazy_static! {
    static ref PLAIN_IDENTIFIER: Regex = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap();
    static ref QUALIFIED_IDENTIFIER: Regex =
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*\.[A-Za-z_][A-Za-z0-9_]*$").unwrap();
}

/// Keywords that cannot appear as bare identifiers.
const RESERVED: &[&str] = &[
    "ABORT", "ADD", "ALL", "ALTER", "AND", "AS", "ASC", "BETWEEN", "BY", "CASE", "CHECK",
    "COLLATE", "COLUMN", "CONSTRAINT", "CREATE", "CROSS", "DEFAULT", "DELETE", "DESC",
    "DISTINCT", "DROP", "ELSE", "END", "ESCAPE", "EXCEPT", "EXISTS", "FOREIGN", "FROM", "FULL",
    "GLOB", "GROUP", "HAVING", "IN", "INDEX", "INNER", "INSERT", "INTERSECT", "INTO", "IS",
    "ISNULL", "JOIN", "KEY", "LEFT", "LIKE", "LIMIT", "MATCH", "NATURAL", "NOT", "NOTNULL",
    "NULL", "OFFSET", "ON", "OR", "ORDER", "OUTER", "PRIMARY", "REFERENCES", "REGEXP",
    "REPLACE", "RIGHT", "SELECT", "SET", "TABLE", "THEN", "TO", "TRANSACTION", "UNION",
    "UNIQUE", "UPDATE", "USING", "VALUES", "WHEN", "WHERE",
];

/// Whether `name` is a plain identifier that can be written unquoted.
pub fn is_plain_identifier(name: &str) -> bool {
    PLAIN_IDENTIFIER.is_match(name) && !RESERVED.contains(&name.to_ascii_uppercase().as_str())
}

/// Render an identifier for SQL text.
///
/// Plain, non-reserved names are written as-is; anything else is wrapped in
/// double quotes with embedded quotes doubled.
pub fn quote_identifier(name: &str) -> String {
    if is_plain_identifier(name) {
        name.to_string()
    } else {
        format!("\"{}\"", name.replace('"', "\"\""))
    }
}

/// Render a column reference that may be table-qualified (`t.col`).
pub(crate) fn quote_column_ref(name: &str) -> String {
    if QUALIFIED_IDENTIFIER.is_match(name) {
        let (table, column) = name.split_once('.').unwrap_or((name, ""));
        format!("{}.{}", quote_identifier(table), quote_identifier(column))
    } else {
        quote_identifier(name)
    }
}

/// Render a projection or ordering term.
///
/// Identifiers are quoted as needed; expressions such as `count(*) AS n`
/// pass through untouched.
pub(crate) fn projection_term(term: &str) -> String {
    if PLAIN_IDENTIFIER.is_match(term) || QUALIFIED_IDENTIFIER.is_match(term) {
        quote_column_ref(term)
    } else {
        term.to_string()
    }
}

/// Count `?` placeholders outside of quoted literals and identifiers.
pub(crate) fn count_placeholders(sql: &str) -> usize {
    let mut count = 0;
    let mut quote: Option<char> = None;
    for c in sql.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None => match c {
                '\'' | '"' | '`' => quote = Some(c),
                '[' => quote = Some(']'),
                '?' => count += 1,
                _ => {}
            },
        }
    }
    count
}

/// First numbered or named parameter (`?1`, `:name`, `@name`, `$name`)
/// outside quoted text, if any.
pub(crate) fn find_bound_name(sql: &str) -> Option<String> {
    let mut quote: Option<char> = None;
    let mut prev = ' ';
    let mut chars = sql.char_indices().peekable();
    while let Some((start, c)) = chars.next() {
        let after_word = prev.is_alphanumeric() || prev == '_';
        prev = c;
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None => match c {
                '\'' | '"' | '`' => quote = Some(c),
                '[' => quote = Some(']'),
                '?' | ':' | '@' | '$' if !(after_word && c == '$') => {
                    let numbered = c == '?';
                    let mut end = start + c.len_utf8();
                    while let Some(&(i, next)) = chars.peek() {
                        let part_of_name = if numbered {
                            next.is_ascii_digit()
                        } else {
                            next.is_alphanumeric() || next == '_'
                        };
                        if !part_of_name {
                            break;
                        }
                        end = i + next.len_utf8();
                        chars.next();
                    }
                    if end > start + c.len_utf8() {
                        return Some(sql[start..end].to_string());
                    }
                }
                _ => {}
            },
        }
    }
    None
}

/// A SQL statement with its bound arguments, in placeholder order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SqlInfo {
    sql: String,
    args: Vec<SqlValue>,
}

impl SqlInfo {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args(sql: impl Into<String>, args: Vec<SqlValue>) -> Self {
        Self {
            sql: sql.into(),
            args,
        }
    }

    pub fn add_arg(&mut self, value: impl ToSqlValue) -> &mut Self {
        self.args.push(value.to_sql_value());
        self
    }

    pub fn add_args<I>(&mut self, values: I) -> &mut Self
    where
        I: IntoIterator<Item = SqlValue>,
    {
        self.args.extend(values);
        self
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn args(&self) -> &[SqlValue] {
        &self.args
    }

    pub fn into_parts(self) -> (String, Vec<SqlValue>) {
        (self.sql, self.args)
    }
}

impl fmt::Display for SqlInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.sql)?;
        if !self.args.is_empty() {
            let args: Vec<String> = self.args.iter().map(describe_value).collect();
            write!(f, " [{}]", args.join(", "))?;
        }
        Ok(())
    }
}

/// A column assignment for predicate-scoped updates.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyValue {
    pub column: String,
    pub value: SqlValue,
}

impl KeyValue {
    pub fn new(column: impl Into<String>, value: impl ToSqlValue) -> Self {
        Self {
            column: column.into(),
            value: value.to_sql_value(),
        }
    }
}
