//! Generic row model for raw queries.

use rusqlite::Row;
use serde_json::{Map, Number, Value as JsonValue};

use crate::converter::ConverterRegistry;
use crate::error::Result;
use crate::value::SqlValue;

/// One result row as column name → raw value, in select-list order.
///
/// Lookups are case-insensitive, matching SQLite's column name rules.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DbModel {
    entries: Vec<(String, SqlValue)>,
}

impl DbModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Capture every column of a row.
    pub fn from_row(row: &Row<'_>) -> Result<Self> {
        let stmt = row.as_ref();
        let mut entries = Vec::with_capacity(stmt.column_count());
        for i in 0..stmt.column_count() {
            let name = stmt.column_name(i)?.to_string();
            entries.push((name, SqlValue::from(row.get_ref(i)?)));
        }
        Ok(Self { entries })
    }

    /// Set a column, replacing an existing value of the same name.
    pub fn insert(&mut self, column: impl Into<String>, value: SqlValue) {
        let column = column.into();
        match self.position(&column) {
            Some(i) => self.entries[i].1 = value,
            None => self.entries.push((column, value)),
        }
    }

    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.position(column).map(|i| &self.entries[i].1)
    }

    pub fn contains(&self, column: &str) -> bool {
        self.position(column).is_some()
    }

    /// True when the column is missing or NULL.
    pub fn is_null(&self, column: &str) -> bool {
        matches!(self.get(column), None | Some(SqlValue::Null))
    }

    pub fn get_i64(&self, column: &str) -> Option<i64> {
        match self.get(column)? {
            SqlValue::Integer(i) => Some(*i),
            SqlValue::Real(f) => Some(*f as i64),
            SqlValue::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn get_f64(&self, column: &str) -> Option<f64> {
        match self.get(column)? {
            SqlValue::Real(f) => Some(*f),
            SqlValue::Integer(i) => Some(*i as f64),
            SqlValue::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn get_bool(&self, column: &str) -> Option<bool> {
        self.get_i64(column).map(|i| i != 0)
    }

    pub fn get_str(&self, column: &str) -> Option<&str> {
        match self.get(column)? {
            SqlValue::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn get_blob(&self, column: &str) -> Option<&[u8]> {
        match self.get(column)? {
            SqlValue::Blob(b) => Some(b.as_slice()),
            _ => None,
        }
    }

    /// Decode a column through `T`'s registered converter. NULL and missing
    /// columns yield `None`.
    pub fn get_as<T: 'static>(&self, column: &str, registry: &ConverterRegistry) -> Result<Option<T>> {
        match self.get(column) {
            None | Some(SqlValue::Null) => Ok(None),
            Some(value) => registry.decode::<T>(value).map(Some),
        }
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &SqlValue)> {
        self.entries.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// JSON object view of the row. Blobs become arrays of bytes.
    pub fn to_json(&self) -> JsonValue {
        let mut map = Map::new();
        for (name, value) in &self.entries {
            let json = match value {
                SqlValue::Null => JsonValue::Null,
                SqlValue::Integer(i) => JsonValue::from(*i),
                SqlValue::Real(f) => Number::from_f64(*f)
                    .map(JsonValue::Number)
                    .unwrap_or(JsonValue::Null),
                SqlValue::Text(s) => JsonValue::String(s.clone()),
                SqlValue::Blob(b) => JsonValue::from(b.clone()),
            };
            map.insert(name.clone(), json);
        }
        JsonValue::Object(map)
    }

    fn position(&self, column: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|(name, _)| name.eq_ignore_ascii_case(column))
    }
}
