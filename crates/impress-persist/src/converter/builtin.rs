//! Built-in converters seeded into every default registry.

use std::any::type_name;
use std::marker::PhantomData;

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use uuid::Uuid;

use super::{storage_class, ColumnConverter, ConverterRegistry};
use crate::error::{DbError, Result};
use crate::value::{ColumnKind, SqlValue};

pub(super) fn register_builtins(registry: &ConverterRegistry) {
    registry.register::<bool, _>(BoolConverter);
    registry.register::<i8, _>(IntegerConverter::<i8>::new());
    registry.register::<i16, _>(IntegerConverter::<i16>::new());
    registry.register::<i32, _>(IntegerConverter::<i32>::new());
    registry.register::<i64, _>(IntegerConverter::<i64>::new());
    registry.register::<u8, _>(IntegerConverter::<u8>::new());
    registry.register::<u16, _>(IntegerConverter::<u16>::new());
    registry.register::<u32, _>(IntegerConverter::<u32>::new());
    registry.register::<u64, _>(U64Converter);
    registry.register::<f32, _>(FloatConverter::<f32>::new());
    registry.register::<f64, _>(FloatConverter::<f64>::new());
    registry.register::<char, _>(CharConverter);
    registry.register::<String, _>(TextConverter);
    registry.register::<Vec<u8>, _>(BlobConverter);
    registry.register::<DateTime<Utc>, _>(DateTimeConverter);
    registry.register::<NaiveDateTime, _>(NaiveDateTimeConverter);
    registry.register::<NaiveDate, _>(DateConverter);
    registry.register::<Uuid, _>(UuidConverter);
    registry.register::<serde_json::Value, _>(JsonConverter);
}

fn mismatch<T>(expected: &str, got: &SqlValue) -> DbError {
    DbError::conversion(
        type_name::<T>(),
        format!("expected {}, got {}", expected, storage_class(got)),
    )
}

fn integer<T>(value: &SqlValue) -> Result<i64> {
    match value {
        SqlValue::Integer(i) => Ok(*i),
        other => Err(mismatch::<T>("INTEGER", other)),
    }
}

/// `bool` as INTEGER 0/1; any non-zero integer decodes as `true`.
pub struct BoolConverter;

impl ColumnConverter<bool> for BoolConverter {
    fn column_kind(&self) -> ColumnKind {
        ColumnKind::Integer
    }

    fn encode(&self, value: &bool) -> Result<SqlValue> {
        Ok(SqlValue::Integer(i64::from(*value)))
    }

    fn decode(&self, value: &SqlValue) -> Result<bool> {
        integer::<bool>(value).map(|i| i != 0)
    }
}

/// Fixed-width integers that fit in an `i64`.
pub struct IntegerConverter<T>(PhantomData<fn() -> T>);

impl<T> IntegerConverter<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for IntegerConverter<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ColumnConverter<T> for IntegerConverter<T>
where
    T: Copy + Into<i64> + TryFrom<i64>,
{
    fn column_kind(&self) -> ColumnKind {
        ColumnKind::Integer
    }

    fn encode(&self, value: &T) -> Result<SqlValue> {
        Ok(SqlValue::Integer((*value).into()))
    }

    fn decode(&self, value: &SqlValue) -> Result<T> {
        let raw = integer::<T>(value)?;
        T::try_from(raw).map_err(|_| {
            DbError::conversion(type_name::<T>(), format!("{} is out of range", raw))
        })
    }
}

/// `u64` stored as a signed INTEGER; values above `i64::MAX` are rejected.
pub struct U64Converter;

impl ColumnConverter<u64> for U64Converter {
    fn column_kind(&self) -> ColumnKind {
        ColumnKind::Integer
    }

    fn encode(&self, value: &u64) -> Result<SqlValue> {
        i64::try_from(*value)
            .map(SqlValue::Integer)
            .map_err(|_| DbError::conversion("u64", format!("{} exceeds i64::MAX", value)))
    }

    fn decode(&self, value: &SqlValue) -> Result<u64> {
        let raw = integer::<u64>(value)?;
        u64::try_from(raw).map_err(|_| DbError::conversion("u64", format!("{} is negative", raw)))
    }
}

/// Floating point numbers as REAL. Integers are accepted on decode since
/// SQLite may hand back integral values from untyped columns.
pub struct FloatConverter<T>(PhantomData<fn() -> T>);

impl<T> FloatConverter<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for FloatConverter<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl ColumnConverter<f64> for FloatConverter<f64> {
    fn column_kind(&self) -> ColumnKind {
        ColumnKind::Real
    }

    fn encode(&self, value: &f64) -> Result<SqlValue> {
        Ok(SqlValue::Real(*value))
    }

    fn decode(&self, value: &SqlValue) -> Result<f64> {
        match value {
            SqlValue::Real(f) => Ok(*f),
            SqlValue::Integer(i) => Ok(*i as f64),
            other => Err(mismatch::<f64>("REAL", other)),
        }
    }
}

impl ColumnConverter<f32> for FloatConverter<f32> {
    fn column_kind(&self) -> ColumnKind {
        ColumnKind::Real
    }

    fn encode(&self, value: &f32) -> Result<SqlValue> {
        Ok(SqlValue::Real(f64::from(*value)))
    }

    fn decode(&self, value: &SqlValue) -> Result<f32> {
        match value {
            SqlValue::Real(f) => Ok(*f as f32),
            SqlValue::Integer(i) => Ok(*i as f32),
            other => Err(mismatch::<f32>("REAL", other)),
        }
    }
}

/// `char` as its INTEGER code point.
pub struct CharConverter;

impl ColumnConverter<char> for CharConverter {
    fn column_kind(&self) -> ColumnKind {
        ColumnKind::Integer
    }

    fn encode(&self, value: &char) -> Result<SqlValue> {
        Ok(SqlValue::Integer(i64::from(u32::from(*value))))
    }

    fn decode(&self, value: &SqlValue) -> Result<char> {
        let raw = integer::<char>(value)?;
        u32::try_from(raw)
            .ok()
            .and_then(char::from_u32)
            .ok_or_else(|| DbError::conversion("char", format!("{} is not a code point", raw)))
    }
}

pub struct TextConverter;

impl ColumnConverter<String> for TextConverter {
    fn column_kind(&self) -> ColumnKind {
        ColumnKind::Text
    }

    fn encode(&self, value: &String) -> Result<SqlValue> {
        Ok(SqlValue::Text(value.clone()))
    }

    fn decode(&self, value: &SqlValue) -> Result<String> {
        match value {
            SqlValue::Text(s) => Ok(s.clone()),
            other => Err(mismatch::<String>("TEXT", other)),
        }
    }
}

pub struct BlobConverter;

impl ColumnConverter<Vec<u8>> for BlobConverter {
    fn column_kind(&self) -> ColumnKind {
        ColumnKind::Blob
    }

    fn encode(&self, value: &Vec<u8>) -> Result<SqlValue> {
        Ok(SqlValue::Blob(value.clone()))
    }

    fn decode(&self, value: &SqlValue) -> Result<Vec<u8>> {
        match value {
            SqlValue::Blob(b) => Ok(b.clone()),
            SqlValue::Text(s) => Ok(s.as_bytes().to_vec()),
            other => Err(mismatch::<Vec<u8>>("BLOB", other)),
        }
    }
}

fn from_millis<T>(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| DbError::conversion(type_name::<T>(), format!("{} ms is out of range", ms)))
}

/// Timestamps as INTEGER milliseconds since the Unix epoch.
pub struct DateTimeConverter;

impl ColumnConverter<DateTime<Utc>> for DateTimeConverter {
    fn column_kind(&self) -> ColumnKind {
        ColumnKind::Integer
    }

    fn encode(&self, value: &DateTime<Utc>) -> Result<SqlValue> {
        Ok(SqlValue::Integer(value.timestamp_millis()))
    }

    fn decode(&self, value: &SqlValue) -> Result<DateTime<Utc>> {
        from_millis::<DateTime<Utc>>(integer::<DateTime<Utc>>(value)?)
    }
}

/// Naive timestamps, interpreted as UTC.
pub struct NaiveDateTimeConverter;

impl ColumnConverter<NaiveDateTime> for NaiveDateTimeConverter {
    fn column_kind(&self) -> ColumnKind {
        ColumnKind::Integer
    }

    fn encode(&self, value: &NaiveDateTime) -> Result<SqlValue> {
        Ok(SqlValue::Integer(value.and_utc().timestamp_millis()))
    }

    fn decode(&self, value: &SqlValue) -> Result<NaiveDateTime> {
        from_millis::<NaiveDateTime>(integer::<NaiveDateTime>(value)?).map(|dt| dt.naive_utc())
    }
}

/// Calendar dates, stored as midnight UTC.
pub struct DateConverter;

impl ColumnConverter<NaiveDate> for DateConverter {
    fn column_kind(&self) -> ColumnKind {
        ColumnKind::Integer
    }

    fn encode(&self, value: &NaiveDate) -> Result<SqlValue> {
        let midnight = value
            .and_hms_opt(0, 0, 0)
            .ok_or_else(|| DbError::conversion("NaiveDate", "no midnight for date"))?;
        Ok(SqlValue::Integer(midnight.and_utc().timestamp_millis()))
    }

    fn decode(&self, value: &SqlValue) -> Result<NaiveDate> {
        from_millis::<NaiveDate>(integer::<NaiveDate>(value)?).map(|dt| dt.date_naive())
    }
}

/// UUIDs in their hyphenated TEXT form.
pub struct UuidConverter;

impl ColumnConverter<Uuid> for UuidConverter {
    fn column_kind(&self) -> ColumnKind {
        ColumnKind::Text
    }

    fn encode(&self, value: &Uuid) -> Result<SqlValue> {
        Ok(SqlValue::Text(value.to_string()))
    }

    fn decode(&self, value: &SqlValue) -> Result<Uuid> {
        match value {
            SqlValue::Text(s) => {
                Uuid::parse_str(s).map_err(|e| DbError::conversion("Uuid", e.to_string()))
            }
            other => Err(mismatch::<Uuid>("TEXT", other)),
        }
    }
}

/// Arbitrary JSON documents as TEXT.
pub struct JsonConverter;

impl ColumnConverter<serde_json::Value> for JsonConverter {
    fn column_kind(&self) -> ColumnKind {
        ColumnKind::Text
    }

    fn encode(&self, value: &serde_json::Value) -> Result<SqlValue> {
        serde_json::to_string(value)
            .map(SqlValue::Text)
            .map_err(|e| DbError::conversion("serde_json::Value", e.to_string()))
    }

    fn decode(&self, value: &SqlValue) -> Result<serde_json::Value> {
        match value {
            SqlValue::Text(s) => serde_json::from_str(s)
                .map_err(|e| DbError::conversion("serde_json::Value", e.to_string())),
            other => Err(mismatch::<serde_json::Value>("TEXT", other)),
        }
    }
}
