//! Integer-backed enum columns.
//!
//! Enumerations persist as a single INTEGER. Codes the enum does not know
//! (written by a newer release, or by hand) decode to the declared fallback
//! variant instead of failing the whole row.

use std::marker::PhantomData;

use super::ColumnConverter;
use crate::error::Result;
use crate::value::{ColumnKind, SqlValue};

/// An enumeration with a stable integer code per variant.
pub trait IntEnum: Copy + Send + Sync + 'static {
    /// Variant returned for codes [`from_code`](IntEnum::from_code) rejects.
    const FALLBACK: Self;

    fn code(self) -> i64;

    fn from_code(code: i64) -> Option<Self>;
}

/// Converter for any [`IntEnum`].
pub struct IntEnumConverter<T>(PhantomData<fn() -> T>);

impl<T: IntEnum> IntEnumConverter<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T: IntEnum> Default for IntEnumConverter<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: IntEnum> ColumnConverter<T> for IntEnumConverter<T> {
    fn column_kind(&self) -> ColumnKind {
        ColumnKind::Integer
    }

    fn encode(&self, value: &T) -> Result<SqlValue> {
        Ok(SqlValue::Integer(value.code()))
    }

    fn decode(&self, value: &SqlValue) -> Result<T> {
        let decoded = match value {
            SqlValue::Integer(code) => T::from_code(*code),
            SqlValue::Text(s) => s.trim().parse::<i64>().ok().and_then(T::from_code),
            _ => None,
        };
        Ok(decoded.unwrap_or_else(|| {
            tracing::debug!(
                value_type = std::any::type_name::<T>(),
                "unknown enum code, using fallback"
            );
            T::FALLBACK
        }))
    }
}
