//! Column type conversion.
//!
//! A [`ColumnConverter<T>`] maps an in-memory value type onto one storage
//! column. The [`ConverterRegistry`] holds one converter per value type and is
//! shared by every manager created from the same
//! [`PersistenceContext`](crate::PersistenceContext).
//!
//! Lookup order for a type `T`:
//! 1. a converter registered explicitly with [`ConverterRegistry::register`];
//! 2. when resolved through [`ConverterRegistry::lookup_self_describing`], the
//!    converter `T` supplies itself via [`SelfDescribing`], instantiated once
//!    and cached;
//! 3. otherwise [`DbError::UnsupportedColumnType`].

mod builtin;
mod enums;

use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::error::{DbError, Result};
use crate::value::{ColumnKind, SqlValue};

pub use builtin::{
    BlobConverter, BoolConverter, CharConverter, DateConverter, DateTimeConverter,
    FloatConverter, IntegerConverter, JsonConverter, NaiveDateTimeConverter, TextConverter,
    U64Converter, UuidConverter,
};
pub use enums::{IntEnum, IntEnumConverter};

/// Bidirectional mapping between a value type and a storage column.
///
/// Converters are stateless; the registry hands out shared instances.
pub trait ColumnConverter<T>: Send + Sync {
    /// Storage kind used when the column is declared.
    fn column_kind(&self) -> ColumnKind;

    /// Encode a value into its storage representation.
    fn encode(&self, value: &T) -> Result<SqlValue>;

    /// Decode a non-NULL storage value.
    fn decode(&self, value: &SqlValue) -> Result<T>;
}

/// Capability for value types that carry their own converter.
///
/// Consulted only when no converter for the type has been registered
/// explicitly.
pub trait SelfDescribing: Sized + 'static {
    fn column_converter() -> Arc<dyn ColumnConverter<Self>>;
}

type Slot = Box<dyn Any + Send + Sync>;

/// Registry of column converters keyed by value type.
pub struct ConverterRegistry {
    converters: RwLock<HashMap<TypeId, Slot>>,
}

impl ConverterRegistry {
    /// Create an empty registry without built-in converters.
    pub fn empty() -> Self {
        Self {
            converters: RwLock::new(HashMap::new()),
        }
    }

    /// Create a registry seeded with the built-in converters.
    pub fn with_builtins() -> Self {
        let registry = Self::empty();
        builtin::register_builtins(&registry);
        registry
    }

    /// Register a converter for `T`, replacing any existing one.
    pub fn register<T, C>(&self, converter: C)
    where
        T: 'static,
        C: ColumnConverter<T> + 'static,
    {
        self.register_shared::<T>(Arc::new(converter));
    }

    /// Register an already shared converter for `T`, replacing any existing one.
    pub fn register_shared<T: 'static>(&self, converter: Arc<dyn ColumnConverter<T>>) {
        let mut converters = self
            .converters
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if converters
            .insert(TypeId::of::<T>(), Box::new(converter))
            .is_some()
        {
            tracing::debug!(value_type = type_name::<T>(), "replaced column converter");
        }
    }

    /// Look up the explicitly registered converter for `T`.
    pub fn lookup<T: 'static>(&self) -> Result<Arc<dyn ColumnConverter<T>>> {
        self.find::<T>().ok_or(DbError::UnsupportedColumnType {
            type_name: type_name::<T>(),
        })
    }

    /// Look up the converter for a self-describing type.
    ///
    /// An explicitly registered converter wins. Otherwise the type's own
    /// converter is instantiated and cached; if another thread cached one
    /// first, that instance is returned and this one is discarded.
    pub fn lookup_self_describing<T: SelfDescribing>(&self) -> Result<Arc<dyn ColumnConverter<T>>> {
        if let Some(found) = self.find::<T>() {
            return Ok(found);
        }

        let created = T::column_converter();
        let mut converters = self
            .converters
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let slot = converters
            .entry(TypeId::of::<T>())
            .or_insert_with(|| Box::new(created));
        slot.downcast_ref::<Arc<dyn ColumnConverter<T>>>()
            .cloned()
            .ok_or(DbError::UnsupportedColumnType {
                type_name: type_name::<T>(),
            })
    }

    /// Whether a converter for `T` is currently registered.
    pub fn contains<T: 'static>(&self) -> bool {
        self.find::<T>().is_some()
    }

    /// Storage kind of `T`'s registered converter.
    pub fn column_kind<T: 'static>(&self) -> Result<ColumnKind> {
        Ok(self.lookup::<T>()?.column_kind())
    }

    /// Encode a value with its registered converter.
    pub fn encode<T: 'static>(&self, value: &T) -> Result<SqlValue> {
        self.lookup::<T>()?.encode(value)
    }

    /// Decode a storage value with `T`'s registered converter.
    pub fn decode<T: 'static>(&self, value: &SqlValue) -> Result<T> {
        self.lookup::<T>()?.decode(value)
    }

    fn find<T: 'static>(&self) -> Option<Arc<dyn ColumnConverter<T>>> {
        let converters = self
            .converters
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        converters
            .get(&TypeId::of::<T>())
            .and_then(|slot| slot.downcast_ref::<Arc<dyn ColumnConverter<T>>>())
            .cloned()
    }
}

impl Default for ConverterRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl std::fmt::Debug for ConverterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self
            .converters
            .read()
            .map(|c| c.len())
            .unwrap_or_default();
        f.debug_struct("ConverterRegistry")
            .field("converters", &count)
            .finish()
    }
}

/// Name a storage value's class for conversion errors.
pub(crate) fn storage_class(value: &SqlValue) -> &'static str {
    match value {
        SqlValue::Null => "NULL",
        SqlValue::Integer(_) => "INTEGER",
        SqlValue::Real(_) => "REAL",
        SqlValue::Text(_) => "TEXT",
        SqlValue::Blob(_) => "BLOB",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[derive(Debug, Clone, PartialEq)]
    struct Celsius(f64);

    struct CelsiusConverter;

    impl ColumnConverter<Celsius> for CelsiusConverter {
        fn column_kind(&self) -> ColumnKind {
            ColumnKind::Real
        }

        fn encode(&self, value: &Celsius) -> Result<SqlValue> {
            Ok(SqlValue::Real(value.0))
        }

        fn decode(&self, value: &SqlValue) -> Result<Celsius> {
            match value {
                SqlValue::Real(f) => Ok(Celsius(*f)),
                other => Err(DbError::conversion(
                    type_name::<Celsius>(),
                    format!("expected REAL, got {}", storage_class(other)),
                )),
            }
        }
    }

    /// Stored as tenths of a degree.
    struct TenthsConverter;

    impl ColumnConverter<Celsius> for TenthsConverter {
        fn column_kind(&self) -> ColumnKind {
            ColumnKind::Integer
        }

        fn encode(&self, value: &Celsius) -> Result<SqlValue> {
            Ok(SqlValue::Integer((value.0 * 10.0).round() as i64))
        }

        fn decode(&self, value: &SqlValue) -> Result<Celsius> {
            match value {
                SqlValue::Integer(i) => Ok(Celsius(*i as f64 / 10.0)),
                other => Err(DbError::conversion(
                    type_name::<Celsius>(),
                    format!("expected INTEGER, got {}", storage_class(other)),
                )),
            }
        }
    }

    static INSTANTIATIONS: AtomicUsize = AtomicUsize::new(0);

    #[derive(Debug, PartialEq)]
    struct Label(String);

    struct LabelConverter;

    impl ColumnConverter<Label> for LabelConverter {
        fn column_kind(&self) -> ColumnKind {
            ColumnKind::Text
        }

        fn encode(&self, value: &Label) -> Result<SqlValue> {
            Ok(SqlValue::Text(value.0.clone()))
        }

        fn decode(&self, value: &SqlValue) -> Result<Label> {
            match value {
                SqlValue::Text(s) => Ok(Label(s.clone())),
                other => Err(DbError::conversion(type_name::<Label>(), storage_class(other))),
            }
        }
    }

    impl SelfDescribing for Label {
        fn column_converter() -> Arc<dyn ColumnConverter<Self>> {
            INSTANTIATIONS.fetch_add(1, Ordering::SeqCst);
            Arc::new(LabelConverter)
        }
    }

    #[test]
    fn unregistered_type_fails_lookup() {
        let registry = ConverterRegistry::with_builtins();
        let err = registry.lookup::<Celsius>().err().unwrap();
        match err {
            DbError::UnsupportedColumnType { type_name } => assert!(type_name.contains("Celsius")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn register_then_lookup() {
        let registry = ConverterRegistry::with_builtins();
        registry.register::<Celsius, _>(CelsiusConverter);
        let encoded = registry.encode(&Celsius(21.5)).unwrap();
        assert_eq!(encoded, SqlValue::Real(21.5));
        assert_eq!(registry.decode::<Celsius>(&encoded).unwrap(), Celsius(21.5));
        assert_eq!(registry.column_kind::<Celsius>().unwrap(), ColumnKind::Real);
    }

    #[test]
    fn last_registration_wins() {
        let registry = ConverterRegistry::with_builtins();
        registry.register::<Celsius, _>(CelsiusConverter);
        registry.register::<Celsius, _>(TenthsConverter);
        assert_eq!(registry.column_kind::<Celsius>().unwrap(), ColumnKind::Integer);
        assert_eq!(
            registry.encode(&Celsius(21.5)).unwrap(),
            SqlValue::Integer(215)
        );
    }

    #[test]
    fn self_describing_type_is_instantiated_once_under_contention() {
        let registry = Arc::new(ConverterRegistry::with_builtins());
        assert!(!registry.contains::<Label>());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    let converter = registry.lookup_self_describing::<Label>().unwrap();
                    converter.encode(&Label("x".into())).unwrap()
                })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), SqlValue::Text("x".into()));
        }

        assert!(registry.contains::<Label>());
        let before = INSTANTIATIONS.load(Ordering::SeqCst);
        registry.lookup_self_describing::<Label>().unwrap();
        assert_eq!(INSTANTIATIONS.load(Ordering::SeqCst), before);
    }

    #[test]
    fn empty_registry_has_no_builtins() {
        let registry = ConverterRegistry::empty();
        assert!(!registry.contains::<i64>());
        assert!(ConverterRegistry::default().contains::<i64>());
    }
}
