//! Entity-to-table metadata.
//!
//! Record types describe their table layout once through [`Entity::describe`].
//! The descriptor is resolved against a [`ConverterRegistry`] into an
//! immutable [`EntityMetadata`], cached per type by [`MetadataCache`].
//!
//! ```
//! use impress_persist::{Column, Entity, EntityDescriptor, IdColumn};
//!
//! #[derive(Default)]
//! struct Person {
//!     id: i64,
//!     name: String,
//!     score: f64,
//! }
//!
//! impl Entity for Person {
//!     fn describe() -> EntityDescriptor<Self> {
//!         EntityDescriptor::<Self>::new("person")
//!             .id(IdColumn::auto_increment("id", |p| &p.id, |p, v| p.id = v))
//!             .column(Column::<Self>::new("name", |p| &p.name, |p, v| p.name = v).not_null())
//!             .column(Column::<Self>::new("score", |p| &p.score, |p, v| p.score = v))
//!     }
//! }
//! ```

use std::any::{type_name, Any, TypeId};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

use rusqlite::Row;

use crate::converter::{ColumnConverter, ConverterRegistry, SelfDescribing};
use crate::error::{DbError, Result};
use crate::value::{ColumnKind, SqlValue};

/// A record type persisted to one table.
pub trait Entity: Default + Send + Sync + 'static {
    /// Describe the table layout. Must be pure and deterministic.
    fn describe() -> EntityDescriptor<Self>;
}

type Resolver<T> = fn(&ConverterRegistry) -> Result<Arc<dyn ColumnConverter<T>>>;
type KindFn = Box<dyn Fn(&ConverterRegistry) -> Result<ColumnKind> + Send + Sync>;
type EncodeFn<E> = Box<dyn Fn(&E, &ConverterRegistry) -> Result<SqlValue> + Send + Sync>;
type DecodeFn<E> = Box<dyn Fn(&mut E, &SqlValue, &ConverterRegistry) -> Result<()> + Send + Sync>;

/// Type-erased field access shared by id and regular columns.
struct Accessor<E> {
    kind: KindFn,
    encode: EncodeFn<E>,
    decode: DecodeFn<E>,
}

impl<E: 'static> Accessor<E> {
    fn required<T: 'static>(
        resolve: Resolver<T>,
        get: fn(&E) -> &T,
        set: fn(&mut E, T),
    ) -> Self {
        Self {
            kind: Box::new(move |registry: &ConverterRegistry| Ok(resolve(registry)?.column_kind())),
            encode: Box::new(move |entity: &E, registry: &ConverterRegistry| resolve(registry)?.encode(get(entity))),
            decode: Box::new(move |entity: &mut E, value: &SqlValue, registry: &ConverterRegistry| {
                // NULL leaves the field at its default
                if !matches!(value, SqlValue::Null) {
                    set(entity, resolve(registry)?.decode(value)?);
                }
                Ok(())
            }),
        }
    }

    fn optional<T: 'static>(
        resolve: Resolver<T>,
        get: fn(&E) -> &Option<T>,
        set: fn(&mut E, Option<T>),
    ) -> Self {
        Self {
            kind: Box::new(move |registry: &ConverterRegistry| Ok(resolve(registry)?.column_kind())),
            encode: Box::new(move |entity: &E, registry: &ConverterRegistry| match get(entity) {
                Some(value) => resolve(registry)?.encode(value),
                None => Ok(SqlValue::Null),
            }),
            decode: Box::new(move |entity: &mut E, value: &SqlValue, registry: &ConverterRegistry| {
                let decoded = match value {
                    SqlValue::Null => None,
                    other => Some(resolve(registry)?.decode(other)?),
                };
                set(entity, decoded);
                Ok(())
            }),
        }
    }
}

/// Primary key column of an entity.
pub struct IdColumn<E> {
    name: String,
    auto_increment: bool,
    access: Accessor<E>,
}

impl<E: 'static> IdColumn<E> {
    /// An id assigned by the database on insert. Must map to INTEGER.
    pub fn auto_increment<T: 'static>(
        name: impl Into<String>,
        get: fn(&E) -> &T,
        set: fn(&mut E, T),
    ) -> Self {
        Self::build(name, true, Accessor::required(ConverterRegistry::lookup::<T>, get, set))
    }

    /// An id assigned by the caller before saving.
    pub fn assigned<T: 'static>(
        name: impl Into<String>,
        get: fn(&E) -> &T,
        set: fn(&mut E, T),
    ) -> Self {
        Self::build(name, false, Accessor::required(ConverterRegistry::lookup::<T>, get, set))
    }

    /// Auto-increment id held as `Option<T>`; `None` means not yet saved.
    pub fn optional_auto_increment<T: 'static>(
        name: impl Into<String>,
        get: fn(&E) -> &Option<T>,
        set: fn(&mut E, Option<T>),
    ) -> Self {
        Self::build(name, true, Accessor::optional(ConverterRegistry::lookup::<T>, get, set))
    }

    pub fn optional_assigned<T: 'static>(
        name: impl Into<String>,
        get: fn(&E) -> &Option<T>,
        set: fn(&mut E, Option<T>),
    ) -> Self {
        Self::build(name, false, Accessor::optional(ConverterRegistry::lookup::<T>, get, set))
    }

    fn build(name: impl Into<String>, auto_increment: bool, access: Accessor<E>) -> Self {
        Self {
            name: name.into(),
            auto_increment,
            access,
        }
    }
}

/// A mapped, non-key column of an entity.
///
/// Write `Column::<Self>::new(..)` inside `describe`; the entity type cannot
/// be inferred through the chained flag setters.
pub struct Column<E> {
    name: String,
    not_null: bool,
    unique: bool,
    default_value: Option<String>,
    references: Option<(String, String)>,
    access: Accessor<E>,
}

impl<E: 'static> Column<E> {
    /// A required field whose type has a registered converter.
    pub fn new<T: 'static>(name: impl Into<String>, get: fn(&E) -> &T, set: fn(&mut E, T)) -> Self {
        Self::build(name, Accessor::required(ConverterRegistry::lookup::<T>, get, set))
    }

    /// An `Option<T>` field; `None` is stored as NULL.
    pub fn optional<T: 'static>(
        name: impl Into<String>,
        get: fn(&E) -> &Option<T>,
        set: fn(&mut E, Option<T>),
    ) -> Self {
        Self::build(name, Accessor::optional(ConverterRegistry::lookup::<T>, get, set))
    }

    /// A required field whose type supplies its own converter.
    pub fn self_describing<T: SelfDescribing>(
        name: impl Into<String>,
        get: fn(&E) -> &T,
        set: fn(&mut E, T),
    ) -> Self {
        Self::build(
            name,
            Accessor::required(ConverterRegistry::lookup_self_describing::<T>, get, set),
        )
    }

    pub fn optional_self_describing<T: SelfDescribing>(
        name: impl Into<String>,
        get: fn(&E) -> &Option<T>,
        set: fn(&mut E, Option<T>),
    ) -> Self {
        Self::build(
            name,
            Accessor::optional(ConverterRegistry::lookup_self_describing::<T>, get, set),
        )
    }

    pub fn not_null(mut self) -> Self {
        self.not_null = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// SQL literal used as the column default, e.g. `0` or `'draft'`.
    pub fn default_value(mut self, literal: impl Into<String>) -> Self {
        self.default_value = Some(literal.into());
        self
    }

    pub fn references(mut self, table: impl Into<String>, column: impl Into<String>) -> Self {
        self.references = Some((table.into(), column.into()));
        self
    }

    fn build(name: impl Into<String>, access: Accessor<E>) -> Self {
        Self {
            name: name.into(),
            not_null: false,
            unique: false,
            default_value: None,
            references: None,
            access,
        }
    }
}

/// Unresolved table layout returned by [`Entity::describe`].
pub struct EntityDescriptor<E> {
    table: String,
    ids: Vec<IdColumn<E>>,
    columns: Vec<Column<E>>,
    post_create: Vec<String>,
}

impl<E: 'static> EntityDescriptor<E> {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            ids: Vec::new(),
            columns: Vec::new(),
            post_create: Vec::new(),
        }
    }

    pub fn id(mut self, id: IdColumn<E>) -> Self {
        self.ids.push(id);
        self
    }

    pub fn column(mut self, column: Column<E>) -> Self {
        self.columns.push(column);
        self
    }

    /// SQL run once, right after the table is first created.
    pub fn post_create(mut self, sql: impl Into<String>) -> Self {
        self.post_create.push(sql.into());
        self
    }
}

/// Resolved description of one column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDescriptor {
    pub name: String,
    pub kind: ColumnKind,
    pub nullable: bool,
    pub unique: bool,
    pub default_value: Option<String>,
    pub references: Option<(String, String)>,
}

struct MappedColumn<E> {
    descriptor: ColumnDescriptor,
    encode: EncodeFn<E>,
    decode: DecodeFn<E>,
}

/// Immutable, resolved table layout of an entity type.
pub struct EntityMetadata<E> {
    table: String,
    auto_increment: bool,
    id: MappedColumn<E>,
    columns: Vec<MappedColumn<E>>,
    post_create: Vec<String>,
}

impl<E: Entity> EntityMetadata<E> {
    /// Resolve and validate `E`'s descriptor.
    pub fn derive(registry: &ConverterRegistry) -> Result<Self> {
        let descriptor = E::describe();
        let table = descriptor.table;
        if table.trim().is_empty() {
            return Err(DbError::schema(type_name::<E>(), "table name is empty"));
        }

        let mut ids = descriptor.ids;
        if ids.len() != 1 {
            return Err(DbError::schema(
                &table,
                format!("expected exactly one id column, found {}", ids.len()),
            ));
        }
        let id = ids.remove(0);
        let id_kind = (id.access.kind)(registry)?;
        if id.auto_increment && id_kind != ColumnKind::Integer {
            return Err(DbError::schema(
                &table,
                format!("auto-increment id '{}' must be INTEGER, not {}", id.name, id_kind),
            ));
        }

        let mut seen = HashSet::new();
        check_column_name(&table, &id.name, &mut seen)?;
        let auto_increment = id.auto_increment;
        let id = MappedColumn {
            descriptor: ColumnDescriptor {
                name: id.name,
                kind: id_kind,
                nullable: false,
                unique: false,
                default_value: None,
                references: None,
            },
            encode: id.access.encode,
            decode: id.access.decode,
        };

        let mut columns = Vec::with_capacity(descriptor.columns.len());
        for column in descriptor.columns {
            check_column_name(&table, &column.name, &mut seen)?;
            let kind = (column.access.kind)(registry)?;
            columns.push(MappedColumn {
                descriptor: ColumnDescriptor {
                    name: column.name,
                    kind,
                    nullable: !column.not_null,
                    unique: column.unique,
                    default_value: column.default_value,
                    references: column.references,
                },
                encode: column.access.encode,
                decode: column.access.decode,
            });
        }

        tracing::debug!(
            entity = type_name::<E>(),
            table = %table,
            columns = columns.len() + 1,
            "derived entity metadata"
        );

        Ok(Self {
            table,
            auto_increment,
            id,
            columns,
            post_create: descriptor.post_create,
        })
    }
}

impl<E> EntityMetadata<E> {
    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn id_column(&self) -> &ColumnDescriptor {
        &self.id.descriptor
    }

    pub fn is_auto_increment(&self) -> bool {
        self.auto_increment
    }

    /// Non-key columns in declaration order.
    pub fn columns(&self) -> impl Iterator<Item = &ColumnDescriptor> {
        self.columns.iter().map(|c| &c.descriptor)
    }

    /// Look up a column by name, including the id column.
    pub fn column(&self, name: &str) -> Option<&ColumnDescriptor> {
        if self.id.descriptor.name.eq_ignore_ascii_case(name) {
            return Some(&self.id.descriptor);
        }
        self.find(name).map(|c| &c.descriptor)
    }

    pub fn post_create(&self) -> &[String] {
        &self.post_create
    }

    /// Every mapped column name, id first. This is the select-list order
    /// [`decode_row`](Self::decode_row) expects.
    pub fn select_columns(&self) -> Vec<&str> {
        std::iter::once(self.id.descriptor.name.as_str())
            .chain(self.columns.iter().map(|c| c.descriptor.name.as_str()))
            .collect()
    }

    pub fn encode_id(&self, entity: &E, registry: &ConverterRegistry) -> Result<SqlValue> {
        (self.id.encode)(entity, registry)
    }

    /// Whether the entity carries an id. NULL is unbound, and so is 0 for
    /// an auto-increment id.
    pub fn id_is_bound(&self, entity: &E, registry: &ConverterRegistry) -> Result<bool> {
        Ok(match self.encode_id(entity, registry)? {
            SqlValue::Null => false,
            SqlValue::Integer(0) if self.auto_increment => false,
            _ => true,
        })
    }

    /// Encode all non-key columns in declaration order.
    pub fn encode_columns(&self, entity: &E, registry: &ConverterRegistry) -> Result<Vec<SqlValue>> {
        self.columns
            .iter()
            .map(|c| (c.encode)(entity, registry))
            .collect()
    }

    /// Encode a single non-key column by name.
    pub fn encode_column(
        &self,
        entity: &E,
        name: &str,
        registry: &ConverterRegistry,
    ) -> Result<SqlValue> {
        let column = self.find(name).ok_or_else(|| DbError::UnknownColumn {
            table: self.table.clone(),
            column: name.to_string(),
        })?;
        (column.encode)(entity, registry)
    }

    /// Write a database-generated row id back into the entity.
    pub fn bind_generated_id(
        &self,
        entity: &mut E,
        rowid: i64,
        registry: &ConverterRegistry,
    ) -> Result<()> {
        (self.id.decode)(entity, &SqlValue::Integer(rowid), registry)
    }

    /// Undo [`bind_generated_id`](Self::bind_generated_id) after a failed
    /// insert. Optional ids become `None`, plain ones 0.
    pub fn unbind_generated_id(&self, entity: &mut E, registry: &ConverterRegistry) -> Result<()> {
        (self.id.decode)(entity, &SqlValue::Null, registry)?;
        if self.id_is_bound(entity, registry)? {
            (self.id.decode)(entity, &SqlValue::Integer(0), registry)?;
        }
        Ok(())
    }

    /// Decode values laid out in [`select_columns`](Self::select_columns) order.
    pub fn decode_values(&self, values: &[SqlValue], registry: &ConverterRegistry) -> Result<E>
    where
        E: Default,
    {
        let expected = self.columns.len() + 1;
        if values.len() != expected {
            return Err(DbError::schema(
                &self.table,
                format!("expected {} values per row, got {}", expected, values.len()),
            ));
        }
        let mut entity = E::default();
        (self.id.decode)(&mut entity, &values[0], registry)?;
        for (column, value) in self.columns.iter().zip(&values[1..]) {
            (column.decode)(&mut entity, value, registry)?;
        }
        Ok(entity)
    }

    /// Decode a row selected with [`select_columns`](Self::select_columns).
    pub fn decode_row(&self, row: &Row<'_>, registry: &ConverterRegistry) -> Result<E>
    where
        E: Default,
    {
        let mut values = Vec::with_capacity(self.columns.len() + 1);
        for i in 0..=self.columns.len() {
            values.push(SqlValue::from(row.get_ref(i)?));
        }
        self.decode_values(&values, registry)
    }

    fn find(&self, name: &str) -> Option<&MappedColumn<E>> {
        self.columns
            .iter()
            .find(|c| c.descriptor.name.eq_ignore_ascii_case(name))
    }
}

impl<E> std::fmt::Debug for EntityMetadata<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityMetadata")
            .field("table", &self.table)
            .field("id", &self.id.descriptor)
            .field("auto_increment", &self.auto_increment)
            .field(
                "columns",
                &self.columns.iter().map(|c| &c.descriptor).collect::<Vec<_>>(),
            )
            .finish()
    }
}

fn check_column_name(table: &str, name: &str, seen: &mut HashSet<String>) -> Result<()> {
    if name.trim().is_empty() {
        return Err(DbError::schema(table, "column name is empty"));
    }
    if !seen.insert(name.to_ascii_lowercase()) {
        return Err(DbError::schema(table, format!("duplicate column '{}'", name)));
    }
    Ok(())
}

type CachedMetadata = Arc<dyn Any + Send + Sync>;

/// Per-type cache of derived [`EntityMetadata`].
#[derive(Default)]
pub struct MetadataCache {
    entries: RwLock<HashMap<TypeId, CachedMetadata>>,
}

impl MetadataCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return `E`'s metadata, deriving it on first use.
    ///
    /// Derivation happens outside the lock; when two threads race, the first
    /// insert wins and both get the same instance.
    pub fn get_or_derive<E: Entity>(
        &self,
        registry: &ConverterRegistry,
    ) -> Result<Arc<EntityMetadata<E>>> {
        if let Some(found) = self.get::<E>() {
            return Ok(found);
        }

        let derived: CachedMetadata = Arc::new(EntityMetadata::<E>::derive(registry)?);
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let entry = entries
            .entry(TypeId::of::<E>())
            .or_insert_with(|| derived)
            .clone();
        entry
            .downcast::<EntityMetadata<E>>()
            .map_err(|_| DbError::schema(type_name::<E>(), "cached metadata has the wrong type"))
    }

    pub fn get<E: Entity>(&self) -> Option<Arc<EntityMetadata<E>>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(&TypeId::of::<E>())
            .cloned()
            .and_then(|entry| entry.downcast::<EntityMetadata<E>>().ok())
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for MetadataCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataCache")
            .field("entries", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::converter::IntEnum;

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Person {
        id: i64,
        name: String,
        score: f64,
        nickname: Option<String>,
    }

    impl Entity for Person {
        fn describe() -> EntityDescriptor<Self> {
            EntityDescriptor::<Self>::new("person")
                .id(IdColumn::auto_increment("id", |p| &p.id, |p, v| p.id = v))
                .column(Column::<Self>::new("name", |p| &p.name, |p, v| p.name = v).not_null())
                .column(Column::<Self>::new("score", |p| &p.score, |p, v| p.score = v).default_value("0"))
                .column(Column::<Self>::optional("nickname", |p| &p.nickname, |p, v| p.nickname = v))
        }
    }

    #[derive(Default)]
    struct NoId {
        name: String,
    }

    impl Entity for NoId {
        fn describe() -> EntityDescriptor<Self> {
            EntityDescriptor::<Self>::new("no_id").column(Column::<Self>::new("name", |e| &e.name, |e, v| e.name = v))
        }
    }

    #[derive(Default)]
    struct Duplicate {
        id: i64,
        a: String,
    }

    impl Entity for Duplicate {
        fn describe() -> EntityDescriptor<Self> {
            EntityDescriptor::<Self>::new("dup")
                .id(IdColumn::assigned("id", |e| &e.id, |e, v| e.id = v))
                .column(Column::<Self>::new("a", |e| &e.a, |e, v| e.a = v))
                .column(Column::<Self>::new("A", |e| &e.a, |e, v| e.a = v))
        }
    }

    #[derive(Default)]
    struct TextAuto {
        key: String,
    }

    impl Entity for TextAuto {
        fn describe() -> EntityDescriptor<Self> {
            EntityDescriptor::<Self>::new("text_auto")
                .id(IdColumn::auto_increment("key", |e| &e.key, |e, v| e.key = v))
        }
    }

    struct Unregistered;

    #[derive(Default)]
    struct Holder {
        id: i64,
        value: Option<Box<Unregistered>>,
    }

    impl Entity for Holder {
        fn describe() -> EntityDescriptor<Self> {
            EntityDescriptor::<Self>::new("holder")
                .id(IdColumn::auto_increment("id", |e| &e.id, |e, v| e.id = v))
                .column(Column::<Self>::optional("value", |e| &e.value, |e, v| e.value = v))
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    enum Mood {
        #[default]
        Calm,
        Angry,
    }

    impl IntEnum for Mood {
        const FALLBACK: Self = Mood::Calm;

        fn code(self) -> i64 {
            self as i64
        }

        fn from_code(code: i64) -> Option<Self> {
            match code {
                0 => Some(Mood::Calm),
                1 => Some(Mood::Angry),
                _ => None,
            }
        }
    }

    impl SelfDescribing for Mood {
        fn column_converter() -> Arc<dyn ColumnConverter<Self>> {
            Arc::new(crate::converter::IntEnumConverter::<Mood>::new())
        }
    }

    #[derive(Default)]
    struct Pet {
        id: Option<i64>,
        mood: Mood,
    }

    impl Entity for Pet {
        fn describe() -> EntityDescriptor<Self> {
            EntityDescriptor::<Self>::new("pet")
                .id(IdColumn::optional_auto_increment("id", |e| &e.id, |e, v| e.id = v))
                .column(Column::<Self>::self_describing("mood", |e| &e.mood, |e, v| e.mood = v))
        }
    }

    #[test]
    fn derives_kinds_and_flags() {
        let registry = ConverterRegistry::with_builtins();
        let meta = EntityMetadata::<Person>::derive(&registry).unwrap();
        assert_eq!(meta.table(), "person");
        assert!(meta.is_auto_increment());
        assert_eq!(meta.id_column().kind, ColumnKind::Integer);
        assert_eq!(meta.select_columns(), vec!["id", "name", "score", "nickname"]);

        let name = meta.column("name").unwrap();
        assert_eq!(name.kind, ColumnKind::Text);
        assert!(!name.nullable);
        assert_eq!(meta.column("score").unwrap().default_value.as_deref(), Some("0"));
        assert!(meta.column("nickname").unwrap().nullable);
        assert!(meta.column("missing").is_none());
    }

    #[test]
    fn encode_and_decode_round_trip() {
        let registry = ConverterRegistry::with_builtins();
        let meta = EntityMetadata::<Person>::derive(&registry).unwrap();
        let person = Person {
            id: 7,
            name: "ada".into(),
            score: 2.5,
            nickname: None,
        };
        let mut values = vec![meta.encode_id(&person, &registry).unwrap()];
        values.extend(meta.encode_columns(&person, &registry).unwrap());
        assert_eq!(
            values,
            vec![
                SqlValue::Integer(7),
                SqlValue::Text("ada".into()),
                SqlValue::Real(2.5),
                SqlValue::Null,
            ]
        );
        assert_eq!(meta.decode_values(&values, &registry).unwrap(), person);
    }

    #[test]
    fn null_into_required_field_keeps_default() {
        let registry = ConverterRegistry::with_builtins();
        let meta = EntityMetadata::<Person>::derive(&registry).unwrap();
        let values = vec![
            SqlValue::Integer(1),
            SqlValue::Null,
            SqlValue::Null,
            SqlValue::Text("x".into()),
        ];
        let person = meta.decode_values(&values, &registry).unwrap();
        assert_eq!(person.name, "");
        assert_eq!(person.nickname.as_deref(), Some("x"));
    }

    #[test]
    fn id_binding() {
        let registry = ConverterRegistry::with_builtins();
        let meta = EntityMetadata::<Person>::derive(&registry).unwrap();
        let mut person = Person::default();
        assert!(!meta.id_is_bound(&person, &registry).unwrap());
        meta.bind_generated_id(&mut person, 42, &registry).unwrap();
        assert_eq!(person.id, 42);
        assert!(meta.id_is_bound(&person, &registry).unwrap());

        let pets = EntityMetadata::<Pet>::derive(&registry).unwrap();
        let mut pet = Pet::default();
        assert!(!pets.id_is_bound(&pet, &registry).unwrap());
        pets.bind_generated_id(&mut pet, 3, &registry).unwrap();
        assert_eq!(pet.id, Some(3));

        meta.unbind_generated_id(&mut person, &registry).unwrap();
        assert_eq!(person.id, 0);
        pets.unbind_generated_id(&mut pet, &registry).unwrap();
        assert_eq!(pet.id, None);
    }

    #[test]
    fn self_describing_column_resolves() {
        let registry = ConverterRegistry::with_builtins();
        let meta = EntityMetadata::<Pet>::derive(&registry).unwrap();
        assert_eq!(meta.column("mood").unwrap().kind, ColumnKind::Integer);
        let pet = Pet {
            id: Some(1),
            mood: Mood::Angry,
        };
        assert_eq!(
            meta.encode_column(&pet, "mood", &registry).unwrap(),
            SqlValue::Integer(1)
        );
    }

    #[test]
    fn invalid_descriptors_are_rejected() {
        let registry = ConverterRegistry::with_builtins();
        assert!(matches!(
            EntityMetadata::<NoId>::derive(&registry),
            Err(DbError::Schema { .. })
        ));
        assert!(matches!(
            EntityMetadata::<Duplicate>::derive(&registry),
            Err(DbError::Schema { .. })
        ));
        assert!(matches!(
            EntityMetadata::<TextAuto>::derive(&registry),
            Err(DbError::Schema { .. })
        ));
        assert!(matches!(
            EntityMetadata::<Holder>::derive(&registry),
            Err(DbError::UnsupportedColumnType { .. })
        ));
    }

    #[test]
    fn unknown_column_is_reported() {
        let registry = ConverterRegistry::with_builtins();
        let meta = EntityMetadata::<Person>::derive(&registry).unwrap();
        let err = meta
            .encode_column(&Person::default(), "age", &registry)
            .unwrap_err();
        assert!(matches!(err, DbError::UnknownColumn { ref column, .. } if column == "age"));
    }

    #[test]
    fn cache_derives_once_per_type() {
        let registry = ConverterRegistry::with_builtins();
        let cache = MetadataCache::new();
        assert!(cache.is_empty());
        let first = cache.get_or_derive::<Person>(&registry).unwrap();
        let second = cache.get_or_derive::<Person>(&registry).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);
        assert!(cache.get_or_derive::<NoId>(&registry).is_err());
        assert_eq!(cache.len(), 1);
    }
}
