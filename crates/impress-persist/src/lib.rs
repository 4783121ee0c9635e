//! impress-persist: embedded object-relational persistence for impress apps
//!
//! This library provides:
//! - Entity metadata derived once per record type ([`Entity`], [`EntityMetadata`])
//! - Column converters between Rust values and SQLite storage classes
//! - Lazy table creation and additive schema evolution
//! - Versioned databases with upgrade and downgrade callbacks
//! - Composable predicates and fluent selectors
//! - Raw SQL access returning untyped [`DbModel`] rows
//!
//! Databases are opened through a [`PersistenceContext`], which hands out one
//! shared [`DbManager`] per database identity.

pub mod config;
pub mod context;
pub mod converter;
pub mod entity;
pub mod error;
pub mod manager;
pub mod model;
pub mod query;
pub mod selector;
pub mod sql_info;
pub mod sql_query;
pub mod table;
pub mod value;

mod sql_builder;

pub use config::DbConfig;
pub use context::{DbIdentity, PersistenceContext};
pub use converter::{ColumnConverter, ConverterRegistry, IntEnum, IntEnumConverter, SelfDescribing};
pub use entity::{Column, ColumnDescriptor, Entity, EntityDescriptor, EntityMetadata, IdColumn, MetadataCache};
pub use error::{DbError, Result};
pub use manager::{DbManager, SchemaUpgrade};
pub use model::DbModel;
pub use query::{OrderBy, Predicate, StatementSpec};
pub use selector::{ModelSelector, Selector};
pub use sql_info::{KeyValue, SqlInfo};
pub use sql_query::SqlFragment;
pub use table::{EnsureOutcome, TableManager};
pub use value::{ColumnKind, SqlValue, ToSqlValue};
