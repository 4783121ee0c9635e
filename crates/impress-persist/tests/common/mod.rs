//! Shared entities and setup for integration tests

#![allow(dead_code)]

use std::sync::Arc;

use impress_persist::{
    Column, ColumnConverter, DbConfig, DbManager, Entity, EntityDescriptor, IdColumn, IntEnum,
    IntEnumConverter, PersistenceContext, SelfDescribing,
};

/// Install a test-friendly tracing subscriber; `RUST_LOG` controls verbosity.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Fresh context plus an in-memory database named `name`
pub fn memory_db(name: &str) -> (PersistenceContext, Arc<DbManager>) {
    init_tracing();
    let context = PersistenceContext::new();
    let db = context
        .open(DbConfig::in_memory(name))
        .expect("in-memory config is valid");
    (context, db)
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct Person {
    pub id: i64,
    pub name: String,
    pub score: f64,
}

impl Person {
    pub fn new(name: &str, score: f64) -> Self {
        Self {
            id: 0,
            name: name.to_string(),
            score,
        }
    }
}

impl Entity for Person {
    fn describe() -> EntityDescriptor<Self> {
        EntityDescriptor::<Self>::new("person")
            .id(IdColumn::auto_increment("id", |p| &p.id, |p, v| p.id = v))
            .column(Column::<Self>::new("name", |p| &p.name, |p, v| p.name = v).not_null())
            .column(Column::<Self>::new("score", |p| &p.score, |p, v| p.score = v))
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum DownloadState {
    #[default]
    Unknown,
    Queued,
    Running,
    Done,
}

impl IntEnum for DownloadState {
    const FALLBACK: Self = DownloadState::Unknown;

    fn code(self) -> i64 {
        match self {
            DownloadState::Unknown => 0,
            DownloadState::Queued => 1,
            DownloadState::Running => 2,
            DownloadState::Done => 3,
        }
    }

    fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(DownloadState::Unknown),
            1 => Some(DownloadState::Queued),
            2 => Some(DownloadState::Running),
            3 => Some(DownloadState::Done),
            _ => None,
        }
    }
}

impl SelfDescribing for DownloadState {
    fn column_converter() -> Arc<dyn ColumnConverter<Self>> {
        Arc::new(IntEnumConverter::<DownloadState>::new())
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct Download {
    pub url: String,
    pub state: DownloadState,
    pub size: Option<i64>,
}

impl Entity for Download {
    fn describe() -> EntityDescriptor<Self> {
        EntityDescriptor::<Self>::new("download")
            .id(IdColumn::assigned("url", |d| &d.url, |d, v| d.url = v))
            .column(Column::<Self>::self_describing("state", |d| &d.state, |d, v| d.state = v))
            .column(Column::<Self>::optional("size", |d| &d.size, |d, v| d.size = v))
    }
}
