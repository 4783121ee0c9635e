//! Database manager integration tests
//!
//! Covers the entity lifecycle, schema versioning against real files,
//! transactional batches and the raw SQL escape hatch.

mod common;

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use common::{init_tracing, memory_db, Download, DownloadState, Person};
use impress_persist::query::{equal_to, greater_than};
use impress_persist::{
    Column, DbConfig, DbError, EnsureOutcome, Entity, EntityDescriptor, IdColumn,
    PersistenceContext, SqlInfo,
};
use tempfile::TempDir;

// === Entity lifecycle ===

#[test]
fn test_save_update_find_scenario() {
    let (_context, db) = memory_db("scenario");

    let mut ada = Person::new("ada", 1.5);
    db.save(&mut ada).unwrap();
    assert!(ada.id > 0, "generated id is bound back");

    ada.score = 9.0;
    assert_eq!(db.update(&ada, &[]).unwrap(), 1);

    let found = db.find_by_id::<Person>(ada.id).unwrap().unwrap();
    assert_eq!(found, ada);

    let by_name = db
        .find_first::<Person>(Some(equal_to("name", "ada")))
        .unwrap()
        .unwrap();
    assert_eq!(by_name.score, 9.0);
    assert!(db
        .find_first::<Person>(Some(equal_to("name", "grace")))
        .unwrap()
        .is_none());
}

#[test]
fn test_update_rejects_unknown_columns() {
    let (_context, db) = memory_db("unknown-columns");
    let mut p = Person::new("a", 1.0);
    db.save(&mut p).unwrap();
    assert!(matches!(
        db.update(&p, &["nickname"]),
        Err(DbError::UnknownColumn { .. })
    ));
    assert!(matches!(
        db.update(&Person::new("unsaved", 0.0), &[]),
        Err(DbError::UnboundId { .. })
    ));
}

#[test]
fn test_replace_and_delete_by_id() {
    let (_context, db) = memory_db("replace");
    let mut first = Download {
        url: "https://a.example/x.pdf".to_string(),
        state: DownloadState::Queued,
        size: None,
    };
    db.replace(&mut first).unwrap();

    let mut again = Download {
        state: DownloadState::Done,
        size: Some(1024),
        ..first.clone()
    };
    db.replace(&mut again).unwrap();
    assert_eq!(db.count::<Download>(None).unwrap(), 1);
    assert_eq!(
        db.find_by_id::<Download>("https://a.example/x.pdf").unwrap(),
        Some(again)
    );

    assert_eq!(db.delete_by_id::<Download>("https://a.example/x.pdf").unwrap(), 1);
    assert_eq!(db.delete_by_id::<Download>("https://a.example/x.pdf").unwrap(), 0);
}

#[test]
fn test_delete_all_is_transactional() {
    let (_context, db) = memory_db("delete-all");
    let mut people = vec![Person::new("a", 1.0), Person::new("b", 2.0), Person::new("c", 3.0)];
    db.save_all(&mut people).unwrap();

    assert_eq!(db.delete_all(&people[..2]).unwrap(), 2);
    let remaining = db.find_all::<Person>(None).unwrap();
    assert_eq!(remaining, vec![people[2].clone()]);

    let unsaved = vec![people[2].clone(), Person::new("new", 0.0)];
    assert!(matches!(db.delete_all(&unsaved), Err(DbError::UnboundId { .. })));
    assert_eq!(db.count::<Person>(None).unwrap(), 1);
}

#[test]
fn test_unknown_enum_code_decodes_to_fallback() {
    let (_context, db) = memory_db("enum-fallback");
    let mut d = Download {
        url: "u".to_string(),
        state: DownloadState::Running,
        size: Some(10),
    };
    db.save(&mut d).unwrap();
    db.exec_non_query(&SqlInfo::new("UPDATE download SET state = 99"))
        .unwrap();

    let loaded = db.find_by_id::<Download>("u").unwrap().unwrap();
    assert_eq!(loaded.state, DownloadState::Unknown);
    assert_eq!(loaded.size, Some(10));
}

// === Tables ===

#[test]
fn test_ensure_table_is_idempotent() {
    let (_context, db) = memory_db("ensure");
    assert!(!db.table_exists::<Person>().unwrap());
    assert_eq!(db.ensure_table::<Person>().unwrap(), EnsureOutcome::Created);
    for _ in 0..10 {
        assert_eq!(db.ensure_table::<Person>().unwrap(), EnsureOutcome::Known);
    }
    assert!(db.table_exists::<Person>().unwrap());

    db.drop_table::<Person>().unwrap();
    assert!(!db.table_exists::<Person>().unwrap());
    assert_eq!(db.ensure_table::<Person>().unwrap(), EnsureOutcome::Created);
}

#[test]
fn test_table_created_callback_seeds_rows() {
    init_tracing();
    let context = PersistenceContext::new();
    let db = context
        .open(DbConfig::in_memory("seeded").on_table_created(|conn, table| {
            if table == "person" {
                conn.execute("INSERT INTO person (name, score) VALUES ('root', 0)", [])?;
            }
            Ok(())
        }))
        .unwrap();

    assert_eq!(db.count::<Person>(None).unwrap(), 1);
    db.ensure_table::<Person>().unwrap();
    assert_eq!(db.count::<Person>(None).unwrap(), 1);
}

#[derive(Debug, Default, Clone, PartialEq)]
struct PersonV2 {
    id: i64,
    name: String,
    score: f64,
    email: Option<String>,
}

impl Entity for PersonV2 {
    fn describe() -> EntityDescriptor<Self> {
        EntityDescriptor::<Self>::new("person")
            .id(IdColumn::auto_increment("id", |p| &p.id, |p, v| p.id = v))
            .column(Column::<Self>::new("name", |p| &p.name, |p, v| p.name = v).not_null())
            .column(Column::<Self>::new("score", |p| &p.score, |p, v| p.score = v))
            .column(Column::<Self>::optional("email", |p| &p.email, |p, v| p.email = v))
    }
}

#[test]
fn test_new_columns_are_added_on_reopen() {
    init_tracing();
    let dir = TempDir::new().unwrap();

    let context = PersistenceContext::new();
    let db = context
        .open(DbConfig::new("evolve.db").with_directory(dir.path()))
        .unwrap();
    db.save(&mut Person::new("old", 1.0)).unwrap();
    db.close();

    let context = PersistenceContext::new();
    let db = context
        .open(DbConfig::new("evolve.db").with_directory(dir.path()))
        .unwrap();
    assert_eq!(db.ensure_table::<PersonV2>().unwrap(), EnsureOutcome::Existing);

    let old = db
        .find_first::<PersonV2>(Some(equal_to("name", "old")))
        .unwrap()
        .unwrap();
    assert_eq!(old.email, None);

    let mut new = PersonV2 {
        name: "new".to_string(),
        email: Some("new@example.com".to_string()),
        ..Default::default()
    };
    db.save(&mut new).unwrap();
    assert_eq!(db.find_by_id::<PersonV2>(new.id).unwrap(), Some(new));
}

// === Transactions ===

#[test]
fn test_failed_batch_leaves_no_rows() {
    let (_context, db) = memory_db("atomic");
    let mut people = vec![Person::new("a", 1.0), Person::new("b", 2.0)];
    db.save_all(&mut people).unwrap();

    // Reusing an existing id violates the primary key
    let mut batch = vec![
        Person::new("c", 3.0),
        Person {
            id: people[0].id,
            ..Person::new("dup", 0.0)
        },
    ];
    assert!(db.save_all(&mut batch).is_err());
    assert_eq!(db.count::<Person>(None).unwrap(), 2);
    assert_eq!(batch[0].id, 0, "generated id is unbound after rollback");
}

#[test]
fn test_explicit_transaction_rolls_back() {
    let (_context, db) = memory_db("explicit-tx");
    db.ensure_table::<Person>().unwrap();

    let result: impress_persist::Result<()> = db.transaction(|conn| {
        conn.execute("INSERT INTO person (name, score) VALUES ('x', 1)", [])?;
        Err(DbError::callback("abort"))
    });
    assert!(matches!(result, Err(DbError::Callback(_))));
    assert_eq!(db.count::<Person>(None).unwrap(), 0);

    db.transaction(|conn| {
        conn.execute("INSERT INTO person (name, score) VALUES ('y', 2)", [])?;
        Ok(())
    })
    .unwrap();
    assert_eq!(db.count::<Person>(None).unwrap(), 1);
}

#[test]
fn test_without_transactions_partial_batches_persist() {
    init_tracing();
    let context = PersistenceContext::new();
    let db = context
        .open(DbConfig::in_memory("no-tx").allow_transaction(false))
        .unwrap();
    let mut first = Person::new("a", 1.0);
    db.save(&mut first).unwrap();

    let mut batch = vec![
        Person::new("b", 2.0),
        Person {
            id: first.id,
            ..Person::new("dup", 0.0)
        },
    ];
    assert!(db.save_all(&mut batch).is_err());
    assert_eq!(db.count::<Person>(None).unwrap(), 2);
    assert!(batch[0].id > 0);
}

// === Versioning ===

fn file_config(dir: &TempDir, version: u32) -> DbConfig {
    DbConfig::new("library.db")
        .with_directory(dir.path())
        .with_version(version)
}

fn stored_user_version(dir: &TempDir) -> i64 {
    let conn = rusqlite::Connection::open(dir.path().join("library.db")).unwrap();
    conn.query_row("PRAGMA user_version", [], |row| row.get(0))
        .unwrap()
}

#[test]
fn test_upgrade_runs_once() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    {
        let context = PersistenceContext::new();
        let db = context.open(file_config(&dir, 1)).unwrap();
        db.save(&mut Person::new("kept", 1.0)).unwrap();
        assert_eq!(db.stored_version().unwrap(), 1);
        context.close_all();
    }

    let calls = Arc::new(AtomicUsize::new(0));
    for _ in 0..2 {
        let counter = Arc::clone(&calls);
        let context = PersistenceContext::new();
        let db = context
            .open(file_config(&dir, 2).on_upgrade(move |schema| {
                assert_eq!((schema.old_version(), schema.new_version()), (1, 2));
                counter.fetch_add(1, Ordering::SeqCst);
                schema.add_column("person", "email TEXT");
                Ok(())
            }))
            .unwrap();
        assert_eq!(db.count::<Person>(None).unwrap(), 1);
        assert_eq!(db.stored_version().unwrap(), 2);
        context.close_all();
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(stored_user_version(&dir), 2);
}

#[test]
fn test_default_upgrade_drops_tables() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    {
        let context = PersistenceContext::new();
        let db = context.open(file_config(&dir, 1)).unwrap();
        db.save(&mut Person::new("gone", 1.0)).unwrap();
        db.close();
    }

    let context = PersistenceContext::new();
    let db = context.open(file_config(&dir, 3)).unwrap();
    assert_eq!(db.count::<Person>(None).unwrap(), 0);
    assert_eq!(db.stored_version().unwrap(), 3);
}

#[test]
fn test_failed_upgrade_keeps_version_and_retries() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    {
        let context = PersistenceContext::new();
        let db = context.open(file_config(&dir, 1)).unwrap();
        db.save(&mut Person::new("survivor", 1.0)).unwrap();
        db.close();
    }

    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);
    let context = PersistenceContext::new();
    let db = context
        .open(file_config(&dir, 2).on_upgrade(move |schema| {
            schema.execute_batch("ALTER TABLE person ADD COLUMN email TEXT")?;
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(DbError::callback("migration failed"));
            }
            Ok(())
        }))
        .unwrap();

    match db.count::<Person>(None) {
        Err(DbError::Upgrade { from, to, .. }) => assert_eq!((from, to), (1, 2)),
        other => panic!("expected upgrade failure, got {:?}", other),
    }
    assert!(!db.is_open());
    assert_eq!(stored_user_version(&dir), 1);

    // The next operation retries; the rolled-back ALTER can run again
    assert_eq!(db.count::<Person>(None).unwrap(), 1);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert_eq!(db.stored_version().unwrap(), 2);
}

#[test]
fn test_downgrade_callback_and_default() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    {
        let context = PersistenceContext::new();
        let db = context.open(file_config(&dir, 5)).unwrap();
        db.ensure_table::<Person>().unwrap();
        db.close();
    }

    // Without a callback the newer file is left alone
    {
        let context = PersistenceContext::new();
        let db = context.open(file_config(&dir, 4)).unwrap();
        assert_eq!(db.stored_version().unwrap(), 5);
        db.close();
    }

    let seen = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&seen);
    let context = PersistenceContext::new();
    let db = context
        .open(file_config(&dir, 4).on_downgrade(move |schema| {
            assert_eq!((schema.old_version(), schema.new_version()), (5, 4));
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }))
        .unwrap();
    assert_eq!(db.stored_version().unwrap(), 5);
    assert_eq!(seen.load(Ordering::SeqCst), 1);
}

#[test]
fn test_open_callback_runs_per_connection() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let opened = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&opened);
    let context = PersistenceContext::new();
    let db = context
        .open(file_config(&dir, 1).on_open(move |conn| {
            counter.fetch_add(1, Ordering::SeqCst);
            conn.execute_batch("PRAGMA foreign_keys = ON")?;
            Ok(())
        }))
        .unwrap();
    assert_eq!(opened.load(Ordering::SeqCst), 0);
    db.ensure_table::<Person>().unwrap();
    db.count::<Person>(None).unwrap();
    assert_eq!(opened.load(Ordering::SeqCst), 1);
    assert!(dir.path().join("library.db").exists());
}

// === Raw SQL ===

#[test]
fn test_raw_sql_models() {
    let (_context, db) = memory_db("raw-models");
    let mut people = vec![Person::new("a", 1.0), Person::new("b", 4.0), Person::new("c", 7.0)];
    db.save_all(&mut people).unwrap();

    let mut info = SqlInfo::new("SELECT name, score * 2 AS doubled FROM person WHERE score > ? ORDER BY id");
    info.add_arg(2.0);
    let models = db.find_model_all(&info).unwrap();
    assert_eq!(models.len(), 2);
    assert_eq!(models[0].get_str("name"), Some("b"));
    assert_eq!(models[1].get_f64("DOUBLED"), Some(14.0));
    assert_eq!(models[0].to_json()["name"], "b");

    let mut names = Vec::new();
    db.exec_query(&SqlInfo::new("SELECT name FROM person ORDER BY name DESC"), |row| {
        names.push(row.get::<_, String>(0)?);
        Ok(ControlFlow::Continue(()))
    })
    .unwrap();
    assert_eq!(names, vec!["c", "b", "a"]);

    let deleted = db
        .exec_non_query(&SqlInfo::with_args(
            "DELETE FROM person WHERE score < ?",
            vec![impress_persist::SqlValue::Real(5.0)],
        ))
        .unwrap();
    assert_eq!(deleted, 2);
}

#[test]
fn test_update_where_and_delete_where() {
    let (_context, db) = memory_db("scoped");
    let mut people = vec![Person::new("a", 1.0), Person::new("b", 4.0), Person::new("c", 7.0)];
    db.save_all(&mut people).unwrap();

    let changed = db
        .update_where::<Person>(
            Some(greater_than("score", 3.0)),
            &[impress_persist::KeyValue::new("name", "high")],
        )
        .unwrap();
    assert_eq!(changed, 2);
    assert_eq!(db.count::<Person>(Some(equal_to("name", "high"))).unwrap(), 2);

    assert_eq!(db.delete_where::<Person>(None).unwrap(), 3);
    assert_eq!(db.count::<Person>(None).unwrap(), 0);
}

// === Lifecycle ===

#[test]
fn test_drop_db_clears_everything() {
    let (_context, db) = memory_db("drop-db");
    db.save(&mut Person::new("a", 1.0)).unwrap();
    db.save(&mut Download::default()).unwrap();

    db.drop_db().unwrap();
    assert!(!db.table_exists::<Person>().unwrap());
    assert!(!db.table_exists::<Download>().unwrap());

    // Tables come back on next use
    assert_eq!(db.count::<Person>(None).unwrap(), 0);
    assert!(db.table_exists::<Person>().unwrap());
}

#[test]
fn test_close_is_terminal() {
    let (context, db) = memory_db("terminal");
    db.save(&mut Person::new("a", 1.0)).unwrap();
    db.close();
    assert!(matches!(
        db.save(&mut Person::new("b", 1.0)),
        Err(DbError::Closed(_))
    ));
    assert!(context.is_empty());
}

#[test]
fn test_registry_is_shared_across_managers() {
    init_tracing();
    let context = PersistenceContext::new();
    let a = context.open(DbConfig::in_memory("one")).unwrap();
    let b = context.open(DbConfig::in_memory("two")).unwrap();

    a.ensure_table::<Person>().unwrap();
    b.ensure_table::<Person>().unwrap();
    assert_eq!(context.metadata().len(), 1);
    assert!(std::ptr::eq(a.converters(), b.converters()));
    assert!(std::ptr::eq(a.converters(), context.converters()));
}
