//! The prepared-statement surface used by native bindings.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use decentdb_core::{ColumnDef, ColumnType, Engine, StatementPlan, StepResult};
use decentdb_types::{OpenOptions, Value, ValueKind};
use decentdb_vfs::MemoryVfs;

fn open(vfs: &MemoryVfs, path: &Path) -> Arc<Engine> {
    Engine::open_with_vfs(Arc::new(vfs.clone()), path, OpenOptions::default()).unwrap()
}

fn setup(db: &Arc<Engine>) {
    db.exec_prepared_non_select(
        StatementPlan::CreateTable {
            table: "notes".to_owned(),
            columns: vec![
                ColumnDef::new("id", ColumnType::Int64).primary_key(),
                ColumnDef::new("body", ColumnType::Text),
                ColumnDef::new("score", ColumnType::Float64),
            ],
        },
        Vec::new(),
    )
    .unwrap();
}

#[test]
fn test_insert_and_scan_via_statements() {
    let vfs = MemoryVfs::new();
    let db = open(&vfs, &PathBuf::from("/s1.db"));
    setup(&db);

    for (id, body, score) in [(1, "first", 0.5), (2, "second", 1.5)] {
        let affected = db
            .exec_prepared_non_select(
                StatementPlan::Insert {
                    table: "notes".to_owned(),
                },
                vec![
                    Value::Int64(id),
                    Value::Text(body.as_bytes().to_vec()),
                    Value::Float64(score),
                ],
            )
            .unwrap();
        assert_eq!(affected, 1);
    }

    let mut stmt = db.prepare(StatementPlan::Scan {
        table: "notes".to_owned(),
    });
    assert_eq!(stmt.step().unwrap(), StepResult::Row);
    assert_eq!(stmt.column_count(), 3);
    assert_eq!(stmt.column_int64(0).unwrap(), 1);
    assert_eq!(stmt.column_text(1).unwrap(), b"first");
    assert_eq!(stmt.column_float64(2).unwrap(), 0.5);
    assert_eq!(stmt.column_type(1).unwrap(), ValueKind::Text);
    assert_eq!(stmt.column_name(1).unwrap(), "body");

    assert_eq!(stmt.step().unwrap(), StepResult::Row);
    assert_eq!(stmt.column_int64(0).unwrap(), 2);
    assert_eq!(stmt.step().unwrap(), StepResult::Done);
    stmt.finalize();
}

#[test]
fn test_seek_rowid_and_row_view() {
    let vfs = MemoryVfs::new();
    let db = open(&vfs, &PathBuf::from("/s2.db"));
    setup(&db);
    db.exec_prepared_non_select(
        StatementPlan::Insert {
            table: "notes".to_owned(),
        },
        vec![Value::Int64(7), Value::Text(b"seven".to_vec()), Value::Null],
    )
    .unwrap();

    let mut stmt = db.prepare(StatementPlan::SeekRowid {
        table: "notes".to_owned(),
    });
    stmt.bind_int64(0, 7).unwrap();
    assert_eq!(stmt.step().unwrap(), StepResult::Row);
    assert_eq!(stmt.current_rowid().unwrap(), 7);
    let view = stmt.row_view().unwrap();
    assert_eq!(view[1], Value::Text(b"seven".to_vec()));
    assert!(view[2].is_null());
    assert_eq!(stmt.step().unwrap(), StepResult::Done);

    // Reset + rebind finds a different (missing) row.
    stmt.reset();
    stmt.bind_int64(0, 8).unwrap();
    assert_eq!(stmt.step().unwrap(), StepResult::Done);
}

#[test]
fn test_update_delete_rows_affected() {
    let vfs = MemoryVfs::new();
    let db = open(&vfs, &PathBuf::from("/s3.db"));
    setup(&db);
    db.exec_prepared_non_select(
        StatementPlan::Insert {
            table: "notes".to_owned(),
        },
        vec![Value::Int64(1), Value::Text(b"x".to_vec()), Value::Null],
    )
    .unwrap();

    let affected = db
        .exec_prepared_non_select(
            StatementPlan::Update {
                table: "notes".to_owned(),
            },
            vec![
                Value::Int64(1),
                Value::Int64(1),
                Value::Text(b"y".to_vec()),
                Value::Null,
            ],
        )
        .unwrap();
    assert_eq!(affected, 1);

    let affected = db
        .exec_prepared_non_select(
            StatementPlan::Delete {
                table: "notes".to_owned(),
            },
            vec![Value::Int64(99)],
        )
        .unwrap();
    assert_eq!(affected, 0);
}

#[test]
fn test_autocommit_rolls_back_on_error() {
    let vfs = MemoryVfs::new();
    let db = open(&vfs, &PathBuf::from("/s4.db"));
    setup(&db);

    // Wrong arity: the auto-begun transaction must be rolled back.
    let err = db
        .exec_prepared_non_select(
            StatementPlan::Insert {
                table: "notes".to_owned(),
            },
            vec![Value::Int64(1)],
        )
        .unwrap_err();
    assert_eq!(err.kind_name(), "sql");
    assert!(!db.in_transaction());
    assert_eq!(db.count_rows(None, "notes").unwrap(), 0);

    // The latch at the binding boundary remembers it.
    let (kind, message) = db.last_error().unwrap();
    assert_eq!(kind, "sql");
    assert!(message.contains("columns"));
}

#[test]
fn test_statement_respects_open_transaction() {
    let vfs = MemoryVfs::new();
    let db = open(&vfs, &PathBuf::from("/s5.db"));
    setup(&db);

    db.begin().unwrap();
    db.exec_prepared_non_select(
        StatementPlan::Insert {
            table: "notes".to_owned(),
        },
        vec![Value::Int64(1), Value::Null, Value::Null],
    )
    .unwrap();
    // Still uncommitted: the statement ran inside our transaction.
    assert!(db.in_transaction());
    db.rollback().unwrap();
    assert_eq!(db.count_rows(None, "notes").unwrap(), 0);
}

#[test]
fn test_index_seek_statement() {
    let vfs = MemoryVfs::new();
    let db = open(&vfs, &PathBuf::from("/s6.db"));
    setup(&db);
    for i in 0..10_i64 {
        db.exec_prepared_non_select(
            StatementPlan::Insert {
                table: "notes".to_owned(),
            },
            vec![
                Value::Int64(i + 1),
                Value::Text(format!("body-{i}").into_bytes()),
                Value::Null,
            ],
        )
        .unwrap();
    }
    db.exec_prepared_non_select(
        StatementPlan::CreateIndex {
            table: "notes".to_owned(),
            column: "body".to_owned(),
            unique: false,
        },
        Vec::new(),
    )
    .unwrap();

    let mut stmt = db.prepare(StatementPlan::IndexSeek {
        index: "notes_body_idx".to_owned(),
    });
    stmt.bind_text(0, "body-4").unwrap();
    assert_eq!(stmt.step().unwrap(), StepResult::Row);
    assert_eq!(stmt.current_rowid().unwrap(), 5);
    assert_eq!(stmt.step().unwrap(), StepResult::Done);
}

#[test]
fn test_bind_after_step_requires_reset() {
    let vfs = MemoryVfs::new();
    let db = open(&vfs, &PathBuf::from("/s7.db"));
    setup(&db);
    let mut stmt = db.prepare(StatementPlan::Scan {
        table: "notes".to_owned(),
    });
    assert_eq!(stmt.step().unwrap(), StepResult::Done);
    assert!(stmt.bind_int64(0, 1).is_err());
    stmt.reset();
    stmt.bind_int64(0, 1).unwrap();
}
