//! Constraint enforcement and bulk loading.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use decentdb_core::{ColumnDef, ColumnType, Engine};
use decentdb_types::{BulkOptions, Durability, OpenOptions, Value};
use decentdb_vfs::MemoryVfs;

fn open(vfs: &MemoryVfs, path: &Path) -> Arc<Engine> {
    Engine::open_with_vfs(Arc::new(vfs.clone()), path, OpenOptions::default()).unwrap()
}

fn setup_schema(db: &Engine) {
    db.begin().unwrap();
    db.create_table(
        "teams",
        vec![
            ColumnDef::new("id", ColumnType::Int64).primary_key(),
            ColumnDef::new("name", ColumnType::Text).not_null().unique(),
        ],
    )
    .unwrap();
    db.create_table(
        "users",
        vec![
            ColumnDef::new("id", ColumnType::Int64).primary_key(),
            ColumnDef::new("email", ColumnType::Text).unique(),
            ColumnDef::new("team_id", ColumnType::Int64).references("teams", "id"),
        ],
    )
    .unwrap();
    db.commit().unwrap();
}

fn team_row(id: i64, name: &str) -> Vec<Value> {
    vec![Value::Int64(id), Value::Text(name.as_bytes().to_vec())]
}

fn user_row(id: i64, email: &str, team: Option<i64>) -> Vec<Value> {
    vec![
        Value::Int64(id),
        Value::Text(email.as_bytes().to_vec()),
        team.map_or(Value::Null, Value::Int64),
    ]
}

#[test]
fn test_not_null_enforcement() {
    let vfs = MemoryVfs::new();
    let db = open(&vfs, &PathBuf::from("/c1.db"));
    setup_schema(&db);
    let meta = db.catalog_table("teams").unwrap();
    let err = db
        .enforce_not_null(&meta, &[Value::Int64(1), Value::Null])
        .unwrap_err();
    assert_eq!(err.kind_name(), "constraint");
    assert!(err.to_string().contains("teams.name"));
}

#[test]
fn test_unique_pk_via_direct_rowid_lookup() {
    let vfs = MemoryVfs::new();
    let db = open(&vfs, &PathBuf::from("/c2.db"));
    setup_schema(&db);
    db.begin().unwrap();
    db.insert_row("teams", team_row(1, "red")).unwrap();
    db.commit().unwrap();

    let meta = db.catalog_table("teams").unwrap();
    let err = db
        .enforce_unique(None, &meta, &team_row(1, "blue"), None)
        .unwrap_err();
    assert!(err.to_string().contains("teams.id"));

    // The row being updated may keep its own key.
    db.enforce_unique(None, &meta, &team_row(1, "blue"), Some(1))
        .unwrap();
}

#[test]
fn test_unique_text_verifies_exact_bytes() {
    let vfs = MemoryVfs::new();
    let db = open(&vfs, &PathBuf::from("/c3.db"));
    setup_schema(&db);
    db.begin().unwrap();
    db.insert_row("users", user_row(1, "a@x.com", None)).unwrap();
    db.commit().unwrap();

    let meta = db.catalog_table("users").unwrap();
    let err = db
        .enforce_unique(None, &meta, &user_row(2, "a@x.com", None), None)
        .unwrap_err();
    assert!(err.to_string().contains("users.email"));
    // A different value with (vanishingly unlikely but conceptually
    // possible) equal hash would pass the exact-byte verification; a
    // straight different value certainly does.
    db.enforce_unique(None, &meta, &user_row(2, "b@x.com", None), None)
        .unwrap();
}

#[test]
fn test_foreign_key_existence() {
    let vfs = MemoryVfs::new();
    let db = open(&vfs, &PathBuf::from("/c4.db"));
    setup_schema(&db);
    db.begin().unwrap();
    db.insert_row("teams", team_row(1, "red")).unwrap();
    db.commit().unwrap();

    let meta = db.catalog_table("users").unwrap();
    db.enforce_foreign_keys(None, &meta, &user_row(1, "a@x.com", Some(1)))
        .unwrap();
    // NULL FK is allowed.
    db.enforce_foreign_keys(None, &meta, &user_row(2, "b@x.com", None))
        .unwrap();
    let err = db
        .enforce_foreign_keys(None, &meta, &user_row(3, "c@x.com", Some(99)))
        .unwrap_err();
    assert_eq!(err.kind_name(), "constraint");
    assert!(err.to_string().contains("FOREIGN KEY"));
}

#[test]
fn test_restrict_on_parent_delete() {
    let vfs = MemoryVfs::new();
    let db = open(&vfs, &PathBuf::from("/c5.db"));
    setup_schema(&db);
    db.begin().unwrap();
    db.insert_row("teams", team_row(1, "red")).unwrap();
    db.insert_row("users", user_row(1, "a@x.com", Some(1))).unwrap();
    db.commit().unwrap();

    let parent_values = db.read_row_at(None, "teams", 1).unwrap().unwrap();
    let err = db
        .enforce_restrict_on_parent_delete(None, "teams", &parent_values)
        .unwrap_err();
    assert!(err.to_string().contains("RESTRICT"));

    // Remove the child; the parent is then deletable.
    db.begin().unwrap();
    db.delete_row("users", 1).unwrap();
    db.commit().unwrap();
    db.enforce_restrict_on_parent_delete(None, "teams", &parent_values)
        .unwrap();
}

#[test]
fn test_batched_constraints_catch_intra_batch_duplicates() {
    let vfs = MemoryVfs::new();
    let db = open(&vfs, &PathBuf::from("/c6.db"));
    setup_schema(&db);
    let meta = db.catalog_table("teams").unwrap();
    let rows = vec![team_row(1, "a"), team_row(2, "b"), team_row(1, "c")];
    let err = db.enforce_constraints_batch(None, &meta, &rows).unwrap_err();
    assert!(err.to_string().contains("UNIQUE"));
    assert!(err.to_string().contains("teams.id"));
}

#[test]
fn test_bulk_load_unique_violation_rolls_back() {
    let vfs = MemoryVfs::new();
    let db = open(&vfs, &PathBuf::from("/c7.db"));
    setup_schema(&db);

    let rows = vec![team_row(1, "A"), team_row(2, "B"), team_row(1, "C")];
    let err = db
        .bulk_load("teams", rows, &BulkOptions::default())
        .unwrap_err();
    assert_eq!(err.kind_name(), "constraint");
    assert!(err.to_string().contains("UNIQUE constraint failed"));
    assert_eq!(db.count_rows(None, "teams").unwrap(), 0);
}

#[test]
fn test_bulk_load_cross_batch_duplicate_commits_nothing() {
    let vfs = MemoryVfs::new();
    let db = open(&vfs, &PathBuf::from("/c12.db"));
    setup_schema(&db);

    // Two rows share a primary key, 150 rows apart, under a 25-row batch:
    // the conflict spans batches that per-batch validation alone would
    // have committed durably before noticing. The pre-insert sweep must
    // reject the whole load with nothing on disk.
    let mut rows: Vec<Vec<Value>> = (0..200)
        .map(|i| team_row(i + 1, &format!("name-{i}")))
        .collect();
    rows[180] = team_row(31, "name-duplicated");

    let err = db
        .bulk_load(
            "teams",
            rows,
            &BulkOptions {
                batch_size: 25,
                ..BulkOptions::default()
            },
        )
        .unwrap_err();
    assert_eq!(err.kind_name(), "constraint");
    assert!(err.to_string().contains("teams.id"));
    assert_eq!(db.count_rows(None, "teams").unwrap(), 0);
}

#[test]
fn test_bulk_load_cross_batch_duplicate_text_column() {
    let vfs = MemoryVfs::new();
    let db = open(&vfs, &PathBuf::from("/c13.db"));
    setup_schema(&db);

    // Distinct ids, but the unique TEXT column repeats across distant
    // batches.
    let mut rows: Vec<Vec<Value>> = (0..120)
        .map(|i| team_row(i + 1, &format!("name-{i}")))
        .collect();
    rows[110][1] = Value::Text(b"name-7".to_vec());

    let err = db
        .bulk_load(
            "teams",
            rows,
            &BulkOptions {
                batch_size: 10,
                ..BulkOptions::default()
            },
        )
        .unwrap_err();
    assert_eq!(err.kind_name(), "constraint");
    assert!(err.to_string().contains("teams.name"));
    assert_eq!(db.count_rows(None, "teams").unwrap(), 0);
}

#[test]
fn test_bulk_load_happy_path() {
    let vfs = MemoryVfs::new();
    let db = open(&vfs, &PathBuf::from("/c8.db"));
    setup_schema(&db);

    let rows: Vec<Vec<Value>> = (0..500).map(|i| team_row(i + 1, &format!("team-{i}"))).collect();
    let loaded = db
        .bulk_load(
            "teams",
            rows,
            &BulkOptions {
                batch_size: 100,
                ..BulkOptions::default()
            },
        )
        .unwrap();
    assert_eq!(loaded, 500);
    assert_eq!(db.count_rows(None, "teams").unwrap(), 500);
}

#[test]
fn test_bulk_load_with_disabled_indexes_rebuilds() {
    let vfs = MemoryVfs::new();
    let db = open(&vfs, &PathBuf::from("/c9.db"));
    setup_schema(&db);

    let rows: Vec<Vec<Value>> = (0..200)
        .map(|i| user_row(i + 1, &format!("u{i}@x.com"), None))
        .collect();
    db.bulk_load(
        "users",
        rows,
        &BulkOptions {
            batch_size: 50,
            disable_indexes: true,
            ..BulkOptions::default()
        },
    )
    .unwrap();

    // The rebuilt unique index answers seeks.
    let hits = db
        .index_seek_verified(
            None,
            "users_email_unique",
            &Value::Text(b"u42@x.com".to_vec()),
        )
        .unwrap();
    assert_eq!(hits, vec![43]);
}

#[test]
fn test_bulk_load_deferred_durability() {
    let vfs = MemoryVfs::new();
    let path = PathBuf::from("/c10.db");
    {
        let db = open(&vfs, &path);
        setup_schema(&db);
        let rows: Vec<Vec<Value>> = (0..300).map(|i| team_row(i + 1, &format!("t{i}"))).collect();
        db.bulk_load(
            "teams",
            rows,
            &BulkOptions {
                batch_size: 50,
                sync_interval: 2,
                durability: Durability::Deferred,
                ..BulkOptions::default()
            },
        )
        .unwrap();
    }
    let db = open(&vfs, &path);
    assert_eq!(db.count_rows(None, "teams").unwrap(), 300);
}

#[test]
fn test_scan_and_index_agree() {
    let vfs = MemoryVfs::new();
    let db = open(&vfs, &PathBuf::from("/c11.db"));
    setup_schema(&db);
    db.begin().unwrap();
    for i in 0..100 {
        db.insert_row("users", user_row(i + 1, &format!("user{i}@x.com"), None))
            .unwrap();
    }
    db.commit().unwrap();

    for i in [0, 17, 99] {
        let email = format!("user{i}@x.com");
        let via_index = db
            .index_seek_verified(None, "users_email_unique", &Value::Text(email.clone().into_bytes()))
            .unwrap();
        let mut via_scan = Vec::new();
        db.scan_table_for_each(None, "users", &mut |rowid, values| {
            if values[1] == Value::Text(email.clone().into_bytes()) {
                via_scan.push(rowid);
            }
            Ok(true)
        })
        .unwrap();
        assert_eq!(via_index, via_scan);
    }
}
