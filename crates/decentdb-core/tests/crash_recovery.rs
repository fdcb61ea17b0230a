//! Crash-atomicity: simulated crashes via the fault-injecting VFS, then
//! reopen and verify exactly the committed state survived.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use decentdb_core::{ColumnDef, ColumnType, Engine};
use decentdb_types::{OpenOptions, Value};
use decentdb_vfs::{FaultyVfs, MemoryVfs};

fn open_plain(vfs: &MemoryVfs, path: &Path) -> Arc<Engine> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    Engine::open_with_vfs(Arc::new(vfs.clone()), path, OpenOptions::default()).unwrap()
}

fn open_faulty(vfs: &MemoryVfs, path: &Path) -> (Arc<Engine>, decentdb_vfs::FaultPlan) {
    let faulty = FaultyVfs::new(vfs.clone());
    let plan = faulty.plan();
    let db = Engine::open_with_vfs(Arc::new(faulty), path, OpenOptions::default()).unwrap();
    (db, plan)
}

fn setup_table(db: &Engine) {
    db.begin().unwrap();
    db.create_table(
        "t",
        vec![
            ColumnDef::new("id", ColumnType::Int64).primary_key(),
            ColumnDef::new("name", ColumnType::Text),
        ],
    )
    .unwrap();
    db.commit().unwrap();
}

fn insert_n(db: &Engine, n: i64) {
    for i in 0..n {
        db.insert_row(
            "t",
            vec![
                Value::Int64(i + 1),
                Value::Text(format!("row-{i}").into_bytes()),
            ],
        )
        .unwrap();
    }
}

#[test]
fn test_crash_before_commit_loses_everything() {
    let vfs = MemoryVfs::new();
    let path = PathBuf::from("/crash1.db");
    {
        let (db, plan) = open_faulty(&vfs, &path);
        setup_table(&db);
        db.begin().unwrap();
        insert_n(&db, 100);
        plan.crash_at("wal.commit.before_sync");
        let err = db.commit().unwrap_err();
        assert_eq!(err.kind_name(), "io");
    }

    let db = open_plain(&vfs, &path);
    assert_eq!(db.count_rows(None, "t").unwrap(), 0);
}

#[test]
fn test_crash_after_commit_sync_keeps_everything() {
    let vfs = MemoryVfs::new();
    let path = PathBuf::from("/crash2.db");
    {
        let (db, plan) = open_faulty(&vfs, &path);
        setup_table(&db);
        db.begin().unwrap();
        insert_n(&db, 100);
        // The crash hits right after the COMMIT frame's fsync returned, so
        // the transaction is durable even though commit() reports Io.
        plan.crash_at("wal.commit.after_sync");
        let err = db.commit().unwrap_err();
        assert_eq!(err.kind_name(), "io");
    }

    let db = open_plain(&vfs, &path);
    assert_eq!(db.count_rows(None, "t").unwrap(), 100);
    let row = db.read_row_at(None, "t", 50).unwrap().unwrap();
    assert_eq!(row[1], Value::Text(b"row-49".to_vec()));
}

#[test]
fn test_crash_mid_frame_write_loses_transaction() {
    let vfs = MemoryVfs::new();
    let path = PathBuf::from("/crash3.db");
    {
        let (db, plan) = open_faulty(&vfs, &path);
        setup_table(&db);
        db.begin().unwrap();
        insert_n(&db, 50);
        // Tear the WAL mid-write: a few KiB of frames land, then the
        // device dies.
        plan.fail_write_after_bytes(5000);
        assert!(db.commit().is_err());
    }

    let db = open_plain(&vfs, &path);
    assert_eq!(db.count_rows(None, "t").unwrap(), 0);
}

#[test]
fn test_committed_transactions_survive_later_crash() {
    let vfs = MemoryVfs::new();
    let path = PathBuf::from("/crash4.db");
    {
        let (db, plan) = open_faulty(&vfs, &path);
        setup_table(&db);
        db.begin().unwrap();
        insert_n(&db, 10);
        db.commit().unwrap();

        db.begin().unwrap();
        db.insert_row("t", vec![Value::Int64(999), Value::Null]).unwrap();
        plan.crash_at("wal.commit.before_sync");
        assert!(db.commit().is_err());
    }

    let db = open_plain(&vfs, &path);
    assert_eq!(db.count_rows(None, "t").unwrap(), 10);
    assert!(db.read_row_at(None, "t", 999).unwrap().is_none());
}

#[test]
fn test_crash_during_checkpoint_preserves_data() {
    let vfs = MemoryVfs::new();
    let path = PathBuf::from("/crash5.db");
    {
        let (db, plan) = open_faulty(&vfs, &path);
        setup_table(&db);
        db.begin().unwrap();
        insert_n(&db, 20);
        db.commit().unwrap();
        plan.crash_at("checkpoint.before_db_sync");
        assert!(db.checkpoint().is_err());
    }

    // The WAL still carries the commit; checkpoint failure must not lose
    // anything.
    let db = open_plain(&vfs, &path);
    assert_eq!(db.count_rows(None, "t").unwrap(), 20);
}

#[test]
fn test_recovery_is_idempotent_at_engine_level() {
    let vfs = MemoryVfs::new();
    let path = PathBuf::from("/crash6.db");
    {
        let db = open_plain(&vfs, &path);
        setup_table(&db);
        db.begin().unwrap();
        insert_n(&db, 25);
        db.commit().unwrap();
    }

    let first = {
        let db = open_plain(&vfs, &path);
        (db.wal_end(), db.scan_table(None, "t").unwrap())
    };
    let second = {
        let db = open_plain(&vfs, &path);
        (db.wal_end(), db.scan_table(None, "t").unwrap())
    };
    assert_eq!(first, second);
}

#[test]
fn test_dropped_syncs_do_not_break_logical_state() {
    let vfs = MemoryVfs::new();
    let path = PathBuf::from("/crash7.db");
    let (db, plan) = open_faulty(&vfs, &path);
    plan.drop_syncs();
    setup_table(&db);
    db.begin().unwrap();
    insert_n(&db, 5);
    db.commit().unwrap();
    assert!(plan.syncs_dropped() > 0);
    // Without a crash the in-process state is fine; the plan just proves
    // the syncs were swallowed.
    assert_eq!(db.count_rows(None, "t").unwrap(), 5);
}

#[test]
fn test_corrupt_header_fails_open() {
    let vfs = MemoryVfs::new();
    let path = PathBuf::from("/crash8.db");
    {
        let db = open_plain(&vfs, &path);
        setup_table(&db);
    }
    // Flip a byte inside the header checksum's coverage.
    {
        use decentdb_vfs::Vfs;
        let file = vfs.open(&path, false).unwrap();
        let mut byte = [0_u8; 1];
        file.read_at(20, &mut byte).unwrap();
        byte[0] ^= 0xFF;
        file.write_at(20, &byte).unwrap();
    }
    let err = Engine::open_with_vfs(
        Arc::new(vfs.clone()),
        &path,
        OpenOptions::default(),
    )
    .unwrap_err();
    assert_eq!(err.kind_name(), "corruption");
}
