//! LIKE queries driven by the trigram index: selective patterns hit, overly
//! common patterns are refused and left to other predicates.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use decentdb_core::{ColumnDef, ColumnType, Engine};
use decentdb_types::{OpenOptions, Value};
use decentdb_vfs::MemoryVfs;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const INDEX: &str = "people_name_trgm";

fn open_with(vfs: &MemoryVfs, path: &Path, options: OpenOptions) -> Arc<Engine> {
    Engine::open_with_vfs(Arc::new(vfs.clone()), path, options).unwrap()
}

fn setup_people(db: &Engine) {
    db.begin().unwrap();
    db.create_table(
        "people",
        vec![
            ColumnDef::new("id", ColumnType::Int64).primary_key(),
            ColumnDef::new("name", ColumnType::Text),
        ],
    )
    .unwrap();
    db.commit().unwrap();
}

fn random_name(rng: &mut StdRng) -> String {
    (0..8)
        .map(|_| char::from(b'a' + rng.gen_range(0..26_u8)))
        .collect()
}

#[test]
fn test_selective_pattern_finds_needle_among_many() {
    let vfs = MemoryVfs::new();
    let options = OpenOptions {
        trigram_postings_threshold: 2_000,
        ..OpenOptions::default()
    };
    let db = open_with(&vfs, &PathBuf::from("/tg1.db"), options);
    setup_people(&db);

    let mut rng = StdRng::seed_from_u64(0x5EED);
    db.begin().unwrap();
    for i in 0..10_000_i64 {
        db.insert_row(
            "people",
            vec![
                Value::Int64(i + 1),
                Value::Text(random_name(&mut rng).into_bytes()),
            ],
        )
        .unwrap();
    }
    db.commit().unwrap();
    db.begin().unwrap();
    db.build_trigram_index_for_column("people", "name").unwrap();
    db.commit().unwrap();

    // The needle goes in after the index exists, through the delta buffer.
    db.begin().unwrap();
    let needle = db
        .insert_row(
            "people",
            vec![Value::Null, Value::Text(b"abcdefgh".to_vec())],
        )
        .unwrap();
    db.commit().unwrap();

    let hits = db.trigram_like_seek(None, INDEX, b"%cde%").unwrap().unwrap();
    assert!(hits.contains(&needle), "needle row must match %cde%");
    // Every hit really contains the substring.
    for rowid in &hits {
        let row = db.read_row_at(None, "people", *rowid).unwrap().unwrap();
        let name = row[1].as_bytes().unwrap().to_vec();
        let upper = name.to_ascii_uppercase();
        assert!(
            upper.windows(3).any(|w| w == b"CDE"),
            "false positive from trigram seek"
        );
    }
}

#[test]
fn test_pattern_without_trigram_refused() {
    let vfs = MemoryVfs::new();
    let db = open_with(&vfs, &PathBuf::from("/tg2.db"), OpenOptions::default());
    setup_people(&db);
    db.begin().unwrap();
    db.build_trigram_index_for_column("people", "name").unwrap();
    db.commit().unwrap();

    // `%a%` extracts no trigram of length 3; the planner must not use the
    // index.
    assert!(db.trigram_like_seek(None, INDEX, b"%a%").unwrap().is_none());
    assert!(db.trigram_like_seek(None, INDEX, b"%ab%").unwrap().is_none());
}

#[test]
fn test_threshold_refuses_common_trigram() {
    let vfs = MemoryVfs::new();
    let options = OpenOptions {
        trigram_postings_threshold: 10,
        ..OpenOptions::default()
    };
    let db = open_with(&vfs, &PathBuf::from("/tg3.db"), options);
    setup_people(&db);
    db.begin().unwrap();
    db.build_trigram_index_for_column("people", "name").unwrap();
    db.commit().unwrap();

    db.begin().unwrap();
    for i in 0..50_i64 {
        db.insert_row(
            "people",
            vec![
                Value::Int64(i + 1),
                Value::Text(format!("common-{i}").into_bytes()),
            ],
        )
        .unwrap();
    }
    db.commit().unwrap();
    db.checkpoint().unwrap();

    // Every row contains "common"; its postings exceed the threshold of 10.
    assert!(
        db.trigram_like_seek(None, INDEX, b"%common%")
            .unwrap()
            .is_none(),
        "planner must refuse an over-threshold trigram"
    );
}

#[test]
fn test_delete_removes_row_from_matches() {
    let vfs = MemoryVfs::new();
    let db = open_with(&vfs, &PathBuf::from("/tg4.db"), OpenOptions::default());
    setup_people(&db);
    db.begin().unwrap();
    db.build_trigram_index_for_column("people", "name").unwrap();
    db.commit().unwrap();

    db.begin().unwrap();
    let rowid = db
        .insert_row(
            "people",
            vec![Value::Null, Value::Text(b"transient".to_vec())],
        )
        .unwrap();
    db.commit().unwrap();
    db.checkpoint().unwrap();

    let hits = db.trigram_like_seek(None, INDEX, b"%ransi%").unwrap().unwrap();
    assert_eq!(hits, vec![rowid]);

    db.begin().unwrap();
    db.delete_row("people", rowid).unwrap();
    db.commit().unwrap();

    // Delta-aware reads exclude the deletion before any checkpoint.
    let hits = db.trigram_like_seek(None, INDEX, b"%ransi%").unwrap().unwrap();
    assert!(hits.is_empty());

    db.checkpoint().unwrap();
    let hits = db.trigram_like_seek(None, INDEX, b"%ransi%").unwrap().unwrap();
    assert!(hits.is_empty());
}

#[test]
fn test_update_moves_postings() {
    let vfs = MemoryVfs::new();
    let db = open_with(&vfs, &PathBuf::from("/tg5.db"), OpenOptions::default());
    setup_people(&db);
    db.begin().unwrap();
    db.build_trigram_index_for_column("people", "name").unwrap();
    db.commit().unwrap();

    db.begin().unwrap();
    let rowid = db
        .insert_row("people", vec![Value::Null, Value::Text(b"before".to_vec())])
        .unwrap();
    db.commit().unwrap();

    db.begin().unwrap();
    db.update_row(
        "people",
        rowid,
        vec![Value::Int64(rowid as i64), Value::Text(b"afterwards".to_vec())],
    )
    .unwrap();
    db.commit().unwrap();

    let old = db.trigram_like_seek(None, INDEX, b"%befor%").unwrap().unwrap();
    assert!(old.is_empty());
    let new = db.trigram_like_seek(None, INDEX, b"%fterw%").unwrap().unwrap();
    assert_eq!(new, vec![rowid]);
}
