//! DecentDB: an embedded single-file relational storage engine.
//!
//! The durable core: a paged main file plus write-ahead log, a
//! snapshot-consistent page cache, B+Trees for rows and indexes, a trigram
//! inverted index for substring search, and ACID (Snapshot Isolation)
//! transactions with checkpointing that respects live readers.
//!
//! ```no_run
//! use decentdb::{ColumnDef, ColumnType, Db, OpenOptions, Value};
//!
//! # fn main() -> decentdb::Result<()> {
//! let db = Db::open(std::path::Path::new("app.db"), OpenOptions::default())?;
//! db.begin()?;
//! db.create_table(
//!     "users",
//!     vec![
//!         ColumnDef::new("id", ColumnType::Int64).primary_key(),
//!         ColumnDef::new("name", ColumnType::Text).not_null(),
//!     ],
//! )?;
//! db.insert_row(
//!     "users",
//!     vec![Value::Int64(1), Value::Text(b"Alice".to_vec())],
//! )?;
//! db.commit()?;
//!
//! let txn = db.begin_read();
//! let row = db.read_row_at(Some(&txn), "users", 1)?;
//! assert!(row.is_some());
//! db.end_read(&txn);
//! # Ok(())
//! # }
//! ```

pub use decentdb_core::{
    Catalog, CatalogRecord, ColumnDef, ColumnType, Engine as Db, IndexKind, IndexMeta,
    ReadTransaction, Statement, StatementPlan, StepResult, TableMeta, ViewMeta,
};
pub use decentdb_error::{DecentError, Result};
pub use decentdb_types::{
    BulkOptions, Durability, Lsn, OpenOptions, PageId, PageSize, RowId, SyncMode, Value, ValueKind,
};
pub use decentdb_vfs::{FaultPlan, FaultyVfs, MemoryVfs, StdVfs, Vfs};
