//! DecentDB core engine.
//!
//! Binds the storage stack (VFS, pager, WAL, B+Tree, record codec,
//! trigram index) into a Snapshot-Isolation ACID engine and exposes the
//! SQL-independent primitives an external SQL layer drives: transactions,
//! row mutation, index seeks and builds, constraint helpers, bulk load,
//! and the prepared-statement binding surface.

pub mod bulk;
pub mod catalog;
pub mod constraints;
pub mod engine;
pub mod rows;
pub mod statement;

pub use bulk::ExternalKeySorter;
pub use catalog::{
    Catalog, CatalogRecord, ColumnDef, ColumnType, IndexKind, IndexMeta, TableMeta, ViewMeta,
};
pub use engine::{Engine, ReadTransaction, wal_path_for};
pub use rows::{free_tree, index_key_for_value, index_name};
pub use statement::{Statement, StatementPlan, StepResult};
