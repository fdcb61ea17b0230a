//! B+Tree keyed by `u64` with byte-sequence values: row storage
//! (rowid → record), secondary indexes (key → rowid), trigram postings,
//! and catalog records all live in trees of this shape.

pub mod node;
pub mod tree;

pub use node::{LeafEntry, LeafPayload, Node};
pub use tree::{BTree, Cursor, CursorEntry, spill_threshold};
