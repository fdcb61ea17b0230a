//! Constraint enforcement: NOT NULL, UNIQUE, foreign keys, and RESTRICT,
//! with batched variants that amortize B+Tree probes.
//!
//! TEXT/BLOB index keys are CRC-32C hashes, so every UNIQUE/FK decision
//! here verifies exact value bytes after the seek; a hash hit alone never
//! fails or passes a constraint.

use decentdb_btree::BTree;
use decentdb_error::{DecentError, Result};
use decentdb_types::{RowId, Value};

use crate::catalog::{ColumnType, TableMeta};
use crate::engine::{Engine, ReadTransaction};
use crate::rows::index_name;
use crate::catalog::IndexKind;

impl Engine {
    // -----------------------------------------------------------------------
    // NOT NULL
    // -----------------------------------------------------------------------

    /// Per-row NOT NULL check.
    pub fn enforce_not_null(&self, meta: &TableMeta, values: &[Value]) -> Result<()> {
        for (value, col) in values.iter().zip(&meta.columns) {
            if col.not_null && value.is_null() {
                return Err(DecentError::constraint(format!(
                    "NOT NULL constraint failed: {}.{}",
                    meta.name, col.name
                )));
            }
        }
        Ok(())
    }

    /// Batched NOT NULL check; fails on the first offending row.
    pub fn enforce_not_null_batch(&self, meta: &TableMeta, rows: &[Vec<Value>]) -> Result<()> {
        for row in rows {
            self.enforce_not_null(meta, row)?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // UNIQUE
    // -----------------------------------------------------------------------

    /// UNIQUE check for one row. `exclude` names the row being updated so
    /// it does not collide with itself. INT64 primary keys resolve by
    /// direct rowid lookup; everything else goes through the unique index
    /// with exact-byte verification.
    pub fn enforce_unique(
        &self,
        txn: Option<&ReadTransaction>,
        meta: &TableMeta,
        values: &[Value],
        exclude: Option<RowId>,
    ) -> Result<()> {
        let rowid_col = meta.rowid_column();
        for (i, col) in meta.columns.iter().enumerate() {
            if !col.unique || values[i].is_null() {
                continue;
            }
            if rowid_col == Some(i) {
                let rowid = values[i]
                    .as_int64()
                    .ok_or_else(|| DecentError::internal("INT64 primary key is not INT64"))?
                    as u64;
                if exclude == Some(rowid) {
                    continue;
                }
                let io = self.read_io(txn);
                let tree = BTree::open(meta.root);
                if tree.contains_key(&io, rowid)? {
                    return Err(unique_violation(&meta.name, &col.name));
                }
                continue;
            }
            let index = index_name(&meta.name, &col.name, IndexKind::Btree, true);
            if self.catalog.read().indexes.get(&index).is_none() {
                return Err(DecentError::internal(format!(
                    "unique column {}.{} has no index {index}",
                    meta.name, col.name
                )));
            }
            let conflicting = match exclude {
                Some(rowid) => self.index_has_other_rowid(txn, &index, &values[i], rowid)?,
                None => !self.index_seek_verified(txn, &index, &values[i])?.is_empty(),
            };
            if conflicting {
                return Err(unique_violation(&meta.name, &col.name));
            }
        }
        Ok(())
    }

    /// Batched UNIQUE check: dedup-probes each distinct key once against
    /// the existing data, and catches duplicates *within* the batch by
    /// exact value comparison.
    pub fn enforce_unique_batch(
        &self,
        txn: Option<&ReadTransaction>,
        meta: &TableMeta,
        rows: &[Vec<Value>],
    ) -> Result<()> {
        let rowid_col = meta.rowid_column();
        for (i, col) in meta.columns.iter().enumerate() {
            if !col.unique {
                continue;
            }
            match col.column_type {
                ColumnType::Text | ColumnType::Blob => {
                    // Group by exact bytes; one probe per distinct value.
                    let mut seen: Vec<&[u8]> = rows
                        .iter()
                        .filter_map(|row| row[i].as_bytes())
                        .collect();
                    seen.sort_unstable();
                    for pair in seen.windows(2) {
                        if pair[0] == pair[1] {
                            return Err(unique_violation(&meta.name, &col.name));
                        }
                    }
                    seen.dedup();
                    for bytes in seen {
                        let probe = match col.column_type {
                            ColumnType::Text => Value::Text(bytes.to_vec()),
                            _ => Value::Blob(bytes.to_vec()),
                        };
                        let values_stub = probe_row(meta, i, probe);
                        self.enforce_unique(txn, meta, &values_stub, None)?;
                    }
                }
                _ => {
                    let mut probes: Vec<Value> = rows
                        .iter()
                        .map(|row| row[i].clone())
                        .filter(|v| !v.is_null())
                        .collect();
                    probes.sort_by(compare_scalar);
                    for pair in probes.windows(2) {
                        if compare_scalar(&pair[0], &pair[1]) == std::cmp::Ordering::Equal {
                            return Err(unique_violation(&meta.name, &col.name));
                        }
                    }
                    // One seek per distinct key.
                    for probe in probes {
                        let values_stub = probe_row(meta, i, probe);
                        self.enforce_unique(txn, meta, &values_stub, None)?;
                    }
                }
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Foreign keys
    // -----------------------------------------------------------------------

    /// Existence check for every non-null FK value in the row.
    pub fn enforce_foreign_keys(
        &self,
        txn: Option<&ReadTransaction>,
        meta: &TableMeta,
        values: &[Value],
    ) -> Result<()> {
        for (i, col) in meta.columns.iter().enumerate() {
            let (Some(ref_table), Some(ref_column)) = (&col.ref_table, &col.ref_column) else {
                continue;
            };
            if values[i].is_null() {
                continue;
            }
            if !self.parent_exists(txn, ref_table, ref_column, &values[i])? {
                return Err(DecentError::constraint(format!(
                    "FOREIGN KEY constraint failed: {}.{} references {ref_table}.{ref_column}",
                    meta.name, col.name
                )));
            }
        }
        Ok(())
    }

    /// Batched FK check: one probe per distinct referenced key.
    pub fn enforce_foreign_keys_batch(
        &self,
        txn: Option<&ReadTransaction>,
        meta: &TableMeta,
        rows: &[Vec<Value>],
    ) -> Result<()> {
        for (i, col) in meta.columns.iter().enumerate() {
            let (Some(ref_table), Some(ref_column)) = (&col.ref_table, &col.ref_column) else {
                continue;
            };
            let mut probes: Vec<&Value> =
                rows.iter().map(|row| &row[i]).filter(|v| !v.is_null()).collect();
            probes.sort_by(|a, b| compare_scalar(a, b));
            probes.dedup_by(|a, b| compare_scalar(*a, *b) == std::cmp::Ordering::Equal);
            for value in probes {
                if !self.parent_exists(txn, ref_table, ref_column, value)? {
                    return Err(DecentError::constraint(format!(
                        "FOREIGN KEY constraint failed: {}.{} references {ref_table}.{ref_column}",
                        meta.name, col.name
                    )));
                }
            }
        }
        Ok(())
    }

    fn parent_exists(
        &self,
        txn: Option<&ReadTransaction>,
        ref_table: &str,
        ref_column: &str,
        value: &Value,
    ) -> Result<bool> {
        let parent = self.catalog.read().table(ref_table)?.clone();
        let ref_idx = parent.column_index(ref_column)?;
        if parent.rowid_column() == Some(ref_idx) {
            let Some(rowid) = value.as_int64() else {
                return Ok(false);
            };
            let io = self.read_io(txn);
            let tree = BTree::open(parent.root);
            return tree.contains_key(&io, rowid as u64);
        }
        let index = index_name(ref_table, ref_column, IndexKind::Btree, true);
        if self.catalog.read().indexes.get(&index).is_none() {
            return Err(DecentError::internal(format!(
                "FK target {ref_table}.{ref_column} has no unique index"
            )));
        }
        Ok(!self.index_seek_verified(txn, &index, value)?.is_empty())
    }

    // -----------------------------------------------------------------------
    // RESTRICT
    // -----------------------------------------------------------------------

    /// Reject deleting (or re-keying) a parent row while child rows still
    /// reference it.
    pub fn enforce_restrict_on_parent_delete(
        &self,
        txn: Option<&ReadTransaction>,
        parent_table: &str,
        parent_values: &[Value],
    ) -> Result<()> {
        let parent = self.catalog.read().table(parent_table)?.clone();
        let referencing: Vec<(TableMeta, usize, usize)> = {
            let catalog = self.catalog.read();
            let mut out = Vec::new();
            for child in catalog.tables.values() {
                for (child_col, col) in child.columns.iter().enumerate() {
                    if col.ref_table.as_deref() == Some(parent_table) {
                        let ref_column = col.ref_column.as_deref().ok_or_else(|| {
                            DecentError::internal("FK column without target column")
                        })?;
                        let parent_col = parent.column_index(ref_column)?;
                        out.push((child.clone(), child_col, parent_col));
                    }
                }
            }
            out
        };

        for (child, child_col, parent_col) in referencing {
            let key_value = &parent_values[parent_col];
            if key_value.is_null() {
                continue;
            }
            let has_child = match self
                .catalog
                .read()
                .btree_index_on(&child.name, &child.columns[child_col].name)
                .map(|m| m.name.clone())
            {
                Some(index) => !self.index_seek_verified(txn, &index, key_value)?.is_empty(),
                // No index on the FK column: fall back to a scan.
                None => {
                    let mut found = false;
                    self.scan_table_for_each(txn, &child.name, &mut |_, values| {
                        if values[child_col] == *key_value {
                            found = true;
                            return Ok(false);
                        }
                        Ok(true)
                    })?;
                    found
                }
            };
            if has_child {
                return Err(DecentError::constraint(format!(
                    "RESTRICT: rows in {} still reference {}.{}",
                    child.name, parent_table, parent.columns[parent_col].name
                )));
            }
        }
        Ok(())
    }

    /// Combined batched validation: NOT NULL, UNIQUE, FK.
    pub fn enforce_constraints_batch(
        &self,
        txn: Option<&ReadTransaction>,
        meta: &TableMeta,
        rows: &[Vec<Value>],
    ) -> Result<()> {
        self.enforce_not_null_batch(meta, rows)?;
        self.enforce_unique_batch(txn, meta, rows)?;
        self.enforce_foreign_keys_batch(txn, meta, rows)
    }
}

fn unique_violation(table: &str, column: &str) -> DecentError {
    DecentError::constraint(format!("UNIQUE constraint failed: {table}.{column}"))
}

/// A row of NULLs with one populated column, for single-column probes.
fn probe_row(meta: &TableMeta, column: usize, value: Value) -> Vec<Value> {
    let mut row = vec![Value::Null; meta.columns.len()];
    row[column] = value;
    row
}

/// Total order over scalar probe values of one column's type.
fn compare_scalar(a: &Value, b: &Value) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (a, b) {
        (Value::Int64(x), Value::Int64(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Float64(x), Value::Float64(y)) => x.total_cmp(y),
        (Value::Text(x), Value::Text(y)) | (Value::Blob(x), Value::Blob(y)) => x.cmp(y),
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Less,
        (_, Value::Null) => Ordering::Greater,
        _ => Ordering::Equal,
    }
}
