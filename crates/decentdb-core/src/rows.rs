//! Row and index primitives: insert/update/delete, scans, index seeks,
//! index builds, and the trigram read path.
//!
//! B+Tree keys for TEXT/BLOB index entries are CRC-32C hashes of the value
//! bytes, so a plain seek may return hash-collision extras; the `_verified`
//! variants re-read the rows and compare exact bytes. UNIQUE and FK
//! enforcement always use the verified paths.

use decentdb_btree::BTree;
use decentdb_error::{DecentError, Result};
use decentdb_pager::{PageIo, Pager};
use decentdb_record::{decode_row_materialized, encode_row_with_overflow, free_row_overflow};
use decentdb_trigram::{buffer_delete, buffer_insert, intersect, matches_like, pattern_trigrams};
use decentdb_types::{PageId, RowId, Value};
use tracing::{debug, info};

use crate::catalog::{CatalogRecord, ColumnType, IndexKind, IndexMeta, TableMeta};
use crate::engine::{Engine, ReadTransaction};

/// B+Tree key for an indexed value; `None` for NULL (not indexed).
#[must_use]
pub fn index_key_for_value(value: &Value) -> Option<u64> {
    match value {
        Value::Null => None,
        Value::Int64(v) => Some(*v as u64),
        Value::Bool(b) => Some(u64::from(*b)),
        Value::Float64(f) => Some(f.to_bits()),
        Value::Text(bytes) | Value::Blob(bytes) => Some(u64::from(crc32c::crc32c(bytes))),
        Value::TextOverflow(..) | Value::BlobOverflow(..) => None,
    }
}

fn rowid_bytes(rowid: RowId) -> [u8; 8] {
    rowid.to_le_bytes()
}

fn rowid_from_bytes(bytes: &[u8]) -> Result<RowId> {
    let arr: [u8; 8] = bytes
        .try_into()
        .map_err(|_| DecentError::corruption("index entry value is not a rowid"))?;
    Ok(RowId::from_le_bytes(arr))
}

/// Free every page of a tree: internal nodes, leaves, and the overflow
/// chains their entries reference.
pub fn free_tree(pager: &Pager, root: PageId) -> Result<()> {
    use decentdb_btree::Node;
    let io = pager.io();
    match Node::decode(&io.read(root)?)? {
        Node::Leaf { entries, .. } => {
            for entry in entries {
                if let Some(head) = entry.payload.overflow_head() {
                    decentdb_pager::overflow::free_chain(pager, head)?;
                }
            }
        }
        Node::Internal {
            first_child,
            entries,
        } => {
            free_tree(pager, first_child)?;
            for (_, child) in entries {
                free_tree(pager, child)?;
            }
        }
    }
    pager.free_page(root)
}

impl Engine {
    fn table_meta(&self, table: &str) -> Result<TableMeta> {
        Ok(self.catalog.read().table(table)?.clone())
    }

    /// Clone of a table's live metadata, for the SQL layer's planner and
    /// the constraint helpers.
    pub fn catalog_table(&self, table: &str) -> Result<TableMeta> {
        self.table_meta(table)
    }

    /// Clone of an index's live metadata.
    pub fn catalog_index(&self, index: &str) -> Result<IndexMeta> {
        self.index_meta(index)
    }

    fn index_meta(&self, index: &str) -> Result<IndexMeta> {
        Ok(self.catalog.read().index(index)?.clone())
    }

    /// Table metadata as the reader should see it: the live catalog for the
    /// writer view, the snapshot catalog for a registered reader.
    pub(crate) fn table_meta_for(
        &self,
        txn: Option<&ReadTransaction>,
        table: &str,
    ) -> Result<TableMeta> {
        match txn {
            None => self.table_meta(table),
            Some(txn) => Ok(self.snapshot_catalog(txn)?.table(table)?.clone()),
        }
    }

    pub(crate) fn index_meta_for(
        &self,
        txn: Option<&ReadTransaction>,
        index: &str,
    ) -> Result<IndexMeta> {
        match txn {
            None => self.index_meta(index),
            Some(txn) => Ok(self.snapshot_catalog(txn)?.index(index)?.clone()),
        }
    }

    fn check_row_shape(&self, meta: &TableMeta, values: &[Value]) -> Result<()> {
        if values.len() != meta.columns.len() {
            return Err(DecentError::sql(format!(
                "table {} has {} columns but {} values were supplied",
                meta.name,
                meta.columns.len(),
                values.len()
            )));
        }
        for (value, col) in values.iter().zip(&meta.columns) {
            if value.is_null() {
                continue;
            }
            let expected = match col.column_type {
                ColumnType::Int64 => decentdb_types::ValueKind::Int64,
                ColumnType::Bool => decentdb_types::ValueKind::Bool,
                ColumnType::Float64 => decentdb_types::ValueKind::Float64,
                ColumnType::Text => decentdb_types::ValueKind::Text,
                ColumnType::Blob => decentdb_types::ValueKind::Blob,
            };
            if value.kind() != expected {
                return Err(DecentError::sql(format!(
                    "column {}.{} expects {expected}, got {}",
                    meta.name,
                    col.name,
                    value.kind()
                )));
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Row mutations
    // -----------------------------------------------------------------------

    /// Insert a row; the rowid comes from the INTEGER PRIMARY KEY value (or
    /// is assigned from the table's counter when that value is NULL).
    pub fn insert_row(&self, table: &str, values: Vec<Value>) -> Result<RowId> {
        self.insert_row_inner(table, values, true)
    }

    /// Insert without maintaining secondary indexes; used by bulk loads
    /// that rebuild indexes afterwards.
    pub fn insert_row_no_indexes(&self, table: &str, values: Vec<Value>) -> Result<RowId> {
        self.insert_row_inner(table, values, false)
    }

    fn insert_row_inner(
        &self,
        table: &str,
        mut values: Vec<Value>,
        maintain_indexes: bool,
    ) -> Result<RowId> {
        self.require_txn()?;
        let meta = self.table_meta(table)?;
        self.check_row_shape(&meta, &values)?;

        let rowid = match meta.rowid_column() {
            Some(pk) => match values[pk] {
                Value::Int64(v) => v as u64,
                Value::Null => {
                    let rowid = meta.next_rowid;
                    values[pk] = Value::Int64(rowid as i64);
                    rowid
                }
                _ => {
                    return Err(DecentError::sql(format!(
                        "primary key {}.{} must be INT64",
                        meta.name, meta.columns[pk].name
                    )));
                }
            },
            None => meta.next_rowid,
        };

        let encoded = encode_row_with_overflow(&self.pager, &values, self.pager.page_size())?;
        let mut tree = BTree::open(meta.root);
        tree.insert(&self.pager, rowid, &encoded)?;

        // Bump the rowid counter and persist root moves at commit.
        {
            let mut catalog = self.catalog.write();
            let meta = catalog
                .tables
                .get_mut(table)
                .ok_or_else(|| DecentError::internal("table vanished mid-insert"))?;
            meta.next_rowid = meta.next_rowid.max(rowid + 1);
            meta.root = tree.root();
            catalog.mark_table_dirty(table);
        }

        if maintain_indexes {
            self.maintain_indexes_for_insert(&meta, &values, rowid)?;
        }
        Ok(rowid)
    }

    fn maintain_indexes_for_insert(
        &self,
        meta: &TableMeta,
        values: &[Value],
        rowid: RowId,
    ) -> Result<()> {
        for index in self.catalog.read().indexes_on(&meta.name) {
            let col = meta.column_index(&index.column)?;
            let value = &values[col];
            match index.kind {
                IndexKind::Btree => {
                    if let Some(key) = index_key_for_value(value) {
                        let mut tree = BTree::open(index.root);
                        tree.insert(&self.pager, key, &rowid_bytes(rowid))?;
                        if tree.root() != index.root {
                            self.sync_index_root(&index.name, tree.root())?;
                        }
                    }
                }
                IndexKind::Trigram => {
                    if let Some(bytes) = value.as_bytes() {
                        let mut deltas = self.trigram_deltas.lock();
                        buffer_insert(deltas.entry(index.name.clone()).or_default(), bytes, rowid);
                    }
                }
            }
        }
        Ok(())
    }

    fn maintain_indexes_for_delete(
        &self,
        meta: &TableMeta,
        old_values: &[Value],
        rowid: RowId,
    ) -> Result<()> {
        for index in self.catalog.read().indexes_on(&meta.name) {
            let col = meta.column_index(&index.column)?;
            let value = &old_values[col];
            match index.kind {
                IndexKind::Btree => {
                    if let Some(key) = index_key_for_value(value) {
                        let mut tree = BTree::open(index.root);
                        tree.delete_key_value(&self.pager, key, &rowid_bytes(rowid))?;
                        if tree.root() != index.root {
                            self.sync_index_root(&index.name, tree.root())?;
                        }
                    }
                }
                IndexKind::Trigram => {
                    if let Some(bytes) = value.as_bytes() {
                        let mut deltas = self.trigram_deltas.lock();
                        buffer_delete(deltas.entry(index.name.clone()).or_default(), bytes, rowid);
                    }
                }
            }
        }
        Ok(())
    }

    /// Rewrite a row: old index entries go, new ones come, the record is
    /// replaced. Returns `false` when the rowid does not exist.
    pub fn update_row(&self, table: &str, rowid: RowId, values: Vec<Value>) -> Result<bool> {
        self.require_txn()?;
        let meta = self.table_meta(table)?;
        self.check_row_shape(&meta, &values)?;

        let mut tree = BTree::open(meta.root);
        let io = self.pager.io();
        let Some(old_raw) = tree.find(&io, rowid)? else {
            return Ok(false);
        };
        let old_values = decode_row_materialized(&io, &old_raw)?;
        self.maintain_indexes_for_delete(&meta, &old_values, rowid)?;
        free_row_overflow(&self.pager, &old_raw)?;

        let encoded = encode_row_with_overflow(&self.pager, &values, self.pager.page_size())?;
        tree.update(&self.pager, rowid, &encoded)?;
        if tree.root() != meta.root {
            let mut catalog = self.catalog.write();
            if let Some(table_meta) = catalog.tables.get_mut(table) {
                table_meta.root = tree.root();
            }
            catalog.mark_table_dirty(table);
        }
        self.maintain_indexes_for_insert(&meta, &values, rowid)?;
        Ok(true)
    }

    /// Delete a row and its index entries. Returns `false` when absent.
    pub fn delete_row(&self, table: &str, rowid: RowId) -> Result<bool> {
        self.require_txn()?;
        let meta = self.table_meta(table)?;
        let mut tree = BTree::open(meta.root);
        let io = self.pager.io();
        let Some(old_raw) = tree.find(&io, rowid)? else {
            return Ok(false);
        };
        let old_values = decode_row_materialized(&io, &old_raw)?;
        self.maintain_indexes_for_delete(&meta, &old_values, rowid)?;
        free_row_overflow(&self.pager, &old_raw)?;
        tree.delete(&self.pager, rowid)?;
        if tree.root() != meta.root {
            let mut catalog = self.catalog.write();
            if let Some(table_meta) = catalog.tables.get_mut(table) {
                table_meta.root = tree.root();
            }
            catalog.mark_table_dirty(table);
        }
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Read one row at the transaction's snapshot (or latest).
    pub fn read_row_at(
        &self,
        txn: Option<&ReadTransaction>,
        table: &str,
        rowid: RowId,
    ) -> Result<Option<Vec<Value>>> {
        let meta = self.table_meta_for(txn, table)?;
        let io = self.read_io(txn);
        let tree = BTree::open(meta.root);
        match tree.find(&io, rowid)? {
            Some(raw) => Ok(Some(decode_row_materialized(&io, &raw)?)),
            None => Ok(None),
        }
    }

    /// Visit every row in rowid order; the callback returns `false` to stop.
    pub fn scan_table_for_each(
        &self,
        txn: Option<&ReadTransaction>,
        table: &str,
        f: &mut dyn FnMut(RowId, Vec<Value>) -> Result<bool>,
    ) -> Result<()> {
        let meta = self.table_meta_for(txn, table)?;
        let io = self.read_io(txn);
        let tree = BTree::open(meta.root);
        let mut cursor = tree.cursor(&io)?;
        while let Some(entry) = cursor.next()? {
            let values = decode_row_materialized(&io, &entry.value)?;
            if !f(entry.key, values)? {
                break;
            }
        }
        Ok(())
    }

    /// Collect the whole table. Convenience wrapper for small scans.
    pub fn scan_table(
        &self,
        txn: Option<&ReadTransaction>,
        table: &str,
    ) -> Result<Vec<(RowId, Vec<Value>)>> {
        let mut out = Vec::new();
        self.scan_table_for_each(txn, table, &mut |rowid, values| {
            out.push((rowid, values));
            Ok(true)
        })?;
        Ok(out)
    }

    /// Number of rows in the table at the snapshot.
    pub fn count_rows(&self, txn: Option<&ReadTransaction>, table: &str) -> Result<u64> {
        let mut count = 0_u64;
        self.scan_table_for_each(txn, table, &mut |_, _| {
            count += 1;
            Ok(true)
        })?;
        Ok(count)
    }

    // -----------------------------------------------------------------------
    // Index seeks
    // -----------------------------------------------------------------------

    /// Rowids whose index key matches `value`'s key. For TEXT/BLOB this is
    /// a hash lookup and may include collision extras the caller filters.
    pub fn index_seek(
        &self,
        txn: Option<&ReadTransaction>,
        index: &str,
        value: &Value,
    ) -> Result<Vec<RowId>> {
        let meta = self.index_meta_for(txn, index)?;
        if meta.kind != IndexKind::Btree {
            return Err(DecentError::sql(format!(
                "index {index} is not a btree index"
            )));
        }
        let Some(key) = index_key_for_value(value) else {
            return Ok(Vec::new());
        };
        let io = self.read_io(txn);
        let tree = BTree::open(meta.root);
        let mut cursor = tree.cursor_at(&io, key)?;
        let mut out = Vec::new();
        while let Some(entry) = cursor.next()? {
            if entry.key != key {
                break;
            }
            out.push(rowid_from_bytes(&entry.value)?);
        }
        Ok(out)
    }

    /// Like [`Self::index_seek`] but verifies exact value bytes against the
    /// stored rows, resolving hash collisions.
    pub fn index_seek_verified(
        &self,
        txn: Option<&ReadTransaction>,
        index: &str,
        value: &Value,
    ) -> Result<Vec<RowId>> {
        let meta = self.index_meta_for(txn, index)?;
        let candidates = self.index_seek(txn, index, value)?;
        match value {
            Value::Text(_) | Value::Blob(_) => {
                let table_meta = self.table_meta_for(txn, &meta.table)?;
                let col = table_meta.column_index(&meta.column)?;
                let mut verified = Vec::with_capacity(candidates.len());
                for rowid in candidates {
                    if let Some(row) = self.read_row_at(txn, &meta.table, rowid)? {
                        if row[col] == *value {
                            verified.push(rowid);
                        }
                    }
                }
                Ok(verified)
            }
            // Scalar keys are exact.
            _ => Ok(candidates),
        }
    }

    /// Whether any entry with `value`'s key exists (hash-level, no byte
    /// verification).
    pub fn index_has_any_key(
        &self,
        txn: Option<&ReadTransaction>,
        index: &str,
        value: &Value,
    ) -> Result<bool> {
        Ok(!self.index_seek(txn, index, value)?.is_empty())
    }

    /// Whether a row other than `exclude` stores exactly `value`. The
    /// backbone of UNIQUE enforcement on update.
    pub fn index_has_other_rowid(
        &self,
        txn: Option<&ReadTransaction>,
        index: &str,
        value: &Value,
        exclude: RowId,
    ) -> Result<bool> {
        Ok(self
            .index_seek_verified(txn, index, value)?
            .into_iter()
            .any(|rowid| rowid != exclude))
    }

    // -----------------------------------------------------------------------
    // Index builds
    // -----------------------------------------------------------------------

    /// Build a btree index over `table.column` from the existing rows.
    pub fn build_index_for_column(&self, table: &str, column: &str, unique: bool) -> Result<()> {
        self.require_txn()?;
        let meta = self.table_meta(table)?;
        let col = meta.column_index(column)?;
        let name = index_name(table, column, IndexKind::Btree, unique);
        if self.catalog.read().indexes.contains_key(&name) {
            return Err(DecentError::sql(format!("index {name} already exists")));
        }

        let mut entries: Vec<(u64, RowId, Value)> = Vec::new();
        self.scan_table_for_each(None, table, &mut |rowid, values| {
            if let Some(key) = index_key_for_value(&values[col]) {
                entries.push((key, rowid, values.into_iter().nth(col).expect("column bound")));
            }
            Ok(true)
        })?;
        entries.sort_by_key(|(key, rowid, _)| (*key, *rowid));

        if unique {
            for pair in entries.windows(2) {
                if pair[0].0 == pair[1].0 && pair[0].2 == pair[1].2 {
                    return Err(DecentError::constraint(format!(
                        "UNIQUE constraint failed: {table}.{column}"
                    )));
                }
            }
        }

        let tree = BTree::bulk_build(
            &self.pager,
            entries
                .iter()
                .map(|(key, rowid, _)| (*key, rowid_bytes(*rowid).to_vec())),
        )?;
        let index_meta = IndexMeta {
            name: name.clone(),
            table: table.to_owned(),
            column: column.to_owned(),
            root: tree.root(),
            kind: IndexKind::Btree,
            unique,
        };
        self.upsert_catalog_record(&CatalogRecord::Index(index_meta.clone()))?;
        self.catalog.write().indexes.insert(name.clone(), index_meta);
        self.bump_schema_cookie();
        info!(index = %name, rows = entries.len(), "btree index built");
        Ok(())
    }

    /// Build a trigram index over a TEXT column from the existing rows.
    pub fn build_trigram_index_for_column(&self, table: &str, column: &str) -> Result<()> {
        use decentdb_trigram::{encode_postings, trigrams_of};

        self.require_txn()?;
        let meta = self.table_meta(table)?;
        let col = meta.column_index(column)?;
        if meta.columns[col].column_type != ColumnType::Text {
            return Err(DecentError::sql(format!(
                "trigram index requires a TEXT column, {table}.{column} is {}",
                meta.columns[col].column_type.name()
            )));
        }
        let name = index_name(table, column, IndexKind::Trigram, false);
        if self.catalog.read().indexes.contains_key(&name) {
            return Err(DecentError::sql(format!("index {name} already exists")));
        }

        let mut postings: hashbrown::HashMap<u32, Vec<RowId>> = hashbrown::HashMap::new();
        self.scan_table_for_each(None, table, &mut |rowid, values| {
            if let Some(bytes) = values[col].as_bytes() {
                for token in trigrams_of(bytes) {
                    postings.entry(token).or_default().push(rowid);
                }
            }
            Ok(true)
        })?;

        let mut tokens: Vec<u32> = postings.keys().copied().collect();
        tokens.sort_unstable();
        let mut entries: Vec<(u64, Vec<u8>)> = Vec::with_capacity(tokens.len());
        for token in tokens {
            let mut rowids = postings.remove(&token).expect("token present");
            rowids.sort_unstable();
            rowids.dedup();
            entries.push((u64::from(token), encode_postings(&rowids)?));
        }
        let tree = BTree::bulk_build(&self.pager, entries)?;

        let index_meta = IndexMeta {
            name: name.clone(),
            table: table.to_owned(),
            column: column.to_owned(),
            root: tree.root(),
            kind: IndexKind::Trigram,
            unique: false,
        };
        self.upsert_catalog_record(&CatalogRecord::Index(index_meta.clone()))?;
        self.catalog.write().indexes.insert(name.clone(), index_meta);
        self.bump_schema_cookie();
        info!(index = %name, "trigram index built");
        Ok(())
    }

    /// Rebuild an index from its table, freeing the old tree.
    pub fn rebuild_index(&self, name: &str) -> Result<()> {
        self.require_txn()?;
        let meta = self.index_meta(name)?;
        free_tree(&self.pager, meta.root)?;
        self.catalog.write().indexes.remove(name);
        // The old record is replaced by the rebuild below.
        match meta.kind {
            IndexKind::Btree => {
                self.build_index_for_column(&meta.table, &meta.column, meta.unique)
            }
            IndexKind::Trigram => self.build_trigram_index_for_column(&meta.table, &meta.column),
        }
    }

    // -----------------------------------------------------------------------
    // Trigram reads
    // -----------------------------------------------------------------------

    /// On-disk postings for one trigram merged with the live delta buffer.
    pub fn trigram_postings_with_deltas(
        &self,
        txn: Option<&ReadTransaction>,
        index: &str,
        token: u32,
    ) -> Result<Vec<RowId>> {
        use decentdb_trigram::decode_postings;

        let meta = self.index_meta_for(txn, index)?;
        if meta.kind != IndexKind::Trigram {
            return Err(DecentError::sql(format!(
                "index {index} is not a trigram index"
            )));
        }
        let io = self.read_io(txn);
        let tree = BTree::open(meta.root);
        let on_disk = match tree.find(&io, u64::from(token))? {
            Some(bytes) => decode_postings(&bytes)?,
            None => Vec::new(),
        };
        let deltas = self.trigram_deltas.lock();
        match deltas.get(index).and_then(|m| m.get(&token)) {
            Some(delta) => Ok(delta.apply(&on_disk)),
            None => Ok(on_disk),
        }
    }

    /// Drive a LIKE query from the trigram index: extract pattern trigrams,
    /// intersect postings rarest-first, verify candidates by substring
    /// match. Returns `None` when the index cannot or should not drive the
    /// query (no usable trigram, or the rarest posting list exceeds the
    /// configured threshold).
    pub fn trigram_like_seek(
        &self,
        txn: Option<&ReadTransaction>,
        index: &str,
        pattern: &[u8],
    ) -> Result<Option<Vec<RowId>>> {
        let tokens = pattern_trigrams(pattern);
        if tokens.is_empty() {
            return Ok(None);
        }
        let meta = self.index_meta_for(txn, index)?;
        let table_meta = self.table_meta_for(txn, &meta.table)?;
        let col = table_meta.column_index(&meta.column)?;

        let mut lists: Vec<Vec<RowId>> = Vec::with_capacity(tokens.len());
        for token in tokens {
            lists.push(self.trigram_postings_with_deltas(txn, index, token)?);
        }
        lists.sort_by_key(Vec::len);
        if lists[0].len() as u64 > self.options.trigram_postings_threshold {
            debug!(
                index,
                rarest = lists[0].len(),
                threshold = self.options.trigram_postings_threshold,
                "trigram index refused for query"
            );
            return Ok(None);
        }

        // Progressive intersection, rarest lists first; stop early once the
        // candidate set is small enough that verification is cheaper.
        let mut candidates = lists[0].clone();
        for list in &lists[1..] {
            if candidates.len() <= 32 {
                break;
            }
            candidates = intersect(&candidates, list);
        }

        let mut matched = Vec::new();
        for rowid in candidates {
            if let Some(row) = self.read_row_at(txn, &meta.table, rowid)? {
                if let Some(bytes) = row[col].as_bytes() {
                    if matches_like(pattern, bytes) {
                        matched.push(rowid);
                    }
                }
            }
        }
        Ok(Some(matched))
    }
}

/// Deterministic index name for a table/column pair.
#[must_use]
pub fn index_name(table: &str, column: &str, kind: IndexKind, unique: bool) -> String {
    match kind {
        IndexKind::Trigram => format!("{table}_{column}_trgm"),
        IndexKind::Btree if unique => format!("{table}_{column}_unique"),
        IndexKind::Btree => format!("{table}_{column}_idx"),
    }
}
