//! The catalog: schema records in a system B+Tree plus in-memory maps.
//!
//! Records are keyed by CRC-32C of the object name and encoded with the
//! row codec. Hash collisions between names are handled by storing
//! duplicates under the same key and comparing names on lookup. The system
//! tree's root lives in the DB header; any DDL bumps the schema cookie.

use decentdb_btree::BTree;
use decentdb_error::{DecentError, Result};
use decentdb_pager::{PageIo, Pager};
use decentdb_record::{decode_row, encode_row};
use decentdb_types::{PageId, RowId, Value};
use hashbrown::HashMap;
use tracing::debug;

/// Column type as declared in the schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Int64,
    Bool,
    Float64,
    Text,
    Blob,
}

impl ColumnType {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Int64 => "INT64",
            Self::Bool => "BOOL",
            Self::Float64 => "FLOAT64",
            Self::Text => "TEXT",
            Self::Blob => "BLOB",
        }
    }

    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "INT64" => Ok(Self::Int64),
            "BOOL" => Ok(Self::Bool),
            "FLOAT64" => Ok(Self::Float64),
            "TEXT" => Ok(Self::Text),
            "BLOB" => Ok(Self::Blob),
            other => Err(DecentError::corruption(format!(
                "unknown column type {other:?} in catalog record"
            ))),
        }
    }
}

/// One column definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub column_type: ColumnType,
    pub not_null: bool,
    pub unique: bool,
    pub primary_key: bool,
    /// Foreign key target, when declared.
    pub ref_table: Option<String>,
    pub ref_column: Option<String>,
}

impl ColumnDef {
    #[must_use]
    pub fn new(name: &str, column_type: ColumnType) -> Self {
        Self {
            name: name.to_owned(),
            column_type,
            not_null: false,
            unique: false,
            primary_key: false,
            ref_table: None,
            ref_column: None,
        }
    }

    #[must_use]
    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.not_null = true;
        self.unique = true;
        self
    }

    #[must_use]
    pub fn not_null(mut self) -> Self {
        self.not_null = true;
        self
    }

    #[must_use]
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    #[must_use]
    pub fn references(mut self, table: &str, column: &str) -> Self {
        self.ref_table = Some(table.to_owned());
        self.ref_column = Some(column.to_owned());
        self
    }
}

/// Table metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableMeta {
    pub name: String,
    pub root: PageId,
    pub next_rowid: RowId,
    pub columns: Vec<ColumnDef>,
}

impl TableMeta {
    pub fn column_index(&self, column: &str) -> Result<usize> {
        self.columns
            .iter()
            .position(|c| c.name == column)
            .ok_or_else(|| DecentError::sql(format!("no column {column:?} in {:?}", self.name)))
    }

    /// The INTEGER PRIMARY KEY column, when the table has one. Its value is
    /// the rowid itself.
    #[must_use]
    pub fn rowid_column(&self) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.primary_key && c.column_type == ColumnType::Int64)
    }
}

/// Index kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    Btree,
    Trigram,
}

impl IndexKind {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Btree => "btree",
            Self::Trigram => "trigram",
        }
    }

    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "btree" => Ok(Self::Btree),
            "trigram" => Ok(Self::Trigram),
            other => Err(DecentError::corruption(format!(
                "unknown index kind {other:?} in catalog record"
            ))),
        }
    }
}

/// Index metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexMeta {
    pub name: String,
    pub table: String,
    pub column: String,
    pub root: PageId,
    pub kind: IndexKind,
    pub unique: bool,
}

/// View metadata: SQL text plus dependencies, stored for the SQL layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewMeta {
    pub name: String,
    pub sql: String,
    pub columns: Vec<String>,
    pub dependencies: Vec<String>,
}

/// Catalog key: CRC-32C of the object name.
#[must_use]
pub fn catalog_key(name: &str) -> u64 {
    u64::from(crc32c::crc32c(name.as_bytes()))
}

fn text(value: &Value, what: &str) -> Result<String> {
    match value {
        Value::Text(bytes) => String::from_utf8(bytes.clone())
            .map_err(|_| DecentError::corruption(format!("{what} is not UTF-8"))),
        _ => Err(DecentError::corruption(format!("{what} is not TEXT"))),
    }
}

fn int(value: &Value, what: &str) -> Result<i64> {
    value
        .as_int64()
        .ok_or_else(|| DecentError::corruption(format!("{what} is not INT64")))
}

fn boolean(value: &Value, what: &str) -> Result<bool> {
    match value {
        Value::Bool(b) => Ok(*b),
        _ => Err(DecentError::corruption(format!("{what} is not BOOL"))),
    }
}

fn opt_text(s: &Option<String>) -> Value {
    Value::Text(s.clone().unwrap_or_default().into_bytes())
}

/// A decoded catalog record.
#[derive(Debug, Clone, PartialEq)]
pub enum CatalogRecord {
    Table(TableMeta),
    Index(IndexMeta),
    View(ViewMeta),
}

impl CatalogRecord {
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Table(t) => &t.name,
            Self::Index(i) => &i.name,
            Self::View(v) => &v.name,
        }
    }

    /// Encode into row-codec cells.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut cells: Vec<Value> = Vec::new();
        match self {
            Self::Table(meta) => {
                cells.push(Value::Text(b"table".to_vec()));
                cells.push(Value::Text(meta.name.clone().into_bytes()));
                cells.push(Value::Int64(i64::from(meta.root.get())));
                cells.push(Value::Int64(meta.next_rowid as i64));
                cells.push(Value::Int64(meta.columns.len() as i64));
                for col in &meta.columns {
                    cells.push(Value::Text(col.name.clone().into_bytes()));
                    cells.push(Value::Text(col.column_type.name().as_bytes().to_vec()));
                    cells.push(Value::Bool(col.not_null));
                    cells.push(Value::Bool(col.unique));
                    cells.push(Value::Bool(col.primary_key));
                    cells.push(opt_text(&col.ref_table));
                    cells.push(opt_text(&col.ref_column));
                }
            }
            Self::Index(meta) => {
                cells.push(Value::Text(b"index".to_vec()));
                cells.push(Value::Text(meta.name.clone().into_bytes()));
                cells.push(Value::Text(meta.table.clone().into_bytes()));
                cells.push(Value::Text(meta.column.clone().into_bytes()));
                cells.push(Value::Int64(i64::from(meta.root.get())));
                cells.push(Value::Text(meta.kind.name().as_bytes().to_vec()));
                cells.push(Value::Bool(meta.unique));
            }
            Self::View(meta) => {
                cells.push(Value::Text(b"view".to_vec()));
                cells.push(Value::Text(meta.name.clone().into_bytes()));
                cells.push(Value::Text(meta.sql.clone().into_bytes()));
                cells.push(Value::Int64(meta.columns.len() as i64));
                for col in &meta.columns {
                    cells.push(Value::Text(col.clone().into_bytes()));
                }
                cells.push(Value::Int64(meta.dependencies.len() as i64));
                for dep in &meta.dependencies {
                    cells.push(Value::Text(dep.clone().into_bytes()));
                }
            }
        }
        encode_row(&cells)
    }

    /// Decode from row-codec cells.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        fn cell<'a>(cells: &'a [Value], at: &mut usize, what: &str) -> Result<&'a Value> {
            let out = cells
                .get(*at)
                .ok_or_else(|| DecentError::corruption(format!("catalog record missing {what}")))?;
            *at += 1;
            Ok(out)
        }

        let cells = decode_row(bytes)?;
        let mut at = 0_usize;
        let mut next = |what: &str| cell(&cells, &mut at, what);

        let kind = text(next("kind")?, "catalog record kind")?;
        match kind.as_str() {
            "table" => {
                let name = text(next("name")?, "table name")?;
                let root = PageId::decode(int(next("root")?, "table root")? as u32)?;
                let next_rowid = int(next("next rowid")?, "next rowid")? as u64;
                let ncols = int(next("column count")?, "column count")? as usize;
                let mut columns = Vec::with_capacity(ncols);
                for _ in 0..ncols {
                    let col_name = text(next("column name")?, "column name")?;
                    let col_type = ColumnType::parse(&text(next("column type")?, "column type")?)?;
                    let not_null = boolean(next("not null")?, "not null flag")?;
                    let unique = boolean(next("unique")?, "unique flag")?;
                    let primary_key = boolean(next("primary key")?, "primary key flag")?;
                    let ref_table = text(next("ref table")?, "ref table")?;
                    let ref_column = text(next("ref column")?, "ref column")?;
                    columns.push(ColumnDef {
                        name: col_name,
                        column_type: col_type,
                        not_null,
                        unique,
                        primary_key,
                        ref_table: (!ref_table.is_empty()).then_some(ref_table),
                        ref_column: (!ref_column.is_empty()).then_some(ref_column),
                    });
                }
                Ok(Self::Table(TableMeta {
                    name,
                    root,
                    next_rowid,
                    columns,
                }))
            }
            "index" => {
                let name = text(next("name")?, "index name")?;
                let table = text(next("table")?, "index table")?;
                let column = text(next("column")?, "index column")?;
                let root = PageId::decode(int(next("root")?, "index root")? as u32)?;
                let kind = IndexKind::parse(&text(next("kind")?, "index kind")?)?;
                let unique = boolean(next("unique")?, "unique flag")?;
                Ok(Self::Index(IndexMeta {
                    name,
                    table,
                    column,
                    root,
                    kind,
                    unique,
                }))
            }
            "view" => {
                let name = text(next("name")?, "view name")?;
                let sql = text(next("sql")?, "view sql")?;
                let ncols = int(next("column count")?, "column count")? as usize;
                let mut columns = Vec::with_capacity(ncols);
                for _ in 0..ncols {
                    columns.push(text(next("view column")?, "view column")?);
                }
                let ndeps = int(next("dependency count")?, "dependency count")? as usize;
                let mut dependencies = Vec::with_capacity(ndeps);
                for _ in 0..ndeps {
                    dependencies.push(text(next("dependency")?, "dependency")?);
                }
                Ok(Self::View(ViewMeta {
                    name,
                    sql,
                    columns,
                    dependencies,
                }))
            }
            other => Err(DecentError::corruption(format!(
                "unknown catalog record kind {other:?}"
            ))),
        }
    }
}

/// In-memory catalog: parallel maps plus the system tree handle.
#[derive(Debug, Default)]
pub struct Catalog {
    pub tables: HashMap<String, TableMeta>,
    pub indexes: HashMap<String, IndexMeta>,
    pub views: HashMap<String, ViewMeta>,
    /// Tables whose `next_rowid` or root moved since the last flush.
    dirty: Vec<String>,
}

impl Catalog {
    /// Load all records from the system tree.
    pub fn load(io: &PageIo<'_>, root: Option<PageId>) -> Result<Self> {
        let mut catalog = Self::default();
        let Some(root) = root else {
            return Ok(catalog);
        };
        let tree = BTree::open(root);
        let mut cursor = tree.cursor(io)?;
        while let Some(entry) = cursor.next()? {
            match CatalogRecord::decode(&entry.value)? {
                CatalogRecord::Table(meta) => {
                    catalog.tables.insert(meta.name.clone(), meta);
                }
                CatalogRecord::Index(meta) => {
                    catalog.indexes.insert(meta.name.clone(), meta);
                }
                CatalogRecord::View(meta) => {
                    catalog.views.insert(meta.name.clone(), meta);
                }
            }
        }
        debug!(
            tables = catalog.tables.len(),
            indexes = catalog.indexes.len(),
            views = catalog.views.len(),
            "catalog loaded"
        );
        Ok(catalog)
    }

    pub fn table(&self, name: &str) -> Result<&TableMeta> {
        self.tables
            .get(name)
            .ok_or_else(|| DecentError::sql(format!("no such table: {name}")))
    }

    pub fn index(&self, name: &str) -> Result<&IndexMeta> {
        self.indexes
            .get(name)
            .ok_or_else(|| DecentError::sql(format!("no such index: {name}")))
    }

    /// Indexes declared on `table`.
    #[must_use]
    pub fn indexes_on(&self, table: &str) -> Vec<IndexMeta> {
        let mut out: Vec<IndexMeta> = self
            .indexes
            .values()
            .filter(|i| i.table == table)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// The btree index on `table.column`, if any.
    #[must_use]
    pub fn btree_index_on(&self, table: &str, column: &str) -> Option<&IndexMeta> {
        self.indexes
            .values()
            .find(|i| i.table == table && i.column == column && i.kind == IndexKind::Btree)
    }

    pub fn mark_table_dirty(&mut self, name: &str) {
        if !self.dirty.iter().any(|d| d == name) {
            self.dirty.push(name.to_owned());
        }
    }

    #[must_use]
    pub fn has_dirty_tables(&self) -> bool {
        !self.dirty.is_empty()
    }

    /// Rewrite the records of dirty tables into the system tree. Returns
    /// the (possibly moved) root.
    pub fn flush_dirty(&mut self, pager: &Pager, root: PageId) -> Result<PageId> {
        let mut tree = BTree::open(root);
        let dirty = std::mem::take(&mut self.dirty);
        for name in dirty {
            let Some(meta) = self.tables.get(&name) else {
                continue;
            };
            upsert_record(&mut tree, pager, &CatalogRecord::Table(meta.clone()))?;
        }
        Ok(tree.root())
    }
}

/// Insert or replace `record` in the system tree, keyed by CRC-32C of its
/// name. Name collisions coexist as duplicates under one key; replacement
/// matches on the decoded name.
pub fn upsert_record(tree: &mut BTree, pager: &Pager, record: &CatalogRecord) -> Result<()> {
    let key = catalog_key(record.name());
    let io = pager.io();
    // Remove an existing record for this name, tolerating hash collisions.
    let mut cursor = tree.cursor_at(&io, key)?;
    let mut replace: Option<Vec<u8>> = None;
    while let Some(entry) = cursor.next()? {
        if entry.key != key {
            break;
        }
        if CatalogRecord::decode(&entry.value)?.name() == record.name() {
            replace = Some(entry.value);
            break;
        }
    }
    if let Some(old) = replace {
        tree.delete_key_value(pager, key, &old)?;
    }
    tree.insert(pager, key, &record.encode())
}

/// Remove the record for `name`, if present.
pub fn delete_record(tree: &mut BTree, pager: &Pager, name: &str) -> Result<bool> {
    let key = catalog_key(name);
    let io = pager.io();
    let mut cursor = tree.cursor_at(&io, key)?;
    while let Some(entry) = cursor.next()? {
        if entry.key != key {
            break;
        }
        if CatalogRecord::decode(&entry.value)?.name() == name {
            return tree.delete_key_value(pager, key, &entry.value);
        }
    }
    Ok(false)
}
