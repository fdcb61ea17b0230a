//! Prepared statements for the native-binding boundary.
//!
//! The SQL front end is an external collaborator: it compiles SQL into a
//! [`StatementPlan`] and drives the statement through `bind_*`/`step`.
//! Rows are buffered per execution; column accessors return borrowed views
//! that stay valid until the next `step`. The last-error latch lives here
//! and only here; inside the engine, errors travel as `Result`s.

use decentdb_error::{DecentError, Result};
use decentdb_types::{RowId, Value, ValueKind};
use tracing::debug;

use crate::catalog::{ColumnDef, ViewMeta};
use crate::engine::{Engine, ReadTransaction};

/// A pre-compiled statement produced by the external SQL layer.
#[derive(Debug, Clone)]
pub enum StatementPlan {
    /// Bind one value per column, in declaration order.
    Insert { table: String },
    /// Bind the rowid, then one value per column.
    Update { table: String },
    /// Bind the rowid.
    Delete { table: String },
    /// Bind the rowid; steps over at most one row.
    SeekRowid { table: String },
    /// Full scan in rowid order.
    Scan { table: String },
    /// Bind the key value; steps over matching rows (exact-verified).
    IndexSeek { index: String },
    /// Bind the LIKE pattern as TEXT; steps over matching rows.
    TrigramLike { index: String },
    CreateTable {
        table: String,
        columns: Vec<ColumnDef>,
    },
    CreateIndex {
        table: String,
        column: String,
        unique: bool,
    },
    CreateTrigramIndex {
        table: String,
        column: String,
    },
    CreateView { view: ViewMeta },
    DropTable { table: String },
    DropIndex { index: String },
}

/// Result of one `step`.
#[derive(Debug, PartialEq, Eq)]
pub enum StepResult {
    Row,
    Done,
}

/// A prepared statement handle, borrowing its engine for its lifetime.
pub struct Statement<'db> {
    engine: &'db Engine,
    plan: StatementPlan,
    binds: Vec<Value>,
    rows: Vec<(RowId, Vec<Value>)>,
    /// Column names of the scanned table, for row-producing plans.
    column_names: Vec<String>,
    /// Index of the *next* row to yield; the current row is `pos - 1`.
    pos: usize,
    executed: bool,
    rows_affected: u64,
    read_txn: Option<ReadTransaction>,
}

impl Engine {
    /// Prepare a statement from a plan built by the SQL layer.
    pub fn prepare(&self, plan: StatementPlan) -> Statement<'_> {
        Statement {
            engine: self,
            plan,
            binds: Vec::new(),
            rows: Vec::new(),
            column_names: Vec::new(),
            pos: 0,
            executed: false,
            rows_affected: 0,
            read_txn: None,
        }
    }

    /// Execute a non-SELECT statement to completion, auto-committing when
    /// no transaction is open. Returns rows affected.
    pub fn exec_prepared_non_select(
        &self,
        plan: StatementPlan,
        params: Vec<Value>,
    ) -> Result<u64> {
        let mut statement = self.prepare(plan);
        for (i, value) in params.into_iter().enumerate() {
            statement.bind_value(i, value)?;
        }
        let auto = !self.in_transaction();
        if auto {
            self.begin().inspect_err(|e| self.note_error(e))?;
        }
        let result = statement.run_to_completion();
        match result {
            Ok(n) => {
                if auto {
                    self.commit().inspect_err(|e| self.note_error(e))?;
                }
                Ok(n)
            }
            Err(err) => {
                if auto {
                    let _ = self.rollback();
                }
                self.note_error(&err);
                Err(err)
            }
        }
    }
}

impl Statement<'_> {
    // -----------------------------------------------------------------------
    // Binding
    // -----------------------------------------------------------------------

    /// Bind a value at 0-based position `i`, growing the bind list with
    /// NULLs as needed.
    pub fn bind_value(&mut self, i: usize, value: Value) -> Result<()> {
        if self.executed {
            return Err(DecentError::sql("cannot bind after step; reset first"));
        }
        if self.binds.len() <= i {
            self.binds.resize(i + 1, Value::Null);
        }
        self.binds[i] = value;
        Ok(())
    }

    pub fn bind_null(&mut self, i: usize) -> Result<()> {
        self.bind_value(i, Value::Null)
    }

    pub fn bind_int64(&mut self, i: usize, v: i64) -> Result<()> {
        self.bind_value(i, Value::Int64(v))
    }

    pub fn bind_float64(&mut self, i: usize, v: f64) -> Result<()> {
        self.bind_value(i, Value::Float64(v))
    }

    pub fn bind_text(&mut self, i: usize, v: &str) -> Result<()> {
        self.bind_value(i, Value::Text(v.as_bytes().to_vec()))
    }

    pub fn bind_blob(&mut self, i: usize, v: &[u8]) -> Result<()> {
        self.bind_value(i, Value::Blob(v.to_vec()))
    }

    pub fn clear_bindings(&mut self) {
        self.binds.clear();
    }

    /// Rewind for re-execution with the current bindings.
    pub fn reset(&mut self) {
        self.rows.clear();
        self.column_names.clear();
        self.pos = 0;
        self.executed = false;
        self.rows_affected = 0;
        self.release_read_txn();
    }

    /// Release resources; the statement can no longer step.
    pub fn finalize(&mut self) {
        self.reset();
        self.binds.clear();
    }

    fn release_read_txn(&mut self) {
        if let Some(txn) = self.read_txn.take() {
            self.engine.end_read(&txn);
        }
    }

    // -----------------------------------------------------------------------
    // Execution
    // -----------------------------------------------------------------------

    /// Advance to the next row. The first call executes the plan.
    pub fn step(&mut self) -> Result<StepResult> {
        if !self.executed {
            if let Err(err) = self.execute() {
                self.engine.note_error(&err);
                return Err(err);
            }
        }
        if self.pos < self.rows.len() {
            self.pos += 1;
            return Ok(StepResult::Row);
        }
        self.release_read_txn();
        Ok(StepResult::Done)
    }

    fn run_to_completion(&mut self) -> Result<u64> {
        while self.step()? == StepResult::Row {}
        Ok(self.rows_affected)
    }

    fn bind(&self, i: usize) -> Result<&Value> {
        self.binds
            .get(i)
            .ok_or_else(|| DecentError::sql(format!("missing bind parameter {i}")))
    }

    fn execute(&mut self) -> Result<()> {
        self.executed = true;
        let plan = self.plan.clone();
        match plan {
            StatementPlan::Insert { table } => {
                self.engine.insert_row(&table, self.binds.clone())?;
                self.rows_affected = 1;
            }
            StatementPlan::Update { table } => {
                let rowid = self.rowid_bind(0)?;
                let values = self.binds[1..].to_vec();
                let updated = self.engine.update_row(&table, rowid, values)?;
                self.rows_affected = u64::from(updated);
            }
            StatementPlan::Delete { table } => {
                let rowid = self.rowid_bind(0)?;
                let deleted = self.engine.delete_row(&table, rowid)?;
                self.rows_affected = u64::from(deleted);
            }
            StatementPlan::SeekRowid { table } => {
                let rowid = self.rowid_bind(0)?;
                let txn = self.start_read();
                self.load_column_names(txn.as_ref(), &table)?;
                if let Some(values) = self.engine.read_row_at(txn.as_ref(), &table, rowid)? {
                    self.rows.push((rowid, values));
                }
                self.read_txn = txn;
            }
            StatementPlan::Scan { table } => {
                let txn = self.start_read();
                self.load_column_names(txn.as_ref(), &table)?;
                self.rows = self.engine.scan_table(txn.as_ref(), &table)?;
                self.read_txn = txn;
            }
            StatementPlan::IndexSeek { index } => {
                let key = self.bind(0)?.clone();
                let txn = self.start_read();
                let meta = self.engine.catalog.read().index(&index)?.clone();
                self.load_column_names(txn.as_ref(), &meta.table)?;
                let rowids = self.engine.index_seek_verified(txn.as_ref(), &index, &key)?;
                for rowid in rowids {
                    if let Some(values) =
                        self.engine.read_row_at(txn.as_ref(), &meta.table, rowid)?
                    {
                        self.rows.push((rowid, values));
                    }
                }
                self.read_txn = txn;
            }
            StatementPlan::TrigramLike { index } => {
                let pattern = match self.bind(0)? {
                    Value::Text(bytes) => bytes.clone(),
                    other => {
                        return Err(DecentError::sql(format!(
                            "LIKE pattern must be TEXT, got {}",
                            other.kind()
                        )));
                    }
                };
                let txn = self.start_read();
                let meta = self.engine.catalog.read().index(&index)?.clone();
                self.load_column_names(txn.as_ref(), &meta.table)?;
                let Some(rowids) =
                    self.engine
                        .trigram_like_seek(txn.as_ref(), &index, &pattern)?
                else {
                    self.release_after(txn);
                    return Err(DecentError::sql(
                        "trigram index refused for this pattern; use another predicate",
                    ));
                };
                for rowid in rowids {
                    if let Some(values) =
                        self.engine.read_row_at(txn.as_ref(), &meta.table, rowid)?
                    {
                        self.rows.push((rowid, values));
                    }
                }
                self.read_txn = txn;
            }
            StatementPlan::CreateTable { table, columns } => {
                self.engine.create_table(&table, columns)?;
            }
            StatementPlan::CreateIndex {
                table,
                column,
                unique,
            } => {
                self.engine.build_index_for_column(&table, &column, unique)?;
            }
            StatementPlan::CreateTrigramIndex { table, column } => {
                self.engine.build_trigram_index_for_column(&table, &column)?;
            }
            StatementPlan::CreateView { view } => {
                self.engine.create_view(view)?;
            }
            StatementPlan::DropTable { table } => {
                self.engine.drop_table(&table)?;
            }
            StatementPlan::DropIndex { index } => {
                self.engine.drop_index(&index)?;
            }
        }
        debug!(rows = self.rows.len(), affected = self.rows_affected, "statement executed");
        Ok(())
    }

    fn load_column_names(&mut self, txn: Option<&ReadTransaction>, table: &str) -> Result<()> {
        let meta = self.engine.table_meta_for(txn, table)?;
        self.column_names = meta.columns.iter().map(|c| c.name.clone()).collect();
        Ok(())
    }

    /// Queries inside a write transaction read the writer's own view;
    /// otherwise a fresh snapshot read transaction is taken.
    fn start_read(&self) -> Option<ReadTransaction> {
        if self.engine.in_transaction() {
            None
        } else {
            Some(self.engine.begin_read())
        }
    }

    fn release_after(&mut self, txn: Option<ReadTransaction>) {
        if let Some(txn) = txn {
            self.engine.end_read(&txn);
        }
    }

    fn rowid_bind(&self, i: usize) -> Result<RowId> {
        self.bind(i)?
            .as_int64()
            .map(|v| v as u64)
            .ok_or_else(|| DecentError::sql("rowid bind must be INT64"))
    }

    // -----------------------------------------------------------------------
    // Row accessors
    // -----------------------------------------------------------------------

    fn current(&self) -> Result<&(RowId, Vec<Value>)> {
        if self.pos == 0 || self.pos > self.rows.len() {
            return Err(DecentError::sql("no current row"));
        }
        Ok(&self.rows[self.pos - 1])
    }

    /// Borrowed view of the current row; valid until the next `step`.
    pub fn row_view(&self) -> Result<&[Value]> {
        Ok(&self.current()?.1)
    }

    pub fn current_rowid(&self) -> Result<RowId> {
        Ok(self.current()?.0)
    }

    pub fn column_count(&self) -> usize {
        self.rows
            .get(self.pos.saturating_sub(1))
            .map_or(0, |(_, values)| values.len())
    }

    pub fn column_type(&self, i: usize) -> Result<ValueKind> {
        Ok(self.column(i)?.kind())
    }

    /// Declared name of column `i` for row-producing plans.
    pub fn column_name(&self, i: usize) -> Result<&str> {
        self.column_names
            .get(i)
            .map(String::as_str)
            .ok_or_else(|| DecentError::sql(format!("column index {i} out of range")))
    }

    fn column(&self, i: usize) -> Result<&Value> {
        let (_, values) = self.current()?;
        values
            .get(i)
            .ok_or_else(|| DecentError::sql(format!("column index {i} out of range")))
    }

    pub fn column_int64(&self, i: usize) -> Result<i64> {
        self.column(i)?
            .as_int64()
            .ok_or_else(|| DecentError::sql(format!("column {i} is not INT64")))
    }

    pub fn column_float64(&self, i: usize) -> Result<f64> {
        match self.column(i)? {
            Value::Float64(v) => Ok(*v),
            other => Err(DecentError::sql(format!(
                "column {i} is not FLOAT64 (got {})",
                other.kind()
            ))),
        }
    }

    /// Borrowed text bytes; callers copy before the next `step`.
    pub fn column_text(&self, i: usize) -> Result<&[u8]> {
        match self.column(i)? {
            Value::Text(bytes) => Ok(bytes),
            other => Err(DecentError::sql(format!(
                "column {i} is not TEXT (got {})",
                other.kind()
            ))),
        }
    }

    /// Borrowed blob bytes; callers copy before the next `step`.
    pub fn column_blob(&self, i: usize) -> Result<&[u8]> {
        match self.column(i)? {
            Value::Blob(bytes) => Ok(bytes),
            other => Err(DecentError::sql(format!(
                "column {i} is not BLOB (got {})",
                other.kind()
            ))),
        }
    }

    #[must_use]
    pub fn rows_affected(&self) -> u64 {
        self.rows_affected
    }
}

impl Drop for Statement<'_> {
    fn drop(&mut self) {
        self.release_read_txn();
    }
}
