//! Bulk loading: batched validation and inserts with configurable
//! durability, plus an external sort for intra-load UNIQUE detection that
//! never holds the full key set in memory.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};

use decentdb_error::{DecentError, Result, ResultExt};
use decentdb_types::{BulkOptions, Durability, Value};
use tracing::{debug, info};

use crate::engine::Engine;

/// Keys per in-memory run before spilling to the temp file.
const RUN_CAPACITY: usize = 64 * 1024;

/// External duplicate detector: length-prefixed keys are buffered into
/// sorted runs, each run spilled to a shared temp file, and the runs merged
/// with a heap at the end. Two equal keys anywhere in the stream mean a
/// duplicate.
pub struct ExternalKeySorter {
    spill: BufWriter<File>,
    runs: Vec<(u64, u64)>,
    current: Vec<Vec<u8>>,
    spilled_bytes: u64,
}

impl ExternalKeySorter {
    pub fn new() -> Result<Self> {
        let file = tempfile::tempfile().context("bulk sorter temp file")?;
        Ok(Self {
            spill: BufWriter::new(file),
            runs: Vec::new(),
            current: Vec::with_capacity(RUN_CAPACITY),
            spilled_bytes: 0,
        })
    }

    pub fn push(&mut self, key: Vec<u8>) -> Result<()> {
        self.current.push(key);
        if self.current.len() >= RUN_CAPACITY {
            self.spill_run()?;
        }
        Ok(())
    }

    fn spill_run(&mut self) -> Result<()> {
        if self.current.is_empty() {
            return Ok(());
        }
        self.current.sort_unstable();
        let start = self.spilled_bytes;
        for key in self.current.drain(..) {
            let len = (key.len() as u32).to_le_bytes();
            self.spill.write_all(&len).context("bulk sorter spill")?;
            self.spill.write_all(&key).context("bulk sorter spill")?;
            self.spilled_bytes += 4 + key.len() as u64;
        }
        self.runs.push((start, self.spilled_bytes));
        Ok(())
    }

    /// Merge all runs; returns the first duplicated key, if any.
    pub fn find_duplicate(mut self) -> Result<Option<Vec<u8>>> {
        use std::cmp::Reverse;
        use std::collections::BinaryHeap;

        self.spill_run()?;
        if self.runs.is_empty() {
            return Ok(None);
        }
        let mut file = self.spill.into_inner().map_err(|e| {
            DecentError::internal(format!("bulk sorter flush failed: {}", e.error()))
        })?;
        file.seek(SeekFrom::Start(0)).context("bulk sorter rewind")?;

        struct RunReader {
            reader: BufReader<File>,
            pos: u64,
            end: u64,
        }
        impl RunReader {
            fn next_key(&mut self) -> Result<Option<Vec<u8>>> {
                if self.pos >= self.end {
                    return Ok(None);
                }
                let mut len_buf = [0_u8; 4];
                self.reader
                    .read_exact(&mut len_buf)
                    .context("bulk sorter run read")?;
                let len = u32::from_le_bytes(len_buf) as usize;
                let mut key = vec![0_u8; len];
                self.reader
                    .read_exact(&mut key)
                    .context("bulk sorter run read")?;
                self.pos += 4 + len as u64;
                Ok(Some(key))
            }
        }

        let mut readers = Vec::with_capacity(self.runs.len());
        for (start, end) in &self.runs {
            let clone = file.try_clone().context("bulk sorter clone")?;
            let mut reader = BufReader::new(clone);
            reader
                .seek(SeekFrom::Start(*start))
                .context("bulk sorter seek")?;
            readers.push(RunReader {
                reader,
                pos: *start,
                end: *end,
            });
        }

        let mut heap: BinaryHeap<Reverse<(Vec<u8>, usize)>> = BinaryHeap::new();
        for (i, reader) in readers.iter_mut().enumerate() {
            if let Some(key) = reader.next_key()? {
                heap.push(Reverse((key, i)));
            }
        }
        let mut previous: Option<Vec<u8>> = None;
        while let Some(Reverse((key, run))) = heap.pop() {
            if previous.as_ref() == Some(&key) {
                return Ok(Some(key));
            }
            if let Some(next) = readers[run].next_key()? {
                heap.push(Reverse((next, run)));
            }
            previous = Some(key);
        }
        Ok(None)
    }
}

/// Sortable key bytes for a unique-column value: type-tagged so values of
/// different kinds never compare equal.
fn unique_key_bytes(value: &Value) -> Option<Vec<u8>> {
    let mut out = Vec::new();
    match value {
        Value::Null => return None,
        Value::Int64(v) => {
            out.push(1);
            out.extend_from_slice(&v.to_le_bytes());
        }
        Value::Bool(b) => {
            out.push(2);
            out.push(u8::from(*b));
        }
        Value::Float64(f) => {
            out.push(3);
            out.extend_from_slice(&f.to_bits().to_le_bytes());
        }
        Value::Text(bytes) => {
            out.push(4);
            out.extend_from_slice(bytes);
        }
        Value::Blob(bytes) => {
            out.push(5);
            out.extend_from_slice(bytes);
        }
        Value::TextOverflow(..) | Value::BlobOverflow(..) => return None,
    }
    Some(out)
}

impl Engine {
    /// Load `rows` into `table` in batches.
    ///
    /// A pre-insert sweep feeds every unique-column key through an
    /// external sort and rejects the load on any duplicate within the
    /// incoming rows, wherever the two rows sit; the full key set never
    /// sits in RAM, and no batch can commit durably ahead of a violation
    /// that a later batch would reveal. Per-batch validation (NOT NULL,
    /// FK, UNIQUE against existing data) then runs as the batches insert.
    /// Any failure rolls back the open transaction and surfaces the error.
    pub fn bulk_load(
        &self,
        table: &str,
        rows: Vec<Vec<Value>>,
        options: &BulkOptions,
    ) -> Result<u64> {
        self.require_no_txn()?;
        let meta = self.catalog.read().table(table)?.clone();
        let unique_columns: Vec<usize> = meta
            .columns
            .iter()
            .enumerate()
            .filter(|(_, c)| c.unique)
            .map(|(i, _)| i)
            .collect();

        // Cross-batch duplicate sweep, before any row touches the tree.
        // Short rows are skipped here; their arity error surfaces from the
        // insert path.
        for &col in &unique_columns {
            let mut sorter = ExternalKeySorter::new()?;
            for row in &rows {
                if let Some(key) = row.get(col).and_then(unique_key_bytes) {
                    sorter.push(key)?;
                }
            }
            if sorter.find_duplicate()?.is_some() {
                return Err(DecentError::constraint(format!(
                    "UNIQUE constraint failed: {}.{}",
                    meta.name, meta.columns[col].name
                )));
            }
        }

        let total = rows.len();
        let mut inserted = 0_u64;
        let mut batches_since_sync = 0_usize;

        self.begin()?;
        let result: Result<()> = (|| {
            for batch in rows.chunks(options.batch_size.max(1)) {
                self.enforce_constraints_batch(None, &meta, batch)?;
                for row in batch {
                    if options.disable_indexes {
                        self.insert_row_no_indexes(table, row.clone())?;
                    } else {
                        self.insert_row(table, row.clone())?;
                    }
                    inserted += 1;
                }
                batches_since_sync += 1;
                match options.durability {
                    Durability::Full => {
                        self.commit()?;
                        self.begin()?;
                    }
                    Durability::Deferred => {
                        if batches_since_sync >= options.sync_interval.max(1) {
                            self.commit()?;
                            self.begin()?;
                            batches_since_sync = 0;
                        }
                    }
                    Durability::None => {}
                }
                debug!(inserted, total, "bulk batch loaded");
            }

            if options.disable_indexes {
                let indexes = self.catalog.read().indexes_on(table);
                for index in indexes {
                    self.rebuild_index(&index.name)?;
                }
            }
            Ok(())
        })();

        if let Err(err) = result {
            if self.in_transaction() {
                let _ = self.rollback();
            }
            return Err(err);
        }

        match options.durability {
            Durability::Full | Durability::Deferred => {
                self.commit()?;
            }
            Durability::None => {
                // Never commit: write the dirty pages straight to the main
                // file and drop the WAL overlay for this connection.
                self.flush_all_no_wal()?;
            }
        }

        if options.checkpoint_on_complete {
            self.checkpoint()?;
        }
        info!(table, inserted, "bulk load complete");
        Ok(inserted)
    }

    fn require_no_txn(&self) -> Result<()> {
        if self.in_transaction() {
            return Err(DecentError::transaction(
                "bulk load requires no active transaction",
            ));
        }
        Ok(())
    }

    /// Non-durable finish for `Durability::None`: flush dirty pages to the
    /// file directly, discard the writer, and disable the overlay.
    fn flush_all_no_wal(&self) -> Result<()> {
        self.discard_writer_keep_pages()?;
        self.pager.flush_all()?;
        self.disable_overlay();
        Ok(())
    }
}
