//! The engine: owns the pager and WAL, coordinates transactions and
//! checkpoints, and exposes the SQL-independent primitives.
//!
//! Locking order, outermost first: engine writer slot → pager internals →
//! WAL internals. The commit path collects dirty pages before touching the
//! writer slot so the pager's spill path (which takes the slot from inside
//! a pager lock) can never deadlock against it.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use decentdb_btree::BTree;
use decentdb_error::{DecentError, Result};
use decentdb_pager::{
    DB_HEADER_SIZE, DbHeader, DirtyPageSink, PageIo, PageResolver, Pager, ReadGuard, freelist,
};
use decentdb_trigram::TrigramDeltaMap;
use decentdb_types::{Lsn, OpenOptions, PageId, PageSize};
use decentdb_vfs::{StdVfs, Vfs, VfsFile, read_exact_at, write_all_at};
use decentdb_wal::{ReadTxn as WalReadTxn, Wal, WalWriter};

use crate::catalog::{Catalog, CatalogRecord, ColumnDef, upsert_record};

// ---------------------------------------------------------------------------
// Pager↔WAL adapters
// ---------------------------------------------------------------------------

/// Overlay resolver bridging pager reads to WAL snapshot lookups.
struct WalOverlay {
    wal: Arc<Wal>,
    enabled: Arc<AtomicBool>,
}

impl PageResolver for WalOverlay {
    fn resolve(&self, page: PageId, snapshot: Lsn) -> Result<Option<(Lsn, Vec<u8>)>> {
        if !self.enabled.load(Ordering::Acquire) {
            return Ok(None);
        }
        let snap = if snapshot.is_zero() {
            None
        } else {
            Some(snapshot)
        };
        self.wal.page_at_or_before(page, snap)
    }
}

/// Writer-scoped spill sink: dirty evictions become uncommitted PAGE
/// frames of the active writer.
struct WriterSink {
    writer: Arc<Mutex<Option<WalWriter>>>,
    wal: Arc<Wal>,
}

impl DirtyPageSink for WriterSink {
    fn spill(&self, page: PageId, data: &[u8]) -> Result<u64> {
        let mut slot = self.writer.lock();
        let writer = slot
            .as_mut()
            .ok_or_else(|| DecentError::internal("spill with no active writer"))?;
        writer.write_page(page, data)
    }

    fn reload(&self, _page: PageId, payload_offset: u64) -> Result<Vec<u8>> {
        self.wal.read_payload(payload_offset)
    }
}

/// Read guard failing reads from a reader that a checkpoint aborted.
struct ReaderGuard {
    state: Arc<decentdb_wal::ReaderState>,
}

impl ReadGuard for ReaderGuard {
    fn check(&self) -> Result<()> {
        if self.state.is_aborted() {
            return Err(DecentError::aborted());
        }
        Ok(())
    }
}

/// A registered read transaction.
///
/// Carries a lazily-loaded copy of the catalog as of the snapshot, so a
/// concurrent writer moving tree roots can never redirect this reader to
/// pages that did not exist at its snapshot.
#[derive(Debug)]
pub struct ReadTransaction {
    inner: WalReadTxn,
    snapshot_catalog: Mutex<Option<Arc<Catalog>>>,
}

impl ReadTransaction {
    #[must_use]
    pub fn snapshot(&self) -> Lsn {
        self.inner.snapshot()
    }

    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.inner.is_aborted()
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine").field("path", &self.path).finish_non_exhaustive()
    }
}

/// An open database.
pub struct Engine {
    path: PathBuf,
    /// Kept so the VFS outlives every file handle it produced.
    _vfs: Arc<dyn Vfs>,
    pub(crate) pager: Arc<Pager>,
    pub(crate) wal: Arc<Wal>,
    pub(crate) header: Mutex<DbHeader>,
    pub(crate) catalog: RwLock<Catalog>,
    writer: Arc<Mutex<Option<WalWriter>>>,
    txn_active: AtomicBool,
    /// Set once a DDL or freelist change requires the header page to ride
    /// the next commit.
    header_dirty: AtomicBool,
    /// Per-index trigram delta buffers, flushed at checkpoint.
    pub(crate) trigram_deltas: Mutex<HashMap<String, TrigramDeltaMap>>,
    pub(crate) options: OpenOptions,
    overlay_enabled: Arc<AtomicBool>,
    last_checkpoint_at: Mutex<Instant>,
    checkpointing: AtomicBool,
    degraded: AtomicBool,
    /// Last-error latch for the statement/binding boundary.
    last_error: Mutex<Option<(&'static str, String)>>,
}

impl Engine {
    /// Open or create a database at `path` with the default on-disk VFS.
    pub fn open(path: &Path, options: OpenOptions) -> Result<Arc<Self>> {
        Self::open_with_vfs(Arc::new(StdVfs::new()), path, options)
    }

    /// Open or create a database through an explicit VFS (tests use the
    /// in-memory and fault-injecting ones).
    pub fn open_with_vfs(
        vfs: Arc<dyn Vfs>,
        path: &Path,
        options: OpenOptions,
    ) -> Result<Arc<Self>> {
        let db_file = vfs.open(path, true)?;
        let header = Self::read_or_init_header(db_file.as_ref(), &options)?;
        let page_size = header.page_size;

        let pager = Arc::new(Pager::new(
            db_file,
            page_size,
            options.cache_pages,
            options.wal_sync_mode,
        )?);

        let wal_path = wal_path_for(path);
        let wal_file = vfs.open(&wal_path, true)?;
        let wal = Arc::new(Wal::open(wal_file, page_size, options.wal_sync_mode)?);

        let overlay_enabled = Arc::new(AtomicBool::new(true));
        pager.set_overlay(Some(Arc::new(WalOverlay {
            wal: Arc::clone(&wal),
            enabled: Arc::clone(&overlay_enabled),
        })));

        // Re-read the header through the overlay: a committed but not yet
        // checkpointed transaction may have moved the roots.
        let header = {
            let page = pager.io().read(PageId::ONE)?;
            DbHeader::decode(&page)?
        };

        let free = freelist::load_freelist(&pager.io(), header.freelist_root)?;
        pager.install_freelist(free);

        let catalog = Catalog::load(&pager.io(), header.catalog_root)?;

        info!(
            path = %path.display(),
            page_size = page_size.as_u32(),
            wal_end = %wal.end(),
            schema_cookie = header.schema_cookie,
            "database opened"
        );

        Ok(Arc::new(Self {
            path: path.to_owned(),
            _vfs: vfs,
            pager,
            wal,
            header: Mutex::new(header),
            catalog: RwLock::new(catalog),
            writer: Arc::new(Mutex::new(None)),
            txn_active: AtomicBool::new(false),
            header_dirty: AtomicBool::new(false),
            trigram_deltas: Mutex::new(HashMap::new()),
            options,
            overlay_enabled,
            last_checkpoint_at: Mutex::new(Instant::now()),
            checkpointing: AtomicBool::new(false),
            degraded: AtomicBool::new(false),
            last_error: Mutex::new(None),
        }))
    }

    fn read_or_init_header(file: &dyn VfsFile, options: &OpenOptions) -> Result<DbHeader> {
        if file.len()? == 0 {
            let header = DbHeader::new(options.page_size);
            let mut page = vec![0_u8; options.page_size.as_usize()];
            page[..DB_HEADER_SIZE].copy_from_slice(&header.encode());
            write_all_at(file, 0, &page)?;
            file.sync(options.wal_sync_mode)?;
            return Ok(header);
        }
        let mut buf = [0_u8; DB_HEADER_SIZE];
        read_exact_at(file, 0, &mut buf)?;
        DbHeader::decode(&buf)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn options(&self) -> &OpenOptions {
        &self.options
    }

    #[must_use]
    pub fn schema_cookie(&self) -> u32 {
        self.header.lock().schema_cookie
    }

    #[must_use]
    pub fn wal_end(&self) -> Lsn {
        self.wal.end()
    }

    #[must_use]
    pub fn page_size(&self) -> PageSize {
        self.pager.page_size()
    }

    /// Close the database: roll back a leftover transaction, flush trigram
    /// deltas, and release the files.
    pub fn close(&self) -> Result<()> {
        if self.txn_active.load(Ordering::Acquire) {
            warn!("closing with an active transaction; rolling back");
            self.rollback()?;
        }
        self.flush_trigram_deltas()?;
        info!(path = %self.path.display(), "database closed");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Error plumbing
    // -----------------------------------------------------------------------

    /// Record an error at the statement boundary and mark the engine
    /// degraded on corruption.
    pub(crate) fn note_error(&self, err: &DecentError) {
        if err.is_fatal() {
            self.degraded.store(true, Ordering::Release);
            warn!(error = %err, "engine degraded to read-only after corruption");
        }
        *self.last_error.lock() = Some((err.kind_name(), err.to_string()));
    }

    /// Last error latched at the statement boundary.
    #[must_use]
    pub fn last_error(&self) -> Option<(&'static str, String)> {
        self.last_error.lock().clone()
    }

    pub fn clear_last_error(&self) {
        *self.last_error.lock() = None;
    }

    fn check_writable(&self) -> Result<()> {
        if self.degraded.load(Ordering::Acquire) {
            return Err(DecentError::corruption(
                "engine is read-only after corruption",
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Write transactions
    // -----------------------------------------------------------------------

    /// Begin a write transaction. Fails with `Transaction("busy")` when
    /// another writer holds the lock past the busy timeout and
    /// `Transaction("already-active")` when this engine already has one.
    pub fn begin(&self) -> Result<()> {
        self.check_writable()?;
        if self.txn_active.load(Ordering::Acquire) {
            return Err(DecentError::transaction("already-active"));
        }
        let writer = self
            .wal
            .begin_write(Duration::from_millis(self.options.busy_timeout_ms))?;
        *self.writer.lock() = Some(writer);
        self.pager.begin_txn_tracking();
        self.pager.set_flush_sink(Some(Arc::new(WriterSink {
            writer: Arc::clone(&self.writer),
            wal: Arc::clone(&self.wal),
        })));
        self.txn_active.store(true, Ordering::Release);
        debug!("write transaction started");
        Ok(())
    }

    #[must_use]
    pub fn in_transaction(&self) -> bool {
        self.txn_active.load(Ordering::Acquire)
    }

    pub(crate) fn require_txn(&self) -> Result<()> {
        if !self.txn_active.load(Ordering::Acquire) {
            return Err(DecentError::transaction("no active transaction"));
        }
        self.check_writable()
    }

    pub(crate) fn mark_header_dirty(&self) {
        self.header_dirty.store(true, Ordering::Release);
    }

    /// Commit the active transaction: catalog + freelist + header ride the
    /// WAL as PAGE frames, then a COMMIT frame is fsynced.
    pub fn commit(&self) -> Result<Lsn> {
        self.require_txn()?;
        match self.commit_inner() {
            Ok(lsn) => {
                self.maybe_checkpoint();
                Ok(lsn)
            }
            Err(err) => {
                // A failed commit leaves the transaction rolled back.
                self.abort_after_failed_commit();
                Err(err)
            }
        }
    }

    fn commit_inner(&self) -> Result<Lsn> {
        // 1. Flush dirty catalog records (next_rowid bumps, moved roots).
        {
            let mut catalog = self.catalog.write();
            if catalog.has_dirty_tables() {
                let root = self
                    .header
                    .lock()
                    .catalog_root
                    .ok_or_else(|| DecentError::internal("dirty catalog without a root"))?;
                let new_root = catalog.flush_dirty(&self.pager, root)?;
                let mut header = self.header.lock();
                if header.catalog_root != Some(new_root) {
                    header.catalog_root = Some(new_root);
                    self.header_dirty.store(true, Ordering::Release);
                }
            }
        }

        // 2. Persist the freelist chain when the transaction touched it.
        let pending_free = self.pager.pending_free_snapshot();
        let freelist_changed = !pending_free.is_empty() || self.pager.txn_allocated_count() > 0;
        let mut final_freelist = None;
        if freelist_changed {
            let mut combined = self.pager.freelist_snapshot();
            combined.extend(pending_free);
            let (root, head, count) = freelist::store_freelist(&self.pager, &combined)?;
            let mut header = self.header.lock();
            if header.freelist_root != root
                || header.freelist_head != head
                || header.freelist_count != count
            {
                header.freelist_root = root;
                header.freelist_head = head;
                header.freelist_count = count;
                self.header_dirty.store(true, Ordering::Release);
            }
            final_freelist = Some(combined);
        }

        // 3. Header page rides the commit when anything in it moved.
        if self.header_dirty.swap(false, Ordering::AcqRel) {
            let page = self.header_page_image();
            self.pager.write_page(PageId::ONE, &page)?;
        }

        // 4. Stage dirty pages as PAGE frames and publish with COMMIT.
        let dirty = self.pager.snapshot_dirty_pages();
        let mut writer = self
            .writer
            .lock()
            .take()
            .ok_or_else(|| DecentError::internal("commit with no writer handle"))?;

        if dirty.is_empty() && writer.pending_frames() == 0 {
            writer.rollback()?;
            self.pager.finish_txn(final_freelist);
            self.end_write_state();
            return Ok(self.wal.end());
        }

        let page_ids: Vec<PageId> = dirty.iter().map(|(id, _)| *id).collect();
        for (page, data) in &dirty {
            writer.write_page(*page, data)?;
        }
        let commit_lsn = writer.commit()?;

        self.pager.mark_pages_committed(&page_ids, commit_lsn);
        self.pager.finish_txn(final_freelist);
        self.end_write_state();
        debug!(commit_lsn = %commit_lsn, pages = page_ids.len(), "transaction committed");
        Ok(commit_lsn)
    }

    fn end_write_state(&self) {
        self.pager.set_flush_sink(None);
        self.txn_active.store(false, Ordering::Release);
    }

    fn abort_after_failed_commit(&self) {
        if let Some(writer) = self.writer.lock().take() {
            let _ = writer.rollback();
        }
        self.pager.rollback_cache();
        self.trigram_deltas.lock().clear();
        self.header_dirty.store(false, Ordering::Release);
        self.end_write_state();
        let _ = self.reload_committed_state();
    }

    /// Roll back the active transaction: truncate the WAL to its pre-begin
    /// end, discard dirty pages, return allocations to the freelist, drop
    /// trigram deltas, and reload the catalog at the committed snapshot.
    pub fn rollback(&self) -> Result<()> {
        if !self.txn_active.load(Ordering::Acquire) {
            return Err(DecentError::transaction("no active transaction"));
        }
        if let Some(writer) = self.writer.lock().take() {
            writer.rollback()?;
        }
        self.pager.rollback_cache();
        self.trigram_deltas.lock().clear();
        self.end_write_state();
        self.header_dirty.store(false, Ordering::Release);
        self.reload_committed_state()?;
        debug!("transaction rolled back");
        Ok(())
    }

    /// Re-read the header and catalog through the overlay at the latest
    /// committed snapshot.
    fn reload_committed_state(&self) -> Result<()> {
        let page = self.pager.io().read(PageId::ONE)?;
        let header = DbHeader::decode(&page)?;
        let catalog = Catalog::load(&self.pager.io(), header.catalog_root)?;
        *self.header.lock() = header;
        *self.catalog.write() = catalog;
        Ok(())
    }

    fn header_page_image(&self) -> Vec<u8> {
        let header = self.header.lock();
        let mut page = vec![0_u8; self.pager.page_size().as_usize()];
        page[..DB_HEADER_SIZE].copy_from_slice(&header.encode());
        page
    }

    // -----------------------------------------------------------------------
    // Read transactions
    // -----------------------------------------------------------------------

    /// Begin a snapshot read transaction.
    #[must_use]
    pub fn begin_read(&self) -> ReadTransaction {
        ReadTransaction {
            inner: self.wal.begin_read(),
            snapshot_catalog: Mutex::new(None),
        }
    }

    /// The catalog as of `txn`'s snapshot, loaded once per transaction.
    pub(crate) fn snapshot_catalog(&self, txn: &ReadTransaction) -> Result<Arc<Catalog>> {
        let mut slot = txn.snapshot_catalog.lock();
        if let Some(catalog) = &*slot {
            return Ok(Arc::clone(catalog));
        }
        let io = self.read_io(Some(txn));
        let page = io.read(PageId::ONE)?;
        let header = DbHeader::decode(&page)?;
        let catalog = Arc::new(Catalog::load(&io, header.catalog_root)?);
        *slot = Some(Arc::clone(&catalog));
        Ok(catalog)
    }

    /// Release a read transaction.
    pub fn end_read(&self, txn: &ReadTransaction) {
        self.wal.end_read(&txn.inner);
    }

    /// Read view for `txn`, or the latest-committed writer view.
    #[must_use]
    pub fn read_io(&self, txn: Option<&ReadTransaction>) -> PageIo<'_> {
        match txn {
            Some(txn) => self.pager.io_at(
                txn.inner.snapshot(),
                Some(Arc::new(ReaderGuard {
                    state: Arc::clone(txn.inner.state()),
                })),
            ),
            None => self.pager.io(),
        }
    }

    // -----------------------------------------------------------------------
    // DDL
    // -----------------------------------------------------------------------

    /// Create a table; auto-creates unique btree indexes for UNIQUE columns
    /// other than an INTEGER PRIMARY KEY (which is the rowid itself).
    pub fn create_table(&self, name: &str, columns: Vec<ColumnDef>) -> Result<()> {
        self.require_txn()?;
        if self.catalog.read().tables.contains_key(name) {
            return Err(DecentError::sql(format!("table {name} already exists")));
        }
        let tree = BTree::create(&self.pager)?;
        let meta = crate::catalog::TableMeta {
            name: name.to_owned(),
            root: tree.root(),
            next_rowid: 1,
            columns,
        };
        self.upsert_catalog_record(&CatalogRecord::Table(meta.clone()))?;
        self.catalog.write().tables.insert(name.to_owned(), meta.clone());
        self.bump_schema_cookie();

        let rowid_col = meta.rowid_column();
        for (i, col) in meta.columns.iter().enumerate() {
            if col.unique && rowid_col != Some(i) {
                self.build_index_for_column(name, &col.name, true)?;
            }
        }
        info!(table = name, "table created");
        Ok(())
    }

    /// Create a view record.
    pub fn create_view(&self, meta: crate::catalog::ViewMeta) -> Result<()> {
        self.require_txn()?;
        if self.catalog.read().views.contains_key(&meta.name) {
            return Err(DecentError::sql(format!("view {} already exists", meta.name)));
        }
        self.upsert_catalog_record(&CatalogRecord::View(meta.clone()))?;
        self.catalog.write().views.insert(meta.name.clone(), meta);
        self.bump_schema_cookie();
        Ok(())
    }

    /// Drop a table, its indexes, and their pages.
    pub fn drop_table(&self, name: &str) -> Result<()> {
        self.require_txn()?;
        let meta = self.catalog.read().table(name)?.clone();
        let indexes = self.catalog.read().indexes_on(name);
        for index in indexes {
            self.drop_index(&index.name)?;
        }
        crate::rows::free_tree(&self.pager, meta.root)?;
        self.delete_catalog_record(name)?;
        self.catalog.write().tables.remove(name);
        self.bump_schema_cookie();
        info!(table = name, "table dropped");
        Ok(())
    }

    /// Drop an index and free its pages.
    pub fn drop_index(&self, name: &str) -> Result<()> {
        self.require_txn()?;
        let meta = self.catalog.read().index(name)?.clone();
        crate::rows::free_tree(&self.pager, meta.root)?;
        self.delete_catalog_record(name)?;
        self.catalog.write().indexes.remove(name);
        self.trigram_deltas.lock().remove(name);
        self.bump_schema_cookie();
        Ok(())
    }

    /// Bump the schema cookie; the header page rides the next commit.
    pub(crate) fn bump_schema_cookie(&self) {
        let mut header = self.header.lock();
        header.schema_cookie = header.schema_cookie.wrapping_add(1);
        drop(header);
        self.mark_header_dirty();
    }

    /// Upsert a record in the system tree, creating it on first DDL.
    pub(crate) fn upsert_catalog_record(&self, record: &CatalogRecord) -> Result<()> {
        let root = {
            let header = self.header.lock();
            header.catalog_root
        };
        let mut tree = match root {
            Some(root) => BTree::open(root),
            None => BTree::create(&self.pager)?,
        };
        upsert_record(&mut tree, &self.pager, record)?;
        let mut header = self.header.lock();
        if header.catalog_root != Some(tree.root()) {
            header.catalog_root = Some(tree.root());
            drop(header);
            self.mark_header_dirty();
        }
        Ok(())
    }

    fn delete_catalog_record(&self, name: &str) -> Result<()> {
        let root = self
            .header
            .lock()
            .catalog_root
            .ok_or_else(|| DecentError::internal("delete from empty catalog"))?;
        let mut tree = BTree::open(root);
        crate::catalog::delete_record(&mut tree, &self.pager, name)?;
        let mut header = self.header.lock();
        if header.catalog_root != Some(tree.root()) {
            header.catalog_root = Some(tree.root());
            drop(header);
            self.mark_header_dirty();
        }
        Ok(())
    }

    /// Persist a moved index root into the catalog.
    pub(crate) fn sync_index_root(&self, name: &str, new_root: PageId) -> Result<()> {
        let meta = {
            let mut catalog = self.catalog.write();
            let meta = catalog
                .indexes
                .get_mut(name)
                .ok_or_else(|| DecentError::internal(format!("unknown index {name}")))?;
            if meta.root == new_root {
                return Ok(());
            }
            meta.root = new_root;
            meta.clone()
        };
        self.upsert_catalog_record(&CatalogRecord::Index(meta))
    }

    /// Persist a moved table root / bumped rowid counter lazily; the record
    /// itself is rewritten at commit.
    pub(crate) fn mark_table_dirty(&self, name: &str) {
        self.catalog.write().mark_table_dirty(name);
    }

    // -----------------------------------------------------------------------
    // Checkpoint
    // -----------------------------------------------------------------------

    /// Run the checkpoint triggers after a commit.
    pub fn maybe_checkpoint(&self) {
        if self.checkpointing.load(Ordering::Acquire) {
            return;
        }
        if self.options.reader_warn_ms > 0 {
            self.wal
                .warn_old_readers(Duration::from_millis(self.options.reader_warn_ms));
        }
        let size = self.wal.size_bytes();
        let mut triggered = size >= self.options.checkpoint_bytes;
        if !triggered && self.options.checkpoint_ms > 0 {
            triggered = self.last_checkpoint_at.lock().elapsed()
                >= Duration::from_millis(self.options.checkpoint_ms);
        }
        if !triggered && self.wal.index_memory_bytes() >= self.options.memory_threshold {
            triggered = true;
        }
        if !triggered && self.options.max_wal_bytes_per_reader > 0 {
            let readers = self.wal.reader_count().max(1) as u64;
            triggered = size / readers >= self.options.max_wal_bytes_per_reader;
        }
        if triggered {
            if let Err(err) = self.checkpoint() {
                warn!(error = %err, "checkpoint failed");
                self.note_error(&err);
            }
        }
    }

    /// Checkpoint: copy committed page images into the main file up to the
    /// oldest live snapshot, then truncate the WAL when nothing pins it.
    pub fn checkpoint(&self) -> Result<()> {
        self.check_writable()?;
        if self.checkpointing.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let result = self.checkpoint_inner();
        self.checkpointing.store(false, Ordering::Release);
        result
    }

    fn checkpoint_inner(&self) -> Result<()> {
        // Trigram deltas flush as their own commit before the writer lock
        // is taken for the copy phase.
        self.flush_trigram_deltas()?;

        let token = self
            .wal
            .begin_write(Duration::from_millis(self.options.busy_timeout_ms))?;

        if self.options.reader_timeout_ms > 0 && self.options.force_truncate_on_timeout {
            let timeout = Duration::from_millis(self.options.reader_timeout_ms);
            for reader in self.wal.readers_older_than(timeout) {
                warn!(age_ms = reader.age().as_millis() as u64, "aborting timed-out reader");
                reader.abort();
            }
        }

        let wal_end = self.wal.end();
        if wal_end.is_zero() {
            drop(token);
            *self.last_checkpoint_at.lock() = Instant::now();
            return Ok(());
        }
        let checkpoint_lsn = self.wal.min_reader_snapshot().unwrap_or(wal_end).min(wal_end);
        if checkpoint_lsn.is_zero() {
            drop(token);
            *self.last_checkpoint_at.lock() = Instant::now();
            return Ok(());
        }

        // Copy the newest frame image at or below the checkpoint LSN for
        // every touched page. Page 1 is written through the header path.
        self.pager.ensure_file_length()?;
        let pages = self.wal.pages_for_checkpoint(checkpoint_lsn);
        let mut copied = 0_usize;
        for (page, payload_offset) in &pages {
            if *page == PageId::ONE {
                continue;
            }
            let data = self.wal.read_payload(*payload_offset)?;
            self.pager.write_page_for_checkpoint(*page, &data)?;
            copied += 1;
        }
        self.pager.fault_point("checkpoint.before_db_sync")?;
        self.pager.sync_file()?;

        // Durable header, rebuilt from the page-1 image at the checkpoint
        // LSN so the file never advertises roots a pinned reader cannot
        // resolve. Frames above the checkpoint LSN keep serving newer
        // header states through the overlay.
        let header_at_ckpt = {
            let io = self.pager.io_at(checkpoint_lsn, None);
            let mut header = DbHeader::decode(&io.read(PageId::ONE)?)?;
            header.last_checkpoint_lsn = checkpoint_lsn;
            header
        };
        self.header.lock().last_checkpoint_lsn = checkpoint_lsn;
        let mut image = vec![0_u8; self.pager.page_size().as_usize()];
        image[..DB_HEADER_SIZE].copy_from_slice(&header_at_ckpt.encode());
        self.pager.fault_point("checkpoint.before_header_write")?;
        self.pager.write_page_for_checkpoint(PageId::ONE, &image)?;
        self.pager.sync_file()?;

        self.wal.append_checkpoint_frame(checkpoint_lsn)?;

        let truncated = checkpoint_lsn == wal_end
            && !self.wal.reader_needs_frames_at_or_below(checkpoint_lsn);
        if truncated {
            self.wal.truncate_to_header()?;
            self.pager.clear_cache();
        }
        drop(token);

        *self.last_checkpoint_at.lock() = Instant::now();
        info!(
            checkpoint_lsn = %checkpoint_lsn,
            pages = copied,
            truncated,
            "checkpoint complete"
        );
        Ok(())
    }

    /// Apply buffered trigram deltas to the on-disk posting lists as one
    /// internal commit. No-op when the buffers are empty, and deferred
    /// while a user transaction is active (the next checkpoint catches up).
    pub fn flush_trigram_deltas(&self) -> Result<()> {
        if self.txn_active.load(Ordering::Acquire) {
            return Ok(());
        }
        let deltas: Vec<(String, TrigramDeltaMap)> = {
            let mut guard = self.trigram_deltas.lock();
            guard.drain().filter(|(_, m)| !m.is_empty()).collect()
        };
        if deltas.is_empty() {
            return Ok(());
        }

        let restore = |deltas: Vec<(String, TrigramDeltaMap)>| {
            let mut guard = self.trigram_deltas.lock();
            for (name, map) in deltas {
                guard.entry(name).or_default().extend(map);
            }
        };

        if let Err(err) = self.begin() {
            restore(deltas);
            return Err(err);
        }
        match self.apply_trigram_deltas(&deltas) {
            Ok(()) => match self.commit_inner() {
                Ok(_) => Ok(()),
                Err(err) => {
                    self.abort_after_failed_commit();
                    restore(deltas);
                    Err(err)
                }
            },
            Err(err) => {
                let _ = self.rollback();
                restore(deltas);
                Err(err)
            }
        }
    }

    fn apply_trigram_deltas(&self, deltas: &[(String, TrigramDeltaMap)]) -> Result<()> {
        use decentdb_trigram::{decode_postings, encode_postings};

        for (index_name, map) in deltas {
            let meta = self.catalog.read().index(index_name)?.clone();
            let mut tree = BTree::open(meta.root);
            let mut tokens: Vec<u32> = map.keys().copied().collect();
            tokens.sort_unstable();
            for token in tokens {
                let delta = &map[&token];
                let key = u64::from(token);
                let existing = {
                    let io = self.pager.io();
                    match tree.find(&io, key)? {
                        Some(bytes) => decode_postings(&bytes)?,
                        None => Vec::new(),
                    }
                };
                let merged = delta.apply(&existing);
                if merged.is_empty() {
                    tree.delete(&self.pager, key)?;
                } else {
                    let encoded = encode_postings(&merged)?;
                    if existing.is_empty() {
                        tree.insert(&self.pager, key, &encoded)?;
                    } else {
                        tree.update(&self.pager, key, &encoded)?;
                    }
                }
            }
            if tree.root() != meta.root {
                self.sync_index_root(index_name, tree.root())?;
            }
            debug!(index = %index_name, trigrams = map.len(), "trigram deltas flushed");
        }
        Ok(())
    }

    /// Disable the WAL overlay; used by the non-durable bulk path.
    pub(crate) fn disable_overlay(&self) {
        self.overlay_enabled.store(false, Ordering::Release);
        warn!("WAL overlay disabled for the remainder of this connection");
    }

    /// Abandon the WAL writer but keep the dirty cache, for the
    /// non-durable bulk path that flushes pages straight to the file.
    /// Spilled frames live only in the WAL, so they are copied to the main
    /// file before the rollback truncates them away.
    pub(crate) fn discard_writer_keep_pages(&self) -> Result<()> {
        for (page, payload_offset) in self.pager.spilled_pages_with_offsets() {
            let data = self.wal.read_payload(payload_offset)?;
            self.pager.write_page_for_checkpoint(page, &data)?;
        }
        if let Some(writer) = self.writer.lock().take() {
            writer.rollback()?;
        }
        self.pager.finish_txn(None);
        self.end_write_state();
        Ok(())
    }
}

/// Companion WAL path: `<db>-wal`.
#[must_use]
pub fn wal_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push("-wal");
    PathBuf::from(name)
}
