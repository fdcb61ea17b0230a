//! The pager: paged read/write over the main file with cache, freelist,
//! and snapshot overlay composition.
//!
//! Read composition, first hit wins:
//!
//! 1. page spilled to the WAL by the current writer (reloaded through the
//!    [`DirtyPageSink`]),
//! 2. dirty page in cache,
//! 3. page marked overridden (written straight to the file, overlay must
//!    be skipped),
//! 4. WAL overlay at the requested snapshot,
//! 5. the main file.
//!
//! Fixed-snapshot readers go through [`Pager::io_at`], which skips the
//! writer-private steps and never populates the cache; the writer and
//! latest-committed readers use [`Pager::io`].

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::{debug, trace};

use decentdb_error::{DecentError, Result, ResultExt};
use decentdb_types::{Lsn, PageId, PageSize, SyncMode};
use decentdb_vfs::{VfsFile, read_exact_at, write_all_at};

use crate::cache::{Evicted, PageCache};

/// Resolves a page image from the WAL at a snapshot. `Lsn::ZERO` means
/// "latest committed". Implemented by the WAL; installed by the engine.
pub trait PageResolver: Send + Sync {
    /// Latest committed frame image with end-LSN ≤ `snapshot`, along with
    /// that LSN. `None` when the page has no visible frame.
    fn resolve(&self, page: PageId, snapshot: Lsn) -> Result<Option<(Lsn, Vec<u8>)>>;
}

/// Per-read-transaction failure hook: returns `Transaction("aborted")` once
/// a checkpoint has force-aborted the reader.
pub trait ReadGuard: Send + Sync {
    fn check(&self) -> Result<()>;
}

/// Writer-scoped spill target for dirty evictions under cache pressure.
/// Installed at `begin`, removed at commit/rollback.
pub trait DirtyPageSink: Send + Sync {
    /// Append the page to the WAL as an uncommitted PAGE frame; returns the
    /// payload offset the pager must remember for reloads.
    fn spill(&self, page: PageId, data: &[u8]) -> Result<u64>;

    /// Read back a page image previously spilled at `payload_offset`.
    fn reload(&self, page: PageId, payload_offset: u64) -> Result<Vec<u8>>;
}

struct PagerInner {
    cache: PageCache,
    /// Pages spilled to the WAL by the active writer: page → payload offset.
    spilled: HashMap<PageId, u64>,
    /// In-memory freelist, popped on allocation.
    freelist: Vec<PageId>,
    /// Pages freed by the active transaction; merged into the freelist at
    /// commit, forgotten on rollback.
    pending_free: Vec<PageId>,
    /// Pages allocated by the active transaction, for rollback.
    txn_allocations: Vec<PageId>,
    /// Tracking is only active between `begin_txn_tracking` and commit or
    /// rollback.
    tracking: bool,
    flush_sink: Option<Arc<dyn DirtyPageSink>>,
}

/// The pager. Thread-safe; all mutable state sits behind one mutex, with a
/// separate rollback lock held across the rollback window so readers never
/// observe a half-rolled-back cache.
pub struct Pager {
    file: Box<dyn VfsFile>,
    page_size: PageSize,
    sync_mode: SyncMode,
    inner: Mutex<PagerInner>,
    overlay: Mutex<Option<Arc<dyn PageResolver>>>,
    /// Highest allocated page id (file pages + pending extensions).
    next_page: AtomicU32,
    rollback_lock: Mutex<()>,
}

impl Pager {
    pub fn new(
        file: Box<dyn VfsFile>,
        page_size: PageSize,
        cache_pages: usize,
        sync_mode: SyncMode,
    ) -> Result<Self> {
        let file_len = file.len()?;
        let page_count = (file_len / page_size.as_usize() as u64) as u32;
        Ok(Self {
            file,
            page_size,
            sync_mode,
            inner: Mutex::new(PagerInner {
                cache: PageCache::new(cache_pages),
                spilled: HashMap::new(),
                freelist: Vec::new(),
                pending_free: Vec::new(),
                txn_allocations: Vec::new(),
                tracking: false,
                flush_sink: None,
            }),
            overlay: Mutex::new(None),
            next_page: AtomicU32::new(page_count.max(1)),
            rollback_lock: Mutex::new(()),
        })
    }

    #[must_use]
    pub fn page_size(&self) -> PageSize {
        self.page_size
    }

    /// Current page count, including pages allocated but not yet written.
    #[must_use]
    pub fn page_count(&self) -> u32 {
        self.next_page.load(Ordering::Acquire)
    }

    /// Install (or clear) the WAL overlay resolver.
    pub fn set_overlay(&self, resolver: Option<Arc<dyn PageResolver>>) {
        *self.overlay.lock() = resolver;
    }

    /// Install the writer-scoped spill sink. Lives from `begin` to
    /// commit/rollback.
    pub fn set_flush_sink(&self, sink: Option<Arc<dyn DirtyPageSink>>) {
        self.inner.lock().flush_sink = sink;
    }

    /// Latest-committed view that also sees the active writer's own pages.
    #[must_use]
    pub fn io(&self) -> PageIo<'_> {
        PageIo {
            pager: self,
            snapshot: Lsn::ZERO,
            guard: None,
            writer_view: true,
        }
    }

    /// Fixed-snapshot read view for a registered reader.
    #[must_use]
    pub fn io_at(&self, snapshot: Lsn, guard: Option<Arc<dyn ReadGuard>>) -> PageIo<'_> {
        PageIo {
            pager: self,
            snapshot,
            guard,
            writer_view: false,
        }
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    fn read_page_inner(&self, page: PageId, snapshot: Lsn, writer_view: bool) -> Result<Vec<u8>> {
        if writer_view {
            let mut inner = self.inner.lock();

            if let Some(offset) = inner.spilled.get(&page).copied() {
                let sink = inner
                    .flush_sink
                    .clone()
                    .ok_or_else(|| DecentError::internal("spilled page without flush sink"))?;
                drop(inner);
                return sink.reload(page, offset);
            }

            if let Some(entry) = inner.cache.get(page) {
                if entry.dirty || entry.overridden {
                    return Ok(entry.data.clone());
                }
            }
            drop(inner);
        }

        // WAL overlay at the requested snapshot.
        let resolver = self.overlay.lock().clone();
        if let Some(resolver) = resolver {
            if let Some((lsn, data)) = resolver.resolve(page, snapshot)? {
                trace!(page = %page, lsn = %lsn, "overlay hit");
                if writer_view {
                    let mut inner = self.inner.lock();
                    // Do not clobber a dirty image that appeared while the
                    // overlay lookup ran.
                    let keep = inner.cache.peek(page).is_none_or(|e| !e.dirty);
                    if keep {
                        let evicted = inner.cache.insert_clean(page, data.clone(), Some(lsn));
                        self.resolve_eviction(&mut inner, evicted)?;
                    }
                }
                return Ok(data);
            }
        }

        if writer_view {
            let mut inner = self.inner.lock();
            if let Some(entry) = inner.cache.get(page) {
                // Clean file-backed image, or a committed image whose WAL
                // frames were checkpointed and truncated; either way the
                // cache matches the file.
                return Ok(entry.data.clone());
            }
            drop(inner);
        }

        let data = self.read_from_file(page)?;
        if writer_view {
            let mut inner = self.inner.lock();
            if inner.cache.peek(page).is_none() {
                let evicted = inner.cache.insert_clean(page, data.clone(), None);
                self.resolve_eviction(&mut inner, evicted)?;
            }
        }
        Ok(data)
    }

    fn read_from_file(&self, page: PageId) -> Result<Vec<u8>> {
        let mut buf = vec![0_u8; self.page_size.as_usize()];
        let offset = page.file_offset(self.page_size);
        let file_len = self.file.len()?;
        if offset >= file_len {
            // Allocated but never written: logically zero.
            return Ok(buf);
        }
        read_exact_at(self.file.as_ref(), offset, &mut buf)
            .context("pager read")
            .map(|()| buf)
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Stage new page content in the cache. Nothing touches the file until
    /// commit (WAL) or an explicit direct write.
    pub fn write_page(&self, page: PageId, data: &[u8]) -> Result<()> {
        if data.len() != self.page_size.as_usize() {
            return Err(DecentError::internal(format!(
                "write_page payload is {} bytes, page size is {}",
                data.len(),
                self.page_size.as_usize()
            )));
        }
        let mut inner = self.inner.lock();
        inner.spilled.remove(&page);
        let evicted = inner.cache.insert_dirty(page, data.to_vec());
        self.resolve_eviction(&mut inner, evicted)
    }

    /// Write a page straight to the main file, bypassing the WAL, and mark
    /// it overridden. Used by initialization and vacuum-style paths only.
    pub fn write_page_direct(&self, page: PageId, data: &[u8]) -> Result<()> {
        write_all_at(self.file.as_ref(), page.file_offset(self.page_size), data)
            .context("pager direct write")?;
        let mut inner = self.inner.lock();
        let evicted = inner.cache.insert_overridden(page, data.to_vec());
        self.resolve_eviction(&mut inner, evicted)
    }

    /// Positional write used by checkpoint; does not disturb the cache.
    pub fn write_page_for_checkpoint(&self, page: PageId, data: &[u8]) -> Result<()> {
        write_all_at(self.file.as_ref(), page.file_offset(self.page_size), data)
            .context("checkpoint write")
    }

    pub fn sync_file(&self) -> Result<()> {
        self.file.sync(self.sync_mode)
    }

    pub fn fault_point(&self, label: &str) -> Result<()> {
        self.file.fault_point(label)
    }

    fn resolve_eviction(&self, inner: &mut PagerInner, evicted: Option<Evicted>) -> Result<()> {
        match evicted {
            None | Some(Evicted::Clean(_)) => Ok(()),
            Some(Evicted::Dirty(page, data)) => {
                let sink = inner.flush_sink.clone().ok_or_else(|| {
                    DecentError::internal("dirty page evicted with no active writer")
                })?;
                let offset = sink.spill(page, &data)?;
                debug!(page = %page, offset, "spilled dirty page under cache pressure");
                inner.spilled.insert(page, offset);
                Ok(())
            }
        }
    }

    // -----------------------------------------------------------------------
    // Allocation and freelist
    // -----------------------------------------------------------------------

    /// Begin tracking allocations for the active transaction.
    pub fn begin_txn_tracking(&self) {
        let mut inner = self.inner.lock();
        inner.tracking = true;
        inner.txn_allocations.clear();
        inner.pending_free.clear();
    }

    /// Pop from the freelist, or extend the file by one page.
    pub fn allocate_page(&self) -> Result<PageId> {
        let mut inner = self.inner.lock();
        let page = if let Some(page) = inner.freelist.pop() {
            page
        } else {
            let raw = self.next_page.fetch_add(1, Ordering::AcqRel) + 1;
            PageId::new(raw)
                .ok_or_else(|| DecentError::internal("page number space exhausted"))?
        };
        if inner.tracking {
            inner.txn_allocations.push(page);
        }
        trace!(page = %page, "allocated page");
        Ok(page)
    }

    /// Queue a page for the freelist; applied at commit.
    pub fn free_page(&self, page: PageId) -> Result<()> {
        if page == PageId::ONE {
            return Err(DecentError::internal("cannot free the header page"));
        }
        let mut inner = self.inner.lock();
        inner.pending_free.push(page);
        inner.spilled.remove(&page);
        inner.cache.remove(page);
        Ok(())
    }

    /// Apply pending frees and stop allocation tracking. Returns the new
    /// in-memory freelist length so the caller can persist the chain.
    pub fn commit_txn_tracking(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.tracking = false;
        inner.txn_allocations.clear();
        let pending: Vec<PageId> = inner.pending_free.drain(..).collect();
        inner.freelist.extend(pending);
        inner.freelist.len()
    }

    /// Pages freed by the active transaction but not yet applied.
    #[must_use]
    pub fn pending_free_snapshot(&self) -> Vec<PageId> {
        self.inner.lock().pending_free.clone()
    }

    /// Pages allocated since tracking began.
    #[must_use]
    pub fn txn_allocated_count(&self) -> usize {
        self.inner.lock().txn_allocations.len()
    }

    /// Finish the transaction's page bookkeeping after a successful commit.
    /// `freelist` replaces the in-memory list when the caller rebuilt it
    /// (pending frees included); `None` leaves the list untouched.
    pub fn finish_txn(&self, freelist: Option<Vec<PageId>>) {
        let mut inner = self.inner.lock();
        if let Some(list) = freelist {
            inner.freelist = list;
        }
        inner.pending_free.clear();
        inner.txn_allocations.clear();
        inner.spilled.clear();
        inner.tracking = false;
    }

    /// Roll back the transaction's page state: discard dirty cache entries,
    /// return tracked allocations to the freelist, and forget pending
    /// frees. Held under the rollback lock so concurrent readers see either
    /// the full pre-transaction state or nothing in between.
    pub fn rollback_cache(&self) {
        let _rollback = self.rollback_lock.lock();
        let mut inner = self.inner.lock();
        let dropped = inner.cache.discard_dirty();
        inner.spilled.clear();
        inner.pending_free.clear();
        inner.tracking = false;
        let allocations: Vec<PageId> = inner.txn_allocations.drain(..).collect();
        inner.freelist.extend(allocations);
        debug!(dropped = dropped.len(), "rolled back page cache");
    }

    /// Guard shared with the WAL rollback path; see `rollback_cache`.
    pub fn rollback_lock(&self) -> &Mutex<()> {
        &self.rollback_lock
    }

    /// Replace the in-memory freelist (loaded from the on-disk chain).
    pub fn install_freelist(&self, pages: Vec<PageId>) {
        self.inner.lock().freelist = pages;
    }

    #[must_use]
    pub fn freelist_snapshot(&self) -> Vec<PageId> {
        self.inner.lock().freelist.clone()
    }

    #[must_use]
    pub fn freelist_len(&self) -> usize {
        self.inner.lock().freelist.len()
    }

    // -----------------------------------------------------------------------
    // Commit support
    // -----------------------------------------------------------------------

    /// Consistent snapshot of the dirty pages, in page-id order.
    #[must_use]
    pub fn snapshot_dirty_pages(&self) -> Vec<(PageId, Vec<u8>)> {
        self.inner.lock().cache.dirty_pages()
    }

    /// Pages the active writer spilled to the WAL before commit.
    #[must_use]
    pub fn spilled_pages(&self) -> Vec<PageId> {
        let mut pages: Vec<PageId> = self.inner.lock().spilled.keys().copied().collect();
        pages.sort();
        pages
    }

    /// Spilled pages with their WAL payload offsets.
    #[must_use]
    pub fn spilled_pages_with_offsets(&self) -> Vec<(PageId, u64)> {
        let mut pages: Vec<(PageId, u64)> = self
            .inner
            .lock()
            .spilled
            .iter()
            .map(|(id, off)| (*id, *off))
            .collect();
        pages.sort_by_key(|(id, _)| *id);
        pages
    }

    /// Clear dirty flags once the commit frame is durable.
    pub fn mark_pages_committed(&self, pages: &[PageId], commit_lsn: Lsn) {
        let mut inner = self.inner.lock();
        inner.cache.mark_committed(pages, commit_lsn);
        inner.spilled.clear();
    }

    /// Write all dirty pages directly to the main file and sync. Used by
    /// non-WAL bulk paths.
    pub fn flush_all(&self) -> Result<()> {
        let dirty = self.snapshot_dirty_pages();
        for (page, data) in &dirty {
            write_all_at(self.file.as_ref(), page.file_offset(self.page_size), data)
                .context("flush_all")?;
        }
        self.sync_file()?;
        let mut inner = self.inner.lock();
        let ids: Vec<PageId> = dirty.iter().map(|(id, _)| *id).collect();
        inner.cache.mark_committed(&ids, Lsn::ZERO);
        for id in ids {
            if let Some(entry) = inner.cache.get_mut(id) {
                entry.latest_lsn = None;
                entry.overridden = true;
            }
        }
        Ok(())
    }

    /// Drop every cached page. Used after recovery so reads re-resolve
    /// through the fresh overlay.
    pub fn clear_cache(&self) {
        let mut inner = self.inner.lock();
        inner.cache.clear();
        inner.spilled.clear();
    }

    /// Truncate the main file to exactly `pages` pages.
    pub fn truncate_to_pages(&self, pages: u32) -> Result<()> {
        let new_len = u64::from(pages) * self.page_size.as_usize() as u64;
        self.file.truncate(new_len)?;
        self.next_page.store(pages.max(1), Ordering::Release);
        Ok(())
    }

    /// Grow the file so every allocated page has backing bytes. Called
    /// during checkpoint so positional page writes never leave holes.
    pub fn ensure_file_length(&self) -> Result<()> {
        let want = u64::from(self.page_count()) * self.page_size.as_usize() as u64;
        if self.file.len()? < want {
            // Writing the last byte extends the file; zero fill is implicit.
            write_all_at(self.file.as_ref(), want - 1, &[0_u8])?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Pager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pager")
            .field("page_size", &self.page_size)
            .field("page_count", &self.page_count())
            .finish()
    }
}

/// A read view over the pager at one snapshot.
#[derive(Clone)]
pub struct PageIo<'p> {
    pager: &'p Pager,
    snapshot: Lsn,
    guard: Option<Arc<dyn ReadGuard>>,
    writer_view: bool,
}

impl PageIo<'_> {
    pub fn read(&self, page: PageId) -> Result<Vec<u8>> {
        if let Some(guard) = &self.guard {
            guard.check()?;
        }
        self.pager
            .read_page_inner(page, self.snapshot, self.writer_view)
    }

    #[must_use]
    pub fn page_size(&self) -> PageSize {
        self.pager.page_size()
    }

    #[must_use]
    pub fn snapshot(&self) -> Lsn {
        self.snapshot
    }

    #[must_use]
    pub fn pager(&self) -> &Pager {
        self.pager
    }
}
