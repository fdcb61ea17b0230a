//! The write-ahead log: durable commit, snapshot tracking, recovery.
//!
//! Visibility protocol: a writer appends PAGE frames, then a COMMIT frame,
//! fsyncs, updates the in-memory page index, and only then store-releases
//! the shared end LSN. Readers load-acquire the end LSN at begin and see
//! exactly the frames at or below it for the rest of their lifetime.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use decentdb_error::{DecentError, Result, ResultExt};
use decentdb_types::{Lsn, PageId, PageSize, SyncMode};
use decentdb_vfs::{VfsFile, read_exact_at, write_all_at};

use crate::format::{
    FRAME_HEADER_SIZE, FrameType, WAL_HEADER_SIZE, WalHeader, decode_frame_header,
    encode_frame_header,
};

/// One committed PAGE frame in the in-memory index.
#[derive(Debug, Clone, Copy)]
struct FrameRef {
    /// The frame's LSN (its end offset).
    end_lsn: u64,
    /// Offset of the page payload within the WAL file.
    payload_offset: u64,
}

const FRAME_REF_BYTES: usize = std::mem::size_of::<FrameRef>() + 8;

/// A registered reader.
#[derive(Debug)]
pub struct ReaderState {
    id: u64,
    snapshot: Lsn,
    started: Instant,
    aborted: AtomicBool,
}

impl ReaderState {
    #[must_use]
    pub fn snapshot(&self) -> Lsn {
        self.snapshot
    }

    #[must_use]
    pub fn age(&self) -> Duration {
        self.started.elapsed()
    }

    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
    }
}

/// Handle returned by [`Wal::begin_read`]. The engine wraps this in its
/// read-transaction type; dropping it without `end_read` leaks the
/// registration until the WAL is closed, so the engine always ends reads
/// explicitly.
#[derive(Debug, Clone)]
pub struct ReadTxn {
    state: Arc<ReaderState>,
}

impl ReadTxn {
    #[must_use]
    pub fn snapshot(&self) -> Lsn {
        self.state.snapshot
    }

    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.state.is_aborted()
    }

    #[must_use]
    pub fn state(&self) -> &Arc<ReaderState> {
        &self.state
    }
}

struct AppendState {
    /// Physical offset where the next frame goes.
    pos: u64,
}

/// The WAL. One instance per open database, shared via `Arc`.
pub struct Wal {
    file: Box<dyn VfsFile>,
    page_size: PageSize,
    sync_mode: SyncMode,
    /// Committed end LSN; 0 while the WAL holds no committed frames.
    end: AtomicU64,
    append: Mutex<AppendState>,
    index: Mutex<HashMap<u32, Vec<FrameRef>>>,
    index_entries: AtomicU64,
    writer_active: Mutex<bool>,
    writer_cv: Condvar,
    readers: Mutex<HashMap<u64, Arc<ReaderState>>>,
    next_reader_id: AtomicU64,
}

impl Wal {
    /// Open (or create) the WAL file and run recovery.
    pub fn open(file: Box<dyn VfsFile>, page_size: PageSize, sync_mode: SyncMode) -> Result<Self> {
        let len = file.len()?;
        if len < WAL_HEADER_SIZE as u64 {
            let header = WalHeader::new(page_size);
            write_all_at(file.as_ref(), 0, &header.encode()).context("wal header init")?;
            file.sync(sync_mode)?;
        }

        let mut buf = [0_u8; WAL_HEADER_SIZE];
        read_exact_at(file.as_ref(), 0, &mut buf).context("wal header read")?;
        let header = WalHeader::decode(&buf)?;
        if header.page_size != page_size {
            return Err(DecentError::corruption(format!(
                "WAL page size {} does not match database page size {}",
                header.page_size.as_u32(),
                page_size.as_u32()
            )));
        }

        let wal = Self {
            file,
            page_size,
            sync_mode,
            end: AtomicU64::new(0),
            append: Mutex::new(AppendState {
                pos: WAL_HEADER_SIZE as u64,
            }),
            index: Mutex::new(HashMap::new()),
            index_entries: AtomicU64::new(0),
            writer_active: Mutex::new(false),
            writer_cv: Condvar::new(),
            readers: Mutex::new(HashMap::new()),
            next_reader_id: AtomicU64::new(1),
        };
        wal.recover(header.end_offset)?;
        Ok(wal)
    }

    /// Scan the file and rebuild the page index from committed frames.
    ///
    /// Everything up to the header's logical end must decode cleanly; past
    /// it the scan keeps accepting *complete committed* transactions (a
    /// commit whose fsync landed before a crash beat the header rewrite)
    /// and silently drops any torn tail.
    fn recover(&self, logical_end: u64) -> Result<()> {
        let physical = self.file.len()?;
        if logical_end > physical {
            return Err(DecentError::corruption(format!(
                "WAL logical end {logical_end} beyond physical length {physical}"
            )));
        }

        let mut index = self.index.lock();
        let mut pos = WAL_HEADER_SIZE as u64;
        let mut batch: Vec<(u32, FrameRef)> = Vec::new();
        let mut committed_end = 0_u64;
        let mut durable_end = WAL_HEADER_SIZE as u64;
        let mut entries = 0_u64;
        let mut frames = 0_u64;

        while pos + FRAME_HEADER_SIZE as u64 <= physical {
            let mut head = [0_u8; FRAME_HEADER_SIZE];
            read_exact_at(self.file.as_ref(), pos, &mut head).context("wal recovery")?;
            let (frame_type, page_id) = match decode_frame_header(&head) {
                Ok(decoded) => decoded,
                Err(err) => {
                    if pos < logical_end {
                        return Err(err.with_context("inside committed WAL region"));
                    }
                    break;
                }
            };
            let payload_len = frame_type.payload_len(self.page_size) as u64;
            let frame_end = pos + FRAME_HEADER_SIZE as u64 + payload_len;
            if frame_end > physical {
                if pos < logical_end {
                    return Err(DecentError::corruption(
                        "torn frame inside committed WAL region",
                    ));
                }
                break;
            }

            match frame_type {
                FrameType::Page => {
                    batch.push((
                        page_id,
                        FrameRef {
                            end_lsn: frame_end,
                            payload_offset: pos + FRAME_HEADER_SIZE as u64,
                        },
                    ));
                }
                FrameType::Commit => {
                    for (page, frame) in batch.drain(..) {
                        index.entry(page).or_default().push(frame);
                        entries += 1;
                    }
                    committed_end = frame_end;
                    durable_end = frame_end;
                }
                FrameType::Checkpoint => {
                    // Informational marker; carries the checkpoint LSN.
                    durable_end = frame_end;
                }
            }
            frames += 1;
            pos = frame_end;
        }

        if !batch.is_empty() {
            debug!(dropped = batch.len(), "dropping uncommitted WAL tail frames");
        }
        for list in index.values_mut() {
            list.sort_by_key(|f| f.end_lsn);
        }
        drop(index);

        self.index_entries.store(entries, Ordering::Release);
        self.end.store(committed_end, Ordering::Release);
        self.append.lock().pos = durable_end;
        info!(
            frames,
            committed_end,
            recovered_past_header = committed_end > logical_end,
            "WAL recovery complete"
        );
        Ok(())
    }

    #[must_use]
    pub fn page_size(&self) -> PageSize {
        self.page_size
    }

    /// Committed end LSN; `Lsn::ZERO` when empty.
    #[must_use]
    pub fn end(&self) -> Lsn {
        Lsn::new(self.end.load(Ordering::Acquire))
    }

    /// Bytes the WAL currently occupies (header included).
    #[must_use]
    pub fn size_bytes(&self) -> u64 {
        self.append.lock().pos
    }

    /// Approximate heap footprint of the page index.
    #[must_use]
    pub fn index_memory_bytes(&self) -> u64 {
        self.index_entries.load(Ordering::Acquire) * FRAME_REF_BYTES as u64
    }

    // -----------------------------------------------------------------------
    // Snapshot reads
    // -----------------------------------------------------------------------

    /// Latest committed PAGE image for `page` with end LSN ≤ `snapshot`
    /// (`None` = latest committed).
    pub fn page_at_or_before(
        &self,
        page: PageId,
        snapshot: Option<Lsn>,
    ) -> Result<Option<(Lsn, Vec<u8>)>> {
        let snap = snapshot.map_or_else(|| self.end.load(Ordering::Acquire), Lsn::get);
        if snap == 0 {
            return Ok(None);
        }
        let payload = {
            let index = self.index.lock();
            let Some(frames) = index.get(&page.get()) else {
                return Ok(None);
            };
            // Last frame with end_lsn <= snap.
            let idx = frames.partition_point(|f| f.end_lsn <= snap);
            if idx == 0 {
                return Ok(None);
            }
            frames[idx - 1]
        };
        let mut buf = vec![0_u8; self.page_size.as_usize()];
        read_exact_at(self.file.as_ref(), payload.payload_offset, &mut buf)
            .context("wal page read")?;
        Ok(Some((Lsn::new(payload.end_lsn), buf)))
    }

    /// Raw frame payload read, used to reload writer-spilled pages.
    pub fn read_payload(&self, payload_offset: u64) -> Result<Vec<u8>> {
        let mut buf = vec![0_u8; self.page_size.as_usize()];
        read_exact_at(self.file.as_ref(), payload_offset, &mut buf).context("wal spill read")?;
        Ok(buf)
    }

    // -----------------------------------------------------------------------
    // Readers
    // -----------------------------------------------------------------------

    /// Register a reader at the current committed snapshot. An empty WAL
    /// pins the snapshot at the header boundary, which is below every
    /// frame LSN, so the reader keeps seeing only the main file even after
    /// later commits.
    pub fn begin_read(&self) -> ReadTxn {
        let snapshot = Lsn::new(self.end.load(Ordering::Acquire).max(WAL_HEADER_SIZE as u64));
        let id = self.next_reader_id.fetch_add(1, Ordering::Relaxed);
        let state = Arc::new(ReaderState {
            id,
            snapshot,
            started: Instant::now(),
            aborted: AtomicBool::new(false),
        });
        self.readers.lock().insert(id, Arc::clone(&state));
        ReadTxn { state }
    }

    /// Deregister a reader.
    pub fn end_read(&self, txn: &ReadTxn) {
        self.readers.lock().remove(&txn.state.id);
    }

    /// Minimum snapshot over non-aborted readers; `None` when idle.
    #[must_use]
    pub fn min_reader_snapshot(&self) -> Option<Lsn> {
        self.readers
            .lock()
            .values()
            .filter(|r| !r.is_aborted())
            .map(|r| r.snapshot)
            .min()
    }

    #[must_use]
    pub fn reader_count(&self) -> usize {
        self.readers.lock().len()
    }

    /// Readers older than `timeout`, for warn logging and forced aborts.
    #[must_use]
    pub fn readers_older_than(&self, timeout: Duration) -> Vec<Arc<ReaderState>> {
        self.readers
            .lock()
            .values()
            .filter(|r| !r.is_aborted() && r.age() >= timeout)
            .cloned()
            .collect()
    }

    /// Warn once per call about readers past the warning age.
    pub fn warn_old_readers(&self, warn_after: Duration) {
        for reader in self.readers_older_than(warn_after) {
            warn!(
                reader = reader.id,
                age_ms = reader.age().as_millis() as u64,
                snapshot = %reader.snapshot,
                "long-running reader is pinning the WAL"
            );
        }
    }

    // -----------------------------------------------------------------------
    // Writer
    // -----------------------------------------------------------------------

    /// Acquire the single-writer lock, waiting up to `busy_timeout`.
    pub fn begin_write(self: &Arc<Self>, busy_timeout: Duration) -> Result<WalWriter> {
        let mut active = self.writer_active.lock();
        if *active {
            if busy_timeout.is_zero() {
                return Err(DecentError::busy());
            }
            let deadline = Instant::now() + busy_timeout;
            while *active {
                if self.writer_cv.wait_until(&mut active, deadline).timed_out() {
                    debug!(timeout_ms = busy_timeout.as_millis() as u64, "writer lock busy");
                    return Err(DecentError::busy());
                }
            }
        }
        *active = true;
        drop(active);

        let base = self.append.lock().pos;
        Ok(WalWriter {
            wal: Arc::clone(self),
            base_pos: base,
            pending: Vec::new(),
            finished: false,
        })
    }

    fn release_writer(&self) {
        let mut active = self.writer_active.lock();
        *active = false;
        self.writer_cv.notify_one();
    }

    fn write_header_end(&self, end_offset: u64) -> Result<()> {
        let header = WalHeader {
            page_size: self.page_size,
            end_offset,
        };
        self.file.fault_point("wal.header.update")?;
        write_all_at(self.file.as_ref(), 0, &header.encode()).context("wal header update")?;
        self.file.sync(self.sync_mode)
    }

    // -----------------------------------------------------------------------
    // Checkpoint support (driven by the engine, which holds the writer lock)
    // -----------------------------------------------------------------------

    /// Latest frame per page with end LSN ≤ `up_to`, for checkpoint copying.
    /// Pages whose frames are all newer than `up_to` are skipped.
    #[must_use]
    pub fn pages_for_checkpoint(&self, up_to: Lsn) -> Vec<(PageId, u64)> {
        let index = self.index.lock();
        let mut out = Vec::new();
        for (page, frames) in index.iter() {
            let idx = frames.partition_point(|f| f.end_lsn <= up_to.get());
            if idx > 0 {
                if let Some(id) = PageId::new(*page) {
                    out.push((id, frames[idx - 1].payload_offset));
                }
            }
        }
        out.sort_by_key(|(id, _)| *id);
        out
    }

    /// Append a CHECKPOINT frame carrying `checkpoint_lsn` and fsync.
    pub fn append_checkpoint_frame(&self, checkpoint_lsn: Lsn) -> Result<()> {
        let mut append = self.append.lock();
        self.file.fault_point("wal.checkpoint.frame")?;
        let head = encode_frame_header(FrameType::Checkpoint, 0);
        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + 8);
        frame.extend_from_slice(&head);
        frame.extend_from_slice(&checkpoint_lsn.get().to_le_bytes());
        write_all_at(self.file.as_ref(), append.pos, &frame).context("checkpoint frame")?;
        append.pos += frame.len() as u64;
        drop(append);
        self.file.sync(self.sync_mode)
    }

    /// Whether any non-aborted reader still needs a frame at or below `lsn`.
    #[must_use]
    pub fn reader_needs_frames_at_or_below(&self, lsn: Lsn) -> bool {
        self.min_reader_snapshot().is_some_and(|min| min < lsn)
    }

    /// Reset the WAL to header-only and clear the page index.
    pub fn truncate_to_header(&self) -> Result<()> {
        self.file.fault_point("wal.truncate")?;
        self.file.truncate(WAL_HEADER_SIZE as u64)?;
        self.write_header_end(0)?;
        self.index.lock().clear();
        self.index_entries.store(0, Ordering::Release);
        self.end.store(0, Ordering::Release);
        self.append.lock().pos = WAL_HEADER_SIZE as u64;
        info!("WAL truncated to header");
        Ok(())
    }
}

impl std::fmt::Debug for Wal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wal")
            .field("end", &self.end())
            .field("size_bytes", &self.size_bytes())
            .field("readers", &self.reader_count())
            .finish()
    }
}

/// A staged frame not yet published by a COMMIT.
#[derive(Debug, Clone, Copy)]
struct PendingFrame {
    page: u32,
    frame: FrameRef,
}

impl std::fmt::Debug for WalWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalWriter")
            .field("base_pos", &self.base_pos)
            .field("pending", &self.pending)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

/// Exclusive write handle. Dropping without commit leaves the staged bytes
/// physically present but logically invisible; the next writer overwrites
/// them.
pub struct WalWriter {
    wal: Arc<Wal>,
    base_pos: u64,
    pending: Vec<PendingFrame>,
    finished: bool,
}

impl WalWriter {
    /// Append a PAGE frame; returns the payload offset for the pager's
    /// spilled-page map.
    pub fn write_page(&mut self, page: PageId, data: &[u8]) -> Result<u64> {
        if data.len() != self.wal.page_size.as_usize() {
            return Err(DecentError::internal(format!(
                "WAL page frame payload is {} bytes, page size is {}",
                data.len(),
                self.wal.page_size.as_usize()
            )));
        }
        let mut append = self.wal.append.lock();
        self.wal.file.fault_point("wal.frame.write")?;
        let head = encode_frame_header(FrameType::Page, page.get());
        write_all_at(self.wal.file.as_ref(), append.pos, &head).context("wal frame header")?;
        let payload_offset = append.pos + FRAME_HEADER_SIZE as u64;
        write_all_at(self.wal.file.as_ref(), payload_offset, data).context("wal frame payload")?;
        let frame_end = payload_offset + data.len() as u64;
        append.pos = frame_end;
        drop(append);

        self.pending.push(PendingFrame {
            page: page.get(),
            frame: FrameRef {
                end_lsn: frame_end,
                payload_offset,
            },
        });
        Ok(payload_offset)
    }

    /// Number of staged PAGE frames.
    #[must_use]
    pub fn pending_frames(&self) -> usize {
        self.pending.len()
    }

    /// Append the COMMIT frame, fsync, publish, and release the writer.
    pub fn commit(mut self) -> Result<Lsn> {
        let commit_lsn = {
            let mut append = self.wal.append.lock();
            let head = encode_frame_header(FrameType::Commit, 0);
            write_all_at(self.wal.file.as_ref(), append.pos, &head).context("wal commit frame")?;
            append.pos += FRAME_HEADER_SIZE as u64;
            append.pos
        };

        self.wal.file.fault_point("wal.commit.before_sync")?;
        self.wal.file.sync(self.wal.sync_mode)?;
        let after_sync = self.wal.file.fault_point("wal.commit.after_sync");

        // The commit frame is durable: publish regardless of injected
        // post-sync faults so in-process state matches what recovery will
        // reconstruct. The writer lock stays held until the header rewrite
        // lands, keeping header end offsets monotone across writers; on an
        // early error return the drop handler releases it.
        {
            let mut index = self.wal.index.lock();
            let added = self.pending.len() as u64;
            for staged in self.pending.drain(..) {
                index.entry(staged.page).or_default().push(staged.frame);
            }
            self.wal.index_entries.fetch_add(added, Ordering::AcqRel);
        }
        self.wal.end.store(commit_lsn, Ordering::Release);

        after_sync?;
        self.wal.write_header_end(commit_lsn)?;

        self.finished = true;
        self.wal.release_writer();
        debug!(commit_lsn, "transaction committed");
        Ok(Lsn::new(commit_lsn))
    }

    /// Discard staged frames and truncate back to the pre-begin offset.
    pub fn rollback(mut self) -> Result<()> {
        self.pending.clear();
        let result = {
            let mut append = self.wal.append.lock();
            let res = self.wal.file.truncate(self.base_pos);
            if res.is_ok() {
                append.pos = self.base_pos;
            }
            res
        };
        self.finished = true;
        self.wal.release_writer();
        debug!(base = self.base_pos, "writer rolled back");
        result
    }
}

impl Drop for WalWriter {
    fn drop(&mut self) {
        if !self.finished {
            self.wal.release_writer();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use decentdb_vfs::{MemoryVfs, Vfs};
    use std::path::PathBuf;

    const PS: PageSize = PageSize::S2048;

    fn open_wal(vfs: &MemoryVfs, path: &str) -> Arc<Wal> {
        let file = vfs.open(&PathBuf::from(path), true).unwrap();
        Arc::new(Wal::open(file, PS, SyncMode::Full).unwrap())
    }

    fn page(n: u32) -> PageId {
        PageId::new(n).unwrap()
    }

    fn payload(byte: u8) -> Vec<u8> {
        vec![byte; PS.as_usize()]
    }

    #[test]
    fn test_fresh_wal_is_empty() {
        let vfs = MemoryVfs::new();
        let wal = open_wal(&vfs, "/w1");
        assert_eq!(wal.end(), Lsn::ZERO);
        assert_eq!(wal.size_bytes(), WAL_HEADER_SIZE as u64);
        assert!(wal.page_at_or_before(page(1), None).unwrap().is_none());
    }

    #[test]
    fn test_commit_publishes_pages() {
        let vfs = MemoryVfs::new();
        let wal = open_wal(&vfs, "/w2");
        let mut writer = wal.begin_write(Duration::ZERO).unwrap();
        writer.write_page(page(3), &payload(0xAA)).unwrap();
        // Not visible before commit.
        assert!(wal.page_at_or_before(page(3), None).unwrap().is_none());
        let lsn = writer.commit().unwrap();
        assert!(lsn > Lsn::ZERO);
        let (got_lsn, data) = wal.page_at_or_before(page(3), None).unwrap().unwrap();
        assert!(got_lsn <= lsn);
        assert_eq!(data[0], 0xAA);
    }

    #[test]
    fn test_commit_lsns_strictly_increase() {
        let vfs = MemoryVfs::new();
        let wal = open_wal(&vfs, "/w3");
        let mut last = Lsn::ZERO;
        for i in 0..5_u8 {
            let mut writer = wal.begin_write(Duration::ZERO).unwrap();
            writer.write_page(page(1), &payload(i)).unwrap();
            let lsn = writer.commit().unwrap();
            assert!(lsn > last);
            last = lsn;
        }
    }

    #[test]
    fn test_snapshot_pins_version() {
        let vfs = MemoryVfs::new();
        let wal = open_wal(&vfs, "/w4");

        let mut w = wal.begin_write(Duration::ZERO).unwrap();
        w.write_page(page(1), &payload(0x01)).unwrap();
        let first = w.commit().unwrap();

        let reader = wal.begin_read();
        assert_eq!(reader.snapshot(), first);

        let mut w = wal.begin_write(Duration::ZERO).unwrap();
        w.write_page(page(1), &payload(0x02)).unwrap();
        w.commit().unwrap();

        // The old reader still resolves the old image.
        let (_, data) = wal
            .page_at_or_before(page(1), Some(reader.snapshot()))
            .unwrap()
            .unwrap();
        assert_eq!(data[0], 0x01);
        // A fresh lookup sees the new one.
        let (_, data) = wal.page_at_or_before(page(1), None).unwrap().unwrap();
        assert_eq!(data[0], 0x02);
        wal.end_read(&reader);
    }

    #[test]
    fn test_single_writer_busy() {
        let vfs = MemoryVfs::new();
        let wal = open_wal(&vfs, "/w5");
        let _w1 = wal.begin_write(Duration::ZERO).unwrap();
        let err = wal.begin_write(Duration::ZERO).unwrap_err();
        assert_eq!(err.kind_name(), "transaction");
    }

    #[test]
    fn test_writer_released_on_drop() {
        let vfs = MemoryVfs::new();
        let wal = open_wal(&vfs, "/w6");
        {
            let _w = wal.begin_write(Duration::ZERO).unwrap();
        }
        assert!(wal.begin_write(Duration::ZERO).is_ok());
    }

    #[test]
    fn test_rollback_discards_frames() {
        let vfs = MemoryVfs::new();
        let wal = open_wal(&vfs, "/w7");
        let size_before = wal.size_bytes();
        let mut w = wal.begin_write(Duration::ZERO).unwrap();
        w.write_page(page(2), &payload(0xBB)).unwrap();
        w.rollback().unwrap();
        assert_eq!(wal.size_bytes(), size_before);
        assert!(wal.page_at_or_before(page(2), None).unwrap().is_none());
        assert_eq!(wal.end(), Lsn::ZERO);
    }

    #[test]
    fn test_recovery_drops_uncommitted_tail() {
        let vfs = MemoryVfs::new();
        {
            let wal = open_wal(&vfs, "/w8");
            let mut w = wal.begin_write(Duration::ZERO).unwrap();
            w.write_page(page(1), &payload(0x11)).unwrap();
            w.commit().unwrap();
            let mut w = wal.begin_write(Duration::ZERO).unwrap();
            w.write_page(page(1), &payload(0x22)).unwrap();
            // Simulated crash: writer dropped, no commit, no truncate.
            std::mem::forget(w);
        }
        let wal = open_wal(&vfs, "/w8");
        let (_, data) = wal.page_at_or_before(page(1), None).unwrap().unwrap();
        assert_eq!(data[0], 0x11);
    }

    #[test]
    fn test_recovery_keeps_commit_past_stale_header() {
        let vfs = MemoryVfs::new();
        let committed;
        {
            let wal = open_wal(&vfs, "/w9");
            let mut w = wal.begin_write(Duration::ZERO).unwrap();
            w.write_page(page(4), &payload(0x44)).unwrap();
            committed = w.commit().unwrap();
        }
        // Stale the header back to "empty" as if the crash hit between the
        // commit fsync and the header rewrite.
        {
            let file = vfs.open(&PathBuf::from("/w9"), false).unwrap();
            let stale = WalHeader::new(PS);
            decentdb_vfs::write_all_at(file.as_ref(), 0, &stale.encode()).unwrap();
        }
        let wal = open_wal(&vfs, "/w9");
        assert_eq!(wal.end(), committed);
        let (_, data) = wal.page_at_or_before(page(4), None).unwrap().unwrap();
        assert_eq!(data[0], 0x44);
    }

    #[test]
    fn test_recovery_is_idempotent() {
        let vfs = MemoryVfs::new();
        {
            let wal = open_wal(&vfs, "/w10");
            for i in 0..3_u8 {
                let mut w = wal.begin_write(Duration::ZERO).unwrap();
                w.write_page(page(u32::from(i) + 1), &payload(i)).unwrap();
                w.commit().unwrap();
            }
        }
        let first = open_wal(&vfs, "/w10");
        let second = open_wal(&vfs, "/w10");
        assert_eq!(first.end(), second.end());
        assert_eq!(first.size_bytes(), second.size_bytes());
        for p in 1..=3_u32 {
            let a = first.page_at_or_before(page(p), None).unwrap().unwrap();
            let b = second.page_at_or_before(page(p), None).unwrap().unwrap();
            assert_eq!(a, b);
        }
    }

    #[test]
    fn test_truncate_resets_everything() {
        let vfs = MemoryVfs::new();
        let wal = open_wal(&vfs, "/w11");
        let mut w = wal.begin_write(Duration::ZERO).unwrap();
        w.write_page(page(1), &payload(0x77)).unwrap();
        w.commit().unwrap();

        wal.truncate_to_header().unwrap();
        assert_eq!(wal.end(), Lsn::ZERO);
        assert_eq!(wal.size_bytes(), WAL_HEADER_SIZE as u64);
        assert!(wal.page_at_or_before(page(1), None).unwrap().is_none());
        assert_eq!(wal.index_memory_bytes(), 0);
    }

    #[test]
    fn test_min_reader_snapshot_tracks_registry() {
        let vfs = MemoryVfs::new();
        let wal = open_wal(&vfs, "/w12");
        assert!(wal.min_reader_snapshot().is_none());

        let mut w = wal.begin_write(Duration::ZERO).unwrap();
        w.write_page(page(1), &payload(1)).unwrap();
        let first = w.commit().unwrap();
        let r1 = wal.begin_read();

        let mut w = wal.begin_write(Duration::ZERO).unwrap();
        w.write_page(page(1), &payload(2)).unwrap();
        w.commit().unwrap();
        let r2 = wal.begin_read();

        assert_eq!(wal.min_reader_snapshot(), Some(first));
        wal.end_read(&r1);
        assert_eq!(wal.min_reader_snapshot(), Some(r2.snapshot()));
        wal.end_read(&r2);
        assert!(wal.min_reader_snapshot().is_none());
    }

    #[test]
    fn test_aborted_reader_excluded_from_min() {
        let vfs = MemoryVfs::new();
        let wal = open_wal(&vfs, "/w13");
        let mut w = wal.begin_write(Duration::ZERO).unwrap();
        w.write_page(page(1), &payload(1)).unwrap();
        w.commit().unwrap();

        let reader = wal.begin_read();
        assert!(wal.min_reader_snapshot().is_some());
        reader.state().abort();
        assert!(reader.is_aborted());
        assert!(wal.min_reader_snapshot().is_none());
        wal.end_read(&reader);
    }

    #[test]
    fn test_pages_for_checkpoint_latest_frame_wins() {
        let vfs = MemoryVfs::new();
        let wal = open_wal(&vfs, "/w14");
        for i in 0..3_u8 {
            let mut w = wal.begin_write(Duration::ZERO).unwrap();
            w.write_page(page(1), &payload(i)).unwrap();
            w.write_page(page(2), &payload(0xF0 + i)).unwrap();
            w.commit().unwrap();
        }
        let pages = wal.pages_for_checkpoint(wal.end());
        assert_eq!(pages.len(), 2);
        let data = wal.read_payload(pages[0].1).unwrap();
        assert_eq!(data[0], 2, "latest image of page 1");
    }

    #[test]
    fn test_pages_for_checkpoint_respects_bound() {
        let vfs = MemoryVfs::new();
        let wal = open_wal(&vfs, "/w15");
        let mut w = wal.begin_write(Duration::ZERO).unwrap();
        w.write_page(page(1), &payload(0x01)).unwrap();
        let first = w.commit().unwrap();
        let mut w = wal.begin_write(Duration::ZERO).unwrap();
        w.write_page(page(2), &payload(0x02)).unwrap();
        w.commit().unwrap();

        let pages = wal.pages_for_checkpoint(first);
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].0, page(1));
    }

    #[test]
    fn test_spilled_payload_readable_before_commit() {
        let vfs = MemoryVfs::new();
        let wal = open_wal(&vfs, "/w16");
        let mut w = wal.begin_write(Duration::ZERO).unwrap();
        let offset = w.write_page(page(9), &payload(0x5A)).unwrap();
        let data = wal.read_payload(offset).unwrap();
        assert_eq!(data[0], 0x5A);
        w.rollback().unwrap();
    }

    #[test]
    fn test_busy_timeout_waits_for_release() {
        let vfs = MemoryVfs::new();
        let wal = open_wal(&vfs, "/w17");
        let writer = wal.begin_write(Duration::ZERO).unwrap();

        let wal2 = Arc::clone(&wal);
        let handle = std::thread::spawn(move || {
            wal2.begin_write(Duration::from_secs(5)).map(|w| drop(w))
        });
        std::thread::sleep(Duration::from_millis(50));
        drop(writer);
        handle.join().unwrap().unwrap();
    }
}
