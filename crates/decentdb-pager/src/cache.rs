//! Fixed-capacity page cache with pin tracking.
//!
//! Eviction is LRU-ish: the least recently used unpinned clean page goes
//! first; dirty pages are only evicted after the owning writer spills them
//! to the WAL. Eviction itself is a pure memory operation and never
//! performs I/O; spilling happens in the pager before the entry is
//! dropped.

use decentdb_types::{Lsn, PageId};
use lru::LruCache;
use xxhash_rust::xxh3::xxh3_64;

/// One cached page.
#[derive(Debug)]
pub struct CacheEntry {
    pub data: Vec<u8>,
    pub dirty: bool,
    /// Written directly to the main file, bypassing the WAL; reads must not
    /// consult the overlay for this page.
    pub overridden: bool,
    pub pins: u32,
    /// Commit LSN of the cached image when it came from a committed WAL
    /// frame; `None` for images read from the main file.
    pub latest_lsn: Option<Lsn>,
    /// Integrity hash of the clean image, recomputed whenever the entry
    /// transitions to clean.
    pub xxh3: u64,
}

impl CacheEntry {
    fn clean(data: Vec<u8>, latest_lsn: Option<Lsn>) -> Self {
        let xxh3 = xxh3_64(&data);
        Self {
            data,
            dirty: false,
            overridden: false,
            pins: 0,
            latest_lsn,
            xxh3,
        }
    }

    fn dirty(data: Vec<u8>) -> Self {
        Self {
            data,
            dirty: true,
            overridden: false,
            pins: 0,
            latest_lsn: None,
            xxh3: 0,
        }
    }

    #[must_use]
    pub fn is_evictable(&self) -> bool {
        self.pins == 0 && !self.dirty
    }
}

/// What the cache wants done with a page it had to push out.
#[derive(Debug)]
pub enum Evicted {
    /// Clean page; nothing to do.
    Clean(PageId),
    /// Dirty page that must be spilled to the WAL before it is lost.
    Dirty(PageId, Vec<u8>),
}

/// LRU-ish map from page id to cached image.
pub struct PageCache {
    entries: LruCache<PageId, CacheEntry>,
    capacity: usize,
}

impl PageCache {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            // The LruCache itself is unbounded; capacity is enforced by
            // `make_room`, which has to skip pinned and dirty entries.
            entries: LruCache::unbounded(),
            capacity: capacity.max(1),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&mut self, page: PageId) -> Option<&CacheEntry> {
        self.entries.get(&page).map(|e| &*e)
    }

    pub fn get_mut(&mut self, page: PageId) -> Option<&mut CacheEntry> {
        self.entries.get_mut(&page)
    }

    pub fn peek(&self, page: PageId) -> Option<&CacheEntry> {
        self.entries.peek(&page)
    }

    /// Insert a clean image read from the main file or a committed frame.
    /// Returns at most one eviction the pager must resolve first.
    pub fn insert_clean(
        &mut self,
        page: PageId,
        data: Vec<u8>,
        latest_lsn: Option<Lsn>,
    ) -> Option<Evicted> {
        let evicted = self.make_room(page);
        self.entries.put(page, CacheEntry::clean(data, latest_lsn));
        evicted
    }

    /// Insert or overwrite a dirty image.
    pub fn insert_dirty(&mut self, page: PageId, data: Vec<u8>) -> Option<Evicted> {
        if let Some(entry) = self.entries.get_mut(&page) {
            entry.data = data;
            entry.dirty = true;
            entry.overridden = false;
            entry.latest_lsn = None;
            return None;
        }
        let evicted = self.make_room(page);
        self.entries.put(page, CacheEntry::dirty(data));
        evicted
    }

    /// Insert an image that was written straight to the main file.
    pub fn insert_overridden(&mut self, page: PageId, data: Vec<u8>) -> Option<Evicted> {
        let evicted = self.make_room(page);
        let mut entry = CacheEntry::clean(data, None);
        entry.overridden = true;
        self.entries.put(page, entry);
        evicted
    }

    pub fn remove(&mut self, page: PageId) -> Option<CacheEntry> {
        self.entries.pop(&page)
    }

    /// Drop everything, dirty or not.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn pin(&mut self, page: PageId) {
        if let Some(entry) = self.entries.get_mut(&page) {
            entry.pins += 1;
        }
    }

    pub fn unpin(&mut self, page: PageId) {
        if let Some(entry) = self.entries.get_mut(&page) {
            entry.pins = entry.pins.saturating_sub(1);
        }
    }

    /// Clear a set of dirty flags after their commit frame is durable.
    pub fn mark_committed(&mut self, pages: &[PageId], commit_lsn: Lsn) {
        for page in pages {
            if let Some(entry) = self.entries.get_mut(page) {
                if entry.dirty {
                    entry.dirty = false;
                    entry.latest_lsn = Some(commit_lsn);
                    entry.xxh3 = xxh3_64(&entry.data);
                }
            }
        }
    }

    /// Drop every dirty entry and clear overridden marks. Returns the ids
    /// that were discarded.
    pub fn discard_dirty(&mut self) -> Vec<PageId> {
        let dirty: Vec<PageId> = self
            .entries
            .iter()
            .filter(|(_, e)| e.dirty)
            .map(|(id, _)| *id)
            .collect();
        for id in &dirty {
            self.entries.pop(id);
        }
        for (_, entry) in self.entries.iter_mut() {
            entry.overridden = false;
        }
        dirty
    }

    /// Snapshot of all dirty pages, ordered by page id for deterministic
    /// WAL frame order.
    #[must_use]
    pub fn dirty_pages(&self) -> Vec<(PageId, Vec<u8>)> {
        let mut pages: Vec<(PageId, Vec<u8>)> = self
            .entries
            .iter()
            .filter(|(_, e)| e.dirty)
            .map(|(id, e)| (*id, e.data.clone()))
            .collect();
        pages.sort_by_key(|(id, _)| *id);
        pages
    }

    /// Make room for one more entry. At most one eviction per call; if every
    /// candidate is pinned the cache temporarily exceeds capacity.
    fn make_room(&mut self, incoming: PageId) -> Option<Evicted> {
        if self.entries.len() < self.capacity || self.entries.contains(&incoming) {
            return None;
        }
        // Walk from the LRU end looking for a victim.
        let mut victim: Option<(PageId, bool)> = None;
        for (id, entry) in self.entries.iter().rev() {
            if entry.pins > 0 {
                continue;
            }
            if entry.is_evictable() {
                victim = Some((*id, false));
                break;
            }
            if entry.dirty && victim.is_none() {
                // Remember the first dirty candidate but keep looking for a
                // clean one.
                victim = Some((*id, true));
            }
        }
        match victim {
            Some((id, false)) => {
                self.entries.pop(&id);
                Some(Evicted::Clean(id))
            }
            Some((id, true)) => {
                let entry = self.entries.pop(&id).expect("victim present");
                Some(Evicted::Dirty(id, entry.data))
            }
            None => None,
        }
    }
}

impl std::fmt::Debug for PageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageCache")
            .field("len", &self.entries.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}
