//! B+Tree operations: find, insert with median splits, in-place update,
//! delete without rebalancing, forward cursors, and bottom-up bulk build.

use decentdb_error::{DecentError, Result};
use decentdb_pager::{PageIo, Pager, overflow};
use decentdb_types::{PageId, PageSize};
use tracing::trace;

use crate::node::{LeafEntry, LeafPayload, Node};

/// Values longer than this are moved to an overflow chain so a leaf always
/// holds at least two entries.
#[must_use]
pub fn spill_threshold(page_size: PageSize) -> usize {
    (page_size.as_usize() - crate::node::NODE_HEADER_SIZE) / 2 - 32
}

/// An entry yielded by a cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorEntry {
    pub key: u64,
    pub value: Vec<u8>,
    /// Head of the overflow chain backing `value`, when spilled.
    pub overflow: Option<PageId>,
}

/// A B+Tree rooted at a page. The root page id changes when the root
/// splits; callers that persist the root elsewhere must re-read it after
/// mutations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BTree {
    root: PageId,
}

impl BTree {
    /// Allocate and write an empty leaf root.
    pub fn create(pager: &Pager) -> Result<Self> {
        let root = pager.allocate_page()?;
        let page = Node::empty_leaf().encode(pager.page_size())?;
        pager.write_page(root, &page)?;
        Ok(Self { root })
    }

    /// Open an existing tree.
    #[must_use]
    pub fn open(root: PageId) -> Self {
        Self { root }
    }

    #[must_use]
    pub fn root(&self) -> PageId {
        self.root
    }

    /// Re-initialize the root as an empty leaf, discarding the tree's
    /// contents. Interior and overflow pages must have been freed by the
    /// caller (or reclaimed by vacuum).
    pub fn reset(&self, pager: &Pager) -> Result<()> {
        let page = Node::empty_leaf().encode(pager.page_size())?;
        pager.write_page(self.root, &page)
    }

    // -----------------------------------------------------------------------
    // Lookup
    // -----------------------------------------------------------------------

    /// First value stored under exactly `key`.
    pub fn find(&self, io: &PageIo<'_>, key: u64) -> Result<Option<Vec<u8>>> {
        let mut cursor = self.cursor_at(io, key)?;
        match cursor.next()? {
            Some(entry) if entry.key == key => Ok(Some(entry.value)),
            _ => Ok(None),
        }
    }

    /// Whether any entry with `key` exists.
    pub fn contains_key(&self, io: &PageIo<'_>, key: u64) -> Result<bool> {
        Ok(self.find(io, key)?.is_some())
    }

    /// Descend to the leaf where a lower-bound scan for `key` starts.
    fn descend_lower_bound(&self, io: &PageIo<'_>, key: u64) -> Result<PageId> {
        let mut page_id = self.root;
        let mut depth = 0_u32;
        loop {
            depth += 1;
            if depth > 64 {
                return Err(DecentError::corruption("btree deeper than 64 levels"));
            }
            match Node::decode(&io.read(page_id)?)? {
                Node::Leaf { .. } => return Ok(page_id),
                Node::Internal {
                    first_child,
                    entries,
                } => {
                    let idx = entries.partition_point(|(sep, _)| *sep < key);
                    page_id = if idx == 0 {
                        first_child
                    } else {
                        entries[idx - 1].1
                    };
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Insert
    // -----------------------------------------------------------------------

    /// Insert `key` → `value`, spilling large values to overflow chains.
    /// Duplicate keys are allowed and kept in insertion order.
    pub fn insert(&mut self, pager: &Pager, key: u64, value: &[u8]) -> Result<()> {
        let payload = make_payload(pager, value)?;
        self.insert_payload(pager, key, payload)
    }

    fn insert_payload(&mut self, pager: &Pager, key: u64, payload: LeafPayload) -> Result<()> {
        if let Some((sep, right)) = insert_recursive(pager, self.root, key, payload)? {
            let new_root = pager.allocate_page()?;
            let node = Node::Internal {
                first_child: self.root,
                entries: vec![(sep, right)],
            };
            pager.write_page(new_root, &node.encode(pager.page_size())?)?;
            trace!(old_root = %self.root, new_root = %new_root, "btree root split");
            self.root = new_root;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Update
    // -----------------------------------------------------------------------

    /// Replace the value of the first entry with `key`. Returns `false`
    /// when the key is absent.
    pub fn update(&mut self, pager: &Pager, key: u64, value: &[u8]) -> Result<bool> {
        let io = pager.io();
        let mut page_id = self.descend_lower_bound(&io, key)?;
        loop {
            let Node::Leaf { next, mut entries } = Node::decode(&io.read(page_id)?)? else {
                return Err(DecentError::corruption("descend ended on internal node"));
            };
            let pos = entries.partition_point(|e| e.key < key);
            if pos < entries.len() && entries[pos].key == key {
                if let Some(head) = entries[pos].payload.overflow_head() {
                    overflow::free_chain(pager, head)?;
                }
                entries[pos].payload = make_payload(pager, value)?;
                let node = Node::Leaf { next, entries };
                if node.fits(pager.page_size()) {
                    pager.write_page(page_id, &node.encode(pager.page_size())?)?;
                } else {
                    // Too big in place: take it out and reinsert through the
                    // splitting path.
                    let Node::Leaf { next, mut entries } = node else {
                        unreachable!()
                    };
                    let entry = entries.remove(pos);
                    let node = Node::Leaf { next, entries };
                    pager.write_page(page_id, &node.encode(pager.page_size())?)?;
                    self.insert_payload(pager, entry.key, entry.payload)?;
                }
                return Ok(true);
            }
            if pos == entries.len() {
                if let Some(n) = next {
                    page_id = n;
                    continue;
                }
            }
            return Ok(false);
        }
    }

    // -----------------------------------------------------------------------
    // Delete
    // -----------------------------------------------------------------------

    /// Delete the first entry with `key`. No rebalancing; space is
    /// reclaimed by vacuum.
    pub fn delete(&mut self, pager: &Pager, key: u64) -> Result<bool> {
        self.delete_matching(pager, key, None)
    }

    /// Delete the entry with `key` whose value equals `value` exactly.
    pub fn delete_key_value(&mut self, pager: &Pager, key: u64, value: &[u8]) -> Result<bool> {
        self.delete_matching(pager, key, Some(value))
    }

    fn delete_matching(&mut self, pager: &Pager, key: u64, value: Option<&[u8]>) -> Result<bool> {
        let io = pager.io();
        let mut page_id = self.descend_lower_bound(&io, key)?;
        loop {
            let Node::Leaf { next, mut entries } = Node::decode(&io.read(page_id)?)? else {
                return Err(DecentError::corruption("descend ended on internal node"));
            };
            let mut pos = entries.partition_point(|e| e.key < key);
            while pos < entries.len() && entries[pos].key == key {
                let matches = match value {
                    None => true,
                    Some(expected) => resolve_payload(&io, &entries[pos].payload)? == expected,
                };
                if matches {
                    let removed = entries.remove(pos);
                    if let Some(head) = removed.payload.overflow_head() {
                        overflow::free_chain(pager, head)?;
                    }
                    let node = Node::Leaf { next, entries };
                    pager.write_page(page_id, &node.encode(pager.page_size())?)?;
                    return Ok(true);
                }
                pos += 1;
            }
            // Equal keys may continue on the next leaf.
            if pos == entries.len() {
                if let Some(n) = next {
                    page_id = n;
                    continue;
                }
            }
            return Ok(false);
        }
    }

    // -----------------------------------------------------------------------
    // Cursors
    // -----------------------------------------------------------------------

    /// Cursor over the whole tree in key order.
    pub fn cursor<'p>(&self, io: &PageIo<'p>) -> Result<Cursor<'p>> {
        self.cursor_at(io, 0)
    }

    /// Cursor positioned at the first entry with key ≥ `key`.
    pub fn cursor_at<'p>(&self, io: &PageIo<'p>, key: u64) -> Result<Cursor<'p>> {
        let leaf = self.descend_lower_bound(io, key)?;
        let Node::Leaf { next, entries } = Node::decode(&io.read(leaf)?)? else {
            return Err(DecentError::corruption("descend ended on internal node"));
        };
        let pos = entries.partition_point(|e| e.key < key);
        Ok(Cursor {
            io: io.clone(),
            entries,
            next,
            pos,
        })
    }

    // -----------------------------------------------------------------------
    // Bulk build
    // -----------------------------------------------------------------------

    /// Build a tree bottom-up from pre-sorted `(key, value)` pairs. Much
    /// cheaper than repeated inserts; used to construct indexes after bulk
    /// load.
    pub fn bulk_build<I>(pager: &Pager, entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = (u64, Vec<u8>)>,
    {
        let page_size = pager.page_size();
        let mut leaves: Vec<(u64, PageId)> = Vec::new();

        let mut current: Vec<LeafEntry> = Vec::new();
        let mut current_size = crate::node::NODE_HEADER_SIZE;
        let mut current_page = pager.allocate_page()?;
        let mut last_key: Option<u64> = None;

        let flush = |entries: &mut Vec<LeafEntry>, page: PageId, next: Option<PageId>| {
            let node = Node::Leaf {
                next,
                entries: std::mem::take(entries),
            };
            pager.write_page(page, &node.encode(page_size)?)
        };

        for (key, value) in entries {
            if last_key.is_some_and(|last| key < last) {
                return Err(DecentError::internal("bulk build input is not sorted"));
            }
            last_key = Some(key);
            let entry = LeafEntry {
                key,
                payload: make_payload(pager, &value)?,
            };
            let entry_size = entry.encoded_len();
            if current_size + entry_size > page_size.as_usize() && !current.is_empty() {
                let next_page = pager.allocate_page()?;
                let first_key = current[0].key;
                flush(&mut current, current_page, Some(next_page))?;
                leaves.push((first_key, current_page));
                current_page = next_page;
                current_size = crate::node::NODE_HEADER_SIZE;
            }
            current_size += entry_size;
            current.push(entry);
        }
        let first_key = current.first().map_or(0, |e| e.key);
        flush(&mut current, current_page, None)?;
        leaves.push((first_key, current_page));

        // Stack internal levels until one node remains. Every internal node
        // needs at least two children, so a would-be trailing single child
        // steals one from the previous chunk.
        let internal_cap = (page_size.as_usize() - crate::node::NODE_HEADER_SIZE) / 12;
        let fanout = internal_cap + 1;
        let mut level = leaves;
        while level.len() > 1 {
            let mut parents: Vec<(u64, PageId)> = Vec::new();
            let mut start = 0;
            while start < level.len() {
                let mut take = fanout.min(level.len() - start);
                if level.len() - start - take == 1 {
                    take -= 1;
                }
                let chunk = &level[start..start + take];
                let page = pager.allocate_page()?;
                let node = Node::Internal {
                    first_child: chunk[0].1,
                    entries: chunk[1..].iter().map(|(k, p)| (*k, *p)).collect(),
                };
                pager.write_page(page, &node.encode(page_size)?)?;
                parents.push((chunk[0].0, page));
                start += take;
            }
            level = parents;
        }
        Ok(Self {
            root: level[0].1,
        })
    }
}

/// Inline or spill a value depending on size.
fn make_payload(pager: &Pager, value: &[u8]) -> Result<LeafPayload> {
    if value.len() > spill_threshold(pager.page_size()) {
        let head = overflow::write_chain(pager, value)?;
        Ok(LeafPayload::Overflow {
            head,
            total_len: value.len() as u64,
        })
    } else {
        Ok(LeafPayload::Inline(value.to_vec()))
    }
}

/// Materialize a payload, following the overflow chain when needed.
fn resolve_payload(io: &PageIo<'_>, payload: &LeafPayload) -> Result<Vec<u8>> {
    match payload {
        LeafPayload::Inline(bytes) => Ok(bytes.clone()),
        LeafPayload::Overflow { head, total_len } => overflow::read_chain(io, *head, *total_len),
    }
}

fn insert_recursive(
    pager: &Pager,
    page_id: PageId,
    key: u64,
    payload: LeafPayload,
) -> Result<Option<(u64, PageId)>> {
    let page_size = pager.page_size();
    let io = pager.io();
    match Node::decode(&io.read(page_id)?)? {
        Node::Leaf { next, mut entries } => {
            let pos = entries.partition_point(|e| e.key <= key);
            entries.insert(pos, LeafEntry { key, payload });
            let node = Node::Leaf { next, entries };
            if node.fits(page_size) {
                pager.write_page(page_id, &node.encode(page_size)?)?;
                return Ok(None);
            }
            let Node::Leaf { next, mut entries } = node else {
                unreachable!()
            };
            let mid = entries.len() / 2;
            let right_entries = entries.split_off(mid);
            let right_page = pager.allocate_page()?;
            let sep = right_entries[0].key;
            let right = Node::Leaf {
                next,
                entries: right_entries,
            };
            let left = Node::Leaf {
                next: Some(right_page),
                entries,
            };
            pager.write_page(right_page, &right.encode(page_size)?)?;
            pager.write_page(page_id, &left.encode(page_size)?)?;
            trace!(leaf = %page_id, right = %right_page, sep, "leaf split");
            Ok(Some((sep, right_page)))
        }
        Node::Internal {
            first_child,
            mut entries,
        } => {
            let idx = entries.partition_point(|(sep, _)| *sep <= key);
            let child = if idx == 0 {
                first_child
            } else {
                entries[idx - 1].1
            };
            let Some((sep, right)) = insert_recursive(pager, child, key, payload)? else {
                return Ok(None);
            };
            entries.insert(idx, (sep, right));
            let node = Node::Internal {
                first_child,
                entries,
            };
            if node.fits(page_size) {
                pager.write_page(page_id, &node.encode(page_size)?)?;
                return Ok(None);
            }
            let Node::Internal {
                first_child,
                mut entries,
            } = node
            else {
                unreachable!()
            };
            let mid = entries.len() / 2;
            let (promoted_sep, right_first) = entries[mid];
            let right_entries: Vec<(u64, PageId)> = entries.split_off(mid + 1);
            entries.pop();
            let right_page = pager.allocate_page()?;
            let right = Node::Internal {
                first_child: right_first,
                entries: right_entries,
            };
            let left = Node::Internal {
                first_child,
                entries,
            };
            pager.write_page(right_page, &right.encode(page_size)?)?;
            pager.write_page(page_id, &left.encode(page_size)?)?;
            trace!(node = %page_id, right = %right_page, promoted_sep, "internal split");
            Ok(Some((promoted_sep, right_page)))
        }
    }
}

/// Forward iterator over leaf entries via the leaf chain.
pub struct Cursor<'p> {
    io: PageIo<'p>,
    entries: Vec<LeafEntry>,
    next: Option<PageId>,
    pos: usize,
}

impl Cursor<'_> {
    /// Next entry in non-decreasing key order, or `None` at the end.
    pub fn next(&mut self) -> Result<Option<CursorEntry>> {
        loop {
            if self.pos < self.entries.len() {
                let entry = &self.entries[self.pos];
                self.pos += 1;
                let value = resolve_payload(&self.io, &entry.payload)?;
                return Ok(Some(CursorEntry {
                    key: entry.key,
                    value,
                    overflow: entry.payload.overflow_head(),
                }));
            }
            let Some(next) = self.next else {
                return Ok(None);
            };
            let Node::Leaf { next: n, entries } = Node::decode(&self.io.read(next)?)? else {
                return Err(DecentError::corruption("leaf chain links to non-leaf"));
            };
            self.entries = entries;
            self.next = n;
            self.pos = 0;
        }
    }
}
