//! B+Tree node layout within one page.
//!
//! Leaf: `{tag u8 = 1, count u16, next leaf u32, entries}` where an entry
//! is `{key u64, flags u8, inline: varint len + bytes | spilled: head u32 +
//! varint total len}`.
//!
//! Internal: `{tag u8 = 2, count u16, leftmost child u32, entries}` where an
//! entry is `{separator u64, child u32}`; the separator is a lower bound for
//! every key reachable through its child.
//!
//! Keys are strictly non-decreasing within a node; duplicates are allowed
//! for rowid-bearing indexes.

use decentdb_error::{DecentError, Result};
use decentdb_pager::{PAGE_TAG_BTREE_INTERNAL, PAGE_TAG_BTREE_LEAF, page_tag};
use decentdb_types::varint::{read_varint, varint_len, write_varint};
use decentdb_types::{PageId, PageSize};

pub const NODE_HEADER_SIZE: usize = 7;
const FLAG_OVERFLOW: u8 = 1;

/// Value stored in a leaf entry: inline bytes or an overflow chain head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeafPayload {
    Inline(Vec<u8>),
    Overflow { head: PageId, total_len: u64 },
}

impl LeafPayload {
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        match self {
            Self::Inline(bytes) => 1 + varint_len(bytes.len() as u64) + bytes.len(),
            Self::Overflow { total_len, .. } => 1 + 4 + varint_len(*total_len),
        }
    }

    #[must_use]
    pub fn overflow_head(&self) -> Option<PageId> {
        match self {
            Self::Inline(_) => None,
            Self::Overflow { head, .. } => Some(*head),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafEntry {
    pub key: u64,
    pub payload: LeafPayload,
}

impl LeafEntry {
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        8 + self.payload.encoded_len()
    }
}

/// A decoded node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Leaf {
        next: Option<PageId>,
        entries: Vec<LeafEntry>,
    },
    Internal {
        first_child: PageId,
        /// `(separator, child)`; keys ≥ separator live at or right of child.
        entries: Vec<(u64, PageId)>,
    },
}

impl Node {
    #[must_use]
    pub fn empty_leaf() -> Self {
        Self::Leaf {
            next: None,
            entries: Vec::new(),
        }
    }

    #[must_use]
    pub fn is_leaf(&self) -> bool {
        matches!(self, Self::Leaf { .. })
    }

    #[must_use]
    pub fn entry_count(&self) -> usize {
        match self {
            Self::Leaf { entries, .. } => entries.len(),
            Self::Internal { entries, .. } => entries.len(),
        }
    }

    /// Encoded byte size.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        match self {
            Self::Leaf { entries, .. } => {
                NODE_HEADER_SIZE + entries.iter().map(LeafEntry::encoded_len).sum::<usize>()
            }
            Self::Internal { entries, .. } => NODE_HEADER_SIZE + entries.len() * 12,
        }
    }

    #[must_use]
    pub fn fits(&self, page_size: PageSize) -> bool {
        self.encoded_len() <= page_size.as_usize()
    }

    /// Serialize into a full page image.
    pub fn encode(&self, page_size: PageSize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(page_size.as_usize());
        match self {
            Self::Leaf { next, entries } => {
                out.push(PAGE_TAG_BTREE_LEAF);
                out.extend_from_slice(&(entries.len() as u16).to_le_bytes());
                out.extend_from_slice(&next.map_or(0, PageId::get).to_le_bytes());
                for entry in entries {
                    out.extend_from_slice(&entry.key.to_le_bytes());
                    match &entry.payload {
                        LeafPayload::Inline(bytes) => {
                            out.push(0);
                            write_varint(&mut out, bytes.len() as u64);
                            out.extend_from_slice(bytes);
                        }
                        LeafPayload::Overflow { head, total_len } => {
                            out.push(FLAG_OVERFLOW);
                            out.extend_from_slice(&head.get().to_le_bytes());
                            write_varint(&mut out, *total_len);
                        }
                    }
                }
            }
            Self::Internal {
                first_child,
                entries,
            } => {
                out.push(PAGE_TAG_BTREE_INTERNAL);
                out.extend_from_slice(&(entries.len() as u16).to_le_bytes());
                out.extend_from_slice(&first_child.get().to_le_bytes());
                for (separator, child) in entries {
                    out.extend_from_slice(&separator.to_le_bytes());
                    out.extend_from_slice(&child.get().to_le_bytes());
                }
            }
        }
        if out.len() > page_size.as_usize() {
            return Err(DecentError::internal(format!(
                "node encoding of {} bytes exceeds page size {}",
                out.len(),
                page_size.as_usize()
            )));
        }
        out.resize(page_size.as_usize(), 0);
        Ok(out)
    }

    /// Parse a page image, validating structure.
    pub fn decode(page: &[u8]) -> Result<Self> {
        let tag = page_tag(page);
        if page.len() < NODE_HEADER_SIZE {
            return Err(DecentError::corruption("btree node shorter than header"));
        }
        let count = u16::from_le_bytes(page[1..3].try_into().expect("2 bytes")) as usize;
        let link = u32::from_le_bytes(page[3..7].try_into().expect("4 bytes"));
        match tag {
            PAGE_TAG_BTREE_LEAF => {
                let mut entries = Vec::with_capacity(count);
                let mut pos = NODE_HEADER_SIZE;
                let mut last_key = None;
                for _ in 0..count {
                    if pos + 9 > page.len() {
                        return Err(DecentError::corruption("leaf entry runs past page end"));
                    }
                    let key = u64::from_le_bytes(page[pos..pos + 8].try_into().expect("8 bytes"));
                    if last_key.is_some_and(|last| key < last) {
                        return Err(DecentError::corruption("leaf keys out of order"));
                    }
                    last_key = Some(key);
                    pos += 8;
                    let flags = page[pos];
                    pos += 1;
                    let payload = if flags & FLAG_OVERFLOW == 0 {
                        let len = read_varint(page, &mut pos)? as usize;
                        if pos + len > page.len() {
                            return Err(DecentError::corruption("leaf value runs past page end"));
                        }
                        let bytes = page[pos..pos + len].to_vec();
                        pos += len;
                        LeafPayload::Inline(bytes)
                    } else {
                        if pos + 4 > page.len() {
                            return Err(DecentError::corruption("overflow cell truncated"));
                        }
                        let raw =
                            u32::from_le_bytes(page[pos..pos + 4].try_into().expect("4 bytes"));
                        pos += 4;
                        let head = PageId::decode(raw)?;
                        let total_len = read_varint(page, &mut pos)?;
                        LeafPayload::Overflow { head, total_len }
                    };
                    entries.push(LeafEntry { key, payload });
                }
                Ok(Self::Leaf {
                    next: PageId::new(link),
                    entries,
                })
            }
            PAGE_TAG_BTREE_INTERNAL => {
                if count == 0 {
                    return Err(DecentError::corruption("internal node with no entries"));
                }
                if NODE_HEADER_SIZE + count * 12 > page.len() {
                    return Err(DecentError::corruption(
                        "internal entry count exceeds page capacity",
                    ));
                }
                let first_child = PageId::decode(link)?;
                let mut entries = Vec::with_capacity(count);
                let mut pos = NODE_HEADER_SIZE;
                let mut last_sep = None;
                for _ in 0..count {
                    let separator =
                        u64::from_le_bytes(page[pos..pos + 8].try_into().expect("8 bytes"));
                    pos += 8;
                    let child = PageId::decode(u32::from_le_bytes(
                        page[pos..pos + 4].try_into().expect("4 bytes"),
                    ))?;
                    pos += 4;
                    if last_sep.is_some_and(|last| separator < last) {
                        return Err(DecentError::corruption("internal separators out of order"));
                    }
                    last_sep = Some(separator);
                    entries.push((separator, child));
                }
                Ok(Self::Internal {
                    first_child,
                    entries,
                })
            }
            other => Err(DecentError::corruption(format!(
                "page tag {other} is not a btree node"
            ))),
        }
    }
}
