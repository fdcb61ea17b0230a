//! Paged storage: DB header, page cache, freelist, overflow chains, and the
//! snapshot overlay composition that makes reads consistent.

pub mod cache;
pub mod freelist;
pub mod header;
pub mod overflow;
pub mod pager;

pub use header::{DB_FORMAT_VERSION, DB_HEADER_SIZE, DB_MAGIC, DbHeader};
pub use pager::{DirtyPageSink, PageIo, PageResolver, Pager, ReadGuard};

/// Page type tags stored in byte 0 of non-header pages.
pub const PAGE_TAG_BTREE_LEAF: u8 = 1;
pub const PAGE_TAG_BTREE_INTERNAL: u8 = 2;
pub const PAGE_TAG_OVERFLOW: u8 = 3;
pub const PAGE_TAG_FREELIST: u8 = 4;

/// Type tag of a raw page image (0 for an all-zero page).
#[must_use]
pub fn page_tag(page: &[u8]) -> u8 {
    page.first().copied().unwrap_or(0)
}
