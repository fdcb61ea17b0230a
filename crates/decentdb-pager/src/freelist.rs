//! On-disk freelist: a chain of trunk pages listing reusable page ids.
//!
//! Trunk layout: `{type tag u8 = 4, next u32, count u32, entries [u32]}`.
//! The chain head and total entry count live in the DB header. Trunk pages
//! themselves become free once the chain has been loaded, so they are
//! pushed into the in-memory freelist alongside their entries.

use decentdb_error::{DecentError, Result};
use decentdb_types::{PageId, PageSize};
use tracing::debug;

use crate::pager::{PageIo, Pager};
use crate::{PAGE_TAG_FREELIST, page_tag};

const TRUNK_HEADER: usize = 9;

fn trunk_capacity(page_size: PageSize) -> usize {
    (page_size.as_usize() - TRUNK_HEADER) / 4
}

/// Walk the trunk chain and return every reusable page id, trunk pages
/// included.
pub fn load_freelist(io: &PageIo<'_>, root: Option<PageId>) -> Result<Vec<PageId>> {
    let mut pages = Vec::new();
    let mut next = root;
    let mut trunks_seen = 0_u32;
    while let Some(trunk) = next {
        trunks_seen += 1;
        if trunks_seen > io.pager().page_count() {
            return Err(DecentError::corruption("freelist chain cycle"));
        }
        let data = io.read(trunk)?;
        if page_tag(&data) != PAGE_TAG_FREELIST {
            return Err(DecentError::corruption(format!(
                "page {trunk} is not a freelist trunk"
            )));
        }
        let count = u32::from_le_bytes(data[5..9].try_into().expect("4 bytes")) as usize;
        if count > trunk_capacity(io.page_size()) {
            return Err(DecentError::corruption(format!(
                "freelist trunk {trunk} claims {count} entries"
            )));
        }
        for i in 0..count {
            let at = TRUNK_HEADER + i * 4;
            let raw = u32::from_le_bytes(data[at..at + 4].try_into().expect("4 bytes"));
            pages.push(PageId::decode(raw)?);
        }
        next = PageId::new(u32::from_le_bytes(data[1..5].try_into().expect("4 bytes")));
        pages.push(trunk);
    }
    debug!(free = pages.len(), "loaded freelist");
    Ok(pages)
}

/// Serialize the in-memory freelist back into a trunk chain, writing trunk
/// pages through the normal (WAL-bound) write path. Trunk pages are taken
/// from the list itself. Returns `(chain root, used entries in the root
/// trunk, total listed entries)` for the DB header.
pub fn store_freelist(
    pager: &Pager,
    free: &[PageId],
) -> Result<(Option<PageId>, u32, u32)> {
    let page_size = pager.page_size();
    let cap = trunk_capacity(page_size);
    let mut remaining: Vec<PageId> = free.to_vec();
    let mut chain_next: u32 = 0;
    let mut root = None;
    let mut head_used = 0_u32;
    let mut total = 0_u32;

    while let Some(trunk) = remaining.pop() {
        let take = remaining.len().min(cap);
        let entries: Vec<PageId> = remaining.split_off(remaining.len() - take);

        let mut page = vec![0_u8; page_size.as_usize()];
        page[0] = PAGE_TAG_FREELIST;
        page[1..5].copy_from_slice(&chain_next.to_le_bytes());
        page[5..9].copy_from_slice(&(entries.len() as u32).to_le_bytes());
        for (i, id) in entries.iter().enumerate() {
            let at = TRUNK_HEADER + i * 4;
            page[at..at + 4].copy_from_slice(&id.get().to_le_bytes());
        }
        pager.write_page(trunk, &page)?;

        chain_next = trunk.get();
        root = Some(trunk);
        head_used = entries.len() as u32;
        total += entries.len() as u32;
    }
    Ok((root, head_used, total))
}
