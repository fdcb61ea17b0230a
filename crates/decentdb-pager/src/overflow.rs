//! Overflow page chains for values too large to sit inline in a record or
//! B+Tree leaf.
//!
//! Chain page layout: `{type tag u8 = 3, next u32, len u32, payload}`.
//! All bytes written to a chain read back bit-identically; chains are freed
//! when the owning row is deleted or the value replaced.

use decentdb_error::{DecentError, Result};
use decentdb_types::{PageId, PageSize};

use crate::pager::{PageIo, Pager};
use crate::{PAGE_TAG_OVERFLOW, page_tag};

const CHAIN_HEADER: usize = 9;

/// Payload bytes one overflow page can hold.
#[must_use]
pub fn overflow_capacity(page_size: PageSize) -> usize {
    page_size.as_usize() - CHAIN_HEADER
}

/// Write `bytes` into a fresh chain; returns the head page.
pub fn write_chain(pager: &Pager, bytes: &[u8]) -> Result<PageId> {
    let page_size = pager.page_size();
    let cap = overflow_capacity(page_size);
    let chunks: Vec<&[u8]> = if bytes.is_empty() {
        vec![&[]]
    } else {
        bytes.chunks(cap).collect()
    };

    // Build back-to-front so each page already knows its successor.
    let mut next: u32 = 0;
    let mut head = None;
    for chunk in chunks.iter().rev() {
        let page_id = pager.allocate_page()?;
        let mut page = vec![0_u8; page_size.as_usize()];
        page[0] = PAGE_TAG_OVERFLOW;
        page[1..5].copy_from_slice(&next.to_le_bytes());
        page[5..9].copy_from_slice(&(chunk.len() as u32).to_le_bytes());
        page[CHAIN_HEADER..CHAIN_HEADER + chunk.len()].copy_from_slice(chunk);
        pager.write_page(page_id, &page)?;
        next = page_id.get();
        head = Some(page_id);
    }
    head.ok_or_else(|| DecentError::internal("overflow chain with no pages"))
}

/// Reassemble a chain; `total_len` is the expected byte count from the
/// record cell.
pub fn read_chain(io: &PageIo<'_>, head: PageId, total_len: u64) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(total_len as usize);
    let mut next = Some(head);
    let mut hops = 0_u32;
    while let Some(page_id) = next {
        hops += 1;
        if hops > io.pager().page_count().saturating_add(1) {
            return Err(DecentError::corruption("overflow chain cycle"));
        }
        let page = io.read(page_id)?;
        if page_tag(&page) != PAGE_TAG_OVERFLOW {
            return Err(DecentError::corruption(format!(
                "page {page_id} is not an overflow page"
            )));
        }
        let len = u32::from_le_bytes(page[5..9].try_into().expect("4 bytes")) as usize;
        if CHAIN_HEADER + len > page.len() {
            return Err(DecentError::corruption(format!(
                "overflow page {page_id} claims {len} payload bytes"
            )));
        }
        out.extend_from_slice(&page[CHAIN_HEADER..CHAIN_HEADER + len]);
        next = PageId::new(u32::from_le_bytes(page[1..5].try_into().expect("4 bytes")));
    }
    if out.len() as u64 != total_len {
        return Err(DecentError::corruption(format!(
            "overflow chain length mismatch: expected {total_len}, got {}",
            out.len()
        )));
    }
    Ok(out)
}

/// Return every page of a chain to the freelist.
pub fn free_chain(pager: &Pager, head: PageId) -> Result<()> {
    let io = pager.io();
    let mut next = Some(head);
    let mut hops = 0_u32;
    while let Some(page_id) = next {
        hops += 1;
        if hops > pager.page_count().saturating_add(1) {
            return Err(DecentError::corruption("overflow chain cycle"));
        }
        let page = io.read(page_id)?;
        if page_tag(&page) != PAGE_TAG_OVERFLOW {
            return Err(DecentError::corruption(format!(
                "page {page_id} is not an overflow page"
            )));
        }
        next = PageId::new(u32::from_le_bytes(page[1..5].try_into().expect("4 bytes")));
        pager.free_page(page_id)?;
    }
    Ok(())
}
