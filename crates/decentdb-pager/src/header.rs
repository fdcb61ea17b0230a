//! The fixed 128-byte database header on page 1.
//!
//! Layout (little-endian):
//!
//! | offset | size | field |
//! |---|---|---|
//! | 0   | 16 | magic `"DECENTDB"`, bytes 8..16 zero |
//! | 16  | 4  | format version |
//! | 20  | 4  | page size |
//! | 24  | 4  | CRC-32C over bytes 0..128 with this field zeroed |
//! | 28  | 4  | schema cookie |
//! | 32  | 4  | catalog root page |
//! | 36  | 4  | freelist root page |
//! | 40  | 4  | freelist head (used entries in the first trunk page) |
//! | 44  | 4  | freelist count |
//! | 48  | 8  | last checkpoint LSN |
//! | 56  | 72 | reserved, zero |

use decentdb_error::{DecentError, Result};
use decentdb_types::{Lsn, PageId, PageSize};

pub const DB_MAGIC: &[u8; 8] = b"DECENTDB";
pub const DB_HEADER_SIZE: usize = 128;
pub const DB_FORMAT_VERSION: u32 = 1;

const CHECKSUM_OFFSET: usize = 24;

/// Parsed page-1 header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbHeader {
    pub format_version: u32,
    pub page_size: PageSize,
    pub schema_cookie: u32,
    /// Root of the catalog B+Tree; `None` until the catalog is initialized.
    pub catalog_root: Option<PageId>,
    /// First trunk page of the on-disk freelist chain.
    pub freelist_root: Option<PageId>,
    /// Used entries in the first trunk page.
    pub freelist_head: u32,
    /// Total free page ids across the chain.
    pub freelist_count: u32,
    pub last_checkpoint_lsn: Lsn,
}

impl DbHeader {
    /// Header for a freshly created database.
    #[must_use]
    pub fn new(page_size: PageSize) -> Self {
        Self {
            format_version: DB_FORMAT_VERSION,
            page_size,
            schema_cookie: 0,
            catalog_root: None,
            freelist_root: None,
            freelist_head: 0,
            freelist_count: 0,
            last_checkpoint_lsn: Lsn::ZERO,
        }
    }

    /// Serialize into the fixed 128-byte form, checksum filled in.
    #[must_use]
    pub fn encode(&self) -> [u8; DB_HEADER_SIZE] {
        let mut buf = [0_u8; DB_HEADER_SIZE];
        buf[..8].copy_from_slice(DB_MAGIC);
        buf[16..20].copy_from_slice(&self.format_version.to_le_bytes());
        buf[20..24].copy_from_slice(&self.page_size.as_u32().to_le_bytes());
        // Checksum slot stays zero while hashing.
        buf[28..32].copy_from_slice(&self.schema_cookie.to_le_bytes());
        buf[32..36].copy_from_slice(&page_or_zero(self.catalog_root).to_le_bytes());
        buf[36..40].copy_from_slice(&page_or_zero(self.freelist_root).to_le_bytes());
        buf[40..44].copy_from_slice(&self.freelist_head.to_le_bytes());
        buf[44..48].copy_from_slice(&self.freelist_count.to_le_bytes());
        buf[48..56].copy_from_slice(&self.last_checkpoint_lsn.get().to_le_bytes());
        let checksum = crc32c::crc32c(&buf);
        buf[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4].copy_from_slice(&checksum.to_le_bytes());
        buf
    }

    /// Parse and verify a header read from page 1.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < DB_HEADER_SIZE {
            return Err(DecentError::corruption(format!(
                "database header truncated: {} bytes",
                buf.len()
            )));
        }
        if &buf[..8] != DB_MAGIC {
            return Err(DecentError::corruption("bad database magic"));
        }

        let stored = u32::from_le_bytes(buf[24..28].try_into().expect("4 bytes"));
        let mut zeroed = [0_u8; DB_HEADER_SIZE];
        zeroed.copy_from_slice(&buf[..DB_HEADER_SIZE]);
        zeroed[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4].fill(0);
        let computed = crc32c::crc32c(&zeroed);
        if stored != computed {
            return Err(DecentError::corruption(format!(
                "database header checksum mismatch: stored {stored:#010x}, computed {computed:#010x}"
            )));
        }

        let format_version = u32::from_le_bytes(buf[16..20].try_into().expect("4 bytes"));
        if format_version != DB_FORMAT_VERSION {
            return Err(DecentError::corruption(format!(
                "unsupported format version {format_version}"
            )));
        }
        let raw_page_size = u32::from_le_bytes(buf[20..24].try_into().expect("4 bytes"));
        let page_size = PageSize::from_u32(raw_page_size).ok_or_else(|| {
            DecentError::corruption(format!("invalid page size {raw_page_size}"))
        })?;

        Ok(Self {
            format_version,
            page_size,
            schema_cookie: u32::from_le_bytes(buf[28..32].try_into().expect("4 bytes")),
            catalog_root: PageId::new(u32::from_le_bytes(buf[32..36].try_into().expect("4 bytes"))),
            freelist_root: PageId::new(u32::from_le_bytes(
                buf[36..40].try_into().expect("4 bytes"),
            )),
            freelist_head: u32::from_le_bytes(buf[40..44].try_into().expect("4 bytes")),
            freelist_count: u32::from_le_bytes(buf[44..48].try_into().expect("4 bytes")),
            last_checkpoint_lsn: Lsn::new(u64::from_le_bytes(
                buf[48..56].try_into().expect("8 bytes"),
            )),
        })
    }
}

fn page_or_zero(page: Option<PageId>) -> u32 {
    page.map_or(0, PageId::get)
}
