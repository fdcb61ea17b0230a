//! On-disk WAL format.
//!
//! The file starts with a fixed 32-byte header; frames are densely packed
//! after it. A frame's LSN is its end offset in the file, so LSNs are
//! strictly increasing and double as byte positions.
//!
//! Header (little-endian):
//!
//! | offset | size | field |
//! |---|---|---|
//! | 0  | 8 | magic `"DDBWAL01"` |
//! | 8  | 4 | header version (1) |
//! | 12 | 4 | page size |
//! | 16 | 8 | logical end offset of the last committed frame |
//! | 24 | 8 | reserved, zero |
//!
//! Frame: `{type u8, page id u32, payload}`. PAGE frames carry a full page,
//! COMMIT frames nothing, CHECKPOINT frames the 8-byte checkpoint LSN.

use decentdb_error::{DecentError, Result};
use decentdb_types::PageSize;

pub const WAL_MAGIC: &[u8; 8] = b"DDBWAL01";
pub const WAL_HEADER_SIZE: usize = 32;
pub const WAL_HEADER_VERSION: u32 = 1;
pub const FRAME_HEADER_SIZE: usize = 5;

/// Frame discriminator byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Page = 0,
    Commit = 1,
    Checkpoint = 2,
}

impl FrameType {
    pub fn decode(raw: u8) -> Result<Self> {
        match raw {
            0 => Ok(Self::Page),
            1 => Ok(Self::Commit),
            2 => Ok(Self::Checkpoint),
            other => Err(DecentError::corruption(format!(
                "invalid WAL frame type {other}"
            ))),
        }
    }

    /// Payload size implied by the frame type.
    #[must_use]
    pub const fn payload_len(self, page_size: PageSize) -> usize {
        match self {
            Self::Page => page_size.as_usize(),
            Self::Commit => 0,
            Self::Checkpoint => 8,
        }
    }
}

/// Parsed WAL header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalHeader {
    pub page_size: PageSize,
    /// Logical end offset; 0 means the WAL holds no committed frames.
    pub end_offset: u64,
}

impl WalHeader {
    #[must_use]
    pub fn new(page_size: PageSize) -> Self {
        Self {
            page_size,
            end_offset: 0,
        }
    }

    #[must_use]
    pub fn encode(&self) -> [u8; WAL_HEADER_SIZE] {
        let mut buf = [0_u8; WAL_HEADER_SIZE];
        buf[..8].copy_from_slice(WAL_MAGIC);
        buf[8..12].copy_from_slice(&WAL_HEADER_VERSION.to_le_bytes());
        buf[12..16].copy_from_slice(&self.page_size.as_u32().to_le_bytes());
        buf[16..24].copy_from_slice(&self.end_offset.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < WAL_HEADER_SIZE {
            return Err(DecentError::corruption(format!(
                "WAL header truncated: {} bytes",
                buf.len()
            )));
        }
        if &buf[..8] != WAL_MAGIC {
            return Err(DecentError::corruption("bad WAL magic"));
        }
        let version = u32::from_le_bytes(buf[8..12].try_into().expect("4 bytes"));
        if version != WAL_HEADER_VERSION {
            return Err(DecentError::corruption(format!(
                "unsupported WAL header version {version}"
            )));
        }
        let raw_page_size = u32::from_le_bytes(buf[12..16].try_into().expect("4 bytes"));
        let page_size = PageSize::from_u32(raw_page_size).ok_or_else(|| {
            DecentError::corruption(format!("invalid WAL page size {raw_page_size}"))
        })?;
        Ok(Self {
            page_size,
            end_offset: u64::from_le_bytes(buf[16..24].try_into().expect("8 bytes")),
        })
    }
}

/// Encode a frame header.
#[must_use]
pub fn encode_frame_header(frame_type: FrameType, page_id: u32) -> [u8; FRAME_HEADER_SIZE] {
    let mut buf = [0_u8; FRAME_HEADER_SIZE];
    buf[0] = frame_type as u8;
    buf[1..5].copy_from_slice(&page_id.to_le_bytes());
    buf
}

/// Decode a frame header into `(type, page id)`.
pub fn decode_frame_header(buf: &[u8; FRAME_HEADER_SIZE]) -> Result<(FrameType, u32)> {
    let frame_type = FrameType::decode(buf[0])?;
    let page_id = u32::from_le_bytes(buf[1..5].try_into().expect("4 bytes"));
    match frame_type {
        FrameType::Page if page_id == 0 => {
            Err(DecentError::corruption("PAGE frame with page id zero"))
        }
        FrameType::Commit | FrameType::Checkpoint if page_id != 0 => Err(
            DecentError::corruption("non-PAGE frame with non-zero page id"),
        ),
        _ => Ok((frame_type, page_id)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_round_trip() {
        let hdr = WalHeader {
            page_size: PageSize::S16384,
            end_offset: 987_654,
        };
        assert_eq!(WalHeader::decode(&hdr.encode()).unwrap(), hdr);
    }

    #[test]
    fn test_bad_magic() {
        let mut buf = WalHeader::new(PageSize::DEFAULT).encode();
        buf[3] = b'!';
        assert!(WalHeader::decode(&buf).is_err());
    }

    #[test]
    fn test_frame_header_round_trip() {
        let buf = encode_frame_header(FrameType::Page, 42);
        let (ty, page) = decode_frame_header(&buf).unwrap();
        assert_eq!(ty, FrameType::Page);
        assert_eq!(page, 42);
    }

    #[test]
    fn test_page_frame_requires_page_id() {
        let buf = encode_frame_header(FrameType::Page, 0);
        assert!(decode_frame_header(&buf).is_err());
    }

    #[test]
    fn test_commit_frame_requires_zero_page_id() {
        let buf = encode_frame_header(FrameType::Commit, 9);
        assert!(decode_frame_header(&buf).is_err());
    }

    #[test]
    fn test_unknown_frame_type() {
        let buf = [7_u8, 0, 0, 0, 0];
        assert!(decode_frame_header(&buf).is_err());
    }

    #[test]
    fn test_payload_lengths() {
        assert_eq!(FrameType::Page.payload_len(PageSize::S4096), 4096);
        assert_eq!(FrameType::Commit.payload_len(PageSize::S4096), 0);
        assert_eq!(FrameType::Checkpoint.payload_len(PageSize::S4096), 8);
    }
}
