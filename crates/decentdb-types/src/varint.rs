//! LEB128 variable-length integers, used by the record codec, B+Tree leaf
//! entries, and trigram posting lists.

use decentdb_error::{DecentError, Result};

/// Append `value` as LEB128.
pub fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// Decode a LEB128 integer at `*pos`, advancing it past the encoding.
pub fn read_varint(buf: &[u8], pos: &mut usize) -> Result<u64> {
    let mut value = 0_u64;
    let mut shift = 0_u32;
    loop {
        let byte = *buf
            .get(*pos)
            .ok_or_else(|| DecentError::corruption("varint runs past end of buffer"))?;
        *pos += 1;
        if shift == 63 && byte > 1 {
            return Err(DecentError::corruption("varint overflows u64"));
        }
        value |= u64::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift > 63 {
            return Err(DecentError::corruption("varint longer than 10 bytes"));
        }
    }
}

/// Encoded size of `value` in bytes.
#[must_use]
pub fn varint_len(value: u64) -> usize {
    if value == 0 {
        return 1;
    }
    (64 - value.leading_zeros() as usize).div_ceil(7)
}
