//! Row record codec.
//!
//! A row is a variable-length stream of `{tag, payload}` cells, one per
//! column. The tag byte packs the value kind into its low 5 bits and a
//! length class into the high 3: classes 0–6 are the literal payload length
//! for short TEXT/BLOB values, class 7 means a varint length follows.
//! Integers are fixed 8-byte little-endian, floats the little-endian IEEE
//! bit pattern, null a lone tag byte.
//!
//! A row that would exceed `page_size - 128` bytes has its largest TEXT or
//! BLOB cells promoted to overflow chains; the cell then stores the chain
//! head and the total length.

use decentdb_error::{DecentError, Result};
use decentdb_pager::{PageIo, Pager, overflow};
use decentdb_types::varint::{read_varint, write_varint};
use decentdb_types::{PageId, PageSize, Value};

const KIND_NULL: u8 = 0;
const KIND_INT64: u8 = 1;
const KIND_BOOL: u8 = 2;
const KIND_FLOAT64: u8 = 3;
const KIND_TEXT: u8 = 4;
const KIND_BLOB: u8 = 5;
const KIND_TEXT_OVERFLOW: u8 = 6;
const KIND_BLOB_OVERFLOW: u8 = 7;

const CLASS_WIDE: u8 = 7;
const KIND_MASK: u8 = 0x1F;
const CLASS_SHIFT: u8 = 5;

/// Row space reserved for leaf bookkeeping; rows encoding past
/// `page_size - RESERVE` spill their big cells.
const RESERVE: usize = 128;

fn tag(kind: u8, class: u8) -> u8 {
    kind | (class << CLASS_SHIFT)
}

fn write_bytes_cell(out: &mut Vec<u8>, kind: u8, bytes: &[u8]) {
    if bytes.len() < CLASS_WIDE as usize {
        out.push(tag(kind, bytes.len() as u8));
    } else {
        out.push(tag(kind, CLASS_WIDE));
        write_varint(out, bytes.len() as u64);
    }
    out.extend_from_slice(bytes);
}

/// Encode one value as a cell.
fn write_cell(out: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Null => out.push(tag(KIND_NULL, 0)),
        Value::Int64(v) => {
            out.push(tag(KIND_INT64, 0));
            out.extend_from_slice(&v.to_le_bytes());
        }
        Value::Bool(v) => {
            out.push(tag(KIND_BOOL, 0));
            out.push(u8::from(*v));
        }
        Value::Float64(v) => {
            out.push(tag(KIND_FLOAT64, 0));
            out.extend_from_slice(&v.to_le_bytes());
        }
        Value::Text(bytes) => write_bytes_cell(out, KIND_TEXT, bytes),
        Value::Blob(bytes) => write_bytes_cell(out, KIND_BLOB, bytes),
        Value::TextOverflow(head, total_len) => {
            out.push(tag(KIND_TEXT_OVERFLOW, 0));
            out.extend_from_slice(&head.get().to_le_bytes());
            write_varint(out, *total_len);
        }
        Value::BlobOverflow(head, total_len) => {
            out.push(tag(KIND_BLOB_OVERFLOW, 0));
            out.extend_from_slice(&head.get().to_le_bytes());
            write_varint(out, *total_len);
        }
    }
}

/// Encode a row without overflow promotion.
#[must_use]
pub fn encode_row(values: &[Value]) -> Vec<u8> {
    let mut out = Vec::new();
    for value in values {
        write_cell(&mut out, value);
    }
    out
}

/// Encode a row, promoting large TEXT/BLOB cells to overflow chains until
/// the encoding fits the row budget for `page_size`.
pub fn encode_row_with_overflow(
    pager: &Pager,
    values: &[Value],
    page_size: PageSize,
) -> Result<Vec<u8>> {
    let budget = page_size.as_usize() - RESERVE;
    let mut working: Vec<Value> = values.to_vec();
    loop {
        let encoded = encode_row(&working);
        if encoded.len() <= budget {
            return Ok(encoded);
        }
        // Promote the largest inline text/blob; if none is left the row is
        // irreducibly too big, which the cell layout makes impossible for
        // realistic column counts.
        let Some((idx, _)) = working
            .iter()
            .enumerate()
            .filter_map(|(i, v)| v.as_bytes().map(|b| (i, b.len())))
            .max_by_key(|(_, len)| *len)
        else {
            return Err(DecentError::internal(format!(
                "row of {} bytes cannot be reduced below the {budget}-byte budget",
                encoded.len()
            )));
        };
        working[idx] = match std::mem::replace(&mut working[idx], Value::Null) {
            Value::Text(bytes) => {
                let head = overflow::write_chain(pager, &bytes)?;
                Value::TextOverflow(head, bytes.len() as u64)
            }
            Value::Blob(bytes) => {
                let head = overflow::write_chain(pager, &bytes)?;
                Value::BlobOverflow(head, bytes.len() as u64)
            }
            other => other,
        };
    }
}

/// Decode a row; overflow cells are returned as `TextOverflow`/
/// `BlobOverflow` without touching their chains.
pub fn decode_row(bytes: &[u8]) -> Result<Vec<Value>> {
    let mut values = Vec::new();
    let mut pos = 0;
    while pos < bytes.len() {
        let t = bytes[pos];
        pos += 1;
        let kind = t & KIND_MASK;
        let class = t >> CLASS_SHIFT;
        let value = match kind {
            KIND_NULL => Value::Null,
            KIND_INT64 => {
                let raw = take(bytes, &mut pos, 8)?;
                Value::Int64(i64::from_le_bytes(raw.try_into().expect("8 bytes")))
            }
            KIND_BOOL => {
                let raw = take(bytes, &mut pos, 1)?;
                Value::Bool(raw[0] != 0)
            }
            KIND_FLOAT64 => {
                let raw = take(bytes, &mut pos, 8)?;
                Value::Float64(f64::from_le_bytes(raw.try_into().expect("8 bytes")))
            }
            KIND_TEXT | KIND_BLOB => {
                let len = if class == CLASS_WIDE {
                    read_varint(bytes, &mut pos)? as usize
                } else {
                    class as usize
                };
                let raw = take(bytes, &mut pos, len)?.to_vec();
                if kind == KIND_TEXT {
                    Value::Text(raw)
                } else {
                    Value::Blob(raw)
                }
            }
            KIND_TEXT_OVERFLOW | KIND_BLOB_OVERFLOW => {
                let raw = take(bytes, &mut pos, 4)?;
                let head = PageId::decode(u32::from_le_bytes(raw.try_into().expect("4 bytes")))?;
                let total_len = read_varint(bytes, &mut pos)?;
                if kind == KIND_TEXT_OVERFLOW {
                    Value::TextOverflow(head, total_len)
                } else {
                    Value::BlobOverflow(head, total_len)
                }
            }
            other => {
                return Err(DecentError::corruption(format!(
                    "unknown record cell kind {other}"
                )));
            }
        };
        values.push(value);
    }
    Ok(values)
}

fn take<'a>(bytes: &'a [u8], pos: &mut usize, len: usize) -> Result<&'a [u8]> {
    if *pos + len > bytes.len() {
        return Err(DecentError::corruption("record cell runs past end of row"));
    }
    let out = &bytes[*pos..*pos + len];
    *pos += len;
    Ok(out)
}

/// Decode a row and materialize overflow cells back into inline values.
pub fn decode_row_materialized(io: &PageIo<'_>, bytes: &[u8]) -> Result<Vec<Value>> {
    let mut values = decode_row(bytes)?;
    for value in &mut values {
        match value {
            Value::TextOverflow(head, len) => {
                *value = Value::Text(overflow::read_chain(io, *head, *len)?);
            }
            Value::BlobOverflow(head, len) => {
                *value = Value::Blob(overflow::read_chain(io, *head, *len)?);
            }
            _ => {}
        }
    }
    Ok(values)
}

/// Free the overflow chains referenced by an encoded row. Called on row
/// delete and before rewriting a row whose cells are replaced.
pub fn free_row_overflow(pager: &Pager, bytes: &[u8]) -> Result<()> {
    for value in decode_row(bytes)? {
        if let Value::TextOverflow(head, _) | Value::BlobOverflow(head, _) = value {
            overflow::free_chain(pager, head)?;
        }
    }
    Ok(())
}
