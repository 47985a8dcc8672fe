//! # Cell Codec
//!
//! Binary encodings of the four B-tree cell shapes. Cells sit back to back in
//! the content area of a page, so every decoder reports how many bytes it
//! consumed and never reads past the end of its own cell.
//!
//! ## Cell Layouts
//!
//! ```text
//! table-leaf:     varint(payload_size) varint(rowid) local[..] [overflow:4]
//! table-interior: left_child:4 varint(rowid)
//! index-leaf:     varint(payload_size) local[..] [overflow:4]
//! index-interior: left_child:4 varint(payload_size) local[..] [overflow:4]
//! ```
//!
//! `payload_size` is the full payload length. The in-page (local) part is
//! `calculate_local_payload_size(usable, payload_size, is_leaf)` bytes; when
//! that is shorter than the payload the remainder lives in an overflow chain
//! and a 4-byte big-endian pointer to its first page follows the local bytes.
//! Deriving the local length from the size lets the decoder know whether a
//! pointer is present without looking at bytes beyond the cell.
//!
//! ## Local Payload Formula
//!
//! ```text
//! max_local(leaf)     = U - 35
//! max_local(interior) = ((U - 12) * 64 / 255) - 23
//! min_local           = ((U - 12) * 32 / 255) - 23
//!
//! P <= max_local  -> P
//! otherwise       -> s = min_local + (P - min_local) % (U - 4)
//!                    s if s <= max_local, else min_local
//! ```
//!
//! ## Buffers
//!
//! Encoders append to a caller-owned `Vec<u8>`; hot paths hand in buffers
//! taken from a [`crate::memory::CellBufferPool`].

use eyre::{bail, ensure, Result};

use super::varint::{append_varint, read_varint};
use crate::error::StorageError;

const POINTER_SIZE: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellKind {
    TableLeaf,
    TableInterior,
    IndexLeaf,
    IndexInterior,
}

impl CellKind {
    pub fn is_leaf(self) -> bool {
        matches!(self, CellKind::TableLeaf | CellKind::IndexLeaf)
    }

    pub fn is_table(self) -> bool {
        matches!(self, CellKind::TableLeaf | CellKind::TableInterior)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableLeafCell<'a> {
    pub rowid: i64,
    pub payload_size: u64,
    pub local: &'a [u8],
    pub overflow_page: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableInteriorCell {
    pub left_child: u32,
    pub rowid: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexLeafCell<'a> {
    pub payload_size: u64,
    pub local: &'a [u8],
    pub overflow_page: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexInteriorCell<'a> {
    pub left_child: u32,
    pub payload_size: u64,
    pub local: &'a [u8],
    pub overflow_page: Option<u32>,
}

/// A decoded cell of any shape, borrowing its local payload from the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cell<'a> {
    TableLeaf(TableLeafCell<'a>),
    TableInterior(TableInteriorCell),
    IndexLeaf(IndexLeafCell<'a>),
    IndexInterior(IndexInteriorCell<'a>),
}

impl<'a> Cell<'a> {
    pub fn left_child(&self) -> Option<u32> {
        match self {
            Cell::TableInterior(c) => Some(c.left_child),
            Cell::IndexInterior(c) => Some(c.left_child),
            _ => None,
        }
    }

    pub fn rowid(&self) -> Option<i64> {
        match self {
            Cell::TableLeaf(c) => Some(c.rowid),
            Cell::TableInterior(c) => Some(c.rowid),
            _ => None,
        }
    }

    /// Payload view: `(payload_size, local bytes, overflow page)`.
    pub fn payload(&self) -> Option<(u64, &'a [u8], Option<u32>)> {
        match *self {
            Cell::TableLeaf(c) => Some((c.payload_size, c.local, c.overflow_page)),
            Cell::IndexLeaf(c) => Some((c.payload_size, c.local, c.overflow_page)),
            Cell::IndexInterior(c) => Some((c.payload_size, c.local, c.overflow_page)),
            Cell::TableInterior(_) => None,
        }
    }
}

pub fn max_local(usable_size: usize, is_leaf: bool) -> usize {
    if is_leaf {
        usable_size - 35
    } else {
        ((usable_size - 12) * 64 / 255) - 23
    }
}

pub fn min_local(usable_size: usize) -> usize {
    ((usable_size - 12) * 32 / 255) - 23
}

pub fn calculate_local_payload_size(usable_size: usize, payload_size: usize, is_leaf: bool) -> usize {
    let max = max_local(usable_size, is_leaf);
    if payload_size <= max {
        return payload_size;
    }

    let min = min_local(usable_size);
    let surplus = min + (payload_size - min) % (usable_size - 4);
    if surplus <= max {
        surplus
    } else {
        min
    }
}

fn check_payload(
    usable_size: usize,
    payload_size: u64,
    local: &[u8],
    overflow_page: Option<u32>,
    is_leaf: bool,
) -> Result<()> {
    let expected = calculate_local_payload_size(usable_size, payload_size as usize, is_leaf);
    ensure!(
        local.len() == expected,
        StorageError::InvalidCell("local payload length does not match payload size")
    );

    let spills = (local.len() as u64) < payload_size;
    match overflow_page {
        Some(0) => bail!(StorageError::InvalidCell("overflow page pointer is zero")),
        Some(_) if !spills => bail!(StorageError::InvalidCell(
            "overflow pointer on a payload that fits locally"
        )),
        None if spills => bail!(StorageError::InvalidCell(
            "payload spills but no overflow page given"
        )),
        _ => Ok(()),
    }
}

fn append_payload(out: &mut Vec<u8>, local: &[u8], overflow_page: Option<u32>) {
    out.extend_from_slice(local);
    if let Some(page) = overflow_page {
        out.extend_from_slice(&page.to_be_bytes());
    }
}

fn read_u32(data: &[u8], offset: usize) -> Result<u32> {
    match data.get(offset..offset + POINTER_SIZE) {
        Some(bytes) => Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])),
        None => bail!(StorageError::InvalidCell("truncated page pointer")),
    }
}

fn read_payload(
    data: &[u8],
    offset: usize,
    usable_size: usize,
    payload_size: i64,
    is_leaf: bool,
) -> Result<(&[u8], Option<u32>, usize)> {
    ensure!(
        payload_size >= 0,
        StorageError::InvalidCell("negative payload size")
    );
    let payload_size = payload_size as usize;
    let local_len = calculate_local_payload_size(usable_size, payload_size, is_leaf);

    let end = offset + local_len;
    let Some(local) = data.get(offset..end) else {
        bail!(StorageError::InvalidCell("truncated payload"));
    };

    if local_len < payload_size {
        let page = read_u32(data, end)?;
        ensure!(
            page != 0,
            StorageError::InvalidCell("overflow page pointer is zero")
        );
        Ok((local, Some(page), end + POINTER_SIZE))
    } else {
        Ok((local, None, end))
    }
}

pub fn encode_table_leaf_cell(
    cell: &TableLeafCell<'_>,
    usable_size: usize,
    out: &mut Vec<u8>,
) -> Result<usize> {
    check_payload(usable_size, cell.payload_size, cell.local, cell.overflow_page, true)?;

    let start = out.len();
    append_varint(out, cell.payload_size as i64);
    append_varint(out, cell.rowid);
    append_payload(out, cell.local, cell.overflow_page);
    Ok(out.len() - start)
}

pub fn decode_table_leaf_cell(data: &[u8], usable_size: usize) -> Result<(TableLeafCell<'_>, usize)> {
    let (payload_size, n1) = read_varint(data)?;
    let (rowid, n2) = read_varint(&data[n1..])?;
    let (local, overflow_page, end) = read_payload(data, n1 + n2, usable_size, payload_size, true)?;

    Ok((
        TableLeafCell {
            rowid,
            payload_size: payload_size as u64,
            local,
            overflow_page,
        },
        end,
    ))
}

pub fn encode_table_interior_cell(cell: &TableInteriorCell, out: &mut Vec<u8>) -> usize {
    let start = out.len();
    out.extend_from_slice(&cell.left_child.to_be_bytes());
    append_varint(out, cell.rowid);
    out.len() - start
}

pub fn decode_table_interior_cell(data: &[u8]) -> Result<(TableInteriorCell, usize)> {
    let left_child = read_u32(data, 0)?;
    let (rowid, n) = read_varint(&data[POINTER_SIZE..])?;

    Ok((TableInteriorCell { left_child, rowid }, POINTER_SIZE + n))
}

pub fn encode_index_leaf_cell(
    cell: &IndexLeafCell<'_>,
    usable_size: usize,
    out: &mut Vec<u8>,
) -> Result<usize> {
    check_payload(usable_size, cell.payload_size, cell.local, cell.overflow_page, true)?;

    let start = out.len();
    append_varint(out, cell.payload_size as i64);
    append_payload(out, cell.local, cell.overflow_page);
    Ok(out.len() - start)
}

pub fn decode_index_leaf_cell(data: &[u8], usable_size: usize) -> Result<(IndexLeafCell<'_>, usize)> {
    let (payload_size, n) = read_varint(data)?;
    let (local, overflow_page, end) = read_payload(data, n, usable_size, payload_size, true)?;

    Ok((
        IndexLeafCell {
            payload_size: payload_size as u64,
            local,
            overflow_page,
        },
        end,
    ))
}

pub fn encode_index_interior_cell(
    cell: &IndexInteriorCell<'_>,
    usable_size: usize,
    out: &mut Vec<u8>,
) -> Result<usize> {
    check_payload(usable_size, cell.payload_size, cell.local, cell.overflow_page, false)?;

    let start = out.len();
    out.extend_from_slice(&cell.left_child.to_be_bytes());
    append_varint(out, cell.payload_size as i64);
    append_payload(out, cell.local, cell.overflow_page);
    Ok(out.len() - start)
}

pub fn decode_index_interior_cell(
    data: &[u8],
    usable_size: usize,
) -> Result<(IndexInteriorCell<'_>, usize)> {
    let left_child = read_u32(data, 0)?;
    let (payload_size, n) = read_varint(&data[POINTER_SIZE..])?;
    let (local, overflow_page, end) =
        read_payload(data, POINTER_SIZE + n, usable_size, payload_size, false)?;

    Ok((
        IndexInteriorCell {
            left_child,
            payload_size: payload_size as u64,
            local,
            overflow_page,
        },
        end,
    ))
}

/// Decodes one cell of the given shape, returning it and its encoded size.
pub fn decode_cell(kind: CellKind, data: &[u8], usable_size: usize) -> Result<(Cell<'_>, usize)> {
    Ok(match kind {
        CellKind::TableLeaf => {
            let (c, n) = decode_table_leaf_cell(data, usable_size)?;
            (Cell::TableLeaf(c), n)
        }
        CellKind::TableInterior => {
            let (c, n) = decode_table_interior_cell(data)?;
            (Cell::TableInterior(c), n)
        }
        CellKind::IndexLeaf => {
            let (c, n) = decode_index_leaf_cell(data, usable_size)?;
            (Cell::IndexLeaf(c), n)
        }
        CellKind::IndexInterior => {
            let (c, n) = decode_index_interior_cell(data, usable_size)?;
            (Cell::IndexInterior(c), n)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const USABLE: usize = 4096;

    #[test]
    fn local_payload_formula_leaf() {
        assert_eq!(max_local(USABLE, true), 4061);
        assert_eq!(calculate_local_payload_size(USABLE, 0, true), 0);
        assert_eq!(calculate_local_payload_size(USABLE, 4061, true), 4061);

        let min = min_local(USABLE);
        assert_eq!(min, 489);
        let p = 10_000;
        let surplus = min + (p - min) % (USABLE - 4);
        assert_eq!(calculate_local_payload_size(USABLE, p, true), surplus);
    }

    #[test]
    fn local_payload_formula_interior() {
        let max = max_local(USABLE, false);
        assert_eq!(max, 1002);
        assert_eq!(calculate_local_payload_size(USABLE, max, false), max);

        let local = calculate_local_payload_size(USABLE, 5000, false);
        assert!(local >= min_local(USABLE));
        assert!(local <= max);
    }

    #[test]
    fn local_payload_never_below_minimum() {
        for p in [4062usize, 5000, 8191, 65536, 1_000_000] {
            let local = calculate_local_payload_size(USABLE, p, true);
            assert!(local >= min_local(USABLE), "payload {}", p);
            assert!(local <= max_local(USABLE, true), "payload {}", p);
        }
    }

    #[test]
    fn table_leaf_roundtrip_small_and_empty() {
        for payload in [&b""[..], &b"Alice"[..]] {
            let cell = TableLeafCell {
                rowid: 42,
                payload_size: payload.len() as u64,
                local: payload,
                overflow_page: None,
            };
            let mut out = Vec::new();
            let n = encode_table_leaf_cell(&cell, USABLE, &mut out).unwrap();

            let (decoded, consumed) = decode_table_leaf_cell(&out, USABLE).unwrap();
            assert_eq!(decoded, cell);
            assert_eq!(consumed, n);
        }
    }

    #[test]
    fn table_leaf_roundtrip_page_sized_with_overflow() {
        let total = 9000usize;
        let local_len = calculate_local_payload_size(USABLE, total, true);
        let local = vec![7u8; local_len];
        let cell = TableLeafCell {
            rowid: -3,
            payload_size: total as u64,
            local: &local,
            overflow_page: Some(77),
        };

        let mut out = Vec::new();
        let n = encode_table_leaf_cell(&cell, USABLE, &mut out).unwrap();
        assert_eq!(n, 2 + 9 + local_len + 4);

        let (decoded, consumed) = decode_table_leaf_cell(&out, USABLE).unwrap();
        assert_eq!(decoded, cell);
        assert_eq!(consumed, n);
    }

    #[test]
    fn decoder_stops_at_declared_payload_with_trailing_bytes() {
        let cell = IndexLeafCell {
            payload_size: 3,
            local: b"abc",
            overflow_page: None,
        };
        let mut out = Vec::new();
        let n = encode_index_leaf_cell(&cell, USABLE, &mut out).unwrap();
        out.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef, 0x01]);

        let (decoded, consumed) = decode_index_leaf_cell(&out, USABLE).unwrap();
        assert_eq!(decoded.local, b"abc");
        assert_eq!(decoded.overflow_page, None);
        assert_eq!(consumed, n);
    }

    #[test]
    fn table_interior_roundtrip() {
        let cell = TableInteriorCell {
            left_child: 0x0102_0304,
            rowid: 1 << 40,
        };
        let mut out = Vec::new();
        let n = encode_table_interior_cell(&cell, &mut out);

        assert_eq!(&out[..4], &[1, 2, 3, 4]);
        let (decoded, consumed) = decode_table_interior_cell(&out).unwrap();
        assert_eq!(decoded, cell);
        assert_eq!(consumed, n);
    }

    #[test]
    fn index_interior_roundtrip_with_and_without_overflow() {
        let small = IndexInteriorCell {
            left_child: 5,
            payload_size: 4,
            local: b"key1",
            overflow_page: None,
        };
        let mut out = Vec::new();
        encode_index_interior_cell(&small, USABLE, &mut out).unwrap();
        assert_eq!(decode_index_interior_cell(&out, USABLE).unwrap().0, small);

        let total = 3000usize;
        let local = vec![1u8; calculate_local_payload_size(USABLE, total, false)];
        let big = IndexInteriorCell {
            left_child: 6,
            payload_size: total as u64,
            local: &local,
            overflow_page: Some(12),
        };
        out.clear();
        let n = encode_index_interior_cell(&big, USABLE, &mut out).unwrap();
        let (decoded, consumed) = decode_index_interior_cell(&out, USABLE).unwrap();
        assert_eq!(decoded, big);
        assert_eq!(consumed, n);
    }

    #[test]
    fn truncated_cells_are_rejected() {
        let cell = TableLeafCell {
            rowid: 1,
            payload_size: 10,
            local: b"0123456789",
            overflow_page: None,
        };
        let mut out = Vec::new();
        encode_table_leaf_cell(&cell, USABLE, &mut out).unwrap();

        for cut in 0..out.len() {
            let err = decode_table_leaf_cell(&out[..cut], USABLE).unwrap_err();
            assert!(err.to_string().contains("invalid cell format"), "cut {}", cut);
        }

        assert!(decode_table_interior_cell(&[0, 0, 1]).is_err());
    }

    #[test]
    fn missing_overflow_pointer_is_rejected() {
        let total = 9000usize;
        let local = vec![0u8; calculate_local_payload_size(USABLE, total, true)];
        let cell = IndexLeafCell {
            payload_size: total as u64,
            local: &local,
            overflow_page: None,
        };

        let err = encode_index_leaf_cell(&cell, USABLE, &mut Vec::new()).unwrap_err();
        assert!(err.to_string().contains("no overflow page"));
    }

    #[test]
    fn decode_cell_dispatches_on_kind() {
        let mut out = Vec::new();
        encode_table_interior_cell(
            &TableInteriorCell {
                left_child: 3,
                rowid: 9,
            },
            &mut out,
        );

        let (cell, _) = decode_cell(CellKind::TableInterior, &out, USABLE).unwrap();
        assert_eq!(cell.left_child(), Some(3));
        assert_eq!(cell.rowid(), Some(9));
        assert!(cell.payload().is_none());
    }
}
