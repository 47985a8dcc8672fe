//! # Variable-Length Integer Encoding
//!
//! Big-endian base-128 varints as used by the B-tree file format for payload
//! sizes and rowids.
//!
//! ## Encoding Format
//!
//! ```text
//! Bytes 1..8: 7 payload bits each, MSB set when another byte follows
//! Byte  9:    all 8 bits are payload (no continuation bit)
//! ```
//!
//! | Value Range (as u64)        | Bytes |
//! |-----------------------------|-------|
//! | 0 - 127                     | 1     |
//! | 128 - 16383                 | 2     |
//! | 16384 - 2097151             | 3     |
//! | ...                         | ...   |
//! | 2^49 - 2^56-1               | 8     |
//! | 2^56 - u64::MAX             | 9     |
//!
//! Signed values are encoded through their two's-complement bit pattern, so
//! every negative value takes the full 9 bytes.
//!
//! ## Lenient vs Strict Decoding
//!
//! - `get_varint` never fails: an empty or truncated buffer yields `(0, 0)`.
//!   Callers treat a zero byte count as truncation.
//! - `read_varint` is the strict form used by the cell codec; truncation is
//!   an `InvalidCell` error.
//!
//! ## Boundary Values
//!
//! - 127 / 128: 1 to 2 bytes
//! - 16383 / 16384: 2 to 3 bytes
//! - 2^56 - 1 / 2^56: 8 to 9 bytes
//! - -1, i64::MIN, i64::MAX: 9 bytes

use eyre::{bail, Result};

use crate::error::StorageError;

/// Longest possible encoding.
pub const MAX_VARINT_LEN: usize = 9;

const NINE_BYTE_THRESHOLD: u64 = 1 << 56;

pub fn varint_len(value: i64) -> usize {
    let v = value as u64;
    if v >= NINE_BYTE_THRESHOLD {
        return MAX_VARINT_LEN;
    }
    let bits = 64 - v.leading_zeros() as usize;
    bits.div_ceil(7).max(1)
}

/// Writes `value` into `buf` and returns the number of bytes written.
///
/// `buf` must hold at least `varint_len(value)` bytes.
pub fn put_varint(buf: &mut [u8], value: i64) -> usize {
    let mut v = value as u64;

    if v >= NINE_BYTE_THRESHOLD {
        buf[8] = v as u8;
        v >>= 8;
        for i in (0..8).rev() {
            buf[i] = ((v & 0x7f) as u8) | 0x80;
            v >>= 7;
        }
        return MAX_VARINT_LEN;
    }

    let len = varint_len(value);
    for i in (0..len).rev() {
        let continuation = if i == len - 1 { 0 } else { 0x80 };
        buf[i] = ((v & 0x7f) as u8) | continuation;
        v >>= 7;
    }
    len
}

/// Appends the encoding of `value` to `out`.
pub fn append_varint(out: &mut Vec<u8>, value: i64) -> usize {
    let mut tmp = [0u8; MAX_VARINT_LEN];
    let n = put_varint(&mut tmp, value);
    out.extend_from_slice(&tmp[..n]);
    n
}

/// Decodes a varint; returns `(0, 0)` for an empty or truncated buffer.
pub fn get_varint(buf: &[u8]) -> (i64, usize) {
    let mut v: u64 = 0;

    for (i, &byte) in buf.iter().take(8).enumerate() {
        v = (v << 7) | (byte & 0x7f) as u64;
        if byte & 0x80 == 0 {
            return (v as i64, i + 1);
        }
    }

    match buf.get(8) {
        Some(&last) => {
            v = (v << 8) | last as u64;
            (v as i64, MAX_VARINT_LEN)
        }
        _ => (0, 0),
    }
}

/// Strict decode: fails with `InvalidCell` on empty or truncated input.
pub fn read_varint(buf: &[u8]) -> Result<(i64, usize)> {
    let (value, n) = get_varint(buf);
    if n == 0 {
        bail!(StorageError::InvalidCell("truncated varint"));
    }
    Ok((value, n))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(value: i64) -> usize {
        let mut buf = [0u8; MAX_VARINT_LEN];
        let written = put_varint(&mut buf, value);
        let (decoded, read) = get_varint(&buf[..written]);

        assert_eq!(decoded, value, "roundtrip failed for {}", value);
        assert_eq!(read, written, "length mismatch for {}", value);
        assert_eq!(varint_len(value), written, "varint_len mismatch for {}", value);
        written
    }

    #[test]
    fn single_byte_boundary() {
        assert_eq!(roundtrip(0), 1);
        assert_eq!(roundtrip(1), 1);
        assert_eq!(roundtrip(127), 1);
        assert_eq!(roundtrip(128), 2);
    }

    #[test]
    fn two_and_three_byte_boundary() {
        assert_eq!(roundtrip(16383), 2);
        assert_eq!(roundtrip(16384), 3);
        assert_eq!(roundtrip(2_097_151), 3);
        assert_eq!(roundtrip(2_097_152), 4);
    }

    #[test]
    fn eight_and_nine_byte_boundary() {
        assert_eq!(roundtrip((1i64 << 56) - 1), 8);
        assert_eq!(roundtrip(1i64 << 56), 9);
    }

    #[test]
    fn negative_values_take_nine_bytes() {
        assert_eq!(roundtrip(-1), 9);
        assert_eq!(roundtrip(i64::MIN), 9);
        assert_eq!(roundtrip(-42), 9);
    }

    #[test]
    fn extremes_roundtrip() {
        assert_eq!(roundtrip(i64::MAX), 9);
        for shift in 0..63 {
            roundtrip(1i64 << shift);
            roundtrip((1i64 << shift) - 1);
        }
    }

    #[test]
    fn known_encodings() {
        let mut buf = [0u8; MAX_VARINT_LEN];

        assert_eq!(put_varint(&mut buf, 128), 2);
        assert_eq!(&buf[..2], &[0x81, 0x00]);

        assert_eq!(put_varint(&mut buf, 300), 2);
        assert_eq!(&buf[..2], &[0x82, 0x2c]);

        assert_eq!(put_varint(&mut buf, -1), 9);
        assert_eq!(buf, [0xff; 9]);
    }

    #[test]
    fn empty_buffer_decodes_to_zero_zero() {
        assert_eq!(get_varint(&[]), (0, 0));
    }

    #[test]
    fn truncated_buffer_decodes_to_zero_zero() {
        assert_eq!(get_varint(&[0x81]), (0, 0));
        assert_eq!(get_varint(&[0xff; 8]), (0, 0));
    }

    #[test]
    fn decode_ignores_trailing_bytes() {
        assert_eq!(get_varint(&[0x05, 0xff, 0xff]), (5, 1));
    }

    #[test]
    fn strict_decode_rejects_truncation() {
        let err = read_varint(&[0x80]).unwrap_err();

        assert!(err.to_string().contains("invalid cell format"));
        assert!(read_varint(&[]).is_err());
    }

    #[test]
    fn append_varint_extends_buffer() {
        let mut out = vec![0xaa];
        let n = append_varint(&mut out, 16384);

        assert_eq!(n, 3);
        assert_eq!(out.len(), 4);
        assert_eq!(get_varint(&out[1..]), (16384, 3));
    }
}
