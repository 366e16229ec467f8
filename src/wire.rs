//! Sized-byte-array framing.
//!
//! Format: `len[2, big-endian] || bytes[len]`, repeated. A well-formed buffer
//! is consumed exactly; a zero-length segment is legal.

use crate::error::{Error, Result};

/// Width of every length prefix.
pub const LEN_BYTES: usize = 2;

/// Largest encodable segment.
pub const MAX_SEGMENT_BYTES: usize = u16::MAX as usize;

/// Concatenate `parts` into a single sized-byte-array buffer.
///
/// Fails if any part exceeds [`MAX_SEGMENT_BYTES`].
pub fn encode(parts: &[&[u8]]) -> Result<Vec<u8>> {
    let mut total = 0;
    for part in parts {
        if part.len() > MAX_SEGMENT_BYTES {
            return Err(Error::SegmentOverflow { len: part.len() });
        }
        total += LEN_BYTES + part.len();
    }

    let mut out = Vec::with_capacity(total);
    for part in parts {
        out.extend_from_slice(&(part.len() as u16).to_be_bytes());
        out.extend_from_slice(part);
    }
    Ok(out)
}

/// Split a sized-byte-array buffer back into its segments.
///
/// Decode is total: every byte of `buf` must belong to a segment.
pub fn decode(buf: &[u8]) -> Result<Vec<Vec<u8>>> {
    let mut parts = Vec::new();
    let mut pos = 0;

    while pos < buf.len() {
        if pos + LEN_BYTES > buf.len() {
            return Err(Error::TruncatedSegment { index: pos });
        }
        // Widened unsigned; the upper 16 bits of the parsed length are zero.
        let size = u32::from(u16::from_be_bytes([buf[pos], buf[pos + 1]])) as usize;
        let start = pos + LEN_BYTES;
        if start + size > buf.len() {
            return Err(Error::SegmentTooLarge { size, index: start });
        }
        parts.push(buf[start..start + size].to_vec());
        pos = start + size;
    }
    Ok(parts)
}
