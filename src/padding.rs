//! PKCS#7 padding with a 32-byte block.
//!
//! Padding is always added: input already aligned to the block gets a full
//! block of `0x20` appended.

use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::error::{Error, Result};

pub const BLOCK_BYTES: usize = 32;

/// Pad `data` to the next multiple of [`BLOCK_BYTES`].
pub fn pad(data: &[u8]) -> Zeroizing<Vec<u8>> {
    let pad_len = BLOCK_BYTES - data.len() % BLOCK_BYTES;
    let mut out = Zeroizing::new(Vec::with_capacity(data.len() + pad_len));
    out.extend_from_slice(data);
    out.extend(std::iter::repeat(pad_len as u8).take(pad_len));
    out
}

/// Verify and remove the padding. Every pad byte must equal the pad length.
pub fn strip(data: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    if data.is_empty() || data.len() % BLOCK_BYTES != 0 {
        return Err(Error::InvalidPadding);
    }
    let pad_len = data[data.len() - 1] as usize;
    if pad_len == 0 || pad_len > BLOCK_BYTES {
        return Err(Error::InvalidPadding);
    }
    let (body, pad) = data.split_at(data.len() - pad_len);
    let expected = [pad_len as u8; BLOCK_BYTES];
    if pad.ct_eq(&expected[..pad_len]).unwrap_u8() != 1 {
        return Err(Error::InvalidPadding);
    }
    Ok(Zeroizing::new(body.to_vec()))
}
