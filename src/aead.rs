//! AEAD: AES-256-GCM

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};

use crate::error::{Error, Result};

pub const KEY_BYTES: usize = 32;
pub const IV_BYTES: usize = 12;
pub const TAG_BYTES: usize = 16;

/// AEAD seal. Returns `ciphertext || tag`.
pub fn seal(
    key: &[u8; KEY_BYTES],
    iv: &[u8; IV_BYTES],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| Error::Crypto)?;
    let payload = Payload { msg: plaintext, aad };
    cipher
        .encrypt(Nonce::from_slice(iv), payload)
        .map_err(|_| Error::Crypto)
}

/// AEAD open. A tag mismatch surfaces as the opaque [`Error::Crypto`].
pub fn open(
    key: &[u8; KEY_BYTES],
    iv: &[u8; IV_BYTES],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| Error::Crypto)?;
    let payload = Payload { msg: ciphertext, aad };
    cipher
        .decrypt(Nonce::from_slice(iv), payload)
        .map_err(|_| Error::Crypto)
}
