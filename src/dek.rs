//! Host-side data-encryption keys.
//!
//! A [`HostDek`] holds a DEK only in device-wrapped form plus the AES-GCM
//! iv/aad derived from its 64-byte seed. Resolving it yields a
//! [`ResolvedDek`], the only place cleartext key bytes live on the host;
//! the buffer is zeroed when the scope ends.

use zeroize::Zeroizing;

use crate::aead;
use crate::device::Device;
use crate::error::{Error, Result};

pub const KEY_SIZE: usize = aead::KEY_BYTES;
pub const SEED_SIZE: usize = 64;
pub const IV_SIZE: usize = aead::IV_BYTES;

const AAD_SIZE: usize = SEED_SIZE - IV_SIZE;
const ZERO_PREFIX_BYTES: usize = 16;

/// A wrapped DEK and its seed-derived GCM parameters.
pub(crate) struct HostDek {
    is_ephemeral: bool,
    wrapped: Vec<u8>,
    iv: [u8; IV_SIZE],
    aad: [u8; AAD_SIZE],
}

impl HostDek {
    /// Generate a fresh DEK on the device and wrap it.
    ///
    /// Without a caller seed, one is drawn from the device RNG. Candidate
    /// DEKs whose first 16 bytes are all zero are discarded and redrawn;
    /// the behavior is preserved for reproducibility, not as a security
    /// property.
    pub fn generate_new(is_ephemeral: bool, device: &Device, seed: Option<&[u8]>) -> Result<Self> {
        let drawn;
        let seed = match seed {
            Some(seed) => seed,
            None => {
                drawn = device.random_bytes(SEED_SIZE)?;
                &drawn
            }
        };
        let dek = Self::draw_dek(device)?;
        let wrapped = if is_ephemeral {
            device.wrap_ephemeral(&dek)?
        } else {
            device.wrap_persistent(&dek)?
        };
        Self::from_parts(is_ephemeral, wrapped, seed)
    }

    /// Reassemble a DEK from its persisted parts. No TPM call is made.
    pub fn from_parts(is_ephemeral: bool, wrapped: Vec<u8>, seed: &[u8]) -> Result<Self> {
        if seed.len() != SEED_SIZE {
            return Err(Error::InvalidSeedLength(seed.len()));
        }
        let mut iv = [0u8; IV_SIZE];
        iv.copy_from_slice(&seed[..IV_SIZE]);
        let mut aad = [0u8; AAD_SIZE];
        aad.copy_from_slice(&seed[IV_SIZE..]);
        Ok(Self { is_ephemeral, wrapped, iv, aad })
    }

    fn draw_dek(device: &Device) -> Result<Zeroizing<Vec<u8>>> {
        loop {
            let dek = Zeroizing::new(device.random_bytes(KEY_SIZE)?);
            if dek[..ZERO_PREFIX_BYTES].iter().any(|&b| b != 0) {
                return Ok(dek);
            }
        }
    }

    pub fn wrapped(&self) -> &[u8] {
        &self.wrapped
    }

    /// Unwrap into a short-lived cleartext key scope.
    pub fn resolve(&self, device: &Device) -> Result<ResolvedDek> {
        let unwrapped = if self.is_ephemeral {
            device.unwrap_ephemeral(&self.wrapped)?
        } else {
            device.unwrap_persistent(&self.wrapped)?
        };
        if unwrapped.len() != KEY_SIZE {
            return Err(Error::Crypto);
        }
        let mut key = Zeroizing::new([0u8; KEY_SIZE]);
        key.copy_from_slice(&unwrapped);
        Ok(ResolvedDek { key, iv: self.iv, aad: self.aad })
    }
}

/// Cleartext DEK held for the minimum window. Zeroed on drop.
pub struct ResolvedDek {
    key: Zeroizing<[u8; KEY_SIZE]>,
    iv: [u8; IV_SIZE],
    aad: [u8; AAD_SIZE],
}

impl ResolvedDek {
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        aead::seal(&self.key, &self.iv, plaintext, &self.aad)
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        Ok(Zeroizing::new(aead::open(&self.key, &self.iv, ciphertext, &self.aad)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iv_and_aad_split_the_seed() {
        let seed: Vec<u8> = (0..SEED_SIZE as u8).collect();
        let dek = HostDek::from_parts(false, vec![1, 2, 3], &seed).unwrap();
        assert_eq!(&dek.iv[..], &seed[..IV_SIZE]);
        assert_eq!(&dek.aad[..], &seed[IV_SIZE..]);
        assert_eq!(dek.wrapped(), &[1, 2, 3]);
    }

    #[test]
    fn short_or_long_seed_is_rejected() {
        assert!(matches!(
            HostDek::from_parts(true, Vec::new(), &[0u8; 63]),
            Err(Error::InvalidSeedLength(63))
        ));
        assert!(matches!(
            HostDek::from_parts(true, Vec::new(), &[0u8; 65]),
            Err(Error::InvalidSeedLength(65))
        ));
    }
}
