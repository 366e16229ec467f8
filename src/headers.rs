//! Configuration headers: key algorithms and the PCR policy parameters.

use std::hash::{Hash, Hasher};

use crate::error::{Error, Result};

/// Upper bound of the 24-bit PCR selection mask.
pub const PCR_SELECTION_MAX: u32 = 0x00FF_FFFF;

/// Algorithm of a TPM-resident key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum KeyType {
    Aes128,
    Aes256,
    Rsa1024,
    Rsa2048,
}

impl KeyType {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Aes128 => "AES128",
            Self::Aes256 => "AES256",
            Self::Rsa1024 => "RSA1024",
            Self::Rsa2048 => "RSA2048",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "AES128" => Some(Self::Aes128),
            "AES256" => Some(Self::Aes256),
            "RSA1024" => Some(Self::Rsa1024),
            "RSA2048" => Some(Self::Rsa2048),
            _ => None,
        }
    }

    pub fn is_rsa(&self) -> bool {
        matches!(self, Self::Rsa1024 | Self::Rsa2048)
    }

    /// Key size in bits.
    pub fn bits(&self) -> u16 {
        match self {
            Self::Aes128 => 128,
            Self::Aes256 => 256,
            Self::Rsa1024 => 1024,
            Self::Rsa2048 => 2048,
        }
    }
}

/// Hash bank of the PCR selection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PcrHash {
    Sha1,
    Sha256,
}

impl PcrHash {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Sha1 => "SHA1",
            Self::Sha256 => "SHA256",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "SHA1" => Some(Self::Sha1),
            "SHA256" => Some(Self::Sha256),
            _ => None,
        }
    }

    /// TPM_ALG_ID of the bank.
    pub fn tpm_alg_id(&self) -> u16 {
        match self {
            Self::Sha1 => 0x0004,
            Self::Sha256 => 0x000B,
        }
    }
}

/// The five scalar headers of a configuration.
///
/// Equality and hashing ignore `ephemeral_key_type`: the ephemeral choice
/// never partitions persistent state, so two header records differing only
/// there address the same sealed data.
#[derive(Clone, Copy, Debug, Eq)]
pub struct ConfigHeaders {
    pub primary_key_type: KeyType,
    pub storage_key_type: KeyType,
    pub ephemeral_key_type: KeyType,
    pub pcr_selection: u32,
    pub pcr_hash: PcrHash,
}

impl Default for ConfigHeaders {
    fn default() -> Self {
        Self {
            primary_key_type: KeyType::Aes256,
            storage_key_type: KeyType::Aes256,
            ephemeral_key_type: KeyType::Aes256,
            pcr_selection: 0x10000,
            pcr_hash: PcrHash::Sha256,
        }
    }
}

impl PartialEq for ConfigHeaders {
    fn eq(&self, other: &Self) -> bool {
        self.primary_key_type == other.primary_key_type
            && self.storage_key_type == other.storage_key_type
            && self.pcr_selection == other.pcr_selection
            && self.pcr_hash == other.pcr_hash
    }
}

impl Hash for ConfigHeaders {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.primary_key_type.hash(state);
        self.storage_key_type.hash(state);
        self.pcr_selection.hash(state);
        self.pcr_hash.hash(state);
    }
}

impl ConfigHeaders {
    /// Check the PCR selection against its 24-bit range.
    pub fn validate(&self) -> Result<()> {
        if self.pcr_selection == 0 || self.pcr_selection > PCR_SELECTION_MAX {
            return Err(Error::InvalidPcrSelection(self.pcr_selection));
        }
        Ok(())
    }
}
