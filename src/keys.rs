//! TPM-resident key objects and the CFB key-wrap framing.
//!
//! Three kinds of keys back the hierarchy: a primary in the storage
//! hierarchy (parent only), a storage KEK gated by a PCR policy, and an
//! ephemeral KEK in the null hierarchy that is deterministically recreated
//! from its token list across process runs.

use std::sync::Arc;

use tracing::debug;
use zeroize::Zeroizing;

use crate::error::{Error, Result};
use crate::headers::{ConfigHeaders, KeyType, PcrHash};
use crate::tpm::{
    CreatedKey, Hierarchy, KeyAlgorithm, KeyHandle, KeyTemplate, ObjectAttributes, PcrSelection,
    PolicySession, RsaScheme, SensitiveCreate, TpmGateway, CFB_IV_BYTES,
};
use crate::wire;

/// Size of every data-encryption key handled by the wrap protocols.
pub const DEK_BYTES: usize = 32;

/// Size of the padded CFB wrap payload: the DEK plus random padding.
pub const WRAP_PAYLOAD_BYTES: usize = 64;

/// Token arity of an AES ephemeral key: iv, auth value, secret data.
pub const AES_EPHEMERAL_TOKENS: usize = 3;

/// Token arity of an RSA ephemeral key: auth value, secret data.
pub const RSA_EPHEMERAL_TOKENS: usize = 2;

const EPHEMERAL_AUTH_BYTES: usize = 32;
const RSA_EPHEMERAL_SECRET_BYTES: usize = 32;

// ---------------------------------------------------------------------------
// Templates
// ---------------------------------------------------------------------------

fn aes_primary_template(bits: u16) -> Result<KeyTemplate> {
    Ok(KeyTemplate {
        algorithm: KeyAlgorithm::AesCfb { bits },
        attributes: ObjectAttributes::RESTRICTED
            | ObjectAttributes::DECRYPT
            | ObjectAttributes::FIXED_TPM
            | ObjectAttributes::FIXED_PARENT
            | ObjectAttributes::USER_WITH_AUTH
            | ObjectAttributes::SENSITIVE_DATA_ORIGIN,
        auth_policy: Vec::new(),
        creation_pcr: Some(PcrSelection::new(PcrHash::Sha256, 0x01)?),
    })
}

fn rsa_primary_template(bits: u16) -> KeyTemplate {
    KeyTemplate {
        algorithm: KeyAlgorithm::Rsa {
            bits,
            scheme: RsaScheme::Null,
            sym_bits: Some(128),
        },
        attributes: ObjectAttributes::RESTRICTED
            | ObjectAttributes::DECRYPT
            | ObjectAttributes::FIXED_TPM
            | ObjectAttributes::FIXED_PARENT
            | ObjectAttributes::USER_WITH_AUTH
            | ObjectAttributes::NO_DA
            | ObjectAttributes::SENSITIVE_DATA_ORIGIN,
        auth_policy: Vec::new(),
        creation_pcr: None,
    }
}

fn storage_template(key_type: KeyType, auth_policy: Vec<u8>) -> KeyTemplate {
    let attributes = ObjectAttributes::SIGN_ENCRYPT
        | ObjectAttributes::DECRYPT
        | ObjectAttributes::FIXED_TPM
        | ObjectAttributes::FIXED_PARENT
        | ObjectAttributes::SENSITIVE_DATA_ORIGIN;
    let algorithm = if key_type.is_rsa() {
        KeyAlgorithm::Rsa {
            bits: key_type.bits(),
            scheme: RsaScheme::OaepSha256,
            sym_bits: None,
        }
    } else {
        KeyAlgorithm::AesCfb { bits: key_type.bits() }
    };
    KeyTemplate { algorithm, attributes, auth_policy, creation_pcr: None }
}

fn ephemeral_template(key_type: KeyType) -> KeyTemplate {
    let algorithm = if key_type.is_rsa() {
        KeyAlgorithm::Rsa {
            bits: key_type.bits(),
            scheme: RsaScheme::OaepSha256,
            sym_bits: None,
        }
    } else {
        KeyAlgorithm::AesCfb { bits: key_type.bits() }
    };
    KeyTemplate {
        algorithm,
        attributes: ObjectAttributes::SIGN_ENCRYPT
            | ObjectAttributes::DECRYPT
            | ObjectAttributes::FIXED_TPM
            | ObjectAttributes::FIXED_PARENT
            | ObjectAttributes::USER_WITH_AUTH,
        auth_policy: Vec::new(),
        creation_pcr: None,
    }
}

// ---------------------------------------------------------------------------
// CFB wrap framing
// ---------------------------------------------------------------------------

/// Pre/post-processing around a CFB-capable KEK.
///
/// Wrap: `dek || padding[32]` under a 16-byte non-zero IV, framed as
/// `encode([iv, ciphertext])`. The cipher itself is supplied by the caller,
/// so the same framing serves the policy-gated storage KEK and the
/// fixed-IV ephemeral KEK.
pub(crate) struct CfbWrapper<'a> {
    gateway: &'a TpmGateway,
    fixed_iv: Option<[u8; CFB_IV_BYTES]>,
}

impl<'a> CfbWrapper<'a> {
    pub fn fresh_iv(gateway: &'a TpmGateway) -> Self {
        Self { gateway, fixed_iv: None }
    }

    pub fn fixed_iv(gateway: &'a TpmGateway, iv: [u8; CFB_IV_BYTES]) -> Self {
        Self { gateway, fixed_iv: Some(iv) }
    }

    /// Draw 16 bytes from the TPM RNG until a non-zero vector appears.
    pub fn draw_nonzero_iv(gateway: &TpmGateway) -> Result<[u8; CFB_IV_BYTES]> {
        loop {
            let bytes = gateway.random_bytes(CFB_IV_BYTES)?;
            if bytes.iter().any(|&b| b != 0) {
                let mut iv = [0u8; CFB_IV_BYTES];
                iv.copy_from_slice(&bytes);
                return Ok(iv);
            }
        }
    }

    pub fn wrap(
        &self,
        dek: &[u8],
        cipher: impl FnOnce(&[u8; CFB_IV_BYTES], &[u8]) -> Result<Vec<u8>>,
    ) -> Result<Vec<u8>> {
        if dek.len() != DEK_BYTES {
            return Err(Error::InvalidKeyLength { expected: DEK_BYTES, actual: dek.len() });
        }
        let padding = Zeroizing::new(self.gateway.random_bytes(WRAP_PAYLOAD_BYTES - DEK_BYTES)?);
        let mut payload = Zeroizing::new(Vec::with_capacity(WRAP_PAYLOAD_BYTES));
        payload.extend_from_slice(dek);
        payload.extend_from_slice(&padding);

        let iv = match self.fixed_iv {
            Some(iv) => iv,
            None => Self::draw_nonzero_iv(self.gateway)?,
        };
        let ciphertext = cipher(&iv, &payload)?;
        wire::encode(&[iv.as_slice(), ciphertext.as_slice()])
    }

    pub fn unwrap(
        &self,
        wrapped: &[u8],
        cipher: impl FnOnce(&[u8; CFB_IV_BYTES], &[u8]) -> Result<Vec<u8>>,
    ) -> Result<Zeroizing<Vec<u8>>> {
        let parts = wire::decode(wrapped)
            .map_err(|e| Error::InvalidKeyFormat { cause: Some(Box::new(e)) })?;
        if parts.len() != 2 {
            return Err(Error::InvalidKeyFormat { cause: None });
        }
        let iv: [u8; CFB_IV_BYTES] = parts[0]
            .as_slice()
            .try_into()
            .map_err(|_| Error::InvalidKeyFormat { cause: None })?;

        let decrypted = Zeroizing::new(cipher(&iv, &parts[1])?);
        if decrypted.len() != WRAP_PAYLOAD_BYTES {
            return Err(Error::Crypto);
        }
        Ok(Zeroizing::new(decrypted[..DEK_BYTES].to_vec()))
    }
}

// ---------------------------------------------------------------------------
// Primary key
// ---------------------------------------------------------------------------

/// Storage-hierarchy primary. Serves only as the storage KEK's parent.
pub(crate) struct PrimaryKey {
    handle: KeyHandle,
}

impl PrimaryKey {
    pub fn create(gateway: &TpmGateway, key_type: KeyType) -> Result<Self> {
        let template = if key_type.is_rsa() {
            rsa_primary_template(key_type.bits())
        } else {
            aes_primary_template(key_type.bits())?
        };
        let handle =
            gateway.create_primary(Hierarchy::Owner, &template, &SensitiveCreate::default())?;
        debug!(key_type = key_type.name(), "created primary key");
        Ok(Self { handle })
    }

    pub fn handle(&self) -> KeyHandle {
        self.handle
    }

    pub fn flush(&self, gateway: &TpmGateway) -> Result<()> {
        gateway.flush_context(self.handle)
    }
}

// ---------------------------------------------------------------------------
// Storage KEK
// ---------------------------------------------------------------------------

/// Persistent storage KEK, gated by the configured PCR policy.
///
/// Its `{private, public}` blobs are the device tokens persisted in the
/// sealed file; loading them under the same primary on the same TPM with
/// matching PCR state reconstitutes the key.
pub(crate) struct StorageKey {
    handle: KeyHandle,
    key_type: KeyType,
    tokens: Vec<Vec<u8>>,
}

impl StorageKey {
    pub const TOKEN_COUNT: usize = 2;

    /// Create a fresh KEK under `primary`, inside a policy session whose
    /// digest becomes the key's `authPolicy`.
    pub fn create(
        gateway: &TpmGateway,
        primary: &PrimaryKey,
        headers: &ConfigHeaders,
    ) -> Result<Self> {
        let selection = PcrSelection::new(headers.pcr_hash, headers.pcr_selection)?;
        let session = PolicySession::start(gateway, &selection)?;
        let digest = session.policy_digest()?;
        let template = storage_template(headers.storage_key_type, digest);
        let created = gateway.create(primary.handle(), &template, Some(session.handle()))?;
        session.flush()?;

        let handle = gateway.load(primary.handle(), &created.private, &created.public)?;
        debug!(key_type = headers.storage_key_type.name(), "created storage KEK");
        let CreatedKey { private, public } = created;
        Ok(Self {
            handle,
            key_type: headers.storage_key_type,
            tokens: vec![private, public],
        })
    }

    /// Reconstitute the KEK from its persisted tokens.
    pub fn load(
        gateway: &TpmGateway,
        primary: &PrimaryKey,
        headers: &ConfigHeaders,
        tokens: &[Vec<u8>],
    ) -> Result<Self> {
        if tokens.len() != Self::TOKEN_COUNT {
            return Err(Error::InvalidTokenCount {
                expected: Self::TOKEN_COUNT,
                actual: tokens.len(),
            });
        }
        let handle = gateway.load(primary.handle(), &tokens[0], &tokens[1])?;
        debug!(key_type = headers.storage_key_type.name(), "loaded storage KEK");
        Ok(Self { handle, key_type: headers.storage_key_type, tokens: tokens.to_vec() })
    }

    pub fn tokens(&self) -> &[Vec<u8>] {
        &self.tokens
    }

    pub fn wrap(
        &self,
        gateway: &TpmGateway,
        selection: &PcrSelection,
        dek: &[u8],
    ) -> Result<Vec<u8>> {
        if self.key_type.is_rsa() {
            if dek.len() != DEK_BYTES {
                return Err(Error::InvalidKeyLength { expected: DEK_BYTES, actual: dek.len() });
            }
            // Public-key operation; no policy session required.
            return gateway.rsa_encrypt(self.handle, dek);
        }
        CfbWrapper::fresh_iv(gateway).wrap(dek, |iv, payload| {
            let session = PolicySession::start(gateway, selection)?;
            let out =
                gateway.encrypt_decrypt(self.handle, false, iv, payload, Some(session.handle()))?;
            session.flush()?;
            Ok(out)
        })
    }

    pub fn unwrap(
        &self,
        gateway: &TpmGateway,
        selection: &PcrSelection,
        wrapped: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>> {
        if self.key_type.is_rsa() {
            let session = PolicySession::start(gateway, selection)?;
            let out = Zeroizing::new(gateway.rsa_decrypt(
                self.handle,
                wrapped,
                Some(session.handle()),
            )?);
            session.flush()?;
            if out.len() != DEK_BYTES {
                return Err(Error::Crypto);
            }
            return Ok(out);
        }
        CfbWrapper::fresh_iv(gateway).unwrap(wrapped, |iv, data| {
            let session = PolicySession::start(gateway, selection)?;
            let out =
                gateway.encrypt_decrypt(self.handle, true, iv, data, Some(session.handle()))?;
            session.flush()?;
            Ok(out)
        })
    }

    pub fn flush(&self, gateway: &TpmGateway) -> Result<()> {
        gateway.flush_context(self.handle)
    }
}

// ---------------------------------------------------------------------------
// Ephemeral KEK
// ---------------------------------------------------------------------------

/// Null-hierarchy KEK. Its authority vanishes with a TPM reset; within a
/// process run the same token list always recreates the same key.
pub(crate) struct EphemeralKey {
    handle: KeyHandle,
    key_type: KeyType,
    tokens: Arc<Vec<Vec<u8>>>,
}

impl EphemeralKey {
    /// Draw fresh tokens from the TPM RNG and create the key.
    pub fn create(gateway: &TpmGateway, key_type: KeyType) -> Result<Self> {
        let tokens = if key_type.is_rsa() {
            vec![
                gateway.random_bytes(EPHEMERAL_AUTH_BYTES)?,
                gateway.random_bytes(RSA_EPHEMERAL_SECRET_BYTES)?,
            ]
        } else {
            // The wrap IV is fixed for the key's lifetime; draw it through
            // the same non-zero loop as per-wrap IVs.
            vec![
                CfbWrapper::draw_nonzero_iv(gateway)?.to_vec(),
                gateway.random_bytes(EPHEMERAL_AUTH_BYTES)?,
                gateway.random_bytes(usize::from(key_type.bits() / 8))?,
            ]
        };
        Self::from_tokens(gateway, key_type, Arc::new(tokens))
    }

    /// Recreate the key from an existing token list.
    pub fn from_tokens(
        gateway: &TpmGateway,
        key_type: KeyType,
        tokens: Arc<Vec<Vec<u8>>>,
    ) -> Result<Self> {
        let expected = if key_type.is_rsa() { RSA_EPHEMERAL_TOKENS } else { AES_EPHEMERAL_TOKENS };
        if tokens.len() != expected {
            return Err(Error::InvalidTokenCount { expected, actual: tokens.len() });
        }
        let (auth_value, secret_data) = if key_type.is_rsa() {
            (tokens[0].clone(), tokens[1].clone())
        } else {
            (tokens[1].clone(), tokens[2].clone())
        };
        let sensitive = SensitiveCreate { auth_value, secret_data };
        let template = ephemeral_template(key_type);
        let handle = gateway.create_primary(Hierarchy::Null, &template, &sensitive)?;
        debug!(key_type = key_type.name(), "created ephemeral KEK");
        Ok(Self { handle, key_type, tokens })
    }

    pub fn tokens(&self) -> Arc<Vec<Vec<u8>>> {
        Arc::clone(&self.tokens)
    }

    fn wrap_iv(&self) -> Result<[u8; CFB_IV_BYTES]> {
        self.tokens[0].as_slice().try_into().map_err(|_| Error::InvalidKeyLength {
            expected: CFB_IV_BYTES,
            actual: self.tokens[0].len(),
        })
    }

    pub fn wrap(&self, gateway: &TpmGateway, dek: &[u8]) -> Result<Vec<u8>> {
        if self.key_type.is_rsa() {
            if dek.len() != DEK_BYTES {
                return Err(Error::InvalidKeyLength { expected: DEK_BYTES, actual: dek.len() });
            }
            return gateway.rsa_encrypt(self.handle, dek);
        }
        CfbWrapper::fixed_iv(gateway, self.wrap_iv()?).wrap(dek, |iv, payload| {
            gateway.encrypt_decrypt(self.handle, false, iv, payload, None)
        })
    }

    pub fn unwrap(&self, gateway: &TpmGateway, wrapped: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        if self.key_type.is_rsa() {
            let out = Zeroizing::new(gateway.rsa_decrypt(self.handle, wrapped, None)?);
            if out.len() != DEK_BYTES {
                return Err(Error::Crypto);
            }
            return Ok(out);
        }
        CfbWrapper::fixed_iv(gateway, self.wrap_iv()?).unwrap(wrapped, |iv, data| {
            gateway.encrypt_decrypt(self.handle, true, iv, data, None)
        })
    }

    pub fn flush(&self, gateway: &TpmGateway) -> Result<()> {
        gateway.flush_context(self.handle)
    }
}
