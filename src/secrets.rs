//! Secrets orchestration: sealing, reopening, and session decryption.
//!
//! On first parse the manager encrypts each value under an ephemeral DEK for
//! in-memory residency, serializes the padded name/value list, storage-wraps
//! it under a persistent DEK, and emits the sealed blob. Reopening reverses
//! the storage wrap and rebuilds the in-memory map under a fresh ephemeral
//! DEK. Secret names stay in cleartext in memory for lookup; values never
//! do.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::blob::EncryptedBlob;
use crate::dek::{HostDek, ResolvedDek, SEED_SIZE};
use crate::device::DeviceFactory;
use crate::error::{Error, Result};
use crate::headers::ConfigHeaders;
use crate::{padding, wire};

/// A sealed collection of named secrets bound to a device factory.
pub struct Manager {
    headers: ConfigHeaders,
    blob: EncryptedBlob,
    factory: Arc<dyn DeviceFactory>,
    ephemeral: HostDek,
    secrets: HashMap<String, Vec<u8>>,
}

impl fmt::Debug for Manager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Manager")
            .field("headers", &self.headers)
            .field("secrets", &self.secrets.len())
            .finish_non_exhaustive()
    }
}

impl Manager {
    /// First-run ingest: encrypt `entries` and produce the sealed blob.
    pub(crate) fn seal(
        headers: ConfigHeaders,
        entries: &[(String, Zeroizing<String>)],
        factory: Arc<dyn DeviceFactory>,
    ) -> Result<Self> {
        let opened = factory.open(&headers, None)?;
        let device = opened.device;

        let ephemeral = HostDek::generate_new(true, &device, None)?;
        let resolved_ephemeral = ephemeral.resolve(&device)?;

        let seed = device.random_bytes(SEED_SIZE)?;
        let persistent = HostDek::generate_new(false, &device, Some(&seed))?;
        let resolved_persistent = persistent.resolve(&device)?;

        let mut secrets = HashMap::with_capacity(entries.len());
        let mut framed: Vec<Zeroizing<Vec<u8>>> = Vec::with_capacity(entries.len() * 2);
        for (name, value) in entries {
            let padded_name = padding::pad(name.as_bytes());
            let padded_value = padding::pad(value.as_bytes());
            secrets.insert(name.clone(), resolved_ephemeral.encrypt(&padded_value)?);
            framed.push(padded_name);
            framed.push(padded_value);
        }

        let parts: Vec<&[u8]> = framed.iter().map(|p| p.as_slice()).collect();
        let serialized = Zeroizing::new(wire::encode(&parts)?);
        let cipher_data = resolved_persistent.encrypt(&serialized)?;

        let blob = EncryptedBlob {
            seed,
            encrypted_key: persistent.wrapped().to_vec(),
            cipher_data,
            device_tokens: opened.tokens,
        };
        device.close()?;
        info!(secrets = secrets.len(), "sealed configuration");
        Ok(Self { headers, blob, factory, ephemeral, secrets })
    }

    /// Reopen a sealed blob: reconstitute the persistent DEK, decrypt the
    /// secret list, and rebuild the in-memory map under a fresh ephemeral
    /// DEK.
    pub(crate) fn reopen(
        headers: ConfigHeaders,
        blob: EncryptedBlob,
        factory: Arc<dyn DeviceFactory>,
    ) -> Result<Self> {
        let opened = factory.open(&headers, Some(&blob.device_tokens))?;
        let device = opened.device;

        let persistent = HostDek::from_parts(false, blob.encrypted_key.clone(), &blob.seed)?;
        let resolved_persistent = persistent.resolve(&device)?;
        let serialized = resolved_persistent.decrypt(&blob.cipher_data)?;

        let parts: Vec<Zeroizing<Vec<u8>>> =
            wire::decode(&serialized)?.into_iter().map(Zeroizing::new).collect();
        if parts.len() % 2 != 0 {
            return Err(Error::UnevenSecretList);
        }

        let ephemeral = HostDek::generate_new(true, &device, None)?;
        let resolved_ephemeral = ephemeral.resolve(&device)?;

        let mut secrets = HashMap::with_capacity(parts.len() / 2);
        for pair in parts.chunks_exact(2) {
            let name_bytes = padding::strip(&pair[0])?;
            let name = std::str::from_utf8(&name_bytes).map_err(|_| Error::Utf8)?.to_owned();
            secrets.insert(name, resolved_ephemeral.encrypt(&pair[1])?);
        }

        device.close()?;
        debug!(secrets = secrets.len(), "reopened sealed configuration");
        Ok(Self { headers, blob, factory, ephemeral, secrets })
    }

    /// The headers this collection was sealed under.
    pub fn headers(&self) -> ConfigHeaders {
        self.headers
    }

    /// The persisted sealed representation.
    pub fn encrypted_data(&self) -> &EncryptedBlob {
        &self.blob
    }

    /// Open a decryption session: resolves the ephemeral DEK through the
    /// device, then releases the device. The resolved key lives exactly as
    /// long as the returned session.
    pub fn start_data_access_session(&self) -> Result<DataAccessSession<'_>> {
        let opened = self.factory.open(&self.headers, Some(&self.blob.device_tokens))?;
        let resolved = self.ephemeral.resolve(&opened.device)?;
        opened.device.close()?;
        Ok(DataAccessSession { manager: self, resolved })
    }
}

/// Scoped access to decrypted secret values.
///
/// Dropping the session zeroes the resolved key material.
pub struct DataAccessSession<'a> {
    manager: &'a Manager,
    resolved: ResolvedDek,
}

impl DataAccessSession<'_> {
    /// Decrypt one secret by name.
    ///
    /// Unknown names fail with the uniform "Key not found"; the message
    /// never echoes the queried name.
    pub fn decrypt(&self, name: &str) -> Result<Zeroizing<String>> {
        let ciphertext = self.manager.secrets.get(name).ok_or(Error::KeyNotFound)?;
        let padded = self.resolved.decrypt(ciphertext)?;
        let stripped = padding::strip(&padded)?;
        let text = std::str::from_utf8(&stripped).map_err(|_| Error::Utf8)?;
        Ok(Zeroizing::new(text.to_owned()))
    }
}
