//! In-memory TPM transport.
//!
//! Backs the test suite; not a supported deployment. The stub honors the
//! behaviors the key hierarchy depends on: deterministic owner-hierarchy
//! primaries (a real chip derives primaries from its hierarchy seed),
//! deterministic null-hierarchy keys from caller sensitive data, private
//! blobs that only load under the parent that created them, policy
//! enforcement on gated commands, and the 48-byte `GetRandom` cap.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use aes::{Aes128, Aes256};
use cfb_mode::cipher::{AsyncStreamCipher, KeyIvInit};
use rand::rngs::{OsRng, StdRng};
use rand::SeedableRng;
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey};
use rsa::{Oaep, RsaPrivateKey};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::error::{Error, Result};
use crate::tpm::{
    CreatedKey, Hierarchy, KeyAlgorithm, KeyHandle, KeyTemplate, PcrSelection, SensitiveCreate,
    SessionHandle, TpmHandle, TpmTransport, CFB_IV_BYTES, MAX_RANDOM_BYTES, POLICY_NONCE_BYTES,
};
use crate::{aead, wire};

type Aes128CfbEnc = cfb_mode::Encryptor<Aes128>;
type Aes128CfbDec = cfb_mode::Decryptor<Aes128>;
type Aes256CfbEnc = cfb_mode::Encryptor<Aes256>;
type Aes256CfbDec = cfb_mode::Decryptor<Aes256>;

const PRIVATE_BLOB_TAG_AES: &[u8] = b"A";
const PRIVATE_BLOB_TAG_RSA: &[u8] = b"R";

// ---------------------------------------------------------------------------
// Observability
// ---------------------------------------------------------------------------

/// Atomic counters tests use to assert handle hygiene.
#[derive(Debug, Default)]
pub struct SoftTpmStats {
    pub sessions_started: AtomicUsize,
    pub sessions_flushed: AtomicUsize,
    pub objects_loaded: AtomicUsize,
    pub objects_flushed: AtomicUsize,
    pub random_calls: AtomicUsize,
}

impl SoftTpmStats {
    pub fn outstanding_sessions(&self) -> usize {
        self.sessions_started.load(Ordering::SeqCst) - self.sessions_flushed.load(Ordering::SeqCst)
    }

    pub fn outstanding_objects(&self) -> usize {
        self.objects_loaded.load(Ordering::SeqCst) - self.objects_flushed.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

enum SoftKeyMaterial {
    Aes(Zeroizing<Vec<u8>>),
    Rsa(Box<RsaPrivateKey>),
}

struct SoftKey {
    material: SoftKeyMaterial,
    auth_policy: Vec<u8>,
}

struct SoftSession {
    digest: Vec<u8>,
}

pub struct SoftTpm {
    keys: HashMap<u32, SoftKey>,
    sessions: HashMap<u32, SoftSession>,
    next_handle: u32,
    /// Simulated hierarchy seed; identical instances model the same chip.
    owner_seed: [u8; 32],
    /// Simulated digest of the PCR banks.
    pcr_digest: [u8; 32],
    stats: Arc<SoftTpmStats>,
    closed: bool,
}

impl Default for SoftTpm {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftTpm {
    pub fn new() -> Self {
        let owner_seed = Sha256::digest(b"letsconfide soft tpm owner hierarchy seed").into();
        let pcr_digest = Sha256::digest(b"letsconfide soft tpm pcr bank").into();
        Self {
            keys: HashMap::new(),
            sessions: HashMap::new(),
            next_handle: 0x8000_0001,
            owner_seed,
            pcr_digest,
            stats: Arc::new(SoftTpmStats::default()),
            closed: false,
        }
    }

    /// A chip with a different hierarchy seed: blobs sealed elsewhere will
    /// not load here.
    pub fn with_owner_seed(owner_seed: [u8; 32]) -> Self {
        Self { owner_seed, ..Self::new() }
    }

    /// Simulate different platform measurement state.
    pub fn with_pcr_digest(pcr_digest: [u8; 32]) -> Self {
        Self { pcr_digest, ..Self::new() }
    }

    /// Counter handle; clone before boxing the transport into a factory.
    pub fn stats(&self) -> Arc<SoftTpmStats> {
        Arc::clone(&self.stats)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::Device("transport is closed".into()));
        }
        Ok(())
    }

    fn take_handle(&mut self) -> u32 {
        let handle = self.next_handle;
        self.next_handle += 1;
        handle
    }

    fn key(&self, handle: KeyHandle) -> Result<&SoftKey> {
        self.keys
            .get(&handle.0)
            .ok_or_else(|| Error::Device(format!("unknown key handle {:#x}", handle.0)))
    }

    fn draw(&self, count: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; count];
        getrandom::getrandom(&mut buf)
            .map_err(|e| Error::Device(format!("entropy source: {}", e)))?;
        Ok(buf)
    }

    /// Require a matching policy session when the key carries an authPolicy.
    fn check_policy(&self, auth_policy: &[u8], session: Option<SessionHandle>) -> Result<()> {
        if auth_policy.is_empty() {
            return Ok(());
        }
        let handle = session.ok_or_else(|| Error::Device("policy session required".into()))?;
        let session = self
            .sessions
            .get(&handle.0)
            .ok_or_else(|| Error::Device(format!("unknown session handle {:#x}", handle.0)))?;
        if session.digest != auth_policy {
            return Err(Error::Device("policy digest does not satisfy authPolicy".into()));
        }
        Ok(())
    }

    fn template_fingerprint(template: &KeyTemplate) -> [u8; 32] {
        let mut hasher = Sha256::new();
        match template.algorithm {
            KeyAlgorithm::AesCfb { bits } => {
                hasher.update(PRIVATE_BLOB_TAG_AES);
                hasher.update(bits.to_be_bytes());
            }
            KeyAlgorithm::Rsa { bits, .. } => {
                hasher.update(PRIVATE_BLOB_TAG_RSA);
                hasher.update(bits.to_be_bytes());
            }
        }
        hasher.update(template.attributes.bits().to_be_bytes());
        hasher.update(&template.auth_policy);
        if let Some(selection) = &template.creation_pcr {
            hasher.update(selection.hash().tpm_alg_id().to_be_bytes());
            hasher.update(selection.mask_bytes());
        }
        hasher.finalize().into()
    }

    fn instantiate(
        &self,
        hierarchy: Hierarchy,
        template: &KeyTemplate,
        sensitive: &SensitiveCreate,
    ) -> Result<SoftKeyMaterial> {
        match template.algorithm {
            KeyAlgorithm::AesCfb { bits } => {
                let len = usize::from(bits / 8);
                let key = if !sensitive.secret_data.is_empty() {
                    if sensitive.secret_data.len() != len {
                        return Err(Error::Device(
                            "sensitive data does not match the template key size".into(),
                        ));
                    }
                    Zeroizing::new(sensitive.secret_data.clone())
                } else if hierarchy == Hierarchy::Owner {
                    let mut hasher = Sha256::new();
                    hasher.update(self.owner_seed);
                    hasher.update(Self::template_fingerprint(template));
                    Zeroizing::new(hasher.finalize()[..len].to_vec())
                } else {
                    Zeroizing::new(self.draw(len)?)
                };
                Ok(SoftKeyMaterial::Aes(key))
            }
            KeyAlgorithm::Rsa { bits, .. } => {
                let bits = usize::from(bits);
                let key = if !sensitive.secret_data.is_empty() {
                    let mut hasher = Sha256::new();
                    hasher.update(&sensitive.auth_value);
                    hasher.update(&sensitive.secret_data);
                    let mut rng = StdRng::from_seed(hasher.finalize().into());
                    RsaPrivateKey::new(&mut rng, bits)
                        .map_err(|e| Error::Device(format!("RSA key derivation: {}", e)))?
                } else if hierarchy == Hierarchy::Owner {
                    let mut hasher = Sha256::new();
                    hasher.update(self.owner_seed);
                    hasher.update(Self::template_fingerprint(template));
                    let mut rng = StdRng::from_seed(hasher.finalize().into());
                    RsaPrivateKey::new(&mut rng, bits)
                        .map_err(|e| Error::Device(format!("RSA key derivation: {}", e)))?
                } else {
                    RsaPrivateKey::new(&mut OsRng, bits)
                        .map_err(|e| Error::Device(format!("RSA key generation: {}", e)))?
                };
                Ok(SoftKeyMaterial::Rsa(Box::new(key)))
            }
        }
    }

    fn serialize_material(material: &SoftKeyMaterial) -> Result<Zeroizing<Vec<u8>>> {
        let encoded = match material {
            SoftKeyMaterial::Aes(key) => wire::encode(&[PRIVATE_BLOB_TAG_AES, key.as_slice()])?,
            SoftKeyMaterial::Rsa(key) => {
                let der = key
                    .to_pkcs1_der()
                    .map_err(|e| Error::Device(format!("RSA key serialization: {}", e)))?;
                wire::encode(&[PRIVATE_BLOB_TAG_RSA, der.as_bytes()])?
            }
        };
        Ok(Zeroizing::new(encoded))
    }

    fn deserialize_material(bytes: &[u8]) -> Result<SoftKeyMaterial> {
        let parts = wire::decode(bytes)?;
        if parts.len() != 2 {
            return Err(Error::Device("malformed private blob".into()));
        }
        match parts[0].as_slice() {
            b"A" => Ok(SoftKeyMaterial::Aes(Zeroizing::new(parts[1].clone()))),
            b"R" => {
                let key = RsaPrivateKey::from_pkcs1_der(&parts[1])
                    .map_err(|e| Error::Device(format!("RSA key deserialization: {}", e)))?;
                Ok(SoftKeyMaterial::Rsa(Box::new(key)))
            }
            _ => Err(Error::Device("malformed private blob".into())),
        }
    }

    /// KEK a parent uses to seal its children's private blobs.
    fn parent_kek(material: &SoftKeyMaterial) -> Result<[u8; 32]> {
        let digest = match material {
            SoftKeyMaterial::Aes(key) => Sha256::digest(key.as_slice()),
            SoftKeyMaterial::Rsa(key) => {
                let der = key
                    .to_pkcs1_der()
                    .map_err(|e| Error::Device(format!("RSA key serialization: {}", e)))?;
                Sha256::digest(der.as_bytes())
            }
        };
        Ok(digest.into())
    }

    fn serialize_public(template: &KeyTemplate) -> Result<Vec<u8>> {
        let (tag, bits): (&[u8], u16) = match template.algorithm {
            KeyAlgorithm::AesCfb { bits } => (PRIVATE_BLOB_TAG_AES, bits),
            KeyAlgorithm::Rsa { bits, .. } => (PRIVATE_BLOB_TAG_RSA, bits),
        };
        wire::encode(&[
            tag,
            &bits.to_be_bytes(),
            &template.attributes.bits().to_be_bytes(),
            &template.auth_policy,
        ])
    }

    fn public_auth_policy(public: &[u8]) -> Result<Vec<u8>> {
        let parts = wire::decode(public)?;
        if parts.len() != 4 {
            return Err(Error::Device("malformed public blob".into()));
        }
        Ok(parts[3].clone())
    }
}

// ---------------------------------------------------------------------------
// Transport implementation
// ---------------------------------------------------------------------------

impl TpmTransport for SoftTpm {
    fn create_primary(
        &mut self,
        hierarchy: Hierarchy,
        template: &KeyTemplate,
        sensitive: &SensitiveCreate,
    ) -> Result<KeyHandle> {
        self.ensure_open()?;
        let material = self.instantiate(hierarchy, template, sensitive)?;
        let handle = self.take_handle();
        self.keys
            .insert(handle, SoftKey { material, auth_policy: template.auth_policy.clone() });
        self.stats.objects_loaded.fetch_add(1, Ordering::SeqCst);
        Ok(KeyHandle(handle))
    }

    fn create(
        &mut self,
        parent: KeyHandle,
        template: &KeyTemplate,
        session: Option<SessionHandle>,
    ) -> Result<CreatedKey> {
        self.ensure_open()?;
        let parent_key = self.key(parent)?;
        self.check_policy(&parent_key.auth_policy, session)?;

        let material = self.instantiate(Hierarchy::Owner, template, &SensitiveCreate::default())?;
        let serialized = Self::serialize_material(&material)?;
        let public = Self::serialize_public(template)?;

        let kek = Self::parent_kek(&parent_key.material)?;
        let nonce_bytes = self.draw(aead::IV_BYTES)?;
        let mut nonce = [0u8; aead::IV_BYTES];
        nonce.copy_from_slice(&nonce_bytes);

        // The public blob authenticates as associated data, so a private
        // blob cannot be replayed under a rewritten template.
        let sealed = aead::seal(&kek, &nonce, &serialized, &public)?;
        let mut private = nonce.to_vec();
        private.extend_from_slice(&sealed);

        Ok(CreatedKey { private, public })
    }

    fn load(&mut self, parent: KeyHandle, private: &[u8], public: &[u8]) -> Result<KeyHandle> {
        self.ensure_open()?;
        let parent_key = self.key(parent)?;
        let kek = Self::parent_kek(&parent_key.material)?;

        if private.len() < aead::IV_BYTES + aead::TAG_BYTES {
            return Err(Error::Device("malformed private blob".into()));
        }
        let (nonce_bytes, sealed) = private.split_at(aead::IV_BYTES);
        let mut nonce = [0u8; aead::IV_BYTES];
        nonce.copy_from_slice(nonce_bytes);

        let serialized = Zeroizing::new(
            aead::open(&kek, &nonce, sealed, public)
                .map_err(|_| Error::Device("private blob does not load under this parent".into()))?,
        );
        let material = Self::deserialize_material(&serialized)?;
        let auth_policy = Self::public_auth_policy(public)?;

        let handle = self.take_handle();
        self.keys.insert(handle, SoftKey { material, auth_policy });
        self.stats.objects_loaded.fetch_add(1, Ordering::SeqCst);
        Ok(KeyHandle(handle))
    }

    fn start_auth_session(
        &mut self,
        _nonce_caller: &[u8; POLICY_NONCE_BYTES],
    ) -> Result<SessionHandle> {
        self.ensure_open()?;
        let handle = self.take_handle();
        self.sessions.insert(handle, SoftSession { digest: vec![0u8; 32] });
        self.stats.sessions_started.fetch_add(1, Ordering::SeqCst);
        Ok(SessionHandle(handle))
    }

    fn policy_pcr(&mut self, session: SessionHandle, selection: &PcrSelection) -> Result<()> {
        self.ensure_open()?;
        let pcr_digest = self.pcr_digest;
        let entry = self
            .sessions
            .get_mut(&session.0)
            .ok_or_else(|| Error::Device(format!("unknown session handle {:#x}", session.0)))?;

        let mut hasher = Sha256::new();
        hasher.update(&entry.digest);
        hasher.update(selection.hash().tpm_alg_id().to_be_bytes());
        hasher.update(selection.mask_bytes());
        hasher.update(pcr_digest);
        entry.digest = hasher.finalize().to_vec();
        Ok(())
    }

    fn policy_get_digest(&mut self, session: SessionHandle) -> Result<Vec<u8>> {
        self.ensure_open()?;
        self.sessions
            .get(&session.0)
            .map(|s| s.digest.clone())
            .ok_or_else(|| Error::Device(format!("unknown session handle {:#x}", session.0)))
    }

    fn encrypt_decrypt(
        &mut self,
        key: KeyHandle,
        decrypt: bool,
        iv: &[u8; CFB_IV_BYTES],
        data: &[u8],
        session: Option<SessionHandle>,
    ) -> Result<Vec<u8>> {
        self.ensure_open()?;
        let entry = self.key(key)?;
        self.check_policy(&entry.auth_policy, session)?;

        let SoftKeyMaterial::Aes(material) = &entry.material else {
            return Err(Error::Device("EncryptDecrypt needs a symmetric key".into()));
        };
        let mut buf = data.to_vec();
        let bad_key = |_| Error::Device("AES key setup failed".into());
        match (material.len(), decrypt) {
            (16, false) => Aes128CfbEnc::new_from_slices(material, iv)
                .map_err(bad_key)?
                .encrypt(&mut buf),
            (16, true) => Aes128CfbDec::new_from_slices(material, iv)
                .map_err(bad_key)?
                .decrypt(&mut buf),
            (32, false) => Aes256CfbEnc::new_from_slices(material, iv)
                .map_err(bad_key)?
                .encrypt(&mut buf),
            (32, true) => Aes256CfbDec::new_from_slices(material, iv)
                .map_err(bad_key)?
                .decrypt(&mut buf),
            _ => return Err(Error::Device("unsupported AES key size".into())),
        }
        Ok(buf)
    }

    fn rsa_encrypt(&mut self, key: KeyHandle, data: &[u8]) -> Result<Vec<u8>> {
        self.ensure_open()?;
        let entry = self.key(key)?;
        let SoftKeyMaterial::Rsa(material) = &entry.material else {
            return Err(Error::Device("RSA_Encrypt needs an RSA key".into()));
        };
        material
            .to_public_key()
            .encrypt(&mut OsRng, Oaep::new::<Sha256>(), data)
            .map_err(|_| Error::Crypto)
    }

    fn rsa_decrypt(
        &mut self,
        key: KeyHandle,
        data: &[u8],
        session: Option<SessionHandle>,
    ) -> Result<Vec<u8>> {
        self.ensure_open()?;
        let entry = self.key(key)?;
        self.check_policy(&entry.auth_policy, session)?;
        let SoftKeyMaterial::Rsa(material) = &entry.material else {
            return Err(Error::Device("RSA_Decrypt needs an RSA key".into()));
        };
        material.decrypt(Oaep::new::<Sha256>(), data).map_err(|_| Error::Crypto)
    }

    fn get_random(&mut self, count: usize) -> Result<Vec<u8>> {
        self.ensure_open()?;
        self.stats.random_calls.fetch_add(1, Ordering::SeqCst);
        self.draw(count.min(MAX_RANDOM_BYTES))
    }

    fn flush_context(&mut self, handle: TpmHandle) -> Result<()> {
        self.ensure_open()?;
        match handle {
            TpmHandle::Key(key) => {
                self.keys
                    .remove(&key.0)
                    .ok_or_else(|| Error::Device(format!("flush of unknown handle {:#x}", key.0)))?;
                self.stats.objects_flushed.fetch_add(1, Ordering::SeqCst);
            }
            TpmHandle::Session(session) => {
                self.sessions.remove(&session.0).ok_or_else(|| {
                    Error::Device(format!("flush of unknown handle {:#x}", session.0))
                })?;
                self.stats.sessions_flushed.fetch_add(1, Ordering::SeqCst);
            }
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tpm::ObjectAttributes;

    fn aes_template(bits: u16) -> KeyTemplate {
        KeyTemplate {
            algorithm: KeyAlgorithm::AesCfb { bits },
            attributes: ObjectAttributes::SIGN_ENCRYPT | ObjectAttributes::DECRYPT,
            auth_policy: Vec::new(),
            creation_pcr: None,
        }
    }

    #[test]
    fn owner_primaries_are_deterministic_per_chip() {
        let mut a = SoftTpm::new();
        let mut b = SoftTpm::new();
        let template = aes_template(256);

        let ha = a
            .create_primary(Hierarchy::Owner, &template, &SensitiveCreate::default())
            .unwrap();
        let hb = b
            .create_primary(Hierarchy::Owner, &template, &SensitiveCreate::default())
            .unwrap();

        // Same chip model, same template: a child sealed by one loads under
        // the other.
        let created = a.create(ha, &aes_template(256), None).unwrap();
        assert!(b.load(hb, &created.private, &created.public).is_ok());
    }

    #[test]
    fn different_owner_seed_rejects_foreign_blobs() {
        let mut a = SoftTpm::new();
        let mut b = SoftTpm::with_owner_seed([9u8; 32]);
        let template = aes_template(256);

        let ha = a
            .create_primary(Hierarchy::Owner, &template, &SensitiveCreate::default())
            .unwrap();
        let hb = b
            .create_primary(Hierarchy::Owner, &template, &SensitiveCreate::default())
            .unwrap();

        let created = a.create(ha, &aes_template(256), None).unwrap();
        assert!(b.load(hb, &created.private, &created.public).is_err());
    }

    #[test]
    fn null_hierarchy_keys_recreate_from_sensitive_data() {
        let mut tpm = SoftTpm::new();
        let sensitive = SensitiveCreate {
            auth_value: vec![1u8; 32],
            secret_data: vec![2u8; 32],
        };
        let template = aes_template(256);
        let iv = [5u8; CFB_IV_BYTES];

        let h1 = tpm.create_primary(Hierarchy::Null, &template, &sensitive).unwrap();
        let ct = tpm.encrypt_decrypt(h1, false, &iv, &[0x42u8; 64], None).unwrap();
        tpm.flush_context(TpmHandle::Key(h1)).unwrap();

        let h2 = tpm.create_primary(Hierarchy::Null, &template, &sensitive).unwrap();
        let pt = tpm.encrypt_decrypt(h2, true, &iv, &ct, None).unwrap();
        assert_eq!(pt, vec![0x42u8; 64]);
    }

    #[test]
    fn policy_gated_key_requires_matching_session() {
        let mut tpm = SoftTpm::new();
        let selection = PcrSelection::new(crate::headers::PcrHash::Sha256, 0x10000).unwrap();

        // Compute the policy digest the template will embed.
        let probe = tpm.start_auth_session(&[0u8; POLICY_NONCE_BYTES]).unwrap();
        tpm.policy_pcr(probe, &selection).unwrap();
        let digest = tpm.policy_get_digest(probe).unwrap();
        tpm.flush_context(TpmHandle::Session(probe)).unwrap();

        let gated = KeyTemplate { auth_policy: digest, ..aes_template(256) };
        let handle = tpm
            .create_primary(Hierarchy::Owner, &gated, &SensitiveCreate::default())
            .unwrap();

        let iv = [1u8; CFB_IV_BYTES];
        // No session: rejected.
        assert!(tpm.encrypt_decrypt(handle, false, &iv, &[0u8; 64], None).is_err());

        // Session with the right PCR assertion: accepted.
        let session = tpm.start_auth_session(&[0u8; POLICY_NONCE_BYTES]).unwrap();
        tpm.policy_pcr(session, &selection).unwrap();
        assert!(tpm
            .encrypt_decrypt(handle, false, &iv, &[0u8; 64], Some(session))
            .is_ok());
        tpm.flush_context(TpmHandle::Session(session)).unwrap();
    }

    #[test]
    fn get_random_is_capped_per_call() {
        let mut tpm = SoftTpm::new();
        assert_eq!(tpm.get_random(1000).unwrap().len(), MAX_RANDOM_BYTES);
        assert_eq!(tpm.get_random(7).unwrap().len(), 7);
    }

    #[test]
    fn closed_transport_rejects_commands() {
        let mut tpm = SoftTpm::new();
        tpm.close().unwrap();
        assert!(tpm.get_random(8).is_err());
    }
}
