//! TPM 2.0 command surface and the serialized gateway.
//!
//! The crate talks to the TPM through [`TpmTransport`], a trait covering the
//! twelve commands the key hierarchy needs. A [`TpmGateway`] owns the shared
//! transport behind a process-wide mutex: every command locks it for the
//! command's duration, so concurrent callers are safe but strictly
//! serialized. TPM hardware is not reentrant.

use std::sync::{Arc, Mutex};

use bitflags::bitflags;
use tracing::warn;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Error, Result};
use crate::headers::{PcrHash, PCR_SELECTION_MAX};

/// Largest number of bytes a single `GetRandom` returns.
pub const MAX_RANDOM_BYTES: usize = 48;

/// Caller nonce size of a policy session.
pub const POLICY_NONCE_BYTES: usize = 16;

/// IV size of the CFB encrypt/decrypt command.
pub const CFB_IV_BYTES: usize = 16;

// ---------------------------------------------------------------------------
// Handles and hierarchies
// ---------------------------------------------------------------------------

/// Transient object handle returned by `CreatePrimary`/`Load`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct KeyHandle(pub u32);

/// Session handle returned by `StartAuthSession`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SessionHandle(pub u32);

/// Argument of `FlushContext`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TpmHandle {
    Key(KeyHandle),
    Session(SessionHandle),
}

impl From<KeyHandle> for TpmHandle {
    fn from(handle: KeyHandle) -> Self {
        Self::Key(handle)
    }
}

impl From<SessionHandle> for TpmHandle {
    fn from(handle: SessionHandle) -> Self {
        Self::Session(handle)
    }
}

/// Hierarchy a primary key is created under.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Hierarchy {
    Owner,
    Null,
}

// ---------------------------------------------------------------------------
// Key templates
// ---------------------------------------------------------------------------

bitflags! {
    /// TPMA_OBJECT attribute bits.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct ObjectAttributes: u32 {
        const FIXED_TPM             = 0x0000_0002;
        const FIXED_PARENT          = 0x0000_0010;
        const SENSITIVE_DATA_ORIGIN = 0x0000_0020;
        const USER_WITH_AUTH        = 0x0000_0040;
        const NO_DA                 = 0x0000_0400;
        const RESTRICTED            = 0x0001_0000;
        const DECRYPT               = 0x0002_0000;
        const SIGN_ENCRYPT          = 0x0004_0000;
    }
}

/// Single `TPMS_PCR_SELECTION`: a hash bank and a 24-bit register mask.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PcrSelection {
    hash: PcrHash,
    mask: u32,
}

impl PcrSelection {
    pub fn new(hash: PcrHash, mask: u32) -> Result<Self> {
        if mask == 0 || mask > PCR_SELECTION_MAX {
            return Err(Error::InvalidPcrSelection(mask));
        }
        Ok(Self { hash, mask })
    }

    pub fn hash(&self) -> PcrHash {
        self.hash
    }

    /// The 3-byte selection bitmap: byte 0 carries PCRs 0-7.
    pub fn mask_bytes(&self) -> [u8; 3] {
        [
            (self.mask & 0xFF) as u8,
            ((self.mask >> 8) & 0xFF) as u8,
            ((self.mask >> 16) & 0xFF) as u8,
        ]
    }
}

/// Asymmetric scheme of an RSA key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RsaScheme {
    /// Scheme left to the command (storage parents).
    Null,
    OaepSha256,
}

/// Algorithm and parameters of a key object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyAlgorithm {
    AesCfb {
        bits: u16,
    },
    Rsa {
        bits: u16,
        scheme: RsaScheme,
        /// AES-CFB bits of the parameter-encryption symmetric, for
        /// restricted parents.
        sym_bits: Option<u16>,
    },
}

/// Public template of a key to create. Name algorithm is always SHA-256.
#[derive(Clone, Debug)]
pub struct KeyTemplate {
    pub algorithm: KeyAlgorithm,
    pub attributes: ObjectAttributes,
    /// Policy digest gating the key's use; empty for none.
    pub auth_policy: Vec<u8>,
    /// Creation-PCR binding of a primary.
    pub creation_pcr: Option<PcrSelection>,
}

/// `TPMS_SENSITIVE_CREATE`: caller-supplied secret parts of a key.
#[derive(Clone, Default, Zeroize, ZeroizeOnDrop)]
pub struct SensitiveCreate {
    pub auth_value: Vec<u8>,
    pub secret_data: Vec<u8>,
}

/// Private and public blobs of a created (not yet loaded) key.
#[derive(Clone, Debug)]
pub struct CreatedKey {
    pub private: Vec<u8>,
    pub public: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// The TPM 2.0 command set this crate consumes.
///
/// Implementations adapt a concrete TPM 2.0 stack (or, for tests, the
/// in-memory [`crate::soft::SoftTpm`]). Callers never hold a transport
/// directly; all access goes through [`TpmGateway`].
pub trait TpmTransport: Send {
    fn create_primary(
        &mut self,
        hierarchy: Hierarchy,
        template: &KeyTemplate,
        sensitive: &SensitiveCreate,
    ) -> Result<KeyHandle>;

    fn create(
        &mut self,
        parent: KeyHandle,
        template: &KeyTemplate,
        session: Option<SessionHandle>,
    ) -> Result<CreatedKey>;

    fn load(&mut self, parent: KeyHandle, private: &[u8], public: &[u8]) -> Result<KeyHandle>;

    fn start_auth_session(&mut self, nonce_caller: &[u8; POLICY_NONCE_BYTES])
        -> Result<SessionHandle>;

    /// Bind `session` to the current digest of the selected PCRs. The empty
    /// expected-digest form: the TPM computes the digest itself.
    fn policy_pcr(&mut self, session: SessionHandle, selection: &PcrSelection) -> Result<()>;

    fn policy_get_digest(&mut self, session: SessionHandle) -> Result<Vec<u8>>;

    fn encrypt_decrypt(
        &mut self,
        key: KeyHandle,
        decrypt: bool,
        iv: &[u8; CFB_IV_BYTES],
        data: &[u8],
        session: Option<SessionHandle>,
    ) -> Result<Vec<u8>>;

    fn rsa_encrypt(&mut self, key: KeyHandle, data: &[u8]) -> Result<Vec<u8>>;

    fn rsa_decrypt(
        &mut self,
        key: KeyHandle,
        data: &[u8],
        session: Option<SessionHandle>,
    ) -> Result<Vec<u8>>;

    /// Returns at most [`MAX_RANDOM_BYTES`] bytes per call.
    fn get_random(&mut self, count: usize) -> Result<Vec<u8>>;

    fn flush_context(&mut self, handle: TpmHandle) -> Result<()>;

    fn close(&mut self) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Gateway
// ---------------------------------------------------------------------------

/// Shared access point to the process's one TPM transport.
///
/// Cloning is cheap; every clone dispatches to the same transport under the
/// same mutex.
#[derive(Clone)]
pub struct TpmGateway {
    transport: Arc<Mutex<Box<dyn TpmTransport>>>,
}

impl TpmGateway {
    pub fn new(transport: Arc<Mutex<Box<dyn TpmTransport>>>) -> Self {
        Self { transport }
    }

    fn run<R>(&self, op: impl FnOnce(&mut dyn TpmTransport) -> Result<R>) -> Result<R> {
        let mut guard = self
            .transport
            .lock()
            .map_err(|_| Error::Device("transport mutex poisoned".into()))?;
        op(guard.as_mut())
    }

    pub fn create_primary(
        &self,
        hierarchy: Hierarchy,
        template: &KeyTemplate,
        sensitive: &SensitiveCreate,
    ) -> Result<KeyHandle> {
        self.run(|t| t.create_primary(hierarchy, template, sensitive))
    }

    pub fn create(
        &self,
        parent: KeyHandle,
        template: &KeyTemplate,
        session: Option<SessionHandle>,
    ) -> Result<CreatedKey> {
        self.run(|t| t.create(parent, template, session))
    }

    pub fn load(&self, parent: KeyHandle, private: &[u8], public: &[u8]) -> Result<KeyHandle> {
        self.run(|t| t.load(parent, private, public))
    }

    pub fn start_auth_session(
        &self,
        nonce_caller: &[u8; POLICY_NONCE_BYTES],
    ) -> Result<SessionHandle> {
        self.run(|t| t.start_auth_session(nonce_caller))
    }

    pub fn policy_pcr(&self, session: SessionHandle, selection: &PcrSelection) -> Result<()> {
        self.run(|t| t.policy_pcr(session, selection))
    }

    pub fn policy_get_digest(&self, session: SessionHandle) -> Result<Vec<u8>> {
        self.run(|t| t.policy_get_digest(session))
    }

    pub fn encrypt_decrypt(
        &self,
        key: KeyHandle,
        decrypt: bool,
        iv: &[u8; CFB_IV_BYTES],
        data: &[u8],
        session: Option<SessionHandle>,
    ) -> Result<Vec<u8>> {
        self.run(|t| t.encrypt_decrypt(key, decrypt, iv, data, session))
    }

    pub fn rsa_encrypt(&self, key: KeyHandle, data: &[u8]) -> Result<Vec<u8>> {
        self.run(|t| t.rsa_encrypt(key, data))
    }

    pub fn rsa_decrypt(
        &self,
        key: KeyHandle,
        data: &[u8],
        session: Option<SessionHandle>,
    ) -> Result<Vec<u8>> {
        self.run(|t| t.rsa_decrypt(key, data, session))
    }

    pub fn flush_context(&self, handle: impl Into<TpmHandle>) -> Result<()> {
        let handle = handle.into();
        self.run(|t| t.flush_context(handle))
    }

    pub fn close(&self) -> Result<()> {
        self.run(|t| t.close())
    }

    /// Gather `count` random bytes, looping over the transport's bounded
    /// `GetRandom` until enough arrive.
    pub fn random_bytes(&self, count: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(count);
        while out.len() < count {
            let chunk = self.run(|t| t.get_random(count - out.len()))?;
            if chunk.is_empty() {
                return Err(Error::Device("GetRandom returned no bytes".into()));
            }
            out.extend_from_slice(&chunk);
        }
        out.truncate(count);
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Policy session
// ---------------------------------------------------------------------------

/// Scoped PCR policy session.
///
/// Started with a fresh 16-byte caller nonce and immediately bound to the
/// configured PCR selection. The session handle is flushed on every exit
/// path; a leaked session slot on the TPM is a bug.
pub struct PolicySession<'a> {
    gateway: &'a TpmGateway,
    handle: SessionHandle,
    flushed: bool,
}

impl<'a> PolicySession<'a> {
    pub fn start(gateway: &'a TpmGateway, selection: &PcrSelection) -> Result<Self> {
        let nonce_bytes = gateway.random_bytes(POLICY_NONCE_BYTES)?;
        let mut nonce = [0u8; POLICY_NONCE_BYTES];
        nonce.copy_from_slice(&nonce_bytes);

        let handle = gateway.start_auth_session(&nonce)?;
        // The guard exists before the PCR assertion so that a failing
        // PolicyPCR still flushes the session.
        let session = Self { gateway, handle, flushed: false };
        gateway.policy_pcr(handle, selection)?;
        Ok(session)
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle
    }

    /// Read the session's accumulated policy digest.
    pub fn policy_digest(&self) -> Result<Vec<u8>> {
        self.gateway.policy_get_digest(self.handle)
    }

    /// Flush eagerly, surfacing the error the `Drop` path would swallow.
    pub fn flush(mut self) -> Result<()> {
        self.flushed = true;
        self.gateway.flush_context(self.handle)
    }
}

impl Drop for PolicySession<'_> {
    fn drop(&mut self) {
        if !self.flushed {
            if let Err(err) = self.gateway.flush_context(self.handle) {
                warn!(%err, "failed to flush policy session");
            }
        }
    }
}
