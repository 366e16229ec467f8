//! # letsconfide
//!
//! TPM 2.0-bound secrets management for small collections of named secrets
//! (database credentials, API keys).
//!
//! Plaintext secrets arrive in a YAML configuration; after the first parse
//! the file is rewritten to hold only ciphertext plus the material needed to
//! reconstitute decryption, which is itself bound to TPM-resident keys and
//! to platform measurement state (PCRs). Later runs reopen the file,
//! re-bind to the TPM, and decrypt individual secrets on demand.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use letsconfide::{parse, SoftTpm, TpmDeviceFactory};
//!
//! // The software transport stands in for real hardware in tests only.
//! let factory = Arc::new(TpmDeviceFactory::new(Box::new(SoftTpm::new())));
//!
//! let manager = parse("confide.yml", factory).unwrap();
//! let session = manager.start_data_access_session().unwrap();
//! let secret = session.decrypt("pwd1").unwrap();
//! # let _ = secret;
//! ```
//!
//! ## Security Properties
//!
//! - **Three-layer hierarchy**: TPM-resident KEKs wrap host DEKs; DEKs wrap
//!   secret values. Cleartext DEKs exist only inside scoped, zeroed buffers.
//! - **Platform binding**: the storage KEK is gated by a PCR policy; moved
//!   files do not decrypt on other hardware or other measured state.
//! - **Uniform failures**: cryptographic errors are opaque and never echo
//!   key bytes, plaintext, or queried names.
//!
//! ## What's NOT Provided
//!
//! - Key rotation
//! - Multi-tenant key isolation
//! - Secret streaming (values are bounded)
//! - Operation without a TPM

#![deny(unsafe_code)]

mod aead;
mod blob;
mod config;
mod dek;
mod device;
mod error;
mod headers;
mod keys;
mod padding;
mod secrets;
mod soft;
mod tpm;

// Exposed for the integration tests' framing assertions; not stable API.
#[doc(hidden)]
pub mod wire;

use std::path::Path;
use std::sync::Arc;

pub use blob::EncryptedBlob;
pub use dek::ResolvedDek;
pub use device::{Device, DeviceFactory, OpenedDevice, TpmDeviceFactory};
pub use error::{Error, Result};
pub use headers::{ConfigHeaders, KeyType, PcrHash};
pub use secrets::{DataAccessSession, Manager};
pub use soft::{SoftTpm, SoftTpmStats};
pub use tpm::{
    CreatedKey, Hierarchy, KeyAlgorithm, KeyHandle, KeyTemplate, ObjectAttributes, PcrSelection,
    PolicySession, RsaScheme, SensitiveCreate, SessionHandle, TpmGateway, TpmHandle, TpmTransport,
};

pub use config::MAX_CONFIG_BYTES;

/// Parse a configuration file and return its secrets manager.
///
/// A plaintext configuration is sealed in place: the file is rewritten to
/// its encrypted form before this returns. An already-sealed file is
/// reopened against the device without being rewritten.
pub fn parse(path: impl AsRef<Path>, factory: Arc<dyn DeviceFactory>) -> Result<Manager> {
    let path = path.as_ref();
    let text = config::read_bounded(path)?;
    match config::parse_config(&text)? {
        config::ParsedConfig::Plaintext { headers, entries } => {
            let manager = Manager::seal(headers, &entries, factory)?;
            blob::write_sealed(path, &manager.headers(), manager.encrypted_data())?;
            Ok(manager)
        }
        config::ParsedConfig::Sealed { headers, blob } => Manager::reopen(headers, blob, factory),
    }
}
