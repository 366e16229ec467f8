//! Device assembly: the three-key hierarchy behind one open handle.
//!
//! A [`Device`] bundles the gateway with a primary key, the policy-gated
//! storage KEK, and the ephemeral KEK, and exposes the wrap/unwrap surface
//! the host DEK layer consumes. Devices are opened through a
//! [`DeviceFactory`]; the provided [`TpmDeviceFactory`] owns the process's
//! one transport and the once-drawn ephemeral token list.

use std::sync::{Arc, Mutex};

use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::error::{Error, Result};
use crate::headers::ConfigHeaders;
use crate::keys::{EphemeralKey, PrimaryKey, StorageKey};
use crate::tpm::{PcrSelection, TpmGateway, TpmTransport};

/// An open device plus the storage-KEK tokens to persist.
pub struct OpenedDevice {
    pub device: Device,
    /// Ordered `{private, public}` blobs of the storage KEK.
    pub tokens: Vec<Vec<u8>>,
}

/// Opens devices against some TPM. The factory is the process-wide owner of
/// the transport; opened devices borrow exclusive command access through the
/// gateway mutex.
pub trait DeviceFactory: Send + Sync {
    /// Open a device. With `tokens`, the storage KEK is reconstituted from
    /// the persisted blobs; without, a fresh KEK is created.
    fn open(&self, headers: &ConfigHeaders, tokens: Option<&[Vec<u8>]>) -> Result<OpenedDevice>;
}

// ---------------------------------------------------------------------------
// Device
// ---------------------------------------------------------------------------

/// One open view of the TPM key hierarchy.
///
/// All three key handles are flushed at close; `Drop` performs a
/// best-effort flush if the caller never closed explicitly.
pub struct Device {
    gateway: TpmGateway,
    headers: ConfigHeaders,
    primary: PrimaryKey,
    storage: StorageKey,
    ephemeral: EphemeralKey,
    closed: bool,
}

impl Device {
    pub(crate) fn open(
        gateway: TpmGateway,
        headers: ConfigHeaders,
        storage_tokens: Option<&[Vec<u8>]>,
        ephemeral_tokens: Option<Arc<Vec<Vec<u8>>>>,
    ) -> Result<Self> {
        headers.validate()?;
        let primary = PrimaryKey::create(&gateway, headers.primary_key_type)?;

        let storage = match storage_tokens {
            Some(tokens) => StorageKey::load(&gateway, &primary, &headers, tokens),
            None => StorageKey::create(&gateway, &primary, &headers),
        };
        let storage = match storage {
            Ok(storage) => storage,
            Err(err) => {
                let _ = primary.flush(&gateway);
                return Err(err);
            }
        };

        let ephemeral = match ephemeral_tokens {
            Some(tokens) => EphemeralKey::from_tokens(&gateway, headers.ephemeral_key_type, tokens),
            None => EphemeralKey::create(&gateway, headers.ephemeral_key_type),
        };
        let ephemeral = match ephemeral {
            Ok(ephemeral) => ephemeral,
            Err(err) => {
                let _ = storage.flush(&gateway);
                let _ = primary.flush(&gateway);
                return Err(err);
            }
        };

        debug!("opened TPM device");
        Ok(Self { gateway, headers, primary, storage, ephemeral, closed: false })
    }

    fn selection(&self) -> Result<PcrSelection> {
        PcrSelection::new(self.headers.pcr_hash, self.headers.pcr_selection)
    }

    /// Random bytes from the TPM RNG.
    pub fn random_bytes(&self, count: usize) -> Result<Vec<u8>> {
        self.gateway.random_bytes(count)
    }

    /// Wrap a DEK under the persistent storage KEK.
    pub fn wrap_persistent(&self, dek: &[u8]) -> Result<Vec<u8>> {
        self.storage.wrap(&self.gateway, &self.selection()?, dek)
    }

    /// Unwrap a DEK wrapped by [`Self::wrap_persistent`].
    pub fn unwrap_persistent(&self, wrapped: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        self.storage.unwrap(&self.gateway, &self.selection()?, wrapped)
    }

    /// Wrap a DEK under the ephemeral KEK.
    pub fn wrap_ephemeral(&self, dek: &[u8]) -> Result<Vec<u8>> {
        self.ephemeral.wrap(&self.gateway, dek)
    }

    /// Unwrap a DEK wrapped by [`Self::wrap_ephemeral`].
    pub fn unwrap_ephemeral(&self, wrapped: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        self.ephemeral.unwrap(&self.gateway, wrapped)
    }

    pub(crate) fn storage_tokens(&self) -> &[Vec<u8>] {
        self.storage.tokens()
    }

    pub(crate) fn ephemeral_tokens(&self) -> Arc<Vec<Vec<u8>>> {
        self.ephemeral.tokens()
    }

    /// Flush all key handles. Attempts every flush even when one fails and
    /// reports the first error.
    pub fn close(mut self) -> Result<()> {
        self.release()
    }

    fn release(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let mut first_error = None;
        for result in [
            self.ephemeral.flush(&self.gateway),
            self.storage.flush(&self.gateway),
            self.primary.flush(&self.gateway),
        ] {
            if let Err(err) = result {
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }
        debug!("closed TPM device");
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(err) = self.release() {
                warn!(%err, "failed to flush device handles");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// TPM-backed factory
// ---------------------------------------------------------------------------

/// Factory over a concrete [`TpmTransport`].
///
/// The ephemeral token list is drawn on the first open and reused for every
/// later one, so each opened device recreates the same ephemeral KEK for
/// the remainder of the process run.
pub struct TpmDeviceFactory {
    transport: Arc<Mutex<Box<dyn TpmTransport>>>,
    ephemeral_tokens: Mutex<Option<Arc<Vec<Vec<u8>>>>>,
}

impl TpmDeviceFactory {
    pub fn new(transport: Box<dyn TpmTransport>) -> Self {
        Self {
            transport: Arc::new(Mutex::new(transport)),
            ephemeral_tokens: Mutex::new(None),
        }
    }

    fn cached_tokens(&self) -> Result<Option<Arc<Vec<Vec<u8>>>>> {
        Ok(self
            .ephemeral_tokens
            .lock()
            .map_err(|_| Error::Device("ephemeral token mutex poisoned".into()))?
            .clone())
    }

    /// Shut the transport down. No device may be opened afterwards.
    pub fn close(&self) -> Result<()> {
        TpmGateway::new(Arc::clone(&self.transport)).close()
    }
}

impl DeviceFactory for TpmDeviceFactory {
    fn open(&self, headers: &ConfigHeaders, tokens: Option<&[Vec<u8>]>) -> Result<OpenedDevice> {
        let gateway = TpmGateway::new(Arc::clone(&self.transport));
        let device = Device::open(gateway, *headers, tokens, self.cached_tokens()?)?;

        let mut slot = self
            .ephemeral_tokens
            .lock()
            .map_err(|_| Error::Device("ephemeral token mutex poisoned".into()))?;
        if slot.is_none() {
            *slot = Some(device.ephemeral_tokens());
        }
        drop(slot);

        Ok(OpenedDevice { tokens: device.storage_tokens().to_vec(), device })
    }
}
