//! `Transport` over a real TPM through tss-esapi.

use std::collections::HashMap;
use std::sync::Mutex;

use cryptoki_sys::*;
use tss_esapi::handles::{KeyHandle, ObjectHandle};
use tss_esapi::tss2_esys::ESYS_TR;
use tss_esapi::traits::Marshall;

use super::{keys, TpmContext, TpmError};
use crate::transport::{HwHandle, KeyMaterial, KeyRef, KeySpec, PublicInfo, Transport, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Residency {
    /// Loaded from blobs; flushed on evict.
    Transient,
    /// An ESYS_TR onto a persistent object; only the TR is closed.
    Persistent,
}

pub struct TpmTransport {
    tpm: TpmContext,
    loaded: Mutex<HashMap<ESYS_TR, Residency>>,
}

impl TpmTransport {
    pub fn new(tpm: TpmContext) -> Self {
        Self {
            tpm,
            loaded: Mutex::new(HashMap::new()),
        }
    }

    pub fn open(tcti: &str) -> Result<Self, TpmError> {
        Ok(Self::new(TpmContext::new(tcti)?))
    }

    fn residency(&self, handle: HwHandle) -> Result<Residency, TransportError> {
        self.loaded
            .lock()
            .map_err(|_| TransportError::Device("handle table poisoned".into()))?
            .get(&handle.0)
            .copied()
            .ok_or(TransportError::UnknownHandle(handle.0))
    }

    /// Run `op` against a loaded key, with its auth set if given.
    fn with_key<T>(
        &self,
        handle: HwHandle,
        auth: Option<&[u8]>,
        op: impl FnOnce(&mut tss_esapi::Context, KeyHandle) -> Result<T, TpmError>,
    ) -> Result<T, TransportError> {
        self.residency(handle)?;
        let result = self.tpm.with_ctx(|ctx, _| {
            let obj = ObjectHandle::from(handle.0);
            if let Some(auth) = auth {
                keys::set_auth(ctx, obj, auth)?;
            }
            op(ctx, KeyHandle::from(obj))
        })?;
        Ok(result)
    }
}

impl Transport for TpmTransport {
    fn load(&self, key: &KeyRef<'_>, auth: Option<&[u8]>) -> Result<HwHandle, TransportError> {
        let (raw, residency) = self
            .tpm
            .with_ctx(|ctx, primary| {
                let (obj, residency) = match key {
                    KeyRef::Blobs {
                        public,
                        private: Some(private),
                    } => (
                        ObjectHandle::from(keys::load_key(ctx, primary, private, public)?),
                        Residency::Transient,
                    ),
                    KeyRef::Blobs {
                        public,
                        private: None,
                    } => (
                        ObjectHandle::from(keys::load_public(ctx, public)?),
                        Residency::Transient,
                    ),
                    KeyRef::Persistent {
                        handle,
                        serialized_tr,
                    } => (
                        keys::open_persistent(ctx, *handle, *serialized_tr)?,
                        Residency::Persistent,
                    ),
                };
                if let Some(auth) = auth {
                    keys::set_auth(ctx, obj, auth)?;
                }
                Ok((ESYS_TR::from(obj), residency))
            })
            .map_err(|e| TransportError::Load(e.to_string()))?;

        self.loaded
            .lock()
            .map_err(|_| TransportError::Device("handle table poisoned".into()))?
            .insert(raw, residency);
        tracing::trace!(hw = raw, ?residency, "TPM object loaded");
        Ok(HwHandle(raw))
    }

    fn evict(&self, handle: HwHandle) -> Result<(), TransportError> {
        let residency = self
            .loaded
            .lock()
            .map_err(|_| TransportError::Device("handle table poisoned".into()))?
            .remove(&handle.0)
            .ok_or(TransportError::UnknownHandle(handle.0))?;
        self.tpm
            .with_ctx(|ctx, _| {
                let obj = ObjectHandle::from(handle.0);
                match residency {
                    Residency::Transient => keys::flush(ctx, obj),
                    Residency::Persistent => keys::close(ctx, obj),
                }
            })
            .map_err(|e| TransportError::Evict(e.to_string()))
    }

    fn sign(
        &self,
        handle: HwHandle,
        auth: Option<&[u8]>,
        mechanism: CK_MECHANISM_TYPE,
        data: &[u8],
    ) -> Result<Vec<u8>, TransportError> {
        self.with_key(handle, auth, |ctx, key| keys::sign(ctx, key, mechanism, data))
    }

    fn decrypt(
        &self,
        handle: HwHandle,
        auth: Option<&[u8]>,
        mechanism: CK_MECHANISM_TYPE,
        data: &[u8],
    ) -> Result<Vec<u8>, TransportError> {
        self.with_key(handle, auth, |ctx, key| keys::rsa_decrypt(ctx, key, mechanism, data))
    }

    fn read_public(&self, persistent_handle: u32) -> Result<PublicInfo, TransportError> {
        let info = self.tpm.with_ctx(|ctx, _| {
            let (public, tr) = keys::read_persistent_public(ctx, persistent_handle)?;
            let (key_type, public_attrs) = keys::public_attrs(&public)?;
            let public_blob = public.marshall().map_err(|e| TpmError::Key(e.to_string()))?;
            Ok(PublicInfo {
                key_type,
                public_blob,
                public_attrs,
                serialized_tr: Some(tr),
            })
        })?;
        Ok(info)
    }

    fn create_key(&self, spec: &KeySpec) -> Result<KeyMaterial, TransportError> {
        let bits = spec.modulus_bits.unwrap_or(2048);
        let ec_params = spec.ec_params.as_deref().unwrap_or_default();
        let material = self.tpm.with_ctx(|ctx, primary| {
            let (private, public) = keys::create_child_key(ctx, primary, spec.key_type, bits, ec_params)?;
            let (_, public_attrs) = keys::public_attrs_from_blob(&public)?;
            Ok(KeyMaterial {
                public,
                private,
                public_attrs,
            })
        })?;
        tracing::debug!(key_type = spec.key_type, "TPM key created");
        Ok(material)
    }
}

impl Drop for TpmTransport {
    fn drop(&mut self) {
        let Ok(loaded) = self.loaded.get_mut() else {
            return;
        };
        for (raw, residency) in loaded.drain() {
            let res = self.tpm.with_ctx(|ctx, _| {
                let obj = ObjectHandle::from(raw);
                match residency {
                    Residency::Transient => keys::flush(ctx, obj),
                    Residency::Persistent => keys::close(ctx, obj),
                }
            });
            if let Err(e) = res {
                tracing::warn!(hw = raw, error = %e, "Leftover TPM handle not released");
            }
        }
    }
}
