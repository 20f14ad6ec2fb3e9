//! Software stand-in for the TPM. Keys are random secrets, signatures are
//! SHA-256 over `secret || data`; good enough to exercise every path of the
//! object core without a device.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use cryptoki_sys::*;
use rand::RngCore;
use sha2::{Digest, Sha256};

use super::{HwHandle, KeyMaterial, KeyRef, KeySpec, PublicInfo, Transport, TransportError};
use crate::object::mech::{EC_PARAMS_P256, EC_PARAMS_P384};
use crate::object::Attribute;

#[derive(Clone)]
struct SoftKey {
    key_type: CK_KEY_TYPE,
    secret: [u8; 32],
    public: Vec<u8>,
    auth: Option<Vec<u8>>,
    public_attrs: Vec<Attribute>,
}

struct Loaded {
    secret: [u8; 32],
    auth: Option<Vec<u8>>,
    has_private: bool,
}

#[derive(Default)]
struct MemState {
    by_public: HashMap<Vec<u8>, SoftKey>,
    persistent: HashMap<u32, SoftKey>,
    loaded: HashMap<u32, Loaded>,
    next_handle: u32,
    loads: usize,
    evictions: usize,
    fail_loads: bool,
    fail_evicts: bool,
}

#[derive(Default)]
pub struct MemTransport {
    state: Mutex<MemState>,
}

impl MemTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, MemState>, TransportError> {
        self.state
            .lock()
            .map_err(|_| TransportError::Device("transport mutex poisoned".into()))
    }

    fn new_key(key_type: CK_KEY_TYPE, bits: CK_ULONG, ec_params: Option<&[u8]>) -> SoftKey {
        let mut secret = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret);
        let public: Vec<u8> = Sha256::digest([b"public".as_slice(), &secret[..]].concat()).to_vec();

        let public_attrs = match key_type {
            CKK_RSA => {
                let modulus: Vec<u8> = public.iter().cycle().take((bits / 8) as usize).copied().collect();
                vec![
                    Attribute::new(CKA_MODULUS, modulus),
                    Attribute::ulong(CKA_MODULUS_BITS, bits),
                    Attribute::new(CKA_PUBLIC_EXPONENT, vec![0x01, 0x00, 0x01]),
                ]
            }
            CKK_EC => {
                let mut point = vec![0x04, 0x41, 0x04];
                point.extend_from_slice(&public);
                point.extend_from_slice(&public);
                vec![
                    Attribute::new(CKA_EC_PARAMS, ec_params.unwrap_or(EC_PARAMS_P256).to_vec()),
                    Attribute::new(CKA_EC_POINT, point),
                ]
            }
            _ => Vec::new(),
        };

        SoftKey {
            key_type,
            secret,
            public,
            auth: None,
            public_attrs,
        }
    }

    /// Create a key at a persistent handle, as a provisioning tool would
    /// before linking it into the token.
    pub fn provision_persistent(&self, handle: u32, key_type: CK_KEY_TYPE, auth: Option<&[u8]>) {
        let mut key = Self::new_key(key_type, 2048, None);
        key.auth = auth.map(|a| a.to_vec());
        if let Ok(mut state) = self.state() {
            state.persistent.insert(handle, key);
        }
    }

    /// Generate an unregistered P-256 key and return its blobs.
    pub fn generate_ec(&self) -> KeyMaterial {
        let key = Self::new_key(CKK_EC, 0, None);
        let material = KeyMaterial {
            public: key.public.clone(),
            private: key.secret.to_vec(),
            public_attrs: key.public_attrs.clone(),
        };
        if let Ok(mut state) = self.state() {
            state.by_public.insert(key.public.clone(), key);
        }
        material
    }

    /// What `sign` produces for a given persistent key, for test assertions.
    pub fn expected_signature(&self, persistent_handle: u32, data: &[u8]) -> Option<Vec<u8>> {
        let state = self.state().ok()?;
        let key = state.persistent.get(&persistent_handle)?;
        Some(soft_sign(&key.secret, data))
    }

    pub fn fail_loads(&self, fail: bool) {
        if let Ok(mut state) = self.state() {
            state.fail_loads = fail;
        }
    }

    pub fn fail_evicts(&self, fail: bool) {
        if let Ok(mut state) = self.state() {
            state.fail_evicts = fail;
        }
    }

    pub fn loads(&self) -> usize {
        self.state().map(|s| s.loads).unwrap_or(0)
    }

    pub fn evictions(&self) -> usize {
        self.state().map(|s| s.evictions).unwrap_or(0)
    }

    pub fn loaded_count(&self) -> usize {
        self.state().map(|s| s.loaded.len()).unwrap_or(0)
    }
}

fn soft_sign(secret: &[u8; 32], data: &[u8]) -> Vec<u8> {
    Sha256::digest([secret.as_slice(), data].concat()).to_vec()
}

fn check_auth(expected: &Option<Vec<u8>>, given: Option<&[u8]>) -> Result<(), TransportError> {
    match expected {
        Some(expected) if given != Some(expected.as_slice()) => {
            Err(TransportError::Device("TPM_RC_AUTH_FAIL".into()))
        }
        _ => Ok(()),
    }
}

impl Transport for MemTransport {
    fn load(&self, key: &KeyRef<'_>, auth: Option<&[u8]>) -> Result<HwHandle, TransportError> {
        let mut state = self.state()?;
        if state.fail_loads {
            return Err(TransportError::Load("injected load failure".into()));
        }
        let (soft, has_private) = match key {
            KeyRef::Blobs { public, private } => {
                let soft = state
                    .by_public
                    .get(*public)
                    .cloned()
                    .ok_or_else(|| TransportError::Load("unknown public blob".into()))?;
                if let Some(private) = private {
                    if *private != soft.secret.as_slice() {
                        return Err(TransportError::Load("private blob does not match".into()));
                    }
                }
                (soft, private.is_some())
            }
            KeyRef::Persistent { handle, .. } => {
                let soft = state
                    .persistent
                    .get(handle)
                    .cloned()
                    .ok_or_else(|| TransportError::Load(format!("no persistent object at {handle:#x}")))?;
                (soft, true)
            }
        };

        state.next_handle += 1;
        let hw = 0x8000_0000 | state.next_handle;
        let loaded_auth = soft.auth.clone().or_else(|| auth.map(|a| a.to_vec()));
        state.loaded.insert(
            hw,
            Loaded {
                secret: soft.secret,
                auth: loaded_auth,
                has_private,
            },
        );
        state.loads += 1;
        Ok(HwHandle(hw))
    }

    fn evict(&self, handle: HwHandle) -> Result<(), TransportError> {
        let mut state = self.state()?;
        state
            .loaded
            .remove(&handle.0)
            .ok_or(TransportError::UnknownHandle(handle.0))?;
        state.evictions += 1;
        if state.fail_evicts {
            return Err(TransportError::Evict("injected evict failure".into()));
        }
        Ok(())
    }

    fn sign(
        &self,
        handle: HwHandle,
        auth: Option<&[u8]>,
        mechanism: CK_MECHANISM_TYPE,
        data: &[u8],
    ) -> Result<Vec<u8>, TransportError> {
        let state = self.state()?;
        let loaded = state
            .loaded
            .get(&handle.0)
            .ok_or(TransportError::UnknownHandle(handle.0))?;
        if !loaded.has_private {
            return Err(TransportError::Unsupported("public object cannot sign".into()));
        }
        check_auth(&loaded.auth, auth)?;
        match mechanism {
            CKM_RSA_PKCS | CKM_SHA256_RSA_PKCS | CKM_ECDSA | CKM_ECDSA_SHA256 => {
                Ok(soft_sign(&loaded.secret, data))
            }
            other => Err(TransportError::Unsupported(format!("mechanism {other:#x}"))),
        }
    }

    fn decrypt(
        &self,
        handle: HwHandle,
        auth: Option<&[u8]>,
        mechanism: CK_MECHANISM_TYPE,
        data: &[u8],
    ) -> Result<Vec<u8>, TransportError> {
        let state = self.state()?;
        let loaded = state
            .loaded
            .get(&handle.0)
            .ok_or(TransportError::UnknownHandle(handle.0))?;
        if !loaded.has_private {
            return Err(TransportError::Unsupported("public object cannot decrypt".into()));
        }
        check_auth(&loaded.auth, auth)?;
        match mechanism {
            CKM_RSA_PKCS | CKM_RSA_PKCS_OAEP => Ok(data
                .iter()
                .zip(loaded.secret.iter().cycle())
                .map(|(d, k)| d ^ k)
                .collect()),
            other => Err(TransportError::Unsupported(format!("mechanism {other:#x}"))),
        }
    }

    fn read_public(&self, persistent_handle: u32) -> Result<PublicInfo, TransportError> {
        let state = self.state()?;
        let key = state
            .persistent
            .get(&persistent_handle)
            .ok_or_else(|| TransportError::Device(format!("no persistent object at {persistent_handle:#x}")))?;
        Ok(PublicInfo {
            key_type: key.key_type,
            public_blob: key.public.clone(),
            public_attrs: key.public_attrs.clone(),
            serialized_tr: Some(persistent_handle.to_be_bytes().to_vec()),
        })
    }

    fn create_key(&self, spec: &KeySpec) -> Result<KeyMaterial, TransportError> {
        let bits = match spec.key_type {
            CKK_RSA => spec.modulus_bits.unwrap_or(2048),
            CKK_EC => {
                let params = spec.ec_params.as_deref().unwrap_or(EC_PARAMS_P256);
                if params != EC_PARAMS_P256 && params != EC_PARAMS_P384 {
                    return Err(TransportError::Unsupported("curve".into()));
                }
                0
            }
            CKK_AES => spec.value_len.unwrap_or(32) * 8,
            other => return Err(TransportError::Unsupported(format!("key type {other:#x}"))),
        };
        let key = Self::new_key(spec.key_type, bits, spec.ec_params.as_deref());
        let material = KeyMaterial {
            public: key.public.clone(),
            private: key.secret.to_vec(),
            public_attrs: key.public_attrs.clone(),
        };
        self.state()?.by_public.insert(key.public.clone(), key);
        Ok(material)
    }
}
