//! Contract with the hardware that actually holds key material.

pub mod mem;

use cryptoki_sys::{CK_KEY_TYPE, CK_MECHANISM_TYPE, CK_ULONG};
use zeroize::Zeroizing;

use crate::object::{Attribute, SessionAuth};

pub use mem::MemTransport;

/// A live reference to an object loaded in the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HwHandle(pub u32);

/// What the device needs to bring an object's key into use.
#[derive(Debug, Clone, Copy)]
pub enum KeyRef<'a> {
    /// Wrapped blobs created under the token's primary key. Public-only
    /// objects carry no private blob.
    Blobs {
        public: &'a [u8],
        private: Option<&'a [u8]>,
    },
    /// A key provisioned at a persistent handle outside this token.
    Persistent {
        handle: u32,
        serialized_tr: Option<&'a [u8]>,
    },
}

/// Parameters for native key generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpec {
    pub key_type: CK_KEY_TYPE,
    pub modulus_bits: Option<CK_ULONG>,
    pub ec_params: Option<Vec<u8>>,
    pub value_len: Option<CK_ULONG>,
}

/// Freshly generated key material.
#[derive(Debug, Clone)]
pub struct KeyMaterial {
    pub public: Vec<u8>,
    pub private: Vec<u8>,
    /// Public-class attributes describing the new key.
    pub public_attrs: Vec<Attribute>,
}

/// Public portion of a persistent key, as read back from the device.
#[derive(Debug, Clone)]
pub struct PublicInfo {
    pub key_type: CK_KEY_TYPE,
    pub public_blob: Vec<u8>,
    pub public_attrs: Vec<Attribute>,
    pub serialized_tr: Option<Vec<u8>>,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("load failed: {0}")]
    Load(String),
    #[error("evict failed: {0}")]
    Evict(String),
    #[error("auth unwrap failed: {0}")]
    Unwrap(String),
    #[error("unknown hardware handle {0:#x}")]
    UnknownHandle(u32),
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("device: {0}")]
    Device(String),
}

pub trait Transport: Send + Sync {
    fn load(&self, key: &KeyRef<'_>, auth: Option<&[u8]>) -> Result<HwHandle, TransportError>;

    fn evict(&self, handle: HwHandle) -> Result<(), TransportError>;

    /// Recover an object's clear-text authorization under a logged-in
    /// session.
    fn unwrap_auth(
        &self,
        wrapped: &[u8],
        session: &SessionAuth,
    ) -> Result<Zeroizing<Vec<u8>>, TransportError> {
        session.unwrap(wrapped)
    }

    fn sign(
        &self,
        handle: HwHandle,
        auth: Option<&[u8]>,
        mechanism: CK_MECHANISM_TYPE,
        data: &[u8],
    ) -> Result<Vec<u8>, TransportError>;

    fn decrypt(
        &self,
        handle: HwHandle,
        auth: Option<&[u8]>,
        mechanism: CK_MECHANISM_TYPE,
        data: &[u8],
    ) -> Result<Vec<u8>, TransportError>;

    fn read_public(&self, persistent_handle: u32) -> Result<PublicInfo, TransportError>;

    fn create_key(&self, spec: &KeySpec) -> Result<KeyMaterial, TransportError>;
}
