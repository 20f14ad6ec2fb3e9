use serde::{Deserialize, Serialize};

use crate::object::Attribute;

pub const RECORD_VERSION: u8 = 1;

/// Serialized form of one token object. Clear-text authorization and
/// hardware handles are never part of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRecord {
    pub version:           u8,
    pub id:                u32,
    pub link:              Option<u32>,
    pub public_blob:       Option<Vec<u8>>,   // TPM2B_PUBLIC marshaled
    pub private_blob:      Option<Vec<u8>>,   // TPM2B_PRIVATE marshaled
    pub wrapped_auth:      Option<Vec<u8>>,
    pub persistent_handle: Option<u32>,
    pub serialized_tr:     Option<Vec<u8>>,   // ESYS_TR for persistent handles
    pub attrs:             Vec<Attribute>,
}
