pub mod attrs;
pub mod auth;
pub mod init;
pub(crate) mod link;
pub mod mech;
pub mod registry;
pub mod search;
pub mod tobject;
mod usage;

use std::fmt;

use cryptoki_sys::*;
use serde::{Deserialize, Serialize};

use crate::store::StoreError;
use crate::transport::TransportError;

pub use attrs::{AttrList, AttrRequest, Attribute};
pub use auth::SessionAuth;
pub use init::{ImportOnlyInitializer, NativeInitializer, ObjectInitializer};
pub use registry::{ImportRequest, ObjectInfo, Registry};
pub use search::FindSession;
pub use tobject::TokenObject;

/// First id the registry hands out on its own. Ids below it belong to
/// provisioning tools.
pub const AUTO_ID_BASE: u32 = 0x1_0000;

/// Durable object id, stable across restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId(pub u32);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}", self.0)
    }
}

/// Identity of a caller session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub u64);

#[derive(Debug, thiserror::Error)]
pub enum ObjectError {
    #[error("host memory")]
    HostMemory,
    #[error("template incomplete: {0}")]
    TemplateIncomplete(&'static str),
    #[error("template inconsistent: {0}")]
    TemplateInconsistent(&'static str),
    #[error("attribute type invalid: {0:#x}")]
    AttributeTypeInvalid(CK_ATTRIBUTE_TYPE),
    #[error("attribute value invalid: {0:#x}")]
    AttributeValueInvalid(CK_ATTRIBUTE_TYPE),
    #[error("attribute {0:#x} is sensitive")]
    AttributeSensitive(CK_ATTRIBUTE_TYPE),
    #[error("buffer too small for attribute {kind:#x}: {required} bytes required")]
    BufferTooSmall {
        kind: CK_ATTRIBUTE_TYPE,
        required: usize,
    },
    #[error("action prohibited: {0}")]
    ActionProhibited(&'static str),
    #[error("object handle invalid: {0}")]
    HandleInvalid(CK_OBJECT_HANDLE),
    #[error("find operation already active")]
    OperationActive,
    #[error("find operation not initialized")]
    OperationNotInitialized,
    #[error("mechanism {0:#x} invalid for this key")]
    MechanismInvalid(CK_MECHANISM_TYPE),
    #[error("key function not permitted: {0}")]
    KeyFunctionNotPermitted(&'static str),
    #[error("not authenticated")]
    NotAuthenticated,
    #[error("authorization incorrect")]
    PinIncorrect,
    #[error("internal accounting violation in {op} on object {id}")]
    General { op: &'static str, id: ObjectId },
    #[error("registry lock poisoned")]
    LockPoisoned,
    #[error("device: {0}")]
    Device(#[from] TransportError),
    #[error("store: {0}")]
    Store(#[from] StoreError),
}

impl ObjectError {
    /// The PKCS#11 return value reported to the API layer.
    pub fn ckr(&self) -> CK_RV {
        match self {
            Self::HostMemory => CKR_HOST_MEMORY,
            Self::TemplateIncomplete(_) => CKR_TEMPLATE_INCOMPLETE,
            Self::TemplateInconsistent(_) => CKR_TEMPLATE_INCONSISTENT,
            Self::AttributeTypeInvalid(_) => CKR_ATTRIBUTE_TYPE_INVALID,
            Self::AttributeValueInvalid(_) => CKR_ATTRIBUTE_VALUE_INVALID,
            Self::AttributeSensitive(_) => CKR_ATTRIBUTE_SENSITIVE,
            Self::BufferTooSmall { .. } => CKR_BUFFER_TOO_SMALL,
            Self::ActionProhibited(_) => CKR_ACTION_PROHIBITED,
            Self::HandleInvalid(_) => CKR_OBJECT_HANDLE_INVALID,
            Self::OperationActive => CKR_OPERATION_ACTIVE,
            Self::OperationNotInitialized => CKR_OPERATION_NOT_INITIALIZED,
            Self::MechanismInvalid(_) => CKR_MECHANISM_INVALID,
            Self::KeyFunctionNotPermitted(_) => CKR_KEY_FUNCTION_NOT_PERMITTED,
            Self::NotAuthenticated => CKR_USER_NOT_LOGGED_IN,
            Self::PinIncorrect => CKR_PIN_INCORRECT,
            Self::General { .. } | Self::LockPoisoned => CKR_GENERAL_ERROR,
            Self::Device(_) | Self::Store(_) => CKR_DEVICE_ERROR,
        }
    }

    /// True for errors that point at a caller or integration bug rather
    /// than a user-facing condition.
    pub fn is_internal(&self) -> bool {
        matches!(self, Self::General { .. } | Self::LockPoisoned)
    }
}

/// Deep copy that reports allocation failure instead of aborting.
pub(crate) fn dup(bytes: &[u8]) -> Result<Vec<u8>, ObjectError> {
    let mut out = Vec::new();
    out.try_reserve_exact(bytes.len())
        .map_err(|_| ObjectError::HostMemory)?;
    out.extend_from_slice(bytes);
    Ok(out)
}
