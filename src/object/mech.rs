//! Mechanism compatibility and output sizing for key objects.

use std::mem::size_of;

use cryptoki_sys::*;

use super::{ObjectError, TokenObject};

/// DER OID for NIST P-256 as carried in `CKA_EC_PARAMS`.
pub const EC_PARAMS_P256: &[u8] = &[0x06, 0x08, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x03, 0x01, 0x07];
/// DER OID for NIST P-384.
pub const EC_PARAMS_P384: &[u8] = &[0x06, 0x05, 0x2b, 0x81, 0x04, 0x00, 0x22];
/// DER OID for NIST P-521.
pub const EC_PARAMS_P521: &[u8] = &[0x06, 0x05, 0x2b, 0x81, 0x04, 0x00, 0x23];

const RSA_MECHS: &[CK_MECHANISM_TYPE] = &[
    CKM_RSA_PKCS,
    CKM_RSA_PKCS_OAEP,
    CKM_RSA_PKCS_PSS,
    CKM_SHA256_RSA_PKCS,
    CKM_SHA256_RSA_PKCS_PSS,
];
const EC_MECHS: &[CK_MECHANISM_TYPE] = &[CKM_ECDSA, CKM_ECDSA_SHA256];
const AES_MECHS: &[CK_MECHANISM_TYPE] = &[CKM_AES_ECB, CKM_AES_CBC, CKM_AES_CBC_PAD];

/// Field size in bytes of a curve given its DER OID.
pub fn curve_field_bytes(ec_params: &[u8]) -> Option<usize> {
    match ec_params {
        p if p == EC_PARAMS_P256 => Some(32),
        p if p == EC_PARAMS_P384 => Some(48),
        p if p == EC_PARAMS_P521 => Some(66),
        _ => None,
    }
}

fn allowed_mechanisms(obj: &TokenObject) -> Option<Vec<CK_MECHANISM_TYPE>> {
    let attr = obj.attrs().get(CKA_ALLOWED_MECHANISMS)?;
    Some(
        attr.value
            .chunks_exact(size_of::<CK_ULONG>())
            .filter_map(|c| c.try_into().ok().map(CK_ULONG::from_ne_bytes))
            .collect(),
    )
}

/// `holder` is the object that carries the key's descriptive attributes,
/// already resolved through the link.
pub fn mech_is_supported(holder: &TokenObject, mech: CK_MECHANISM_TYPE) -> Result<(), ObjectError> {
    let by_type = match holder.key_type() {
        Some(CKK_RSA) => RSA_MECHS,
        Some(CKK_EC) => EC_MECHS,
        Some(CKK_AES) => AES_MECHS,
        _ => return Err(ObjectError::MechanismInvalid(mech)),
    };
    if !by_type.contains(&mech) {
        return Err(ObjectError::MechanismInvalid(mech));
    }
    if let Some(allowed) = allowed_mechanisms(holder) {
        if !allowed.contains(&mech) {
            return Err(ObjectError::MechanismInvalid(mech));
        }
    }
    Ok(())
}

/// Smallest output buffer an operation with `mech` on this key may need.
pub fn min_buf_size(holder: &TokenObject, mech: CK_MECHANISM_TYPE) -> Result<usize, ObjectError> {
    mech_is_supported(holder, mech)?;
    let attrs = holder.attrs();
    let missing = ObjectError::General {
        op: "min_buf_size",
        id: holder.id(),
    };
    match holder.key_type() {
        Some(CKK_RSA) => {
            if let Some(bits) = attrs.get_ulong(CKA_MODULUS_BITS) {
                return Ok((bits as usize).div_ceil(8));
            }
            attrs
                .get(CKA_MODULUS)
                .map(|m| m.value.len())
                .ok_or(missing)
        }
        Some(CKK_EC) => attrs
            .get(CKA_EC_PARAMS)
            .and_then(|p| curve_field_bytes(&p.value))
            .map(|n| n * 2)
            .ok_or(missing),
        Some(CKK_AES) => Ok(16),
        _ => Err(ObjectError::MechanismInvalid(mech)),
    }
}

/// Whether `obj` carries the attributes that describe its key material.
pub fn describes_key(obj: &TokenObject) -> bool {
    let attrs = obj.attrs();
    match obj.key_type() {
        Some(CKK_RSA) => attrs.contains(CKA_MODULUS) || attrs.contains(CKA_MODULUS_BITS),
        Some(CKK_EC) => attrs.contains(CKA_EC_PARAMS),
        Some(_) => true,
        None => false,
    }
}
