use super::TpmError;
use crate::object::Attribute;
use crate::object::mech::{EC_PARAMS_P256, EC_PARAMS_P384, EC_PARAMS_P521};
use cryptoki_sys::*;
use sha2::Digest as ShaDigest;
use sha2::Sha256;
use std::convert::TryFrom;
use std::convert::TryInto;
use tss_esapi::Context;
use tss_esapi::attributes::ObjectAttributesBuilder;
use tss_esapi::constants::tss::TPM2_RH_NULL;
use tss_esapi::constants::tss::TPM2_ST_HASHCHECK;
use tss_esapi::handles::KeyHandle;
use tss_esapi::handles::ObjectHandle;
use tss_esapi::handles::PersistentTpmHandle;
use tss_esapi::handles::TpmHandle;
use tss_esapi::interface_types::algorithm::HashingAlgorithm;
use tss_esapi::interface_types::algorithm::PublicAlgorithm;
use tss_esapi::interface_types::ecc::EccCurve;
use tss_esapi::interface_types::key_bits::RsaKeyBits;
use tss_esapi::interface_types::resource_handles::Hierarchy;
use tss_esapi::structures::Auth;
use tss_esapi::structures::Data;
use tss_esapi::structures::Digest;
use tss_esapi::structures::EccPoint;
use tss_esapi::structures::EccScheme;
use tss_esapi::structures::HashScheme;
use tss_esapi::structures::HashcheckTicket;
use tss_esapi::structures::Private;
use tss_esapi::structures::Public;
use tss_esapi::structures::PublicBuilder;
use tss_esapi::structures::PublicEccParametersBuilder;
use tss_esapi::structures::PublicKeyRsa;
use tss_esapi::structures::PublicRsaParametersBuilder;
use tss_esapi::structures::RsaDecryptionScheme;
use tss_esapi::structures::RsaExponent;
use tss_esapi::structures::RsaScheme;
use tss_esapi::structures::Signature;
use tss_esapi::structures::SignatureScheme;
use tss_esapi::structures::SymmetricDefinitionObject;
use tss_esapi::traits::Marshall;
use tss_esapi::traits::UnMarshall;
use tss_esapi::tss2_esys::TPMT_TK_HASHCHECK;

/// Storage primary under the owner hierarchy. Deterministic for a given
/// TPM, so blobs created under it reload across restarts.
pub fn create_primary(ctx: &mut Context) -> Result<KeyHandle, TpmError> {
    let ecc_params = PublicEccParametersBuilder::new_restricted_decryption_key(
        SymmetricDefinitionObject::AES_128_CFB,
        EccCurve::NistP256,
    )
    .build()
    .map_err(|e| TpmError::Key(e.to_string()))?;

    let attrs = ObjectAttributesBuilder::new()
        .with_fixed_tpm(true)
        .with_fixed_parent(true)
        .with_sensitive_data_origin(true)
        .with_user_with_auth(true)
        .with_restricted(true)
        .with_decrypt(true)
        .build()
        .map_err(|e| TpmError::Key(e.to_string()))?;

    let pub_template = PublicBuilder::new()
        .with_public_algorithm(PublicAlgorithm::Ecc)
        .with_name_hashing_algorithm(HashingAlgorithm::Sha256)
        .with_object_attributes(attrs)
        .with_ecc_parameters(ecc_params)
        .with_ecc_unique_identifier(EccPoint::default())
        .build()
        .map_err(|e| TpmError::Key(e.to_string()))?;

    let result = ctx
        .execute_with_nullauth_session(|ctx| {
            ctx.create_primary(Hierarchy::Owner, pub_template, None, None, None, None)
        })
        .map_err(|e: tss_esapi::Error| TpmError::Key(e.to_string()))?;

    Ok(result.key_handle)
}

fn curve_for(ec_params: &[u8]) -> Result<EccCurve, TpmError> {
    match ec_params {
        p if p == EC_PARAMS_P256 => Ok(EccCurve::NistP256),
        p if p == EC_PARAMS_P384 => Ok(EccCurve::NistP384),
        p if p == EC_PARAMS_P521 => Ok(EccCurve::NistP521),
        _ => Err(TpmError::Unsupported("curve".into())),
    }
}

fn rsa_bits(bits: CK_ULONG) -> Result<RsaKeyBits, TpmError> {
    match bits {
        1024 => Ok(RsaKeyBits::Rsa1024),
        2048 => Ok(RsaKeyBits::Rsa2048),
        3072 => Ok(RsaKeyBits::Rsa3072),
        4096 => Ok(RsaKeyBits::Rsa4096),
        other => Err(TpmError::Unsupported(format!("RSA modulus of {other} bits"))),
    }
}

/// Template for an unrestricted child key. RSA keys sign and decrypt with
/// the scheme chosen per operation; EC keys sign with ECDSA.
fn child_template(key_type: CK_KEY_TYPE, bits: CK_ULONG, ec_params: &[u8]) -> Result<Public, TpmError> {
    let mut attrs = ObjectAttributesBuilder::new()
        .with_fixed_tpm(true)
        .with_fixed_parent(true)
        .with_sensitive_data_origin(true)
        .with_user_with_auth(true)
        .with_sign_encrypt(true);
    if key_type == CKK_RSA {
        attrs = attrs.with_decrypt(true);
    }
    let attrs = attrs.build().map_err(|e| TpmError::Key(e.to_string()))?;

    let builder = PublicBuilder::new()
        .with_name_hashing_algorithm(HashingAlgorithm::Sha256)
        .with_object_attributes(attrs);

    let builder = match key_type {
        CKK_RSA => {
            let params = PublicRsaParametersBuilder::new()
                .with_scheme(RsaScheme::Null)
                .with_key_bits(rsa_bits(bits)?)
                .with_exponent(RsaExponent::default())
                .with_is_signing_key(true)
                .with_is_decryption_key(true)
                .with_restricted(false)
                .build()
                .map_err(|e| TpmError::Key(e.to_string()))?;
            builder
                .with_public_algorithm(PublicAlgorithm::Rsa)
                .with_rsa_parameters(params)
                .with_rsa_unique_identifier(PublicKeyRsa::default())
        }
        CKK_EC => {
            let scheme = EccScheme::EcDsa(HashScheme::new(HashingAlgorithm::Sha256));
            let params = PublicEccParametersBuilder::new_unrestricted_signing_key(scheme, curve_for(ec_params)?)
                .build()
                .map_err(|e| TpmError::Key(e.to_string()))?;
            builder
                .with_public_algorithm(PublicAlgorithm::Ecc)
                .with_ecc_parameters(params)
                .with_ecc_unique_identifier(EccPoint::default())
        }
        other => return Err(TpmError::Unsupported(format!("key type {other:#x}"))),
    };
    builder.build().map_err(|e| TpmError::Key(e.to_string()))
}

/// Create a child key under `primary`. Returns (private, public) blobs.
pub fn create_child_key(
    ctx: &mut Context,
    primary: KeyHandle,
    key_type: CK_KEY_TYPE,
    bits: CK_ULONG,
    ec_params: &[u8],
) -> Result<(Vec<u8>, Vec<u8>), TpmError> {
    let pub_template = child_template(key_type, bits, ec_params)?;

    let result = ctx
        .execute_with_nullauth_session(|ctx| {
            ctx.create(primary, pub_template, None, None, None, None)
        })
        .map_err(|e: tss_esapi::Error| TpmError::Key(e.to_string()))?;

    let private_bytes = result.out_private.value().to_vec();
    let public_bytes = result
        .out_public
        .marshall()
        .map_err(|e| TpmError::Key(e.to_string()))?;

    Ok((private_bytes, public_bytes))
}

pub fn load_key(
    ctx: &mut Context,
    primary: KeyHandle,
    private_bytes: &[u8],
    public_bytes: &[u8],
) -> Result<KeyHandle, TpmError> {
    let private =
        Private::try_from(private_bytes.to_vec()).map_err(|e| TpmError::Key(e.to_string()))?;
    let public = Public::unmarshall(public_bytes).map_err(|e| TpmError::Key(e.to_string()))?;

    ctx.execute_with_nullauth_session(|ctx| ctx.load(primary, private, public))
        .map_err(|e: tss_esapi::Error| TpmError::Key(e.to_string()))
}

/// Load only the public area, for public-key objects.
pub fn load_public(ctx: &mut Context, public_bytes: &[u8]) -> Result<KeyHandle, TpmError> {
    let public = Public::unmarshall(public_bytes).map_err(|e| TpmError::Key(e.to_string()))?;
    ctx.load_external_public(public, Hierarchy::Null)
        .map_err(|e| TpmError::Key(e.to_string()))
}

/// ESYS_TR for a persistent object, from the cached serialization when one
/// is available.
pub fn open_persistent(
    ctx: &mut Context,
    handle: u32,
    serialized_tr: Option<&[u8]>,
) -> Result<ObjectHandle, TpmError> {
    if let Some(tr) = serialized_tr {
        match ctx.tr_deserialize(tr) {
            Ok(obj) => return Ok(obj),
            Err(e) => tracing::debug!(handle, error = %e, "Cached ESYS_TR unusable, reading from TPM"),
        }
    }
    let tpm_handle = PersistentTpmHandle::new(handle).map_err(|e| TpmError::Key(e.to_string()))?;
    ctx.tr_from_tpm_public(TpmHandle::Persistent(tpm_handle))
        .map_err(|e| TpmError::Key(e.to_string()))
}

pub fn set_auth(ctx: &mut Context, handle: ObjectHandle, auth: &[u8]) -> Result<(), TpmError> {
    let auth = Auth::try_from(auth.to_vec()).map_err(|e| TpmError::Key(e.to_string()))?;
    ctx.tr_set_auth(handle, auth)
        .map_err(|e| TpmError::Key(e.to_string()))
}

/// Public area of a persistent object plus its serialized ESYS_TR. The
/// temporary TR is closed before returning.
pub fn read_persistent_public(ctx: &mut Context, handle: u32) -> Result<(Public, Vec<u8>), TpmError> {
    let mut obj = open_persistent(ctx, handle, None)?;
    let result = ctx
        .read_public(KeyHandle::from(obj))
        .map_err(|e| TpmError::Key(e.to_string()))
        .and_then(|(public, _, _)| {
            let tr = ctx.tr_serialize(obj).map_err(|e| TpmError::Key(e.to_string()))?;
            Ok((public, tr))
        });
    if let Err(e) = ctx.tr_close(&mut obj) {
        tracing::warn!(handle, error = %e, "tr_close failed");
    }
    result
}

fn hash_alg_for_len(len: usize) -> Result<HashingAlgorithm, TpmError> {
    match len {
        32 => Ok(HashingAlgorithm::Sha256),
        48 => Ok(HashingAlgorithm::Sha384),
        64 => Ok(HashingAlgorithm::Sha512),
        other => Err(TpmError::Unsupported(format!("{other}-byte digest"))),
    }
}

fn null_ticket() -> Result<HashcheckTicket, TpmError> {
    let raw_ticket = TPMT_TK_HASHCHECK {
        tag: TPM2_ST_HASHCHECK,
        hierarchy: TPM2_RH_NULL,
        digest: Default::default(),
    };
    raw_ticket
        .try_into()
        .map_err(|e: tss_esapi::Error| TpmError::Key(e.to_string()))
}

/// Fixed-width big-endian component, left-padded with zeros.
fn pad_left(bytes: &[u8], width: usize) -> Vec<u8> {
    let take = bytes.len().min(width);
    let mut out = vec![0u8; width - take];
    out.extend_from_slice(&bytes[bytes.len() - take..]);
    out
}

/// Sign `data` with the loaded key according to a PKCS#11 mechanism.
/// `*_SHA256` mechanisms hash here; bare ones expect a digest. ECDSA
/// signatures come back as `r || s`.
pub fn sign(
    ctx: &mut Context,
    key: KeyHandle,
    mechanism: CK_MECHANISM_TYPE,
    data: &[u8],
) -> Result<Vec<u8>, TpmError> {
    let (digest, scheme) = match mechanism {
        CKM_RSA_PKCS => return rsa_pkcs1_sign(ctx, key, data),
        CKM_SHA256_RSA_PKCS => (
            Sha256::digest(data).to_vec(),
            SignatureScheme::RsaSsa {
                hash_scheme: HashScheme::new(HashingAlgorithm::Sha256),
            },
        ),
        CKM_SHA256_RSA_PKCS_PSS => (
            Sha256::digest(data).to_vec(),
            SignatureScheme::RsaPss {
                hash_scheme: HashScheme::new(HashingAlgorithm::Sha256),
            },
        ),
        CKM_RSA_PKCS_PSS => (
            data.to_vec(),
            SignatureScheme::RsaPss {
                hash_scheme: HashScheme::new(hash_alg_for_len(data.len())?),
            },
        ),
        CKM_ECDSA_SHA256 => (
            Sha256::digest(data).to_vec(),
            SignatureScheme::EcDsa {
                hash_scheme: HashScheme::new(HashingAlgorithm::Sha256),
            },
        ),
        CKM_ECDSA => {
            let alg = hash_alg_for_len(data.len())?;
            (data.to_vec(), SignatureScheme::EcDsa { hash_scheme: HashScheme::new(alg) })
        }
        other => return Err(TpmError::Unsupported(format!("mechanism {other:#x}"))),
    };
    let digest = Digest::try_from(digest).map_err(|e| TpmError::Key(e.to_string()))?;
    let validation = null_ticket()?;

    let signature = ctx
        .execute_with_nullauth_session(|ctx| ctx.sign(key, digest, scheme, validation))
        .map_err(|e: tss_esapi::Error| TpmError::Key(e.to_string()))?;

    match signature {
        Signature::EcDsa(ecc_sig) => {
            let r = ecc_sig.signature_r().value();
            let s = ecc_sig.signature_s().value();
            let width = r.len().max(s.len());
            let mut out = pad_left(r, width);
            out.extend_from_slice(&pad_left(s, width));
            Ok(out)
        }
        Signature::RsaSsa(rsa_sig) | Signature::RsaPss(rsa_sig) => {
            Ok(rsa_sig.signature().value().to_vec())
        }
        _ => Err(TpmError::Key("unexpected signature algorithm".into())),
    }
}

fn modulus_len(ctx: &mut Context, key: KeyHandle) -> Result<usize, TpmError> {
    let (public, _, _) = ctx
        .read_public(key)
        .map_err(|e| TpmError::Key(e.to_string()))?;
    match public {
        Public::Rsa { unique, .. } => Ok(unique.value().len()),
        _ => Err(TpmError::Key("not an RSA key".into())),
    }
}

/// CKM_RSA_PKCS signs a caller-built DigestInfo, which the TPM only offers
/// as a raw private-key operation over an EMSA-PKCS1-v1_5 block.
fn rsa_pkcs1_sign(ctx: &mut Context, key: KeyHandle, data: &[u8]) -> Result<Vec<u8>, TpmError> {
    let k = modulus_len(ctx, key)?;
    if data.len() + 11 > k {
        return Err(TpmError::Key("input too long for modulus".into()));
    }
    let mut block = vec![0xffu8; k];
    block[0] = 0x00;
    block[1] = 0x01;
    block[k - data.len() - 1] = 0x00;
    block[k - data.len()..].copy_from_slice(data);

    let input = PublicKeyRsa::try_from(block).map_err(|e| TpmError::Key(e.to_string()))?;
    let out = ctx
        .execute_with_nullauth_session(|ctx| {
            ctx.rsa_decrypt(key, input, RsaDecryptionScheme::Null, Data::default())
        })
        .map_err(|e: tss_esapi::Error| TpmError::Key(e.to_string()))?;
    Ok(pad_left(out.value(), k))
}

pub fn rsa_decrypt(
    ctx: &mut Context,
    key: KeyHandle,
    mechanism: CK_MECHANISM_TYPE,
    data: &[u8],
) -> Result<Vec<u8>, TpmError> {
    let scheme = match mechanism {
        CKM_RSA_PKCS => RsaDecryptionScheme::RsaEs,
        CKM_RSA_PKCS_OAEP => RsaDecryptionScheme::Oaep(HashScheme::new(HashingAlgorithm::Sha256)),
        other => return Err(TpmError::Unsupported(format!("mechanism {other:#x}"))),
    };
    let input = PublicKeyRsa::try_from(data.to_vec()).map_err(|e| TpmError::Key(e.to_string()))?;
    let out = ctx
        .execute_with_nullauth_session(|ctx| ctx.rsa_decrypt(key, input, scheme, Data::default()))
        .map_err(|e: tss_esapi::Error| TpmError::Key(e.to_string()))?;
    Ok(out.value().to_vec())
}

pub fn flush(ctx: &mut Context, handle: ObjectHandle) -> Result<(), TpmError> {
    ctx.flush_context(handle)
        .map_err(|e| TpmError::Key(e.to_string()))
}

pub fn close(ctx: &mut Context, mut handle: ObjectHandle) -> Result<(), TpmError> {
    ctx.tr_close(&mut handle)
        .map_err(|e| TpmError::Key(e.to_string()))
}

/// DER OCTET STRING around an uncompressed point, as `CKA_EC_POINT` holds it.
fn der_octet_string(content: &[u8]) -> Vec<u8> {
    let mut out = vec![0x04];
    match content.len() {
        n if n < 0x80 => out.push(n as u8),
        n if n <= 0xff => out.extend_from_slice(&[0x81, n as u8]),
        n => out.extend_from_slice(&[0x82, (n >> 8) as u8, n as u8]),
    }
    out.extend_from_slice(content);
    out
}

fn curve_info(curve: EccCurve) -> Result<(&'static [u8], usize), TpmError> {
    match curve {
        EccCurve::NistP256 => Ok((EC_PARAMS_P256, 32)),
        EccCurve::NistP384 => Ok((EC_PARAMS_P384, 48)),
        EccCurve::NistP521 => Ok((EC_PARAMS_P521, 66)),
        _ => Err(TpmError::Unsupported("curve".into())),
    }
}

/// Key type and public-class attributes of a public area.
pub fn public_attrs(public: &Public) -> Result<(CK_KEY_TYPE, Vec<Attribute>), TpmError> {
    match public {
        Public::Rsa {
            parameters, unique, ..
        } => {
            let bits = u16::from(parameters.key_bits());
            let exponent = match parameters.exponent().value() {
                0 => 65537u32,
                e => e,
            };
            let exponent_bytes = exponent.to_be_bytes();
            let first = exponent_bytes.iter().position(|b| *b != 0).unwrap_or(3);
            Ok((
                CKK_RSA,
                vec![
                    Attribute::new(CKA_MODULUS, unique.value().to_vec()),
                    Attribute::ulong(CKA_MODULUS_BITS, CK_ULONG::from(bits)),
                    Attribute::new(CKA_PUBLIC_EXPONENT, exponent_bytes[first..].to_vec()),
                ],
            ))
        }
        Public::Ecc {
            parameters, unique, ..
        } => {
            let (oid, width) = curve_info(parameters.ecc_curve())?;
            let mut point = vec![0x04];
            point.extend_from_slice(&pad_left(unique.x().value(), width));
            point.extend_from_slice(&pad_left(unique.y().value(), width));
            Ok((
                CKK_EC,
                vec![
                    Attribute::new(CKA_EC_PARAMS, oid.to_vec()),
                    Attribute::new(CKA_EC_POINT, der_octet_string(&point)),
                ],
            ))
        }
        _ => Err(TpmError::Unsupported("public key algorithm".into())),
    }
}

pub fn public_attrs_from_blob(public_bytes: &[u8]) -> Result<(CK_KEY_TYPE, Vec<Attribute>), TpmError> {
    let public = Public::unmarshall(public_bytes).map_err(|e| TpmError::Key(e.to_string()))?;
    public_attrs(&public)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_der_octet_string_lengths() {
        assert_eq!(der_octet_string(&[1, 2]), vec![0x04, 0x02, 1, 2]);
        let p521 = vec![0u8; 133];
        let der = der_octet_string(&p521);
        assert_eq!(&der[..3], &[0x04, 0x81, 133]);
        assert_eq!(der.len(), 136);
    }

    #[test]
    fn test_pad_left() {
        assert_eq!(pad_left(&[1, 2], 4), vec![0, 0, 1, 2]);
        assert_eq!(pad_left(&[9, 1, 2], 2), vec![1, 2]);
    }

    #[test]
    fn test_unsupported_sizes() {
        assert!(rsa_bits(1000).is_err());
        assert!(hash_alg_for_len(20).is_err());
        assert!(curve_for(&[0x06, 0x01, 0x00]).is_err());
    }
}
