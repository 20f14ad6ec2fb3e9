//! Pluggable filling-in of key material for objects created from a template.

use cryptoki_sys::*;

use super::attrs::{self, Attribute};
use super::{ObjectError, TokenObject};
use crate::transport::{KeySpec, Transport};

pub trait ObjectInitializer: Send + Sync {
    /// Called for key objects that arrive without blobs.
    fn init_from_attrs(&self, transport: &dyn Transport, obj: &mut TokenObject) -> Result<(), ObjectError>;
}

/// Generates fresh key material in the device.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeInitializer;

/// Accepts only objects whose material is supplied up front.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImportOnlyInitializer;

pub(crate) fn key_spec(obj: &TokenObject) -> Result<KeySpec, ObjectError> {
    let key_type = obj
        .key_type()
        .ok_or(ObjectError::TemplateIncomplete("CKA_KEY_TYPE"))?;
    let attrs = obj.attrs();
    let spec = KeySpec {
        key_type,
        modulus_bits: attrs.get_ulong(CKA_MODULUS_BITS),
        ec_params: attrs.get(CKA_EC_PARAMS).map(|a| a.value.clone()),
        value_len: attrs.get_ulong(CKA_VALUE_LEN),
    };
    match key_type {
        CKK_RSA if spec.modulus_bits.is_none() => {
            Err(ObjectError::TemplateIncomplete("CKA_MODULUS_BITS"))
        }
        CKK_EC if spec.ec_params.is_none() => Err(ObjectError::TemplateIncomplete("CKA_EC_PARAMS")),
        _ => Ok(spec),
    }
}

impl ObjectInitializer for NativeInitializer {
    fn init_from_attrs(&self, transport: &dyn Transport, obj: &mut TokenObject) -> Result<(), ObjectError> {
        let spec = key_spec(obj)?;
        let material = transport.create_key(&spec)?;
        obj.set_blob_data(&material.public, Some(&material.private))?;
        for attr in material.public_attrs {
            obj.attrs.upsert(attr);
        }
        obj.attrs.upsert(Attribute::bool(CKA_LOCAL, true));
        let gen_mech = match spec.key_type {
            CKK_RSA => CKM_RSA_PKCS_KEY_PAIR_GEN,
            CKK_EC => CKM_EC_KEY_PAIR_GEN,
            _ => CKM_AES_KEY_GEN,
        };
        obj.attrs.upsert(Attribute::ulong(CKA_KEY_GEN_MECHANISM, gen_mech));
        tracing::debug!(key_type = spec.key_type, "Generated key material");
        Ok(())
    }
}

impl ObjectInitializer for ImportOnlyInitializer {
    fn init_from_attrs(&self, _transport: &dyn Transport, _obj: &mut TokenObject) -> Result<(), ObjectError> {
        Err(ObjectError::TemplateIncomplete("key material (CKA_TPM2_PUB_BLOB)"))
    }
}

/// Move the public-class attributes of a freshly initialized private half
/// onto its public counterpart.
pub(crate) fn split_public(private: &mut TokenObject, public: &mut TokenObject) {
    let kinds: Vec<CK_ATTRIBUTE_TYPE> = private
        .attrs()
        .iter()
        .map(|a| a.kind)
        .filter(|k| attrs::is_public_class(*k))
        .collect();
    for kind in kinds {
        if let Some(attr) = private.attrs.remove(kind) {
            public.attrs.upsert(attr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::mech::EC_PARAMS_P256;
    use crate::object::AttrList;
    use crate::transport::MemTransport;

    fn template(attrs: &[Attribute]) -> TokenObject {
        TokenObject::new(AttrList::from_template(attrs).unwrap())
    }

    #[test]
    fn test_native_generates_material() {
        let transport = MemTransport::new();
        let mut obj = template(&[
            Attribute::ulong(CKA_CLASS, CKO_PRIVATE_KEY),
            Attribute::ulong(CKA_KEY_TYPE, CKK_EC),
            Attribute::new(CKA_EC_PARAMS, EC_PARAMS_P256.to_vec()),
        ]);
        NativeInitializer.init_from_attrs(&transport, &mut obj).unwrap();
        assert!(obj.public_blob().is_some());
        assert!(obj.private_blob().is_some());
        assert!(obj.attrs().contains(CKA_EC_POINT));
        assert_eq!(obj.attrs().get_bool(CKA_LOCAL), Some(true));
    }

    #[test]
    fn test_native_requires_size() {
        let transport = MemTransport::new();
        let mut obj = template(&[
            Attribute::ulong(CKA_CLASS, CKO_PRIVATE_KEY),
            Attribute::ulong(CKA_KEY_TYPE, CKK_RSA),
        ]);
        let err = NativeInitializer.init_from_attrs(&transport, &mut obj).unwrap_err();
        assert!(matches!(err, ObjectError::TemplateIncomplete("CKA_MODULUS_BITS")));
        assert!(obj.public_blob().is_none());
    }

    #[test]
    fn test_import_only_refuses() {
        let transport = MemTransport::new();
        let mut obj = template(&[Attribute::ulong(CKA_KEY_TYPE, CKK_EC)]);
        assert!(ImportOnlyInitializer.init_from_attrs(&transport, &mut obj).is_err());
    }

    #[test]
    fn test_split_public_moves_key_attributes() {
        let transport = MemTransport::new();
        let mut private = template(&[
            Attribute::ulong(CKA_CLASS, CKO_PRIVATE_KEY),
            Attribute::ulong(CKA_KEY_TYPE, CKK_EC),
            Attribute::new(CKA_EC_PARAMS, EC_PARAMS_P256.to_vec()),
        ]);
        NativeInitializer.init_from_attrs(&transport, &mut private).unwrap();
        let mut public = template(&[Attribute::ulong(CKA_CLASS, CKO_PUBLIC_KEY)]);
        split_public(&mut private, &mut public);
        assert!(!private.attrs().contains(CKA_EC_POINT));
        assert!(!private.attrs().contains(CKA_EC_PARAMS));
        assert!(public.attrs().contains(CKA_EC_POINT));
        assert!(public.attrs().contains(CKA_EC_PARAMS));
    }
}
