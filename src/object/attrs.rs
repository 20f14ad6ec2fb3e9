//! Typed attribute records and the per-object attribute list.

use std::mem::size_of;

use cryptoki_sys::*;
use serde::{Deserialize, Serialize};

use super::{dup, ObjectError};

pub const CKA_VENDOR_TPM2_DEFINED: CK_ATTRIBUTE_TYPE = 0x0F00_0000;
pub const CKA_TPM2_OBJAUTH_ENC: CK_ATTRIBUTE_TYPE = CKA_VENDOR_DEFINED | CKA_VENDOR_TPM2_DEFINED | 0x1;
pub const CKA_TPM2_PUB_BLOB: CK_ATTRIBUTE_TYPE = CKA_VENDOR_DEFINED | CKA_VENDOR_TPM2_DEFINED | 0x2;
pub const CKA_TPM2_PRIV_BLOB: CK_ATTRIBUTE_TYPE = CKA_VENDOR_DEFINED | CKA_VENDOR_TPM2_DEFINED | 0x3;
pub const CKA_TPM2_SERIALIZED_TR: CK_ATTRIBUTE_TYPE = CKA_VENDOR_DEFINED | CKA_VENDOR_TPM2_DEFINED | 0x5;
pub const CKA_TPM2_PERSISTENT_HANDLE: CK_ATTRIBUTE_TYPE =
    CKA_VENDOR_DEFINED | CKA_VENDOR_TPM2_DEFINED | 0x6;

const BOOL_ATTRS: &[CK_ATTRIBUTE_TYPE] = &[
    CKA_TOKEN,
    CKA_PRIVATE,
    CKA_MODIFIABLE,
    CKA_SENSITIVE,
    CKA_EXTRACTABLE,
    CKA_ALWAYS_SENSITIVE,
    CKA_NEVER_EXTRACTABLE,
    CKA_ALWAYS_AUTHENTICATE,
    CKA_LOCAL,
    CKA_ENCRYPT,
    CKA_DECRYPT,
    CKA_SIGN,
    CKA_VERIFY,
    CKA_WRAP,
    CKA_UNWRAP,
    CKA_DERIVE,
];

const ULONG_ATTRS: &[CK_ATTRIBUTE_TYPE] = &[
    CKA_CLASS,
    CKA_KEY_TYPE,
    CKA_CERTIFICATE_TYPE,
    CKA_MODULUS_BITS,
    CKA_VALUE_LEN,
    CKA_KEY_GEN_MECHANISM,
];

const IMMUTABLE_ATTRS: &[CK_ATTRIBUTE_TYPE] = &[
    CKA_CLASS,
    CKA_KEY_TYPE,
    CKA_TOKEN,
    CKA_PRIVATE,
    CKA_MODULUS,
    CKA_MODULUS_BITS,
    CKA_PUBLIC_EXPONENT,
    CKA_EC_PARAMS,
    CKA_EC_POINT,
    CKA_VALUE_LEN,
    CKA_LOCAL,
    CKA_KEY_GEN_MECHANISM,
    CKA_ALWAYS_SENSITIVE,
    CKA_NEVER_EXTRACTABLE,
];

const PUBLIC_CLASS_ATTRS: &[CK_ATTRIBUTE_TYPE] = &[
    CKA_MODULUS,
    CKA_MODULUS_BITS,
    CKA_PUBLIC_EXPONENT,
    CKA_EC_PARAMS,
    CKA_EC_POINT,
];

const SENSITIVE_ATTRS: &[CK_ATTRIBUTE_TYPE] = &[
    CKA_PRIVATE_EXPONENT,
    CKA_PRIME_1,
    CKA_PRIME_2,
    CKA_EXPONENT_1,
    CKA_EXPONENT_2,
    CKA_COEFFICIENT,
];

pub fn is_vendor_tpm2(kind: CK_ATTRIBUTE_TYPE) -> bool {
    kind & (CKA_VENDOR_DEFINED | CKA_VENDOR_TPM2_DEFINED) == CKA_VENDOR_DEFINED | CKA_VENDOR_TPM2_DEFINED
}

/// Attributes that may not change once the object exists.
pub fn is_immutable(kind: CK_ATTRIBUTE_TYPE) -> bool {
    IMMUTABLE_ATTRS.contains(&kind) || is_vendor_tpm2(kind)
}

/// Attributes describing public key material, served by the public half of a
/// linked pair.
pub fn is_public_class(kind: CK_ATTRIBUTE_TYPE) -> bool {
    PUBLIC_CLASS_ATTRS.contains(&kind)
}

pub fn is_sensitive(kind: CK_ATTRIBUTE_TYPE) -> bool {
    SENSITIVE_ATTRS.contains(&kind) || is_vendor_tpm2(kind)
}

/// One (type, value) record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    pub kind: CK_ATTRIBUTE_TYPE,
    pub value: Vec<u8>,
}

impl Attribute {
    pub fn new(kind: CK_ATTRIBUTE_TYPE, value: impl Into<Vec<u8>>) -> Self {
        Self {
            kind,
            value: value.into(),
        }
    }

    pub fn bool(kind: CK_ATTRIBUTE_TYPE, value: bool) -> Self {
        Self::new(kind, vec![value as CK_BBOOL])
    }

    pub fn ulong(kind: CK_ATTRIBUTE_TYPE, value: CK_ULONG) -> Self {
        Self::new(kind, value.to_ne_bytes().to_vec())
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self.value.as_slice() {
            [b] => Some(*b != 0),
            _ => None,
        }
    }

    pub fn as_ulong(&self) -> Option<CK_ULONG> {
        let bytes: [u8; size_of::<CK_ULONG>()] = self.value.as_slice().try_into().ok()?;
        Some(CK_ULONG::from_ne_bytes(bytes))
    }

    /// Reject records whose value cannot be an encoding of their type.
    pub fn validate(&self) -> Result<(), ObjectError> {
        if BOOL_ATTRS.contains(&self.kind) && self.value.len() != size_of::<CK_BBOOL>() {
            return Err(ObjectError::AttributeValueInvalid(self.kind));
        }
        if ULONG_ATTRS.contains(&self.kind) && self.value.len() != size_of::<CK_ULONG>() {
            return Err(ObjectError::AttributeValueInvalid(self.kind));
        }
        if self.kind == CKA_ALLOWED_MECHANISMS && self.value.len() % size_of::<CK_ULONG>() != 0 {
            return Err(ObjectError::AttributeValueInvalid(self.kind));
        }
        Ok(())
    }
}

/// A caller's slot in a batch attribute read. `buf == None` probes the
/// length; `len` is filled in on success and left `None` on failure.
#[derive(Debug)]
pub struct AttrRequest<'a> {
    pub kind: CK_ATTRIBUTE_TYPE,
    pub buf: Option<&'a mut [u8]>,
    pub len: Option<usize>,
}

impl<'a> AttrRequest<'a> {
    pub fn probe(kind: CK_ATTRIBUTE_TYPE) -> Self {
        Self {
            kind,
            buf: None,
            len: None,
        }
    }

    pub fn fetch(kind: CK_ATTRIBUTE_TYPE, buf: &'a mut [u8]) -> Self {
        Self {
            kind,
            buf: Some(buf),
            len: None,
        }
    }
}

/// Ordered attribute records with unique types.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttrList(Vec<Attribute>);

impl AttrList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a list from a caller template, rejecting duplicate types and
    /// malformed encodings.
    pub fn from_template(template: &[Attribute]) -> Result<Self, ObjectError> {
        let mut list = Vec::new();
        list.try_reserve_exact(template.len())
            .map_err(|_| ObjectError::HostMemory)?;
        for attr in template {
            attr.validate()?;
            if list.iter().any(|a: &Attribute| a.kind == attr.kind) {
                return Err(ObjectError::AttributeTypeInvalid(attr.kind));
            }
            list.push(Attribute::new(attr.kind, dup(&attr.value)?));
        }
        Ok(Self(list))
    }

    pub fn get(&self, kind: CK_ATTRIBUTE_TYPE) -> Option<&Attribute> {
        self.0.iter().find(|a| a.kind == kind)
    }

    pub fn get_ulong(&self, kind: CK_ATTRIBUTE_TYPE) -> Option<CK_ULONG> {
        self.get(kind).and_then(Attribute::as_ulong)
    }

    pub fn get_bool(&self, kind: CK_ATTRIBUTE_TYPE) -> Option<bool> {
        self.get(kind).and_then(Attribute::as_bool)
    }

    pub fn contains(&self, kind: CK_ATTRIBUTE_TYPE) -> bool {
        self.get(kind).is_some()
    }

    /// Two-call idiom: with no buffer, report the length; with a buffer that
    /// is too small, report the required length without copying.
    pub fn get_full(
        &self,
        kind: CK_ATTRIBUTE_TYPE,
        buf: Option<&mut [u8]>,
    ) -> Result<usize, ObjectError> {
        let attr = self.get(kind).ok_or(ObjectError::AttributeTypeInvalid(kind))?;
        let required = attr.value.len();
        match buf {
            None => Ok(required),
            Some(buf) if buf.len() < required => {
                Err(ObjectError::BufferTooSmall { kind, required })
            }
            Some(buf) => {
                buf[..required].copy_from_slice(&attr.value);
                Ok(required)
            }
        }
    }

    /// Replace or insert every record, or none of them.
    pub fn set(&mut self, records: &[Attribute]) -> Result<(), ObjectError> {
        for (i, attr) in records.iter().enumerate() {
            if is_immutable(attr.kind) {
                return Err(ObjectError::ActionProhibited("attribute is immutable"));
            }
            attr.validate()?;
            if records[..i].iter().any(|a| a.kind == attr.kind) {
                return Err(ObjectError::AttributeTypeInvalid(attr.kind));
            }
        }

        let mut staged = Vec::new();
        staged
            .try_reserve_exact(records.len())
            .map_err(|_| ObjectError::HostMemory)?;
        for attr in records {
            staged.push(Attribute::new(attr.kind, dup(&attr.value)?));
        }
        for attr in staged {
            self.upsert(attr);
        }
        Ok(())
    }

    /// Insert without the immutability check; used while an object is
    /// being built.
    pub(crate) fn upsert(&mut self, attr: Attribute) {
        match self.0.iter_mut().find(|a| a.kind == attr.kind) {
            Some(slot) => slot.value = attr.value,
            None => self.0.push(attr),
        }
    }

    pub(crate) fn remove(&mut self, kind: CK_ATTRIBUTE_TYPE) -> Option<Attribute> {
        let pos = self.0.iter().position(|a| a.kind == kind)?;
        Some(self.0.remove(pos))
    }

    /// Exact-match template filter: every template record must be present
    /// with identical bytes; extra attributes are ignored.
    pub fn matches(&self, template: &[Attribute]) -> bool {
        template
            .iter()
            .all(|t| self.get(t.kind).is_some_and(|a| a.value == t.value))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Attribute> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_vec(self) -> Vec<Attribute> {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rsa_private() -> AttrList {
        AttrList::from_template(&[
            Attribute::ulong(CKA_CLASS, CKO_PRIVATE_KEY),
            Attribute::ulong(CKA_KEY_TYPE, CKK_RSA),
            Attribute::new(CKA_LABEL, b"rsa_no_auth".to_vec()),
            Attribute::bool(CKA_SIGN, true),
        ])
        .unwrap()
    }

    #[test]
    fn test_from_template_rejects_duplicates() {
        let err = AttrList::from_template(&[
            Attribute::new(CKA_LABEL, b"a".to_vec()),
            Attribute::new(CKA_LABEL, b"b".to_vec()),
        ])
        .unwrap_err();
        assert!(matches!(err, ObjectError::AttributeTypeInvalid(k) if k == CKA_LABEL));
    }

    #[test]
    fn test_from_template_rejects_bad_encoding() {
        let err = AttrList::from_template(&[Attribute::new(CKA_SIGN, vec![1, 0])]).unwrap_err();
        assert!(matches!(err, ObjectError::AttributeValueInvalid(_)));

        let err = AttrList::from_template(&[Attribute::new(CKA_CLASS, vec![3])]).unwrap_err();
        assert!(matches!(err, ObjectError::AttributeValueInvalid(_)));
    }

    #[test]
    fn test_get_full_probe_then_fetch() {
        let attrs = rsa_private();

        let len = attrs.get_full(CKA_LABEL, None).unwrap();
        assert_eq!(len, b"rsa_no_auth".len());

        let mut small = [0u8; 4];
        let err = attrs.get_full(CKA_LABEL, Some(&mut small)).unwrap_err();
        assert!(matches!(err, ObjectError::BufferTooSmall { required, .. } if required == len));
        assert_eq!(small, [0u8; 4], "nothing may be copied on a short buffer");

        let mut buf = vec![0u8; 32];
        let n = attrs.get_full(CKA_LABEL, Some(&mut buf)).unwrap();
        assert_eq!(&buf[..n], b"rsa_no_auth");

        let err = attrs.get_full(CKA_MODULUS, None).unwrap_err();
        assert!(matches!(err, ObjectError::AttributeTypeInvalid(_)));
    }

    #[test]
    fn test_set_is_all_or_nothing() {
        let mut attrs = rsa_private();
        let before = attrs.clone();

        let err = attrs
            .set(&[
                Attribute::new(CKA_LABEL, b"renamed".to_vec()),
                Attribute::ulong(CKA_KEY_TYPE, CKK_EC),
            ])
            .unwrap_err();
        assert!(matches!(err, ObjectError::ActionProhibited(_)));
        assert_eq!(attrs, before);

        attrs
            .set(&[
                Attribute::new(CKA_LABEL, b"renamed".to_vec()),
                Attribute::new(CKA_ID, b"0009".to_vec()),
            ])
            .unwrap();
        assert_eq!(attrs.get(CKA_LABEL).unwrap().value, b"renamed");
        assert_eq!(attrs.get(CKA_ID).unwrap().value, b"0009");
        assert_eq!(attrs.len(), before.len() + 1);
    }

    #[test]
    fn test_set_rejects_vendor_attributes() {
        let mut attrs = rsa_private();
        let err = attrs
            .set(&[Attribute::new(CKA_TPM2_PUB_BLOB, vec![1, 2, 3])])
            .unwrap_err();
        assert!(matches!(err, ObjectError::ActionProhibited(_)));
    }

    #[test]
    fn test_matches_exact_bytes() {
        let attrs = rsa_private();
        assert!(attrs.matches(&[]));
        assert!(attrs.matches(&[Attribute::ulong(CKA_CLASS, CKO_PRIVATE_KEY)]));
        assert!(attrs.matches(&[
            Attribute::ulong(CKA_KEY_TYPE, CKK_RSA),
            Attribute::new(CKA_LABEL, b"rsa_no_auth".to_vec()),
        ]));
        assert!(!attrs.matches(&[Attribute::new(CKA_LABEL, b"rsa_no_aut".to_vec())]));
        assert!(!attrs.matches(&[Attribute::new(CKA_ID, b"0001".to_vec())]));
        assert!(!attrs.matches(&[Attribute::new(0x7fff_0000, vec![])]));
    }

    #[test]
    fn test_ulong_roundtrip() {
        let attr = Attribute::ulong(CKA_MODULUS_BITS, 2048);
        assert_eq!(attr.as_ulong(), Some(2048));
        assert_eq!(Attribute::bool(CKA_SIGN, true).as_bool(), Some(true));
    }
}
