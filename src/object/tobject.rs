use cryptoki_sys::*;
use zeroize::Zeroizing;

use super::attrs::{self, AttrList};
use super::{dup, ObjectError, ObjectId, SessionId};
use crate::store::record::{ObjectRecord, RECORD_VERSION};
use crate::transport::{HwHandle, KeyRef};

/// One key, certificate or data object exposed through the token.
#[derive(Debug)]
pub struct TokenObject {
    pub(crate) id: ObjectId,
    pub(crate) handle: CK_OBJECT_HANDLE,
    pub(crate) active: u32,
    pub(crate) public_blob: Option<Vec<u8>>,
    pub(crate) private_blob: Option<Vec<u8>>,
    pub(crate) persistent_handle: Option<u32>,
    pub(crate) serialized_tr: Option<Vec<u8>>,
    pub(crate) wrapped_auth: Option<Vec<u8>>,
    pub(crate) unsealed_auth: Option<Zeroizing<Vec<u8>>>,
    pub(crate) auth_sessions: Vec<SessionId>,
    pub(crate) attrs: AttrList,
    pub(crate) hw_handle: Option<HwHandle>,
    pub(crate) link: Option<ObjectId>,
}

impl TokenObject {
    /// A not-yet-registered object; the registry assigns id and handle.
    pub fn new(attrs: AttrList) -> Self {
        Self {
            id: ObjectId(0),
            handle: 0,
            active: 0,
            public_blob: None,
            private_blob: None,
            persistent_handle: None,
            serialized_tr: None,
            wrapped_auth: None,
            unsealed_auth: None,
            auth_sessions: Vec::new(),
            attrs,
            hw_handle: None,
            link: None,
        }
    }

    /// Pull the vendor TPM2 attributes out of a create template into the
    /// object's own fields so they are never echoed back as attributes.
    pub(crate) fn from_template(mut attrs: AttrList) -> Result<Self, ObjectError> {
        let public = attrs.remove(attrs::CKA_TPM2_PUB_BLOB);
        let private = attrs.remove(attrs::CKA_TPM2_PRIV_BLOB);
        let wrapped = attrs.remove(attrs::CKA_TPM2_OBJAUTH_ENC);
        let tr = attrs.remove(attrs::CKA_TPM2_SERIALIZED_TR);
        let persistent = attrs.remove(attrs::CKA_TPM2_PERSISTENT_HANDLE);
        if let Some(kind) = attrs.iter().map(|a| a.kind).find(|k| attrs::is_vendor_tpm2(*k)) {
            return Err(ObjectError::AttributeTypeInvalid(kind));
        }

        let mut obj = Self::new(attrs);
        match (public, private) {
            (Some(public), private) => {
                obj.set_blob_data(&public.value, private.as_ref().map(|p| p.value.as_slice()))?
            }
            (None, Some(_)) => {
                return Err(ObjectError::TemplateIncomplete("private blob without public blob"))
            }
            (None, None) => {}
        }
        if let Some(persistent) = persistent {
            let handle = persistent
                .as_ulong()
                .and_then(|h| u32::try_from(h).ok())
                .ok_or(ObjectError::AttributeValueInvalid(persistent.kind))?;
            obj.set_persistent(handle, tr.as_ref().map(|t| t.value.as_slice()))?;
        }
        obj.wrapped_auth = wrapped.map(|w| w.value);
        Ok(obj)
    }

    /// Deep-copy both blobs in, replacing any previous ones.
    pub fn set_blob_data(&mut self, public: &[u8], private: Option<&[u8]>) -> Result<(), ObjectError> {
        let public = dup(public)?;
        let private = private.map(dup).transpose()?;
        self.public_blob = Some(public);
        self.private_blob = private;
        Ok(())
    }

    /// Deep-copy the clear and wrapped forms of a per-object authorization.
    pub fn set_auth(&mut self, auth_plain: &[u8], auth_wrapped: &[u8]) -> Result<(), ObjectError> {
        let plain = Zeroizing::new(dup(auth_plain)?);
        let wrapped = dup(auth_wrapped)?;
        self.unsealed_auth = Some(plain);
        self.wrapped_auth = Some(wrapped);
        Ok(())
    }

    pub(crate) fn set_persistent(
        &mut self,
        handle: u32,
        serialized_tr: Option<&[u8]>,
    ) -> Result<(), ObjectError> {
        self.serialized_tr = serialized_tr.map(dup).transpose()?;
        self.persistent_handle = Some(handle);
        Ok(())
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn handle(&self) -> CK_OBJECT_HANDLE {
        self.handle
    }

    pub fn active(&self) -> u32 {
        self.active
    }

    pub fn hw_handle(&self) -> Option<HwHandle> {
        self.hw_handle
    }

    pub fn public_blob(&self) -> Option<&[u8]> {
        self.public_blob.as_deref()
    }

    pub fn private_blob(&self) -> Option<&[u8]> {
        self.private_blob.as_deref()
    }

    pub fn wrapped_auth(&self) -> Option<&[u8]> {
        self.wrapped_auth.as_deref()
    }

    pub fn persistent_handle(&self) -> Option<u32> {
        self.persistent_handle
    }

    pub fn attrs(&self) -> &AttrList {
        &self.attrs
    }

    pub fn link(&self) -> Option<ObjectId> {
        self.link
    }

    pub fn class(&self) -> Option<CK_OBJECT_CLASS> {
        self.attrs.get_ulong(CKA_CLASS)
    }

    pub fn key_type(&self) -> Option<CK_KEY_TYPE> {
        self.attrs.get_ulong(CKA_KEY_TYPE)
    }

    pub fn is_authenticated_for(&self, session: SessionId) -> bool {
        self.auth_sessions.contains(&session)
    }

    pub fn has_unsealed_auth(&self) -> bool {
        self.unsealed_auth.is_some()
    }

    /// Whether this object owns private key material itself.
    pub fn holds_private(&self) -> bool {
        self.private_blob.is_some() || self.persistent_handle.is_some()
    }

    pub(crate) fn key_ref(&self) -> Option<KeyRef<'_>> {
        if let Some(handle) = self.persistent_handle {
            return Some(KeyRef::Persistent {
                handle,
                serialized_tr: self.serialized_tr.as_deref(),
            });
        }
        self.public_blob.as_deref().map(|public| KeyRef::Blobs {
            public,
            private: self.private_blob.as_deref(),
        })
    }

    /// Record a successful unwrap under `session`.
    pub(crate) fn grant(&mut self, session: SessionId, plain: Zeroizing<Vec<u8>>) {
        self.unsealed_auth = Some(plain);
        if !self.auth_sessions.contains(&session) {
            self.auth_sessions.push(session);
        }
    }

    /// Forget `session`; the clear-text auth goes with the last one.
    pub(crate) fn revoke(&mut self, session: SessionId) {
        self.auth_sessions.retain(|s| *s != session);
        if self.auth_sessions.is_empty() {
            self.unsealed_auth = None;
        }
    }

    /// Drop clear-text authorization and every session that unlocked it.
    pub(crate) fn clear_auth(&mut self) {
        self.unsealed_auth = None;
        self.auth_sessions.clear();
    }

    pub(crate) fn to_record(&self) -> ObjectRecord {
        self.to_record_with(self.attrs.clone())
    }

    /// The record this object would have with `attrs` in place of its own.
    pub(crate) fn to_record_with(&self, attrs: AttrList) -> ObjectRecord {
        ObjectRecord {
            version: RECORD_VERSION,
            id: self.id.0,
            link: self.link.map(|l| l.0),
            public_blob: self.public_blob.clone(),
            private_blob: self.private_blob.clone(),
            wrapped_auth: self.wrapped_auth.clone(),
            persistent_handle: self.persistent_handle,
            serialized_tr: self.serialized_tr.clone(),
            attrs: attrs.into_vec(),
        }
    }

    pub(crate) fn from_record(record: ObjectRecord) -> Result<Self, ObjectError> {
        let attrs = AttrList::from_template(&record.attrs)?;
        let mut obj = Self::new(attrs);
        obj.id = ObjectId(record.id);
        obj.link = record.link.map(ObjectId);
        obj.public_blob = record.public_blob;
        obj.private_blob = record.private_blob;
        obj.wrapped_auth = record.wrapped_auth;
        obj.persistent_handle = record.persistent_handle;
        obj.serialized_tr = record.serialized_tr;
        Ok(obj)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::Attribute;

    fn key_template() -> AttrList {
        AttrList::from_template(&[
            Attribute::ulong(CKA_CLASS, CKO_PRIVATE_KEY),
            Attribute::ulong(CKA_KEY_TYPE, CKK_EC),
        ])
        .unwrap()
    }

    #[test]
    fn test_set_blob_data_copies_bytes() {
        let mut obj = TokenObject::new(key_template());
        let public = vec![1u8, 2, 3];
        let private = vec![9u8; 40];
        obj.set_blob_data(&public, Some(&private)).unwrap();
        drop(public);
        drop(private);
        assert_eq!(obj.public_blob(), Some(&[1u8, 2, 3][..]));
        assert_eq!(obj.private_blob(), Some(&[9u8; 40][..]));

        obj.set_blob_data(&[7, 7], None).unwrap();
        assert_eq!(obj.public_blob(), Some(&[7u8, 7][..]));
        assert!(obj.private_blob().is_none());
        assert!(!obj.holds_private());
    }

    #[test]
    fn test_set_auth_keeps_both_forms() {
        let mut obj = TokenObject::new(key_template());
        obj.set_auth(b"plain", b"wrapped-bytes").unwrap();
        assert_eq!(obj.wrapped_auth(), Some(&b"wrapped-bytes"[..]));
        assert!(obj.has_unsealed_auth());
        assert!(!obj.is_authenticated_for(SessionId(1)));

        obj.grant(SessionId(1), Zeroizing::new(b"plain".to_vec()));
        obj.grant(SessionId(2), Zeroizing::new(b"plain".to_vec()));
        assert!(obj.is_authenticated_for(SessionId(1)));
        obj.revoke(SessionId(1));
        assert!(!obj.is_authenticated_for(SessionId(1)));
        assert!(obj.has_unsealed_auth(), "session 2 still holds it");
        obj.revoke(SessionId(2));
        assert!(!obj.has_unsealed_auth());

        obj.grant(SessionId(3), Zeroizing::new(b"plain".to_vec()));
        obj.clear_auth();
        assert!(!obj.has_unsealed_auth());
        assert!(!obj.is_authenticated_for(SessionId(3)));
        assert!(obj.wrapped_auth().is_some());
    }

    #[test]
    fn test_from_template_moves_vendor_attributes() {
        let attrs = AttrList::from_template(&[
            Attribute::ulong(CKA_CLASS, CKO_PRIVATE_KEY),
            Attribute::new(attrs::CKA_TPM2_PUB_BLOB, vec![1, 1]),
            Attribute::new(attrs::CKA_TPM2_PRIV_BLOB, vec![2, 2]),
            Attribute::new(attrs::CKA_TPM2_OBJAUTH_ENC, vec![3, 3]),
        ])
        .unwrap();
        let obj = TokenObject::from_template(attrs).unwrap();
        assert_eq!(obj.attrs().len(), 1);
        assert_eq!(obj.public_blob(), Some(&[1u8, 1][..]));
        assert_eq!(obj.private_blob(), Some(&[2u8, 2][..]));
        assert_eq!(obj.wrapped_auth(), Some(&[3u8, 3][..]));
        assert!(matches!(obj.key_ref(), Some(KeyRef::Blobs { private: Some(_), .. })));
    }

    #[test]
    fn test_from_template_private_without_public() {
        let attrs = AttrList::from_template(&[Attribute::new(attrs::CKA_TPM2_PRIV_BLOB, vec![2])]).unwrap();
        let err = TokenObject::from_template(attrs).unwrap_err();
        assert!(matches!(err, ObjectError::TemplateIncomplete(_)));
    }

    #[test]
    fn test_record_never_carries_clear_auth() {
        let mut obj = TokenObject::new(key_template());
        obj.set_blob_data(&[1], Some(&[2])).unwrap();
        obj.set_auth(b"plain", b"wrapped").unwrap();
        obj.id = ObjectId(5);
        obj.link = Some(ObjectId(6));

        let record = obj.to_record();
        assert_eq!(record.wrapped_auth.as_deref(), Some(&b"wrapped"[..]));
        assert!(record.attrs.iter().all(|a| a.value != b"plain"));

        let back = TokenObject::from_record(record).unwrap();
        assert_eq!(back.id(), ObjectId(5));
        assert_eq!(back.link(), Some(ObjectId(6)));
        assert!(!back.has_unsealed_auth());
        assert_eq!(back.active(), 0);
        assert!(back.hw_handle().is_none());
    }
}
