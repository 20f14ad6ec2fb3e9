//! The live object set. One mutex serializes registration, destruction,
//! attribute writes and use-count transitions; device work other than the
//! 0→1 load and 1→0 evict runs outside it.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use cryptoki_sys::*;
use zeroize::Zeroizing;

use super::attrs::{self, AttrList, AttrRequest, Attribute};
use super::auth::{require_authenticated, SessionAuth};
use super::init::{self, ObjectInitializer};
use super::{link, mech, ObjectError, ObjectId, SessionId, TokenObject, AUTO_ID_BASE};
use crate::store::{ObjectStore, StoreError};
use crate::transport::{HwHandle, Transport, TransportError};

/// Inputs a provisioning tool supplies to expose a persistent TPM key.
#[derive(Clone)]
pub struct ImportRequest {
    pub id: u32,
    pub persistent_handle: u32,
    pub label: String,
    pub auth: Option<Zeroizing<Vec<u8>>>,
}

impl std::fmt::Debug for ImportRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImportRequest")
            .field("id", &self.id)
            .field("persistent_handle", &format_args!("{:#x}", self.persistent_handle))
            .field("label", &self.label)
            .field("auth", &self.auth.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Point-in-time copy of an object's observable state. Never carries
/// clear-text authorization.
#[derive(Debug, Clone)]
pub struct ObjectInfo {
    pub id: ObjectId,
    pub handle: CK_OBJECT_HANDLE,
    pub active: u32,
    pub loaded: bool,
    pub link: Option<ObjectId>,
    pub public_blob: Option<Vec<u8>>,
    pub private_blob: Option<Vec<u8>>,
    pub persistent_handle: Option<u32>,
    pub has_wrapped_auth: bool,
    pub attrs: AttrList,
}

struct Inner {
    objects: BTreeMap<ObjectId, TokenObject>,
    handles: HashMap<CK_OBJECT_HANDLE, ObjectId>,
    next_handle: CK_OBJECT_HANDLE,
    next_auto_id: u32,
    store: Box<dyn ObjectStore>,
}

impl Inner {
    fn id_of(&self, handle: CK_OBJECT_HANDLE) -> Result<ObjectId, ObjectError> {
        self.handles
            .get(&handle)
            .copied()
            .ok_or(ObjectError::HandleInvalid(handle))
    }

    fn object(&self, handle: CK_OBJECT_HANDLE) -> Result<&TokenObject, ObjectError> {
        let id = self.id_of(handle)?;
        self.objects.get(&id).ok_or(ObjectError::HandleInvalid(handle))
    }

    fn object_mut(&mut self, handle: CK_OBJECT_HANDLE) -> Result<&mut TokenObject, ObjectError> {
        let id = self.id_of(handle)?;
        self.objects
            .get_mut(&id)
            .ok_or(ObjectError::HandleInvalid(handle))
    }

    /// The next `n` auto ids, without consuming them.
    fn peek_ids(&self, n: u32, op: &'static str) -> Result<ObjectId, ObjectError> {
        let first = self.next_auto_id;
        first.checked_add(n).ok_or(ObjectError::General {
            op,
            id: ObjectId(first),
        })?;
        Ok(ObjectId(first))
    }

    fn register(&mut self, mut obj: TokenObject) -> CK_OBJECT_HANDLE {
        let handle = self.next_handle;
        self.next_handle += 1;
        obj.handle = handle;
        if obj.id.0 >= self.next_auto_id {
            self.next_auto_id = obj.id.0.saturating_add(1);
        }
        self.handles.insert(handle, obj.id);
        self.objects.insert(obj.id, obj);
        handle
    }

    /// Persist both halves of a pair or neither.
    fn persist_pair(&mut self, first: &TokenObject, second: &TokenObject) -> Result<(), ObjectError> {
        self.store.persist(&first.to_record())?;
        if let Err(e) = self.store.persist(&second.to_record()) {
            if let Err(undo) = self.store.remove(first.id.0) {
                tracing::warn!(id = %first.id, error = %undo, "Could not roll back half-stored pair");
            }
            return Err(e.into());
        }
        Ok(())
    }
}

pub struct Registry {
    inner: Mutex<Inner>,
    transport: Arc<dyn Transport>,
    initializer: Box<dyn ObjectInitializer>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry").finish_non_exhaustive()
    }
}

impl Registry {
    /// Bring every stored record back to life. Records that fail to decode or
    /// repeat an id already loaded are skipped with a warning.
    pub fn open(
        store: impl ObjectStore + 'static,
        transport: Arc<dyn Transport>,
        initializer: impl ObjectInitializer + 'static,
    ) -> Result<Self, ObjectError> {
        let records = store.load_all()?;
        let mut inner = Inner {
            objects: BTreeMap::new(),
            handles: HashMap::new(),
            next_handle: 1,
            next_auto_id: AUTO_ID_BASE,
            store: Box::new(store),
        };

        for record in records {
            let id = ObjectId(record.id);
            if inner.objects.contains_key(&id) {
                tracing::warn!(%id, "Duplicate object record skipped");
                continue;
            }
            match TokenObject::from_record(record) {
                Ok(obj) => {
                    inner.register(obj);
                }
                Err(e) => tracing::warn!(%id, error = %e, "Unreadable object record skipped"),
            }
        }
        tracing::info!(objects = inner.objects.len(), "Object registry opened");

        Ok(Self {
            inner: Mutex::new(inner),
            transport,
            initializer: Box::new(initializer),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, ObjectError> {
        self.inner.lock().map_err(|_| ObjectError::LockPoisoned)
    }

    /// Create one object from a caller template. Key objects without blobs
    /// are handed to the initializer for fresh material.
    pub fn create(&self, template: &[Attribute]) -> Result<CK_OBJECT_HANDLE, ObjectError> {
        let attrs = AttrList::from_template(template)?;
        check_template(&attrs)?;
        let mut obj = TokenObject::from_template(attrs)?;

        let is_key = matches!(
            obj.class(),
            Some(CKO_PUBLIC_KEY | CKO_PRIVATE_KEY | CKO_SECRET_KEY)
        );
        if is_key && obj.public_blob.is_none() && obj.persistent_handle.is_none() {
            self.initializer.init_from_attrs(&*self.transport, &mut obj)?;
            if obj.class() == Some(CKO_PUBLIC_KEY) {
                obj.private_blob = None;
            }
        }

        let mut inner = self.lock()?;
        obj.id = inner.peek_ids(1, "create")?;
        inner.store.persist(&obj.to_record())?;
        let id = obj.id;
        let handle = inner.register(obj);
        tracing::info!(%id, handle, "Object created");
        Ok(handle)
    }

    /// Generate a key pair in the device and register its two halves,
    /// linked to each other. Returns `(public, private)` handles.
    pub fn generate_key_pair(
        &self,
        public_template: &[Attribute],
        private_template: &[Attribute],
    ) -> Result<(CK_OBJECT_HANDLE, CK_OBJECT_HANDLE), ObjectError> {
        let mut public_attrs = AttrList::from_template(public_template)?;
        let mut private_attrs = AttrList::from_template(private_template)?;
        pin_class(&mut public_attrs, CKO_PUBLIC_KEY)?;
        pin_class(&mut private_attrs, CKO_PRIVATE_KEY)?;

        let key_type = match (
            public_attrs.get_ulong(CKA_KEY_TYPE),
            private_attrs.get_ulong(CKA_KEY_TYPE),
        ) {
            (Some(a), Some(b)) if a != b => {
                return Err(ObjectError::TemplateInconsistent("key types differ"))
            }
            (Some(t), _) | (None, Some(t)) => t,
            (None, None) => return Err(ObjectError::TemplateIncomplete("CKA_KEY_TYPE")),
        };
        public_attrs.upsert(Attribute::ulong(CKA_KEY_TYPE, key_type));
        private_attrs.upsert(Attribute::ulong(CKA_KEY_TYPE, key_type));
        check_template(&public_attrs)?;
        check_template(&private_attrs)?;

        // Sizing hints usually arrive on the public template.
        for kind in [CKA_MODULUS_BITS, CKA_PUBLIC_EXPONENT, CKA_EC_PARAMS] {
            if let Some(attr) = public_attrs.get(kind) {
                if !private_attrs.contains(kind) {
                    private_attrs.upsert(attr.clone());
                }
            }
        }

        let mut private = TokenObject::from_template(private_attrs)?;
        let mut public = TokenObject::from_template(public_attrs)?;
        if private.public_blob.is_some() || public.public_blob.is_some() {
            return Err(ObjectError::TemplateInconsistent("key material supplied to generate"));
        }

        self.initializer.init_from_attrs(&*self.transport, &mut private)?;
        let blob = private
            .public_blob()
            .map(<[u8]>::to_vec)
            .ok_or(ObjectError::TemplateIncomplete("initializer produced no key material"))?;
        public.set_blob_data(&blob, None)?;
        init::split_public(&mut private, &mut public);
        for kind in [CKA_LOCAL, CKA_KEY_GEN_MECHANISM] {
            if let Some(attr) = private.attrs().get(kind) {
                public.attrs.upsert(attr.clone());
            }
        }

        let mut inner = self.lock()?;
        let first = inner.peek_ids(2, "generate_key_pair")?;
        private.id = first;
        public.id = ObjectId(first.0 + 1);
        private.link = Some(public.id);
        public.link = Some(private.id);
        inner.persist_pair(&private, &public)?;

        let (private_id, public_id) = (private.id, public.id);
        let private_handle = inner.register(private);
        let public_handle = inner.register(public);
        tracing::info!(%private_id, %public_id, key_type, "Key pair generated");
        Ok((public_handle, private_handle))
    }

    /// Expose a persistent TPM key as a linked private/public pair. The
    /// private half takes the requested id; the public half gets an auto id.
    /// Returns `(private, public)` handles.
    pub fn import(
        &self,
        request: ImportRequest,
        session_auth: &SessionAuth,
    ) -> Result<(CK_OBJECT_HANDLE, CK_OBJECT_HANDLE), ObjectError> {
        if request.id == 0 || request.id >= AUTO_ID_BASE {
            return Err(ObjectError::AttributeValueInvalid(CKA_ID));
        }
        let id = ObjectId(request.id);
        let info = self.transport.read_public(request.persistent_handle)?;
        let is_rsa = info.key_type == CKK_RSA;
        let ckid = id.to_string().into_bytes();
        let label = request.label.as_bytes().to_vec();

        let mut private = TokenObject::new(AttrList::from_template(&[
            Attribute::ulong(CKA_CLASS, CKO_PRIVATE_KEY),
            Attribute::ulong(CKA_KEY_TYPE, info.key_type),
            Attribute::new(CKA_ID, ckid.clone()),
            Attribute::new(CKA_LABEL, label.clone()),
            Attribute::bool(CKA_TOKEN, true),
            Attribute::bool(CKA_PRIVATE, true),
            Attribute::bool(CKA_SENSITIVE, true),
            Attribute::bool(CKA_EXTRACTABLE, false),
            Attribute::bool(CKA_LOCAL, false),
            Attribute::bool(CKA_SIGN, true),
            Attribute::bool(CKA_DECRYPT, is_rsa),
        ])?);
        private.set_persistent(request.persistent_handle, info.serialized_tr.as_deref())?;
        if let Some(auth) = &request.auth {
            let wrapped = session_auth.wrap(auth)?;
            private.set_auth(auth, &wrapped)?;
        }

        let mut public = TokenObject::new(AttrList::from_template(&[
            Attribute::ulong(CKA_CLASS, CKO_PUBLIC_KEY),
            Attribute::ulong(CKA_KEY_TYPE, info.key_type),
            Attribute::new(CKA_ID, ckid),
            Attribute::new(CKA_LABEL, label),
            Attribute::bool(CKA_TOKEN, true),
            Attribute::bool(CKA_PRIVATE, false),
            Attribute::bool(CKA_LOCAL, false),
            Attribute::bool(CKA_VERIFY, true),
            Attribute::bool(CKA_ENCRYPT, is_rsa),
        ])?);
        public.set_blob_data(&info.public_blob, None)?;
        for attr in info.public_attrs {
            attr.validate()?;
            public.attrs.upsert(attr);
        }

        let mut inner = self.lock()?;
        if inner.objects.contains_key(&id) {
            tracing::error!(%id, "Import of an id that is already live");
            return Err(ObjectError::General { op: "import", id });
        }
        private.id = id;
        public.id = inner.peek_ids(1, "import")?;
        private.link = Some(public.id);
        public.link = Some(id);
        inner.persist_pair(&private, &public)?;

        let public_id = public.id;
        let private_handle = inner.register(private);
        let public_handle = inner.register(public);
        tracing::info!(
            %id,
            %public_id,
            persistent = request.persistent_handle,
            "Persistent key imported"
        );
        Ok((private_handle, public_handle))
    }

    pub fn destroy(&self, handle: CK_OBJECT_HANDLE) -> Result<(), ObjectError> {
        let mut inner = self.lock()?;
        let obj = inner.object(handle)?;
        if obj.active > 0 {
            return Err(ObjectError::ActionProhibited("object is in use"));
        }
        let id = obj.id;
        match inner.store.remove(id.0) {
            Ok(()) => {}
            Err(StoreError::NotFound(_)) => {
                tracing::warn!(%id, "Destroyed object had no stored record")
            }
            Err(e) => return Err(e.into()),
        }
        inner.handles.remove(&handle);
        if let Some(mut obj) = inner.objects.remove(&id) {
            obj.clear_auth();
        }
        tracing::info!(%id, handle, "Object destroyed");
        Ok(())
    }

    /// Single-attribute read, following the link for public-class types.
    pub fn get_attribute(
        &self,
        handle: CK_OBJECT_HANDLE,
        kind: CK_ATTRIBUTE_TYPE,
    ) -> Result<Attribute, ObjectError> {
        let inner = self.lock()?;
        let obj = inner.object(handle)?;
        check_readable(obj, kind)?;
        link::attr_source(&inner.objects, obj, kind)
            .attrs
            .get(kind)
            .cloned()
            .ok_or(ObjectError::AttributeTypeInvalid(kind))
    }

    /// Probe-then-fetch read of one attribute; see [`AttrList::get_full`].
    pub fn get_attribute_full(
        &self,
        handle: CK_OBJECT_HANDLE,
        kind: CK_ATTRIBUTE_TYPE,
        buf: Option<&mut [u8]>,
    ) -> Result<usize, ObjectError> {
        let inner = self.lock()?;
        let obj = inner.object(handle)?;
        check_readable(obj, kind)?;
        link::attr_source(&inner.objects, obj, kind)
            .attrs
            .get_full(kind, buf)
    }

    /// Batch read. Every request is served; the first failure is returned
    /// after the rest have been filled.
    pub fn get_attributes(
        &self,
        handle: CK_OBJECT_HANDLE,
        requests: &mut [AttrRequest<'_>],
    ) -> Result<(), ObjectError> {
        let inner = self.lock()?;
        let obj = inner.object(handle)?;
        let mut first_err = None;
        for req in requests.iter_mut() {
            let kind = req.kind;
            let res = check_readable(obj, kind).and_then(|()| {
                link::attr_source(&inner.objects, obj, kind)
                    .attrs
                    .get_full(kind, req.buf.as_deref_mut())
            });
            match res {
                Ok(len) => req.len = Some(len),
                Err(e) => {
                    req.len = None;
                    first_err.get_or_insert(e);
                }
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    pub fn set_attributes(
        &self,
        handle: CK_OBJECT_HANDLE,
        records: &[Attribute],
    ) -> Result<(), ObjectError> {
        let mut inner = self.lock()?;
        let obj = inner.object(handle)?;
        if obj.attrs.get_bool(CKA_MODIFIABLE) == Some(false) {
            return Err(ObjectError::ActionProhibited("object is not modifiable"));
        }
        let mut staged = obj.attrs.clone();
        staged.set(records)?;
        let record = obj.to_record_with(staged.clone());
        inner.store.persist(&record)?;
        inner.object_mut(handle)?.attrs = staged;
        tracing::debug!(handle, count = records.len(), "Attributes updated");
        Ok(())
    }

    pub fn increment_use(&self, handle: CK_OBJECT_HANDLE) -> Result<u32, ObjectError> {
        let mut inner = self.lock()?;
        inner.object_mut(handle)?.increment_use(&*self.transport)
    }

    pub fn decrement_use(&self, handle: CK_OBJECT_HANDLE) -> Result<u32, ObjectError> {
        let mut inner = self.lock()?;
        inner.object_mut(handle)?.decrement_use(&*self.transport)
    }

    /// Unwrap the auth of the object holding the private material behind
    /// `handle` and unlock it for `session`. Objects without wrapped auth
    /// need nothing.
    pub fn authenticate(
        &self,
        session: SessionId,
        handle: CK_OBJECT_HANDLE,
        session_auth: &SessionAuth,
    ) -> Result<(), ObjectError> {
        let mut inner = self.lock()?;
        let obj = inner.object(handle)?;
        let holder_id = link::auth_holder_id(&inner.objects, obj);
        let holder = inner
            .objects
            .get_mut(&holder_id)
            .ok_or(ObjectError::HandleInvalid(handle))?;
        let Some(wrapped) = holder.wrapped_auth.as_deref() else {
            return Ok(());
        };
        let plain = self
            .transport
            .unwrap_auth(wrapped, session_auth)
            .map_err(|e| {
                tracing::warn!(id = %holder_id, error = %e, "Object auth unwrap failed");
                ObjectError::PinIncorrect
            })?;
        holder.grant(session, plain);
        tracing::debug!(id = %holder_id, session = session.0, "Object authenticated");
        Ok(())
    }

    /// Drop every authorization `session` unlocked.
    pub fn logout(&self, session: SessionId) -> Result<(), ObjectError> {
        let mut inner = self.lock()?;
        for obj in inner.objects.values_mut() {
            obj.revoke(session);
        }
        Ok(())
    }

    pub fn sign(
        &self,
        session: SessionId,
        handle: CK_OBJECT_HANDLE,
        mechanism: CK_MECHANISM_TYPE,
        data: &[u8],
    ) -> Result<Vec<u8>, ObjectError> {
        self.private_op(session, handle, mechanism, CKA_SIGN, |t, hw, auth| {
            t.sign(hw, auth, mechanism, data)
        })
    }

    pub fn decrypt(
        &self,
        session: SessionId,
        handle: CK_OBJECT_HANDLE,
        mechanism: CK_MECHANISM_TYPE,
        data: &[u8],
    ) -> Result<Vec<u8>, ObjectError> {
        self.private_op(session, handle, mechanism, CKA_DECRYPT, |t, hw, auth| {
            t.decrypt(hw, auth, mechanism, data)
        })
    }

    fn private_op<F>(
        &self,
        session: SessionId,
        handle: CK_OBJECT_HANDLE,
        mechanism: CK_MECHANISM_TYPE,
        usage: CK_ATTRIBUTE_TYPE,
        op: F,
    ) -> Result<Vec<u8>, ObjectError>
    where
        F: FnOnce(&dyn Transport, HwHandle, Option<&[u8]>) -> Result<Vec<u8>, TransportError>,
    {
        let (target, hw, auth) = {
            let mut inner = self.lock()?;
            let obj = inner.object(handle)?;
            if obj.class() != Some(CKO_PRIVATE_KEY) {
                return Err(ObjectError::KeyFunctionNotPermitted("not a private key"));
            }
            if obj.attrs.get_bool(usage) == Some(false) {
                return Err(ObjectError::KeyFunctionNotPermitted("usage flag is false"));
            }
            mech::mech_is_supported(link::key_holder(&inner.objects, obj), mechanism)?;
            let target = link::auth_holder_id(&inner.objects, obj);

            let holder = inner
                .objects
                .get_mut(&target)
                .ok_or(ObjectError::HandleInvalid(handle))?;
            require_authenticated(holder, session)?;
            holder.increment_use(&*self.transport)?;
            let auth = holder.unsealed_auth.clone();
            match holder.hw_handle {
                Some(hw) => (target, hw, auth),
                None => {
                    holder.decrement_use(&*self.transport)?;
                    return Err(ObjectError::General { op: "private_op", id: target });
                }
            }
        };

        let result = op(&*self.transport, hw, auth.as_deref().map(Vec::as_slice));

        {
            let mut inner = self.lock()?;
            let holder = inner.objects.get_mut(&target).ok_or(ObjectError::General {
                op: "private_op",
                id: target,
            })?;
            holder.decrement_use(&*self.transport)?;
        }
        Ok(result?)
    }

    pub fn mech_is_supported(
        &self,
        handle: CK_OBJECT_HANDLE,
        mechanism: CK_MECHANISM_TYPE,
    ) -> Result<(), ObjectError> {
        let inner = self.lock()?;
        let obj = inner.object(handle)?;
        mech::mech_is_supported(link::key_holder(&inner.objects, obj), mechanism)
    }

    pub fn min_buf_size(
        &self,
        handle: CK_OBJECT_HANDLE,
        mechanism: CK_MECHANISM_TYPE,
    ) -> Result<usize, ObjectError> {
        let inner = self.lock()?;
        let obj = inner.object(handle)?;
        mech::min_buf_size(link::key_holder(&inner.objects, obj), mechanism)
    }

    pub fn object_count(&self) -> Result<usize, ObjectError> {
        Ok(self.lock()?.objects.len())
    }

    pub fn handle_of(&self, id: ObjectId) -> Result<Option<CK_OBJECT_HANDLE>, ObjectError> {
        Ok(self.lock()?.objects.get(&id).map(|o| o.handle))
    }

    pub fn snapshot(&self, handle: CK_OBJECT_HANDLE) -> Result<ObjectInfo, ObjectError> {
        let inner = self.lock()?;
        let obj = inner.object(handle)?;
        Ok(ObjectInfo {
            id: obj.id,
            handle: obj.handle,
            active: obj.active,
            loaded: obj.hw_handle.is_some(),
            link: obj.link,
            public_blob: obj.public_blob.clone(),
            private_blob: obj.private_blob.clone(),
            persistent_handle: obj.persistent_handle,
            has_wrapped_auth: obj.wrapped_auth.is_some(),
            attrs: obj.attrs.clone(),
        })
    }

    /// Every live object as `(id, handle)`, in ascending id order. The
    /// handle pins the entry to this incarnation of the id.
    pub(crate) fn live_entries(&self) -> Result<Vec<(ObjectId, CK_OBJECT_HANDLE)>, ObjectError> {
        Ok(self
            .lock()?
            .objects
            .iter()
            .map(|(id, obj)| (*id, obj.handle))
            .collect())
    }

    /// Walk `entries` in order, collecting handles of objects still live
    /// under the same handle that match `template`, until `max` are found.
    /// Returns the handles and how many entries were consumed.
    pub(crate) fn scan(
        &self,
        entries: &[(ObjectId, CK_OBJECT_HANDLE)],
        template: &[Attribute],
        max: usize,
    ) -> Result<(Vec<CK_OBJECT_HANDLE>, usize), ObjectError> {
        let inner = self.lock()?;
        let mut found = Vec::new();
        let mut consumed = 0;
        for (id, handle) in entries {
            if found.len() == max {
                break;
            }
            consumed += 1;
            // An id destroyed and reused since the snapshot has a new handle.
            let Some(obj) = inner.objects.get(id).filter(|o| o.handle == *handle) else {
                continue;
            };
            if link::matches(&inner.objects, obj, template) {
                found.push(obj.handle);
            }
        }
        Ok((found, consumed))
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        let Ok(inner) = self.inner.get_mut() else {
            return;
        };
        for obj in inner.objects.values_mut() {
            if let Some(hw) = obj.hw_handle.take() {
                if let Err(e) = self.transport.evict(hw) {
                    tracing::warn!(id = %obj.id, hw = hw.0, error = %e, "Evict at teardown failed");
                }
            }
            obj.clear_auth();
        }
    }
}

fn check_template(attrs: &AttrList) -> Result<(), ObjectError> {
    let class = attrs
        .get_ulong(CKA_CLASS)
        .ok_or(ObjectError::TemplateIncomplete("CKA_CLASS"))?;
    let key_type = attrs.get_ulong(CKA_KEY_TYPE);
    match class {
        CKO_PUBLIC_KEY | CKO_PRIVATE_KEY => match key_type {
            Some(CKK_RSA | CKK_EC) => Ok(()),
            Some(_) => Err(ObjectError::TemplateInconsistent("asymmetric class with symmetric key type")),
            None => Err(ObjectError::TemplateIncomplete("CKA_KEY_TYPE")),
        },
        CKO_SECRET_KEY => match key_type {
            Some(CKK_AES | CKK_GENERIC_SECRET) => Ok(()),
            Some(_) => Err(ObjectError::TemplateInconsistent("secret class with asymmetric key type")),
            None => Err(ObjectError::TemplateIncomplete("CKA_KEY_TYPE")),
        },
        CKO_DATA | CKO_CERTIFICATE if key_type.is_some() => {
            Err(ObjectError::TemplateInconsistent("key type on a non-key object"))
        }
        CKO_DATA | CKO_CERTIFICATE => Ok(()),
        _ => Err(ObjectError::AttributeValueInvalid(CKA_CLASS)),
    }
}

/// Default the class of a key-pair half, refusing a contradicting one.
fn pin_class(attrs: &mut AttrList, class: CK_OBJECT_CLASS) -> Result<(), ObjectError> {
    match attrs.get_ulong(CKA_CLASS) {
        Some(c) if c != class => Err(ObjectError::TemplateInconsistent("wrong class for key pair half")),
        Some(_) => Ok(()),
        None => {
            attrs.upsert(Attribute::ulong(CKA_CLASS, class));
            Ok(())
        }
    }
}

fn check_readable(obj: &TokenObject, kind: CK_ATTRIBUTE_TYPE) -> Result<(), ObjectError> {
    let secret_value = kind == CKA_VALUE
        && matches!(obj.class(), Some(CKO_SECRET_KEY | CKO_PRIVATE_KEY));
    if attrs::is_sensitive(kind) || secret_value {
        return Err(ObjectError::AttributeSensitive(kind));
    }
    Ok(())
}
