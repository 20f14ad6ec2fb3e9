//! Redirection between the halves of a linked key pair. Links are lookups by
//! id; a dangling link simply resolves to the object itself.

use std::collections::BTreeMap;

use cryptoki_sys::*;

use super::attrs::{self, Attribute};
use super::{mech, ObjectId, TokenObject};

type Objects = BTreeMap<ObjectId, TokenObject>;

fn linked<'a>(objects: &'a Objects, obj: &TokenObject) -> Option<&'a TokenObject> {
    obj.link.and_then(|id| objects.get(&id))
}

/// The object that answers reads of `kind` on `obj`.
pub(crate) fn attr_source<'a>(
    objects: &'a Objects,
    obj: &'a TokenObject,
    kind: CK_ATTRIBUTE_TYPE,
) -> &'a TokenObject {
    if obj.class() == Some(CKO_PRIVATE_KEY) && attrs::is_public_class(kind) {
        if let Some(public) = linked(objects, obj) {
            return public;
        }
    }
    obj
}

/// The object describing the key material (type, size, curve).
pub(crate) fn key_holder<'a>(objects: &'a Objects, obj: &'a TokenObject) -> &'a TokenObject {
    if mech::describes_key(obj) {
        return obj;
    }
    linked(objects, obj).unwrap_or(obj)
}

/// The object holding the private material and its authorization.
pub(crate) fn auth_holder_id(objects: &Objects, obj: &TokenObject) -> ObjectId {
    if obj.holds_private() || obj.wrapped_auth.is_some() {
        return obj.id;
    }
    match linked(objects, obj) {
        Some(other) if other.holds_private() => other.id,
        _ => obj.id,
    }
}

/// Template match with public-class attributes read through the link.
pub(crate) fn matches(objects: &Objects, obj: &TokenObject, template: &[Attribute]) -> bool {
    template.iter().all(|t| {
        attr_source(objects, obj, t.kind)
            .attrs
            .get(t.kind)
            .is_some_and(|a| a.value == t.value)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::AttrList;

    fn pair() -> Objects {
        let mut private = TokenObject::new(
            AttrList::from_template(&[
                Attribute::ulong(CKA_CLASS, CKO_PRIVATE_KEY),
                Attribute::ulong(CKA_KEY_TYPE, CKK_EC),
                Attribute::new(CKA_LABEL, b"ecc".to_vec()),
            ])
            .unwrap(),
        );
        private.id = ObjectId(1);
        private.link = Some(ObjectId(2));
        private.persistent_handle = Some(0x8100_0000);

        let mut public = TokenObject::new(
            AttrList::from_template(&[
                Attribute::ulong(CKA_CLASS, CKO_PUBLIC_KEY),
                Attribute::ulong(CKA_KEY_TYPE, CKK_EC),
                Attribute::new(CKA_LABEL, b"ecc".to_vec()),
                Attribute::new(CKA_EC_PARAMS, mech::EC_PARAMS_P256.to_vec()),
                Attribute::new(CKA_EC_POINT, vec![4, 1, 2]),
            ])
            .unwrap(),
        );
        public.id = ObjectId(2);
        public.link = Some(ObjectId(1));

        BTreeMap::from([(ObjectId(1), private), (ObjectId(2), public)])
    }

    #[test]
    fn test_public_class_reads_follow_link() {
        let objects = pair();
        let private = &objects[&ObjectId(1)];
        let public = &objects[&ObjectId(2)];

        assert_eq!(attr_source(&objects, private, CKA_EC_POINT).id, ObjectId(2));
        assert_eq!(attr_source(&objects, private, CKA_LABEL).id, ObjectId(1));
        assert_eq!(attr_source(&objects, public, CKA_EC_POINT).id, ObjectId(2));

        let point = [Attribute::new(CKA_EC_POINT, vec![4, 1, 2])];
        assert!(matches(&objects, private, &point));
        assert!(matches(&objects, public, &point));
    }

    #[test]
    fn test_holders() {
        let objects = pair();
        let private = &objects[&ObjectId(1)];
        let public = &objects[&ObjectId(2)];
        assert_eq!(key_holder(&objects, private).id, ObjectId(2));
        assert_eq!(key_holder(&objects, public).id, ObjectId(2));
        assert_eq!(auth_holder_id(&objects, public), ObjectId(1));
        assert_eq!(auth_holder_id(&objects, private), ObjectId(1));
    }

    #[test]
    fn test_dangling_link_resolves_to_self() {
        let mut objects = pair();
        objects.remove(&ObjectId(2));
        let private = &objects[&ObjectId(1)];
        assert_eq!(attr_source(&objects, private, CKA_EC_POINT).id, ObjectId(1));
        assert_eq!(key_holder(&objects, private).id, ObjectId(1));
    }
}
