//! Per-session `C_FindObjects` state.

use cryptoki_sys::CK_OBJECT_HANDLE;

use super::{dup, Attribute, ObjectError, ObjectId, Registry};

#[derive(Debug, Default)]
enum State {
    #[default]
    Idle,
    Active {
        template: Vec<Attribute>,
        entries: Vec<(ObjectId, CK_OBJECT_HANDLE)>,
        cursor: usize,
    },
}

/// One outstanding search. The object set is fixed at `find_init`, so objects
/// created later are never reported, not even under a reused id, and
/// chunking does not change the result.
#[derive(Debug, Default)]
pub struct FindSession {
    state: State,
}

impl FindSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, State::Active { .. })
    }

    pub fn find_init(&mut self, registry: &Registry, template: &[Attribute]) -> Result<(), ObjectError> {
        if self.is_active() {
            return Err(ObjectError::OperationActive);
        }
        let mut owned = Vec::new();
        owned
            .try_reserve_exact(template.len())
            .map_err(|_| ObjectError::HostMemory)?;
        for attr in template {
            attr.validate()?;
            owned.push(Attribute::new(attr.kind, dup(&attr.value)?));
        }
        let entries = registry.live_entries()?;
        tracing::trace!(candidates = entries.len(), terms = owned.len(), "Search started");
        self.state = State::Active {
            template: owned,
            entries,
            cursor: 0,
        };
        Ok(())
    }

    /// Up to `max_count` further matches; empty once exhausted.
    pub fn find(&mut self, registry: &Registry, max_count: usize) -> Result<Vec<CK_OBJECT_HANDLE>, ObjectError> {
        let State::Active {
            template,
            entries,
            cursor,
        } = &mut self.state
        else {
            return Err(ObjectError::OperationNotInitialized);
        };
        let (found, consumed) = registry.scan(&entries[*cursor..], template, max_count)?;
        *cursor += consumed;
        Ok(found)
    }

    pub fn find_final(&mut self) -> Result<(), ObjectError> {
        if !self.is_active() {
            return Err(ObjectError::OperationNotInitialized);
        }
        self.state = State::Idle;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use cryptoki_sys::*;

    use super::*;
    use crate::object::{ImportRequest, NativeInitializer, SessionAuth};
    use crate::store::MemoryStore;
    use crate::transport::MemTransport;

    fn registry_with(labels: &[&str]) -> Registry {
        let registry = Registry::open(MemoryStore::new(), Arc::new(MemTransport::new()), NativeInitializer).unwrap();
        for label in labels {
            registry
                .create(&[
                    Attribute::ulong(CKA_CLASS, CKO_DATA),
                    Attribute::new(CKA_LABEL, label.as_bytes().to_vec()),
                ])
                .unwrap();
        }
        registry
    }

    #[test]
    fn test_state_machine() {
        let registry = registry_with(&["a"]);
        let mut search = FindSession::new();

        assert!(matches!(search.find(&registry, 1), Err(ObjectError::OperationNotInitialized)));
        assert!(matches!(search.find_final(), Err(ObjectError::OperationNotInitialized)));

        search.find_init(&registry, &[]).unwrap();
        assert!(matches!(
            search.find_init(&registry, &[]),
            Err(ObjectError::OperationActive)
        ));
        assert_eq!(search.find(&registry, 10).unwrap().len(), 1);
        search.find_final().unwrap();
        assert!(!search.is_active());
        search.find_init(&registry, &[]).unwrap();
    }

    #[test]
    fn test_chunked_equals_unchunked() {
        let registry = registry_with(&["x", "y", "x", "z", "x", "x", "y"]);
        let template = [Attribute::new(CKA_LABEL, b"x".to_vec())];

        let mut whole = FindSession::new();
        whole.find_init(&registry, &template).unwrap();
        let all = whole.find(&registry, 100).unwrap();
        assert_eq!(all.len(), 4);
        assert!(whole.find(&registry, 100).unwrap().is_empty());

        for chunk in 1..=5 {
            let mut search = FindSession::new();
            search.find_init(&registry, &template).unwrap();
            let mut collected = Vec::new();
            loop {
                let part = search.find(&registry, chunk).unwrap();
                assert!(part.len() <= chunk);
                if part.is_empty() {
                    break;
                }
                collected.extend(part);
            }
            assert_eq!(collected, all, "chunk size {chunk}");
        }
    }

    #[test]
    fn test_snapshot_ignores_later_objects() {
        let registry = registry_with(&["a", "b"]);
        let mut search = FindSession::new();
        search.find_init(&registry, &[]).unwrap();
        assert_eq!(search.find(&registry, 1).unwrap().len(), 1);

        registry
            .create(&[Attribute::ulong(CKA_CLASS, CKO_DATA)])
            .unwrap();
        assert_eq!(search.find(&registry, 10).unwrap().len(), 1);
        assert!(search.find(&registry, 10).unwrap().is_empty());
    }

    #[test]
    fn test_reimported_id_is_not_reported() {
        let transport = Arc::new(MemTransport::new());
        transport.provision_persistent(0x8101_0001, CKK_EC, None);
        let registry = Registry::open(MemoryStore::new(), transport.clone(), NativeInitializer).unwrap();
        let session_auth = SessionAuth::new([3; 32]);
        let request = ImportRequest {
            id: 1,
            persistent_handle: 0x8101_0001,
            label: "ecc_no_auth".into(),
            auth: None,
        };
        let (private, public) = registry.import(request.clone(), &session_auth).unwrap();

        let mut search = FindSession::new();
        search.find_init(&registry, &[]).unwrap();

        registry.destroy(private).unwrap();
        registry.destroy(public).unwrap();
        let (new_private, new_public) = registry.import(request, &session_auth).unwrap();
        assert_eq!(registry.snapshot(new_private).unwrap().id, ObjectId(1));

        let found = search.find(&registry, 10).unwrap();
        assert!(found.is_empty(), "objects created after find_init leaked: {found:?}");
        search.find_final().unwrap();

        search.find_init(&registry, &[]).unwrap();
        assert_eq!(search.find(&registry, 10).unwrap(), vec![new_private, new_public]);
    }

    #[test]
    fn test_malformed_template_rejected() {
        let registry = registry_with(&[]);
        let mut search = FindSession::new();
        let err = search
            .find_init(&registry, &[Attribute::new(CKA_CLASS, vec![1])])
            .unwrap_err();
        assert!(matches!(err, ObjectError::AttributeValueInvalid(_)));
        assert!(!search.is_active());

        search
            .find_init(&registry, &[Attribute::new(0x7fff_0001, vec![1])])
            .unwrap();
        assert!(search.find(&registry, 10).unwrap().is_empty());
    }

    #[test]
    fn test_sessions_do_not_interfere() {
        let registry = registry_with(&["a", "b", "c"]);
        let mut one = FindSession::new();
        let mut two = FindSession::new();
        one.find_init(&registry, &[]).unwrap();
        two.find_init(&registry, &[]).unwrap();
        let first = one.find(&registry, 2).unwrap();
        let all = two.find(&registry, 10).unwrap();
        assert_eq!(&all[..2], &first[..]);
        assert_eq!(one.find(&registry, 10).unwrap(), all[2..].to_vec());
    }
}
