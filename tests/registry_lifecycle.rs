use std::sync::Arc;

use cryptoki_sys::*;
use tpmtok::object::mech::EC_PARAMS_P256;
use tpmtok::object::AUTO_ID_BASE;
use tpmtok::store::{DiskStore, ObjectStore};
use tpmtok::transport::MemTransport;
use tpmtok::{list_objects, Attribute, FindSession, NativeInitializer, ObjectError, ObjectId, Registry, SessionId};

fn open(dir: &std::path::Path, transport: &Arc<MemTransport>) -> Registry {
    Registry::open(DiskStore::open(dir).unwrap(), transport.clone(), NativeInitializer).unwrap()
}

fn ec_pair(registry: &Registry, label: &str) -> (CK_OBJECT_HANDLE, CK_OBJECT_HANDLE) {
    registry
        .generate_key_pair(
            &[
                Attribute::ulong(CKA_KEY_TYPE, CKK_EC),
                Attribute::new(CKA_EC_PARAMS, EC_PARAMS_P256.to_vec()),
                Attribute::new(CKA_LABEL, label.as_bytes().to_vec()),
            ],
            &[Attribute::new(CKA_LABEL, label.as_bytes().to_vec())],
        )
        .unwrap()
}

#[test]
fn test_objects_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let transport = Arc::new(MemTransport::new());

    let (public_id, point) = {
        let registry = open(dir.path(), &transport);
        let (public, private) = ec_pair(&registry, "signer");
        registry
            .set_attributes(private, &[Attribute::new(CKA_LABEL, b"renamed".to_vec())])
            .unwrap();
        let info = registry.snapshot(public).unwrap();
        (info.id, registry.get_attribute(public, CKA_EC_POINT).unwrap())
    };

    let registry = open(dir.path(), &transport);
    assert_eq!(registry.object_count().unwrap(), 2);
    let public = registry.handle_of(public_id).unwrap().unwrap();
    assert_eq!(registry.get_attribute(public, CKA_EC_POINT).unwrap(), point);

    let private_id = registry.snapshot(public).unwrap().link.unwrap();
    let private = registry.handle_of(private_id).unwrap().unwrap();
    assert_eq!(
        registry.get_attribute(private, CKA_LABEL).unwrap().value,
        b"renamed"
    );
    // Key material reloads after restart.
    let sig = registry
        .sign(SessionId(1), private, CKM_ECDSA, &[0u8; 32])
        .unwrap();
    assert!(!sig.is_empty());
}

#[test]
fn test_destroy_removes_record() {
    let dir = tempfile::tempdir().unwrap();
    let transport = Arc::new(MemTransport::new());
    let registry = open(dir.path(), &transport);

    let handle = registry
        .create(&[
            Attribute::ulong(CKA_CLASS, CKO_DATA),
            Attribute::new(CKA_LABEL, b"note".to_vec()),
        ])
        .unwrap();
    assert_eq!(DiskStore::open(dir.path()).unwrap().load_all().unwrap().len(), 1);

    registry.destroy(handle).unwrap();
    assert!(DiskStore::open(dir.path()).unwrap().load_all().unwrap().is_empty());
    assert!(matches!(
        registry.get_attribute(handle, CKA_LABEL),
        Err(ObjectError::HandleInvalid(_))
    ));
    assert!(matches!(
        registry.destroy(handle),
        Err(ObjectError::HandleInvalid(_))
    ));
}

#[test]
fn test_auto_ids_continue_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let transport = Arc::new(MemTransport::new());
    {
        let registry = open(dir.path(), &transport);
        ec_pair(&registry, "a");
    }
    let registry = open(dir.path(), &transport);
    let (public, private) = ec_pair(&registry, "b");
    assert_eq!(registry.snapshot(private).unwrap().id, ObjectId(AUTO_ID_BASE + 2));
    assert_eq!(registry.snapshot(public).unwrap().id, ObjectId(AUTO_ID_BASE + 3));
}

#[test]
fn test_search_chunks_over_disk_backed_registry() {
    let dir = tempfile::tempdir().unwrap();
    let transport = Arc::new(MemTransport::new());
    let registry = open(dir.path(), &transport);
    for i in 0..5 {
        ec_pair(&registry, &format!("key{i}"));
    }

    let template = [Attribute::ulong(CKA_CLASS, CKO_PRIVATE_KEY)];
    let mut search = FindSession::new();
    search.find_init(&registry, &template).unwrap();
    let mut found = Vec::new();
    loop {
        let chunk = search.find(&registry, 2).unwrap();
        if chunk.is_empty() {
            break;
        }
        found.extend(chunk);
    }
    search.find_final().unwrap();
    assert_eq!(found.len(), 5);

    let ids: Vec<_> = found
        .iter()
        .map(|h| registry.snapshot(*h).unwrap().id)
        .collect();
    let mut sorted = ids.clone();
    sorted.sort();
    assert_eq!(ids, sorted, "results come back in id order");
}

#[test]
fn test_list_objects_output() {
    let dir = tempfile::tempdir().unwrap();
    let transport = Arc::new(MemTransport::new());
    let registry = open(dir.path(), &transport);
    ec_pair(&registry, "listed");

    let mut out = Vec::new();
    let count = list_objects(&registry, &mut out).unwrap();
    assert_eq!(count, 2);

    let text = String::from_utf8(out).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].starts_with(&format!("{}\t", ObjectId(AUTO_ID_BASE))));
    assert!(lines[0].contains(&format!("class={CKO_PRIVATE_KEY:#x}")));
    assert!(lines[1].contains(&format!("link={}", ObjectId(AUTO_ID_BASE))));
    assert!(lines.iter().all(|l| l.ends_with("label=listed")));
}
