use cryptoki_sys::{CKA_CLASS, CKA_LABEL, CKO_PRIVATE_KEY};
use tpmtok::store::record::RECORD_VERSION;
use tpmtok::store::{DiskStore, ObjectRecord, ObjectStore, StoreError};
use tpmtok::Attribute;

fn make_record(id: u32, label: &str) -> ObjectRecord {
    ObjectRecord {
        version: RECORD_VERSION,
        id,
        link: Some(id + 1),
        public_blob: Some(vec![0x01; 90]),
        private_blob: Some(vec![0x02; 120]),
        wrapped_auth: Some(vec![0x03; 40]),
        persistent_handle: None,
        serialized_tr: None,
        attrs: vec![
            Attribute::ulong(CKA_CLASS, CKO_PRIVATE_KEY),
            Attribute::new(CKA_LABEL, label.as_bytes().to_vec()),
        ],
    }
}

#[test]
fn test_store_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let record = make_record(1, "rsa_no_auth");

    {
        let mut store = DiskStore::open(dir.path()).unwrap();
        store.persist(&record).unwrap();
    }

    // Reopen from disk
    let store = DiskStore::open(dir.path()).unwrap();
    let loaded = store.load_all().unwrap();
    assert_eq!(loaded, vec![record]);
}

#[test]
fn test_store_orders_by_id_and_overwrites() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = DiskStore::open(dir.path()).unwrap();
    store.persist(&make_record(0x1_0002, "c")).unwrap();
    store.persist(&make_record(3, "b")).unwrap();
    store.persist(&make_record(1, "a")).unwrap();
    store.persist(&make_record(3, "b2")).unwrap();

    let ids: Vec<u32> = store.load_all().unwrap().iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![1, 3, 0x1_0002]);
    let three = store.load_all().unwrap().into_iter().find(|r| r.id == 3).unwrap();
    assert_eq!(three.attrs[1].value, b"b2");
}

#[test]
fn test_store_remove() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = DiskStore::open(dir.path()).unwrap();
    store.persist(&make_record(7, "gone")).unwrap();

    store.remove(7).unwrap();
    assert!(store.load_all().unwrap().is_empty());

    // Removing again reports the missing record
    assert!(matches!(store.remove(7), Err(StoreError::NotFound(7))));
}

#[test]
fn test_store_skips_garbage_and_foreign_files() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = DiskStore::open(dir.path()).unwrap();
    store.persist(&make_record(2, "good")).unwrap();

    std::fs::write(dir.path().join("deadbeef.obj"), b"not cbor").unwrap();
    std::fs::write(dir.path().join("00000009.obj"), b"").unwrap();
    std::fs::write(dir.path().join("notes.txt"), b"ignore me").unwrap();

    let loaded = store.load_all().unwrap();
    assert_eq!(loaded.len(), 1, "valid record must still load despite corrupt neighbours");
    assert_eq!(loaded[0].id, 2);
}

#[test]
fn test_store_rejects_unknown_version() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = DiskStore::open(dir.path()).unwrap();
    let mut record = make_record(4, "future");
    record.version = RECORD_VERSION + 1;
    store.persist(&record).unwrap();
    assert!(store.load_all().unwrap().is_empty());
}

#[test]
fn test_store_wipe() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = DiskStore::open(dir.path()).unwrap();
    store.persist(&make_record(1, "a")).unwrap();
    store.persist(&make_record(2, "b")).unwrap();
    std::fs::write(dir.path().join("keep.txt"), b"x").unwrap();

    assert_eq!(store.wipe().unwrap(), 2);
    assert!(store.load_all().unwrap().is_empty());
    assert!(dir.path().join("keep.txt").exists());
}
