use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use super::{ObjectRecord, ObjectStore, StoreError};

/// In-process store. Clones share the same records, so a test can keep a
/// handle while the registry owns another.
#[derive(Clone, Default)]
pub struct MemoryStore {
    records: Arc<Mutex<BTreeMap<u32, ObjectRecord>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: impl IntoIterator<Item = ObjectRecord>) -> Self {
        let store = Self::new();
        if let Ok(mut map) = store.records.lock() {
            map.extend(records.into_iter().map(|r| (r.id, r)));
        }
        store
    }

    pub fn get(&self, id: u32) -> Option<ObjectRecord> {
        self.records.lock().ok()?.get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<u32, ObjectRecord>>, StoreError> {
        self.records
            .lock()
            .map_err(|_| StoreError::Corrupt("memory store mutex poisoned".into()))
    }
}

impl ObjectStore for MemoryStore {
    fn load_all(&self) -> Result<Vec<ObjectRecord>, StoreError> {
        Ok(self.lock()?.values().cloned().collect())
    }

    fn persist(&mut self, record: &ObjectRecord) -> Result<(), StoreError> {
        self.lock()?.insert(record.id, record.clone());
        Ok(())
    }

    fn remove(&mut self, id: u32) -> Result<(), StoreError> {
        self.lock()?
            .remove(&id)
            .map(|_| ())
            .ok_or(StoreError::NotFound(id))
    }
}
