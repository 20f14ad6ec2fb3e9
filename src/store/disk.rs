use std::path::{Path, PathBuf};

use super::record::RECORD_VERSION;
use super::{ObjectRecord, ObjectStore, StoreError};

const EXTENSION: &str = "obj";

/// One CBOR file per object, named after its id.
pub struct DiskStore {
    dir: PathBuf,
}

impl DiskStore {
    /// Open (and create if missing) the object directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: u32) -> PathBuf {
        self.dir.join(format!("{id:08x}.{EXTENSION}"))
    }

    /// Delete every object file. Returns how many were removed.
    pub fn wipe(&mut self) -> Result<usize, StoreError> {
        let mut count = 0usize;
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some(EXTENSION) {
                std::fs::remove_file(path)?;
                count += 1;
            }
        }
        Ok(count)
    }
}

/// Serialize + write a record to `path`, via a temp file so a crash never
/// leaves a half-written record behind.
fn write_record(path: &Path, record: &ObjectRecord) -> Result<(), StoreError> {
    let mut buf = Vec::new();
    ciborium::into_writer(record, &mut buf)
        .map_err(|e| StoreError::Serialization(e.to_string()))?;

    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, buf)?;
    std::fs::rename(tmp, path)?;
    Ok(())
}

/// Read + deserialize a record from `path`.
fn read_record(path: &Path) -> Result<ObjectRecord, StoreError> {
    let bytes = std::fs::read(path)?;
    if bytes.is_empty() {
        return Err(StoreError::Corrupt("empty file".into()));
    }
    let record: ObjectRecord = ciborium::from_reader(bytes.as_slice())
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    if record.version != RECORD_VERSION {
        return Err(StoreError::Corrupt(format!("unknown record version {}", record.version)));
    }
    Ok(record)
}

impl ObjectStore for DiskStore {
    /// Load all valid record files. Logs and skips corrupt files.
    fn load_all(&self) -> Result<Vec<ObjectRecord>, StoreError> {
        let mut records = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            match read_record(&path) {
                Ok(record) => records.push(record),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping corrupt object record");
                }
            }
        }
        records.sort_by_key(|r| r.id);
        Ok(records)
    }

    fn persist(&mut self, record: &ObjectRecord) -> Result<(), StoreError> {
        write_record(&self.path_for(record.id), record)
    }

    fn remove(&mut self, id: u32) -> Result<(), StoreError> {
        let path = self.path_for(id);
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StoreError::NotFound(id)),
            Err(e) => Err(e.into()),
        }
    }
}
