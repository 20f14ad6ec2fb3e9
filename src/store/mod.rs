pub mod disk;
pub mod memory;
pub mod record;

pub use disk::DiskStore;
pub use memory::MemoryStore;
pub use record::ObjectRecord;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialize: {0}")]
    Serialization(String),
    #[error("Corrupt: {0}")]
    Corrupt(String),
    #[error("Not found: object {0}")]
    NotFound(u32),
}

/// Durable home of object records. The registry calls `persist`/`remove`
/// after a mutation has been validated and before it is committed in memory.
pub trait ObjectStore: Send {
    /// Every stored record, ordered by id.
    fn load_all(&self) -> Result<Vec<ObjectRecord>, StoreError>;

    fn persist(&mut self, record: &ObjectRecord) -> Result<(), StoreError>;

    fn remove(&mut self, id: u32) -> Result<(), StoreError>;
}
