#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Object: {0}")]
    Object(#[from] crate::object::ObjectError),
    #[error("Transport: {0}")]
    Transport(#[from] crate::transport::TransportError),
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("TPM: {0}")]
    Tpm(#[from] crate::tpm::TpmError),
    #[error("Store: {0}")]
    Store(#[from] crate::store::StoreError),
    #[error("Config: {0}")]
    Config(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
