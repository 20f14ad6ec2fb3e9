pub mod context;
pub mod keys;
pub mod seal;
pub mod transport;

pub use context::TpmContext;
pub use transport::TpmTransport;

use crate::transport::TransportError;

#[derive(Debug, thiserror::Error)]
pub enum TpmError {
    #[error("TPM context error: {0}")]
    Context(String),
    #[error("TPM key error: {0}")]
    Key(String),
    #[error("TPM seal error: {0}")]
    Seal(String),
    #[error("TPM unsupported: {0}")]
    Unsupported(String),
    #[error("TPM error: {0}")]
    Other(String),
}

impl From<tss_esapi::Error> for TpmError {
    fn from(e: tss_esapi::Error) -> Self {
        TpmError::Other(e.to_string())
    }
}

impl From<TpmError> for TransportError {
    fn from(e: TpmError) -> Self {
        match e {
            TpmError::Unsupported(what) => TransportError::Unsupported(what),
            other => TransportError::Device(other.to_string()),
        }
    }
}
