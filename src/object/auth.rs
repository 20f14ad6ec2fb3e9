use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use rand::RngCore;
use zeroize::Zeroizing;

use super::{ObjectError, SessionId, TokenObject};
use crate::transport::TransportError;

const NONCE_LEN: usize = 12;

/// Wrapping key made available by a successful login. Object auth values
/// are stored wrapped under it as `nonce || ciphertext || tag`.
pub struct SessionAuth {
    wrapping_key: Zeroizing<[u8; 32]>,
}

impl SessionAuth {
    pub fn new(wrapping_key: [u8; 32]) -> Self {
        Self {
            wrapping_key: Zeroizing::new(wrapping_key),
        }
    }

    pub fn wrap(&self, plain: &[u8]) -> Result<Vec<u8>, TransportError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);

        let cipher = Aes256Gcm::new_from_slice(&self.wrapping_key[..])
            .map_err(|e| TransportError::Unwrap(e.to_string()))?;
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plain)
            .map_err(|e| TransportError::Unwrap(e.to_string()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    pub fn unwrap(&self, wrapped: &[u8]) -> Result<Zeroizing<Vec<u8>>, TransportError> {
        if wrapped.len() < NONCE_LEN {
            return Err(TransportError::Unwrap("wrapped auth too short".into()));
        }
        let (nonce_bytes, ciphertext) = wrapped.split_at(NONCE_LEN);

        let cipher = Aes256Gcm::new_from_slice(&self.wrapping_key[..])
            .map_err(|e| TransportError::Unwrap(e.to_string()))?;
        let plain = cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|e| TransportError::Unwrap(e.to_string()))?;
        Ok(Zeroizing::new(plain))
    }
}

impl std::fmt::Debug for SessionAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionAuth").finish_non_exhaustive()
    }
}

/// Refuse private use of an auth-protected object unless `session` unlocked it.
pub(crate) fn require_authenticated(
    obj: &TokenObject,
    session: SessionId,
) -> Result<(), ObjectError> {
    if obj.wrapped_auth().is_none() || obj.is_authenticated_for(session) {
        Ok(())
    } else {
        Err(ObjectError::NotAuthenticated)
    }
}
