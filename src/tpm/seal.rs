use std::convert::TryFrom;
use rand::RngCore;
use tss_esapi::Context;
use tss_esapi::attributes::ObjectAttributesBuilder;
use tss_esapi::handles::KeyHandle;
use tss_esapi::handles::ObjectHandle;
use tss_esapi::interface_types::algorithm::HashingAlgorithm;
use tss_esapi::interface_types::algorithm::PublicAlgorithm;
use tss_esapi::structures::KeyedHashScheme;
use tss_esapi::structures::Private;
use tss_esapi::structures::Public;
use tss_esapi::structures::PublicBuilder;
use tss_esapi::structures::PublicKeyedHashParameters;
use tss_esapi::structures::SensitiveData;
use tss_esapi::traits::Marshall;
use tss_esapi::traits::UnMarshall;
use zeroize::Zeroizing;
use super::TpmError;

/// The token's auth-wrapping key, sealed under the primary. Stored on disk
/// as `u32 BE private length || private || public`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedKey {
    pub private: Vec<u8>,
    pub public: Vec<u8>,
}

impl SealedKey {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut blob = Vec::with_capacity(4 + self.private.len() + self.public.len());
        blob.extend_from_slice(&(self.private.len() as u32).to_be_bytes());
        blob.extend_from_slice(&self.private);
        blob.extend_from_slice(&self.public);
        blob
    }

    pub fn from_bytes(blob: &[u8]) -> Result<Self, TpmError> {
        let (len, rest) = blob
            .split_first_chunk::<4>()
            .ok_or_else(|| TpmError::Seal("sealed key blob is truncated".into()))?;
        let private_len = u32::from_be_bytes(*len) as usize;
        if rest.len() < private_len {
            return Err(TpmError::Seal("sealed key private section truncated".into()));
        }
        let (private, public) = rest.split_at(private_len);
        Ok(Self {
            private: private.to_vec(),
            public: public.to_vec(),
        })
    }
}

/// Create a sealed object wrapping a random 32-byte key. Only this TPM's
/// storage primary can load it back.
pub fn create_seal(
    ctx: &mut Context,
    primary: KeyHandle,
) -> Result<(SealedKey, Zeroizing<[u8; 32]>), TpmError> {
    let mut key = Zeroizing::new([0u8; 32]);
    rand::thread_rng().fill_bytes(&mut key[..]);

    let sensitive = SensitiveData::try_from(key.to_vec())
        .map_err(|e| TpmError::Seal(e.to_string()))?;
    let attrs = ObjectAttributesBuilder::new()
        .with_fixed_tpm(true)
        .with_fixed_parent(true)
        .with_user_with_auth(true)
        .build()
        .map_err(|e| TpmError::Seal(e.to_string()))?;

    let seal_params = PublicKeyedHashParameters::new(KeyedHashScheme::Null);

    let pub_template = PublicBuilder::new()
        .with_public_algorithm(PublicAlgorithm::KeyedHash)
        .with_name_hashing_algorithm(HashingAlgorithm::Sha256)
        .with_object_attributes(attrs)
        .with_keyed_hash_parameters(seal_params)
        .with_keyed_hash_unique_identifier(Default::default())
        .build()
        .map_err(|e| TpmError::Seal(e.to_string()))?;

    let result = ctx
        .execute_with_nullauth_session(|ctx| {
            ctx.create(primary, pub_template, None, Some(sensitive), None, None)
        })
        .map_err(|e: tss_esapi::Error| TpmError::Seal(e.to_string()))?;

    let sealed = SealedKey {
        private: result.out_private.value().to_vec(),
        public: result
            .out_public
            .marshall()
            .map_err(|e| TpmError::Seal(e.to_string()))?,
    };
    Ok((sealed, key))
}

/// Load the sealed object and recover the 32-byte key.
pub fn unseal(
    ctx: &mut Context,
    primary: KeyHandle,
    sealed: &SealedKey,
) -> Result<Zeroizing<[u8; 32]>, TpmError> {
    let private = Private::try_from(sealed.private.clone())
        .map_err(|e| TpmError::Seal(e.to_string()))?;
    let public = Public::unmarshall(&sealed.public)
        .map_err(|e| TpmError::Seal(e.to_string()))?;

    let sealed_handle = ctx
        .execute_with_nullauth_session(|ctx| ctx.load(primary, private, public))
        .map_err(|e: tss_esapi::Error| TpmError::Seal(e.to_string()))?;
    let obj = ObjectHandle::from(sealed_handle);

    let unsealed = ctx
        .execute_with_nullauth_session(|ctx| ctx.unseal(obj))
        .map_err(|e: tss_esapi::Error| TpmError::Seal(e.to_string()));

    ctx.flush_context(obj)
        .map_err(|e| TpmError::Seal(e.to_string()))?;
    let sensitive = unsealed?;

    let bytes = sensitive.value();
    if bytes.len() != 32 {
        return Err(TpmError::Seal(format!(
            "expected 32-byte key, got {}",
            bytes.len()
        )));
    }

    let mut key = Zeroizing::new([0u8; 32]);
    key.copy_from_slice(bytes);
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sealed_key_framing() {
        let sealed = SealedKey {
            private: vec![1, 2, 3],
            public: vec![9; 10],
        };
        let bytes = sealed.to_bytes();
        assert_eq!(&bytes[..4], &3u32.to_be_bytes());
        assert_eq!(SealedKey::from_bytes(&bytes).unwrap(), sealed);
    }

    #[test]
    fn test_sealed_key_truncated() {
        assert!(SealedKey::from_bytes(&[0, 0]).is_err());
        assert!(SealedKey::from_bytes(&[0, 0, 0, 9, 1, 2]).is_err());
    }
}
