//! Envelope encryption for secrets held by the store.
//!
//! Each secret gets a random data key. The payload is sealed with the data key
//! and the data key is wrapped with the manager's master key. Both use
//! AES-256-GCM; the payload is bound to its secret ID through the AAD.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use base64::Engine;
use convoy_secrets::SecretPayload;
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;

const KEY_BYTES: usize = 32;
const NONCE_BYTES: usize = 12;
const WRAP_AAD: &[u8] = b"convoy-secrets-wrap-v1";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SealError {
    #[error("invalid secrets master key encoding")]
    InvalidMasterKey,
    #[error("secret encryption failed")]
    EncryptFailed,
    #[error("secret decryption failed")]
    DecryptFailed,
    #[error("unknown master key id: {0}")]
    UnknownMasterKey(String),
    #[error("unsealed payload rejected: {0}")]
    Payload(String),
}

/// Operator-provided key that wraps per-secret data keys.
#[derive(Clone)]
pub struct MasterKey {
    id: String,
    key_bytes: [u8; KEY_BYTES],
}

impl MasterKey {
    /// Decode a base64 encoded 32 byte key.
    pub fn from_base64(raw: &str) -> Result<Self, SealError> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(raw.trim())
            .map_err(|_| SealError::InvalidMasterKey)?;
        let key_bytes: [u8; KEY_BYTES] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| SealError::InvalidMasterKey)?;
        Ok(Self::from_bytes(key_bytes))
    }

    /// Fresh random key. Secrets sealed with it are lost on restart.
    pub fn generate() -> Self {
        let mut key_bytes = [0u8; KEY_BYTES];
        rand::rng().fill_bytes(&mut key_bytes);
        Self::from_bytes(key_bytes)
    }

    fn from_bytes(key_bytes: [u8; KEY_BYTES]) -> Self {
        let id = hex::encode(Sha256::digest(key_bytes))[..8].to_string();
        Self { id, key_bytes }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKey")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// Ciphertext plus everything needed to open it again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedSecret {
    pub nonce: Vec<u8>,
    pub ciphertext: Vec<u8>,
    pub master_key_id: String,
    pub wrapped_data_key: Vec<u8>,
    pub wrapped_data_key_nonce: Vec<u8>,
    pub plaintext_size: usize,
}

/// Seals and unseals payloads with one master key.
#[derive(Debug, Clone)]
pub struct SecretSealer {
    master: MasterKey,
}

impl SecretSealer {
    pub fn new(master: MasterKey) -> Self {
        Self { master }
    }

    pub fn master_key_id(&self) -> &str {
        self.master.id()
    }

    pub fn seal(&self, payload: &SecretPayload, aad: &[u8]) -> Result<SealedSecret, SealError> {
        let mut data_key = [0u8; KEY_BYTES];
        rand::rng().fill_bytes(&mut data_key);

        let mut nonce_bytes = [0u8; NONCE_BYTES];
        rand::rng().fill_bytes(&mut nonce_bytes);

        let cipher = Aes256Gcm::new_from_slice(&data_key).map_err(|_| SealError::EncryptFailed)?;
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: payload.expose(),
                    aad,
                },
            )
            .map_err(|_| SealError::EncryptFailed)?;

        let mut wrap_nonce_bytes = [0u8; NONCE_BYTES];
        rand::rng().fill_bytes(&mut wrap_nonce_bytes);
        let wrap_cipher = Aes256Gcm::new_from_slice(&self.master.key_bytes)
            .map_err(|_| SealError::EncryptFailed)?;
        let wrapped_data_key = wrap_cipher
            .encrypt(
                Nonce::from_slice(&wrap_nonce_bytes),
                Payload {
                    msg: &data_key,
                    aad: WRAP_AAD,
                },
            )
            .map_err(|_| SealError::EncryptFailed)?;

        data_key.iter_mut().for_each(|b| *b = 0);

        Ok(SealedSecret {
            nonce: nonce_bytes.to_vec(),
            ciphertext,
            master_key_id: self.master.id.clone(),
            wrapped_data_key,
            wrapped_data_key_nonce: wrap_nonce_bytes.to_vec(),
            plaintext_size: payload.len(),
        })
    }

    pub fn unseal(&self, sealed: &SealedSecret, aad: &[u8]) -> Result<SecretPayload, SealError> {
        if sealed.master_key_id != self.master.id {
            return Err(SealError::UnknownMasterKey(sealed.master_key_id.clone()));
        }
        if sealed.nonce.len() != NONCE_BYTES || sealed.wrapped_data_key_nonce.len() != NONCE_BYTES
        {
            return Err(SealError::DecryptFailed);
        }

        let wrap_cipher = Aes256Gcm::new_from_slice(&self.master.key_bytes)
            .map_err(|_| SealError::DecryptFailed)?;
        let mut data_key = wrap_cipher
            .decrypt(
                Nonce::from_slice(&sealed.wrapped_data_key_nonce),
                Payload {
                    msg: &sealed.wrapped_data_key,
                    aad: WRAP_AAD,
                },
            )
            .map_err(|_| SealError::DecryptFailed)?;

        let cipher = Aes256Gcm::new_from_slice(&data_key).map_err(|_| SealError::DecryptFailed);
        data_key.iter_mut().for_each(|b| *b = 0);

        let plaintext = cipher?
            .decrypt(
                Nonce::from_slice(&sealed.nonce),
                Payload {
                    msg: &sealed.ciphertext,
                    aad,
                },
            )
            .map_err(|_| SealError::DecryptFailed)?;

        SecretPayload::new(plaintext).map_err(|e| SealError::Payload(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sealer() -> SecretSealer {
        SecretSealer::new(MasterKey::generate())
    }

    #[test]
    fn test_seal_unseal() {
        let sealer = sealer();
        let payload = SecretPayload::new(b"hunter2".to_vec()).unwrap();
        let sealed = sealer.seal(&payload, b"sec_1").unwrap();

        assert_ne!(sealed.ciphertext, b"hunter2".to_vec());
        assert_eq!(sealed.plaintext_size, 7);
        assert_eq!(sealer.unseal(&sealed, b"sec_1").unwrap(), payload);
    }

    #[test]
    fn test_wrong_aad_fails() {
        let sealer = sealer();
        let payload = SecretPayload::new(b"hunter2".to_vec()).unwrap();
        let sealed = sealer.seal(&payload, b"sec_1").unwrap();
        assert_eq!(
            sealer.unseal(&sealed, b"sec_2").unwrap_err(),
            SealError::DecryptFailed
        );
    }

    #[test]
    fn test_other_master_key_rejected() {
        let payload = SecretPayload::new(b"x".to_vec()).unwrap();
        let sealed = sealer().seal(&payload, b"aad").unwrap();
        assert!(matches!(
            sealer().unseal(&sealed, b"aad"),
            Err(SealError::UnknownMasterKey(_))
        ));
    }

    #[test]
    fn test_master_key_from_base64() {
        let raw = base64::engine::general_purpose::STANDARD.encode([7u8; 32]);
        let key = MasterKey::from_base64(&raw).unwrap();
        assert_eq!(key.id().len(), 8);
        assert!(!format!("{key:?}").contains("key_bytes"));

        let short = base64::engine::general_purpose::STANDARD.encode([7u8; 16]);
        assert_eq!(
            MasterKey::from_base64(&short).unwrap_err(),
            SealError::InvalidMasterKey
        );
        assert_eq!(
            MasterKey::from_base64("not base64!").unwrap_err(),
            SealError::InvalidMasterKey
        );
    }
}
