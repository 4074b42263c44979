use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use pbkdf2::pbkdf2_hmac;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::keyring::KeyringError;

#[cfg(not(test))]
const ROUNDS: u32 = 100_000;
#[cfg(test)]
const ROUNDS: u32 = 1_000;
const NONCE_BYTES: usize = 12;

/// A secret key as it sits in the store, sealed under the account password.
///
/// PBKDF2-SHA256 stretches the password with a per-key salt into an
/// AES-256-GCM key. All three parts are hex so the record stays plain JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SealedKey {
    salt: String,
    nonce: String,
    ciphertext: String,
}

impl SealedKey {
    pub fn seal(secret: &[u8], password: &str) -> Result<Self, KeyringError> {
        let salt: [u8; 16] = rand::random();
        let nonce: [u8; NONCE_BYTES] = rand::random();
        let ciphertext = cipher_for(password, &salt)
            .encrypt(Nonce::from_slice(&nonce), secret)
            .map_err(|_| KeyringError::Crypto("cannot seal key".into()))?;
        Ok(Self {
            salt: hex::encode(salt),
            nonce: hex::encode(nonce),
            ciphertext: hex::encode(ciphertext),
        })
    }

    /// Recover the secret. A failed tag check means the password is wrong.
    pub fn open(&self, password: &str) -> Result<Vec<u8>, KeyringError> {
        let salt = unhex("salt", &self.salt)?;
        let nonce = unhex("nonce", &self.nonce)?;
        if nonce.len() != NONCE_BYTES {
            return Err(KeyringError::Crypto(format!("nonce is {} bytes", nonce.len())));
        }
        let ciphertext = unhex("ciphertext", &self.ciphertext)?;
        cipher_for(password, &salt)
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
            .map_err(|_| KeyringError::InvalidPassword)
    }
}

fn cipher_for(password: &str, salt: &[u8]) -> Aes256Gcm {
    let mut key = Key::<Aes256Gcm>::default();
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, ROUNDS, &mut key);
    Aes256Gcm::new(&key)
}

fn unhex(field: &str, value: &str) -> Result<Vec<u8>, KeyringError> {
    hex::decode(value).map_err(|e| KeyringError::Crypto(format!("sealed {field}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_with_password() {
        let sealed = SealedKey::seal(b"secret key bytes", "hunter2").unwrap();
        assert_eq!(sealed.open("hunter2").unwrap(), b"secret key bytes".to_vec());
        assert_eq!(sealed.open("hunter3"), Err(KeyringError::InvalidPassword));
    }

    #[test]
    fn test_each_seal_is_fresh() {
        let a = SealedKey::seal(b"same", "pw").unwrap();
        let b = SealedKey::seal(b"same", "pw").unwrap();
        assert_ne!(a.salt, b.salt);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn test_damaged_record_is_crypto_error() {
        let sealed = SealedKey::seal(b"secret", "pw").unwrap();
        let short_nonce = SealedKey {
            nonce: "0102".into(),
            ..sealed.clone()
        };
        assert!(matches!(short_nonce.open("pw"), Err(KeyringError::Crypto(_))));

        let not_hex = SealedKey {
            ciphertext: "zz".into(),
            ..sealed
        };
        assert!(matches!(not_hex.open("pw"), Err(KeyringError::Crypto(_))));
    }

    #[test]
    fn test_record_shape() {
        let sealed = SealedKey::seal(b"k", "pw").unwrap();
        let json = serde_json::to_value(&sealed).unwrap();
        assert_eq!(json["salt"].as_str().unwrap().len(), 32);
        assert_eq!(json["nonce"].as_str().unwrap().len(), 24);
        assert_eq!(serde_json::from_value::<SealedKey>(json).unwrap(), sealed);
    }
}
