// src/wallet.rs
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::{rngs::OsRng, Rng};
use serde::{Deserialize, Serialize};

/// Account handle exposed to pages: never carries key material
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub address: String,
    pub name: String,
}

/// In-memory wallet holding an ed25519 signing key
#[derive(Debug, Clone)]
pub struct Wallet {
    pub signing_key: SigningKey,
    pub name: String,
}

impl Wallet {
    /// Generate a new random wallet
    pub fn new(name: String) -> Self {
        let mut csprng = OsRng;
        let secret_bytes: [u8; 32] = csprng.gen();
        let signing_key = SigningKey::from_bytes(&secret_bytes);
        Self { signing_key, name }
    }

    /// Reconstruct from a raw private key (32 or 64 bytes)
    pub fn from_private_key(private_key_bytes: &[u8], name: String) -> Result<Self, String> {
        match private_key_bytes.len() {
            32 => {
                let mut key_bytes = [0u8; 32];
                key_bytes.copy_from_slice(private_key_bytes);
                let signing_key = SigningKey::from_bytes(&key_bytes);
                Ok(Self { signing_key, name })
            }
            64 => {
                let mut key_bytes = [0u8; 32];
                key_bytes.copy_from_slice(&private_key_bytes[..32]);
                let signing_key = SigningKey::from_bytes(&key_bytes);
                let verifying_key = signing_key.verifying_key();
                if verifying_key.as_bytes() != &private_key_bytes[32..] {
                    return Err("Public key does not match private key".into());
                }
                Ok(Self { signing_key, name })
            }
            len => Err(format!("Invalid key length: {} bytes", len)),
        }
    }

    /// Base58-encoded public key, used as the account address
    pub fn address(&self) -> String {
        bs58::encode(self.signing_key.verifying_key().as_bytes()).into_string()
    }

    pub fn account(&self) -> Account {
        Account {
            address: self.address(),
            name: self.name.clone(),
        }
    }

    /// Raw 32-byte secret, only ever handed to the at-rest cipher
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn sign_message(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::Verifier;

    #[test]
    fn test_address_matches_verifying_key() {
        let wallet = Wallet::new("Main".into());
        let decoded = bs58::decode(wallet.address()).into_vec().unwrap();
        assert_eq!(decoded, wallet.verifying_key().as_bytes().to_vec());
        assert_eq!(wallet.account().name, "Main");
    }

    #[test]
    fn test_keypair_import_checks_public_half() {
        let wallet = Wallet::new("Main".into());
        let mut keypair = wallet.secret_bytes().to_vec();
        keypair.extend_from_slice(wallet.verifying_key().as_bytes());
        let restored = Wallet::from_private_key(&keypair, "Restored".into()).unwrap();
        assert_eq!(restored.address(), wallet.address());

        keypair[40] ^= 0xff;
        assert!(Wallet::from_private_key(&keypair, "Bad".into()).is_err());
        assert!(Wallet::from_private_key(&[0u8; 10], "Short".into()).is_err());
    }

    #[test]
    fn test_signature_verifies() {
        let wallet = Wallet::new("Main".into());
        let signature = wallet.sign_message(b"hello");
        assert!(wallet.verifying_key().verify(b"hello", &signature).is_ok());
    }
}
