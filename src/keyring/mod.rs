// src/keyring/mod.rs
use async_trait::async_trait;

use crate::wallet::Account;

pub mod sealed;
pub mod software;

pub use sealed::SealedKey;

pub use software::SoftwareKeyring;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum KeyringError {
    #[error("no wallet for address {0}")]
    WalletNotFound(String),
    #[error("incorrect password")]
    InvalidPassword,
    #[error("wallet {0} is not unlocked")]
    Locked(String),
    #[error("signing failed: {0}")]
    Signing(String),
    #[error("keyring storage: {0}")]
    Storage(String),
    #[error("keyring crypto: {0}")]
    Crypto(String),
}

/// Key custody capability consumed by the coordinator.
///
/// The coordinator only ever sees addresses and finished signatures.
#[async_trait]
pub trait Keyring: Send + Sync {
    async fn list_accounts(&self) -> Result<Vec<Account>, KeyringError>;

    /// Verify `password` for `address`; on success the address may sign.
    async fn unlock(&self, address: &str, password: &str) -> Result<(), KeyringError>;

    async fn sign(&self, address: &str, payload: &[u8]) -> Result<Vec<u8>, KeyringError>;
}
