// src/keyring/software.rs
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::keyring::{Keyring, KeyringError, SealedKey};
use crate::storage::{self, KvStore};
use crate::wallet::{Account, Wallet};

const WALLETS_KEY: &str = "wallets";

/// Persisted wallet entry; the secret key is only stored encrypted
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WalletInfo {
    pub name: String,
    pub address: String,
    pub key: SealedKey,
}

/// ed25519 keyring backed by the shared store, keys encrypted at rest
pub struct SoftwareKeyring {
    store: Arc<dyn KvStore>,
    unlocked: Mutex<HashMap<String, Wallet>>,
}

impl SoftwareKeyring {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            store,
            unlocked: Mutex::new(HashMap::new()),
        }
    }

    fn load_wallets(&self) -> Result<Vec<WalletInfo>, KeyringError> {
        storage::load::<Vec<WalletInfo>>(self.store.as_ref(), WALLETS_KEY)
            .map(Option::unwrap_or_default)
            .map_err(|e| KeyringError::Storage(e.to_string()))
    }

    fn find_wallet(&self, address: &str) -> Result<WalletInfo, KeyringError> {
        self.load_wallets()?
            .into_iter()
            .find(|w| w.address == address)
            .ok_or_else(|| KeyringError::WalletNotFound(address.to_string()))
    }

    /// Generate a fresh account and persist it encrypted under `password`
    pub fn create_account(&self, name: &str, password: &str) -> Result<Account, KeyringError> {
        self.store_wallet(Wallet::new(name.to_string()), password)
    }

    /// Import a 32- or 64-byte base58 secret key
    pub fn import_account(
        &self,
        name: &str,
        secret_base58: &str,
        password: &str,
    ) -> Result<Account, KeyringError> {
        let key_bytes = bs58::decode(secret_base58.trim())
            .into_vec()
            .map_err(|e| KeyringError::Crypto(format!("Invalid base58 format: {}", e)))?;
        let wallet =
            Wallet::from_private_key(&key_bytes, name.to_string()).map_err(KeyringError::Crypto)?;
        self.store_wallet(wallet, password)
    }

    fn store_wallet(&self, wallet: Wallet, password: &str) -> Result<Account, KeyringError> {
        let mut wallets = self.load_wallets()?;
        let account = wallet.account();
        if wallets.iter().any(|w| w.address == account.address) {
            log::warn!("⚠️ Keyring: wallet {} already present", account.address);
            return Ok(account);
        }

        wallets.push(WalletInfo {
            name: account.name.clone(),
            address: account.address.clone(),
            key: SealedKey::seal(&wallet.secret_bytes(), password)?,
        });
        storage::save(self.store.as_ref(), WALLETS_KEY, &wallets)
            .map_err(|e| KeyringError::Storage(e.to_string()))?;

        log::info!("👛 Keyring: stored wallet {} ({})", account.name, account.address);
        Ok(account)
    }

    /// Forget every decrypted key held in memory
    pub fn lock_all(&self) {
        self.unlocked.lock().clear();
    }
}

#[async_trait]
impl Keyring for SoftwareKeyring {
    async fn list_accounts(&self) -> Result<Vec<Account>, KeyringError> {
        Ok(self
            .load_wallets()?
            .into_iter()
            .map(|w| Account {
                address: w.address,
                name: w.name,
            })
            .collect())
    }

    async fn unlock(&self, address: &str, password: &str) -> Result<(), KeyringError> {
        let info = self.find_wallet(address)?;
        let secret = info.key.open(password)?;
        let wallet = Wallet::from_private_key(&secret, info.name).map_err(KeyringError::Crypto)?;
        if wallet.address() != info.address {
            return Err(KeyringError::Crypto("decrypted key does not match address".into()));
        }

        self.unlocked.lock().insert(info.address, wallet);
        Ok(())
    }

    async fn sign(&self, address: &str, payload: &[u8]) -> Result<Vec<u8>, KeyringError> {
        let unlocked = self.unlocked.lock();
        let wallet = unlocked
            .get(address)
            .ok_or_else(|| KeyringError::Locked(address.to_string()))?;
        Ok(wallet.sign_message(payload).to_bytes().to_vec())
    }
}
