use std::collections::BTreeMap;
use std::sync::Arc;

use crate::storage::{self, KvStore, StorageError};

/// Durable `(address, origin) -> granted` records.
///
/// Every call goes straight to the store, so a revoke is visible to the very
/// next check.
#[derive(Clone)]
pub struct PermissionStore {
    store: Arc<dyn KvStore>,
}

fn key(address: &str) -> String {
    format!("permissions_{address}")
}

impl PermissionStore {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    /// `None` means the pair is undecided
    pub fn get(&self, address: &str, origin: &str) -> Result<Option<bool>, StorageError> {
        Ok(self.for_address(address)?.get(origin).copied())
    }

    pub fn is_granted(&self, address: &str, origin: &str) -> Result<bool, StorageError> {
        Ok(self.get(address, origin)? == Some(true))
    }

    pub fn for_address(&self, address: &str) -> Result<BTreeMap<String, bool>, StorageError> {
        Ok(storage::load(self.store.as_ref(), &key(address))?.unwrap_or_default())
    }

    pub fn set(&self, address: &str, origin: &str, granted: bool) -> Result<(), StorageError> {
        let mut records = self.for_address(address)?;
        records.insert(origin.to_string(), granted);
        storage::save(self.store.as_ref(), &key(address), &records)
    }

    pub fn grant(&self, address: &str, origin: &str) -> Result<(), StorageError> {
        self.set(address, origin, true)
    }

    /// Keep the record but mark it denied
    pub fn revoke(&self, address: &str, origin: &str) -> Result<(), StorageError> {
        if self.get(address, origin)?.is_some() {
            self.set(address, origin, false)?;
        }
        Ok(())
    }

    /// Drop the record entirely, returning the pair to undecided
    pub fn remove(&self, address: &str, origin: &str) -> Result<(), StorageError> {
        let mut records = self.for_address(address)?;
        if records.remove(origin).is_none() {
            return Ok(());
        }
        if records.is_empty() {
            self.store.remove(&key(address))
        } else {
            storage::save(self.store.as_ref(), &key(address), &records)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use serde_json::json;

    const DAPP: &str = "https://dapp.example";

    fn permissions() -> (Arc<MemoryStore>, PermissionStore) {
        let store = Arc::new(MemoryStore::new());
        (store.clone(), PermissionStore::new(store))
    }

    #[test]
    fn test_absent_record_is_undecided() {
        let (_, permissions) = permissions();
        assert_eq!(permissions.get("5Gw3", DAPP).unwrap(), None);
        assert!(!permissions.is_granted("5Gw3", DAPP).unwrap());
    }

    #[test]
    fn test_grant_persists_under_address_key() {
        let (store, permissions) = permissions();
        permissions.grant("5Gw3", DAPP).unwrap();
        assert!(permissions.is_granted("5Gw3", DAPP).unwrap());
        assert!(!permissions.is_granted("5Gw3", "https://other.example").unwrap());
        assert_eq!(store.get("permissions_5Gw3").unwrap(), Some(json!({ DAPP: true })));
    }

    #[test]
    fn test_revoke_is_visible_immediately() {
        let (_, permissions) = permissions();
        permissions.grant("5Gw3", DAPP).unwrap();
        permissions.revoke("5Gw3", DAPP).unwrap();
        assert_eq!(permissions.get("5Gw3", DAPP).unwrap(), Some(false));

        permissions.grant("5Gw3", DAPP).unwrap();
        permissions.remove("5Gw3", DAPP).unwrap();
        assert_eq!(permissions.get("5Gw3", DAPP).unwrap(), None);
    }

    #[test]
    fn test_revoke_never_creates_records() {
        let (store, permissions) = permissions();
        permissions.revoke("5Gw3", DAPP).unwrap();
        assert_eq!(store.get("permissions_5Gw3").unwrap(), None);
    }
}
