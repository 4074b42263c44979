// src/drafts.rs
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;

use crate::storage::{self, KvStore, StorageError};

/// Half-finished wallet UI flows, parked when a `SessionLocked` arrives and
/// picked up again after unlock.
#[derive(Clone)]
pub struct DraftStore {
    store: Arc<dyn KvStore>,
}

fn key(flow: &str) -> String {
    format!("draft_{flow}")
}

impl DraftStore {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    pub fn save<T: Serialize>(&self, flow: &str, draft: &T) -> Result<(), StorageError> {
        log::debug!("📝 Drafts: saved {}", flow);
        storage::save(self.store.as_ref(), &key(flow), draft)
    }

    /// Read and delete in one step so a draft resumes at most once
    pub fn take<T: DeserializeOwned>(&self, flow: &str) -> Result<Option<T>, StorageError> {
        let draft = storage::load(self.store.as_ref(), &key(flow))?;
        if draft.is_some() {
            self.store.remove(&key(flow))?;
        }
        Ok(draft)
    }

    pub fn discard(&self, flow: &str) -> Result<(), StorageError> {
        self.store.remove(&key(flow))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct SendForm {
        recipient: String,
        amount: String,
    }

    #[test]
    fn test_take_consumes_draft() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let drafts = DraftStore::new(store.clone());
        let form = SendForm {
            recipient: "5Gw3".into(),
            amount: "1.5".into(),
        };
        drafts.save("send", &form).unwrap();
        assert!(store.get("draft_send").unwrap().is_some());

        assert_eq!(drafts.take::<SendForm>("send").unwrap(), Some(form));
        assert_eq!(drafts.take::<SendForm>("send").unwrap(), None);
    }

    #[test]
    fn test_discard() {
        let drafts = DraftStore::new(Arc::new(MemoryStore::new()));
        drafts.save("send", &"partial").unwrap();
        drafts.discard("send").unwrap();
        assert_eq!(drafts.take::<String>("send").unwrap(), None);
    }
}
