use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::bridge::protocol::{LockReason, SessionLocked};
use crate::storage::{self, KvStore, StorageError};

const LOCKED_KEY: &str = "walletLocked";
const LAST_ACTIVITY_KEY: &str = "lastActivityAt";
const REASON_KEY: &str = "lockReason";

#[derive(Debug, Clone, PartialEq)]
pub struct SessionState {
    pub locked: bool,
    pub last_activity_at: DateTime<Utc>,
    pub reason: Option<LockReason>,
}

/// Process-wide lock state, persisted so it survives coordinator restarts.
///
/// A wallet with no persisted state starts locked.
pub struct SessionManager {
    store: Arc<dyn KvStore>,
    inactivity_timeout: Option<Duration>,
    events: broadcast::Sender<SessionLocked>,
}

impl SessionManager {
    pub fn new(store: Arc<dyn KvStore>, inactivity_timeout: Option<Duration>) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            store,
            inactivity_timeout,
            events,
        }
    }

    pub fn state(&self) -> Result<SessionState, StorageError> {
        let store = self.store.as_ref();
        Ok(SessionState {
            locked: storage::load(store, LOCKED_KEY)?.unwrap_or(true),
            last_activity_at: storage::load(store, LAST_ACTIVITY_KEY)?.unwrap_or_else(Utc::now),
            reason: storage::load(store, REASON_KEY)?,
        })
    }

    pub fn is_locked(&self) -> Result<bool, StorageError> {
        Ok(self.state()?.locked)
    }

    /// Wallet UI surfaces listen here for lock broadcasts
    pub fn subscribe(&self) -> broadcast::Receiver<SessionLocked> {
        self.events.subscribe()
    }

    /// Enter `Locked`. Returns the broadcast event, or `None` if already locked.
    pub fn lock(&self, reason: LockReason) -> Result<Option<SessionLocked>, StorageError> {
        if self.is_locked()? {
            return Ok(None);
        }
        storage::save(self.store.as_ref(), LOCKED_KEY, &true)?;
        storage::save(self.store.as_ref(), REASON_KEY, &reason)?;

        let event = SessionLocked { reason };
        log::info!("🔒 Session: locked ({:?})", reason);
        self.announce(event);
        Ok(Some(event))
    }

    /// Re-send a lock event to wallet UI surfaces
    pub fn announce(&self, event: SessionLocked) {
        // no receivers is fine
        let _ = self.events.send(event);
    }

    /// Enter `Unlocked`; the caller has already verified the password.
    pub fn unlock(&self, now: DateTime<Utc>) -> Result<(), StorageError> {
        storage::save(self.store.as_ref(), LOCKED_KEY, &false)?;
        self.store.remove(REASON_KEY)?;
        storage::save(self.store.as_ref(), LAST_ACTIVITY_KEY, &now)?;
        log::info!("🔓 Session: unlocked");
        Ok(())
    }

    /// Reset the inactivity timer after a successful protocol action
    pub fn touch(&self, now: DateTime<Utc>) -> Result<(), StorageError> {
        if self.is_locked()? {
            return Ok(());
        }
        storage::save(self.store.as_ref(), LAST_ACTIVITY_KEY, &now)
    }

    /// Lock if the inactivity timeout has elapsed
    pub fn check_timeout(&self, now: DateTime<Utc>) -> Result<Option<SessionLocked>, StorageError> {
        let Some(timeout) = self.inactivity_timeout else {
            return Ok(None);
        };
        let state = self.state()?;
        if state.locked {
            return Ok(None);
        }
        let idle = (now - state.last_activity_at).to_std().unwrap_or_default();
        if idle >= timeout {
            self.lock(LockReason::Timeout)
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn manager(timeout_secs: u64) -> SessionManager {
        SessionManager::new(
            Arc::new(MemoryStore::new()),
            Some(Duration::from_secs(timeout_secs)),
        )
    }

    #[test]
    fn test_fresh_session_is_locked() {
        assert!(manager(60).is_locked().unwrap());
    }

    #[test]
    fn test_manual_lock_broadcasts_once() {
        let session = manager(60);
        let mut events = session.subscribe();
        session.unlock(Utc::now()).unwrap();

        let event = session.lock(LockReason::Manual).unwrap();
        assert_eq!(event, Some(SessionLocked { reason: LockReason::Manual }));
        assert_eq!(session.lock(LockReason::Manual).unwrap(), None);

        assert_eq!(events.try_recv().unwrap().reason, LockReason::Manual);
        assert!(events.try_recv().is_err());
        assert_eq!(session.state().unwrap().reason, Some(LockReason::Manual));
    }

    #[test]
    fn test_inactivity_timeout() {
        let session = manager(60);
        let start = Utc::now();
        session.unlock(start).unwrap();

        let almost = start + chrono::Duration::seconds(59);
        assert_eq!(session.check_timeout(almost).unwrap(), None);

        let later = start + chrono::Duration::seconds(61);
        assert_eq!(
            session.check_timeout(later).unwrap(),
            Some(SessionLocked { reason: LockReason::Timeout })
        );
        assert!(session.is_locked().unwrap());
    }

    #[test]
    fn test_touch_resets_timer_only_when_unlocked() {
        let session = manager(60);
        let start = Utc::now();
        session.unlock(start).unwrap();

        let mid = start + chrono::Duration::seconds(50);
        session.touch(mid).unwrap();
        assert_eq!(session.check_timeout(start + chrono::Duration::seconds(100)).unwrap(), None);

        session.lock(LockReason::Manual).unwrap();
        session.touch(start + chrono::Duration::seconds(200)).unwrap();
        assert_eq!(session.state().unwrap().last_activity_at, mid);
    }

    #[test]
    fn test_disabled_timeout_never_locks() {
        let session = SessionManager::new(Arc::new(MemoryStore::new()), None);
        session.unlock(Utc::now()).unwrap();
        let far = Utc::now() + chrono::Duration::days(30);
        assert_eq!(session.check_timeout(far).unwrap(), None);
    }

    #[test]
    fn test_state_survives_new_manager() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        SessionManager::new(store.clone(), None).unlock(Utc::now()).unwrap();
        assert!(!SessionManager::new(store, None).is_locked().unwrap());
    }
}
