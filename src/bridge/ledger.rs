use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;

use crate::bridge::protocol::{InboundMessage, RequestId, SignRequest, TabId};
use crate::error::{BridgeError, ErrorKind};
use crate::storage::{self, KvStore};

const LEDGER_KEY: &str = "pendingRequest";
const HANDOFF_KEY: &str = "activeHandoff";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestKind {
    Connect,
    Sign,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingRequest {
    pub request_id: RequestId,
    pub origin: String,
    pub kind: RequestKind,
    pub source_tab_id: TabId,
    pub created_at: DateTime<Utc>,
    /// Set when the request takes the active slot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sign: Option<SignRequest>,
}

/// What the Approval Surface needs to find the request it should display
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handoff {
    pub origin: String,
    pub request_id: RequestId,
    pub source_tab_id: TabId,
}

impl From<&PendingRequest> for Handoff {
    fn from(request: &PendingRequest) -> Self {
        Self {
            origin: request.origin.clone(),
            request_id: request.request_id.clone(),
            source_tab_id: request.source_tab_id,
        }
    }
}

/// Request parked while the session is locked, replayed after unlock
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeferredRequest {
    pub message: InboundMessage,
    pub origin: String,
    pub source_tab_id: TabId,
    pub deferred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct LedgerDocument {
    #[serde(default)]
    active: Option<PendingRequest>,
    #[serde(default)]
    queue: VecDeque<PendingRequest>,
    #[serde(default)]
    deferred: Vec<DeferredRequest>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// Took the empty active slot; the surface must be opened
    Active(Handoff),
    /// Waiting behind the active request at this queue position
    Queued(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Removal {
    pub request: PendingRequest,
    pub was_active: bool,
    /// Next request promoted into the active slot
    pub next: Option<Handoff>,
}

/// Durable table of in-flight requests: one active slot and a bounded FIFO.
///
/// Only the router writes it. Every operation is a read-modify-write of the
/// persisted document.
pub struct PendingLedger {
    store: Arc<dyn KvStore>,
    capacity: usize,
}

impl PendingLedger {
    pub fn new(store: Arc<dyn KvStore>, capacity: usize) -> Self {
        Self { store, capacity }
    }

    fn load(&self) -> Result<LedgerDocument, BridgeError> {
        Ok(storage::load(self.store.as_ref(), LEDGER_KEY)?.unwrap_or_default())
    }

    fn save(&self, doc: &LedgerDocument) -> Result<(), BridgeError> {
        storage::save(self.store.as_ref(), LEDGER_KEY, doc)?;
        match &doc.active {
            Some(active) => storage::save(self.store.as_ref(), HANDOFF_KEY, &Handoff::from(active))?,
            None => self.store.remove(HANDOFF_KEY)?,
        }
        Ok(())
    }

    pub fn active(&self) -> Result<Option<PendingRequest>, BridgeError> {
        Ok(self.load()?.active)
    }

    pub fn handoff(&self) -> Result<Option<Handoff>, BridgeError> {
        Ok(storage::load(self.store.as_ref(), HANDOFF_KEY)?)
    }

    pub fn get(&self, request_id: &str) -> Result<Option<PendingRequest>, BridgeError> {
        let doc = self.load()?;
        Ok(doc
            .active
            .into_iter()
            .chain(doc.queue)
            .find(|r| r.request_id == request_id))
    }

    /// Queued requests behind the active one
    pub fn queued(&self) -> Result<Vec<PendingRequest>, BridgeError> {
        Ok(self.load()?.queue.into())
    }

    pub fn admit(
        &self,
        mut request: PendingRequest,
        now: DateTime<Utc>,
    ) -> Result<Admission, BridgeError> {
        let mut doc = self.load()?;
        let admission = if doc.active.is_none() {
            request.activated_at = Some(now);
            let handoff = Handoff::from(&request);
            doc.active = Some(request);
            Admission::Active(handoff)
        } else {
            if doc.queue.len() >= self.capacity {
                return Err(BridgeError::with_details(
                    ErrorKind::QueueFull,
                    format!("{} requests already waiting", doc.queue.len()),
                ));
            }
            doc.queue.push_back(request);
            Admission::Queued(doc.queue.len())
        };
        self.save(&doc)?;
        Ok(admission)
    }

    /// Delete a request; `None` if it was already consumed
    pub fn remove(&self, request_id: &str, now: DateTime<Utc>) -> Result<Option<Removal>, BridgeError> {
        let mut doc = self.load()?;

        let removal = if doc.active.as_ref().is_some_and(|a| a.request_id == request_id) {
            let request = doc.active.take().ok_or_else(|| BridgeError::unknown("active slot vanished"))?;
            let next = promote(&mut doc, now);
            Removal {
                request,
                was_active: true,
                next,
            }
        } else if let Some(pos) = doc.queue.iter().position(|r| r.request_id == request_id) {
            let request = doc
                .queue
                .remove(pos)
                .ok_or_else(|| BridgeError::unknown("queue entry vanished"))?;
            Removal {
                request,
                was_active: false,
                next: None,
            }
        } else {
            return Ok(None);
        };

        self.save(&doc)?;
        Ok(Some(removal))
    }

    /// Remove everything that belongs to a closed tab
    pub fn drop_tab(
        &self,
        tab_id: TabId,
        now: DateTime<Utc>,
    ) -> Result<(Vec<Removal>, Vec<DeferredRequest>), BridgeError> {
        let mut doc = self.load()?;
        let mut removals = Vec::new();

        let (gone, kept): (Vec<_>, Vec<_>) =
            doc.queue.drain(..).partition(|r| r.source_tab_id == tab_id);
        doc.queue = kept.into();
        removals.extend(gone.into_iter().map(|request| Removal {
            request,
            was_active: false,
            next: None,
        }));

        if doc.active.as_ref().is_some_and(|a| a.source_tab_id == tab_id) {
            if let Some(request) = doc.active.take() {
                let next = promote(&mut doc, now);
                removals.push(Removal {
                    request,
                    was_active: true,
                    next,
                });
            }
        }

        let (dropped, deferred): (Vec<_>, Vec<_>) =
            doc.deferred.drain(..).partition(|d| d.source_tab_id == tab_id);
        doc.deferred = deferred;

        if !removals.is_empty() || !dropped.is_empty() {
            self.save(&doc)?;
        }
        Ok((removals, dropped))
    }

    /// The active request, if it has waited longer than `timeout`
    pub fn expired_active(
        &self,
        now: DateTime<Utc>,
        timeout: std::time::Duration,
    ) -> Result<Option<PendingRequest>, BridgeError> {
        Ok(self.active()?.filter(|active| {
            let since = active.activated_at.unwrap_or(active.created_at);
            (now - since).to_std().is_ok_and(|waited| waited >= timeout)
        }))
    }

    /// Park a request until unlock. Bounded by what one replay can admit:
    /// the active slot plus a full queue.
    pub fn defer(&self, deferred: DeferredRequest) -> Result<usize, BridgeError> {
        let mut doc = self.load()?;
        if doc.deferred.len() > self.capacity {
            return Err(BridgeError::with_details(
                ErrorKind::QueueFull,
                format!("{} requests already waiting for unlock", doc.deferred.len()),
            ));
        }
        doc.deferred.push(deferred);
        let count = doc.deferred.len();
        self.save(&doc)?;
        Ok(count)
    }

    /// Restart the approval clock of the active request, which was held back while locked
    pub fn reactivate(&self, now: DateTime<Utc>) -> Result<Option<Handoff>, BridgeError> {
        let mut doc = self.load()?;
        let Some(active) = doc.active.as_mut() else {
            return Ok(None);
        };
        active.activated_at = Some(now);
        let handoff = Handoff::from(&*active);
        self.save(&doc)?;
        Ok(Some(handoff))
    }

    pub fn deferred(&self) -> Result<Vec<DeferredRequest>, BridgeError> {
        Ok(self.load()?.deferred)
    }

    /// Take every deferred request, so each is replayed exactly once
    pub fn take_deferred(&self) -> Result<Vec<DeferredRequest>, BridgeError> {
        let mut doc = self.load()?;
        if doc.deferred.is_empty() {
            return Ok(Vec::new());
        }
        let deferred = std::mem::take(&mut doc.deferred);
        self.save(&doc)?;
        Ok(deferred)
    }
}

fn promote(doc: &mut LedgerDocument, now: DateTime<Utc>) -> Option<Handoff> {
    let mut next = doc.queue.pop_front()?;
    next.activated_at = Some(now);
    let handoff = Handoff::from(&next);
    doc.active = Some(next);
    Some(handoff)
}
