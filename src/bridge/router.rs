use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::MissedTickBehavior;

use crate::bridge::approval::ApprovalSurface;
use crate::bridge::ledger::{
    Admission, DeferredRequest, Handoff, PendingLedger, PendingRequest, Removal, RequestKind,
};
use crate::bridge::permissions::PermissionStore;
use crate::bridge::protocol::{
    encode_hex, new_request_id, normalize_origin, ConnectResponse, Delivery, InboundMessage,
    InternalMessage, LockReason, Message, OutboundMessage, RequestId, SessionLocked, SignResponse,
    TabId,
};
use crate::bridge::session::SessionManager;
use crate::config::BridgeConfig;
use crate::error::{BridgeError, BridgeReply, ErrorKind};
use crate::keyring::{Keyring, KeyringError};
use crate::storage::KvStore;
use crate::wallet::Account;

/// Immediate answer to an accepted inbound request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ack {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,
    pub status: AckStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    /// Shown on the Approval Surface now
    Pending,
    /// Waiting behind the active request
    Queued,
    /// Parked until the session is unlocked
    Deferred,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Completion {
    Delivered,
    /// The ledger entry was already consumed; nothing was sent
    AlreadyHandled,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SignOutcome {
    Signed(Vec<u8>),
    Rejected,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    pub locked: bool,
    pub lock_reason: Option<LockReason>,
    pub active: Option<Handoff>,
    pub queued: usize,
    pub deferred: usize,
    pub tabs: usize,
}

type Reply<T> = oneshot::Sender<Result<T, BridgeError>>;

enum Command {
    Inbound {
        raw: Value,
        origin: String,
        tab_id: TabId,
        reply: oneshot::Sender<BridgeReply>,
    },
    AttachTab {
        tab_id: TabId,
        origin: String,
        sender: mpsc::UnboundedSender<Delivery>,
        reply: Reply<()>,
    },
    DetachTab {
        tab_id: TabId,
        reply: Reply<()>,
    },
    ActiveRequest {
        reply: Reply<Option<PendingRequest>>,
    },
    Authenticate {
        address: String,
        origin: String,
        password: String,
        reply: Reply<()>,
    },
    CompleteConnect {
        request_id: RequestId,
        addresses: Vec<String>,
        reply: Reply<Completion>,
    },
    CompleteSign {
        request_id: RequestId,
        outcome: SignOutcome,
        reply: Reply<Completion>,
    },
    ApproveSign {
        request_id: RequestId,
        password: String,
        reply: Reply<Completion>,
    },
    Reject {
        request_id: RequestId,
        reply: Reply<Completion>,
    },
    Cancel {
        request_id: RequestId,
        reply: Reply<Completion>,
    },
    SurfaceClosed {
        reply: Reply<()>,
    },
    Unlock {
        address: String,
        password: String,
        reply: Reply<usize>,
    },
    Lock {
        reply: Reply<()>,
    },
    Revoke {
        address: String,
        origin: String,
        forget: bool,
        reply: Reply<()>,
    },
    Permissions {
        address: String,
        reply: Reply<BTreeMap<String, bool>>,
    },
    Status {
        reply: Reply<Status>,
    },
    SubscribeLocks {
        reply: oneshot::Sender<broadcast::Receiver<SessionLocked>>,
    },
}

struct TabPort {
    origin: String,
    sender: mpsc::UnboundedSender<Delivery>,
}

/// Background coordinator: sole owner of the ledger, the permission store and
/// the session. Runs as one task; everything else talks to it through a
/// [`RouterHandle`].
pub struct Router {
    permissions: PermissionStore,
    ledger: PendingLedger,
    session: SessionManager,
    keyring: Arc<dyn Keyring>,
    surface: Arc<dyn ApprovalSurface>,
    tabs: HashMap<TabId, TabPort>,
    surface_open: bool,
    approval_timeout: Option<Duration>,
}

impl Router {
    pub fn new(
        config: &BridgeConfig,
        store: Arc<dyn KvStore>,
        keyring: Arc<dyn Keyring>,
        surface: Arc<dyn ApprovalSurface>,
    ) -> Self {
        Self {
            permissions: PermissionStore::new(store.clone()),
            ledger: PendingLedger::new(store.clone(), config.queue_capacity),
            session: SessionManager::new(store, config.inactivity_timeout),
            keyring,
            surface,
            tabs: HashMap::new(),
            surface_open: false,
            approval_timeout: config.approval_timeout,
        }
    }

    /// Start the coordinator task
    pub fn spawn(
        config: &BridgeConfig,
        store: Arc<dyn KvStore>,
        keyring: Arc<dyn Keyring>,
        surface: Arc<dyn ApprovalSurface>,
    ) -> RouterHandle {
        let (tx, rx) = mpsc::channel(64);
        let router = Self::new(config, store, keyring, surface);
        // tokio's interval panics on a zero period
        let tick = config.tick_interval.max(Duration::from_millis(1));
        tokio::spawn(router.run(rx, tick));
        RouterHandle { tx }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Command>, tick_interval: Duration) {
        self.resume().await;

        let mut ticker = tokio::time::interval(tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                command = rx.recv() => match command {
                    Some(command) => self.dispatch(command).await,
                    None => break,
                },
                _ = ticker.tick() => {
                    if let Err(e) = self.on_tick(Utc::now()).await {
                        log::error!("❌ Router: tick failed: {}", e);
                    }
                }
            }
        }
        log::info!("👋 Router: all handles dropped, stopping");
    }

    async fn dispatch(&mut self, command: Command) {
        let now = Utc::now();
        match command {
            Command::Inbound {
                raw,
                origin,
                tab_id,
                reply,
            } => {
                let result = self.handle_inbound(&raw, &origin, tab_id, now).await;
                if let Err(e) = &result {
                    log::warn!("⚠️  Router: inbound from {} ({}) refused: {}", origin, tab_id, e);
                }
                let _ = reply.send(result.into());
            }
            Command::AttachTab {
                tab_id,
                origin,
                sender,
                reply,
            } => {
                let _ = reply.send(self.attach_tab(tab_id, &origin, sender));
            }
            Command::DetachTab { tab_id, reply } => {
                let _ = reply.send(self.detach_tab(tab_id, now).await);
            }
            Command::ActiveRequest { reply } => {
                let _ = reply.send(self.ledger.active());
            }
            Command::Authenticate {
                address,
                origin,
                password,
                reply,
            } => {
                let _ = reply.send(self.authenticate(&address, &origin, &password).await);
            }
            Command::CompleteConnect {
                request_id,
                addresses,
                reply,
            } => {
                let _ = reply.send(self.complete_connect(&request_id, addresses, now).await);
            }
            Command::CompleteSign {
                request_id,
                outcome,
                reply,
            } => {
                let _ = reply.send(self.complete_sign(&request_id, outcome, now).await);
            }
            Command::ApproveSign {
                request_id,
                password,
                reply,
            } => {
                let _ = reply.send(self.approve_sign(&request_id, &password, now).await);
            }
            Command::Reject { request_id, reply } => {
                let _ = reply.send(self.reject(&request_id, now).await);
            }
            Command::Cancel { request_id, reply } => {
                let _ = reply.send(self.cancel(&request_id, now).await);
            }
            Command::SurfaceClosed { reply } => {
                let _ = reply.send(self.surface_closed(now).await);
            }
            Command::Unlock {
                address,
                password,
                reply,
            } => {
                let _ = reply.send(self.unlock(&address, &password, now).await);
            }
            Command::Lock { reply } => {
                let _ = reply.send(self.lock().await);
            }
            Command::Revoke {
                address,
                origin,
                forget,
                reply,
            } => {
                let _ = reply.send(self.revoke(&address, &origin, forget));
            }
            Command::Permissions { address, reply } => {
                let _ = reply.send(self.permissions.for_address(&address).map_err(Into::into));
            }
            Command::Status { reply } => {
                let _ = reply.send(self.status());
            }
            Command::SubscribeLocks { reply } => {
                let _ = reply.send(self.session.subscribe());
            }
        }
    }

    /// Re-open the surface for a request that was active before a restart
    async fn resume(&mut self) {
        match self.ledger.handoff() {
            Ok(Some(handoff)) => {
                log::info!("🔁 Router: resuming active request {}", handoff.request_id);
                self.show(Some(handoff), Utc::now()).await;
            }
            Ok(None) => {}
            Err(e) => log::error!("❌ Router: failed to read ledger on start: {}", e),
        }
    }

    async fn on_tick(&mut self, now: DateTime<Utc>) -> Result<(), BridgeError> {
        self.enforce_inactivity(now).await?;
        // a held request is not in front of the user, so its clock is stopped
        if self.session.is_locked()? {
            return Ok(());
        }

        if let Some(timeout) = self.approval_timeout {
            if let Some(expired) = self.ledger.expired_active(now, timeout)? {
                log::warn!("⏰ Router: request {} expired without a decision", expired.request_id);
                self.cancel(&expired.request_id, now).await?;
            }
        }
        Ok(())
    }

    async fn enforce_inactivity(&mut self, now: DateTime<Utc>) -> Result<(), BridgeError> {
        if let Some(event) = self.session.check_timeout(now)? {
            self.on_locked(event).await;
        }
        Ok(())
    }

    async fn on_locked(&mut self, event: SessionLocked) {
        self.broadcast(event);
        if self.surface_open {
            log::info!("🔒 Router: wallet locked, holding the active request");
            self.surface.close().await;
            self.surface_open = false;
        }
    }

    async fn handle_inbound(
        &mut self,
        raw: &Value,
        source_origin: &str,
        source_tab_id: TabId,
        now: DateTime<Utc>,
    ) -> Result<Ack, BridgeError> {
        let message = InboundMessage::parse(raw)?;
        let origin = normalize_origin(source_origin)?;
        let claimed = normalize_origin(message.origin())?;
        if claimed != origin {
            return Err(BridgeError::invalid_message(format!(
                "payload origin {claimed} does not match {origin}"
            )));
        }

        self.enforce_inactivity(now).await?;
        self.accept(message, origin, source_tab_id, now).await
    }

    async fn accept(
        &mut self,
        message: InboundMessage,
        origin: String,
        source_tab_id: TabId,
        now: DateTime<Utc>,
    ) -> Result<Ack, BridgeError> {
        if let InboundMessage::SignRequest(req) = &message {
            if !self.permissions.is_granted(&req.address, &origin)? {
                log::warn!("🚫 Router: {} has no grant for {}", origin, req.address);
                return Err(BridgeError::with_details(
                    ErrorKind::PermissionDenied,
                    format!("{origin} is not connected to {}", req.address),
                ));
            }
        }

        if self.session.is_locked()? {
            let parked = self.ledger.defer(DeferredRequest {
                message,
                origin: origin.clone(),
                source_tab_id,
                deferred_at: now,
            })?;
            let reason = self.session.state()?.reason.unwrap_or(LockReason::Manual);
            log::info!("🔒 Router: wallet locked, deferred request from {} ({} parked)", origin, parked);
            let event = SessionLocked { reason };
            self.session.announce(event);
            self.broadcast(event);
            return Ok(Ack {
                request_id: None,
                status: AckStatus::Deferred,
            });
        }

        let (kind, sign) = match message {
            InboundMessage::ConnectRequest(_) => {
                log::info!("🔗 Router: connect request from {}", origin);
                (RequestKind::Connect, None)
            }
            InboundMessage::SignRequest(req) => {
                log::info!("✍️  Router: sign request #{} from {} for {}", req.id, origin, req.address);
                (RequestKind::Sign, Some(req))
            }
        };
        let request_id = new_request_id();
        let request = PendingRequest {
            request_id: request_id.clone(),
            origin,
            kind,
            source_tab_id,
            created_at: now,
            activated_at: None,
            sign,
        };

        match self.ledger.admit(request, now)? {
            Admission::Active(handoff) => {
                if let Err(e) = self.open_surface(&handoff).await {
                    // nobody can decide it, so it must not stay in the ledger
                    self.ledger.remove(&request_id, now)?;
                    return Err(e);
                }
                Ok(Ack {
                    request_id: Some(request_id),
                    status: AckStatus::Pending,
                })
            }
            Admission::Queued(position) => {
                log::info!("📥 Router: request {} queued at position {}", request_id, position);
                Ok(Ack {
                    request_id: Some(request_id),
                    status: AckStatus::Queued,
                })
            }
        }
    }

    async fn open_surface(&mut self, handoff: &Handoff) -> Result<(), BridgeError> {
        self.surface.open(handoff).await?;
        self.surface_open = true;
        Ok(())
    }

    /// Point the surface at the next active request, cancelling any that cannot be shown.
    /// While locked the request keeps its slot and the surface stays closed.
    async fn show(&mut self, mut next: Option<Handoff>, now: DateTime<Utc>) {
        let locked = self.session.is_locked().unwrap_or_else(|e| {
            log::error!("❌ Router: cannot read session state: {}", e);
            true
        });
        if locked {
            if let Some(handoff) = next.take() {
                log::info!("🔒 Router: request {} waits for unlock", handoff.request_id);
            }
        }
        while let Some(handoff) = next.take() {
            match self.open_surface(&handoff).await {
                Ok(()) => return,
                Err(e) => {
                    log::error!("❌ Router: cannot open approval surface: {}", e);
                    match self.ledger.remove(&handoff.request_id, now) {
                        Ok(Some(removal)) => {
                            self.notify_cancelled(&removal.request);
                            next = removal.next;
                        }
                        Ok(None) => {}
                        Err(e) => log::error!("❌ Router: ledger update failed: {}", e),
                    }
                }
            }
        }
        if self.surface_open {
            self.surface.close().await;
            self.surface_open = false;
        }
    }

    async fn after_removal(&mut self, removal: &Removal, now: DateTime<Utc>) {
        if removal.was_active {
            self.show(removal.next.clone(), now).await;
        }
    }

    fn attach_tab(
        &mut self,
        tab_id: TabId,
        origin: &str,
        sender: mpsc::UnboundedSender<Delivery>,
    ) -> Result<(), BridgeError> {
        let origin = normalize_origin(origin)?;
        log::info!("🔌 Router: {} attached for {}", tab_id, origin);
        if self.tabs.insert(tab_id, TabPort { origin, sender }).is_some() {
            log::warn!("⚠️  Router: {} re-attached, previous relay replaced", tab_id);
        }
        Ok(())
    }

    async fn detach_tab(&mut self, tab_id: TabId, now: DateTime<Utc>) -> Result<(), BridgeError> {
        self.tabs.remove(&tab_id);
        let (removals, dropped) = self.ledger.drop_tab(tab_id, now)?;
        if !removals.is_empty() || !dropped.is_empty() {
            log::info!(
                "🧹 Router: {} detached, dropped {} pending and {} deferred requests",
                tab_id,
                removals.len(),
                dropped.len()
            );
        }
        for removal in &removals {
            self.after_removal(removal, now).await;
        }
        Ok(())
    }

    fn deliver(&mut self, tab_id: TabId, origin: &str, message: OutboundMessage) {
        let Some(port) = self.tabs.get(&tab_id) else {
            log::warn!("⚠️  Router: {} is gone, dropping response", tab_id);
            return;
        };
        if port.origin != origin {
            log::error!("❌ Router: {} now hosts {}, not {}; dropping response", tab_id, port.origin, origin);
            return;
        }
        if port.sender.send(Delivery::to_tab(tab_id, origin, message)).is_err() {
            log::warn!("⚠️  Router: relay for {} closed", tab_id);
            self.tabs.remove(&tab_id);
        }
    }

    fn broadcast(&mut self, event: SessionLocked) {
        let message = Message::from(InternalMessage::SessionLocked(event));
        self.tabs
            .retain(|_, port| port.sender.send(Delivery::broadcast(message.clone())).is_ok());
    }

    /// Negative response for a request that will never be decided
    fn notify_cancelled(&mut self, request: &PendingRequest) {
        let message = match (&request.kind, &request.sign) {
            (RequestKind::Sign, Some(sign)) => OutboundMessage::SignResponse(SignResponse {
                id: sign.id,
                signature: None,
                approved: Some(false),
            }),
            _ => OutboundMessage::ConnectResponse(ConnectResponse {
                approved: false,
                accounts: Vec::new(),
            }),
        };
        self.deliver(request.source_tab_id, &request.origin, message);
    }

    fn pending(&self, request_id: &str, kind: RequestKind) -> Result<Option<PendingRequest>, BridgeError> {
        match self.ledger.get(request_id)? {
            Some(request) if request.kind != kind => Err(BridgeError::invalid_message(format!(
                "request {request_id} is a {:?} request",
                request.kind
            ))),
            Some(request) => Ok(Some(request)),
            None => {
                log::info!("ℹ️ Router: request {} already handled", request_id);
                Ok(None)
            }
        }
    }

    async fn authenticate(&mut self, address: &str, origin: &str, password: &str) -> Result<(), BridgeError> {
        let origin = normalize_origin(origin)?;
        if self.session.is_locked()? {
            return Err(BridgeError::new(ErrorKind::WalletLocked));
        }
        let active = self.ledger.active()?;
        if !active.is_some_and(|a| a.kind == RequestKind::Connect && a.origin == origin) {
            return Err(BridgeError::with_details(
                ErrorKind::RequestNotFound,
                format!("no connect from {origin} awaiting approval"),
            ));
        }
        self.keyring.unlock(address, password).await?;
        log::info!("🔑 Router: {} authenticated for {}", address, origin);
        Ok(())
    }

    async fn complete_connect(
        &mut self,
        request_id: &str,
        addresses: Vec<String>,
        now: DateTime<Utc>,
    ) -> Result<Completion, BridgeError> {
        let Some(request) = self.pending(request_id, RequestKind::Connect)? else {
            return Ok(Completion::AlreadyHandled);
        };

        let accounts = if addresses.is_empty() {
            Vec::new()
        } else {
            let known = self.keyring.list_accounts().await?;
            resolve_accounts(&known, &addresses)?
        };
        for account in &accounts {
            self.permissions.grant(&account.address, &request.origin)?;
        }

        let Some(removal) = self.ledger.remove(request_id, now)? else {
            return Ok(Completion::AlreadyHandled);
        };
        let approved = !accounts.is_empty();
        log::info!(
            "{} Router: connect from {} {}",
            if approved { "✅" } else { "🙅" },
            request.origin,
            if approved { "approved" } else { "rejected" }
        );
        self.deliver(
            request.source_tab_id,
            &request.origin,
            OutboundMessage::ConnectResponse(ConnectResponse { approved, accounts }),
        );
        if approved {
            self.session.touch(now)?;
        }
        self.after_removal(&removal, now).await;
        Ok(Completion::Delivered)
    }

    async fn complete_sign(
        &mut self,
        request_id: &str,
        outcome: SignOutcome,
        now: DateTime<Utc>,
    ) -> Result<Completion, BridgeError> {
        if self.pending(request_id, RequestKind::Sign)?.is_none() {
            return Ok(Completion::AlreadyHandled);
        }
        let Some(removal) = self.ledger.remove(request_id, now)? else {
            return Ok(Completion::AlreadyHandled);
        };
        let request = &removal.request;
        let Some(sign) = &request.sign else {
            log::error!("❌ Router: sign request {} carried no payload", request_id);
            self.after_removal(&removal, now).await;
            return Err(BridgeError::unknown("sign request without payload"));
        };

        let signed = matches!(outcome, SignOutcome::Signed(_));
        let response = match outcome {
            SignOutcome::Signed(signature) => SignResponse {
                id: sign.id,
                signature: Some(encode_hex(&signature)),
                approved: Some(true),
            },
            SignOutcome::Rejected => SignResponse {
                id: sign.id,
                signature: None,
                approved: Some(false),
            },
            SignOutcome::Failed => SignResponse {
                id: sign.id,
                signature: None,
                approved: None,
            },
        };
        log::info!("📨 Router: sign #{} for {} completed (signed: {})", sign.id, request.origin, signed);
        self.deliver(request.source_tab_id, &request.origin, OutboundMessage::SignResponse(response));
        if signed {
            self.session.touch(now)?;
        }
        self.after_removal(&removal, now).await;
        Ok(Completion::Delivered)
    }

    async fn approve_sign(
        &mut self,
        request_id: &str,
        password: &str,
        now: DateTime<Utc>,
    ) -> Result<Completion, BridgeError> {
        let Some(request) = self.pending(request_id, RequestKind::Sign)? else {
            return Ok(Completion::AlreadyHandled);
        };
        if self.session.is_locked()? {
            return Err(BridgeError::new(ErrorKind::WalletLocked));
        }
        if request.activated_at.is_none() {
            return Err(BridgeError::with_details(
                ErrorKind::RequestNotFound,
                format!("request {request_id} is not awaiting approval"),
            ));
        }
        let Some(sign) = request.sign else {
            self.complete_sign(request_id, SignOutcome::Failed, now).await?;
            return Err(BridgeError::new(ErrorKind::SigningFailed));
        };

        match self.keyring.unlock(&sign.address, password).await {
            Ok(()) => {}
            // surface keeps the request open and shows the error
            Err(KeyringError::InvalidPassword) => return Err(BridgeError::new(ErrorKind::InvalidPassword)),
            Err(e) => {
                self.complete_sign(request_id, SignOutcome::Failed, now).await?;
                return Err(e.into());
            }
        }

        let payload = sign.data.to_bytes()?;
        match self.keyring.sign(&sign.address, &payload).await {
            Ok(signature) if !signature.is_empty() => {
                self.complete_sign(request_id, SignOutcome::Signed(signature), now).await
            }
            Ok(_) => {
                self.complete_sign(request_id, SignOutcome::Failed, now).await?;
                Err(BridgeError::with_details(ErrorKind::SigningFailed, "empty signature"))
            }
            Err(e) => {
                log::error!("❌ Router: keyring failed to sign #{}: {}", sign.id, e);
                self.complete_sign(request_id, SignOutcome::Failed, now).await?;
                Err(BridgeError::with_details(ErrorKind::SigningFailed, e.to_string()))
            }
        }
    }

    async fn reject(&mut self, request_id: &str, now: DateTime<Utc>) -> Result<Completion, BridgeError> {
        match self.ledger.get(request_id)?.map(|r| r.kind) {
            Some(RequestKind::Connect) => self.complete_connect(request_id, Vec::new(), now).await,
            Some(RequestKind::Sign) => self.complete_sign(request_id, SignOutcome::Rejected, now).await,
            None => Ok(Completion::AlreadyHandled),
        }
    }

    async fn cancel(&mut self, request_id: &str, now: DateTime<Utc>) -> Result<Completion, BridgeError> {
        let Some(removal) = self.ledger.remove(request_id, now)? else {
            return Ok(Completion::AlreadyHandled);
        };
        log::info!("🗑️  Router: request {} cancelled", request_id);
        self.notify_cancelled(&removal.request);
        self.after_removal(&removal, now).await;
        Ok(Completion::Delivered)
    }

    async fn surface_closed(&mut self, now: DateTime<Utc>) -> Result<(), BridgeError> {
        self.surface_open = false;
        // closed by the lock, the held request stays
        if self.session.is_locked()? {
            return Ok(());
        }
        if let Some(active) = self.ledger.active()? {
            log::info!("🪟 Router: approval surface closed before deciding {}", active.request_id);
            self.cancel(&active.request_id, now).await?;
        }
        Ok(())
    }

    async fn unlock(&mut self, address: &str, password: &str, now: DateTime<Utc>) -> Result<usize, BridgeError> {
        if !self.session.is_locked()? {
            return Ok(0);
        }
        self.keyring.unlock(address, password).await?;
        self.session.unlock(now)?;

        if let Some(held) = self.ledger.reactivate(now)? {
            self.show(Some(held), now).await;
        }

        let deferred = self.ledger.take_deferred()?;
        let count = deferred.len();
        for parked in deferred {
            let message = parked.message.clone();
            if let Err(e) = self
                .accept(parked.message, parked.origin.clone(), parked.source_tab_id, now)
                .await
            {
                log::warn!("⚠️  Router: replayed request from {} refused: {}", parked.origin, e);
                let response = match message {
                    InboundMessage::ConnectRequest(_) => OutboundMessage::ConnectResponse(ConnectResponse {
                        approved: false,
                        accounts: Vec::new(),
                    }),
                    InboundMessage::SignRequest(req) => OutboundMessage::SignResponse(SignResponse {
                        id: req.id,
                        signature: None,
                        approved: Some(false),
                    }),
                };
                self.deliver(parked.source_tab_id, &parked.origin, response);
            }
        }
        if count > 0 {
            log::info!("🔁 Router: replayed {} deferred requests", count);
        }
        Ok(count)
    }

    async fn lock(&mut self) -> Result<(), BridgeError> {
        if let Some(event) = self.session.lock(LockReason::Manual)? {
            self.on_locked(event).await;
        }
        Ok(())
    }

    fn revoke(&mut self, address: &str, origin: &str, forget: bool) -> Result<(), BridgeError> {
        let origin = normalize_origin(origin)?;
        if forget {
            self.permissions.remove(address, &origin)?;
        } else {
            self.permissions.revoke(address, &origin)?;
        }
        log::info!("🔌 Router: access for {} to {} revoked", origin, address);
        Ok(())
    }

    fn status(&self) -> Result<Status, BridgeError> {
        let session = self.session.state()?;
        Ok(Status {
            locked: session.locked,
            lock_reason: session.reason,
            active: self.ledger.handoff()?,
            queued: self.ledger.queued()?.len(),
            deferred: self.ledger.deferred()?.len(),
            tabs: self.tabs.len(),
        })
    }
}

fn resolve_accounts(known: &[Account], addresses: &[String]) -> Result<Vec<Account>, BridgeError> {
    let mut accounts: Vec<Account> = Vec::new();
    for address in addresses {
        let account = known
            .iter()
            .find(|a| &a.address == address)
            .ok_or_else(|| BridgeError::with_details(ErrorKind::WalletNotFound, address.clone()))?;
        if !accounts.iter().any(|a| a.address == account.address) {
            accounts.push(account.clone());
        }
    }
    Ok(accounts)
}

/// Cloneable client for the coordinator task
#[derive(Clone)]
pub struct RouterHandle {
    tx: mpsc::Sender<Command>,
}

impl RouterHandle {
    async fn call<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> Result<T, BridgeError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(command(reply))
            .await
            .map_err(|_| BridgeError::unknown("router stopped"))?;
        rx.await.map_err(|_| BridgeError::unknown("router dropped the request"))?
    }

    /// Entry point for page traffic; `source_origin` and `source_tab_id` come
    /// from the browsing context, never from the message.
    pub async fn handle_inbound(&self, raw: Value, source_origin: &str, source_tab_id: TabId) -> BridgeReply {
        let (reply, rx) = oneshot::channel();
        let command = Command::Inbound {
            raw,
            origin: source_origin.to_string(),
            tab_id: source_tab_id,
            reply,
        };
        if self.tx.send(command).await.is_err() {
            return BridgeReply::failure(&BridgeError::unknown("router stopped"));
        }
        rx.await
            .unwrap_or_else(|_| BridgeReply::failure(&BridgeError::unknown("router dropped the request")))
    }

    pub async fn attach_tab(
        &self,
        tab_id: TabId,
        origin: &str,
    ) -> Result<mpsc::UnboundedReceiver<Delivery>, BridgeError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.call(|reply| Command::AttachTab {
            tab_id,
            origin: origin.to_string(),
            sender,
            reply,
        })
        .await?;
        Ok(receiver)
    }

    pub async fn detach_tab(&self, tab_id: TabId) -> Result<(), BridgeError> {
        self.call(|reply| Command::DetachTab { tab_id, reply }).await
    }

    pub async fn active_request(&self) -> Result<Option<PendingRequest>, BridgeError> {
        self.call(|reply| Command::ActiveRequest { reply }).await
    }

    pub async fn authenticate(&self, address: &str, origin: &str, password: &str) -> Result<(), BridgeError> {
        self.call(|reply| Command::Authenticate {
            address: address.to_string(),
            origin: origin.to_string(),
            password: password.to_string(),
            reply,
        })
        .await
    }

    pub async fn complete_connect(&self, request_id: &str, addresses: Vec<String>) -> Result<Completion, BridgeError> {
        self.call(|reply| Command::CompleteConnect {
            request_id: request_id.to_string(),
            addresses,
            reply,
        })
        .await
    }

    pub async fn complete_sign(&self, request_id: &str, outcome: SignOutcome) -> Result<Completion, BridgeError> {
        self.call(|reply| Command::CompleteSign {
            request_id: request_id.to_string(),
            outcome,
            reply,
        })
        .await
    }

    pub async fn approve_sign(&self, request_id: &str, password: &str) -> Result<Completion, BridgeError> {
        self.call(|reply| Command::ApproveSign {
            request_id: request_id.to_string(),
            password: password.to_string(),
            reply,
        })
        .await
    }

    pub async fn reject(&self, request_id: &str) -> Result<Completion, BridgeError> {
        self.call(|reply| Command::Reject {
            request_id: request_id.to_string(),
            reply,
        })
        .await
    }

    pub async fn cancel(&self, request_id: &str) -> Result<Completion, BridgeError> {
        self.call(|reply| Command::Cancel {
            request_id: request_id.to_string(),
            reply,
        })
        .await
    }

    pub async fn surface_closed(&self) -> Result<(), BridgeError> {
        self.call(|reply| Command::SurfaceClosed { reply }).await
    }

    /// Returns how many deferred requests were replayed
    pub async fn unlock(&self, address: &str, password: &str) -> Result<usize, BridgeError> {
        self.call(|reply| Command::Unlock {
            address: address.to_string(),
            password: password.to_string(),
            reply,
        })
        .await
    }

    pub async fn lock(&self) -> Result<(), BridgeError> {
        self.call(|reply| Command::Lock { reply }).await
    }

    /// Mark the record denied
    pub async fn revoke(&self, address: &str, origin: &str) -> Result<(), BridgeError> {
        self.call(|reply| Command::Revoke {
            address: address.to_string(),
            origin: origin.to_string(),
            forget: false,
            reply,
        })
        .await
    }

    /// Delete the record, returning the pair to undecided
    pub async fn forget(&self, address: &str, origin: &str) -> Result<(), BridgeError> {
        self.call(|reply| Command::Revoke {
            address: address.to_string(),
            origin: origin.to_string(),
            forget: true,
            reply,
        })
        .await
    }

    pub async fn permissions(&self, address: &str) -> Result<BTreeMap<String, bool>, BridgeError> {
        self.call(|reply| Command::Permissions {
            address: address.to_string(),
            reply,
        })
        .await
    }

    pub async fn status(&self) -> Result<Status, BridgeError> {
        self.call(|reply| Command::Status { reply }).await
    }

    pub async fn subscribe_locks(&self) -> Result<broadcast::Receiver<SessionLocked>, BridgeError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::SubscribeLocks { reply })
            .await
            .map_err(|_| BridgeError::unknown("router stopped"))?;
        rx.await.map_err(|_| BridgeError::unknown("router dropped the request"))
    }
}
