use async_trait::async_trait;

use crate::bridge::ledger::{Handoff, PendingRequest, RequestKind};
use crate::bridge::router::{Completion, RouterHandle};
use crate::error::{BridgeError, ErrorKind};

/// The transient UI process that collects consent.
///
/// The router calls `open` whenever a request takes the active slot while
/// unlocked, and `close` once the slot is empty or the wallet locks. A request
/// held by a lock is opened again after unlock. Implementations must not wait on the
/// router from inside these calls; the surface talks back through an
/// [`ApprovalClient`].
#[async_trait]
pub trait ApprovalSurface: Send + Sync {
    async fn open(&self, handoff: &Handoff) -> Result<(), BridgeError>;
    async fn close(&self);
}

/// The surface side of the two approval contracts: read the request, emit the decision
#[derive(Clone)]
pub struct ApprovalClient {
    router: RouterHandle,
}

impl ApprovalClient {
    pub fn new(router: RouterHandle) -> Self {
        Self { router }
    }

    /// Read the request the surface was opened for
    pub async fn read(&self, handoff: &Handoff) -> Result<PendingRequest, BridgeError> {
        match self.router.active_request().await? {
            Some(active) if active.request_id == handoff.request_id => Ok(active),
            _ => Err(BridgeError::with_details(
                ErrorKind::RequestExpired,
                format!("request {} is no longer active", handoff.request_id),
            )),
        }
    }

    /// Approve a connect for `addresses`, verifying the password of the first one
    pub async fn approve_connect(
        &self,
        request: &PendingRequest,
        addresses: Vec<String>,
        password: &str,
    ) -> Result<Completion, BridgeError> {
        if let Some(address) = addresses.first() {
            self.router
                .authenticate(address, &request.origin, password)
                .await?;
        }
        self.router
            .complete_connect(&request.request_id, addresses)
            .await
    }

    /// A wrong password leaves the request active so the surface can show the error
    pub async fn approve_sign(
        &self,
        request: &PendingRequest,
        password: &str,
    ) -> Result<Completion, BridgeError> {
        self.router.approve_sign(&request.request_id, password).await
    }

    pub async fn reject(&self, request: &PendingRequest) -> Result<Completion, BridgeError> {
        self.router.reject(&request.request_id).await
    }

    /// Window went away without a decision
    pub async fn dismissed(&self) -> Result<(), BridgeError> {
        self.router.surface_closed().await
    }
}

/// Short human-readable summary of what is being approved
pub fn describe(request: &PendingRequest) -> String {
    match (request.kind, &request.sign) {
        (RequestKind::Connect, _) => format!("{} wants to connect", request.origin),
        (RequestKind::Sign, Some(sign)) => {
            format!("{} wants {} to sign request #{}", request.origin, sign.address, sign.id)
        }
        (RequestKind::Sign, None) => format!("{} wants a signature", request.origin),
    }
}
