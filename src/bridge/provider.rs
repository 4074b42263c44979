use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, watch};

use crate::bridge::protocol::{
    encode_hex, ConnectRequest, ConnectResponse, InboundMessage, OutboundMessage, SignData,
    SignRequest, SignResponse,
};
use crate::bridge::relay::{ContentRelay, RelayEvents};
use crate::error::{BridgeReply, ErrorKind};
use crate::wallet::Account;

type ConnectWaiter = oneshot::Sender<Result<ConnectResponse, ErrorKind>>;

#[derive(Default)]
struct Listeners {
    /// Callers of the one connect in flight; `enable` during it joins instead of sending
    connect: Option<Vec<ConnectWaiter>>,
    sign: HashMap<u64, oneshot::Sender<SignResponse>>,
}

struct Shared {
    relay: ContentRelay,
    listeners: Mutex<Listeners>,
    next_id: AtomicU64,
}

impl Shared {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn send(&self, message: InboundMessage) -> Result<(), ErrorKind> {
        let raw = serde_json::to_value(&message).map_err(|_| ErrorKind::InvalidMessage)?;
        let reply = self.relay.forward(raw).await;
        rejection(&reply).map_or(Ok(()), Err)
    }
}

fn rejection(reply: &BridgeReply) -> Option<ErrorKind> {
    (!reply.success).then(|| reply.error_kind().unwrap_or(ErrorKind::UnknownError))
}

/// Capability object handed to the embedding page.
///
/// Every call is a round trip correlated by a locally generated id; a
/// listener is registered before the request leaves and is removed on its
/// first match.
#[derive(Clone)]
pub struct Provider {
    shared: Arc<Shared>,
}

impl Provider {
    pub fn new(relay: ContentRelay, events: RelayEvents) -> Self {
        let shared = Arc::new(Shared {
            relay,
            listeners: Mutex::new(Listeners::default()),
            next_id: AtomicU64::new(1),
        });
        tokio::spawn(dispatch(shared.clone(), events));
        Self { shared }
    }

    /// Ask for access. Resolves once the user decides, which may be after an unlock.
    ///
    /// Concurrent calls share a single connect request and its answer.
    pub async fn enable(&self) -> Result<Injected, ErrorKind> {
        let (tx, rx) = oneshot::channel();
        let first = {
            let mut listeners = self.shared.listeners.lock();
            match listeners.connect.as_mut() {
                Some(waiters) => {
                    waiters.push(tx);
                    false
                }
                None => {
                    listeners.connect = Some(vec![tx]);
                    true
                }
            }
        };

        if first {
            let message = InboundMessage::ConnectRequest(ConnectRequest {
                origin: self.shared.relay.origin().to_string(),
            });
            if let Err(kind) = self.shared.send(message).await {
                let waiters = self.shared.listeners.lock().connect.take();
                for waiter in waiters.into_iter().flatten() {
                    let _ = waiter.send(Err(kind));
                }
            }
        }

        let response = rx.await.map_err(|_| ErrorKind::UnknownError)??;
        if !response.approved || response.accounts.is_empty() {
            return Err(ErrorKind::ConnectionRejected);
        }
        Ok(Injected {
            accounts: Accounts::new(response.accounts),
            signer: Signer {
                shared: self.shared.clone(),
            },
        })
    }

    /// Calls still waiting for a response
    pub fn outstanding(&self) -> usize {
        let listeners = self.shared.listeners.lock();
        listeners.connect.as_ref().map_or(0, Vec::len) + listeners.sign.len()
    }
}

async fn dispatch(shared: Arc<Shared>, mut events: RelayEvents) {
    while let Some(message) = events.next().await {
        match message {
            OutboundMessage::ConnectResponse(response) => {
                let waiters = shared.listeners.lock().connect.take();
                match waiters {
                    Some(waiters) => {
                        for tx in waiters {
                            let _ = tx.send(Ok(response.clone()));
                        }
                    }
                    None => log::debug!("🧩 Provider: connect response with no caller"),
                }
            }
            OutboundMessage::SignResponse(response) => {
                let listener = shared.listeners.lock().sign.remove(&response.id);
                match listener {
                    Some(tx) => {
                        let _ = tx.send(response);
                    }
                    None => log::debug!("🧩 Provider: stale sign response #{}", response.id),
                }
            }
        }
    }
    // relay gone: pending calls fail instead of hanging
    let mut listeners = shared.listeners.lock();
    listeners.connect = None;
    listeners.sign.clear();
}

/// What `enable` resolves with
#[derive(Clone)]
pub struct Injected {
    pub accounts: Accounts,
    pub signer: Signer,
}

/// Accounts the user shared with this page
#[derive(Clone)]
pub struct Accounts {
    list: Arc<watch::Sender<Vec<Account>>>,
}

impl Accounts {
    fn new(accounts: Vec<Account>) -> Self {
        let (tx, _) = watch::channel(accounts);
        Self { list: Arc::new(tx) }
    }

    pub fn get(&self) -> Vec<Account> {
        self.list.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<Account>> {
        self.list.subscribe()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignResult {
    pub id: u64,
    /// `0x`-prefixed hex
    pub signature: String,
}

#[derive(Clone)]
pub struct Signer {
    shared: Arc<Shared>,
}

impl Signer {
    pub async fn sign_payload(&self, address: &str, payload: Value) -> Result<SignResult, ErrorKind> {
        self.request(address, SignData::Payload { payload }).await
    }

    pub async fn sign_raw(&self, address: &str, data: &[u8]) -> Result<SignResult, ErrorKind> {
        self.request(
            address,
            SignData::Bytes {
                data: encode_hex(data),
            },
        )
        .await
    }

    async fn request(&self, address: &str, data: SignData) -> Result<SignResult, ErrorKind> {
        let id = self.shared.next_id();
        let (tx, rx) = oneshot::channel();
        self.shared.listeners.lock().sign.insert(id, tx);

        let message = InboundMessage::SignRequest(SignRequest {
            id,
            address: address.to_string(),
            origin: self.shared.relay.origin().to_string(),
            data,
        });
        if let Err(kind) = self.shared.send(message).await {
            self.shared.listeners.lock().sign.remove(&id);
            return Err(kind);
        }

        let response = rx.await.map_err(|_| ErrorKind::UnknownError)?;
        match response.signature {
            Some(signature) if response.approved != Some(false) => Ok(SignResult { id, signature }),
            _ => Err(ErrorKind::SigningFailed),
        }
    }
}
