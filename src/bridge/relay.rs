use serde_json::Value;
use tokio::sync::mpsc;

use crate::bridge::protocol::{normalize_origin, Delivery, Message, OutboundMessage, TabId};
use crate::bridge::router::RouterHandle;
use crate::error::{BridgeError, BridgeReply};

/// Per-tab bridge between an untrusted page and the router.
///
/// The origin and tab id are captured when the relay is attached and are
/// attached to every forwarded message; nothing in a message body can change
/// them.
#[derive(Clone)]
pub struct ContentRelay {
    router: RouterHandle,
    tab_id: TabId,
    origin: String,
}

impl ContentRelay {
    pub async fn attach(
        router: RouterHandle,
        tab_id: TabId,
        page_origin: &str,
    ) -> Result<(Self, RelayEvents), BridgeError> {
        let origin = normalize_origin(page_origin)?;
        let receiver = router.attach_tab(tab_id, &origin).await?;
        let events = RelayEvents {
            receiver,
            tab_id,
            origin: origin.clone(),
        };
        Ok((
            Self {
                router,
                tab_id,
                origin,
            },
            events,
        ))
    }

    pub fn tab_id(&self) -> TabId {
        self.tab_id
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Forward a page message verbatim
    pub async fn forward(&self, raw: Value) -> BridgeReply {
        log::debug!("📤 Relay: {} -> router", self.tab_id);
        self.router.handle_inbound(raw, &self.origin, self.tab_id).await
    }

    /// Tab closed or navigated away
    pub async fn detach(&self) -> Result<(), BridgeError> {
        self.router.detach_tab(self.tab_id).await
    }
}

/// Outbound stream for one tab, already filtered
pub struct RelayEvents {
    receiver: mpsc::UnboundedReceiver<Delivery>,
    tab_id: TabId,
    origin: String,
}

impl RelayEvents {
    /// Next message the page may see; `None` once the router is gone
    pub async fn next(&mut self) -> Option<OutboundMessage> {
        while let Some(delivery) = self.receiver.recv().await {
            if let Some(message) = admit(self.tab_id, &self.origin, delivery) {
                return Some(message);
            }
        }
        None
    }
}

/// Only responses addressed to this tab and origin reach the page. Internal
/// kinds are dropped whatever their target.
pub fn admit(tab_id: TabId, origin: &str, delivery: Delivery) -> Option<OutboundMessage> {
    let Message::Outbound(message) = delivery.message else {
        log::debug!("🛡️  Relay: internal message withheld from {}", tab_id);
        return None;
    };
    match delivery.target {
        Some(target) if target.tab_id == tab_id && target.origin == origin => Some(message),
        _ => {
            log::warn!("🛡️  Relay: dropped response not addressed to {}", tab_id);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{
        ConnectResponse, InternalMessage, LockReason, SessionLocked, SignResponse,
    };
    use crate::bridge::router::tests::{connect, unlocked_harness, DAPP, OTHER};
    use crate::error::ErrorKind;
    use serde_json::json;

    const TAB: TabId = TabId(3);

    fn sign_response(id: u64) -> OutboundMessage {
        OutboundMessage::SignResponse(SignResponse {
            id,
            signature: Some("0x01".into()),
            approved: Some(true),
        })
    }

    #[test]
    fn test_admits_only_addressed_outbound() {
        let ours = Delivery::to_tab(TAB, DAPP, sign_response(1));
        assert_eq!(admit(TAB, DAPP, ours), Some(sign_response(1)));

        let other_tab = Delivery::to_tab(TabId(4), DAPP, sign_response(1));
        assert_eq!(admit(TAB, DAPP, other_tab), None);

        let other_origin = Delivery::to_tab(TAB, OTHER, sign_response(1));
        assert_eq!(admit(TAB, DAPP, other_origin), None);

        let untargeted = Delivery::broadcast(OutboundMessage::ConnectResponse(ConnectResponse {
            approved: true,
            accounts: vec![],
        }));
        assert_eq!(admit(TAB, DAPP, untargeted), None);
    }

    #[test]
    fn test_internal_kinds_never_reach_page() {
        let locked = Delivery::broadcast(InternalMessage::SessionLocked(SessionLocked {
            reason: LockReason::Manual,
        }));
        assert_eq!(admit(TAB, DAPP, locked), None);

        let addressed = Delivery::to_tab(
            TAB,
            DAPP,
            InternalMessage::SessionLocked(SessionLocked {
                reason: LockReason::Timeout,
            }),
        );
        assert_eq!(admit(TAB, DAPP, addressed), None);
    }

    #[tokio::test]
    async fn test_forward_uses_captured_origin() {
        let h = unlocked_harness().await;
        let (relay, _events) = ContentRelay::attach(h.router.clone(), TAB, "https://dapp.example/app")
            .await
            .unwrap();
        assert_eq!(relay.origin(), DAPP);

        // body claims another origin; the relay-captured one wins
        let reply = relay.forward(connect(OTHER)).await;
        assert_eq!(reply.error_kind(), Some(ErrorKind::InvalidMessage));

        let reply = relay.forward(connect(DAPP)).await;
        assert!(reply.success);
        assert_eq!(h.router.active_request().await.unwrap().unwrap().source_tab_id, TAB);
    }

    #[tokio::test]
    async fn test_events_skip_lock_broadcasts() {
        let h = unlocked_harness().await;
        let (relay, mut events) = ContentRelay::attach(h.router.clone(), TAB, DAPP).await.unwrap();
        let reply = relay.forward(connect(DAPP)).await;
        let id = reply.data.unwrap()["requestId"].as_str().unwrap().to_string();

        h.router.lock().await.unwrap();
        h.router.reject(&id).await.unwrap();

        assert_eq!(
            events.next().await,
            Some(OutboundMessage::ConnectResponse(ConnectResponse {
                approved: false,
                accounts: vec![]
            }))
        );
    }

    #[tokio::test]
    async fn test_detach_cancels_tab_requests() {
        let h = unlocked_harness().await;
        let (relay, _events) = ContentRelay::attach(h.router.clone(), TAB, DAPP).await.unwrap();
        relay.forward(json!({ "kind": "ConnectRequest", "payload": { "origin": DAPP } })).await;
        relay.detach().await.unwrap();
        assert!(h.router.active_request().await.unwrap().is_none());
    }
}
