use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::{accept_hdr_async, tungstenite::Message};

use crate::bridge::protocol::{normalize_origin, OutboundMessage, TabId};
use crate::bridge::relay::{ContentRelay, RelayEvents};
use crate::bridge::router::RouterHandle;
use crate::error::{BridgeError, BridgeReply};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// What the page end of a connection receives
#[derive(Debug, Serialize)]
#[serde(tag = "frame", rename_all = "lowercase")]
pub enum PageFrame {
    /// Immediate answer to the frame the page just sent
    Reply(BridgeReply),
    /// Asynchronous protocol response
    Event(OutboundMessage),
}

/// WebSocket front door: every accepted connection is one tab's relay.
pub struct BridgeServer {
    port: u16,
    router: RouterHandle,
    next_tab: AtomicU64,
}

impl BridgeServer {
    pub fn new(port: u16, router: RouterHandle) -> Self {
        Self {
            port,
            router,
            next_tab: AtomicU64::new(1),
        }
    }

    pub async fn start(self: Arc<Self>) -> Result<(), BoxError> {
        let addr: SocketAddr = format!("127.0.0.1:{}", self.port).parse()?;
        let listener = TcpListener::bind(&addr).await?;

        log::info!("🌉 Browser bridge running on ws://localhost:{}", self.port);
        self.serve(listener).await
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<(), BoxError> {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_connection(stream).await {
                            log::warn!("⚠️  Bridge: connection from {} ended: {}", peer, e);
                        }
                    });
                }
                Err(e) => {
                    log::error!("❌ Bridge: error accepting connection: {}", e);
                }
            }
        }
    }

    async fn handle_connection(&self, stream: TcpStream) -> Result<(), BoxError> {
        let mut page_origin = None;
        let ws_stream = accept_hdr_async(stream, |request: &Request, response: Response| {
            match request_origin(request) {
                Ok(origin) => {
                    page_origin = Some(origin);
                    Ok(response)
                }
                Err(reason) => Err(forbidden(reason)),
            }
        })
        .await?;
        let origin = page_origin.ok_or("handshake finished without an origin")?;

        let tab_id = TabId(self.next_tab.fetch_add(1, Ordering::Relaxed));
        let (relay, events) = ContentRelay::attach(self.router.clone(), tab_id, &origin).await?;
        log::info!("🔌 Bridge: {} connected from {}", tab_id, origin);

        let result = pump(ws_stream, &relay, events).await;
        relay.detach().await?;
        log::info!("👋 Bridge: {} disconnected", tab_id);
        result
    }
}

async fn pump(
    ws_stream: tokio_tungstenite::WebSocketStream<TcpStream>,
    relay: &ContentRelay,
    mut events: RelayEvents,
) -> Result<(), BoxError> {
    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let reply = match serde_json::from_str::<Value>(&text) {
                        Ok(raw) => relay.forward(raw).await,
                        Err(e) => BridgeReply::failure(&BridgeError::invalid_message(format!(
                            "not JSON: {e}"
                        ))),
                    };
                    let frame = serde_json::to_string(&PageFrame::Reply(reply))?;
                    write.send(Message::Text(frame)).await?;
                }
                Some(Ok(Message::Ping(data))) => {
                    write.send(Message::Pong(data)).await?;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    log::warn!("⚠️  Bridge: WebSocket error on {}: {}", relay.tab_id(), e);
                    break;
                }
                Some(Ok(_)) => {}
            },
            event = events.next() => match event {
                Some(message) => {
                    let frame = serde_json::to_string(&PageFrame::Event(message))?;
                    write.send(Message::Text(frame)).await?;
                }
                None => break,
            }
        }
    }
    Ok(())
}

fn request_origin(request: &Request) -> Result<String, String> {
    let header = request
        .headers()
        .get("origin")
        .ok_or("missing Origin header")?
        .to_str()
        .map_err(|_| "unreadable Origin header".to_string())?;
    normalize_origin(header).map_err(|e| e.to_string())
}

fn forbidden(reason: String) -> ErrorResponse {
    log::warn!("🚫 Bridge: refused upgrade: {}", reason);
    let mut response = ErrorResponse::new(Some(reason));
    *response.status_mut() = StatusCode::FORBIDDEN;
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::router::tests::{unlocked_harness, Harness, SurfaceEvent, ALICE, DAPP};
    use serde_json::json;
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::http::HeaderValue;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    async fn serve(h: &Harness) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::new(BridgeServer::new(addr.port(), h.router.clone()));
        tokio::spawn(server.serve(listener));
        addr
    }

    async fn client(addr: SocketAddr, origin: Option<&'static str>) -> Result<Client, String> {
        let mut request = format!("ws://{addr}").into_client_request().unwrap();
        if let Some(origin) = origin {
            request
                .headers_mut()
                .insert("Origin", HeaderValue::from_static(origin));
        }
        connect_async(request)
            .await
            .map(|(stream, _)| stream)
            .map_err(|e| e.to_string())
    }

    async fn next_frame(client: &mut Client) -> Value {
        loop {
            match client.next().await.unwrap().unwrap() {
                Message::Text(text) => return serde_json::from_str(&text).unwrap(),
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn test_missing_origin_is_refused() {
        let h = unlocked_harness().await;
        let addr = serve(&h).await;
        let err = client(addr, None).await.unwrap_err();
        assert!(err.contains("403"), "{err}");
    }

    #[tokio::test]
    async fn test_connect_over_websocket() {
        let mut h = unlocked_harness().await;
        let addr = serve(&h).await;
        let mut page = client(addr, Some("https://dapp.example")).await.unwrap();

        let request = json!({ "kind": "ConnectRequest", "payload": { "origin": DAPP } });
        page.send(Message::Text(request.to_string())).await.unwrap();
        let reply = next_frame(&mut page).await;
        assert_eq!(reply["frame"], "reply");
        assert_eq!(reply["success"], true);
        assert_eq!(reply["data"]["status"], "pending");

        let Some(SurfaceEvent::Open(handoff)) = h.surface.recv().await else {
            panic!("surface not opened");
        };
        h.router
            .complete_connect(&handoff.request_id, vec![ALICE.into()])
            .await
            .unwrap();

        let event = next_frame(&mut page).await;
        assert_eq!(event["frame"], "event");
        assert_eq!(event["kind"], "ConnectResponse");
        assert_eq!(event["payload"]["approved"], true);
        assert_eq!(event["payload"]["accounts"][0]["address"], ALICE);
    }

    #[tokio::test]
    async fn test_garbage_frame_is_invalid_message() {
        let h = unlocked_harness().await;
        let addr = serve(&h).await;
        let mut page = client(addr, Some("https://dapp.example")).await.unwrap();

        page.send(Message::Text("{not json".into())).await.unwrap();
        let reply = next_frame(&mut page).await;
        assert_eq!(reply["success"], false);
        assert_eq!(reply["error"], "InvalidMessage");
    }

    #[tokio::test]
    async fn test_close_detaches_tab() {
        let h = unlocked_harness().await;
        let addr = serve(&h).await;
        let mut page = client(addr, Some("https://dapp.example")).await.unwrap();
        let request = json!({ "kind": "ConnectRequest", "payload": { "origin": DAPP } });
        page.send(Message::Text(request.to_string())).await.unwrap();
        next_frame(&mut page).await;
        assert_eq!(h.router.status().await.unwrap().tabs, 1);

        page.close(None).await.unwrap();
        for _ in 0..100 {
            if h.router.status().await.unwrap().tabs == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let status = h.router.status().await.unwrap();
        assert_eq!(status.tabs, 0);
        assert!(status.active.is_none());
    }
}
