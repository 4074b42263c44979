use rand::RngCore;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::error::BridgeError;
use crate::wallet::Account;

/// Opaque, unguessable coordinator-side request id
pub type RequestId = String;

/// Browser tab hosting one Content Relay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TabId(pub u64);

impl std::fmt::Display for TabId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "tab#{}", self.0)
    }
}

/// Messages sent from a page to the coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload")]
pub enum InboundMessage {
    ConnectRequest(ConnectRequest),
    SignRequest(SignRequest),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectRequest {
    pub origin: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SignRequest {
    /// Page-generated correlation id, echoed in the `SignResponse`
    pub id: u64,
    pub address: String,
    pub origin: String,
    pub data: SignData,
}

/// What the page asks to have signed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignData {
    /// Structured payload (`signPayload`), signed over its JSON encoding
    Payload { payload: Value },
    /// Raw bytes (`signRaw`), `0x`-prefixed hex
    Bytes { data: String },
}

impl SignData {
    pub fn to_bytes(&self) -> Result<Vec<u8>, BridgeError> {
        match self {
            SignData::Payload { payload } => serde_json::to_vec(payload)
                .map_err(|e| BridgeError::invalid_message(format!("unencodable payload: {e}"))),
            SignData::Bytes { data } => decode_hex(data),
        }
    }
}

/// Messages sent from the coordinator to a page
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload")]
pub enum OutboundMessage {
    ConnectResponse(ConnectResponse),
    SignResponse(SignResponse),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectResponse {
    pub approved: bool,
    pub accounts: Vec<Account>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignResponse {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved: Option<bool>,
}

/// Coordinator-internal messages; pages must never observe these
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload")]
pub enum InternalMessage {
    Authenticate(Authenticate),
    SessionLocked(SessionLocked),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Authenticate {
    pub address: String,
    pub origin: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionLocked {
    pub reason: LockReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockReason {
    Manual,
    Timeout,
}

/// Anything the coordinator may push towards a surface
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Outbound(OutboundMessage),
    Internal(InternalMessage),
}

impl From<OutboundMessage> for Message {
    fn from(message: OutboundMessage) -> Self {
        Message::Outbound(message)
    }
}

impl From<InternalMessage> for Message {
    fn from(message: InternalMessage) -> Self {
        Message::Internal(message)
    }
}

/// Addressing of a pushed message: a single tab, or every surface when `None`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryTarget {
    pub tab_id: TabId,
    pub origin: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub target: Option<DeliveryTarget>,
    pub message: Message,
}

impl Delivery {
    pub fn to_tab(tab_id: TabId, origin: &str, message: impl Into<Message>) -> Self {
        Self {
            target: Some(DeliveryTarget {
                tab_id,
                origin: origin.to_string(),
            }),
            message: message.into(),
        }
    }

    pub fn broadcast(message: impl Into<Message>) -> Self {
        Self {
            target: None,
            message: message.into(),
        }
    }
}

impl InboundMessage {
    /// Parse and validate an untrusted envelope `{ kind, payload }`
    pub fn parse(raw: &Value) -> Result<Self, BridgeError> {
        let kind = raw
            .get("kind")
            .and_then(Value::as_str)
            .ok_or_else(|| BridgeError::invalid_message("missing kind"))?;
        let payload = raw
            .get("payload")
            .filter(|p| p.is_object())
            .cloned()
            .ok_or_else(|| BridgeError::invalid_message("payload must be an object"))?;

        let message = match kind {
            "ConnectRequest" => InboundMessage::ConnectRequest(decode_payload(kind, payload)?),
            "SignRequest" => InboundMessage::SignRequest(decode_payload(kind, payload)?),
            other => return Err(BridgeError::invalid_message(format!("unknown kind {other}"))),
        };
        message.validate()?;
        Ok(message)
    }

    pub fn origin(&self) -> &str {
        match self {
            InboundMessage::ConnectRequest(req) => &req.origin,
            InboundMessage::SignRequest(req) => &req.origin,
        }
    }

    fn validate(&self) -> Result<(), BridgeError> {
        if self.origin().trim().is_empty() {
            return Err(BridgeError::invalid_message("empty origin"));
        }
        if let InboundMessage::SignRequest(req) = self {
            if req.address.trim().is_empty() {
                return Err(BridgeError::invalid_message("empty address"));
            }
            req.data.to_bytes()?;
        }
        Ok(())
    }
}

fn decode_payload<T: DeserializeOwned>(kind: &str, payload: Value) -> Result<T, BridgeError> {
    serde_json::from_value(payload)
        .map_err(|e| BridgeError::invalid_message(format!("bad {kind} payload: {e}")))
}

/// Reduce an origin or URL to `scheme://host[:port]`
pub fn normalize_origin(origin: &str) -> Result<String, BridgeError> {
    let url = Url::parse(origin.trim())
        .map_err(|e| BridgeError::invalid_message(format!("bad origin {origin}: {e}")))?;
    let origin = url.origin();
    if !origin.is_tuple() {
        return Err(BridgeError::invalid_message("opaque origin"));
    }
    Ok(origin.ascii_serialization())
}

pub fn new_request_id() -> RequestId {
    let mut bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub fn encode_hex(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}

pub fn decode_hex(data: &str) -> Result<Vec<u8>, BridgeError> {
    let digits = data.strip_prefix("0x").unwrap_or(data);
    hex::decode(digits).map_err(|e| BridgeError::invalid_message(format!("bad hex data: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    #[test]
    fn test_parse_sign_request() {
        let raw = json!({
            "kind": "SignRequest",
            "payload": {
                "id": 7,
                "address": "5Gw3",
                "origin": "https://dapp.example",
                "data": { "type": "bytes", "data": "0xdeadbeef" }
            }
        });
        let InboundMessage::SignRequest(req) = InboundMessage::parse(&raw).unwrap() else {
            panic!("expected sign request");
        };
        assert_eq!(req.id, 7);
        assert_eq!(req.data.to_bytes().unwrap(), vec![0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn test_malformed_envelopes_are_invalid() {
        let cases = [
            json!("ConnectRequest"),
            json!({ "payload": { "origin": "https://a.example" } }),
            json!({ "kind": "ConnectRequest" }),
            json!({ "kind": "ConnectRequest", "payload": [] }),
            json!({ "kind": "ConnectRequest", "payload": { "origin": "" } }),
            json!({ "kind": "ConnectRequest", "payload": { "origin": "x", "extra": 1 } }),
            json!({ "kind": "SessionLocked", "payload": { "reason": "manual" } }),
            json!({ "kind": "SignRequest", "payload": { "id": -1, "address": "a", "origin": "o",
                    "data": { "type": "bytes", "data": "00" } } }),
            json!({ "kind": "SignRequest", "payload": { "id": 1, "address": "a", "origin": "o",
                    "data": { "type": "bytes", "data": "0xzz" } } }),
            json!({ "kind": "SignRequest", "payload": { "id": 1, "address": "", "origin": "o",
                    "data": { "type": "payload", "payload": {} } } }),
        ];
        for raw in cases {
            let err = InboundMessage::parse(&raw).unwrap_err();
            assert_eq!(err.kind, ErrorKind::InvalidMessage, "{raw}");
        }
    }

    #[test]
    fn test_outbound_wire_shape() {
        let msg = OutboundMessage::SignResponse(SignResponse {
            id: 3,
            signature: Some("0x01".into()),
            approved: None,
        });
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({ "kind": "SignResponse", "payload": { "id": 3, "signature": "0x01" } })
        );

        let locked = Message::from(InternalMessage::SessionLocked(SessionLocked {
            reason: LockReason::Timeout,
        }));
        let encoded = serde_json::to_value(&locked).unwrap();
        assert_eq!(encoded, json!({ "kind": "SessionLocked", "payload": { "reason": "timeout" } }));
        assert_eq!(serde_json::from_value::<Message>(encoded).unwrap(), locked);
    }

    #[test]
    fn test_normalize_origin() {
        assert_eq!(
            normalize_origin("https://Dapp.Example/path?q=1").unwrap(),
            "https://dapp.example"
        );
        assert_eq!(
            normalize_origin("http://localhost:3000/").unwrap(),
            "http://localhost:3000"
        );
        assert!(normalize_origin("data:text/html,hi").is_err());
        assert!(normalize_origin("not a url").is_err());
    }

    #[test]
    fn test_request_ids_are_distinct() {
        let a = new_request_id();
        let b = new_request_id();
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
    }
}
