// src/error.rs
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::keyring::KeyringError;
use crate::storage::StorageError;

/// Error kinds that may cross a context boundary.
///
/// Pages only ever see one of these names, never the details attached to a
/// [`BridgeError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, thiserror::Error)]
pub enum ErrorKind {
    #[error("invalid message")]
    InvalidMessage,
    #[error("permission denied")]
    PermissionDenied,
    #[error("connection rejected")]
    ConnectionRejected,
    #[error("signing failed")]
    SigningFailed,
    #[error("wallet not found")]
    WalletNotFound,
    #[error("request not found")]
    RequestNotFound,
    #[error("invalid password")]
    InvalidPassword,
    #[error("wallet is locked")]
    WalletLocked,
    #[error("approval queue is full")]
    QueueFull,
    #[error("request expired")]
    RequestExpired,
    #[error("unknown error")]
    UnknownError,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{kind}{}", .details.as_deref().map(|d| format!(": {d}")).unwrap_or_default())]
pub struct BridgeError {
    pub kind: ErrorKind,
    pub details: Option<String>,
}

impl BridgeError {
    pub fn new(kind: ErrorKind) -> Self {
        Self { kind, details: None }
    }

    pub fn with_details(kind: ErrorKind, details: impl Into<String>) -> Self {
        Self {
            kind,
            details: Some(details.into()),
        }
    }

    pub fn invalid_message(details: impl Into<String>) -> Self {
        Self::with_details(ErrorKind::InvalidMessage, details)
    }

    pub fn unknown(details: impl Into<String>) -> Self {
        Self::with_details(ErrorKind::UnknownError, details)
    }
}

impl From<ErrorKind> for BridgeError {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

impl From<StorageError> for BridgeError {
    fn from(e: StorageError) -> Self {
        Self::unknown(format!("storage: {e}"))
    }
}

impl From<KeyringError> for BridgeError {
    fn from(e: KeyringError) -> Self {
        let kind = match &e {
            KeyringError::WalletNotFound(_) => ErrorKind::WalletNotFound,
            KeyringError::InvalidPassword => ErrorKind::InvalidPassword,
            KeyringError::Locked(_) | KeyringError::Signing(_) => ErrorKind::SigningFailed,
            KeyringError::Storage(_) | KeyringError::Crypto(_) => ErrorKind::UnknownError,
        };
        Self::with_details(kind, e.to_string())
    }
}

/// Generic response envelope for every coordinator call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeReply {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl BridgeReply {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            details: None,
        }
    }

    pub fn empty() -> Self {
        Self {
            success: true,
            data: None,
            error: None,
            details: None,
        }
    }

    pub fn failure(error: &BridgeError) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.kind),
            details: error.details.clone(),
        }
    }

    /// Error kind carried by a failed reply; a failure without a kind is `UnknownError`.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        if self.success {
            None
        } else {
            Some(self.error.unwrap_or(ErrorKind::UnknownError))
        }
    }
}

impl<T: Serialize> From<Result<T, BridgeError>> for BridgeReply {
    fn from(result: Result<T, BridgeError>) -> Self {
        match result {
            Ok(value) => match serde_json::to_value(value) {
                Ok(Value::Null) => Self::empty(),
                Ok(data) => Self::ok(data),
                Err(e) => Self::failure(&BridgeError::unknown(format!("encode reply: {e}"))),
            },
            Err(e) => Self::failure(&e),
        }
    }
}
