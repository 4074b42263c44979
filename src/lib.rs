pub mod bridge;
pub mod config;
pub mod drafts;
pub mod error;
pub mod keyring;
pub mod storage;
pub mod wallet;

pub use config::BridgeConfig;
pub use error::{BridgeError, BridgeReply, ErrorKind};
