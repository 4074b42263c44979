use std::path::PathBuf;
use std::time::Duration;

use crate::storage::default_storage_dir;

/// Coordinator configuration
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeConfig {
    /// Local WebSocket port the content relays connect to
    pub port: u16,
    /// Directory holding the durable store
    pub storage_dir: PathBuf,
    /// Lock the session after this much inactivity (None disables)
    pub inactivity_timeout: Option<Duration>,
    /// Cancel an active approval after this long (None disables)
    pub approval_timeout: Option<Duration>,
    /// Maximum queued requests behind the active one
    pub queue_capacity: usize,
    /// How often timeouts are evaluated
    pub tick_interval: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            port: 7890,
            storage_dir: default_storage_dir(),
            inactivity_timeout: Some(Duration::from_secs(15 * 60)),
            approval_timeout: Some(Duration::from_secs(5 * 60)),
            queue_capacity: 16,
            tick_interval: Duration::from_millis(1000),
        }
    }
}

impl BridgeConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            port: env_parse("WALLET_BRIDGE_PORT").unwrap_or(defaults.port),
            storage_dir: std::env::var("WALLET_BRIDGE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.storage_dir),
            inactivity_timeout: env_timeout("WALLET_LOCK_TIMEOUT_SECS")
                .unwrap_or(defaults.inactivity_timeout),
            approval_timeout: env_timeout("WALLET_APPROVAL_TIMEOUT_SECS")
                .unwrap_or(defaults.approval_timeout),
            queue_capacity: env_parse("WALLET_APPROVAL_QUEUE").unwrap_or(defaults.queue_capacity),
            tick_interval: env_parse::<u64>("WALLET_TICK_MS")
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis)
                .unwrap_or(defaults.tick_interval),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

// 0 disables the timeout
fn env_timeout(name: &str) -> Option<Option<Duration>> {
    env_parse::<u64>(name).map(|secs| (secs > 0).then(|| Duration::from_secs(secs)))
}
