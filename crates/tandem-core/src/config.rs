//! Session configuration.

use serde::{Deserialize, Serialize};

use crate::awareness::STALE_AFTER_MS;
use crate::liveness::{OWNER_GRACE_MS, REDIRECT_DELAY_MS};
use crate::undo::MAX_UNDO_HISTORY;

/// Environment variable overriding the relay URL.
pub const SERVER_URL_ENV: &str = "TANDEM_SERVER_URL";

/// Default relay endpoint.
pub const DEFAULT_SERVER_URL: &str = "ws://localhost:3030/ws";

/// Tunables for a collaborative session. All durations are milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub server_url: String,
    pub undo_capacity: usize,
    pub stale_after_ms: u64,
    pub owner_grace_ms: u64,
    pub redirect_delay_ms: u64,
    pub awareness_heartbeat_ms: u64,
    /// Debounce between buffered history writes.
    pub history_persist_interval_ms: u64,
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            undo_capacity: MAX_UNDO_HISTORY,
            stale_after_ms: STALE_AFTER_MS,
            owner_grace_ms: OWNER_GRACE_MS,
            redirect_delay_ms: REDIRECT_DELAY_MS,
            awareness_heartbeat_ms: 15_000,
            history_persist_interval_ms: 2_000,
            reconnect_initial_ms: 500,
            reconnect_max_ms: 30_000,
        }
    }
}

impl SyncConfig {
    /// Parse a JSON object; missing keys take their defaults.
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    /// Defaults, with the relay URL taken from `TANDEM_SERVER_URL` if set.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(url) = std::env::var(SERVER_URL_ENV) {
            if !url.trim().is_empty() {
                config.server_url = url.trim().to_string();
            }
        }
        config
    }

    pub fn with_server_url(mut self, url: impl Into<String>) -> Self {
        self.server_url = url.into();
        self
    }
}
