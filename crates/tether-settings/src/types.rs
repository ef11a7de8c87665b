//! Settings types.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Connection settings for one client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientSettings {
    /// WebSocket endpoint (`ws://` or `wss://`).
    pub url: String,
    /// Delay between a transport close and the next connect attempt.
    pub reconnect_delay_ms: u64,
    /// Per-request reply timeout. `None` waits forever.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_timeout_ms: Option<u64>,
    /// Default `tracing` filter when `RUST_LOG` is unset.
    pub log_level: String,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8080".to_string(),
            reconnect_delay_ms: 1000,
            request_timeout_ms: None,
            log_level: "warn".to_string(),
        }
    }
}

impl ClientSettings {
    /// Reconnect delay as a [`Duration`].
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    /// Request timeout as a [`Duration`], if one is configured.
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }

    /// Reject settings that can never produce a working connection.
    pub fn validate(&self) -> Result<()> {
        if !(self.url.starts_with("ws://") || self.url.starts_with("wss://")) {
            return Err(SettingsError::InvalidValue(format!(
                "url must use ws:// or wss://, got {}",
                self.url
            )));
        }
        if self.request_timeout_ms == Some(0) {
            return Err(SettingsError::InvalidValue(
                "requestTimeoutMs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
