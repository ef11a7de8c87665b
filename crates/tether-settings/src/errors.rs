//! Errors raised while building [`ClientSettings`](crate::ClientSettings).

use thiserror::Error;

/// Why a client configuration could not be produced.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// `~/.tether/settings.json` exists but could not be read.
    #[error("cannot read tether settings file: {0}")]
    Io(#[from] std::io::Error),
    /// The settings file is not valid JSON or has a wrongly typed field.
    #[error("malformed tether settings: {0}")]
    Json(#[from] serde_json::Error),
    /// The merged settings cannot drive a connection, e.g. a non-WebSocket
    /// endpoint URL or a zero request timeout.
    #[error("unusable client settings: {0}")]
    InvalidValue(String),
}

/// Result of loading client settings.
pub type Result<T> = std::result::Result<T, SettingsError>;
