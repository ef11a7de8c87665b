//! Error hierarchy for the tether client.
//!
//! - [`ClientError`]: everything a caller of a connection or query can see
//! - [`TransportError`]: failures reported by a transport adapter
//!
//! Invalid-state errors are programmer errors and are returned synchronously.
//! Server-reported failures arrive as [`ClientError::Request`] carrying the raw
//! `error` value from the reply frame.

use serde_json::Value;
use thiserror::Error;

use crate::lifecycle::LinkState;

/// Errors surfaced by connections and queries.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Operation is not permitted in the current lifecycle state.
    #[error("can't {operation} in state {state}")]
    InvalidState {
        /// Operation that was attempted (e.g. "connect", "send").
        operation: &'static str,
        /// State at the time of the call.
        state: LinkState,
    },

    /// The transport rejected the frame.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The server answered the request with an `error` field.
    #[error("request failed: {0}")]
    Request(Value),

    /// A reply did not have the expected shape.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// No reply within the configured request timeout.
    #[error("request timed out after {timeout_ms}ms")]
    Timeout {
        /// How long we waited.
        timeout_ms: u64,
    },

    /// A message could not be serialized to JSON.
    #[error("failed to serialize message: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The connection was shut down.
    #[error("connection shut down")]
    ShutDown,
}

impl ClientError {
    /// Shorthand for [`ClientError::InvalidState`].
    pub fn invalid_state(operation: &'static str, state: LinkState) -> Self {
        Self::InvalidState { operation, state }
    }

    /// The server-supplied error value, if this is a request failure.
    pub fn server_error(&self) -> Option<&Value> {
        match self {
            Self::Request(value) => Some(value),
            _ => None,
        }
    }
}

/// Errors reported by a transport adapter.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The adapter side of the transport is gone.
    #[error("transport closed")]
    Closed,

    /// Establishing the underlying channel failed.
    #[error("connect failed: {0}")]
    Connect(String),

    /// The underlying channel failed after it was established.
    #[error("socket error: {0}")]
    Socket(String),
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;
