//! Lifecycle state shared by connections and queries.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a connection or a query.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    /// Not connected / not registered.
    #[default]
    Closed,
    /// Waiting for the transport to open or for a registration reply.
    Connecting,
    /// Live.
    Open,
}

impl LinkState {
    /// Lowercase wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Connecting => "connecting",
            Self::Open => "open",
        }
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
