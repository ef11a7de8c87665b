//! # tether-client
//!
//! Persistent, auto-reconnecting client connection with live queries.
//!
//! - **Transport**: [`Transport`] / [`TransportPeer`] channel pair, the contract
//!   every adapter implements, plus the [`WebSocketTransport`] adapter
//! - **Connection**: [`Connection`], request/response correlation over whatever
//!   transport is current, reconnecting after every close
//! - **Query**: [`Query`], a server-side subscription whose matched set is
//!   mirrored locally and patched by diff events
//!
//! ```no_run
//! # async fn demo() -> tether_core::Result<()> {
//! use serde_json::json;
//! use tether_client::Connection;
//!
//! let settings = tether_settings::load_settings().unwrap_or_default();
//! let connection = Connection::websocket(&settings);
//! let lamps = connection.query_with(json!({"kind": "lamp"}), |objects| {
//!     println!("{} lamps", objects.len());
//! });
//! # drop(lamps);
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]

pub mod connection;
pub mod mirror;
pub mod query;
pub mod transport;

#[cfg(test)]
mod test_support;

pub use connection::{Connection, ConnectionConfig};
pub use mirror::{DiffKind, Mirror};
pub use query::Query;
pub use tether_core::protocol::events;
pub use tether_core::{ClientError, LinkState, ListenerId, ObjectMap, Result, TransportError};
pub use transport::{
    Transport, TransportEvent, TransportEvents, TransportFactory, TransportPeer, TransportReporter, TransportSink,
    WebSocketTransport,
};
