//! # tether-core
//!
//! Shared vocabulary for the tether client crates:
//!
//! - **Dispatcher**: [`EventDispatcher`], a named-event multi-listener hub used by
//!   every stateful component to publish notifications
//! - **Lifecycle**: [`LinkState`], the closed / connecting / open state shared by
//!   connections and queries
//! - **Errors**: [`ClientError`] and [`TransportError`] via `thiserror`
//! - **Protocol**: outgoing request envelopes and inbound frame decoding
//! - **Logging**: `tracing` subscriber setup

#![deny(unsafe_code)]

pub mod dispatcher;
pub mod errors;
pub mod lifecycle;
pub mod logging;
pub mod protocol;

pub use dispatcher::{EventDispatcher, Listener, ListenerId};
pub use errors::{ClientError, Result, TransportError};
pub use lifecycle::LinkState;
pub use protocol::ObjectMap;
