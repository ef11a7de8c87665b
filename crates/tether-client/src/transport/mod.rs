//! Transport contract.
//!
//! A transport is a bidirectional message channel normalized into four events
//! (opened, closed, errored, message) and one operation (send). It is modeled
//! as a pair of channel halves:
//!
//! - [`Transport`] is the side a [`Connection`](crate::Connection) owns. It
//!   splits into a [`TransportSink`] for outgoing frames and an ordered
//!   [`TransportEvents`] stream.
//! - [`TransportPeer`] is the side an adapter drives. It reports lifecycle
//!   events and drains outgoing frames.
//!
//! [`TransportPeer::closed`] consumes the peer, so an adapter cannot reopen a
//! transport it has closed. Dropping the peer counts as closed.

pub mod websocket;

use tokio::sync::mpsc;

use tether_core::TransportError;

pub use websocket::WebSocketTransport;

/// Lifecycle and data events reported by an adapter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    /// The channel is established. Precedes any `Message`.
    Opened,
    /// One inbound text frame.
    Message(String),
    /// Diagnostic error; does not by itself end the transport.
    Errored(String),
    /// The channel is gone. Always the last event.
    Closed,
}

/// Connection-side half of a transport.
#[derive(Debug)]
pub struct Transport {
    sink: TransportSink,
    events: TransportEvents,
}

impl Transport {
    /// Create a connected transport/peer pair.
    pub fn pair() -> (Self, TransportPeer) {
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let transport = Self {
            sink: TransportSink { tx: outgoing_tx },
            events: TransportEvents { rx: events_rx, finished: false },
        };
        let peer = TransportPeer {
            reporter: TransportReporter { tx: events_tx },
            outgoing: outgoing_rx,
        };
        (transport, peer)
    }

    /// Queue a raw payload for delivery.
    pub fn send(&self, payload: String) -> Result<(), TransportError> {
        self.sink.send(payload)
    }

    /// Split into the send half and the event stream.
    pub fn split(self) -> (TransportSink, TransportEvents) {
        (self.sink, self.events)
    }
}

/// Send half of a [`Transport`].
#[derive(Clone, Debug)]
pub struct TransportSink {
    tx: mpsc::UnboundedSender<String>,
}

impl TransportSink {
    /// Queue a raw payload for delivery. Fails once the adapter is gone.
    pub fn send(&self, payload: String) -> Result<(), TransportError> {
        self.tx.send(payload).map_err(|_| TransportError::Closed)
    }
}

/// Ordered event stream of a [`Transport`].
#[derive(Debug)]
pub struct TransportEvents {
    rx: mpsc::UnboundedReceiver<TransportEvent>,
    finished: bool,
}

impl TransportEvents {
    /// Next event. Yields [`TransportEvent::Closed`] exactly once when the
    /// adapter closes or disappears, and `None` afterwards.
    pub async fn next(&mut self) -> Option<TransportEvent> {
        if self.finished {
            return None;
        }
        let event = self.rx.recv().await.unwrap_or(TransportEvent::Closed);
        if event == TransportEvent::Closed {
            self.finished = true;
            self.rx.close();
        }
        Some(event)
    }
}

/// Adapter-side half of a transport.
#[derive(Debug)]
pub struct TransportPeer {
    reporter: TransportReporter,
    outgoing: mpsc::UnboundedReceiver<String>,
}

impl TransportPeer {
    /// Report that the channel is established.
    pub fn opened(&self) {
        self.reporter.opened();
    }

    /// Deliver one inbound frame.
    pub fn message(&self, payload: impl Into<String>) {
        self.reporter.message(payload);
    }

    /// Report a diagnostic error.
    pub fn errored(&self, error: impl Into<String>) {
        self.reporter.errored(error);
    }

    /// Report that the channel is gone.
    pub fn closed(self) {
        self.reporter.closed();
    }

    /// Wait for the next outgoing frame. `None` once the connection side dropped.
    pub async fn next_outgoing(&mut self) -> Option<String> {
        self.outgoing.recv().await
    }

    /// Take an already queued outgoing frame without waiting.
    pub fn try_next_outgoing(&mut self) -> Option<String> {
        self.outgoing.try_recv().ok()
    }

    /// Split into the event reporter and the outgoing frame receiver.
    pub fn split(self) -> (TransportReporter, mpsc::UnboundedReceiver<String>) {
        (self.reporter, self.outgoing)
    }
}

/// Event-reporting handle held by an adapter.
#[derive(Debug)]
pub struct TransportReporter {
    tx: mpsc::UnboundedSender<TransportEvent>,
}

impl TransportReporter {
    /// Report that the channel is established.
    pub fn opened(&self) {
        let _ = self.tx.send(TransportEvent::Opened);
    }

    /// Deliver one inbound frame.
    pub fn message(&self, payload: impl Into<String>) {
        let _ = self.tx.send(TransportEvent::Message(payload.into()));
    }

    /// Report a diagnostic error.
    pub fn errored(&self, error: impl Into<String>) {
        let _ = self.tx.send(TransportEvent::Errored(error.into()));
    }

    /// Report that the channel is gone.
    pub fn closed(self) {
        let _ = self.tx.send(TransportEvent::Closed);
    }

    /// Whether the connection side stopped listening.
    pub fn is_detached(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Produces a fresh transport for every connection attempt.
///
/// Implementations must not call back into the connection that owns them.
pub trait TransportFactory: Send + Sync + 'static {
    /// Start a new connection attempt.
    fn create(&self) -> Transport;
}

impl<F> TransportFactory for F
where
    F: Fn() -> Transport + Send + Sync + 'static,
{
    fn create(&self) -> Transport {
        self()
    }
}
