//! WebSocket transport adapter over `tokio-tungstenite`.
//!
//! One task per connection attempt: connect, report opened, pump text frames
//! in both directions, report closed. Binary frames are ignored and ping/pong
//! is handled by tungstenite.

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use tether_core::TransportError;

use super::{Transport, TransportFactory, TransportPeer, TransportReporter};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket-backed transport adapter.
#[derive(Clone, Debug)]
pub struct WebSocketTransport {
    url: String,
}

impl WebSocketTransport {
    /// Adapter for the given `ws://` or `wss://` URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    /// Endpoint this adapter connects to.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Start one connection attempt. Must be called inside a tokio runtime.
    pub fn open(&self) -> Transport {
        let (transport, peer) = Transport::pair();
        let _ = tokio::spawn(run_socket(self.url.clone(), peer));
        transport
    }
}

impl TransportFactory for WebSocketTransport {
    fn create(&self) -> Transport {
        self.open()
    }
}

async fn run_socket(url: String, peer: TransportPeer) {
    let (reporter, outgoing) = peer.split();

    let ws = match connect_async(url.as_str()).await {
        Ok((ws, _response)) => ws,
        Err(e) => {
            let err = TransportError::Connect(e.to_string());
            debug!(%url, error = %err, "websocket connect failed");
            reporter.errored(err.to_string());
            reporter.closed();
            return;
        }
    };

    debug!(%url, "websocket open");
    reporter.opened();
    pump(ws, &reporter, outgoing).await;
    debug!(%url, "websocket closed");
    reporter.closed();
}

async fn pump(ws: WsStream, reporter: &TransportReporter, mut outgoing: mpsc::UnboundedReceiver<String>) {
    let (mut ws_tx, mut ws_rx) = ws.split();

    loop {
        tokio::select! {
            frame = outgoing.recv() => {
                let Some(frame) = frame else {
                    // connection side dropped the transport
                    let _ = ws_tx.close().await;
                    break;
                };
                if let Err(e) = ws_tx.send(Message::Text(frame.into())).await {
                    reporter.errored(TransportError::Socket(e.to_string()).to_string());
                    break;
                }
            }
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => reporter.message(text.as_str()),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "websocket read failed");
                        reporter.errored(TransportError::Socket(e.to_string()).to_string());
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportEvent;
    use assert_matches::assert_matches;

    #[test]
    fn keeps_url() {
        let adapter = WebSocketTransport::new("ws://127.0.0.1:9/live");
        assert_eq!(adapter.url(), "ws://127.0.0.1:9/live");
    }

    #[tokio::test]
    async fn unreachable_endpoint_reports_error_then_closed() {
        // nothing listens on port 1
        let adapter = WebSocketTransport::new("ws://127.0.0.1:1/ws");
        let (_sink, mut events) = adapter.create().split();

        assert_matches!(events.next().await, Some(TransportEvent::Errored(msg)) => {
            assert!(msg.starts_with("connect failed"), "got {msg}");
        });
        assert_eq!(events.next().await, Some(TransportEvent::Closed));
    }
}
