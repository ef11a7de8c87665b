//! In-memory transport harness shared by unit tests.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::mpsc;

use crate::connection::{Connection, ConnectionConfig};
use crate::transport::{Transport, TransportFactory, TransportPeer};

/// Factory that hands every new transport's peer to the test.
pub(crate) fn mock_factory() -> (impl TransportFactory, mpsc::UnboundedReceiver<TransportPeer>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let factory = move || {
        let (transport, peer) = Transport::pair();
        let _ = tx.send(peer);
        transport
    };
    (factory, rx)
}

/// Connection whose first transport has already opened.
pub(crate) async fn open_connection(
    config: ConnectionConfig,
) -> (Connection, TransportPeer, mpsc::UnboundedReceiver<TransportPeer>) {
    let (factory, mut peers) = mock_factory();
    let connection = Connection::new(factory, config);
    let peer = peers.try_recv().expect("connect creates a transport");
    peer.opened();
    settle().await;
    assert!(connection.is_open());
    (connection, peer, peers)
}

/// Let spawned driver tasks drain their queues.
pub(crate) async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

/// Pop the next frame the connection sent, decoded.
pub(crate) fn next_request(peer: &mut TransportPeer) -> Value {
    let frame = peer.try_next_outgoing().expect("an outgoing frame");
    serde_json::from_str(&frame).expect("outgoing frames are JSON")
}

pub(crate) fn reply(peer: &TransportPeer, request_id: &Value, result: Value) {
    peer.message(json!({"requestId": request_id, "result": result}).to_string());
}

pub(crate) fn reply_error(peer: &TransportPeer, request_id: &Value, error: Value) {
    peer.message(json!({"requestId": request_id, "error": error}).to_string());
}

/// Records `(event name, payload)` pairs from any number of listeners.
#[derive(Clone, Default)]
pub(crate) struct EventLog {
    entries: Arc<Mutex<Vec<(String, Value)>>>,
}

impl EventLog {
    pub(crate) fn listener(&self, name: &str) -> impl Fn(&Value) + Send + Sync + 'static {
        let entries = Arc::clone(&self.entries);
        let name = name.to_owned();
        move |payload: &Value| entries.lock().push((name.clone(), payload.clone()))
    }

    pub(crate) fn names(&self) -> Vec<String> {
        self.entries.lock().iter().map(|(name, _)| name.clone()).collect()
    }

    pub(crate) fn payloads(&self) -> Vec<Value> {
        self.entries.lock().iter().map(|(_, payload)| payload.clone()).collect()
    }

    pub(crate) fn clear(&self) {
        self.entries.lock().clear();
    }
}
