//! End-to-end tests: the WebSocket adapter against a small axum object server.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use assert_matches::assert_matches;
use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use tether_client::{ClientError, Connection, ConnectionConfig, WebSocketTransport};
use tether_settings::ClientSettings;

const TIMEOUT: Duration = Duration::from_secs(5);

// ── Test server ──

#[derive(Clone, Debug)]
struct Change {
    before: Option<Value>,
    after: Option<Value>,
}

struct Store {
    objects: Mutex<BTreeMap<String, Value>>,
    next_query_id: AtomicU64,
    changes: broadcast::Sender<Change>,
    /// Query ids released through `unsubscribe`.
    released: Mutex<Vec<u64>>,
}

impl Store {
    fn new() -> Self {
        let (changes, _) = broadcast::channel(256);
        Self {
            objects: Mutex::new(BTreeMap::new()),
            next_query_id: AtomicU64::new(1),
            changes,
            released: Mutex::new(Vec::new()),
        }
    }

    fn matching(&self, pattern: &Value) -> Vec<Value> {
        self.objects
            .lock()
            .values()
            .filter(|object| matches(pattern, object))
            .cloned()
            .collect()
    }
}

/// Every key in `pattern` equals the same key in the object's `value`.
fn matches(pattern: &Value, object: &Value) -> bool {
    let Some(fields) = pattern.as_object() else {
        return true;
    };
    fields.iter().all(|(k, v)| object["value"].get(k) == Some(v))
}

fn diff_for(query_id: u64, pattern: &Value, change: &Change) -> Option<Value> {
    let before = change.before.as_ref().filter(|o| matches(pattern, o));
    let after = change.after.as_ref().filter(|o| matches(pattern, o));
    let (kind, object) = match (before, after) {
        (None, Some(after)) => ("queryAdd", after),
        (Some(_), Some(after)) => ("queryChange", after),
        (Some(before), None) => ("queryRemove", before),
        (None, None) => return None,
    };
    Some(json!({"type": kind, "queryId": query_id, "object": object}))
}

/// Frames to send back, and whether to drop the socket afterwards.
fn handle_request(store: &Store, queries: &mut HashMap<u64, Value>, request: &Value) -> (Vec<Value>, bool) {
    let id = request["id"].clone();
    let ok = |result: Value| json!({"requestId": id, "result": result});
    let fail = |message: &str| json!({"requestId": id, "error": {"message": message}});

    match request["type"].as_str().unwrap_or_default() {
        "get" => {
            let objects = store.matching(&request["pattern"]);
            (vec![ok(json!({"objects": objects}))], false)
        }
        "set" => {
            let name = request["name"].as_str().unwrap_or_default();
            if name.is_empty() {
                return (vec![fail("name required")], false);
            }
            let object = json!({"name": name, "value": request["value"]});
            let before = store.objects.lock().insert(name.to_owned(), object.clone());
            let _ = store.changes.send(Change { before, after: Some(object) });
            (vec![ok(json!({"name": name}))], false)
        }
        "remove" => {
            let name = request["name"].as_str().unwrap_or_default();
            let before = store.objects.lock().remove(name);
            let existed = before.is_some();
            if existed {
                let _ = store.changes.send(Change { before, after: None });
            }
            (vec![ok(json!({"existed": existed}))], false)
        }
        "query" => {
            let query_id = store.next_query_id.fetch_add(1, Ordering::Relaxed);
            let pattern = request["pattern"].clone();
            let objects = store.matching(&pattern);
            let _ = queries.insert(query_id, pattern);
            (vec![ok(json!({"queryId": query_id, "objects": objects}))], false)
        }
        "unsubscribe" => {
            let released = request["queryId"].as_u64().filter(|q| queries.remove(q).is_some());
            if let Some(query_id) = released {
                store.released.lock().push(query_id);
            }
            let removed = released.is_some();
            (vec![ok(json!({"removed": removed}))], false)
        }
        "emit" => {
            let event = request["event"].as_str().unwrap_or_default();
            if event == "kick" {
                return (vec![ok(Value::Null)], true);
            }
            let name = request["object"].as_str().unwrap_or_default();
            let object = store.objects.lock().get(name).cloned();
            let mut frames = vec![ok(Value::Null)];
            if let Some(object) = object {
                for (query_id, pattern) in queries.iter() {
                    if matches(pattern, &object) {
                        frames.push(json!({
                            "type": "queryEvent",
                            "queryId": query_id,
                            "object": name,
                            "event": event,
                            "data": request["data"],
                        }));
                    }
                }
            }
            (frames, false)
        }
        other => (vec![fail(&format!("unknown type {other}"))], false),
    }
}

async fn serve_socket(socket: WebSocket, store: Arc<Store>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut changes = store.changes.subscribe();
    let mut queries: HashMap<u64, Value> = HashMap::new();

    loop {
        let outgoing = tokio::select! {
            frame = ws_rx.next() => {
                let text = match frame {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                    Some(Ok(_)) => continue,
                };
                let Ok(request) = serde_json::from_str::<Value>(text.as_str()) else { continue };
                let (frames, kick) = handle_request(&store, &mut queries, &request);
                for frame in frames {
                    let _ = ws_tx.send(Message::Text(frame.to_string().into())).await;
                }
                if kick {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
                continue;
            }
            change = changes.recv() => {
                let Ok(change) = change else { break };
                queries
                    .iter()
                    .filter_map(|(query_id, pattern)| diff_for(*query_id, pattern, &change))
                    .collect::<Vec<_>>()
            }
        };
        for frame in outgoing {
            if ws_tx.send(Message::Text(frame.to_string().into())).await.is_err() {
                return;
            }
        }
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(store): State<Arc<Store>>) -> Response {
    ws.on_upgrade(move |socket| serve_socket(socket, store))
}

/// Boot a test server and return its WS URL and shared store.
async fn boot_server() -> (String, Arc<Store>) {
    let store = Arc::new(Store::new());
    let app = Router::new().route("/ws", get(ws_handler)).with_state(Arc::clone(&store));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let _ = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("ws://{addr}/ws"), store)
}

// ── Helpers ──

fn fast_config() -> ConnectionConfig {
    ConnectionConfig {
        reconnect_delay: Duration::from_millis(50),
        request_timeout: Some(TIMEOUT),
    }
}

async fn eventually(what: &str, check: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn connect(url: &str) -> Connection {
    let connection = Connection::new(WebSocketTransport::new(url), fast_config());
    eventually("connection open", || connection.is_open()).await;
    connection
}

// ── Tests ──

#[tokio::test]
async fn get_set_remove_round_trip() {
    let (url, _store) = boot_server().await;
    let connection = connect(&url).await;

    let _ = connection.set("a", json!({"kind": "lamp", "on": true})).await.unwrap();
    let _ = connection.set("b", json!({"kind": "fan"})).await.unwrap();

    let lamps = connection.get(json!({"kind": "lamp"})).await.unwrap();
    assert_eq!(lamps.len(), 1);
    assert_eq!(lamps["a"]["value"]["on"], true);

    assert!(connection.remove("a").await.unwrap());
    assert!(!connection.remove("a").await.unwrap());
    assert!(connection.get(json!({"kind": "lamp"})).await.unwrap().is_empty());
}

#[tokio::test]
async fn server_error_surfaces_to_caller() {
    let (url, _store) = boot_server().await;
    let connection = connect(&url).await;

    let err = connection.set("", json!(1)).await.unwrap_err();
    assert_matches!(err, ClientError::Request(value) => {
        assert_eq!(value["message"], "name required");
    });
}

#[tokio::test]
async fn live_query_follows_server_changes() {
    let (url, _store) = boot_server().await;
    let connection = connect(&url).await;
    let _ = connection.set("a", json!({"kind": "lamp", "on": false})).await.unwrap();

    let query = connection.query(json!({"kind": "lamp"}));
    eventually("query open", || query.is_open()).await;
    assert!(query.get("a").is_some());

    let _ = connection.set("b", json!({"kind": "lamp", "on": true})).await.unwrap();
    eventually("b added", || query.get("b").is_some()).await;

    let _ = connection.set("b", json!({"kind": "lamp", "on": false})).await.unwrap();
    eventually("b changed", || {
        query.get("b").is_some_and(|b| b["value"]["on"] == false)
    })
    .await;

    let _ = connection.set("a", json!({"kind": "fan"})).await.unwrap();
    eventually("a left the set", || query.get("a").is_none()).await;

    let _ = connection.set("c", json!({"kind": "fan"})).await.unwrap();
    let _ = connection.get(json!({})).await.unwrap();
    assert_eq!(query.objects().len(), 1);
}

#[tokio::test]
async fn query_events_reach_listeners() {
    let (url, _store) = boot_server().await;
    let connection = connect(&url).await;
    let _ = connection.set("a", json!({"kind": "lamp"})).await.unwrap();

    let query = connection.query(json!({"kind": "lamp"}));
    eventually("query open", || query.is_open()).await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let _ = query.on("event", {
        let seen = Arc::clone(&seen);
        move |record: &Value| seen.lock().push(record.clone())
    });

    let _ = connection.emit("a", "toggle", json!({"on": true})).await.unwrap();
    eventually("event delivered", || !seen.lock().is_empty()).await;
    let record = seen.lock()[0].clone();
    assert_eq!(record["event"], "toggle");
    assert_eq!(record["data"], json!({"on": true}));
}

#[tokio::test]
async fn reconnects_and_reregisters_after_server_drop() {
    let (url, _store) = boot_server().await;
    let settings = ClientSettings {
        url,
        reconnect_delay_ms: 50,
        ..ClientSettings::default()
    };
    let connection = Connection::websocket(&settings);
    eventually("connection open", || connection.is_open()).await;

    let query = connection.query(json!({"kind": "lamp"}));
    eventually("query open", || query.is_open()).await;
    let first_id = query.query_id().unwrap();

    let closes = Arc::new(AtomicU64::new(0));
    let _ = connection.on("close", {
        let closes = Arc::clone(&closes);
        move |_| {
            let _ = closes.fetch_add(1, Ordering::Relaxed);
        }
    });

    let _ = connection.emit("", "kick", Value::Null).await.unwrap();
    eventually("connection dropped", || closes.load(Ordering::Relaxed) == 1).await;
    eventually("query re-registered", || {
        query.is_open() && query.query_id().is_some_and(|id| id != first_id)
    })
    .await;

    let _ = connection.set("x", json!({"kind": "lamp"})).await.unwrap();
    eventually("diff on new registration", || query.get("x").is_some()).await;
}

#[tokio::test]
async fn stopped_query_is_released_on_server() {
    let (url, store) = boot_server().await;
    let connection = connect(&url).await;

    let query = connection.query(json!({}));
    eventually("query open", || query.is_open()).await;
    let query_id = query.query_id().and_then(|id| id.as_u64()).unwrap();
    query.stop();

    eventually("server released the query", || store.released.lock().contains(&query_id)).await;

    let _ = connection.set("late", json!({})).await.unwrap();
    let _ = connection.get(json!({})).await.unwrap();
    assert!(query.get("late").is_none());
}
