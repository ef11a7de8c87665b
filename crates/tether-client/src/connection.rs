//! Auto-reconnecting request/response connection.
//!
//! A [`Connection`] owns one transport at a time. Each transport gets a driver
//! task that processes its events strictly in delivery order: lifecycle
//! transitions, reply correlation and event publication all run to completion
//! inside that task before the next event is looked at. When a transport
//! closes, the driver waits for the reconnect delay and asks the factory for a
//! fresh one.
//!
//! Requests still waiting for a reply when their transport closes are
//! abandoned: they neither resolve nor fail (unless a request timeout is
//! configured).

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tether_core::protocol::{
    ClientRequest, Inbound, ObjectsReply, RemoveReply, decode_inbound, encode_request, events,
};
use tether_core::{ClientError, EventDispatcher, LinkState, ListenerId, ObjectMap, Result};
use tether_settings::ClientSettings;

use crate::mirror::Mirror;
use crate::query::Query;
use crate::transport::{TransportEvent, TransportEvents, TransportFactory, TransportSink, WebSocketTransport};

/// Continuation run by the driver when a reply arrives.
pub(crate) type ReplyHandler = Box<dyn FnOnce(std::result::Result<Value, Value>) + Send>;

/// Tunables for a [`Connection`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Wait between a transport close and the next connect attempt.
    pub reconnect_delay: Duration,
    /// Fail requests that get no reply within this long. `None` waits forever.
    pub request_timeout: Option<Duration>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(1),
            request_timeout: None,
        }
    }
}

impl From<&ClientSettings> for ConnectionConfig {
    fn from(settings: &ClientSettings) -> Self {
        Self {
            reconnect_delay: settings.reconnect_delay(),
            request_timeout: settings.request_timeout(),
        }
    }
}

struct ConnectionState {
    state: LinkState,
    sink: Option<TransportSink>,
    next_request_id: u64,
    pending: HashMap<u64, ReplyHandler>,
}

struct Inner {
    factory: Box<dyn TransportFactory>,
    config: ConnectionConfig,
    state: Mutex<ConnectionState>,
    events: EventDispatcher<Value>,
    shutdown: CancellationToken,
}

/// Handle to a persistent, auto-reconnecting connection.
///
/// Cheap to clone; all clones share the same underlying connection. The
/// reconnect cycle stops when the last handle is dropped or
/// [`shutdown`](Self::shutdown) is called.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

/// Non-owning handle used by request continuations.
#[derive(Clone)]
pub(crate) struct WeakConnection {
    inner: Weak<Inner>,
}

impl WeakConnection {
    pub(crate) fn upgrade(&self) -> Option<Connection> {
        self.inner.upgrade().map(|inner| Connection { inner })
    }
}

impl Connection {
    /// Create a connection and start the first connect attempt.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(factory: impl TransportFactory, config: ConnectionConfig) -> Self {
        let connection = Self {
            inner: Arc::new(Inner {
                factory: Box::new(factory),
                config,
                state: Mutex::new(ConnectionState {
                    state: LinkState::Closed,
                    sink: None,
                    next_request_id: 1,
                    pending: HashMap::new(),
                }),
                events: EventDispatcher::new(),
                shutdown: CancellationToken::new(),
            }),
        };
        if let Err(e) = connection.inner.connect() {
            warn!(error = %e, "initial connect failed");
        }
        connection
    }

    /// Connect to a WebSocket endpoint using loaded settings.
    pub fn websocket(settings: &ClientSettings) -> Self {
        Self::new(WebSocketTransport::new(settings.url.clone()), settings.into())
    }

    /// Start a connect attempt. Only valid while closed.
    pub fn connect(&self) -> Result<()> {
        self.inner.connect()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LinkState {
        self.inner.state.lock().state
    }

    /// Whether the transport is open.
    pub fn is_open(&self) -> bool {
        self.state() == LinkState::Open
    }

    /// Configuration this connection was built with.
    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// Number of requests waiting for a reply on the current transport.
    pub fn pending_requests(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    /// Listen for a connection event: `"open"`, `"close"`, or any server event
    /// type (`"queryAdd"`, application names, ...). Server events carry the whole
    /// inbound record; `"open"` and `"close"` carry `null`.
    pub fn on<F>(&self, name: &str, listener: F) -> ListenerId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.inner.events.subscribe(name, listener)
    }

    /// Remove a listener registered with [`on`](Self::on).
    pub fn off(&self, name: &str, id: ListenerId) -> bool {
        self.inner.events.unsubscribe(name, id)
    }

    /// Serialize and send a message without correlation. Only valid while open.
    pub fn send<T: Serialize + ?Sized>(&self, message: &T) -> Result<()> {
        let frame = serde_json::to_string(message)?;
        let state = self.inner.state.lock();
        match (&state.sink, state.state) {
            (Some(sink), LinkState::Open) => Ok(sink.send(frame)?),
            (_, current) => Err(ClientError::invalid_state("send", current)),
        }
    }

    /// Send `message` with a fresh correlation id and wait for its reply.
    ///
    /// The message must serialize to a JSON object; any `id` field it carries
    /// is replaced by the correlation id. A reply carrying `error`
    /// fails with [`ClientError::Request`]. If the transport closes first the
    /// request is abandoned and only a configured request timeout ends the wait.
    pub async fn request<T: Serialize + ?Sized>(&self, message: &T) -> Result<Value> {
        let (tx, rx) = oneshot::channel();
        let request_id = self.request_with(
            message,
            Box::new(move |outcome| {
                let _ = tx.send(outcome);
            }),
        )?;

        let reply = async move {
            match rx.await {
                Ok(outcome) => outcome,
                Err(_) => {
                    debug!(request_id, "request abandoned by transport close");
                    std::future::pending::<std::result::Result<Value, Value>>().await
                }
            }
        };

        let outcome = match self.inner.config.request_timeout {
            Some(limit) => tokio::time::timeout(limit, reply).await.map_err(|_| ClientError::Timeout {
                timeout_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
            })?,
            None => reply.await,
        };
        outcome.map_err(ClientError::Request)
    }

    /// One-shot snapshot of the objects matching `pattern`, keyed by name.
    pub async fn get(&self, pattern: Value) -> Result<ObjectMap> {
        let result = self.request(&ClientRequest::Get { pattern }).await?;
        let reply: ObjectsReply = parse_reply("get", result)?;
        Ok(Mirror::from_snapshot(reply.objects).into_objects())
    }

    /// Assign `value` to `name`. Returns the server's result.
    pub async fn set(&self, name: impl Into<String>, value: Value) -> Result<Value> {
        self.request(&ClientRequest::Set { name: name.into(), value }).await
    }

    /// Delete `name`. Returns whether it existed.
    pub async fn remove(&self, name: impl Into<String>) -> Result<bool> {
        let result = self.request(&ClientRequest::Remove { name: name.into() }).await?;
        let reply: RemoveReply = parse_reply("remove", result)?;
        Ok(reply.existed)
    }

    /// Ask the server to broadcast an application event on `object`.
    pub async fn emit(&self, object: impl Into<String>, event: impl Into<String>, data: Value) -> Result<Value> {
        let message = ClientRequest::Emit {
            object: object.into(),
            event: event.into(),
            data,
        };
        self.request(&message).await
    }

    /// Tear down a server-side subscription.
    pub async fn unsubscribe(&self, query_id: Value) -> Result<Value> {
        self.request(&ClientRequest::Unsubscribe { query_id }).await
    }

    /// Start a live query for `pattern`.
    #[must_use = "dropping a Query stops the subscription"]
    pub fn query(&self, pattern: Value) -> Query {
        Query::attach(self.clone(), pattern, None)
    }

    /// Start a live query and call `listener` with the whole mirror after every
    /// change.
    #[must_use = "dropping a Query stops the subscription"]
    pub fn query_with<F>(&self, pattern: Value, listener: F) -> Query
    where
        F: Fn(&ObjectMap) + Send + Sync + 'static,
    {
        Query::attach(self.clone(), pattern, Some(Box::new(listener)))
    }

    /// Stop reconnecting and drop the current transport.
    ///
    /// Publishes `"close"` if the connection was open. Pending requests are
    /// abandoned and later [`connect`](Self::connect) calls fail with
    /// [`ClientError::ShutDown`].
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let was_open = self.inner.close_transport();
        info!(was_open, "connection shut down");
        if was_open {
            let _ = self.inner.events.publish(events::CLOSE, &Value::Null);
        }
    }

    /// Send a correlated request whose reply is handled by `on_reply` inside
    /// the driver task. Returns the correlation id.
    pub(crate) fn request_with<T: Serialize + ?Sized>(&self, message: &T, on_reply: ReplyHandler) -> Result<u64> {
        self.inner.request_with(message, on_reply)
    }

    /// Fire-and-forget unsubscription for a registration nobody owns anymore.
    pub(crate) fn release_query(&self, query_id: Value) {
        let logged_id = query_id.clone();
        let on_reply: ReplyHandler = Box::new(move |outcome| {
            if let Err(error) = outcome {
                warn!(query_id = %logged_id, %error, "server rejected unsubscribe");
            }
        });
        match self.request_with(&ClientRequest::Unsubscribe { query_id: query_id.clone() }, on_reply) {
            Ok(request_id) => debug!(request_id, %query_id, "releasing query"),
            Err(e) => debug!(%query_id, error = %e, "could not release query"),
        }
    }

    pub(crate) fn downgrade(&self) -> WeakConnection {
        WeakConnection {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Connection")
            .field("state", &state.state)
            .field("pending", &state.pending.len())
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl Inner {
    fn connect(self: &Arc<Self>) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(ClientError::ShutDown);
        }
        let events = {
            let mut state = self.state.lock();
            if state.state != LinkState::Closed {
                return Err(ClientError::invalid_state("connect", state.state));
            }
            state.state = LinkState::Connecting;
            let (sink, events) = self.factory.create().split();
            state.sink = Some(sink);
            events
        };
        info!(state = %LinkState::Connecting, "connecting");
        let _ = tokio::spawn(drive(Arc::downgrade(self), events, self.shutdown.clone()));
        Ok(())
    }

    fn request_with<T: Serialize + ?Sized>(&self, message: &T, on_reply: ReplyHandler) -> Result<u64> {
        let mut state = self.state.lock();
        if state.state != LinkState::Open {
            return Err(ClientError::invalid_state("send", state.state));
        }
        let request_id = state.next_request_id;
        state.next_request_id = request_id.wrapping_add(1);

        let frame = encode_request(request_id, message)?;
        let Some(sink) = &state.sink else {
            return Err(ClientError::invalid_state("send", state.state));
        };
        sink.send(frame)?;
        let _ = state.pending.insert(request_id, on_reply);
        debug!(request_id, "request sent");
        Ok(request_id)
    }

    /// Move to closed and drop the transport. Returns whether it was open.
    fn close_transport(&self) -> bool {
        let (was_open, abandoned) = {
            let mut state = self.state.lock();
            let was_open = state.state == LinkState::Open;
            state.state = LinkState::Closed;
            state.sink = None;
            (was_open, std::mem::take(&mut state.pending))
        };
        if !abandoned.is_empty() {
            debug!(count = abandoned.len(), "abandoning pending requests");
        }
        was_open
    }

    fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Opened => {
                {
                    let mut state = self.state.lock();
                    if state.state != LinkState::Connecting {
                        warn!(state = %state.state, "transport opened in unexpected state");
                        return;
                    }
                    state.state = LinkState::Open;
                }
                info!(state = %LinkState::Open, "connection open");
                let _ = self.events.publish(events::OPEN, &Value::Null);
            }
            TransportEvent::Message(payload) => self.handle_message(&payload),
            TransportEvent::Errored(error) => warn!(%error, "transport error"),
            TransportEvent::Closed => {
                let was_open = self.close_transport();
                info!(was_open, state = %LinkState::Closed, "connection closed");
                if was_open {
                    let _ = self.events.publish(events::CLOSE, &Value::Null);
                }
            }
        }
    }

    fn handle_message(&self, payload: &str) {
        match decode_inbound(payload) {
            Ok(Inbound::Reply { request_id, outcome }) => {
                let handler = self.state.lock().pending.remove(&request_id);
                match handler {
                    Some(handler) => {
                        debug!(request_id, ok = outcome.is_ok(), "reply received");
                        handler(outcome);
                    }
                    None => debug!(request_id, "reply for unknown request"),
                }
            }
            Ok(Inbound::Event { kind, record }) => {
                let _ = self.events.publish(&kind, &record);
            }
            Ok(Inbound::Reserved(kind)) => warn!(%kind, "server event uses a reserved name, dropping"),
            Ok(Inbound::Ignored) => debug!("ignoring frame without type or requestId"),
            Err(e) => warn!(error = %e, "unparseable frame, dropping"),
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Driver task for one transport: process its events in order, then schedule
/// the next connect attempt.
async fn drive(connection: Weak<Inner>, mut events: TransportEvents, shutdown: CancellationToken) {
    loop {
        let event = tokio::select! {
            biased;
            () = shutdown.cancelled() => return,
            event = events.next() => event,
        };
        let Some(event) = event else { break };
        let Some(inner) = connection.upgrade() else { return };
        let closed = event == TransportEvent::Closed;
        inner.handle_event(event);
        if closed {
            break;
        }
    }

    let delay = match connection.upgrade() {
        Some(inner) => inner.config.reconnect_delay,
        None => return,
    };
    debug!(delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX), "reconnect scheduled");
    tokio::select! {
        biased;
        () = shutdown.cancelled() => return,
        () = tokio::time::sleep(delay) => {}
    }

    let Some(inner) = connection.upgrade() else { return };
    if let Err(e) = inner.connect() {
        debug!(error = %e, "reconnect skipped");
    }
}

fn parse_reply<T: DeserializeOwned>(operation: &str, result: Value) -> Result<T> {
    serde_json::from_value(result).map_err(|e| ClientError::Protocol(format!("malformed {operation} reply: {e}")))
}
