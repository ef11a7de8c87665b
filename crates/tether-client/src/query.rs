//! Live query: a server-side subscription mirrored locally.
//!
//! A [`Query`] registers its pattern with the server whenever its
//! [`Connection`] opens, replaces its mirror with the registration snapshot,
//! and patches the mirror with diff events scoped to the server-assigned
//! `queryId`. Events for any other id are ignored.
//!
//! Each registration attempt carries a generation number. A reply that arrives
//! for a stopped or superseded attempt is unsubscribed right away, so a query
//! never holds two live registrations.

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info, warn};

use tether_core::protocol::{ClientRequest, QueryRegistration, ScopedEvent, events};
use tether_core::{ClientError, EventDispatcher, LinkState, ListenerId, ObjectMap, Result};

use crate::connection::{Connection, ReplyHandler};
use crate::mirror::{DiffKind, Mirror};

pub(crate) type UpdateListener = Box<dyn Fn(&ObjectMap) + Send + Sync>;

#[derive(Default)]
struct QueryState {
    state: LinkState,
    query_id: Option<Value>,
    mirror: Mirror,
    generation: u64,
    /// Listeners this query holds on its connection.
    listeners: Vec<(&'static str, ListenerId)>,
}

struct QueryInner {
    connection: Connection,
    pattern: Value,
    state: Mutex<QueryState>,
    events: EventDispatcher<Value>,
}

/// Handle to one live subscription.
///
/// Publishes `"open"` (payload: snapshot list), `"update"`, `"add"`,
/// `"change"`, `"remove"` (payload: the object), `"event"` (payload: the raw
/// record) and `"close"`. Dropping the handle stops the query.
pub struct Query {
    inner: Arc<QueryInner>,
}

impl Query {
    pub(crate) fn attach(connection: Connection, pattern: Value, on_update: Option<UpdateListener>) -> Self {
        let inner = Arc::new(QueryInner {
            connection,
            pattern,
            state: Mutex::new(QueryState::default()),
            events: EventDispatcher::new(),
        });

        if let Some(listener) = on_update {
            let weak = Arc::downgrade(&inner);
            let _ = inner.events.subscribe(events::UPDATE, move |_| {
                if let Some(inner) = weak.upgrade() {
                    let objects = inner.state.lock().mirror.objects().clone();
                    listener(&objects);
                }
            });
        }

        if let Err(e) = inner.start() {
            warn!(error = %e, "query start failed");
        }
        Self { inner }
    }

    /// Register with the server. Only valid while closed.
    ///
    /// If the connection is not open yet, the query stays closed and registers
    /// as soon as the connection opens.
    pub fn start(&self) -> Result<()> {
        self.inner.start()
    }

    /// Tear the subscription down. Idempotent.
    ///
    /// If open, the server registration is released. The mirror keeps its last
    /// contents.
    pub fn stop(&self) {
        self.inner.stop();
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LinkState {
        self.inner.state.lock().state
    }

    /// Whether the registration is live.
    pub fn is_open(&self) -> bool {
        self.state() == LinkState::Open
    }

    /// Server-assigned subscription id while open.
    pub fn query_id(&self) -> Option<Value> {
        self.inner.state.lock().query_id.clone()
    }

    /// Pattern sent with every registration.
    pub fn pattern(&self) -> &Value {
        &self.inner.pattern
    }

    /// Snapshot of the mirror.
    pub fn objects(&self) -> ObjectMap {
        self.inner.state.lock().mirror.objects().clone()
    }

    /// Last-known snapshot of one object.
    pub fn get(&self, name: &str) -> Option<Value> {
        self.inner.state.lock().mirror.get(name).cloned()
    }

    /// Listen for a query event.
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
}

impl Drop for Query {
    fn drop(&mut self) {
        self.inner.stop();
    }
}

impl fmt::Debug for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Query")
            .field("pattern", &self.inner.pattern)
            .field("state", &state.state)
            .field("query_id", &state.query_id)
            .field("objects", &state.mirror.len())
            .finish()
    }
}

impl QueryInner {
    fn start(self: &Arc<Self>) -> Result<()> {
        let generation = {
            let mut state = self.state.lock();
            if state.state != LinkState::Closed {
                return Err(ClientError::invalid_state("start", state.state));
            }
            if state.listeners.is_empty() {
                state.listeners = self.follow_connection();
            }
            if !self.connection.is_open() {
                debug!(pattern = %self.pattern, "connection not open, query waiting");
                return Ok(());
            }
            state.state = LinkState::Connecting;
            state.query_id = None;
            state.generation += 1;
            state.generation
        };

        let weak = Arc::downgrade(self);
        let connection = self.connection.downgrade();
        let on_reply: ReplyHandler = Box::new(move |outcome| match weak.upgrade() {
            Some(inner) => inner.on_registered(generation, outcome),
            None => {
                // handle dropped before the reply; nobody will ever unsubscribe
                if let (Ok(result), Some(connection)) = (outcome, connection.upgrade()) {
                    if let Some(query_id) = result.get("queryId") {
                        connection.release_query(query_id.clone());
                    }
                }
            }
        });

        let request = ClientRequest::Query { pattern: self.pattern.clone() };
        match self.connection.request_with(&request, on_reply) {
            Ok(request_id) => debug!(request_id, generation, pattern = %self.pattern, "query registering"),
            Err(e) => {
                warn!(error = %e, "query registration not sent");
                let mut state = self.state.lock();
                if state.state == LinkState::Connecting && state.generation == generation {
                    state.state = LinkState::Closed;
                }
            }
        }
        Ok(())
    }

    fn on_registered(&self, generation: u64, outcome: std::result::Result<Value, Value>) {
        let result = match outcome {
            Ok(result) => result,
            Err(error) => {
                warn!(%error, pattern = %self.pattern, "query registration rejected");
                return;
            }
        };
        let registration: QueryRegistration = match serde_json::from_value(result) {
            Ok(registration) => registration,
            Err(e) => {
                warn!(error = %e, "malformed query registration reply");
                return;
            }
        };

        let opened = {
            let mut state = self.state.lock();
            if state.state == LinkState::Connecting && state.generation == generation {
                state.state = LinkState::Open;
                state.query_id = Some(registration.query_id.clone());
                state.mirror.replace(registration.objects.iter().cloned());
                true
            } else {
                false
            }
        };

        if !opened {
            debug!(query_id = %registration.query_id, generation, "registration outlived its attempt, releasing");
            self.connection.release_query(registration.query_id);
            return;
        }

        info!(query_id = %registration.query_id, objects = registration.objects.len(), "query open");
        let _ = self.events.publish(events::OPEN, &Value::Array(registration.objects));
        let _ = self.events.publish(events::UPDATE, &Value::Null);
    }

    fn stop(&self) {
        let (release, listeners) = {
            let mut state = self.state.lock();
            let release = if state.state == LinkState::Open {
                state.query_id.take()
            } else {
                None
            };
            state.state = LinkState::Closed;
            state.query_id = None;
            (release, std::mem::take(&mut state.listeners))
        };

        if let Some(query_id) = release {
            self.connection.release_query(query_id);
        }
        for (name, id) in listeners {
            let _ = self.connection.off(name, id);
        }
    }

    fn on_connection_open(self: &Arc<Self>) {
        if self.state.lock().state != LinkState::Closed {
            return;
        }
        if let Err(e) = self.start() {
            debug!(error = %e, "query already restarting");
        }
    }

    fn on_connection_close(&self) {
        let was_open = {
            let mut state = self.state.lock();
            let was_open = state.state == LinkState::Open;
            // a pending registration died with the transport and will never reply
            state.state = LinkState::Closed;
            state.query_id = None;
            was_open
        };
        if was_open {
            info!(pattern = %self.pattern, "query closed");
            let _ = self.events.publish(events::CLOSE, &Value::Null);
        }
    }

    fn on_diff(&self, kind: DiffKind, record: &Value) {
        let Some(event) = ScopedEvent::parse(record) else {
            return;
        };
        let applied = {
            let mut state = self.state.lock();
            if state.query_id.as_ref() != Some(event.query_id) {
                return;
            }
            state.mirror.apply(kind, event.object)
        };
        if !applied {
            warn!(kind = kind.event_type(), object = %event.object, "diff object without a name, ignoring");
            return;
        }
        let _ = self.events.publish(kind.published_event(), event.object);
        let _ = self.events.publish(events::UPDATE, &Value::Null);
    }

    fn on_query_event(&self, record: &Value) {
        let Some(event) = ScopedEvent::parse(record) else {
            return;
        };
        if self.state.lock().query_id.as_ref() != Some(event.query_id) {
            return;
        }
        let _ = self.events.publish(events::EVENT, record);
    }

    /// Subscribe to the connection events that drive this query.
    fn follow_connection(self: &Arc<Self>) -> Vec<(&'static str, ListenerId)> {
        let mut listeners = vec![
            (events::OPEN, self.forward(events::OPEN, |query, _| query.on_connection_open())),
            (events::CLOSE, self.forward(events::CLOSE, |query, _| query.on_connection_close())),
            (
                events::QUERY_EVENT,
                self.forward(events::QUERY_EVENT, |query, record| query.on_query_event(record)),
            ),
        ];
        for kind in [DiffKind::Add, DiffKind::Change, DiffKind::Remove] {
            let name = kind.event_type();
            listeners.push((name, self.forward(name, move |query, record| query.on_diff(kind, record))));
        }
        listeners
    }

    fn forward<F>(self: &Arc<Self>, name: &str, handler: F) -> ListenerId
    where
        F: Fn(&Arc<QueryInner>, &Value) + Send + Sync + 'static,
    {
        let weak: Weak<QueryInner> = Arc::downgrade(self);
        self.connection.on(name, move |payload| {
            if let Some(query) = weak.upgrade() {
                handler(&query, payload);
            }
        })
    }
}
