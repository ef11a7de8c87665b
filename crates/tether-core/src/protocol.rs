//! Wire protocol: JSON text frames exchanged with the server.
//!
//! Outgoing requests are `{ "type": ..., "id": <n>, ...fields }`. Inbound frames
//! are either a correlated reply (`requestId` plus `result` or `error`) or an
//! unsolicited event named by `type`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Client-local mirror of named objects.
pub type ObjectMap = HashMap<String, Value>;

/// Event names published by connections and queries.
pub mod events {
    /// Connection or query became live.
    pub const OPEN: &str = "open";
    /// Connection or query stopped being live.
    pub const CLOSE: &str = "close";
    /// A query's mirror changed.
    pub const UPDATE: &str = "update";
    /// An object entered a query's matched set.
    pub const ADD: &str = "add";
    /// An object in a query's matched set changed.
    pub const CHANGE: &str = "change";
    /// An object left a query's matched set.
    pub const REMOVE: &str = "remove";
    /// An application event scoped to a query.
    pub const EVENT: &str = "event";

    /// Server diff: object added to a subscription.
    pub const QUERY_ADD: &str = "queryAdd";
    /// Server diff: object changed within a subscription.
    pub const QUERY_CHANGE: &str = "queryChange";
    /// Server diff: object removed from a subscription.
    pub const QUERY_REMOVE: &str = "queryRemove";
    /// Server application event scoped to a subscription.
    pub const QUERY_EVENT: &str = "queryEvent";

    /// Names the server may never use for application events.
    pub const RESERVED: [&str; 2] = [OPEN, CLOSE];
}

/// Built-in request messages.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientRequest {
    /// One-shot snapshot of objects matching `pattern`.
    Get {
        /// Opaque matching criterion.
        pattern: Value,
    },
    /// Assign `value` to `name`.
    Set {
        /// Object name.
        name: String,
        /// New value.
        value: Value,
    },
    /// Delete `name`.
    Remove {
        /// Object name.
        name: String,
    },
    /// Register a live subscription.
    Query {
        /// Opaque matching criterion.
        pattern: Value,
    },
    /// Tear down a live subscription.
    Unsubscribe {
        /// Server-assigned subscription id.
        #[serde(rename = "queryId")]
        query_id: Value,
    },
    /// Ask the server to broadcast an application event.
    Emit {
        /// Target object name.
        object: String,
        /// Event name.
        event: String,
        /// Event payload.
        data: Value,
    },
}

/// Encode `message` with correlation id `id` as a JSON text frame.
///
/// The message must serialize to a JSON object. The correlation id is written
/// under `id`, replacing any `id` the message already carries.
pub fn encode_request<T: Serialize + ?Sized>(id: u64, message: &T) -> serde_json::Result<String> {
    let Value::Object(mut fields) = serde_json::to_value(message)? else {
        return Err(serde::ser::Error::custom("request message must be a JSON object"));
    };
    let _ = fields.insert("id".to_owned(), Value::from(id));
    serde_json::to_string(&fields)
}

/// A decoded inbound frame.
#[derive(Clone, Debug, PartialEq)]
pub enum Inbound {
    /// Reply to a request; `Err` carries the server's `error` value.
    Reply {
        /// Correlation id.
        request_id: u64,
        /// `result` on success, `error` on failure.
        outcome: Result<Value, Value>,
    },
    /// Unsolicited event to publish under `kind`.
    Event {
        /// Value of the `type` field.
        kind: String,
        /// The whole frame.
        record: Value,
    },
    /// Event using a reserved name; must not be forwarded.
    Reserved(String),
    /// Valid JSON that is neither a reply nor a typed event.
    Ignored,
}

/// Decode one inbound text frame.
///
/// A frame carrying `requestId` is always treated as a reply, even when the id
/// is not an integer (such frames decode to [`Inbound::Ignored`]).
pub fn decode_inbound(payload: &str) -> serde_json::Result<Inbound> {
    let record: Value = serde_json::from_str(payload)?;
    let Value::Object(fields) = &record else {
        return Ok(Inbound::Ignored);
    };

    if let Some(request_id) = fields.get("requestId") {
        let Some(request_id) = request_id.as_u64() else {
            return Ok(Inbound::Ignored);
        };
        let outcome = match fields.get("error") {
            Some(error) => Err(error.clone()),
            None => Ok(fields.get("result").cloned().unwrap_or(Value::Null)),
        };
        return Ok(Inbound::Reply { request_id, outcome });
    }

    match fields.get("type").and_then(Value::as_str) {
        Some(kind) if events::RESERVED.contains(&kind) => Ok(Inbound::Reserved(kind.to_owned())),
        Some(kind) => {
            let kind = kind.to_owned();
            Ok(Inbound::Event { kind, record })
        }
        None => Ok(Inbound::Ignored),
    }
}

/// Reply to a `query` registration.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRegistration {
    /// Server-assigned subscription id.
    pub query_id: Value,
    /// Initial snapshot of the matched set.
    #[serde(default)]
    pub objects: Vec<Value>,
}

/// Reply to a `get` request.
#[derive(Clone, Debug, Deserialize)]
pub struct ObjectsReply {
    /// Objects matching the pattern.
    #[serde(default)]
    pub objects: Vec<Value>,
}

/// Reply to a `remove` request.
#[derive(Clone, Copy, Debug, Deserialize)]
pub struct RemoveReply {
    /// Whether the object existed before removal.
    #[serde(default)]
    pub existed: bool,
}

/// Borrowed view of a subscription-scoped event (`queryAdd`, `queryEvent`, ...).
#[derive(Clone, Copy, Debug)]
pub struct ScopedEvent<'a> {
    /// Subscription id the event belongs to.
    pub query_id: &'a Value,
    /// Affected object (`Null` when absent, e.g. for some `queryEvent`s).
    pub object: &'a Value,
}

impl<'a> ScopedEvent<'a> {
    /// Read the subscription id and object out of an event record.
    ///
    /// Returns `None` when the record carries no `queryId`.
    pub fn parse(record: &'a Value) -> Option<Self> {
        let query_id = record.get("queryId")?;
        let object = record.get("object").unwrap_or(&Value::Null);
        Some(Self { query_id, object })
    }
}

/// The `name` key of an object snapshot.
pub fn object_name(object: &Value) -> Option<&str> {
    object.get("name").and_then(Value::as_str)
}
