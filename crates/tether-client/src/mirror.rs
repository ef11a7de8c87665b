//! Client-local mirror of a query's matched set.

use serde_json::Value;
use tracing::warn;

use tether_core::ObjectMap;
use tether_core::protocol::{events, object_name};

/// One incremental mutation of a matched set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiffKind {
    /// Object entered the set (or was re-sent).
    Add,
    /// Object in the set changed.
    Change,
    /// Object left the set.
    Remove,
}

impl DiffKind {
    /// Map a server event type (`queryAdd`, ...) to a diff kind.
    pub fn from_event_type(kind: &str) -> Option<Self> {
        match kind {
            events::QUERY_ADD => Some(Self::Add),
            events::QUERY_CHANGE => Some(Self::Change),
            events::QUERY_REMOVE => Some(Self::Remove),
            _ => None,
        }
    }

    /// Server event type carrying this diff.
    pub fn event_type(self) -> &'static str {
        match self {
            Self::Add => events::QUERY_ADD,
            Self::Change => events::QUERY_CHANGE,
            Self::Remove => events::QUERY_REMOVE,
        }
    }

    /// Name of the event a query publishes after applying this diff.
    pub fn published_event(self) -> &'static str {
        match self {
            Self::Add => events::ADD,
            Self::Change => events::CHANGE,
            Self::Remove => events::REMOVE,
        }
    }
}

/// Name-keyed object snapshots.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Mirror {
    objects: ObjectMap,
}

impl Mirror {
    /// Build a mirror from a snapshot list. Objects without a string `name`
    /// are skipped.
    pub fn from_snapshot(objects: impl IntoIterator<Item = Value>) -> Self {
        let mut mirror = Self::default();
        mirror.replace(objects);
        mirror
    }

    /// Replace the whole contents with a snapshot list.
    pub fn replace(&mut self, objects: impl IntoIterator<Item = Value>) {
        self.objects.clear();
        for object in objects {
            match object_name(&object) {
                Some(name) => {
                    let name = name.to_owned();
                    let _ = self.objects.insert(name, object);
                }
                None => warn!(%object, "snapshot object without a name, skipping"),
            }
        }
    }

    /// Apply one diff. Returns `false` (and leaves the mirror untouched) when
    /// the object has no string `name`.
    pub fn apply(&mut self, kind: DiffKind, object: &Value) -> bool {
        let Some(name) = object_name(object) else {
            return false;
        };
        match kind {
            DiffKind::Add | DiffKind::Change => {
                let _ = self.objects.insert(name.to_owned(), object.clone());
            }
            DiffKind::Remove => {
                let _ = self.objects.remove(name);
            }
        }
        true
    }

    /// Current snapshot of `name`.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.objects.get(name)
    }

    /// Borrow the whole map.
    pub fn objects(&self) -> &ObjectMap {
        &self.objects
    }

    /// Consume into the underlying map.
    pub fn into_objects(self) -> ObjectMap {
        self.objects
    }

    /// Number of objects.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Whether the mirror is empty.
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}
