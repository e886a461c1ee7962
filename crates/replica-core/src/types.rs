use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{error::SyncFailure, replica::ApplyOutcome};

/// Object metadata fields inspected by the replica.
///
/// Everything else under `metadata` is carried through untouched in `extra`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    /// Object name, unique within its namespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Namespace for namespaced collections, `None` for cluster-scoped ones.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Opaque server-issued version. Passed through, never compared.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
    /// Remaining metadata fields.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Replica identity of a resource.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ResourceKey {
    pub fn new(namespace: Option<&str>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.map(ToOwned::to_owned),
            name: name.into(),
        }
    }

    pub fn from_meta(meta: &ObjectMeta) -> Self {
        Self {
            namespace: meta.namespace.clone(),
            name: meta.name.clone().unwrap_or_default(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(namespace) => write!(f, "{namespace}/{}", self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// A typed record held in a replica.
///
/// Only the identity fields in [`ObjectMeta`] are inspected; the rest of the
/// record is opaque.
pub trait Resource: Clone + Send + Sync + 'static {
    fn metadata(&self) -> &ObjectMeta;

    fn key(&self) -> ResourceKey {
        ResourceKey::from_meta(self.metadata())
    }
}

/// Untyped resource: metadata plus every other top-level field as JSON.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DynamicObject {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl DynamicObject {
    pub fn named(namespace: Option<&str>, name: &str) -> Self {
        Self {
            metadata: ObjectMeta {
                name: Some(name.to_owned()),
                namespace: namespace.map(ToOwned::to_owned),
                ..ObjectMeta::default()
            },
            fields: Map::new(),
        }
    }

    pub fn with_field(mut self, key: &str, value: Value) -> Self {
        self.fields.insert(key.to_owned(), value);
        self
    }
}

impl Resource for DynamicObject {
    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }
}

/// List-level metadata; `resource_version` is the watch cursor.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ListMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
}

/// Response body of a collection list request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceList<T> {
    #[serde(default)]
    pub metadata: ListMeta,
    #[serde(default = "Vec::new")]
    pub items: Vec<T>,
}

impl<T> ResourceList<T> {
    pub fn new(resource_version: Option<&str>, items: Vec<T>) -> Self {
        Self {
            metadata: ListMeta {
                resource_version: resource_version.map(ToOwned::to_owned),
            },
            items,
        }
    }

    pub fn resource_version(&self) -> Option<&str> {
        self.metadata.resource_version.as_deref()
    }
}

/// Kind of a watch event as named on the wire.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EventKind {
    Added,
    Modified,
    Deleted,
    Bookmark,
    Error,
    /// Any `type` string not listed above.
    Unknown,
}

impl EventKind {
    pub fn from_wire(value: &str) -> Self {
        match value {
            "ADDED" => Self::Added,
            "MODIFIED" => Self::Modified,
            "DELETED" => Self::Deleted,
            "BOOKMARK" => Self::Bookmark,
            "ERROR" => Self::Error,
            _ => Self::Unknown,
        }
    }

    pub fn as_wire(&self) -> &'static str {
        match self {
            Self::Added => "ADDED",
            Self::Modified => "MODIFIED",
            Self::Deleted => "DELETED",
            Self::Bookmark => "BOOKMARK",
            Self::Error => "ERROR",
            Self::Unknown => "UNKNOWN",
        }
    }
}

/// Status object carried by `ERROR` watch events.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct WatchStatus {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub code: Option<u16>,
}

/// One decoded watch event.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent<T> {
    Added(T),
    Modified(T),
    Deleted(T),
    /// Cursor checkpoint without an object change.
    Bookmark { resource_version: Option<String> },
    Error(WatchStatus),
    Unknown { event_type: String },
}

impl<T> ChangeEvent<T> {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Added(_) => EventKind::Added,
            Self::Modified(_) => EventKind::Modified,
            Self::Deleted(_) => EventKind::Deleted,
            Self::Bookmark { .. } => EventKind::Bookmark,
            Self::Error(_) => EventKind::Error,
            Self::Unknown { .. } => EventKind::Unknown,
        }
    }

    /// The object carried by `Added`/`Modified`/`Deleted` events.
    pub fn object(&self) -> Option<&T> {
        match self {
            Self::Added(object) | Self::Modified(object) | Self::Deleted(object) => Some(object),
            _ => None,
        }
    }
}

/// Replica-level sync flag exposed to consumers.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum SyncState {
    /// No data yet, or synchronization was stopped.
    #[default]
    Idle,
    /// A list is in flight or the synchronizer is reconnecting.
    Syncing,
    /// Items reflect the last list plus every event applied since.
    Synced,
}

/// Synchronizer protocol phase.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum SyncPhase {
    /// Never started.
    #[default]
    Idle,
    /// Listing the collection.
    Syncing,
    /// Applying events from an open watch.
    Watching,
    /// Waiting out the backoff before the next relist.
    Failed,
    /// Explicitly stopped.
    Stopped,
}

impl SyncPhase {
    /// Whether a protocol run is active in this phase.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Syncing | Self::Watching | Self::Failed)
    }
}

/// Observer-facing events emitted by a synchronizer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum SyncEvent {
    PhaseChanged {
        collection: String,
        phase: SyncPhase,
    },
    /// The replica was replaced wholesale by a fresh list.
    Resynced {
        collection: String,
        resource_version: Option<String>,
        items: usize,
    },
    /// A watch event mutated the replica.
    Applied {
        collection: String,
        kind: EventKind,
        key: ResourceKey,
        outcome: ApplyOutcome,
    },
    /// A watch event contradicted the replica (for example `MODIFIED` for an
    /// unknown key). Not fatal; the next relist heals it.
    Anomaly {
        collection: String,
        kind: EventKind,
        key: Option<ResourceKey>,
        detail: String,
    },
    /// A protocol run ended in failure; the next relist follows in `retry_in_ms`.
    Failure {
        collection: String,
        failure: SyncFailure,
        retry_in_ms: u64,
    },
}
