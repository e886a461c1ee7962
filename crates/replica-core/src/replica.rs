use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::types::{ChangeEvent, Resource, ResourceKey, ResourceList, SyncState};

/// Effect of applying one watch event to a replica.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Object appended to the end of the items.
    Appended,
    /// Object replaced the entry with the same key, keeping its position.
    Replaced,
    /// Entry with the same key removed.
    Removed,
    /// `MODIFIED` for a key the replica does not hold.
    MissingKey,
    /// No mutation (bookmark, error, unknown event, or delete of an absent key).
    Unchanged,
}

impl ApplyOutcome {
    pub fn mutated(&self) -> bool {
        matches!(self, Self::Appended | Self::Replaced | Self::Removed)
    }
}

/// Read-only view of a replica handed to consumers.
#[derive(Debug, Clone)]
pub struct ReplicaSnapshot<T> {
    pub items: Arc<Vec<T>>,
    pub state: SyncState,
    pub resource_version: Option<String>,
}

impl<T> Default for ReplicaSnapshot<T> {
    fn default() -> Self {
        Self {
            items: Arc::new(Vec::new()),
            state: SyncState::Idle,
            resource_version: None,
        }
    }
}

impl<T: Resource> ReplicaSnapshot<T> {
    pub fn keys(&self) -> Vec<ResourceKey> {
        self.items.iter().map(Resource::key).collect()
    }

    pub fn get(&self, key: &ResourceKey) -> Option<&T> {
        self.items.iter().find(|item| &item.key() == key)
    }
}

/// In-memory mirror of one remote collection.
///
/// Items keep server list order; events append, replace in place, or remove.
/// Storage is copy-on-write so snapshots stay valid while the replica moves on.
#[derive(Debug, Clone)]
pub struct Replica<T> {
    items: Arc<Vec<T>>,
    state: SyncState,
    resource_version: Option<String>,
}

impl<T> Default for Replica<T> {
    fn default() -> Self {
        Self {
            items: Arc::new(Vec::new()),
            state: SyncState::Idle,
            resource_version: None,
        }
    }
}

impl<T: Resource> Replica<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn items(&self) -> &[T] {
        &self.items
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn set_state(&mut self, state: SyncState) {
        self.state = state;
    }

    /// Cursor recorded from the last list.
    pub fn resource_version(&self) -> Option<&str> {
        self.resource_version.as_deref()
    }

    pub fn position(&self, key: &ResourceKey) -> Option<usize> {
        self.items.iter().position(|item| &item.key() == key)
    }

    /// Replace all items with a fresh list and mark the replica synced.
    pub fn replace_all(&mut self, list: ResourceList<T>) {
        self.resource_version = list.metadata.resource_version;
        self.items = Arc::new(list.items);
        self.state = SyncState::Synced;
    }

    /// Apply one watch event.
    pub fn apply(&mut self, event: ChangeEvent<T>) -> ApplyOutcome {
        match event {
            ChangeEvent::Added(object) => {
                Arc::make_mut(&mut self.items).push(object);
                ApplyOutcome::Appended
            }
            ChangeEvent::Modified(object) => match self.position(&object.key()) {
                Some(idx) => {
                    Arc::make_mut(&mut self.items)[idx] = object;
                    ApplyOutcome::Replaced
                }
                None => ApplyOutcome::MissingKey,
            },
            ChangeEvent::Deleted(object) => match self.position(&object.key()) {
                Some(idx) => {
                    Arc::make_mut(&mut self.items).remove(idx);
                    ApplyOutcome::Removed
                }
                None => ApplyOutcome::Unchanged,
            },
            ChangeEvent::Bookmark { .. } | ChangeEvent::Error(_) | ChangeEvent::Unknown { .. } => {
                ApplyOutcome::Unchanged
            }
        }
    }

    /// Drop all items and return to `Idle`.
    pub fn reset(&mut self) {
        self.items = Arc::new(Vec::new());
        self.resource_version = None;
        self.state = SyncState::Idle;
    }

    pub fn snapshot(&self) -> ReplicaSnapshot<T> {
        ReplicaSnapshot {
            items: Arc::clone(&self.items),
            state: self.state,
            resource_version: self.resource_version.clone(),
        }
    }
}
