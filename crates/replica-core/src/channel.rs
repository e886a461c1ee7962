use std::sync::Arc;

use tokio::sync::{broadcast, watch};

use crate::{replica::ReplicaSnapshot, types::SyncEvent};

/// Broadcast event stream type used by sync observers.
pub type EventStream = broadcast::Receiver<SyncEvent>;

/// Latest-snapshot receiver used by replica consumers.
pub type SnapshotStream<T> = watch::Receiver<ReplicaSnapshot<T>>;

/// Snapshot and event channels owned by one synchronizer.
///
/// Snapshots coalesce: a slow consumer only ever sees the newest one. Events
/// fan out to every subscriber in order.
#[derive(Clone, Debug)]
pub struct SyncChannels<T> {
    snapshot_tx: Arc<watch::Sender<ReplicaSnapshot<T>>>,
    event_tx: broadcast::Sender<SyncEvent>,
}

impl<T> SyncChannels<T> {
    pub fn new(event_buffer: usize) -> Self {
        let (snapshot_tx, _) = watch::channel(ReplicaSnapshot::default());
        let (event_tx, _) = broadcast::channel(event_buffer.max(1));
        Self {
            snapshot_tx: Arc::new(snapshot_tx),
            event_tx,
        }
    }

    /// Subscribe to replica snapshots. The receiver starts at the current one.
    pub fn subscribe_snapshots(&self) -> SnapshotStream<T> {
        self.snapshot_tx.subscribe()
    }

    /// Subscribe to sync events emitted from now on.
    pub fn subscribe(&self) -> EventStream {
        self.event_tx.subscribe()
    }

    /// Replace the published snapshot, waking consumers.
    pub fn publish(&self, snapshot: ReplicaSnapshot<T>) {
        self.snapshot_tx.send_replace(snapshot);
    }

    /// Emit an event to all subscribers.
    ///
    /// Emission is best-effort; lagged subscribers are handled by `broadcast`.
    pub fn emit(&self, event: SyncEvent) {
        let _ = self.event_tx.send(event);
    }
}

impl<T: Clone> SyncChannels<T> {
    /// Clone of the currently published snapshot.
    pub fn current(&self) -> ReplicaSnapshot<T> {
        self.snapshot_tx.borrow().clone()
    }
}
