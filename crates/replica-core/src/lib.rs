//! Core contract for list-and-watch resource replicas.
//!
//! This crate defines the resource and event model, the watch line decoder,
//! the replica and its event rules, the synchronizer phase machine, and the
//! channel, retry, error and notification helpers shared by runtimes.

/// Snapshot and event channel primitives.
pub mod channel;
/// Newline-delimited JSON watch event decoding.
pub mod decoder;
/// Stable error payloads and HTTP status classification helpers.
pub mod error;
/// User-facing notification messages for failures.
pub mod notify;
/// In-memory replica and event application rules.
pub mod replica;
/// Backoff policy used between relists.
pub mod retry;
/// Synchronizer phase state machine.
pub mod state_machine;
/// Resource, list, event and phase types.
pub mod types;

pub use channel::{EventStream, SnapshotStream, SyncChannels};
pub use decoder::{EventDecoder, decode_line};
pub use error::{
    ApiError, DecodeError, ErrorCategory, GENERIC_ERROR_LABEL, SyncFailure, classify_http_status,
    error_label,
};
pub use notify::{Notification, NotificationLevel, notify_api_error, notify_sync_failure};
pub use replica::{ApplyOutcome, Replica, ReplicaSnapshot};
pub use retry::{DEFAULT_RELIST_DELAY_MS, RetryPolicy};
pub use state_machine::SyncStateMachine;
pub use types::{
    ChangeEvent, DynamicObject, EventKind, ListMeta, ObjectMeta, Resource, ResourceKey,
    ResourceList, SyncEvent, SyncPhase, SyncState, WatchStatus,
};
