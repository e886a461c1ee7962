use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use replica_core::{
    ApplyOutcome, ChangeEvent, ErrorCategory, EventStream, Replica, ReplicaSnapshot, Resource,
    RetryPolicy, SnapshotStream, SyncChannels, SyncEvent, SyncFailure, SyncPhase, SyncState,
    SyncStateMachine,
};
use serde::{Serialize, de::DeserializeOwned};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::{
    client::{DEFAULT_LIST_TIMEOUT_SECONDS, ResourceClient},
    watch::WatchEnd,
};

const DEFAULT_EVENT_BUFFER: usize = 256;

/// Tuning for one [`Synchronizer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncOptions {
    /// Delay between a failed run and the next relist.
    pub retry: RetryPolicy,
    /// `timeoutSeconds` sent with every list.
    pub list_timeout_seconds: u32,
    /// Capacity of the broadcast channel behind [`Synchronizer::subscribe`].
    pub event_buffer: usize,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            list_timeout_seconds: DEFAULT_LIST_TIMEOUT_SECONDS,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

impl SyncOptions {
    pub fn with_backoff(mut self, delay: Duration) -> Self {
        self.retry = RetryPolicy::fixed(delay);
        self
    }
}

#[derive(Debug)]
struct RunningSync {
    run_id: Uuid,
    stop: CancellationToken,
    task: JoinHandle<()>,
}

enum RunEnd {
    Stopped,
    Failed(SyncFailure),
}

struct Shared<T> {
    client: ResourceClient<T>,
    collection: String,
    options: SyncOptions,
    channels: SyncChannels<T>,
    machine: Mutex<SyncStateMachine>,
    running: tokio::sync::Mutex<Option<RunningSync>>,
}

/// Keeps an in-memory replica of one collection in step with the server.
///
/// Lists the collection, watches from the list's resource version, applies
/// each event, and relists after a fixed backoff whenever the watch ends.
/// Runs until [`Synchronizer::stop`]. Clones share the same run.
pub struct Synchronizer<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Synchronizer<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> std::fmt::Debug for Synchronizer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Synchronizer")
            .field("collection", &self.shared.collection)
            .field("options", &self.shared.options)
            .finish_non_exhaustive()
    }
}

impl<T> Synchronizer<T>
where
    T: Resource + Serialize + DeserializeOwned,
{
    pub fn new(client: ResourceClient<T>, options: SyncOptions) -> Self {
        let client = client.with_list_timeout_seconds(options.list_timeout_seconds);
        let collection = client.collection().path(client.namespace());
        Self {
            shared: Arc::new(Shared {
                client,
                collection,
                options,
                channels: SyncChannels::new(options.event_buffer),
                machine: Mutex::new(SyncStateMachine::default()),
                running: tokio::sync::Mutex::new(None),
            }),
        }
    }

    /// Collection path this synchronizer mirrors.
    pub fn collection(&self) -> &str {
        &self.shared.collection
    }

    /// Client for one-shot calls against the same collection.
    pub fn client(&self) -> &ResourceClient<T> {
        &self.shared.client
    }

    pub fn phase(&self) -> SyncPhase {
        self.shared.machine().phase()
    }

    pub fn snapshot(&self) -> ReplicaSnapshot<T> {
        self.shared.channels.current()
    }

    pub fn items(&self) -> Arc<Vec<T>> {
        self.snapshot().items
    }

    pub fn subscribe_snapshots(&self) -> SnapshotStream<T> {
        self.shared.channels.subscribe_snapshots()
    }

    pub fn subscribe(&self) -> EventStream {
        self.shared.channels.subscribe()
    }

    /// Start a protocol run in the background.
    ///
    /// Returns `false` without side effects when a run is already active.
    pub async fn sync(&self) -> bool {
        let mut running = self.shared.running.lock().await;
        if running.is_some() {
            debug!(collection = %self.shared.collection, "sync already running");
            return false;
        }

        let phase = match self.shared.transition(SyncStateMachine::start) {
            Ok(phase) => phase,
            Err(failure) => {
                warn!(
                    collection = %self.shared.collection,
                    code = %failure.code,
                    "{}",
                    failure.message
                );
                return false;
            }
        };
        self.shared.emit_phase(phase);

        let run_id = Uuid::new_v4();
        let stop = CancellationToken::new();
        let task = tokio::spawn(run_protocol(
            Arc::clone(&self.shared),
            stop.child_token(),
            run_id,
        ));
        info!(%run_id, collection = %self.shared.collection, "sync started");

        *running = Some(RunningSync { run_id, stop, task });
        true
    }

    /// Stop the active run, wait for it, and reset the replica to empty.
    ///
    /// Returns whether a run was active. A later [`Synchronizer::sync`]
    /// starts over with a fresh list.
    pub async fn stop(&self) -> bool {
        let mut running = self.shared.running.lock().await;
        // A run that finishes normally publishes its own reset replica.
        let (was_running, reset_by_run) = match running.take() {
            Some(run) => {
                run.stop.cancel();
                let joined = match run.task.await {
                    Ok(()) => true,
                    Err(err) => {
                        warn!(
                            run_id = %run.run_id,
                            collection = %self.shared.collection,
                            "sync task ended abnormally: {err}"
                        );
                        false
                    }
                };
                info!(run_id = %run.run_id, collection = %self.shared.collection, "sync stopped");
                (true, joined)
            }
            None => (false, false),
        };

        let (previous, phase) = {
            let mut machine = self.shared.machine();
            (machine.phase(), machine.stop())
        };
        if !reset_by_run {
            self.shared.channels.publish(ReplicaSnapshot::default());
        }
        if previous != phase {
            self.shared.emit_phase(phase);
        }
        was_running
    }
}

impl<T> Shared<T>
where
    T: Resource + Serialize + DeserializeOwned,
{
    fn machine(&self) -> std::sync::MutexGuard<'_, SyncStateMachine> {
        self.machine.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(
        &self,
        step: impl FnOnce(&mut SyncStateMachine) -> Result<SyncPhase, SyncFailure>,
    ) -> Result<SyncPhase, SyncFailure> {
        step(&mut self.machine())
    }

    fn emit_phase(&self, phase: SyncPhase) {
        debug!(collection = %self.collection, ?phase, "phase changed");
        self.channels.emit(SyncEvent::PhaseChanged {
            collection: self.collection.clone(),
            phase,
        });
    }

    fn advance(&self, step: impl FnOnce(&mut SyncStateMachine) -> Result<SyncPhase, SyncFailure>) {
        match self.transition(step) {
            Ok(phase) => self.emit_phase(phase),
            Err(failure) => warn!(
                collection = %self.collection,
                code = %failure.code,
                "{}",
                failure.message
            ),
        }
    }

    /// One list followed by one watch. Returns when the watch ends.
    async fn list_and_watch(
        &self,
        replica: &mut Replica<T>,
        stop: &CancellationToken,
        run_id: Uuid,
    ) -> RunEnd {
        replica.set_state(SyncState::Syncing);
        self.channels.publish(replica.snapshot());

        let listed = tokio::select! {
            biased;
            _ = stop.cancelled() => return RunEnd::Stopped,
            listed = self.client.list() => listed,
        };
        let list = match listed {
            Ok(list) => list,
            Err(err) => return RunEnd::Failed(SyncFailure::from(&err)),
        };
        if stop.is_cancelled() {
            return RunEnd::Stopped;
        }

        replica.replace_all(list);
        let cursor = replica.resource_version().map(ToOwned::to_owned);
        info!(
            %run_id,
            collection = %self.collection,
            resource_version = cursor.as_deref().unwrap_or(""),
            items = replica.items().len(),
            "collection listed"
        );
        self.channels.publish(replica.snapshot());
        self.channels.emit(SyncEvent::Resynced {
            collection: self.collection.clone(),
            resource_version: cursor.clone(),
            items: replica.items().len(),
        });
        if let Err(failure) = self.transition(SyncStateMachine::on_listed) {
            return RunEnd::Failed(failure);
        }
        self.emit_phase(SyncPhase::Watching);

        let watched = self
            .client
            .watch(
                |event| self.apply_event(replica, event, run_id),
                cursor.as_deref(),
                stop.clone(),
            )
            .await;

        match watched {
            Ok(WatchEnd::Cancelled) => RunEnd::Stopped,
            Ok(WatchEnd::Closed) => RunEnd::Failed(SyncFailure::new(
                ErrorCategory::Transport,
                "watch_closed",
                format!("watch on {} closed by server", self.collection),
            )),
            Err(_) if stop.is_cancelled() => RunEnd::Stopped,
            Err(err) => RunEnd::Failed(SyncFailure::from(&err)),
        }
    }

    fn apply_event(&self, replica: &mut Replica<T>, event: ChangeEvent<T>, run_id: Uuid) {
        let kind = event.kind();
        let key = event.object().map(Resource::key);
        match &event {
            ChangeEvent::Bookmark { resource_version } => {
                trace!(%run_id, collection = %self.collection, ?resource_version, "bookmark");
            }
            ChangeEvent::Error(status) => {
                warn!(
                    %run_id,
                    collection = %self.collection,
                    code = ?status.code,
                    reason = ?status.reason,
                    message = ?status.message,
                    "watch reported an error event"
                );
            }
            ChangeEvent::Unknown { event_type } => {
                warn!(
                    %run_id,
                    collection = %self.collection,
                    %event_type,
                    "ignoring unknown watch event"
                );
            }
            _ => {}
        }

        let outcome = replica.apply(event);
        if outcome == ApplyOutcome::MissingKey {
            let detail = "modified object is not in the replica".to_owned();
            warn!(
                %run_id,
                collection = %self.collection,
                key = %key.as_ref().map(ToString::to_string).unwrap_or_default(),
                "{detail}"
            );
            self.channels.emit(SyncEvent::Anomaly {
                collection: self.collection.clone(),
                kind,
                key,
                detail,
            });
            return;
        }
        if !outcome.mutated() {
            return;
        }

        self.channels.publish(replica.snapshot());
        if let Some(key) = key {
            trace!(%run_id, collection = %self.collection, %key, ?outcome, "event applied");
            self.channels.emit(SyncEvent::Applied {
                collection: self.collection.clone(),
                kind,
                key,
                outcome,
            });
        }
    }
}

async fn run_protocol<T>(shared: Arc<Shared<T>>, stop: CancellationToken, run_id: Uuid)
where
    T: Resource + Serialize + DeserializeOwned,
{
    let mut replica = Replica::new();
    let mut attempt: u32 = 0;

    loop {
        let failure = match shared.list_and_watch(&mut replica, &stop, run_id).await {
            RunEnd::Stopped => break,
            RunEnd::Failed(failure) => failure,
        };
        if replica.state() == SyncState::Synced {
            attempt = 0;
        }

        shared.advance(SyncStateMachine::on_failed);
        let delay = shared.options.retry.delay_for_attempt(attempt);
        attempt = attempt.saturating_add(1);

        replica.set_state(SyncState::Syncing);
        shared.channels.publish(replica.snapshot());
        warn!(
            %run_id,
            collection = %shared.collection,
            code = %failure.code,
            retry_in_ms = delay.as_millis() as u64,
            "sync failed: {}",
            failure.message
        );
        shared.channels.emit(SyncEvent::Failure {
            collection: shared.collection.clone(),
            failure,
            retry_in_ms: delay.as_millis() as u64,
        });

        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
        shared.advance(SyncStateMachine::on_retry);
    }

    replica.reset();
    shared.channels.publish(replica.snapshot());
    debug!(%run_id, collection = %shared.collection, "sync run finished");
}
