use crate::{error::SyncFailure, types::SyncPhase};

/// Phase bookkeeping for one synchronizer.
///
/// `Idle → Syncing → Watching → (Failed → Syncing)* → Stopped`. Every method
/// either moves to the next phase or reports an invalid transition without
/// changing anything.
#[derive(Debug, Clone, Default)]
pub struct SyncStateMachine {
    phase: SyncPhase,
}

impl SyncStateMachine {
    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    pub fn is_active(&self) -> bool {
        self.phase.is_active()
    }

    /// Begin a protocol run. Only valid from `Idle` or `Stopped`.
    pub fn start(&mut self) -> Result<SyncPhase, SyncFailure> {
        self.transition_from_any_of(
            &[SyncPhase::Idle, SyncPhase::Stopped],
            SyncPhase::Syncing,
            "start",
        )
    }

    /// The list succeeded and the watch is about to open.
    pub fn on_listed(&mut self) -> Result<SyncPhase, SyncFailure> {
        self.transition_from_state(SyncPhase::Syncing, SyncPhase::Watching, "on_listed")
    }

    /// The list failed or the watch ended for any reason but a stop.
    pub fn on_failed(&mut self) -> Result<SyncPhase, SyncFailure> {
        self.transition_from_any_of(
            &[SyncPhase::Syncing, SyncPhase::Watching],
            SyncPhase::Failed,
            "on_failed",
        )
    }

    /// The backoff elapsed; relist.
    pub fn on_retry(&mut self) -> Result<SyncPhase, SyncFailure> {
        self.transition_from_state(SyncPhase::Failed, SyncPhase::Syncing, "on_retry")
    }

    /// Explicit stop. Valid from every phase.
    pub fn stop(&mut self) -> SyncPhase {
        self.phase = SyncPhase::Stopped;
        self.phase
    }

    fn transition_from_state(
        &mut self,
        expected: SyncPhase,
        next: SyncPhase,
        action: &str,
    ) -> Result<SyncPhase, SyncFailure> {
        self.transition_from_any_of(&[expected], next, action)
    }

    fn transition_from_any_of(
        &mut self,
        expected: &[SyncPhase],
        next: SyncPhase,
        action: &str,
    ) -> Result<SyncPhase, SyncFailure> {
        if !expected.contains(&self.phase) {
            return Err(SyncFailure::invalid_state(self.phase, action));
        }
        self.phase = next;
        Ok(next)
    }
}
