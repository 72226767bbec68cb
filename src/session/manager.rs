//! The session state machine.
//!
//! `SessionManager::advance` is the single step function that moves a
//! session forward. It is pull-based: nothing in here spawns timers or
//! background tasks, and every piece of state it needs is read back from the
//! store on each call, so a restarted process takes the same next step.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::{debug, error, info, warn};

use super::{Checkpoint, CheckpointReason, FailureKind, Session, SessionStatus};
use crate::archive::{ArchiveStore, MasterArchive};
use crate::clock::{Clock, SystemClock};
use crate::config::{DossierConfig, TimeoutFallback};
use crate::context::ContextMonitor;
use crate::errors::{SessionError, StoreError};
use crate::executor::{Analyzer, HumanInput, PhaseExecutor, PhaseFailure, PhaseOutcome};
use crate::human_loop::{
    HumanLoopCoordinator, HumanLoopRequest, Notifier, NullNotifier, RequestStatus, WebhookNotifier,
};
use crate::phase::{PhaseDef, PhaseRegistry, PhaseResult};
use crate::store::{MemoryStore, StateStore, Store, Stored};

type SessionLocks = Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>;

/// What the pending human-loop request says about the current phase.
enum Resolution {
    StillWaiting,
    Resume(HumanInput),
    /// No request on record; run the phase's prepare stage again
    Reprepare,
    Failed,
}

/// Result of applying one step to an in-memory session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Unchanged,
    Changed,
    /// Another worker moved the archive while this one ran the phase; the
    /// in-memory session is stale and must not be saved.
    Superseded,
}

pub struct SessionManager {
    state: StateStore,
    archives: ArchiveStore,
    executor: PhaseExecutor,
    coordinator: HumanLoopCoordinator,
    registry: PhaseRegistry,
    config: DossierConfig,
    clock: Arc<dyn Clock>,
    locks: SessionLocks,
}

impl SessionManager {
    pub fn builder() -> SessionManagerBuilder {
        SessionManagerBuilder::default()
    }

    pub fn registry(&self) -> &PhaseRegistry {
        &self.registry
    }

    pub fn config(&self) -> &DossierConfig {
        &self.config
    }

    pub fn monitor(&self) -> &ContextMonitor {
        self.executor.monitor()
    }

    // Boundary API

    /// Create a `PENDING` session with an empty archive at version 0.
    pub async fn create_session(&self, subject_url: &str) -> Result<Session, SessionError> {
        let session = Session::new(subject_url, self.clock.now())?;
        self.archives.init(&session.session_id).await?;
        self.state.create_session(&session).await?;

        info!(
            session_id = %session.session_id,
            subject_url = %session.subject_url,
            phases = self.registry.len(),
            "Session created"
        );
        Ok(session)
    }

    /// Drive the session one step forward and return its resulting status.
    ///
    /// Terminal sessions are returned untouched. A session waiting on a
    /// request that is neither resolved nor overdue is also returned
    /// untouched; the caller should try again later.
    pub async fn advance(&self, session_id: &str) -> Result<SessionStatus, SessionError> {
        let lock = self.session_lock(session_id);
        let _guard = lock.lock().await;

        let Stored {
            value: mut session,
            version,
        } = self.load_stored(session_id).await?;

        if session.is_terminal() {
            debug!(session_id, status = %session.status, "Session already terminal");
            self.release_lock(session_id);
            return Ok(session.status);
        }

        let before = session.status;
        match self.step(&mut session).await? {
            Step::Unchanged => return Ok(session.status),
            Step::Superseded => {
                let current = self.load_stored(session_id).await?.value;
                warn!(
                    session_id,
                    status = %current.status,
                    phase_index = current.current_phase_index,
                    "Phase result superseded by another worker; keeping stored state"
                );
                if current.is_terminal() {
                    self.release_lock(session_id);
                }
                return Ok(current.status);
            }
            Step::Changed => {}
        }

        let status = self.persist(&mut session, version).await?;
        if status != before {
            info!(session_id, from = %before, to = %status, "Session transition");
        }
        if status.is_terminal() {
            self.release_lock(session_id);
        }
        Ok(status)
    }

    /// Fail a non-terminal session with reason `CANCELLED`. Waits for any
    /// in-flight `advance` on the same session, so it can never land between
    /// a phase finishing and its merge committing.
    pub async fn cancel(&self, session_id: &str) -> Result<SessionStatus, SessionError> {
        let lock = self.session_lock(session_id);
        let _guard = lock.lock().await;

        let Stored {
            value: mut session,
            version,
        } = self.load_stored(session_id).await?;
        if session.is_terminal() {
            return Ok(session.status);
        }

        session.fail(FailureKind::Cancelled, "CANCELLED".into(), self.clock.now());
        let status = self.persist(&mut session, version).await?;
        info!(session_id, "Session cancelled");
        self.release_lock(session_id);
        Ok(status)
    }

    /// Deliver the externally researched dataset for a request. Repeated or
    /// late calls are no-ops.
    pub async fn fulfill_request(&self, request_id: &str, payload: Value) -> Result<(), SessionError> {
        self.coordinator.fulfill_request(request_id, payload).await?;
        Ok(())
    }

    /// Write a `MANUAL` checkpoint. A pending or running session is marked
    /// `CHECKPOINTED` so another worker may pick it up; a session awaiting
    /// human input keeps waiting.
    pub async fn checkpoint(&self, session_id: &str) -> Result<Checkpoint, SessionError> {
        let lock = self.session_lock(session_id);
        let _guard = lock.lock().await;

        let Stored {
            value: mut session,
            version,
        } = self.load_stored(session_id).await?;
        if session.is_terminal() {
            return Err(SessionError::InvalidInput(format!(
                "Session {} is {} and cannot be checkpointed",
                session_id, session.status
            )));
        }

        let archive = self.archives.load(session_id).await?;
        let checkpoint = self
            .write_checkpoint(&session, archive.version, CheckpointReason::Manual)
            .await?;

        if matches!(session.status, SessionStatus::Pending | SessionStatus::Running) {
            session.status = SessionStatus::Checkpointed;
            self.persist(&mut session, version).await?;
        }
        Ok(checkpoint)
    }

    // Inspection

    pub async fn session(&self, session_id: &str) -> Result<Session, SessionError> {
        Ok(self.load_stored(session_id).await?.value)
    }

    pub async fn list_sessions(&self) -> Result<Vec<Session>, SessionError> {
        Ok(self.state.list_sessions().await?)
    }

    pub async fn archive(&self, session_id: &str) -> Result<MasterArchive, SessionError> {
        self.load_stored(session_id).await?;
        self.archives.load(session_id).await
    }

    pub async fn latest_checkpoint(&self, session_id: &str) -> Result<Option<Checkpoint>, SessionError> {
        Ok(self.state.latest_checkpoint(session_id).await?)
    }

    pub async fn checkpoints(&self, session_id: &str) -> Result<Vec<Checkpoint>, SessionError> {
        Ok(self.state.checkpoints(session_id).await?)
    }

    /// The request the session is (or was last) waiting on.
    pub async fn pending_request(
        &self,
        session_id: &str,
    ) -> Result<Option<HumanLoopRequest>, SessionError> {
        let session = self.session(session_id).await?;
        match session.pending_request_id {
            Some(id) => Ok(Some(self.coordinator.load(&id).await?)),
            None => Ok(None),
        }
    }

    pub async fn phase_results(&self, session_id: &str) -> Result<Vec<PhaseResult>, SessionError> {
        Ok(self.state.phase_results(session_id).await?)
    }

    // State machine

    /// Apply one transition to `session` in memory.
    async fn step(&self, session: &mut Session) -> Result<Step, SessionError> {
        let mut human_input = None;

        match session.status {
            SessionStatus::AwaitingHumanInput => match self.resolve_pending(session).await? {
                Resolution::StillWaiting => return Ok(Step::Unchanged),
                Resolution::Failed => return Ok(Step::Changed),
                Resolution::Resume(input) => human_input = Some(input),
                Resolution::Reprepare => {}
            },
            SessionStatus::Checkpointed => self.resume_from_checkpoint(session).await?,
            SessionStatus::Pending | SessionStatus::Running => {}
            SessionStatus::Completed | SessionStatus::Failed => return Ok(Step::Unchanged),
        }
        session.status = SessionStatus::Running;

        let index = session.current_phase_index;
        let Some(phase) = self.registry.get(index).cloned() else {
            self.finish_or_checkpoint(session, 0).await?;
            return Ok(Step::Changed);
        };

        let archive = self.archives.load(&session.session_id).await?;

        // A previous process merged this phase but died before saving the
        // session; move on without running it again.
        if archive.has_merged_phase(&phase.id) {
            warn!(
                session_id = %session.session_id,
                phase = %phase.id,
                "Phase already merged; skipping re-execution"
            );
            session.pending_request_id = None;
            session.current_phase_index += 1;
            self.finish_or_checkpoint(session, archive.version).await?;
            return Ok(Step::Changed);
        }

        let outcome = self
            .executor
            .run_phase(session, &phase, &archive, human_input)
            .await;

        match outcome {
            PhaseOutcome::Completed(result) => {
                return self.complete_phase(session, &phase, archive.version, result).await;
            }
            PhaseOutcome::NeedsHumanInput {
                partial,
                request_payload,
            } => {
                if self.archive_moved(&session.session_id, &phase, archive.version).await? {
                    return Ok(Step::Superseded);
                }
                self.state.append_result(partial).await?;
                let timeout = phase
                    .human_timeout_minutes
                    .unwrap_or(self.config.human_loop.timeout_minutes);
                self.coordinator
                    .open_request(session, &phase.id, request_payload, timeout)
                    .await?;
                self.write_checkpoint(session, archive.version, CheckpointReason::HumanLoopWait)
                    .await?;
            }
            PhaseOutcome::Failed {
                failure,
                units_consumed,
            } => {
                let kind = match &failure {
                    PhaseFailure::MissingInputs(_) => FailureKind::MissingInputs,
                    PhaseFailure::Quality(_) => FailureKind::AnalysisQuality,
                    PhaseFailure::RetriesExhausted { .. } => FailureKind::RetriesExhausted,
                };
                let reason = format!("Phase {} ({}) failed: {}", phase.id, phase.name, failure);
                error!(
                    session_id = %session.session_id,
                    phase = %phase.id,
                    units_consumed,
                    reason = %reason,
                    "Phase failed"
                );
                session.fail(kind, reason, self.clock.now());
            }
        }

        Ok(Step::Changed)
    }

    /// Check the open request: poll its deadline, then act on its status.
    async fn resolve_pending(&self, session: &mut Session) -> Result<Resolution, SessionError> {
        let Some(request_id) = session.pending_request_id.clone() else {
            warn!(
                session_id = %session.session_id,
                "Awaiting human input with no pending request; preparing the phase again"
            );
            return Ok(Resolution::Reprepare);
        };

        self.coordinator.poll_timeout(&request_id).await?;
        let request = self.coordinator.load(&request_id).await?;

        let Some(phase) = self.registry.get_by_id(&request.phase_id) else {
            return Err(SessionError::InvalidRegistry(format!(
                "request {} names unknown phase {}",
                request_id, request.phase_id
            )));
        };

        match request.status {
            RequestStatus::Waiting => {
                debug!(
                    session_id = %session.session_id,
                    request_id = %request_id,
                    timeout_at = %request.timeout_at,
                    "Still waiting for human input"
                );
                Ok(Resolution::StillWaiting)
            }
            RequestStatus::Fulfilled => {
                info!(
                    session_id = %session.session_id,
                    phase = %phase.id,
                    "Human input received; resuming phase"
                );
                Ok(Resolution::Resume(HumanInput::Supplied {
                    request: request.request_payload,
                    data: request.fulfilled_payload.unwrap_or(Value::Null),
                }))
            }
            RequestStatus::TimedOut => {
                if self.is_mandatory(phase) {
                    let reason = format!(
                        "Human input timeout on phase {} ({}): no data received before {}",
                        phase.id,
                        phase.name,
                        request.timeout_at.to_rfc3339()
                    );
                    error!(session_id = %session.session_id, phase = %phase.id, "{}", reason);
                    session.fail(FailureKind::HumanInputTimeout, reason, self.clock.now());
                    Ok(Resolution::Failed)
                } else {
                    warn!(
                        session_id = %session.session_id,
                        phase = %phase.id,
                        "Human input timed out; continuing in degraded mode"
                    );
                    Ok(Resolution::Resume(HumanInput::Unavailable {
                        request: request.request_payload,
                    }))
                }
            }
        }
    }

    async fn resume_from_checkpoint(&self, session: &mut Session) -> Result<(), SessionError> {
        if let Some(checkpoint) = self.state.latest_checkpoint(&session.session_id).await?
            && checkpoint.phase_index_to_resume_at != session.current_phase_index
        {
            warn!(
                session_id = %session.session_id,
                checkpoint_index = checkpoint.phase_index_to_resume_at,
                session_index = session.current_phase_index,
                "Latest checkpoint disagrees with session record; using session record"
            );
        }

        let reset = self.monitor().begin_window(session);
        info!(
            session_id = %session.session_id,
            phase_index = session.current_phase_index,
            budget_reset = reset,
            "Resuming from checkpoint"
        );
        Ok(())
    }

    /// Append the final result, merge it into the archive version the phase
    /// ran against, and move to the next phase.
    ///
    /// If another worker moved the archive in the meantime the result is
    /// dropped: merging it would land out of phase order.
    async fn complete_phase(
        &self,
        session: &mut Session,
        phase: &PhaseDef,
        seen_version: u64,
        result: PhaseResult,
    ) -> Result<Step, SessionError> {
        if self.archive_moved(&session.session_id, phase, seen_version).await? {
            return Ok(Step::Superseded);
        }

        let stored = self.state.append_result(result).await?;
        let archive = match self.archives.commit(&session.session_id, seen_version, &stored).await {
            Ok(archive) => archive,
            Err(SessionError::StaleArchive { expected, actual }) => {
                warn!(
                    session_id = %session.session_id,
                    phase = %phase.id,
                    version = stored.version,
                    expected,
                    actual,
                    "Archive moved during commit; result not merged"
                );
                return Ok(Step::Superseded);
            }
            Err(e) => return Err(e),
        };

        if stored.degraded && !session.degraded_phases.contains(&phase.id) {
            session.degraded_phases.push(phase.id.clone());
        }
        session.pending_request_id = None;
        session.current_phase_index += 1;

        info!(
            session_id = %session.session_id,
            phase = %phase.id,
            version = stored.version,
            units = stored.units_consumed,
            archive_version = archive.version,
            budget_used = session.context_budget_used,
            "Phase completed"
        );

        self.finish_or_checkpoint(session, archive.version).await?;
        Ok(Step::Changed)
    }

    /// True when the archive is no longer at `seen_version`, i.e. another
    /// worker merged something since this phase started.
    async fn archive_moved(
        &self,
        session_id: &str,
        phase: &PhaseDef,
        seen_version: u64,
    ) -> Result<bool, SessionError> {
        let current = self.archives.load(session_id).await?;
        if current.version == seen_version {
            return Ok(false);
        }
        debug!(
            session_id,
            phase = %phase.id,
            seen_version,
            current_version = current.version,
            already_merged = current.has_merged_phase(&phase.id),
            "Archive moved while phase was running"
        );
        Ok(true)
    }

    /// After a phase: complete if it was the last one, otherwise hand over
    /// when the budget threshold has been crossed.
    async fn finish_or_checkpoint(
        &self,
        session: &mut Session,
        archive_version: u64,
    ) -> Result<(), SessionError> {
        if session.current_phase_index >= self.registry.len() {
            session.complete(self.clock.now());
            info!(
                session_id = %session.session_id,
                lifetime_units = session.lifetime_units_used,
                degraded = session.degraded_phases.len(),
                "Session completed"
            );
            return Ok(());
        }

        if self.monitor().should_checkpoint(session) {
            self.write_checkpoint(session, archive_version, CheckpointReason::BudgetThreshold)
                .await?;
            session.status = SessionStatus::Checkpointed;
        } else {
            session.status = SessionStatus::Running;
        }
        Ok(())
    }

    async fn write_checkpoint(
        &self,
        session: &Session,
        archive_version: u64,
        reason: CheckpointReason,
    ) -> Result<Checkpoint, SessionError> {
        let checkpoint = self
            .state
            .write_checkpoint(Checkpoint::snapshot(
                session,
                archive_version,
                reason,
                self.clock.now(),
            ))
            .await?;
        info!(
            session_id = %session.session_id,
            sequence = checkpoint.sequence,
            %reason,
            resume_at = checkpoint.phase_index_to_resume_at,
            "{}",
            self.monitor().status_summary(session)
        );
        Ok(checkpoint)
    }

    fn is_mandatory(&self, phase: &PhaseDef) -> bool {
        phase
            .mandatory_human_input
            .unwrap_or(self.config.human_loop.fallback == TimeoutFallback::Fail)
    }

    /// Save with the version we loaded. Losing the race means another worker
    /// already advanced the session; report what it wrote.
    async fn persist(&self, session: &mut Session, version: u64) -> Result<SessionStatus, SessionError> {
        session.updated_at = self.clock.now();
        match self.state.save_session(session, version).await {
            Ok(_) => Ok(session.status),
            Err(StoreError::VersionConflict { .. }) => {
                let current = self.load_stored(&session.session_id).await?.value;
                warn!(
                    session_id = %session.session_id,
                    status = %current.status,
                    "Session was updated concurrently; keeping stored state"
                );
                *session = current;
                Ok(session.status)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn load_stored(&self, session_id: &str) -> Result<Stored<Session>, SessionError> {
        self.state
            .load_session(session_id)
            .await?
            .ok_or_else(|| SessionError::SessionNotFound {
                session_id: session_id.to_string(),
            })
    }

    fn session_lock(&self, session_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Drop the lock entry once a session is terminal; every later call on
    /// it is read-only.
    fn release_lock(&self, session_id: &str) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.remove(session_id);
    }
}

/// Assembles a [`SessionManager`]. Only the analyzer is required.
#[derive(Default)]
pub struct SessionManagerBuilder {
    store: Option<Arc<dyn Store>>,
    analyzer: Option<Arc<dyn Analyzer>>,
    registry: Option<PhaseRegistry>,
    notifier: Option<Arc<dyn Notifier>>,
    clock: Option<Arc<dyn Clock>>,
    config: DossierConfig,
}

impl SessionManagerBuilder {
    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn analyzer(mut self, analyzer: Arc<dyn Analyzer>) -> Self {
        self.analyzer = Some(analyzer);
        self
    }

    pub fn registry(mut self, registry: PhaseRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn config(mut self, config: DossierConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<SessionManager, SessionError> {
        let analyzer = self
            .analyzer
            .ok_or_else(|| SessionError::InvalidInput("an analyzer is required".into()))?;
        let config = self.config;

        for warning in config.validate() {
            warn!("Config: {}", warning);
        }

        let store = self.store.unwrap_or_else(|| Arc::new(MemoryStore::new()));
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let notifier: Arc<dyn Notifier> = match self.notifier {
            Some(notifier) => notifier,
            None if config.notify.chat_webhook.is_some() || config.notify.email_webhook.is_some() => {
                Arc::new(WebhookNotifier::from_config(&config.notify)?)
            }
            None => Arc::new(NullNotifier),
        };
        let registry = self
            .registry
            .unwrap_or_else(PhaseRegistry::default_pipeline)
            .with_config(&config);
        let monitor = ContextMonitor::from_config(&config.budget)?;

        let state = StateStore::new(store);
        let executor = PhaseExecutor::new(analyzer, monitor, config.retry.clone(), clock.clone());
        let coordinator = HumanLoopCoordinator::new(state.clone(), notifier, clock.clone());

        Ok(SessionManager {
            archives: ArchiveStore::new(state.clone()),
            state,
            executor,
            coordinator,
            registry,
            config,
            clock,
            locks: Mutex::new(HashMap::new()),
        })
    }
}
