//! Session data model and the session state machine.
//!
//! A `Session` is one end-to-end analysis run for a subject URL. It moves
//! through:
//!
//! ```text
//! PENDING -> RUNNING -> {AWAITING_HUMAN_INPUT, CHECKPOINTED} -> RUNNING -> COMPLETED
//!                 \________________ any non-terminal ________________/ -> FAILED
//! ```
//!
//! Everything needed to pick a session back up after a restart lives on the
//! persisted record (status, phase index, budget usage, pending request) plus
//! the latest `Checkpoint`.

mod checkpoint;
mod manager;

pub use checkpoint::{Checkpoint, CheckpointReason};
pub use manager::{SessionManager, SessionManagerBuilder};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::SessionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Pending,
    Running,
    AwaitingHumanInput,
    Checkpointed,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Pending => "PENDING",
            SessionStatus::Running => "RUNNING",
            SessionStatus::AwaitingHumanInput => "AWAITING_HUMAN_INPUT",
            SessionStatus::Checkpointed => "CHECKPOINTED",
            SessionStatus::Completed => "COMPLETED",
            SessionStatus::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a session ended up in `FAILED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    Cancelled,
    AnalysisQuality,
    RetriesExhausted,
    HumanInputTimeout,
    MissingInputs,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionFailure {
    pub kind: FailureKind,
    /// Human-readable reason
    pub reason: String,
    /// Index of the last phase whose result reached the archive, if any
    pub last_completed_phase_index: Option<usize>,
    pub failed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub subject_url: String,
    pub current_phase_index: usize,
    pub status: SessionStatus,
    /// Units consumed in the current budget window
    pub context_units_used: u64,
    /// `context_units_used` as a fraction of the ceiling (may exceed 1.0)
    pub context_budget_used: f64,
    /// Units consumed over the whole session, never reset
    #[serde(default)]
    pub lifetime_units_used: u64,
    /// The open (or just resolved) human-loop request for the current phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_request_id: Option<String>,
    /// Phases finished without their human-supplied dataset
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub degraded_phases: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<SessionFailure>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set when the session reaches a terminal state; the record is kept for audit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
}

impl Session {
    /// Create a `PENDING` session after validating the subject URL.
    pub fn new(subject_url: &str, now: DateTime<Utc>) -> Result<Self, SessionError> {
        let subject_url = validate_subject_url(subject_url)?;
        Ok(Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            subject_url,
            current_phase_index: 0,
            status: SessionStatus::Pending,
            context_units_used: 0,
            context_budget_used: 0.0,
            lifetime_units_used: 0,
            pending_request_id: None,
            degraded_phases: Vec::new(),
            failure: None,
            created_at: now,
            updated_at: now,
            closed_at: None,
        })
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Index of the last phase that reached the archive.
    pub fn last_completed_phase_index(&self) -> Option<usize> {
        self.current_phase_index.checked_sub(1)
    }

    pub(crate) fn complete(&mut self, now: DateTime<Utc>) {
        self.status = SessionStatus::Completed;
        self.pending_request_id = None;
        self.closed_at = Some(now);
    }

    pub(crate) fn fail(&mut self, kind: FailureKind, reason: String, now: DateTime<Utc>) {
        self.failure = Some(SessionFailure {
            kind,
            reason,
            last_completed_phase_index: self.last_completed_phase_index(),
            failed_at: now,
        });
        self.status = SessionStatus::Failed;
        self.closed_at = Some(now);
    }
}

/// Accept only absolute http(s) URLs with a host.
pub fn validate_subject_url(raw: &str) -> Result<String, SessionError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(SessionError::InvalidInput("subject URL is empty".into()));
    }

    let url = reqwest::Url::parse(trimmed)
        .map_err(|e| SessionError::InvalidInput(format!("malformed URL '{}': {}", trimmed, e)))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(SessionError::InvalidInput(format!(
            "unsupported URL scheme '{}' (expected http or https)",
            url.scheme()
        )));
    }
    match url.host_str() {
        Some(host) if !host.is_empty() => Ok(url.to_string()),
        _ => Err(SessionError::InvalidInput(format!(
            "URL '{}' has no host",
            trimmed
        ))),
    }
}
