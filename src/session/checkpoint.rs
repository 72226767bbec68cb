//! Durable handover snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckpointReason {
    /// The context budget crossed its threshold after a phase completed.
    BudgetThreshold,
    /// The session suspended waiting for a human-supplied dataset.
    HumanLoopWait,
    /// Requested explicitly by an operator.
    Manual,
}

impl std::fmt::Display for CheckpointReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckpointReason::BudgetThreshold => write!(f, "BUDGET_THRESHOLD"),
            CheckpointReason::HumanLoopWait => write!(f, "HUMAN_LOOP_WAIT"),
            CheckpointReason::Manual => write!(f, "MANUAL"),
        }
    }
}

/// A snapshot from which a session can resume. Only the latest one for a
/// session is authoritative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub session_id: String,
    /// Monotonic per-session sequence number, assigned on write
    pub sequence: u64,
    pub phase_index_to_resume_at: usize,
    pub archive_version_at_snapshot: u64,
    pub context_budget_used_at_snapshot: f64,
    pub reason: CheckpointReason,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn snapshot(
        session: &Session,
        archive_version: u64,
        reason: CheckpointReason,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            session_id: session.session_id.clone(),
            sequence: 0,
            phase_index_to_resume_at: session.current_phase_index,
            archive_version_at_snapshot: archive_version,
            context_budget_used_at_snapshot: session.context_budget_used,
            reason,
            created_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_copies_session_position() {
        let now = Utc::now();
        let mut session = Session::new("https://example.com", now).unwrap();
        session.current_phase_index = 2;
        session.context_budget_used = 0.75;

        let checkpoint = Checkpoint::snapshot(&session, 2, CheckpointReason::BudgetThreshold, now);
        assert_eq!(checkpoint.session_id, session.session_id);
        assert_eq!(checkpoint.phase_index_to_resume_at, 2);
        assert_eq!(checkpoint.archive_version_at_snapshot, 2);
        assert_eq!(checkpoint.context_budget_used_at_snapshot, 0.75);
        assert_eq!(checkpoint.reason.to_string(), "BUDGET_THRESHOLD");
    }
}
