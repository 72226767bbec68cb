//! Typed error hierarchy for the dossier orchestration core.
//!
//! Three top-level enums cover the three seams:
//! - `SessionError`: boundary API failures (create, advance, cancel, fulfill)
//! - `AnalysisError`: failures raised by a phase's analysis collaborator
//! - `StoreError`: persistence failures, including optimistic-version conflicts

use thiserror::Error;

/// Errors surfaced by the session manager's boundary API.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Session {session_id} not found")]
    SessionNotFound { session_id: String },

    #[error("Human-loop request {request_id} not found")]
    RequestNotFound { request_id: String },

    /// The archive moved on since the caller read it. Handled internally by
    /// re-reading and re-merging; never returned from `advance`.
    #[error("Stale archive: expected version {expected}, found {actual}")]
    StaleArchive { expected: u64, actual: u64 },

    #[error("Invalid phase registry: {0}")]
    InvalidRegistry(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors raised by an analysis collaborator.
///
/// Both variants carry the units the failed call consumed so the context
/// budget still accounts for them.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum AnalysisError {
    #[error("Transient analysis failure: {message}")]
    Transient { message: String, units_consumed: u64 },

    #[error("Analysis output failed quality check: {message}")]
    Quality { message: String, units_consumed: u64 },
}

impl AnalysisError {
    pub fn transient(message: impl Into<String>) -> Self {
        AnalysisError::Transient {
            message: message.into(),
            units_consumed: 0,
        }
    }

    pub fn quality(message: impl Into<String>) -> Self {
        AnalysisError::Quality {
            message: message.into(),
            units_consumed: 0,
        }
    }

    pub fn units_consumed(&self) -> u64 {
        match self {
            AnalysisError::Transient { units_consumed, .. }
            | AnalysisError::Quality { units_consumed, .. } => *units_consumed,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, AnalysisError::Transient { .. })
    }
}

/// Errors from the persistence boundary.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Version conflict on {key}: expected {expected:?}, found {actual:?}")]
    VersionConflict {
        key: String,
        expected: Option<u64>,
        actual: Option<u64>,
    },

    #[error("Failed to (de)serialize record {key}: {source}")]
    Serialization {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Storage backend error: {0}")]
    Backend(#[source] anyhow::Error),
}
