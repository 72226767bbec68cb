//! Typed repository over a raw [`Store`].
//!
//! Key layout:
//! - `session/{session_id}`
//! - `archive/{session_id}`
//! - `result/{session_id}/{seq:06}` (production order)
//! - `checkpoint/{session_id}/{seq:06}`
//! - `request/{request_id}`

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;

use super::Store;
use crate::archive::MasterArchive;
use crate::errors::StoreError;
use crate::human_loop::HumanLoopRequest;
use crate::phase::PhaseResult;
use crate::session::{Checkpoint, Session};

/// Sequenced appends retry this many times when racing another writer.
const MAX_APPEND_ATTEMPTS: usize = 8;

/// A decoded record together with its store-level version.
#[derive(Debug, Clone, PartialEq)]
pub struct Stored<T> {
    pub value: T,
    pub version: u64,
}

#[derive(Clone)]
pub struct StateStore {
    backend: Arc<dyn Store>,
}

fn session_key(session_id: &str) -> String {
    format!("session/{}", session_id)
}

fn archive_key(session_id: &str) -> String {
    format!("archive/{}", session_id)
}

fn results_prefix(session_id: &str) -> String {
    format!("result/{}/", session_id)
}

fn checkpoints_prefix(session_id: &str) -> String {
    format!("checkpoint/{}/", session_id)
}

fn request_key(request_id: &str) -> String {
    format!("request/{}", request_id)
}

impl StateStore {
    pub fn new(backend: Arc<dyn Store>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &Arc<dyn Store> {
        &self.backend
    }

    async fn read<T: DeserializeOwned>(&self, key: &str) -> Result<Option<Stored<T>>, StoreError> {
        match self.backend.get(key).await? {
            Some(record) => {
                let value = serde_json::from_value(record.value).map_err(|source| {
                    StoreError::Serialization {
                        key: key.to_string(),
                        source,
                    }
                })?;
                Ok(Some(Stored {
                    value,
                    version: record.version,
                }))
            }
            None => Ok(None),
        }
    }

    async fn write<T: Serialize>(
        &self,
        key: &str,
        expected: Option<u64>,
        value: &T,
    ) -> Result<u64, StoreError> {
        let json = serde_json::to_value(value).map_err(|source| StoreError::Serialization {
            key: key.to_string(),
            source,
        })?;
        self.backend.compare_and_swap(key, expected, json).await
    }

    async fn list<T: DeserializeOwned>(&self, prefix: &str) -> Result<Vec<T>, StoreError> {
        self.backend
            .list_prefix(prefix)
            .await?
            .into_iter()
            .map(|(key, record)| {
                serde_json::from_value(record.value)
                    .map_err(|source| StoreError::Serialization { key, source })
            })
            .collect()
    }

    // Sessions

    pub async fn create_session(&self, session: &Session) -> Result<u64, StoreError> {
        self.write(&session_key(&session.session_id), None, session)
            .await
    }

    pub async fn load_session(&self, session_id: &str) -> Result<Option<Stored<Session>>, StoreError> {
        self.read(&session_key(session_id)).await
    }

    pub async fn save_session(&self, session: &Session, expected: u64) -> Result<u64, StoreError> {
        self.write(&session_key(&session.session_id), Some(expected), session)
            .await
    }

    /// Every session ever created, including terminal ones.
    pub async fn list_sessions(&self) -> Result<Vec<Session>, StoreError> {
        self.list("session/").await
    }

    // Archives

    pub async fn create_archive(&self, archive: &MasterArchive) -> Result<u64, StoreError> {
        self.write(&archive_key(&archive.session_id), None, archive)
            .await
    }

    pub async fn load_archive(
        &self,
        session_id: &str,
    ) -> Result<Option<Stored<MasterArchive>>, StoreError> {
        self.read(&archive_key(session_id)).await
    }

    pub async fn save_archive(
        &self,
        archive: &MasterArchive,
        expected: u64,
    ) -> Result<u64, StoreError> {
        self.write(&archive_key(&archive.session_id), Some(expected), archive)
            .await
    }

    // Phase results

    /// Store a result under the next sequence number, assigning its
    /// per-phase version. Existing results are never overwritten.
    pub async fn append_result(&self, mut result: PhaseResult) -> Result<PhaseResult, StoreError> {
        let prefix = results_prefix(&result.session_id);
        let mut last_err = None;

        for _ in 0..MAX_APPEND_ATTEMPTS {
            let existing: Vec<PhaseResult> = self.list(&prefix).await?;
            let prior_versions = existing
                .iter()
                .filter(|r| r.phase_id == result.phase_id)
                .map(|r| r.version)
                .max()
                .unwrap_or(0);
            result.version = prior_versions + 1;

            let key = format!("{}{:06}", prefix, existing.len() + 1);
            match self.write(&key, None, &result).await {
                Ok(_) => return Ok(result),
                Err(e @ StoreError::VersionConflict { .. }) => last_err = Some(e),
                Err(e) => return Err(e),
            }
        }

        Err(last_err.unwrap_or_else(|| {
            StoreError::Backend(anyhow::anyhow!("Failed to append phase result"))
        }))
    }

    /// All results for a session in production order.
    pub async fn phase_results(&self, session_id: &str) -> Result<Vec<PhaseResult>, StoreError> {
        self.list(&results_prefix(session_id)).await
    }

    // Checkpoints

    pub async fn write_checkpoint(&self, mut checkpoint: Checkpoint) -> Result<Checkpoint, StoreError> {
        let prefix = checkpoints_prefix(&checkpoint.session_id);
        let mut last_err = None;

        for _ in 0..MAX_APPEND_ATTEMPTS {
            let count = self.backend.list_prefix(&prefix).await?.len() as u64;
            checkpoint.sequence = count + 1;
            let key = format!("{}{:06}", prefix, checkpoint.sequence);
            match self.write(&key, None, &checkpoint).await {
                Ok(_) => return Ok(checkpoint),
                Err(e @ StoreError::VersionConflict { .. }) => last_err = Some(e),
                Err(e) => return Err(e),
            }
        }

        Err(last_err.unwrap_or_else(|| {
            StoreError::Backend(anyhow::anyhow!("Failed to append checkpoint"))
        }))
    }

    pub async fn checkpoints(&self, session_id: &str) -> Result<Vec<Checkpoint>, StoreError> {
        self.list(&checkpoints_prefix(session_id)).await
    }

    /// The authoritative checkpoint for resumption.
    pub async fn latest_checkpoint(&self, session_id: &str) -> Result<Option<Checkpoint>, StoreError> {
        Ok(self.checkpoints(session_id).await?.into_iter().last())
    }

    // Human-loop requests

    pub async fn create_request(&self, request: &HumanLoopRequest) -> Result<u64, StoreError> {
        self.write(&request_key(&request.request_id), None, request)
            .await
    }

    pub async fn load_request(
        &self,
        request_id: &str,
    ) -> Result<Option<Stored<HumanLoopRequest>>, StoreError> {
        self.read(&request_key(request_id)).await
    }

    pub async fn save_request(
        &self,
        request: &HumanLoopRequest,
        expected: u64,
    ) -> Result<u64, StoreError> {
        self.write(&request_key(&request.request_id), Some(expected), request)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::CheckpointReason;
    use crate::store::MemoryStore;
    use chrono::Utc;
    use serde_json::json;

    fn state() -> StateStore {
        StateStore::new(Arc::new(MemoryStore::new()))
    }

    fn result(session_id: &str, phase_id: &str) -> PhaseResult {
        PhaseResult {
            session_id: session_id.into(),
            phase_id: phase_id.into(),
            version: 0,
            payload: json!({"k": phase_id}),
            units_consumed: 10,
            produced_at: Utc::now(),
            required_human_input: false,
            partial: false,
            degraded: false,
        }
    }

    #[tokio::test]
    async fn test_session_create_load_save() {
        let state = state();
        let mut session = Session::new("https://example.com", Utc::now()).unwrap();
        let v1 = state.create_session(&session).await.unwrap();
        assert_eq!(v1, 1);
        assert!(state.create_session(&session).await.is_err());

        session.current_phase_index = 1;
        let v2 = state.save_session(&session, v1).await.unwrap();
        assert!(state.save_session(&session, v1).await.is_err());

        let loaded = state.load_session(&session.session_id).await.unwrap().unwrap();
        assert_eq!(loaded.version, v2);
        assert_eq!(loaded.value.current_phase_index, 1);
        assert_eq!(state.list_sessions().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_append_result_assigns_per_phase_versions() {
        let state = state();
        let a1 = state.append_result(result("s", "01")).await.unwrap();
        let b1 = state.append_result(result("s", "02")).await.unwrap();
        let a2 = state.append_result(result("s", "01")).await.unwrap();
        assert_eq!((a1.version, b1.version, a2.version), (1, 1, 2));

        let all = state.phase_results("s").await.unwrap();
        let order: Vec<_> = all.iter().map(|r| (r.phase_id.as_str(), r.version)).collect();
        assert_eq!(order, vec![("01", 1), ("02", 1), ("01", 2)]);
        assert!(state.phase_results("other").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_latest_checkpoint_is_highest_sequence() {
        let state = state();
        let session = Session::new("https://example.com", Utc::now()).unwrap();
        assert!(state.latest_checkpoint(&session.session_id).await.unwrap().is_none());

        for reason in [CheckpointReason::HumanLoopWait, CheckpointReason::Manual] {
            state
                .write_checkpoint(Checkpoint::snapshot(&session, 0, reason, Utc::now()))
                .await
                .unwrap();
        }
        let latest = state.latest_checkpoint(&session.session_id).await.unwrap().unwrap();
        assert_eq!(latest.sequence, 2);
        assert_eq!(latest.reason, CheckpointReason::Manual);
    }
}
