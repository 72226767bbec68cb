use tracing::{debug, info};

use super::{MasterArchive, merge};
use crate::errors::{SessionError, StoreError};
use crate::phase::PhaseResult;
use crate::store::{StateStore, Stored};

/// Versioned, persisted archive per session.
#[derive(Clone)]
pub struct ArchiveStore {
    state: StateStore,
}

impl ArchiveStore {
    pub fn new(state: StateStore) -> Self {
        Self { state }
    }

    /// Create the empty archive for a new session.
    pub async fn init(&self, session_id: &str) -> Result<MasterArchive, SessionError> {
        let archive = MasterArchive::new(session_id);
        self.state.create_archive(&archive).await?;
        Ok(archive)
    }

    /// Current archive, or an empty one if nothing was ever written.
    pub async fn load(&self, session_id: &str) -> Result<MasterArchive, SessionError> {
        Ok(self
            .state
            .load_archive(session_id)
            .await?
            .map(|s| s.value)
            .unwrap_or_else(|| MasterArchive::new(session_id)))
    }

    /// Merge `result` into the archive the caller last saw at
    /// `expected_version`.
    ///
    /// Committing a result that is already merged returns the current
    /// archive unchanged. Otherwise the commit is rejected with
    /// [`SessionError::StaleArchive`] when the archive has moved on, either
    /// before the merge or by a concurrent writer during it.
    pub async fn commit(
        &self,
        session_id: &str,
        expected_version: u64,
        result: &PhaseResult,
    ) -> Result<MasterArchive, SessionError> {
        if result.partial {
            return Err(SessionError::InvalidInput(format!(
                "Partial result for phase {} cannot be merged",
                result.phase_id
            )));
        }

        let current = self.load_stored(session_id).await?;
        let (archive, store_version) = match current {
            Some(stored) => (stored.value, Some(stored.version)),
            None => (MasterArchive::new(session_id), None),
        };

        if archive.has_merged(&result.phase_id, result.version) {
            debug!(
                session_id,
                phase_id = %result.phase_id,
                version = archive.version,
                "Result already merged"
            );
            return Ok(archive);
        }

        if archive.version != expected_version {
            return Err(SessionError::StaleArchive {
                expected: expected_version,
                actual: archive.version,
            });
        }

        let next = merge(&archive, result);
        let written = match store_version {
            Some(v) => self.state.save_archive(&next, v).await,
            None => self.state.create_archive(&next).await,
        };

        match written {
            Ok(_) => {
                info!(
                    session_id,
                    phase_id = %result.phase_id,
                    version = next.version,
                    sections = next.len(),
                    "Merged phase result into archive"
                );
                Ok(next)
            }
            Err(StoreError::VersionConflict { .. }) => {
                let actual = self.load(session_id).await?.version;
                Err(SessionError::StaleArchive {
                    expected: expected_version,
                    actual,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn load_stored(
        &self,
        session_id: &str,
    ) -> Result<Option<Stored<MasterArchive>>, SessionError> {
        Ok(self.state.load_archive(session_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::Utc;
    use serde_json::json;
    use std::sync::Arc;

    fn archives() -> ArchiveStore {
        ArchiveStore::new(StateStore::new(Arc::new(MemoryStore::new())))
    }

    fn result(phase_id: &str, version: u32) -> PhaseResult {
        PhaseResult {
            session_id: "s1".into(),
            phase_id: phase_id.into(),
            version,
            payload: json!({ format!("section_{}", phase_id): version }),
            units_consumed: 5,
            produced_at: Utc::now(),
            required_human_input: false,
            partial: false,
            degraded: false,
        }
    }

    #[tokio::test]
    async fn test_commit_advances_version() {
        let store = archives();
        store.init("s1").await.unwrap();

        let a = store.commit("s1", 0, &result("01", 1)).await.unwrap();
        assert_eq!(a.version, 1);
        let b = store.commit("s1", 1, &result("02", 1)).await.unwrap();
        assert_eq!(b.version, 2);
        assert_eq!(store.load("s1").await.unwrap(), b);
    }

    #[tokio::test]
    async fn test_commit_with_stale_version_rejected() {
        let store = archives();
        store.init("s1").await.unwrap();
        store.commit("s1", 0, &result("01", 1)).await.unwrap();

        let err = store.commit("s1", 0, &result("02", 1)).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::StaleArchive {
                expected: 0,
                actual: 1
            }
        ));
        assert_eq!(store.load("s1").await.unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_commit_is_idempotent() {
        let store = archives();
        store.init("s1").await.unwrap();
        let first = store.commit("s1", 0, &result("01", 1)).await.unwrap();
        let again = store.commit("s1", 0, &result("01", 1)).await.unwrap();
        assert_eq!(first, again);
        assert_eq!(again.merges.len(), 1);
    }

    #[tokio::test]
    async fn test_commit_rejects_partial() {
        let store = archives();
        let mut partial = result("03", 1);
        partial.partial = true;
        assert!(matches!(
            store.commit("s1", 0, &partial).await,
            Err(SessionError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_load_missing_is_empty() {
        let store = archives();
        let archive = store.load("nope").await.unwrap();
        assert_eq!(archive.version, 0);
        assert!(archive.is_empty());
    }
}
