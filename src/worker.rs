//! A simple external driver for sessions.
//!
//! The core never schedules itself; something has to keep calling
//! `advance`. `Worker` is that something for single-process deployments:
//! it loops until the session is terminal and sleeps between polls while
//! the session waits on a human.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::errors::SessionError;
use crate::session::{SessionManager, SessionStatus};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_MAX_STEPS: usize = 10_000;

pub struct Worker {
    manager: Arc<SessionManager>,
    poll_interval: Duration,
    max_steps: usize,
}

impl Worker {
    pub fn new(manager: Arc<SessionManager>) -> Self {
        Self {
            manager,
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_steps: DEFAULT_MAX_STEPS,
        }
    }

    /// Sleep between polls of a session awaiting human input.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Upper bound on `advance` calls per `drive`.
    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps.max(1);
        self
    }

    /// Advance `session_id` until it is terminal.
    ///
    /// Returns the last observed status, which is only non-terminal when
    /// `max_steps` ran out.
    pub async fn drive(&self, session_id: &str) -> Result<SessionStatus, SessionError> {
        let mut status = self.manager.session(session_id).await?.status;

        for step in 0..self.max_steps {
            if status.is_terminal() {
                break;
            }
            let previous = status;
            status = self.manager.advance(session_id).await?;
            debug!(session_id, step, %status, "Advanced session");

            if status == SessionStatus::AwaitingHumanInput && previous == SessionStatus::AwaitingHumanInput {
                tokio::time::sleep(self.poll_interval).await;
            }
        }

        info!(session_id, %status, "Worker stopped");
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::AnalysisError;
    use crate::executor::{AnalysisContext, AnalysisOutput, Analyzer};
    use async_trait::async_trait;
    use serde_json::json;

    struct Constant;

    #[async_trait]
    impl Analyzer for Constant {
        async fn analyze(
            &self,
            phase_id: &str,
            ctx: &AnalysisContext,
        ) -> Result<AnalysisOutput, AnalysisError> {
            Ok(AnalysisOutput::new(
                json!({ "phase": phase_id, "stage": ctx.stage }),
                100,
            ))
        }
    }

    #[tokio::test]
    async fn test_drive_runs_default_pipeline_to_completion() {
        let mut config = crate::config::DossierConfig::default();
        config.human_loop.timeout_minutes = 0;
        let manager = Arc::new(
            SessionManager::builder()
                .analyzer(Arc::new(Constant))
                .config(config)
                .build()
                .unwrap(),
        );
        let id = manager
            .create_session("https://example.com")
            .await
            .unwrap()
            .session_id;

        let worker = Worker::new(manager.clone()).with_poll_interval(Duration::from_millis(5));
        assert_eq!(worker.drive(&id).await.unwrap(), SessionStatus::Completed);
        assert_eq!(manager.archive(&id).await.unwrap().len(), 6);
    }

    #[tokio::test]
    async fn test_drive_stops_at_max_steps() {
        let manager = Arc::new(
            SessionManager::builder()
                .analyzer(Arc::new(Constant))
                .build()
                .unwrap(),
        );
        let id = manager
            .create_session("https://example.com")
            .await
            .unwrap()
            .session_id;

        let worker = Worker::new(manager).with_max_steps(1);
        assert_eq!(worker.drive(&id).await.unwrap(), SessionStatus::Running);
    }
}
