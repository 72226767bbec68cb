use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};

use super::{Channel, HumanLoopRequest, Notifier, RequestStatus};
use crate::clock::Clock;
use crate::errors::{SessionError, StoreError};
use crate::session::{Session, SessionStatus};
use crate::store::{StateStore, Stored};

/// Bounded retries for request updates racing another writer.
const MAX_UPDATE_ATTEMPTS: usize = 8;

/// Opens, resolves and times out human-loop requests.
#[derive(Clone)]
pub struct HumanLoopCoordinator {
    state: StateStore,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
}

impl HumanLoopCoordinator {
    pub fn new(state: StateStore, notifier: Arc<dyn Notifier>, clock: Arc<dyn Clock>) -> Self {
        Self {
            state,
            notifier,
            clock,
        }
    }

    /// Open a `WAITING` request for `phase_id`, move the session to
    /// `AWAITING_HUMAN_INPUT` and announce the request on every channel.
    ///
    /// The session is updated in place; persisting it is the caller's job.
    /// Fails if the session already has a request that is still waiting.
    pub async fn open_request(
        &self,
        session: &mut Session,
        phase_id: &str,
        payload: Value,
        timeout_minutes: u64,
    ) -> Result<HumanLoopRequest, SessionError> {
        if let Some(existing) = &session.pending_request_id
            && let Some(stored) = self.state.load_request(existing).await?
            && stored.value.is_waiting()
        {
            return Err(SessionError::InvalidInput(format!(
                "Session {} already has open request {}",
                session.session_id, existing
            )));
        }

        let request = HumanLoopRequest::new(
            &session.session_id,
            phase_id,
            payload,
            self.clock.now(),
            timeout_minutes,
        );
        self.state.create_request(&request).await?;

        session.status = SessionStatus::AwaitingHumanInput;
        session.pending_request_id = Some(request.request_id.clone());

        info!(
            session_id = %session.session_id,
            phase_id,
            request_id = %request.request_id,
            timeout_at = %request.timeout_at,
            "Opened human-loop request"
        );

        self.announce(&request).await;
        Ok(request)
    }

    /// Notify on every channel. A failed channel is logged; the request
    /// stays open either way and will eventually resolve by timeout.
    async fn announce(&self, request: &HumanLoopRequest) -> usize {
        let message = request.notification_message();
        let mut delivered = 0;
        for channel in Channel::ALL {
            if self
                .notifier
                .notify(&request.session_id, channel, &message)
                .await
            {
                delivered += 1;
            } else {
                warn!(
                    session_id = %request.session_id,
                    request_id = %request.request_id,
                    %channel,
                    "Human-loop notification not delivered"
                );
            }
        }
        if delivered == 0 {
            warn!(
                session_id = %request.session_id,
                request_id = %request.request_id,
                "No channel delivered the human-loop request; relying on timeout"
            );
        }
        delivered
    }

    /// Supply the external dataset. Calling this on a request that is
    /// already `FULFILLED` or `TIMED_OUT` changes nothing.
    pub async fn fulfill_request(
        &self,
        request_id: &str,
        payload: Value,
    ) -> Result<HumanLoopRequest, SessionError> {
        for _ in 0..MAX_UPDATE_ATTEMPTS {
            let Stored { value: mut request, version } = self.load_stored(request_id).await?;

            if !request.is_waiting() {
                debug!(
                    request_id,
                    status = %request.status,
                    "Request already resolved; ignoring fulfillment"
                );
                return Ok(request);
            }

            request.status = RequestStatus::Fulfilled;
            request.fulfilled_payload = Some(payload.clone());
            request.resolved_at = Some(self.clock.now());

            match self.state.save_request(&request, version).await {
                Ok(_) => {
                    info!(
                        session_id = %request.session_id,
                        phase_id = %request.phase_id,
                        request_id,
                        "Human-loop request fulfilled"
                    );
                    return Ok(request);
                }
                Err(StoreError::VersionConflict { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Err(SessionError::Other(anyhow::anyhow!(
            "Failed to fulfill request {} after {} attempts",
            request_id,
            MAX_UPDATE_ATTEMPTS
        )))
    }

    /// Flip a waiting request to `TIMED_OUT` once its deadline has passed.
    ///
    /// Returns true only for the call that performed the flip.
    pub async fn poll_timeout(&self, request_id: &str) -> Result<bool, SessionError> {
        for _ in 0..MAX_UPDATE_ATTEMPTS {
            let Stored { value: mut request, version } = self.load_stored(request_id).await?;

            let now = self.clock.now();
            if !request.is_overdue(now) {
                return Ok(false);
            }

            request.status = RequestStatus::TimedOut;
            request.resolved_at = Some(now);

            match self.state.save_request(&request, version).await {
                Ok(_) => {
                    warn!(
                        session_id = %request.session_id,
                        phase_id = %request.phase_id,
                        request_id,
                        "Human-loop request timed out"
                    );
                    return Ok(true);
                }
                Err(StoreError::VersionConflict { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Err(SessionError::Other(anyhow::anyhow!(
            "Failed to time out request {} after {} attempts",
            request_id,
            MAX_UPDATE_ATTEMPTS
        )))
    }

    pub async fn load(&self, request_id: &str) -> Result<HumanLoopRequest, SessionError> {
        Ok(self.load_stored(request_id).await?.value)
    }

    async fn load_stored(&self, request_id: &str) -> Result<Stored<HumanLoopRequest>, SessionError> {
        self.state
            .load_request(request_id)
            .await?
            .ok_or_else(|| SessionError::RequestNotFound {
                request_id: request_id.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use chrono::{Duration, Utc};
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording {
        sent: Mutex<Vec<Channel>>,
        fail_chat: bool,
    }

    #[async_trait]
    impl Notifier for Recording {
        async fn notify(&self, _session_id: &str, channel: Channel, _message: &str) -> bool {
            self.sent.lock().unwrap().push(channel);
            !(self.fail_chat && channel == Channel::Chat)
        }
    }

    fn setup(notifier: Arc<Recording>) -> (HumanLoopCoordinator, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let state = StateStore::new(Arc::new(MemoryStore::new()));
        (
            HumanLoopCoordinator::new(state, notifier, clock.clone()),
            clock,
        )
    }

    #[tokio::test]
    async fn test_open_request_notifies_both_channels() {
        let notifier = Arc::new(Recording::default());
        let (coordinator, _) = setup(notifier.clone());
        let mut session = Session::new("https://example.com", Utc::now()).unwrap();

        let req = coordinator
            .open_request(&mut session, "03", json!({"seeds": ["crm"]}), 30)
            .await
            .unwrap();

        assert_eq!(session.status, SessionStatus::AwaitingHumanInput);
        assert_eq!(session.pending_request_id.as_deref(), Some(req.request_id.as_str()));
        assert_eq!(*notifier.sent.lock().unwrap(), vec![Channel::Chat, Channel::Email]);
        assert_eq!(coordinator.load(&req.request_id).await.unwrap().status, RequestStatus::Waiting);
    }

    #[tokio::test]
    async fn test_one_channel_failing_still_tries_the_other() {
        let notifier = Arc::new(Recording {
            fail_chat: true,
            ..Default::default()
        });
        let (coordinator, _) = setup(notifier.clone());
        let mut session = Session::new("https://example.com", Utc::now()).unwrap();

        coordinator
            .open_request(&mut session, "03", json!({}), 30)
            .await
            .unwrap();
        assert_eq!(notifier.sent.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_second_open_request_rejected_while_waiting() {
        let (coordinator, _) = setup(Arc::new(Recording::default()));
        let mut session = Session::new("https://example.com", Utc::now()).unwrap();
        coordinator
            .open_request(&mut session, "03", json!({}), 30)
            .await
            .unwrap();
        assert!(matches!(
            coordinator.open_request(&mut session, "03", json!({}), 30).await,
            Err(SessionError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_fulfill_is_idempotent() {
        let (coordinator, _) = setup(Arc::new(Recording::default()));
        let mut session = Session::new("https://example.com", Utc::now()).unwrap();
        let req = coordinator
            .open_request(&mut session, "03", json!({}), 30)
            .await
            .unwrap();

        let first = coordinator
            .fulfill_request(&req.request_id, json!({"volumes": [1]}))
            .await
            .unwrap();
        let second = coordinator
            .fulfill_request(&req.request_id, json!({"volumes": [2]}))
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(second.fulfilled_payload, Some(json!({"volumes": [1]})));
    }

    #[tokio::test]
    async fn test_fulfill_unknown_request() {
        let (coordinator, _) = setup(Arc::new(Recording::default()));
        assert!(matches!(
            coordinator.fulfill_request("nope", json!({})).await,
            Err(SessionError::RequestNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_poll_timeout_flips_exactly_once() {
        let (coordinator, clock) = setup(Arc::new(Recording::default()));
        let mut session = Session::new("https://example.com", Utc::now()).unwrap();
        let req = coordinator
            .open_request(&mut session, "03", json!({}), 30)
            .await
            .unwrap();

        assert!(!coordinator.poll_timeout(&req.request_id).await.unwrap());
        clock.advance(Duration::minutes(31));
        assert!(coordinator.poll_timeout(&req.request_id).await.unwrap());
        assert!(!coordinator.poll_timeout(&req.request_id).await.unwrap());

        let timed_out = coordinator.load(&req.request_id).await.unwrap();
        assert_eq!(timed_out.status, RequestStatus::TimedOut);

        // A late callback does not resurrect it.
        let after = coordinator
            .fulfill_request(&req.request_id, json!({"late": true}))
            .await
            .unwrap();
        assert_eq!(after.status, RequestStatus::TimedOut);
        assert!(after.fulfilled_payload.is_none());
    }
}
