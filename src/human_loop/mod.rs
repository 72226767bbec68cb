//! Human-in-loop suspension.
//!
//! A phase that needs an externally supplied dataset opens a
//! [`HumanLoopRequest`]; the session parks in `AWAITING_HUMAN_INPUT` until the
//! request is fulfilled or times out. Resolution is pull-based: nothing here
//! runs a timer, `SessionManager::advance` polls the request.

mod coordinator;
mod notify;

pub use coordinator::HumanLoopCoordinator;
pub use notify::{Notifier, NullNotifier, WebhookNotifier};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Longest honoured human-loop timeout (about a century). Longer values are
/// clamped.
pub const MAX_TIMEOUT_MINUTES: u64 = 100 * 365 * 24 * 60;

fn deadline(opened_at: DateTime<Utc>, timeout_minutes: u64) -> DateTime<Utc> {
    let minutes = timeout_minutes.min(MAX_TIMEOUT_MINUTES) as i64;
    chrono::Duration::try_minutes(minutes)
        .and_then(|d| opened_at.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    Waiting,
    Fulfilled,
    TimedOut,
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestStatus::Waiting => write!(f, "WAITING"),
            RequestStatus::Fulfilled => write!(f, "FULFILLED"),
            RequestStatus::TimedOut => write!(f, "TIMED_OUT"),
        }
    }
}

/// Notification channels. Every request is announced on all of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Chat,
    Email,
}

impl Channel {
    pub const ALL: [Channel; 2] = [Channel::Chat, Channel::Email];
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Channel::Chat => write!(f, "chat"),
            Channel::Email => write!(f, "email"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HumanLoopRequest {
    pub request_id: String,
    pub session_id: String,
    pub phase_id: String,
    /// What the human is asked to work from (e.g. extracted seed keywords)
    pub request_payload: Value,
    pub status: RequestStatus,
    pub opened_at: DateTime<Utc>,
    pub timeout_at: DateTime<Utc>,
    #[serde(default)]
    pub fulfilled_payload: Option<Value>,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl HumanLoopRequest {
    pub fn new(
        session_id: &str,
        phase_id: &str,
        request_payload: Value,
        opened_at: DateTime<Utc>,
        timeout_minutes: u64,
    ) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            phase_id: phase_id.to_string(),
            request_payload,
            status: RequestStatus::Waiting,
            opened_at,
            timeout_at: deadline(opened_at, timeout_minutes),
            fulfilled_payload: None,
            resolved_at: None,
        }
    }

    pub fn is_waiting(&self) -> bool {
        self.status == RequestStatus::Waiting
    }

    /// Still waiting, and strictly past the deadline.
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.is_waiting() && now > self.timeout_at
    }

    /// Text sent to every notification channel.
    pub fn notification_message(&self) -> String {
        format!(
            "Session {} is waiting for input on phase {} (request {}). Respond before {}.",
            self.session_id,
            self.phase_id,
            self.request_id,
            self.timeout_at.to_rfc3339()
        )
    }
}
