use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, warn};

use super::Channel;
use crate::config::NotifySection;

/// Delivers human-loop announcements. Returns whether delivery succeeded;
/// callers log failures and carry on.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, session_id: &str, channel: Channel, message: &str) -> bool;
}

/// Drops every message. Used when no webhooks are configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullNotifier;

#[async_trait]
impl Notifier for NullNotifier {
    async fn notify(&self, _session_id: &str, _channel: Channel, _message: &str) -> bool {
        false
    }
}

#[derive(Debug, Serialize)]
struct WebhookBody<'a> {
    session_id: &'a str,
    channel: Channel,
    text: &'a str,
}

/// POSTs a JSON message to a per-channel webhook (a chat incoming-webhook and
/// an email relay).
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    chat_url: Option<String>,
    email_url: Option<String>,
}

impl WebhookNotifier {
    pub fn new(
        chat_url: Option<String>,
        email_url: Option<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build webhook HTTP client")?;
        Ok(Self {
            client,
            chat_url,
            email_url,
        })
    }

    pub fn from_config(config: &NotifySection) -> anyhow::Result<Self> {
        Self::new(
            config.chat_webhook.clone(),
            config.email_webhook.clone(),
            Duration::from_secs(config.request_timeout_secs),
        )
    }

    fn url_for(&self, channel: Channel) -> Option<&str> {
        match channel {
            Channel::Chat => self.chat_url.as_deref(),
            Channel::Email => self.email_url.as_deref(),
        }
    }

    async fn post(&self, url: &str, body: &WebhookBody<'_>) -> anyhow::Result<()> {
        let resp = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .with_context(|| format!("Failed to send {} webhook", body.channel))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("{} webhook returned {}: {}", body.channel, status, text);
        }
        Ok(())
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, session_id: &str, channel: Channel, message: &str) -> bool {
        let Some(url) = self.url_for(channel) else {
            warn!(session_id, %channel, "No webhook configured for channel");
            return false;
        };

        let body = WebhookBody {
            session_id,
            channel,
            text: message,
        };
        match self.post(url, &body).await {
            Ok(()) => {
                debug!(session_id, %channel, "Webhook delivered");
                true
            }
            Err(e) => {
                warn!(session_id, %channel, error = %e, "Webhook delivery failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_url_reports_failure() {
        let notifier = WebhookNotifier::new(None, None, Duration::from_secs(1)).unwrap();
        assert!(!notifier.notify("s1", Channel::Chat, "hello").await);
        assert!(!notifier.notify("s1", Channel::Email, "hello").await);
    }

    #[tokio::test]
    async fn test_unreachable_url_reports_failure() {
        // Port 9 (discard) on localhost is closed in test environments.
        let notifier = WebhookNotifier::new(
            Some("http://127.0.0.1:9/hook".into()),
            None,
            Duration::from_millis(500),
        )
        .unwrap();
        assert!(!notifier.notify("s1", Channel::Chat, "hello").await);
    }

    #[test]
    fn test_from_config_routes_channels() {
        let config = NotifySection {
            chat_webhook: Some("https://chat.example.com/hook".into()),
            email_webhook: None,
            request_timeout_secs: 3,
        };
        let notifier = WebhookNotifier::from_config(&config).unwrap();
        assert_eq!(
            notifier.url_for(Channel::Chat),
            Some("https://chat.example.com/hook")
        );
        assert_eq!(notifier.url_for(Channel::Email), None);
    }

    #[test]
    fn test_body_shape() {
        let body = WebhookBody {
            session_id: "s1",
            channel: Channel::Email,
            text: "hi",
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["channel"], "email");
        assert_eq!(json["text"], "hi");
    }
}
