use std::time::Duration;

use async_trait::async_trait;

use super::{ChannelError, DeliveryChannel};
use crate::db::models::Channel;

/// Slack incoming-webhook sender.
///
/// The recipient is the incoming webhook URL. An empty recipient falls back
/// to the default webhook configured at startup.
pub struct SlackChannel {
    client: reqwest::Client,
    default_webhook_url: Option<String>,
}

impl SlackChannel {
    pub fn new(default_webhook_url: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            default_webhook_url,
        }
    }

    fn resolve_url(&self, recipient: &str) -> Result<url::Url, ChannelError> {
        let raw = match recipient.trim() {
            "" => self
                .default_webhook_url
                .as_deref()
                .ok_or_else(|| ChannelError::InvalidRecipient("no Slack webhook URL".into()))?,
            url => url,
        };
        let url = url::Url::parse(raw)
            .map_err(|e| ChannelError::InvalidRecipient(format!("invalid Slack webhook URL: {}", e)))?;
        if url.scheme() != "https" && url.scheme() != "http" {
            return Err(ChannelError::InvalidRecipient(format!(
                "unsupported scheme: {}",
                url.scheme()
            )));
        }
        Ok(url)
    }
}

fn payload(subject: Option<&str>, message: &str) -> serde_json::Value {
    let text = match subject {
        Some(s) if !s.is_empty() => format!("*{}*\n{}", s, message),
        _ => message.to_string(),
    };
    serde_json::json!({ "text": text })
}

#[async_trait]
impl DeliveryChannel for SlackChannel {
    async fn send(
        &self,
        recipient: &str,
        subject: Option<&str>,
        message: &str,
    ) -> Result<String, ChannelError> {
        let url = self.resolve_url(recipient)?;

        let response = self
            .client
            .post(url)
            .json(&payload(subject, message))
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .map_err(ChannelError::from_reqwest)?;

        let status = response.status();
        if status.is_success() {
            // Incoming webhooks return a plain "ok" body and no message id.
            Ok(uuid::Uuid::new_v4().to_string())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(ChannelError::from_http_status(status, &body))
        }
    }

    fn channel_type(&self) -> Channel {
        Channel::Slack
    }

    fn rate_limit_info(&self) -> (u32, Duration) {
        (50, Duration::from_secs(60))
    }
}
