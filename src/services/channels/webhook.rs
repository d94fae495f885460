use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use super::{ChannelError, DeliveryChannel};
use crate::db::models::Channel;

pub const SIGNATURE_HEADER: &str = "X-Notifier-Signature";
pub const TIMESTAMP_HEADER: &str = "X-Notifier-Timestamp";

type HmacSha256 = Hmac<Sha256>;

/// Generic HTTP webhook sender. The recipient is the target URL.
///
/// When a signing secret is configured every request carries
/// `X-Notifier-Signature: sha256=<hex>` computed over `"{timestamp}.{body}"`.
pub struct WebhookChannel {
    client: reqwest::Client,
    secret: Option<String>,
}

impl WebhookChannel {
    pub fn new(secret: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            secret: secret.filter(|s| !s.is_empty()),
        }
    }
}

pub fn sign_payload(secret: &str, timestamp: i64, body: &str) -> Result<String, ChannelError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| ChannelError::Other(format!("invalid signing key: {}", e)))?;
    mac.update(format!("{}.{}", timestamp, body).as_bytes());
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

fn parse_target(recipient: &str) -> Result<url::Url, ChannelError> {
    let url = url::Url::parse(recipient.trim())
        .map_err(|e| ChannelError::InvalidRecipient(format!("invalid webhook URL: {}", e)))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(ChannelError::InvalidRecipient(format!(
            "unsupported scheme: {}",
            other
        ))),
    }
}

#[async_trait]
impl DeliveryChannel for WebhookChannel {
    async fn send(
        &self,
        recipient: &str,
        subject: Option<&str>,
        message: &str,
    ) -> Result<String, ChannelError> {
        let url = parse_target(recipient)?;
        let delivery_id = uuid::Uuid::new_v4().to_string();
        let timestamp = Utc::now().timestamp();

        let body = serde_json::json!({
            "id": delivery_id,
            "subject": subject,
            "message": message,
            "timestamp": timestamp,
        })
        .to_string();

        let mut request = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .header(TIMESTAMP_HEADER, timestamp.to_string())
            .timeout(Duration::from_secs(30));

        if let Some(secret) = &self.secret {
            request = request.header(SIGNATURE_HEADER, sign_payload(secret, timestamp, &body)?);
        }

        let response = request
            .body(body)
            .send()
            .await
            .map_err(ChannelError::from_reqwest)?;

        let status = response.status();
        if status.is_success() {
            Ok(delivery_id)
        } else {
            let text = response.text().await.unwrap_or_default();
            Err(ChannelError::from_http_status(status, &text))
        }
    }

    fn channel_type(&self) -> Channel {
        Channel::Webhook
    }

    fn rate_limit_info(&self) -> (u32, Duration) {
        (100, Duration::from_secs(60))
    }
}
