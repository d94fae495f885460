//! Delivery channel contract and transport implementations.
//!
//! Each transport implements [`DeliveryChannel`] and reports failures as a
//! [`ChannelError`]. The variant decides whether the orchestrator may retry.

use std::time::Duration;

use async_trait::async_trait;

use crate::db::models::Channel;

pub mod email;
pub mod slack;
pub mod telegram;
pub mod webhook;

pub use email::{EmailChannel, SmtpSettings};
pub use slack::SlackChannel;
pub use telegram::TelegramChannel;
pub use webhook::WebhookChannel;

/// Failure reported by a delivery channel.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("send timed out after {0:?}")]
    Timeout(Duration),

    #[error("rate limited by provider: {0}")]
    RateLimited(String),

    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("invalid recipient: {0}")]
    InvalidRecipient(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Other(String),
}

impl ChannelError {
    pub fn is_retryable(&self) -> bool {
        match self {
            ChannelError::Transport(_)
            | ChannelError::Timeout(_)
            | ChannelError::RateLimited(_)
            | ChannelError::Unavailable(_) => true,
            ChannelError::InvalidRecipient(_)
            | ChannelError::InvalidMessage(_)
            | ChannelError::Unauthorized(_)
            | ChannelError::Forbidden(_)
            | ChannelError::NotFound(_) => false,
            ChannelError::Other(text) => crate::services::retry::is_retryable_error_text(text),
        }
    }

    /// Classify an HTTP response status from a webhook-style endpoint.
    pub fn from_http_status(status: reqwest::StatusCode, body: &str) -> Self {
        let detail = if body.is_empty() {
            status.to_string()
        } else {
            format!("{}: {}", status, body)
        };

        match status.as_u16() {
            429 => ChannelError::RateLimited(detail),
            401 => ChannelError::Unauthorized(detail),
            403 => ChannelError::Forbidden(detail),
            404 | 410 => ChannelError::NotFound(detail),
            400..=499 => ChannelError::InvalidMessage(detail),
            _ if status.is_server_error() => ChannelError::Unavailable(detail),
            _ => ChannelError::Other(detail),
        }
    }

    pub(crate) fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            ChannelError::Transport(err.to_string())
        } else if err.is_builder() {
            ChannelError::InvalidRecipient(err.to_string())
        } else {
            ChannelError::Other(err.to_string())
        }
    }
}

/// Uniform send contract implemented once per transport.
#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    /// Deliver `message` to `recipient` and return the transport's message id.
    async fn send(
        &self,
        recipient: &str,
        subject: Option<&str>,
        message: &str,
    ) -> Result<String, ChannelError>;

    fn channel_type(&self) -> Channel;

    /// Health probe used by the direct send path.
    async fn is_available(&self) -> bool {
        true
    }

    /// Attempts the provider tolerates. Registration warns when the retry
    /// policy for the channel allows more.
    fn max_retries(&self) -> u32 {
        3
    }

    /// Provider-side limit as `(max_requests, window)`. Registration tightens
    /// a looser limiter rule to this.
    fn rate_limit_info(&self) -> (u32, Duration);
}
