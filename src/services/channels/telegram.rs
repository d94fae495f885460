use std::time::Duration;

use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::{ChatId, ParseMode};
use teloxide::{ApiError, RequestError};

use super::{ChannelError, DeliveryChannel};
use crate::db::models::Channel;

/// Telegram bot sender. Recipients are numeric chat ids and messages are
/// sent in HTML parse mode.
#[derive(Clone)]
pub struct TelegramChannel {
    bot: Bot,
}

impl TelegramChannel {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            bot: Bot::new(token.into()),
        }
    }

    /// Build the channel and verify the token with `getMe`.
    pub async fn connect(token: impl Into<String>) -> Result<Self, ChannelError> {
        let channel = Self::new(token);
        match channel.bot.get_me().await {
            Ok(me) => {
                tracing::info!("Telegram bot initialized: @{}", me.username());
                Ok(channel)
            }
            Err(e) => {
                tracing::error!("Failed to initialize Telegram bot: {}", e);
                Err(map_request_error(e))
            }
        }
    }
}

fn parse_chat_id(recipient: &str) -> Result<ChatId, ChannelError> {
    recipient
        .trim()
        .parse::<i64>()
        .map(ChatId)
        .map_err(|_| ChannelError::InvalidRecipient(format!("invalid chat id: {}", recipient)))
}

fn map_request_error(err: RequestError) -> ChannelError {
    match err {
        RequestError::RetryAfter(wait) => {
            ChannelError::RateLimited(format!("retry after {:?}", wait))
        }
        RequestError::Network(e) => ChannelError::Transport(e.to_string()),
        RequestError::Io(e) => ChannelError::Transport(e.to_string()),
        RequestError::Api(api) => match api {
            // Telegram answers 404 to any method called with a bad token.
            ApiError::NotFound => ChannelError::Unauthorized(api.to_string()),
            ApiError::ChatNotFound | ApiError::UserNotFound => {
                ChannelError::InvalidRecipient(api.to_string())
            }
            ApiError::BotBlocked | ApiError::BotKicked => {
                ChannelError::Forbidden(api.to_string())
            }
            ApiError::MessageTextIsEmpty | ApiError::MessageIsTooLong => {
                ChannelError::InvalidMessage(api.to_string())
            }
            other => ChannelError::Other(other.to_string()),
        },
        other => ChannelError::Other(other.to_string()),
    }
}

#[async_trait]
impl DeliveryChannel for TelegramChannel {
    async fn send(
        &self,
        recipient: &str,
        _subject: Option<&str>,
        message: &str,
    ) -> Result<String, ChannelError> {
        let chat_id = parse_chat_id(recipient)?;

        let sent = self
            .bot
            .send_message(chat_id, message)
            .parse_mode(ParseMode::Html)
            .await
            .map_err(map_request_error)?;

        tracing::debug!(
            "Telegram message sent to {}: message_id={}",
            recipient,
            sent.id.0
        );
        Ok(sent.id.0.to_string())
    }

    fn channel_type(&self) -> Channel {
        Channel::Telegram
    }

    async fn is_available(&self) -> bool {
        self.bot.get_me().await.is_ok()
    }

    fn rate_limit_info(&self) -> (u32, Duration) {
        (30, Duration::from_secs(60))
    }
}
