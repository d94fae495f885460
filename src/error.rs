use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::db::models::{Channel, DeliveryStatus};
use crate::services::channels::ChannelError;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid status transition from {from} to {to}")]
    InvalidStatusTransition {
        from: DeliveryStatus,
        to: DeliveryStatus,
    },

    #[error("Notification reached maximum retry attempts ({0})")]
    MaxRetryAttemptsExceeded(i32),

    #[error("Invalid retry configuration: {0}")]
    InvalidRetryConfiguration(String),

    #[error("Retry configuration is already active")]
    RetryConfigurationAlreadyActive,

    #[error("Retry configuration is already inactive")]
    RetryConfigurationAlreadyInactive,

    #[error("Invalid rate limit rule: {0}")]
    InvalidRateLimitRule(String),

    #[error("Queued notification {id} is no longer {expected}")]
    ConcurrentModification {
        id: String,
        expected: DeliveryStatus,
    },

    #[error("Delivery channel {0} not registered")]
    ChannelNotRegistered(Channel),

    #[error("Delivery channel {0} is not available")]
    ChannelUnavailable(Channel),

    #[error("Failed to send notification via {channel}: {source}")]
    Delivery {
        channel: Channel,
        #[source]
        source: ChannelError,
    },

    #[error("Internal server error")]
    Internal(#[from] anyhow::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Configuration error: {0}")]
    Config(String),
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    code: String,
    message: String,
}

impl AppError {
    /// Stable machine-readable code used in API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::BadRequest(_) => "BAD_REQUEST",
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::InvalidStatusTransition { .. } => "INVALID_STATUS_TRANSITION",
            AppError::MaxRetryAttemptsExceeded(_) => "MAX_RETRY_ATTEMPTS_EXCEEDED",
            AppError::InvalidRetryConfiguration(_) => "INVALID_RETRY_CONFIGURATION",
            AppError::RetryConfigurationAlreadyActive => "RETRY_CONFIGURATION_ALREADY_ACTIVE",
            AppError::RetryConfigurationAlreadyInactive => "RETRY_CONFIGURATION_ALREADY_INACTIVE",
            AppError::InvalidRateLimitRule(_) => "INVALID_RATE_LIMIT_RULE",
            AppError::ConcurrentModification { .. } => "CONCURRENT_MODIFICATION",
            AppError::ChannelNotRegistered(_) => "CHANNEL_NOT_REGISTERED",
            AppError::ChannelUnavailable(_) => "CHANNEL_UNAVAILABLE",
            AppError::Delivery { .. } => "DELIVERY_FAILED",
            AppError::Internal(_) => "INTERNAL_ERROR",
            AppError::Database(_) => "DATABASE_ERROR",
            AppError::Migration(_) => "DATABASE_ERROR",
            AppError::Config(_) => "CONFIG_ERROR",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Validation(_)
            | AppError::InvalidRetryConfiguration(_)
            | AppError::InvalidRateLimitRule(_) => {
                (StatusCode::UNPROCESSABLE_ENTITY, self.to_string())
            }
            AppError::InvalidStatusTransition { .. }
            | AppError::MaxRetryAttemptsExceeded(_)
            | AppError::RetryConfigurationAlreadyActive
            | AppError::RetryConfigurationAlreadyInactive
            | AppError::ConcurrentModification { .. } => {
                (StatusCode::CONFLICT, self.to_string())
            }
            AppError::ChannelNotRegistered(_) | AppError::ChannelUnavailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, self.to_string())
            }
            AppError::Delivery { channel, source } => {
                tracing::error!("Delivery via {} failed: {}", channel, source);
                (StatusCode::BAD_GATEWAY, self.to_string())
            }
            AppError::Database(e) => {
                tracing::error!("Database error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "A database error occurred".to_string(),
                )
            }
            AppError::Migration(e) => {
                tracing::error!("Migration error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "A database error occurred".to_string(),
                )
            }
            AppError::Config(msg) => {
                tracing::error!("Configuration error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Server configuration error".to_string(),
                )
            }
            AppError::Internal(e) => {
                tracing::error!("Internal error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "An internal error occurred".to_string(),
                )
            }
        };

        let body = ErrorResponse {
            error: ErrorBody {
                code: self.code().to_string(),
                message,
            },
        };

        (status, Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
