use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Persisted retry policy row.
///
/// Durations are stored as milliseconds. A `NULL` channel marks the
/// installation-wide default policy.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct RetryConfigurationRow {
    pub id: String,
    pub channel: Option<String>,
    pub max_retry_attempts: i32,
    pub initial_retry_delay_ms: i64,
    pub max_retry_delay_ms: i64,
    pub retry_delay_multiplier: f64,
    pub retry_timeout_ms: i64,
    pub enable_exponential_backoff: bool,
    pub enable_dead_letter_queue: bool,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
