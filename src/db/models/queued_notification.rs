use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::Channel;
use crate::error::{AppError, AppResult};

/// Lifecycle status of a queued notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Processing,
    Delivered,
    Failed,
    Retrying,
    Cancelled,
    Expired,
}

impl DeliveryStatus {
    pub const ALL: [DeliveryStatus; 7] = [
        DeliveryStatus::Pending,
        DeliveryStatus::Processing,
        DeliveryStatus::Delivered,
        DeliveryStatus::Failed,
        DeliveryStatus::Retrying,
        DeliveryStatus::Cancelled,
        DeliveryStatus::Expired,
    ];

    /// Convert from string (case-insensitive)
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Some(DeliveryStatus::Pending),
            "processing" => Some(DeliveryStatus::Processing),
            "delivered" => Some(DeliveryStatus::Delivered),
            "failed" => Some(DeliveryStatus::Failed),
            "retrying" => Some(DeliveryStatus::Retrying),
            "cancelled" => Some(DeliveryStatus::Cancelled),
            "expired" => Some(DeliveryStatus::Expired),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Processing => "processing",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Failed => "failed",
            DeliveryStatus::Retrying => "retrying",
            DeliveryStatus::Cancelled => "cancelled",
            DeliveryStatus::Expired => "expired",
        }
    }

    /// States an operator may still cancel or a deadline may still expire.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            DeliveryStatus::Pending | DeliveryStatus::Processing | DeliveryStatus::Retrying
        )
    }

    /// States the orchestrator never picks up again on its own.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DeliveryStatus::Delivered
                | DeliveryStatus::Failed
                | DeliveryStatus::Cancelled
                | DeliveryStatus::Expired
        )
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for DeliveryStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_str(&value).ok_or_else(|| format!("Invalid delivery status: {}", value))
    }
}

/// One unit of outbound delivery work.
///
/// The routing fields (`channel`, `recipient`, `subject`, `message`) never
/// change after enqueue. Status and retry bookkeeping are mutated through the
/// transition methods below, each of which refreshes `updated_at`.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct QueuedNotification {
    /// Primary key (UUID)
    pub id: String,

    /// Optional reference to the originating notification record.
    pub notification_id: Option<String>,

    #[sqlx(try_from = "String")]
    pub channel: Channel,

    /// Chat id, email address or URL depending on the channel.
    pub recipient: String,

    pub subject: Option<String>,

    pub message: String,

    /// Higher values are delivered first.
    pub priority: i32,

    /// Earliest time the notification may be processed.
    pub scheduled_at: DateTime<Utc>,

    /// Optional deadline after which the notification is expired instead of sent.
    pub expires_at: Option<DateTime<Utc>>,

    /// Number of failed delivery attempts so far.
    pub attempt_count: i32,

    pub max_attempts: i32,

    #[sqlx(try_from = "String")]
    pub status: DeliveryStatus,

    pub last_error: Option<String>,

    /// Message id returned by the transport on success.
    pub external_message_id: Option<String>,

    pub delivered_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

/// Data required to create a new queued notification.
///
/// `scheduled_at` defaults to "now" when omitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateQueuedNotification {
    pub notification_id: Option<String>,
    pub channel: Channel,
    pub recipient: String,
    pub subject: Option<String>,
    pub message: String,
    pub priority: i32,
    pub max_attempts: i32,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl CreateQueuedNotification {
    pub fn new(channel: Channel, recipient: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            notification_id: None,
            channel,
            recipient: recipient.into(),
            subject: None,
            message: message.into(),
            priority: 0,
            max_attempts: 3,
            scheduled_at: None,
            expires_at: None,
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_notification_id(mut self, notification_id: impl Into<String>) -> Self {
        self.notification_id = Some(notification_id.into());
        self
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    pub fn expires_at(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }
}

impl QueuedNotification {
    pub fn new(create: CreateQueuedNotification) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            notification_id: create.notification_id,
            channel: create.channel,
            recipient: create.recipient,
            subject: create.subject,
            message: create.message,
            priority: create.priority,
            scheduled_at: create.scheduled_at.unwrap_or(now),
            expires_at: create.expires_at,
            attempt_count: 0,
            max_attempts: create.max_attempts,
            status: DeliveryStatus::Pending,
            last_error: None,
            external_message_id: None,
            delivered_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// True when attempts remain and the last cycle ended in a failure.
    pub fn is_retryable(&self) -> bool {
        self.attempt_count < self.max_attempts
            && matches!(
                self.status,
                DeliveryStatus::Failed | DeliveryStatus::Retrying
            )
    }

    /// True when the notification is pending and its schedule has arrived.
    pub fn should_be_processed(&self) -> bool {
        self.status == DeliveryStatus::Pending && Utc::now() >= self.scheduled_at
    }

    /// Claim eligibility: fresh pending items and rescheduled retries whose
    /// delay has elapsed.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        matches!(
            self.status,
            DeliveryStatus::Pending | DeliveryStatus::Retrying
        ) && now >= self.scheduled_at
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| exp <= now)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn mark_as_processing(&mut self) -> AppResult<()> {
        match self.status {
            DeliveryStatus::Pending | DeliveryStatus::Retrying => {
                self.set_status(DeliveryStatus::Processing);
                Ok(())
            }
            from => Err(AppError::InvalidStatusTransition {
                from,
                to: DeliveryStatus::Processing,
            }),
        }
    }

    pub fn mark_as_delivered(&mut self, external_message_id: Option<String>) -> AppResult<()> {
        self.expect_status(DeliveryStatus::Processing, DeliveryStatus::Delivered)?;
        let now = Utc::now();
        self.status = DeliveryStatus::Delivered;
        self.last_error = None;
        self.external_message_id = external_message_id;
        self.delivered_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Record a failed attempt. Whether to retry is decided by the retry policy.
    pub fn mark_as_failed(&mut self, error: impl Into<String>) -> AppResult<()> {
        self.expect_status(DeliveryStatus::Processing, DeliveryStatus::Failed)?;
        self.attempt_count += 1;
        self.last_error = Some(error.into());
        self.set_status(DeliveryStatus::Failed);
        Ok(())
    }

    /// Reschedule a failed notification `delay` from now.
    pub fn schedule_retry(&mut self, delay: Duration) -> AppResult<()> {
        if self.attempt_count >= self.max_attempts {
            return Err(AppError::MaxRetryAttemptsExceeded(self.max_attempts));
        }
        self.expect_status(DeliveryStatus::Failed, DeliveryStatus::Retrying)?;

        let delay = chrono::Duration::from_std(delay)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("retry delay out of range: {}", e)))?;
        let now = Utc::now();
        self.status = DeliveryStatus::Retrying;
        self.scheduled_at = now + delay;
        self.updated_at = now;
        Ok(())
    }

    /// Put a claimed notification back without consuming an attempt. It is
    /// not claimable again before `until`.
    pub fn defer(&mut self, until: DateTime<Utc>) -> AppResult<()> {
        self.expect_status(DeliveryStatus::Processing, DeliveryStatus::Pending)?;
        self.set_status(DeliveryStatus::Pending);
        self.scheduled_at = self.scheduled_at.max(until);
        Ok(())
    }

    pub fn mark_as_cancelled(&mut self) -> AppResult<()> {
        self.end_active(DeliveryStatus::Cancelled)
    }

    pub fn mark_as_expired(&mut self) -> AppResult<()> {
        self.end_active(DeliveryStatus::Expired)
    }

    /// Return a dead-lettered notification to the queue with a fresh attempt budget.
    pub fn reset_for_replay(&mut self) -> AppResult<()> {
        self.expect_status(DeliveryStatus::Failed, DeliveryStatus::Pending)?;
        let now = Utc::now();
        self.status = DeliveryStatus::Pending;
        self.attempt_count = 0;
        self.last_error = None;
        self.scheduled_at = now;
        self.updated_at = now;
        Ok(())
    }

    /// Refresh the claim timestamp of a processing notification.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    fn end_active(&mut self, to: DeliveryStatus) -> AppResult<()> {
        if !self.status.is_active() {
            return Err(AppError::InvalidStatusTransition {
                from: self.status,
                to,
            });
        }
        self.set_status(to);
        Ok(())
    }

    fn expect_status(&self, expected: DeliveryStatus, to: DeliveryStatus) -> AppResult<()> {
        if self.status == expected {
            Ok(())
        } else {
            Err(AppError::InvalidStatusTransition {
                from: self.status,
                to,
            })
        }
    }

    fn set_status(&mut self, status: DeliveryStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> QueuedNotification {
        QueuedNotification::new(
            CreateQueuedNotification::new(Channel::Telegram, "123456789", "Build passed")
                .with_priority(1)
                .with_max_attempts(3),
        )
    }

    #[test]
    fn new_notification_is_pending_and_processable() {
        let n = sample();
        assert_eq!(n.status, DeliveryStatus::Pending);
        assert_eq!(n.attempt_count, 0);
        assert!(n.should_be_processed());
        assert_eq!(n.scheduled_at, n.created_at);
    }

    #[test]
    fn future_schedule_is_not_processable() {
        let n = QueuedNotification::new(
            CreateQueuedNotification::new(Channel::Email, "ops@example.com", "Deploy done")
                .scheduled_at(Utc::now() + chrono::Duration::minutes(10)),
        );
        assert!(!n.should_be_processed());
        assert!(!n.is_due(Utc::now()));
    }

    #[test]
    fn processing_only_from_pending_or_retrying() {
        let mut n = sample();
        n.mark_as_processing().unwrap();
        assert_eq!(n.status, DeliveryStatus::Processing);

        let err = n.mark_as_processing().unwrap_err();
        assert!(matches!(
            err,
            AppError::InvalidStatusTransition {
                from: DeliveryStatus::Processing,
                ..
            }
        ));
    }

    #[test]
    fn failure_increments_attempts_and_keeps_error() {
        let mut n = sample();
        n.mark_as_processing().unwrap();
        n.mark_as_failed("connection reset").unwrap();

        assert_eq!(n.status, DeliveryStatus::Failed);
        assert_eq!(n.attempt_count, 1);
        assert_eq!(n.last_error.as_deref(), Some("connection reset"));
        assert!(n.is_retryable());
    }

    #[test]
    fn schedule_retry_moves_schedule_forward() {
        let mut n = sample();
        n.mark_as_processing().unwrap();
        n.mark_as_failed("timeout").unwrap();
        n.schedule_retry(Duration::from_secs(30)).unwrap();

        assert_eq!(n.status, DeliveryStatus::Retrying);
        assert_eq!(n.scheduled_at - n.updated_at, chrono::Duration::seconds(30));
        assert!(!n.should_be_processed());
        assert!(!n.is_due(Utc::now()));
        assert!(n.is_due(Utc::now() + chrono::Duration::seconds(31)));

        n.mark_as_processing().unwrap();
        assert_eq!(n.status, DeliveryStatus::Processing);
    }

    #[test]
    fn schedule_retry_beyond_max_attempts_fails_without_change() {
        let mut n = sample();
        for _ in 0..3 {
            n.mark_as_processing().unwrap();
            n.mark_as_failed("boom").unwrap();
            if n.attempt_count < n.max_attempts {
                n.schedule_retry(Duration::from_secs(1)).unwrap();
            }
        }

        assert_eq!(n.attempt_count, 3);
        let before = n.clone();
        let err = n.schedule_retry(Duration::from_secs(1)).unwrap_err();
        assert!(err.to_string().contains("maximum retry attempts"));
        assert_eq!(n.status, DeliveryStatus::Failed);
        assert_eq!(n.scheduled_at, before.scheduled_at);
        assert_eq!(n.updated_at, before.updated_at);
        assert!(!n.is_retryable());
    }

    #[test]
    fn delivered_clears_error() {
        let mut n = sample();
        n.mark_as_processing().unwrap();
        n.mark_as_failed("timeout").unwrap();
        n.schedule_retry(Duration::ZERO).unwrap();
        n.mark_as_processing().unwrap();
        n.mark_as_delivered(Some("42".into())).unwrap();

        assert_eq!(n.status, DeliveryStatus::Delivered);
        assert!(n.last_error.is_none());
        assert!(n.delivered_at.is_some());
        assert_eq!(n.external_message_id.as_deref(), Some("42"));
        assert!(n.is_terminal());
    }

    #[test]
    fn cancel_only_from_active_states() {
        let mut n = sample();
        n.mark_as_cancelled().unwrap();
        assert_eq!(n.status, DeliveryStatus::Cancelled);
        assert!(n.mark_as_expired().is_err());
    }

    #[test]
    fn defer_returns_to_pending_without_attempt() {
        let mut n = sample();
        n.mark_as_processing().unwrap();
        let window_end = Utc::now() + chrono::Duration::seconds(45);
        n.defer(window_end).unwrap();
        assert_eq!(n.status, DeliveryStatus::Pending);
        assert_eq!(n.attempt_count, 0);
        assert_eq!(n.scheduled_at, window_end);
        assert!(!n.is_due(Utc::now()));
        assert!(n.is_due(window_end));
    }

    #[test]
    fn replay_resets_attempt_budget() {
        let mut n = sample();
        n.mark_as_processing().unwrap();
        n.mark_as_failed("unauthorized").unwrap();
        n.reset_for_replay().unwrap();

        assert_eq!(n.status, DeliveryStatus::Pending);
        assert_eq!(n.attempt_count, 0);
        assert!(n.last_error.is_none());
        assert!(n.should_be_processed());
    }

    #[test]
    fn expiry_uses_deadline() {
        let now = Utc::now();
        let n = QueuedNotification::new(
            CreateQueuedNotification::new(Channel::Slack, "https://hooks.slack.test/x", "hi")
                .expires_at(now - chrono::Duration::seconds(1)),
        );
        assert!(n.is_expired(now));
        assert!(!sample().is_expired(now));
    }
}
