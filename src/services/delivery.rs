//! Notification delivery orchestrator.
//!
//! Ties the queue, the rate limiter, the retry policies and the channel
//! registry together. The service owns no timer: callers drive it by
//! invoking [`NotificationDeliveryService::process_queue`] periodically.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::db::models::{Channel, CreateQueuedNotification, DeliveryStatus, QueuedNotification};
use crate::error::{AppError, AppResult};
use crate::services::channels::{ChannelError, DeliveryChannel};
use crate::services::queue::DeliveryQueue;
use crate::services::rate_limiter::{RateLimitRule, RateLimiter};
use crate::services::retry::RetryPolicies;

/// Worker knobs for queue processing.
#[derive(Debug, Clone)]
pub struct DeliveryOptions {
    /// Maximum notifications sent in parallel within one `process_queue` call.
    pub concurrency: usize,
    /// Upper bound for a single channel `send`.
    pub send_timeout: Duration,
}

impl Default for DeliveryOptions {
    fn default() -> Self {
        Self {
            concurrency: 10,
            send_timeout: Duration::from_secs(30),
        }
    }
}

/// Per-call tally returned by `process_queue`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcessQueueSummary {
    pub claimed: usize,
    pub delivered: usize,
    pub retried: usize,
    pub failed: usize,
    pub deferred: usize,
    pub expired: usize,
    /// Items cancelled or reclaimed elsewhere while in flight; their outcome
    /// was dropped.
    pub superseded: usize,
    /// Items whose outcome could not be persisted.
    pub errors: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Delivered,
    Retried,
    Failed,
    Deferred,
    Expired,
    Superseded,
}

impl ProcessQueueSummary {
    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Delivered => self.delivered += 1,
            Outcome::Retried => self.retried += 1,
            Outcome::Failed => self.failed += 1,
            Outcome::Deferred => self.deferred += 1,
            Outcome::Expired => self.expired += 1,
            Outcome::Superseded => self.superseded += 1,
        }
    }
}

pub struct NotificationDeliveryService {
    queue: Arc<dyn DeliveryQueue>,
    rate_limiter: Arc<RateLimiter>,
    retry_policies: Arc<RetryPolicies>,
    channels: RwLock<HashMap<Channel, Arc<dyn DeliveryChannel>>>,
    options: DeliveryOptions,
}

impl NotificationDeliveryService {
    pub fn new(
        queue: Arc<dyn DeliveryQueue>,
        rate_limiter: Arc<RateLimiter>,
        retry_policies: Arc<RetryPolicies>,
    ) -> Self {
        Self {
            queue,
            rate_limiter,
            retry_policies,
            channels: RwLock::new(HashMap::new()),
            options: DeliveryOptions::default(),
        }
    }

    pub fn with_options(mut self, options: DeliveryOptions) -> Self {
        self.options = DeliveryOptions {
            concurrency: options.concurrency.max(1),
            ..options
        };
        self
    }

    pub fn queue(&self) -> &Arc<dyn DeliveryQueue> {
        &self.queue
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    pub fn retry_policies(&self) -> &Arc<RetryPolicies> {
        &self.retry_policies
    }

    /// Register a sender. A later registration for the same channel replaces
    /// the earlier one. The channel's rate rule is tightened to the limit the
    /// sender advertises when the configured rule is looser.
    pub async fn register_delivery_channel(&self, channel: Arc<dyn DeliveryChannel>) {
        let kind = channel.channel_type();
        self.apply_provider_limits(channel.as_ref());
        let replaced = self.channels.write().await.insert(kind, channel).is_some();
        if replaced {
            tracing::info!("Replaced delivery channel {}", kind);
        } else {
            tracing::info!("Registered delivery channel {}", kind);
        }
    }

    fn apply_provider_limits(&self, channel: &dyn DeliveryChannel) {
        let kind = channel.channel_type();
        let (max_requests, window_size) = channel.rate_limit_info();
        let rule = self.rate_limiter.get_rule(kind);

        // Compare max/window ratios without dividing.
        let configured = u128::from(rule.max_requests) * window_size.as_millis();
        let provider = u128::from(max_requests) * rule.window_size.as_millis();
        if configured > provider {
            let tightened = RateLimitRule {
                max_requests,
                window_size,
                burst_limit: 0,
            };
            match self.rate_limiter.set_rule(kind, tightened) {
                Ok(()) => tracing::info!(
                    "Rate limit for {} tightened to provider limit {} per {:?}",
                    kind,
                    max_requests,
                    window_size
                ),
                Err(e) => tracing::warn!("Ignoring provider rate limit for {}: {}", kind, e),
            }
        }

        let policy = self.retry_policies.for_channel(kind);
        if i64::from(policy.max_retry_attempts()) > i64::from(channel.max_retries()) {
            tracing::warn!(
                "Retry policy for {} allows {} attempts, sender recommends at most {}",
                kind,
                policy.max_retry_attempts(),
                channel.max_retries()
            );
        }
    }

    /// Returns whether a sender was registered for `kind`.
    pub async fn unregister_delivery_channel(&self, kind: Channel) -> bool {
        self.channels.write().await.remove(&kind).is_some()
    }

    pub async fn registered_channels(&self) -> Vec<Channel> {
        let mut kinds: Vec<_> = self.channels.read().await.keys().copied().collect();
        kinds.sort();
        kinds
    }

    /// Validate and persist a new notification. Nothing is sent here.
    pub async fn queue_notification(
        &self,
        create: CreateQueuedNotification,
    ) -> AppResult<QueuedNotification> {
        if create.recipient.trim().is_empty() {
            return Err(AppError::Validation(
                "notification recipient cannot be empty".into(),
            ));
        }
        if create.message.is_empty() {
            return Err(AppError::Validation(
                "notification message cannot be empty".into(),
            ));
        }
        if create.max_attempts < 1 {
            return Err(AppError::Validation(
                "notification max attempts must be at least 1".into(),
            ));
        }

        let notification = QueuedNotification::new(create);
        self.queue.enqueue(&notification).await?;

        tracing::debug!(
            "Queued notification {} via {} (priority {})",
            notification.id,
            notification.channel,
            notification.priority
        );
        Ok(notification)
    }

    pub fn check_rate_limit(&self, channel: Channel, recipient: &str) -> bool {
        self.rate_limiter.allow(recipient, channel)
    }

    /// Send immediately, bypassing the queue and the rate limiter.
    pub async fn send_notification(
        &self,
        channel: Channel,
        recipient: &str,
        subject: Option<&str>,
        message: &str,
    ) -> AppResult<String> {
        let sender = self
            .channels
            .read()
            .await
            .get(&channel)
            .cloned()
            .ok_or(AppError::ChannelNotRegistered(channel))?;

        if !sender.is_available().await {
            return Err(AppError::ChannelUnavailable(channel));
        }

        self.send_with_timeout(sender.as_ref(), recipient, subject, message)
            .await
            .map_err(|source| AppError::Delivery { channel, source })
    }

    /// Claim up to `limit` due notifications and drive each one through a
    /// delivery attempt. Only a failing claim aborts the call.
    pub async fn process_queue(&self, limit: usize) -> AppResult<ProcessQueueSummary> {
        let claimed = self.queue.dequeue_by_priority(limit).await?;
        if claimed.is_empty() {
            return Ok(ProcessQueueSummary::default());
        }

        let summary = parking_lot::Mutex::new(ProcessQueueSummary {
            claimed: claimed.len(),
            ..Default::default()
        });

        stream::iter(claimed)
            .for_each_concurrent(self.options.concurrency, |notification| {
                let summary = &summary;
                async move {
                    let id = notification.id.clone();
                    match self.process_one(notification).await {
                        Ok(outcome) => summary.lock().record(outcome),
                        Err(e) => {
                            tracing::warn!("Failed to process queued notification {}: {:?}", id, e);
                            summary.lock().errors += 1;
                        }
                    }
                }
            })
            .await;

        let summary = summary.into_inner();
        tracing::info!(
            "Processed {} queued notifications: {} delivered, {} retrying, {} failed, {} deferred, {} expired, {} superseded, {} errors",
            summary.claimed,
            summary.delivered,
            summary.retried,
            summary.failed,
            summary.deferred,
            summary.expired,
            summary.superseded,
            summary.errors
        );
        Ok(summary)
    }

    async fn process_one(&self, mut n: QueuedNotification) -> AppResult<Outcome> {
        if n.is_expired(Utc::now()) {
            n.mark_as_expired()?;
            tracing::info!("Notification {} expired before delivery", n.id);
            return self.settle(&n, Outcome::Expired).await;
        }

        if !self.rate_limiter.allow(&n.recipient, n.channel) {
            let window_end = self.rate_limiter.get_reset_time(&n.recipient, n.channel);
            n.defer(window_end)?;
            tracing::debug!(
                "Rate limit deferred notification {} ({}) until {}",
                n.id,
                n.channel,
                window_end
            );
            return self.settle(&n, Outcome::Deferred).await;
        }

        let sender = self.channels.read().await.get(&n.channel).cloned();
        let result = match sender {
            Some(sender) => {
                self.send_with_timeout(sender.as_ref(), &n.recipient, n.subject.as_deref(), &n.message)
                    .await
            }
            None => Err(ChannelError::Unavailable(format!(
                "Delivery channel {} not registered",
                n.channel
            ))),
        };

        match result {
            Ok(message_id) => {
                n.mark_as_delivered(Some(message_id))?;
                let outcome = self.settle(&n, Outcome::Delivered).await?;
                if outcome == Outcome::Superseded {
                    return Ok(outcome);
                }
                tracing::info!(
                    "Delivered notification {} via {} after {} failed attempts",
                    n.id,
                    n.channel,
                    n.attempt_count
                );
                Ok(Outcome::Delivered)
            }
            Err(err) => self.handle_failure(n, err).await,
        }
    }

    async fn handle_failure(&self, mut n: QueuedNotification, err: ChannelError) -> AppResult<Outcome> {
        n.mark_as_failed(err.to_string())?;

        let policy = self.retry_policies.for_channel(n.channel);
        let retry = policy.should_retry(n.attempt_count, &err)
            && policy.retry_window_open(n.created_at, Utc::now())
            && n.is_retryable();

        if retry {
            let delay = policy.calculate_retry_delay(n.attempt_count);
            n.schedule_retry(delay)?;
            if self.settle(&n, Outcome::Retried).await? == Outcome::Superseded {
                return Ok(Outcome::Superseded);
            }
            tracing::warn!(
                "Delivery of {} via {} failed (attempt {}/{}), retrying in {:?}: {}",
                n.id,
                n.channel,
                n.attempt_count,
                n.max_attempts,
                delay,
                err
            );
            return Ok(Outcome::Retried);
        }

        if self.settle(&n, Outcome::Failed).await? == Outcome::Superseded {
            return Ok(Outcome::Superseded);
        }
        if policy.enable_dead_letter_queue() {
            tracing::warn!(
                "Notification {} via {} moved to dead-letter after {} attempts: {}",
                n.id,
                n.channel,
                n.attempt_count,
                err
            );
        } else {
            tracing::warn!(
                "Notification {} via {} failed permanently after {} attempts: {}",
                n.id,
                n.channel,
                n.attempt_count,
                err
            );
        }
        Ok(Outcome::Failed)
    }

    /// Persist the result of a claimed notification. A row that left
    /// `processing` meanwhile (cancelled by an operator) keeps its state.
    async fn settle(&self, n: &QueuedNotification, outcome: Outcome) -> AppResult<Outcome> {
        match self.queue.update(n, DeliveryStatus::Processing).await {
            Ok(()) => Ok(outcome),
            Err(AppError::ConcurrentModification { .. }) => {
                tracing::info!(
                    "Notification {} changed while in flight, dropping {:?} result",
                    n.id,
                    outcome
                );
                Ok(Outcome::Superseded)
            }
            Err(e) => Err(e),
        }
    }

    async fn send_with_timeout(
        &self,
        sender: &dyn DeliveryChannel,
        recipient: &str,
        subject: Option<&str>,
        message: &str,
    ) -> Result<String, ChannelError> {
        let timeout = self.options.send_timeout;
        match tokio::time::timeout(timeout, sender.send(recipient, subject, message)).await {
            Ok(result) => result,
            Err(_) => Err(ChannelError::Timeout(timeout)),
        }
    }

    /// `pending_count` plus one entry per delivery status.
    pub async fn get_queue_stats(&self) -> AppResult<BTreeMap<String, i64>> {
        let mut stats = BTreeMap::new();
        stats.insert("pending_count".to_string(), self.queue.get_pending_count().await?);

        let counts = self.queue.get_status_counts().await?;
        for status in DeliveryStatus::ALL {
            stats.insert(
                status.as_str().to_string(),
                counts.get(&status).copied().unwrap_or(0),
            );
        }
        Ok(stats)
    }

    pub async fn get_failed_notifications(&self, limit: usize) -> AppResult<Vec<QueuedNotification>> {
        self.queue.get_failed_notifications(limit).await
    }

    pub async fn cancel_notification(&self, id: &str) -> AppResult<QueuedNotification> {
        let mut n = self.queue.get_queued_notification(id).await?;
        let current = n.status;
        n.mark_as_cancelled()?;
        self.queue.update(&n, current).await?;
        tracing::info!("Cancelled notification {}", id);
        Ok(n)
    }

    /// Put a dead-lettered notification back in the queue with a fresh
    /// attempt budget.
    pub async fn replay_notification(&self, id: &str) -> AppResult<QueuedNotification> {
        let mut n = self.queue.get_queued_notification(id).await?;
        n.reset_for_replay()?;
        self.queue.update(&n, DeliveryStatus::Failed).await?;
        tracing::info!("Replaying notification {} via {}", id, n.channel);
        Ok(n)
    }

    pub async fn purge_processed(&self, older_than: DateTime<Utc>) -> AppResult<u64> {
        let removed = self.queue.delete_processed_notifications(older_than).await?;
        if removed > 0 {
            tracing::info!("Purged {} processed notifications", removed);
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::services::queue::InMemoryDeliveryQueue;

    struct MockChannel {
        kind: Channel,
        fail_times: u32,
        error: ChannelError,
        calls: AtomicU32,
        available: bool,
        delay: Duration,
        rate_limit: (u32, Duration),
    }

    impl MockChannel {
        fn ok(kind: Channel) -> Self {
            Self::failing(kind, 0, ChannelError::Transport("unused".into()))
        }

        fn failing(kind: Channel, fail_times: u32, error: ChannelError) -> Self {
            Self {
                kind,
                fail_times,
                error,
                calls: AtomicU32::new(0),
                available: true,
                delay: Duration::ZERO,
                rate_limit: (100, Duration::from_secs(60)),
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl DeliveryChannel for MockChannel {
        async fn send(
            &self,
            _recipient: &str,
            _subject: Option<&str>,
            _message: &str,
        ) -> Result<String, ChannelError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if n < self.fail_times {
                Err(self.error.clone())
            } else {
                Ok(format!("msg-{}", n))
            }
        }

        fn channel_type(&self) -> Channel {
            self.kind
        }

        async fn is_available(&self) -> bool {
            self.available
        }

        fn rate_limit_info(&self) -> (u32, Duration) {
            self.rate_limit
        }
    }

    fn service() -> (NotificationDeliveryService, Arc<InMemoryDeliveryQueue>) {
        let queue = Arc::new(InMemoryDeliveryQueue::new());
        let svc = NotificationDeliveryService::new(
            queue.clone(),
            Arc::new(RateLimiter::new()),
            Arc::new(RetryPolicies::new()),
        );
        (svc, queue)
    }

    async fn make_due(queue: &InMemoryDeliveryQueue, id: &str) {
        let mut n = queue.get_queued_notification(id).await.unwrap();
        n.scheduled_at = Utc::now() - chrono::Duration::seconds(1);
        queue.update(&n, n.status).await.unwrap();
    }

    #[tokio::test]
    async fn queue_notification_validates_input() {
        let (svc, queue) = service();
        let err = svc
            .queue_notification(CreateQueuedNotification::new(Channel::Telegram, " ", "hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        let err = svc
            .queue_notification(
                CreateQueuedNotification::new(Channel::Telegram, "1", "hi").with_max_attempts(0),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn successful_delivery_stores_message_id() {
        let (svc, queue) = service();
        let channel = Arc::new(MockChannel::ok(Channel::Slack));
        svc.register_delivery_channel(channel.clone()).await;

        let n = svc
            .queue_notification(CreateQueuedNotification::new(Channel::Slack, "https://hooks.test/x", "green"))
            .await
            .unwrap();
        let summary = svc.process_queue(10).await.unwrap();
        assert_eq!(summary.claimed, 1);
        assert_eq!(summary.delivered, 1);

        let stored = queue.get_queued_notification(&n.id).await.unwrap();
        assert_eq!(stored.status, DeliveryStatus::Delivered);
        assert_eq!(stored.external_message_id.as_deref(), Some("msg-0"));
        assert_eq!(channel.calls(), 1);
    }

    #[tokio::test]
    async fn permanent_error_dead_letters_immediately() {
        let (svc, queue) = service();
        svc.register_delivery_channel(Arc::new(MockChannel::failing(
            Channel::Telegram,
            10,
            ChannelError::InvalidRecipient("chat not found".into()),
        )))
        .await;

        let n = svc
            .queue_notification(CreateQueuedNotification::new(Channel::Telegram, "1", "red"))
            .await
            .unwrap();
        let summary = svc.process_queue(10).await.unwrap();
        assert_eq!(summary.failed, 1);

        let stored = queue.get_queued_notification(&n.id).await.unwrap();
        assert_eq!(stored.status, DeliveryStatus::Failed);
        assert_eq!(stored.attempt_count, 1);

        let dead = svc.get_failed_notifications(10).await.unwrap();
        assert_eq!(dead.len(), 1);

        let replayed = svc.replay_notification(&n.id).await.unwrap();
        assert_eq!(replayed.status, DeliveryStatus::Pending);
        assert_eq!(replayed.attempt_count, 0);
    }

    #[tokio::test]
    async fn retries_until_attempts_exhausted() {
        let (svc, queue) = service();
        svc.register_delivery_channel(Arc::new(MockChannel::failing(
            Channel::Webhook,
            10,
            ChannelError::Unavailable("502".into()),
        )))
        .await;

        let n = svc
            .queue_notification(
                CreateQueuedNotification::new(Channel::Webhook, "https://ci.test/hook", "x")
                    .with_max_attempts(2),
            )
            .await
            .unwrap();

        let first = svc.process_queue(10).await.unwrap();
        assert_eq!(first.retried, 1);
        let stored = queue.get_queued_notification(&n.id).await.unwrap();
        assert_eq!(stored.status, DeliveryStatus::Retrying);
        assert!(svc.process_queue(10).await.unwrap().claimed == 0);

        make_due(&queue, &n.id).await;
        let second = svc.process_queue(10).await.unwrap();
        assert_eq!(second.failed, 1);
        let stored = queue.get_queued_notification(&n.id).await.unwrap();
        assert_eq!(stored.status, DeliveryStatus::Failed);
        assert_eq!(stored.attempt_count, 2);
    }

    #[tokio::test]
    async fn rate_limited_items_are_deferred_without_attempt() {
        let (svc, queue) = service();
        svc.rate_limiter()
            .set_rule(Channel::Email, RateLimitRule::per_minute(1, 0))
            .unwrap();
        svc.register_delivery_channel(Arc::new(MockChannel::ok(Channel::Email)))
            .await;

        let a = svc
            .queue_notification(CreateQueuedNotification::new(Channel::Email, "a@example.com", "1"))
            .await
            .unwrap();
        let b = svc
            .queue_notification(CreateQueuedNotification::new(Channel::Email, "a@example.com", "2"))
            .await
            .unwrap();

        let summary = svc.process_queue(10).await.unwrap();
        assert_eq!(summary.delivered, 1);
        assert_eq!(summary.deferred, 1);

        let mut statuses = Vec::new();
        for id in [&a.id, &b.id] {
            let n = queue.get_queued_notification(id).await.unwrap();
            statuses.push((n.status, n.attempt_count));
        }
        assert!(statuses.contains(&(DeliveryStatus::Delivered, 0)));
        assert!(statuses.contains(&(DeliveryStatus::Pending, 0)));

        // The deferred item waits for the limiter window to reset.
        assert_eq!(svc.process_queue(10).await.unwrap().claimed, 0);
        let reset = svc.rate_limiter().get_reset_time("a@example.com", Channel::Email);
        for id in [&a.id, &b.id] {
            let n = queue.get_queued_notification(id).await.unwrap();
            if n.status == DeliveryStatus::Pending {
                assert_eq!(n.scheduled_at, reset);
            }
        }
    }

    #[tokio::test]
    async fn throttled_items_do_not_starve_other_channels() {
        let (svc, queue) = service();
        svc.rate_limiter()
            .set_rule(Channel::Email, RateLimitRule::per_minute(1, 0))
            .unwrap();
        svc.register_delivery_channel(Arc::new(MockChannel::ok(Channel::Email)))
            .await;
        svc.register_delivery_channel(Arc::new(MockChannel::ok(Channel::Telegram)))
            .await;

        for i in 0..3 {
            svc.queue_notification(
                CreateQueuedNotification::new(Channel::Email, "ops@example.com", format!("build {}", i))
                    .with_priority(5),
            )
            .await
            .unwrap();
        }
        let chat = svc
            .queue_notification(CreateQueuedNotification::new(Channel::Telegram, "42", "deploy done"))
            .await
            .unwrap();

        let first = svc.process_queue(2).await.unwrap();
        assert_eq!((first.delivered, first.deferred), (1, 1));

        let second = svc.process_queue(2).await.unwrap();
        assert_eq!(second.claimed, 2);
        assert_eq!((second.delivered, second.deferred), (1, 1));
        assert_eq!(
            queue.get_queued_notification(&chat.id).await.unwrap().status,
            DeliveryStatus::Delivered
        );

        assert_eq!(svc.process_queue(2).await.unwrap().claimed, 0);
        assert_eq!(queue.get_pending_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn cancel_during_send_stays_cancelled() {
        let (svc, queue) = service();
        let svc = Arc::new(svc);
        let mut slow = MockChannel::failing(
            Channel::Telegram,
            10,
            ChannelError::Transport("connection reset".into()),
        );
        slow.delay = Duration::from_millis(200);
        let slow = Arc::new(slow);
        svc.register_delivery_channel(slow.clone()).await;

        let n = svc
            .queue_notification(CreateQueuedNotification::new(Channel::Telegram, "1", "deploy"))
            .await
            .unwrap();

        let worker = tokio::spawn({
            let svc = svc.clone();
            async move { svc.process_queue(1).await.unwrap() }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let cancelled = svc.cancel_notification(&n.id).await.unwrap();
        assert_eq!(cancelled.status, DeliveryStatus::Cancelled);

        let summary = worker.await.unwrap();
        assert_eq!(summary.claimed, 1);
        assert_eq!(summary.superseded, 1);
        assert_eq!(summary.retried, 0);

        let stored = queue.get_queued_notification(&n.id).await.unwrap();
        assert_eq!(stored.status, DeliveryStatus::Cancelled);
        assert_eq!(stored.attempt_count, 0);
        assert_eq!(svc.process_queue(1).await.unwrap().claimed, 0);
        assert_eq!(slow.calls(), 1);
    }

    #[tokio::test]
    async fn registration_tightens_rule_to_provider_limit() {
        let (svc, _) = service();

        let mut strict = MockChannel::ok(Channel::Slack);
        strict.rate_limit = (5, Duration::from_secs(60));
        svc.register_delivery_channel(Arc::new(strict)).await;
        let rule = svc.rate_limiter().get_rule(Channel::Slack);
        assert_eq!(rule.max_requests, 5);
        assert_eq!(rule.burst_limit, 0);

        let mut generous = MockChannel::ok(Channel::Webhook);
        generous.rate_limit = (1000, Duration::from_secs(60));
        svc.register_delivery_channel(Arc::new(generous)).await;
        assert_eq!(
            svc.rate_limiter().get_rule(Channel::Webhook),
            RateLimitRule::default_for(Channel::Webhook)
        );
    }

    #[tokio::test]
    async fn unregistered_channel_is_a_retryable_failure_in_queue() {
        let (svc, queue) = service();
        let n = svc
            .queue_notification(CreateQueuedNotification::new(Channel::Slack, "https://hooks.test/x", "x"))
            .await
            .unwrap();
        let summary = svc.process_queue(1).await.unwrap();
        assert_eq!(summary.retried, 1);

        let stored = queue.get_queued_notification(&n.id).await.unwrap();
        assert!(stored.last_error.unwrap().contains("not registered"));
    }

    #[tokio::test]
    async fn expired_items_are_not_sent() {
        let (svc, queue) = service();
        let channel = Arc::new(MockChannel::ok(Channel::Telegram));
        svc.register_delivery_channel(channel.clone()).await;

        let n = svc
            .queue_notification(
                CreateQueuedNotification::new(Channel::Telegram, "1", "stale")
                    .expires_at(Utc::now() - chrono::Duration::seconds(1)),
            )
            .await
            .unwrap();
        assert_eq!(svc.process_queue(1).await.unwrap().expired, 1);
        assert_eq!(channel.calls(), 0);
        assert_eq!(
            queue.get_queued_notification(&n.id).await.unwrap().status,
            DeliveryStatus::Expired
        );
    }

    #[tokio::test]
    async fn slow_send_times_out_and_is_retried() {
        let queue = Arc::new(InMemoryDeliveryQueue::new());
        let svc = NotificationDeliveryService::new(
            queue.clone(),
            Arc::new(RateLimiter::new()),
            Arc::new(RetryPolicies::new()),
        )
        .with_options(DeliveryOptions {
            concurrency: 2,
            send_timeout: Duration::from_millis(20),
        });
        let mut slow = MockChannel::ok(Channel::Webhook);
        slow.delay = Duration::from_secs(5);
        svc.register_delivery_channel(Arc::new(slow)).await;

        let n = svc
            .queue_notification(CreateQueuedNotification::new(Channel::Webhook, "https://x.test", "x"))
            .await
            .unwrap();
        assert_eq!(svc.process_queue(1).await.unwrap().retried, 1);
        let stored = queue.get_queued_notification(&n.id).await.unwrap();
        assert!(stored.last_error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn direct_send_checks_registry_and_availability() {
        let (svc, _) = service();
        let err = svc
            .send_notification(Channel::Email, "a@example.com", None, "hi")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not registered"));

        let mut down = MockChannel::ok(Channel::Email);
        down.available = false;
        svc.register_delivery_channel(Arc::new(down)).await;
        let err = svc
            .send_notification(Channel::Email, "a@example.com", None, "hi")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::ChannelUnavailable(Channel::Email)));

        svc.register_delivery_channel(Arc::new(MockChannel::ok(Channel::Email)))
            .await;
        let id = svc
            .send_notification(Channel::Email, "a@example.com", Some("CI"), "hi")
            .await
            .unwrap();
        assert_eq!(id, "msg-0");

        assert!(svc.unregister_delivery_channel(Channel::Email).await);
        assert!(svc.registered_channels().await.is_empty());
    }

    #[tokio::test]
    async fn stats_cancel_and_purge() {
        let (svc, _) = service();
        let a = svc
            .queue_notification(CreateQueuedNotification::new(Channel::Telegram, "1", "a"))
            .await
            .unwrap();
        svc.queue_notification(CreateQueuedNotification::new(Channel::Telegram, "2", "b"))
            .await
            .unwrap();

        svc.cancel_notification(&a.id).await.unwrap();
        assert!(svc.cancel_notification(&a.id).await.is_err());

        let stats = svc.get_queue_stats().await.unwrap();
        assert_eq!(stats["pending_count"], 1);
        assert_eq!(stats["pending"], 1);
        assert_eq!(stats["cancelled"], 1);
        assert_eq!(stats["delivered"], 0);

        let removed = svc
            .purge_processed(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(removed, 1);
    }
}
