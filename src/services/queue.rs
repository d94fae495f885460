//! Queue contract plus the in-memory implementation.
//!
//! The SQLite implementation lives in `db::repository`.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::db::models::{DeliveryStatus, QueuedNotification};
use crate::error::{AppError, AppResult};

/// How long a claimed notification may stay `processing` before another
/// claim may take it over.
pub const DEFAULT_PROCESSING_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Ordered storage for queued notifications.
///
/// Claims are atomic: a notification is returned by at most one
/// `dequeue`/`dequeue_by_priority` call until it leaves `processing` or its
/// claim goes stale.
#[async_trait]
pub trait DeliveryQueue: Send + Sync {
    async fn enqueue(&self, notification: &QueuedNotification) -> AppResult<()>;

    /// Claim the single most urgent due notification.
    async fn dequeue(&self) -> AppResult<Option<QueuedNotification>> {
        Ok(self.dequeue_by_priority(1).await?.into_iter().next())
    }

    /// Claim up to `limit` due notifications ordered by priority (desc),
    /// scheduled time, creation time and enqueue order. Claimed items are
    /// returned with status `processing`.
    async fn dequeue_by_priority(&self, limit: usize) -> AppResult<Vec<QueuedNotification>>;

    /// Persist every mutable field of `notification`, provided the stored
    /// row is still in status `expected`. Otherwise nothing is written and
    /// `AppError::ConcurrentModification` is returned.
    async fn update(
        &self,
        notification: &QueuedNotification,
        expected: DeliveryStatus,
    ) -> AppResult<()>;

    /// Overwrite status and last error only. Attempt counters are untouched.
    async fn update_status(
        &self,
        id: &str,
        status: DeliveryStatus,
        error: Option<String>,
    ) -> AppResult<()>;

    async fn get_pending_count(&self) -> AppResult<i64>;

    async fn get_queued_notification(&self, id: &str) -> AppResult<QueuedNotification>;

    /// Remove terminal notifications last touched before `older_than`.
    async fn delete_processed_notifications(&self, older_than: DateTime<Utc>) -> AppResult<u64>;

    /// Dead-letter view, most recently failed first.
    async fn get_failed_notifications(&self, limit: usize) -> AppResult<Vec<QueuedNotification>>;

    async fn get_status_counts(&self) -> AppResult<BTreeMap<DeliveryStatus, i64>>;
}

struct Slot {
    seq: u64,
    notification: QueuedNotification,
}

#[derive(Default)]
struct MemoryState {
    next_seq: u64,
    slots: HashMap<String, Slot>,
}

/// Mutex-guarded in-memory queue. Every claim runs inside a single critical
/// section so concurrent callers never receive the same notification.
pub struct InMemoryDeliveryQueue {
    state: Mutex<MemoryState>,
    processing_timeout: Duration,
}

impl Default for InMemoryDeliveryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryDeliveryQueue {
    pub fn new() -> Self {
        Self::with_processing_timeout(DEFAULT_PROCESSING_TIMEOUT)
    }

    pub fn with_processing_timeout(processing_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            processing_timeout,
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn claimable(&self, n: &QueuedNotification, now: DateTime<Utc>) -> bool {
        if n.is_due(now) {
            return true;
        }
        n.status == DeliveryStatus::Processing
            && chrono::Duration::from_std(self.processing_timeout)
                .map(|timeout| n.updated_at + timeout <= now)
                .unwrap_or(false)
    }
}

#[async_trait]
impl DeliveryQueue for InMemoryDeliveryQueue {
    async fn enqueue(&self, notification: &QueuedNotification) -> AppResult<()> {
        let mut state = self.state.lock();
        if state.slots.contains_key(&notification.id) {
            return Err(AppError::BadRequest(format!(
                "Notification {} is already queued",
                notification.id
            )));
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.slots.insert(
            notification.id.clone(),
            Slot {
                seq,
                notification: notification.clone(),
            },
        );
        Ok(())
    }

    async fn dequeue_by_priority(&self, limit: usize) -> AppResult<Vec<QueuedNotification>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let now = Utc::now();
        let mut state = self.state.lock();

        let mut due: Vec<_> = state
            .slots
            .values()
            .filter(|slot| self.claimable(&slot.notification, now))
            .map(|slot| {
                let n = &slot.notification;
                (
                    (Reverse(n.priority), n.scheduled_at, n.created_at, slot.seq),
                    n.id.clone(),
                )
            })
            .collect();
        due.sort_unstable_by(|a, b| a.0.cmp(&b.0));
        due.truncate(limit);

        let mut claimed = Vec::with_capacity(due.len());
        for (_, id) in due {
            if let Some(slot) = state.slots.get_mut(&id) {
                let n = &mut slot.notification;
                if n.status == DeliveryStatus::Processing {
                    n.touch();
                } else {
                    n.mark_as_processing()?;
                }
                claimed.push(n.clone());
            }
        }
        Ok(claimed)
    }

    async fn update(
        &self,
        notification: &QueuedNotification,
        expected: DeliveryStatus,
    ) -> AppResult<()> {
        let mut state = self.state.lock();
        let slot = state
            .slots
            .get_mut(&notification.id)
            .ok_or_else(|| AppError::NotFound(format!("Queued notification {}", notification.id)))?;
        if slot.notification.status != expected {
            return Err(AppError::ConcurrentModification {
                id: notification.id.clone(),
                expected,
            });
        }
        slot.notification = notification.clone();
        Ok(())
    }

    async fn update_status(
        &self,
        id: &str,
        status: DeliveryStatus,
        error: Option<String>,
    ) -> AppResult<()> {
        let mut state = self.state.lock();
        let slot = state
            .slots
            .get_mut(id)
            .ok_or_else(|| AppError::NotFound(format!("Queued notification {}", id)))?;
        slot.notification.status = status;
        slot.notification.last_error = error;
        slot.notification.updated_at = Utc::now();
        Ok(())
    }

    async fn get_pending_count(&self) -> AppResult<i64> {
        let state = self.state.lock();
        Ok(state
            .slots
            .values()
            .filter(|s| s.notification.status == DeliveryStatus::Pending)
            .count() as i64)
    }

    async fn get_queued_notification(&self, id: &str) -> AppResult<QueuedNotification> {
        self.state
            .lock()
            .slots
            .get(id)
            .map(|s| s.notification.clone())
            .ok_or_else(|| AppError::NotFound(format!("Queued notification {}", id)))
    }

    async fn delete_processed_notifications(&self, older_than: DateTime<Utc>) -> AppResult<u64> {
        let mut state = self.state.lock();
        let before = state.slots.len();
        state.slots.retain(|_, slot| {
            let n = &slot.notification;
            !(n.is_terminal() && n.updated_at < older_than)
        });
        Ok((before - state.slots.len()) as u64)
    }

    async fn get_failed_notifications(&self, limit: usize) -> AppResult<Vec<QueuedNotification>> {
        let state = self.state.lock();
        let mut failed: Vec<_> = state
            .slots
            .values()
            .filter(|s| s.notification.status == DeliveryStatus::Failed)
            .map(|s| s.notification.clone())
            .collect();
        failed.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        failed.truncate(limit);
        Ok(failed)
    }

    async fn get_status_counts(&self) -> AppResult<BTreeMap<DeliveryStatus, i64>> {
        let state = self.state.lock();
        let mut counts = BTreeMap::new();
        for slot in state.slots.values() {
            *counts.entry(slot.notification.status).or_insert(0) += 1;
        }
        Ok(counts)
    }
}
