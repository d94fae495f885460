use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::db::models::{DeliveryStatus, QueuedNotification};
use crate::error::{AppError, AppResult};
use crate::services::queue::{DeliveryQueue, DEFAULT_PROCESSING_TIMEOUT};

const COLUMNS: &str = r#"
    id,
    notification_id,
    channel,
    recipient,
    subject,
    message,
    priority,
    scheduled_at,
    expires_at,
    attempt_count,
    max_attempts,
    status,
    last_error,
    external_message_id,
    delivered_at,
    created_at,
    updated_at
"#;

/// SQLite-backed delivery queue.
///
/// Implementation notes:
/// - Claiming uses an atomic single-statement UPDATE with a subselect:
///   `UPDATE ... WHERE id = (SELECT id FROM ... LIMIT 1) RETURNING ...`
///   run once per claimed row, so no long-lived transaction blocks writers.
/// - Timestamps are compared through `julianday()` so ordering does not depend
///   on the textual encoding of the stored values.
/// - A `processing` row whose `updated_at` is older than the processing
///   timeout is claimable again.
#[derive(Clone)]
pub struct SqliteDeliveryQueue {
    pool: SqlitePool,
    processing_timeout: Duration,
}

impl SqliteDeliveryQueue {
    pub fn new(pool: SqlitePool) -> Self {
        Self::with_processing_timeout(pool, DEFAULT_PROCESSING_TIMEOUT)
    }

    pub fn with_processing_timeout(pool: SqlitePool, processing_timeout: Duration) -> Self {
        Self {
            pool,
            processing_timeout,
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn stale_cutoff(&self, now: DateTime<Utc>) -> AppResult<DateTime<Utc>> {
        let timeout = chrono::Duration::from_std(self.processing_timeout)
            .map_err(|e| AppError::Config(format!("processing timeout out of range: {}", e)))?;
        Ok(now - timeout)
    }
}

#[async_trait]
impl DeliveryQueue for SqliteDeliveryQueue {
    async fn enqueue(&self, n: &QueuedNotification) -> AppResult<()> {
        sqlx::query(&format!(
            "INSERT INTO delivery_queue ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            COLUMNS
        ))
        .bind(&n.id)
        .bind(&n.notification_id)
        .bind(n.channel.as_str())
        .bind(&n.recipient)
        .bind(&n.subject)
        .bind(&n.message)
        .bind(n.priority)
        .bind(n.scheduled_at)
        .bind(n.expires_at)
        .bind(n.attempt_count)
        .bind(n.max_attempts)
        .bind(n.status.as_str())
        .bind(&n.last_error)
        .bind(&n.external_message_id)
        .bind(n.delivered_at)
        .bind(n.created_at)
        .bind(n.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn dequeue_by_priority(&self, limit: usize) -> AppResult<Vec<QueuedNotification>> {
        let mut claimed = Vec::new();

        let claim_sql = format!(
            r#"
            UPDATE delivery_queue
            SET status = 'processing', updated_at = ?
            WHERE id = (
                SELECT id FROM delivery_queue
                WHERE (status IN ('pending', 'retrying') AND julianday(scheduled_at) <= julianday(?))
                   OR (status = 'processing' AND julianday(updated_at) <= julianday(?))
                ORDER BY priority DESC,
                         julianday(scheduled_at) ASC,
                         julianday(created_at) ASC,
                         rowid ASC
                LIMIT 1
            )
            RETURNING {}
            "#,
            COLUMNS
        );

        for _ in 0..limit {
            let now = Utc::now();
            let stale = self.stale_cutoff(now)?;

            let row = sqlx::query_as::<_, QueuedNotification>(&claim_sql)
                .bind(now)
                .bind(now)
                .bind(stale)
                .fetch_optional(&self.pool)
                .await?;

            match row {
                Some(n) => claimed.push(n),
                None => break,
            }
        }

        Ok(claimed)
    }

    async fn update(&self, n: &QueuedNotification, expected: DeliveryStatus) -> AppResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE delivery_queue
            SET
                priority = ?,
                scheduled_at = ?,
                expires_at = ?,
                attempt_count = ?,
                max_attempts = ?,
                status = ?,
                last_error = ?,
                external_message_id = ?,
                delivered_at = ?,
                updated_at = ?
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(n.priority)
        .bind(n.scheduled_at)
        .bind(n.expires_at)
        .bind(n.attempt_count)
        .bind(n.max_attempts)
        .bind(n.status.as_str())
        .bind(&n.last_error)
        .bind(&n.external_message_id)
        .bind(n.delivered_at)
        .bind(n.updated_at)
        .bind(&n.id)
        .bind(expected.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            // Tell a missing row apart from one that moved on.
            let exists = sqlx::query("SELECT 1 FROM delivery_queue WHERE id = ?")
                .bind(&n.id)
                .fetch_optional(&self.pool)
                .await?
                .is_some();
            if !exists {
                return Err(AppError::NotFound(format!("Queued notification {}", n.id)));
            }
            return Err(AppError::ConcurrentModification {
                id: n.id.clone(),
                expected,
            });
        }
        Ok(())
    }

    async fn update_status(
        &self,
        id: &str,
        status: DeliveryStatus,
        error: Option<String>,
    ) -> AppResult<()> {
        let result = sqlx::query(
            "UPDATE delivery_queue SET status = ?, last_error = ?, updated_at = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(error)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("Queued notification {}", id)));
        }
        Ok(())
    }

    async fn get_pending_count(&self) -> AppResult<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM delivery_queue WHERE status = 'pending'")
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    async fn get_queued_notification(&self, id: &str) -> AppResult<QueuedNotification> {
        sqlx::query_as::<_, QueuedNotification>(&format!(
            "SELECT {} FROM delivery_queue WHERE id = ?",
            COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Queued notification {}", id)))
    }

    async fn delete_processed_notifications(&self, older_than: DateTime<Utc>) -> AppResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM delivery_queue
            WHERE status IN ('delivered', 'cancelled', 'expired', 'failed')
              AND julianday(updated_at) < julianday(?)
            "#,
        )
        .bind(older_than)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn get_failed_notifications(&self, limit: usize) -> AppResult<Vec<QueuedNotification>> {
        let rows = sqlx::query_as::<_, QueuedNotification>(&format!(
            r#"
            SELECT {} FROM delivery_queue
            WHERE status = 'failed'
            ORDER BY julianday(updated_at) DESC
            LIMIT ?
            "#,
            COLUMNS
        ))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn get_status_counts(&self) -> AppResult<BTreeMap<DeliveryStatus, i64>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM delivery_queue GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut counts = BTreeMap::new();
        for (status, count) in rows {
            match DeliveryStatus::from_str(&status) {
                Some(s) => {
                    counts.insert(s, count);
                }
                None => tracing::warn!("Ignoring unknown delivery status '{}'", status),
            }
        }
        Ok(counts)
    }
}
