use sqlx::SqlitePool;

use crate::db::models::{Channel, RetryConfigurationRow};
use crate::error::{AppError, AppResult};
use crate::services::retry::RetryConfiguration;

const COLUMNS: &str = r#"
    id,
    channel,
    max_retry_attempts,
    initial_retry_delay_ms,
    max_retry_delay_ms,
    retry_delay_multiplier,
    retry_timeout_ms,
    enable_exponential_backoff,
    enable_dead_letter_queue,
    is_active,
    created_at,
    updated_at
"#;

/// Persistence for retry policies.
///
/// Rows are validated when converted back into [`RetryConfiguration`], so a
/// hand-edited row with a bad multiplier or negative delay surfaces as
/// `InvalidRetryConfiguration` instead of silently misbehaving.
pub struct RetryConfigurationRepository;

impl RetryConfigurationRepository {
    pub async fn create(pool: &SqlitePool, config: &RetryConfiguration) -> AppResult<()> {
        let mut conn = pool.acquire().await?;
        insert(&mut conn, config).await
    }

    /// Insert all configurations in one transaction.
    pub async fn bulk_create(pool: &SqlitePool, configs: &[RetryConfiguration]) -> AppResult<()> {
        let mut tx = pool.begin().await?;
        for config in configs {
            insert(&mut tx, config).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_by_id(pool: &SqlitePool, id: &str) -> AppResult<RetryConfiguration> {
        let row = sqlx::query_as::<_, RetryConfigurationRow>(&format!(
            "SELECT {} FROM retry_configurations WHERE id = ?",
            COLUMNS
        ))
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Retry configuration {}", id)))?;

        RetryConfiguration::try_from(row)
    }

    /// Active configuration for `channel`, or the installation default when
    /// `channel` is `None`. The most recently updated row wins.
    pub async fn get_active_by_channel(
        pool: &SqlitePool,
        channel: Option<Channel>,
    ) -> AppResult<Option<RetryConfiguration>> {
        let row = sqlx::query_as::<_, RetryConfigurationRow>(&format!(
            r#"
            SELECT {} FROM retry_configurations
            WHERE channel IS ? AND is_active = 1
            ORDER BY julianday(updated_at) DESC
            LIMIT 1
            "#,
            COLUMNS
        ))
        .bind(channel.map(String::from))
        .fetch_optional(pool)
        .await?;

        row.map(RetryConfiguration::try_from).transpose()
    }

    pub async fn list_active(pool: &SqlitePool) -> AppResult<Vec<RetryConfiguration>> {
        let rows = sqlx::query_as::<_, RetryConfigurationRow>(&format!(
            "SELECT {} FROM retry_configurations WHERE is_active = 1 ORDER BY julianday(updated_at) ASC",
            COLUMNS
        ))
        .fetch_all(pool)
        .await?;

        rows.into_iter().map(RetryConfiguration::try_from).collect()
    }

    pub async fn update(pool: &SqlitePool, config: &RetryConfiguration) -> AppResult<()> {
        let row = config.to_row();
        let result = sqlx::query(
            r#"
            UPDATE retry_configurations
            SET
                channel = ?,
                max_retry_attempts = ?,
                initial_retry_delay_ms = ?,
                max_retry_delay_ms = ?,
                retry_delay_multiplier = ?,
                retry_timeout_ms = ?,
                enable_exponential_backoff = ?,
                enable_dead_letter_queue = ?,
                is_active = ?,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(row.channel)
        .bind(row.max_retry_attempts)
        .bind(row.initial_retry_delay_ms)
        .bind(row.max_retry_delay_ms)
        .bind(row.retry_delay_multiplier)
        .bind(row.retry_timeout_ms)
        .bind(row.enable_exponential_backoff)
        .bind(row.enable_dead_letter_queue)
        .bind(row.is_active)
        .bind(row.updated_at)
        .bind(&row.id)
        .execute(pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("Retry configuration {}", row.id)));
        }
        Ok(())
    }

    pub async fn delete(pool: &SqlitePool, id: &str) -> AppResult<()> {
        let result = sqlx::query("DELETE FROM retry_configurations WHERE id = ?")
            .bind(id)
            .execute(pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("Retry configuration {}", id)));
        }
        Ok(())
    }
}

async fn insert(conn: &mut sqlx::SqliteConnection, config: &RetryConfiguration) -> AppResult<()> {
    let row = config.to_row();
    sqlx::query(&format!(
        "INSERT INTO retry_configurations ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        COLUMNS
    ))
    .bind(row.id)
    .bind(row.channel)
    .bind(row.max_retry_attempts)
    .bind(row.initial_retry_delay_ms)
    .bind(row.max_retry_delay_ms)
    .bind(row.retry_delay_multiplier)
    .bind(row.retry_timeout_ms)
    .bind(row.enable_exponential_backoff)
    .bind(row.enable_dead_letter_queue)
    .bind(row.is_active)
    .bind(row.created_at)
    .bind(row.updated_at)
    .execute(conn)
    .await?;

    Ok(())
}
