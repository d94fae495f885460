use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::db::models::{Channel, QueuedNotification};
use crate::error::AppResult;
use crate::services::rate_limiter::RateLimitStats;
use crate::AppState;

const DEFAULT_FAILED_LIMIT: usize = 50;
const MAX_FAILED_LIMIT: usize = 500;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/stats", get(get_queue_stats))
        .route("/failed", get(list_failed))
        .route("/:id/replay", post(replay_notification))
        .route("/:id/cancel", post(cancel_notification))
}

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct FailedQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct QueueStatsResponse {
    pub queue: BTreeMap<String, i64>,
    pub rate_limits: Vec<RateLimitStats>,
    pub channels: Vec<Channel>,
}

// ============================================================================
// Handlers
// ============================================================================

/// Queue counts per status plus rate limiter usage per channel
async fn get_queue_stats(State(state): State<Arc<AppState>>) -> AppResult<Json<QueueStatsResponse>> {
    let queue = state.delivery.get_queue_stats().await?;
    let rate_limits = Channel::ALL
        .iter()
        .map(|c| state.delivery.rate_limiter().get_stats(*c))
        .collect();

    Ok(Json(QueueStatsResponse {
        queue,
        rate_limits,
        channels: state.delivery.registered_channels().await,
    }))
}

/// Dead-letter view
async fn list_failed(
    State(state): State<Arc<AppState>>,
    Query(query): Query<FailedQuery>,
) -> AppResult<Json<Vec<QueuedNotification>>> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_FAILED_LIMIT)
        .clamp(1, MAX_FAILED_LIMIT);
    Ok(Json(state.delivery.get_failed_notifications(limit).await?))
}

async fn replay_notification(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> AppResult<Json<QueuedNotification>> {
    Ok(Json(state.delivery.replay_notification(&id).await?))
}

async fn cancel_notification(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> AppResult<Json<QueuedNotification>> {
    Ok(Json(state.delivery.cancel_notification(&id).await?))
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use crate::config::Config;
    use crate::db::models::{CreateQueuedNotification, DeliveryStatus};
    use crate::services::delivery::NotificationDeliveryService;
    use crate::services::queue::{DeliveryQueue, InMemoryDeliveryQueue};
    use crate::services::rate_limiter::RateLimiter;
    use crate::services::retry::RetryPolicies;

    use super::*;

    fn state() -> (Arc<AppState>, Arc<InMemoryDeliveryQueue>) {
        let queue = Arc::new(InMemoryDeliveryQueue::new());
        let delivery = NotificationDeliveryService::new(
            queue.clone(),
            Arc::new(RateLimiter::new()),
            Arc::new(RetryPolicies::new()),
        );
        let state = Arc::new(AppState {
            config: Config::default(),
            delivery: Arc::new(delivery),
        });
        (state, queue)
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn stats_include_every_status() {
        let (state, _) = state();
        state
            .delivery
            .queue_notification(CreateQueuedNotification::new(Channel::Telegram, "1", "hi"))
            .await
            .unwrap();

        let app = crate::routes::build_router(state);
        let response = app
            .oneshot(Request::get("/api/queue/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = json_body(response).await;
        assert_eq!(body["queue"]["pending_count"], 1);
        assert_eq!(body["queue"]["failed"], 0);
        assert_eq!(body["rate_limits"].as_array().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn replay_failed_notification() {
        let (state, queue) = state();
        let n = state
            .delivery
            .queue_notification(CreateQueuedNotification::new(Channel::Email, "a@example.com", "x"))
            .await
            .unwrap();
        queue
            .update_status(&n.id, DeliveryStatus::Failed, Some("unauthorized".into()))
            .await
            .unwrap();

        let app = crate::routes::build_router(state);
        let response = app
            .clone()
            .oneshot(Request::get("/api/queue/failed?limit=5").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = json_body(response).await;
        assert_eq!(body.as_array().unwrap().len(), 1);

        let response = app
            .oneshot(
                Request::post(format!("/api/queue/{}/replay", n.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["status"], "pending");
    }

    #[tokio::test]
    async fn unknown_and_conflicting_ids_map_to_error_bodies() {
        let (state, _) = state();
        let n = state
            .delivery
            .queue_notification(CreateQueuedNotification::new(Channel::Slack, "https://h.test", "x"))
            .await
            .unwrap();
        let app = crate::routes::build_router(state);

        let response = app
            .clone()
            .oneshot(Request::post("/api/queue/missing/cancel").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(response).await["error"]["code"], "NOT_FOUND");

        let response = app
            .oneshot(
                Request::post(format!("/api/queue/{}/replay", n.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(
            json_body(response).await["error"]["code"],
            "INVALID_STATUS_TRANSITION"
        );
    }

    #[tokio::test]
    async fn health_lists_channels() {
        let (state, _) = state();
        let app = crate::routes::build_router(state);
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["status"], "healthy");
    }
}
