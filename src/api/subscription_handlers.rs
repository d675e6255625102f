//! API handlers for fanout topic subscriptions

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

use super::handlers::AppError;
use crate::fanout::Subscription;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateSubscriptionRequest {
    pub endpoint: String,
}

pub async fn list_subscriptions(State(state): State<AppState>) -> Json<Vec<Subscription>> {
    Json(state.topic.subscriptions().await)
}

/// Subscribe an endpoint. Re-subscribing returns the existing subscription.
pub async fn create_subscription(
    State(state): State<AppState>,
    body: Result<Json<CreateSubscriptionRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Subscription>), AppError> {
    let Json(req) = body.map_err(|e| AppError::BadRequest(e.body_text()))?;
    let id = state.topic.subscribe(&req.endpoint).await?;
    let subscription = state
        .topic
        .subscriptions()
        .await
        .into_iter()
        .find(|s| s.id == id)
        .ok_or_else(|| AppError::NotFound("Subscription removed concurrently".into()))?;
    Ok((StatusCode::CREATED, Json(subscription)))
}

pub async fn delete_subscription(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    if state.topic.unsubscribe(id).await {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound("Subscription not found".into()))
    }
}
