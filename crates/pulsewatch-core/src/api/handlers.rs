//! API handlers for the operational HTTP API

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::config::QueuesConfig;
use crate::db::Datastore;
use crate::error::Error;
use crate::models::{BulkSchedulePayload, DlqReviewPayload, MessageBody, QueueMessage};
use crate::queue::{QueueAttributes, QueueService, SendOptions};
use crate::scheduler::{ScheduleReport, Scheduler};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Datastore>,
    pub queue: Arc<dyn QueueService>,
    pub scheduler: Arc<Scheduler>,
    pub queues: QueuesConfig,
}

type ApiResult<T> = Result<T, (StatusCode, String)>;

fn error_response(e: Error) -> (StatusCode, String) {
    let status = match &e {
        Error::UnknownQueue(_) | Error::NotFound { .. } => StatusCode::NOT_FOUND,
        Error::Validation(_) => StatusCode::BAD_REQUEST,
        _ => {
            error!(error = %e, "Request failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, e.to_string())
}

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub database: bool,
    pub queue: bool,
}

/// Health check endpoint; 503 when a dependency is unreachable
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let database = state.store.health_check().await.is_ok();
    let queue = state.queue.health_check().await.is_ok();
    let healthy = database && queue;

    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        code,
        Json(HealthResponse {
            status: if healthy { "ok" } else { "degraded" }.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            database,
            queue,
        }),
    )
}

/// Attributes of every configured queue
pub async fn list_queues(State(state): State<AppState>) -> ApiResult<Json<Vec<QueueAttributes>>> {
    let mut attributes = Vec::new();
    for settings in state.queues.all() {
        attributes.push(
            state
                .queue
                .attributes(&settings.name)
                .await
                .map_err(error_response)?,
        );
    }
    Ok(Json(attributes))
}

/// Schedule trigger parameters
#[derive(Debug, Default, Deserialize)]
pub struct RunScheduleQuery {
    /// Overrides the configured batch limit
    pub limit: Option<usize>,
    /// `true` to publish a `BULK_SCHEDULE` message instead of running inline
    #[serde(default)]
    pub deferred: bool,
}

/// Schedule trigger response
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunScheduleResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<ScheduleReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

/// Run a scheduling pass now, or queue one
pub async fn run_schedule(
    State(state): State<AppState>,
    Query(query): Query<RunScheduleQuery>,
) -> ApiResult<(StatusCode, Json<RunScheduleResponse>)> {
    if query.limit == Some(0) {
        return Err((StatusCode::BAD_REQUEST, "limit must be at least 1".to_string()));
    }

    if query.deferred {
        let message = QueueMessage::new(
            MessageBody::BulkSchedule(BulkSchedulePayload { limit: query.limit }),
            "api",
        );
        let message_id = message.message_id.to_string();
        state
            .queue
            .send_message(&state.queues.bulk.name, &message, SendOptions::default())
            .await
            .map_err(error_response)?;
        info!(message_id = %message_id, "Bulk schedule queued");
        return Ok((
            StatusCode::ACCEPTED,
            Json(RunScheduleResponse {
                report: None,
                message_id: Some(message_id),
            }),
        ));
    }

    let report = match query.limit {
        Some(limit) => state.scheduler.schedule_with_limit(limit).await,
        None => state.scheduler.schedule_due_checks().await,
    }
    .map_err(error_response)?;

    Ok((
        StatusCode::OK,
        Json(RunScheduleResponse {
            report: Some(report),
            message_id: None,
        }),
    ))
}

/// Dead-letter review response
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DlqReviewResponse {
    pub message_id: String,
    pub attributes: QueueAttributes,
}

/// Report a queue's current attributes and queue a `DLQ_REVIEW` message for it
pub async fn request_dlq_review(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<(StatusCode, Json<DlqReviewResponse>)> {
    let attributes = state.queue.attributes(&name).await.map_err(error_response)?;

    let message = QueueMessage::new(
        MessageBody::DlqReview(DlqReviewPayload { queue: name.clone() }),
        "api",
    );
    let message_id = message.message_id.to_string();
    state
        .queue
        .send_message(&state.queues.bulk.name, &message, SendOptions::default())
        .await
        .map_err(error_response)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(DlqReviewResponse {
            message_id,
            attributes,
        }),
    ))
}
