//! REST API handlers
//!
//! Every JSON response uses the [`ApiResponse`] envelope. Expected conditions
//! (lock contention, unknown media, replays) always return a structured body.

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::error::CastlineErrorTrait;
use crate::idempotency::{client_key, Lookup, RecordOutcome};
use crate::media::{ApplyOutcome, MediaError, SIGNATURE_HEADER};
use crate::models::{Attachment, ItemStatus, MediaKind, PostPayload, ScheduledItem};
use crate::publish::IDEMPOTENCY_HEADER;
use crate::scheduler::{ItemOutcome, RunReport, RunRequest, SchedulerError, SkipReason};

use super::serve::AppState;

/// Header carrying the shared cron secret
pub const CRON_SECRET_HEADER: &str = "x-cron-secret";

/// Header set on responses answered from the idempotency store
pub const REPLAYED_HEADER: &str = "idempotent-replayed";

const DEFAULT_RUNS_LIMIT: usize = 20;
const MAX_RUNS_LIMIT: usize = 200;

// ============================================================================
// API Response Types
// ============================================================================

/// Generic API response wrapper
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

/// Simple error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: message.into(),
        }
    }
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(ErrorResponse::new(message))).into_response()
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
}

/// Webhook acknowledgement
#[derive(Debug, Serialize, Deserialize)]
pub struct WebhookAck {
    pub received: bool,
    pub processed: bool,
}

#[derive(Debug, Deserialize)]
pub struct TriggerQuery {
    pub source: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RunsQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePostRequest {
    pub owner_ref: String,
    pub content: String,
    #[serde(default)]
    pub destination: String,
    #[serde(default)]
    pub parent_ref: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    pub scheduled_at: DateTime<Utc>,
    /// Create as `draft`; drafts are only published on demand
    #[serde(default)]
    pub draft: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RescheduleRequest {
    pub scheduled_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterMediaRequest {
    pub provider_ref: String,
    pub kind: MediaKind,
}

/// Result of a publish-now request
#[derive(Debug, Serialize, Deserialize)]
pub struct PublishNowResponse {
    #[serde(flatten)]
    pub outcome: ItemOutcome,
    pub item: Option<ScheduledItem>,
}

#[derive(Debug, Serialize)]
pub struct ConfirmResponse {
    pub changed: bool,
    pub media: crate::models::MediaRecord,
}

// ============================================================================
// API Routes
// ============================================================================

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health endpoints
        .route("/api/health", get(health_check))
        .route("/metrics", get(metrics))
        .route("/api/circuits", get(list_circuits))
        // Trigger endpoints
        .route("/api/cron/publish", get(trigger_run).post(trigger_run))
        .route("/api/cron/runs", get(list_runs))
        // Webhooks
        .route("/api/webhooks/media", post(media_webhook))
        // Items
        .route("/api/posts", post(create_post))
        .route("/api/posts/{id}", get(get_post).delete(delete_post))
        .route("/api/posts/{id}/reschedule", post(reschedule_post))
        .route("/api/posts/{id}/publish", post(publish_now))
        // Media
        .route("/api/media", post(register_media))
        .route("/api/media/{id}", get(get_media))
        .route("/api/media/{id}/confirm", post(confirm_media))
        .with_state(state)
}

// ============================================================================
// Health Handlers
// ============================================================================

async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let uptime = state.start_time.elapsed().as_secs();

    Json(ApiResponse::success(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: uptime,
    }))
}

async fn metrics() -> Response {
    match crate::metrics::encode_metrics() {
        Ok(text) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn list_circuits(State(state): State<AppState>) -> Response {
    match state.app.breaker.states().await {
        Ok(states) => (StatusCode::OK, Json(ApiResponse::success(states))).into_response(),
        Err(e) => error_response(StatusCode::SERVICE_UNAVAILABLE, format!("{e:#}")),
    }
}

// ============================================================================
// Trigger Handlers
// ============================================================================

/// Compare secrets without short-circuiting on the first differing byte
fn secrets_match(expected: &str, provided: &str) -> bool {
    let (a, b) = (expected.as_bytes(), provided.as_bytes());
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn cron_authorized(state: &AppState, headers: &HeaderMap) -> bool {
    let Some(secret) = state.app.config.server.cron_secret.as_deref() else {
        return true;
    };

    let from_header = headers
        .get(CRON_SECRET_HEADER)
        .and_then(|v| v.to_str().ok());
    let from_bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    from_header
        .into_iter()
        .chain(from_bearer)
        .any(|provided| secrets_match(secret, provided))
}

/// Run the scheduler once
///
/// `200` for completed and lock-contended runs, `503` when the lock store is
/// unavailable, `500` when a started run failed. The body is always the run
/// report.
async fn trigger_run(
    State(state): State<AppState>,
    Query(query): Query<TriggerQuery>,
    headers: HeaderMap,
) -> Response {
    if !cron_authorized(&state, &headers) {
        warn!("Rejected trigger call with missing or wrong secret");
        return error_response(StatusCode::UNAUTHORIZED, "unauthorized");
    }

    let source = query
        .source
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| "cron".to_string());
    let request = RunRequest::from_config(source, &state.app.config.scheduler);
    let report: RunReport = state.app.scheduler.run(request).await;

    let status = match (report.success, report.skipped) {
        (true, _) => StatusCode::OK,
        (false, true) => StatusCode::SERVICE_UNAVAILABLE,
        (false, false) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let body = ApiResponse {
        success: report.success,
        error: report.error.clone(),
        data: Some(report),
    };
    (status, Json(body)).into_response()
}

async fn list_runs(State(state): State<AppState>, Query(query): Query<RunsQuery>) -> Response {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_RUNS_LIMIT)
        .clamp(1, MAX_RUNS_LIMIT);

    match state
        .app
        .repos
        .runs
        .recent_runs(state.app.scheduler.job_name(), limit)
        .await
    {
        Ok(runs) => (StatusCode::OK, Json(ApiResponse::success(runs))).into_response(),
        Err(e) => error_response(StatusCode::SERVICE_UNAVAILABLE, format!("{e:#}")),
    }
}

// ============================================================================
// Webhook Handlers
// ============================================================================

/// Transcoding status callback
///
/// `401` for any signature problem (no detail), `503` for transient internal
/// errors so the provider retries, otherwise `200` with `processed` telling
/// whether the event touched a known record.
async fn media_webhook(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let secret = state
        .app
        .config
        .media
        .webhook_secret
        .as_deref()
        .unwrap_or_default();
    let signature = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());

    match state.app.media.handle_webhook(secret, signature, &body).await {
        Ok(outcome) => {
            crate::metrics::record_webhook(outcome.metric_label());
            let ack = WebhookAck {
                received: true,
                processed: outcome.processed(),
            };
            (StatusCode::OK, Json(ack)).into_response()
        }
        Err(MediaError::InvalidSignature | MediaError::SignatureNotConfigured) => {
            warn!("Rejected media webhook with unverifiable signature");
            crate::metrics::record_webhook("rejected");
            error_response(StatusCode::UNAUTHORIZED, "unauthorized")
        }
        Err(e) if e.is_recoverable() => {
            error!(error = %e, "Media webhook failed transiently");
            crate::metrics::record_webhook("error");
            error_response(StatusCode::SERVICE_UNAVAILABLE, "temporarily unavailable")
        }
        Err(e) => {
            warn!(error = %e, "Media webhook acknowledged without processing");
            crate::metrics::record_webhook("ignored");
            let ack = WebhookAck {
                received: true,
                processed: false,
            };
            (StatusCode::OK, Json(ack)).into_response()
        }
    }
}

// ============================================================================
// Item Handlers
// ============================================================================

async fn create_post(
    State(state): State<AppState>,
    Json(request): Json<CreatePostRequest>,
) -> Response {
    if request.owner_ref.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "ownerRef is required");
    }
    if request.content.trim().is_empty() && request.attachments.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "content or attachments required");
    }

    let payload = PostPayload {
        content: request.content,
        destination: request.destination,
        parent_ref: request.parent_ref,
        attachments: request.attachments,
    };
    let mut item = ScheduledItem::scheduled(request.owner_ref, payload, request.scheduled_at);
    item.updated_at = state.app.clock.now();
    if request.draft {
        item.status = ItemStatus::Draft;
    }

    match state.app.repos.items.create_item(&item).await {
        Ok(()) => {
            info!(item_id = %item.id, scheduled_at = %item.scheduled_at, "Item created");
            (StatusCode::CREATED, Json(ApiResponse::success(item))).into_response()
        }
        Err(e) => error_response(StatusCode::SERVICE_UNAVAILABLE, format!("{e:#}")),
    }
}

async fn get_post(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.app.repos.items.get_item(&id).await {
        Ok(Some(item)) => (StatusCode::OK, Json(ApiResponse::success(item))).into_response(),
        Ok(None) => scheduler_error_response(SchedulerError::item_not_found(id)),
        Err(e) => scheduler_error_response(SchedulerError::storage("get item", e)),
    }
}

fn scheduler_error_response(err: SchedulerError) -> Response {
    let status = match &err {
        SchedulerError::ItemNotFound { .. } => StatusCode::NOT_FOUND,
        SchedulerError::InvalidTransition { .. } => StatusCode::CONFLICT,
        e if e.is_store_failure() => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, err.to_string())
}

/// Respond to a refused conditional update: `404` if gone, `409` otherwise
async fn refused_transition(state: &AppState, id: &str, action: &str) -> Response {
    let err = match state.app.repos.items.get_item(id).await {
        Ok(Some(item)) => SchedulerError::invalid_transition(id, item.status, action),
        Ok(None) => SchedulerError::item_not_found(id),
        Err(e) => SchedulerError::storage("get item", e),
    };
    scheduler_error_response(err)
}

async fn reschedule_post(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<RescheduleRequest>,
) -> Response {
    let now = state.app.clock.now();
    let rescheduled = state
        .app
        .repos
        .items
        .reschedule(&id, request.scheduled_at, now)
        .await;

    match rescheduled {
        Ok(true) => {
            info!(item_id = %id, scheduled_at = %request.scheduled_at, "Item rescheduled");
            get_post(State(state), Path(id)).await
        }
        Ok(false) => refused_transition(&state, &id, "reschedule").await,
        Err(e) => error_response(StatusCode::SERVICE_UNAVAILABLE, format!("{e:#}")),
    }
}

async fn delete_post(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.app.repos.items.delete_item(&id).await {
        Ok(true) => {
            info!(item_id = %id, "Item deleted");
            (
                StatusCode::OK,
                Json(ApiResponse::success(serde_json::json!({ "deleted": true }))),
            )
                .into_response()
        }
        Ok(false) => refused_transition(&state, &id, "delete").await,
        Err(e) => error_response(StatusCode::SERVICE_UNAVAILABLE, format!("{e:#}")),
    }
}

fn json_bytes_response(status: StatusCode, body: String, replayed: bool) -> Response {
    let mut response = (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        body,
    )
        .into_response();
    if replayed {
        response
            .headers_mut()
            .insert(REPLAYED_HEADER, HeaderValue::from_static("true"));
    }
    response
}

/// Publish an item now under a client idempotency key
///
/// The first request's status and body are recorded verbatim; replays of the
/// key return them unchanged without touching the item.
async fn publish_now(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let Some(key) = headers
        .get(IDEMPOTENCY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|k| !k.is_empty())
    else {
        return error_response(
            StatusCode::BAD_REQUEST,
            format!("{IDEMPOTENCY_HEADER} header is required"),
        );
    };

    let key = &client_key(key);
    let idempotency = &state.app.shared.idempotency;
    let idem_config = &state.app.config.idempotency;
    let reservation_ttl = std::time::Duration::from_secs(idem_config.reservation_ttl_secs);
    let ttl = std::time::Duration::from_secs(idem_config.ttl_secs);

    match idempotency.get_or_reserve(key, reservation_ttl).await {
        Ok(Lookup::Found(record)) => {
            crate::metrics::record_idempotency_replay("publish_now");
            let status = StatusCode::from_u16(record.status).unwrap_or(StatusCode::OK);
            return json_bytes_response(status, record.data, true);
        }
        Ok(Lookup::InProgress) => {
            return error_response(
                StatusCode::CONFLICT,
                "a request with this idempotency key is in progress",
            );
        }
        Ok(Lookup::Reserved) => {}
        Err(e) => {
            error!(error = %format!("{e:#}"), "Idempotency store unavailable");
            return error_response(StatusCode::SERVICE_UNAVAILABLE, "idempotency store unavailable");
        }
    }

    let (status, body) = match execute_publish_now(&state, &id).await {
        Ok(Some(result)) => result,
        Ok(None) => {
            // Not a recordable outcome; let the client retry with the same key.
            if let Err(e) = idempotency.release(key).await {
                warn!(error = %format!("{e:#}"), "Failed to release idempotency key");
            }
            return error_response(StatusCode::CONFLICT, "item is being published by another caller");
        }
        Err(response) => {
            if let Err(e) = idempotency.release(key).await {
                warn!(error = %format!("{e:#}"), "Failed to release idempotency key");
            }
            return response;
        }
    };

    match idempotency.record(key, status.as_u16(), &body, ttl).await {
        Ok(RecordOutcome::Stored) => json_bytes_response(status, body, false),
        Ok(RecordOutcome::AlreadyRecorded(record)) => {
            let status = StatusCode::from_u16(record.status).unwrap_or(StatusCode::OK);
            json_bytes_response(status, record.data, true)
        }
        Err(e) => {
            warn!(error = %format!("{e:#}"), "Failed to record publish-now outcome");
            json_bytes_response(status, body, false)
        }
    }
}

/// `Ok(None)` when the item's publish reservation is held elsewhere
async fn execute_publish_now(
    state: &AppState,
    id: &str,
) -> Result<Option<(StatusCode, String)>, Response> {
    let items = &state.app.repos.items;
    let item = match items.get_item(id).await {
        Ok(Some(item)) => item,
        Ok(None) => {
            let body = serde_json::to_string(&ErrorResponse::new(format!("item {id} not found")))
                .map_err(|e| error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
            return Ok(Some((StatusCode::NOT_FOUND, body)));
        }
        Err(e) => return Err(error_response(StatusCode::SERVICE_UNAVAILABLE, format!("{e:#}"))),
    };

    let timeout = state.app.config.per_call_timeout();
    let outcome = state
        .app
        .pipeline
        .process(&item, timeout)
        .await
        .map_err(|e| {
            error!(item_id = %id, error = %e, "Publish-now aborted");
            scheduler_error_response(e)
        })?;

    let status = match &outcome {
        ItemOutcome::Published { .. } => StatusCode::OK,
        ItemOutcome::Retrying { .. } => StatusCode::ACCEPTED,
        ItemOutcome::Failed { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        ItemOutcome::Skipped {
            reason: SkipReason::InProgress,
        } => return Ok(None),
        ItemOutcome::Skipped {
            reason: SkipReason::NotClaimable,
        } => StatusCode::CONFLICT,
    };
    crate::metrics::record_item(outcome.label());

    let current = items.get_item(id).await.ok().flatten();
    let success = status == StatusCode::OK;
    let error = match &outcome {
        ItemOutcome::Failed { error } | ItemOutcome::Retrying { error, .. } => Some(error.clone()),
        ItemOutcome::Skipped { .. } => Some(format!(
            "item is not publishable while it is {}",
            current
                .as_ref()
                .map(|i| i.status.as_str())
                .unwrap_or("unknown")
        )),
        ItemOutcome::Published { .. } => None,
    };

    let body = ApiResponse {
        success,
        data: Some(PublishNowResponse {
            outcome,
            item: current,
        }),
        error,
    };
    let body = serde_json::to_string(&body)
        .map_err(|e| error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Some((status, body)))
}

// ============================================================================
// Media Handlers
// ============================================================================

fn media_error_response(err: MediaError) -> Response {
    let status = match &err {
        MediaError::InvalidProviderRef(_) | MediaError::MalformedEvent(_) => StatusCode::BAD_REQUEST,
        MediaError::NotFound { .. } | MediaError::UnknownAsset { .. } => StatusCode::NOT_FOUND,
        MediaError::AlreadyRegistered { .. } => StatusCode::CONFLICT,
        MediaError::Provider(_) => StatusCode::BAD_GATEWAY,
        MediaError::Storage(_) => StatusCode::SERVICE_UNAVAILABLE,
        MediaError::InvalidSignature
        | MediaError::SignatureNotConfigured
        | MediaError::InvalidBaseUrl(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, err.to_string())
}

async fn register_media(
    State(state): State<AppState>,
    Json(request): Json<RegisterMediaRequest>,
) -> Response {
    match state
        .app
        .media
        .register(&request.provider_ref, request.kind)
        .await
    {
        Ok(record) => (StatusCode::CREATED, Json(ApiResponse::success(record))).into_response(),
        Err(e) => media_error_response(e),
    }
}

async fn get_media(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.app.repos.media.get_media(&id).await {
        Ok(Some(record)) => (StatusCode::OK, Json(ApiResponse::success(record))).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, format!("media {id} not found")),
        Err(e) => error_response(StatusCode::SERVICE_UNAVAILABLE, format!("{e:#}")),
    }
}

async fn confirm_media(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let Some(provider) = state.app.media_provider.clone() else {
        return error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "media provider API is not configured",
        );
    };

    match state.app.media.confirm(&id, provider.as_ref()).await {
        Ok((outcome, media)) => {
            let changed = matches!(outcome, ApplyOutcome::Advanced { .. });
            (
                StatusCode::OK,
                Json(ApiResponse::success(ConfirmResponse { changed, media })),
            )
                .into_response()
        }
        Err(e) => media_error_response(e),
    }
}
