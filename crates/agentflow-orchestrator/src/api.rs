//! HTTP surface (spec §6.1): one `axum::Router` per resource group, mounted
//! from `main.rs` the same way `agentflow-api::main` assembles its routers —
//! CORS + trace layers, `utoipa` OpenAPI derive, Swagger UI.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures::stream::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

use crate::error::OrchestratorError;
use crate::intake::IntakeClassifier;
use crate::runtime::{ApprovalDecision, OrchestratorServices, SubmitOutcome, SubmitTaskRequest};
use crate::webhook::{VerifyOutcome, WebhookError, WebhookHeaders, WebhookIngress, WebhookPayload};

#[derive(Clone)]
pub struct AppState {
    pub services: Arc<OrchestratorServices>,
    pub webhooks: Arc<WebhookIngress>,
    pub intake: Arc<IntakeClassifier>,
}

/// Standard error envelope, per §6.1: `{ "error": { "code", "message", "details" } }`.
pub struct ApiError(OrchestratorError);

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            OrchestratorError::Validation(_) => StatusCode::BAD_REQUEST,
            OrchestratorError::Authorization(_) => StatusCode::FORBIDDEN,
            OrchestratorError::NotFound(_) => StatusCode::NOT_FOUND,
            OrchestratorError::VersionConflict { .. } | OrchestratorError::LockConflict { .. } => StatusCode::CONFLICT,
            OrchestratorError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            OrchestratorError::ExternalFailure(_) => StatusCode::BAD_GATEWAY,
            OrchestratorError::RiskReject { .. } => StatusCode::FORBIDDEN,
            OrchestratorError::RiskExpired => StatusCode::GONE,
            OrchestratorError::ReplayIntegrityError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            OrchestratorError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(json!({
            "error": {
                "code": self.0.code(),
                "message": self.0.to_string(),
                "details": {},
            }
        }));
        (status, body).into_response()
    }
}

/// OpenAPI document for the handlers annotated below. Mounted at `/docs` by
/// `main.rs` via `utoipa_swagger_ui::SwaggerUi`.
#[derive(utoipa::OpenApi)]
#[openapi(
    paths(orchestrate, execute, task_status, resume, cancel_workflow, list_events, replay_workflow, chat, webhook, health),
    tags((name = "orchestrator", description = "Task intake, execution, and HITL approval endpoints"))
)]
pub struct ApiDoc;

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/orchestrate", post(orchestrate))
        .route("/execute/:task_id", post(execute))
        .route("/execute/stream", post(execute_stream))
        .route("/task/:task_id", get(task_status))
        .route("/resume/:task_id", post(resume))
        .route("/workflow/:task_id", delete(cancel_workflow))
        .route("/workflow/:task_id/retry-from/:step_id", post(retry_from_step))
        .route("/workflow/:task_id/events", get(list_events))
        .route("/workflow/:task_id/events/export", get(export_events))
        .route("/workflow/:task_id/replay", post(replay_workflow))
        .route("/workflow/:task_id/state-at/:timestamp", get(state_at))
        .route("/workflow/:task_id/snapshots", get(list_snapshots))
        .route("/workflow/:task_id/annotate", post(annotate))
        .route("/chat", post(chat))
        .route("/webhooks/:channel", post(webhook))
        .route("/health", get(health))
        .route("/metrics/tokens", get(metrics_tokens))
        .with_state(state)
}

#[utoipa::path(
    post,
    path = "/orchestrate",
    request_body = SubmitTaskRequest,
    responses(
        (status = 200, description = "Task planned and ready for execution"),
        (status = 202, description = "Risk level requires approval before planning continues"),
    ),
    tag = "orchestrator"
)]
async fn orchestrate(
    State(state): State<AppState>,
    Json(req): Json<SubmitTaskRequest>,
) -> Result<(StatusCode, Json<SubmitOutcome>), ApiError> {
    let outcome = state.services.submit_task(req).await?;
    let status = match outcome {
        SubmitOutcome::Planned { .. } => StatusCode::OK,
        SubmitOutcome::ApprovalPending { .. } => StatusCode::ACCEPTED,
    };
    Ok((status, Json(outcome)))
}

#[utoipa::path(
    post,
    path = "/execute/{task_id}",
    params(("task_id" = Uuid, Path, description = "Task id returned by /orchestrate")),
    responses((status = 202, description = "Engine workflow started")),
    tag = "orchestrator"
)]
async fn execute(State(state): State<AppState>, Path(task_id): Path<Uuid>) -> Result<StatusCode, ApiError> {
    state.services.start_execution(task_id).await?;
    Ok(StatusCode::ACCEPTED)
}

#[derive(Debug, Deserialize)]
struct ExecuteStreamParams {
    task_id: Uuid,
}

async fn execute_stream(
    State(state): State<AppState>,
    Query(params): Query<ExecuteStreamParams>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    state.services.start_execution(params.task_id).await?;
    let rx = state.services.subscribe_task(params.task_id).await;
    let bus = state.services.bus.clone();
    let topic = format!("task:{}", params.task_id);
    // The bus's bounded-queue overflow policy (spec §4.5) is "drop oldest and
    // emit `subscriber_overflow`"; a lagged receiver here means this
    // subscriber missed events, so publish the marker back onto the topic
    // (for any other subscriber/persistent consumer) and surface it to this
    // stream too, rather than silently dropping the condition.
    let stream = BroadcastStream::new(rx).then(move |item| {
        let bus = bus.clone();
        let topic = topic.clone();
        async move {
            match item {
                Ok(bus_event) => Ok(SseEvent::default().json_data(bus_event.payload).unwrap_or_default()),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    let payload = json!({ "event": "subscriber_overflow", "skipped": skipped });
                    bus.publish(&topic, payload.clone()).await;
                    Ok(SseEvent::default().json_data(payload).unwrap_or_default())
                }
            }
        }
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

#[utoipa::path(
    get,
    path = "/task/{task_id}",
    params(("task_id" = Uuid, Path, description = "Task id returned by /orchestrate")),
    responses(
        (status = 200, description = "Current task status", body = crate::runtime::TaskStatusView),
        (status = 404, description = "No such task"),
    ),
    tag = "orchestrator"
)]
async fn task_status(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> Result<Json<crate::runtime::TaskStatusView>, ApiError> {
    Ok(Json(state.services.task_status(task_id).await?))
}

#[derive(Debug, Deserialize)]
struct ResumeParams {
    approver_id: String,
    approver_role: String,
}

#[utoipa::path(
    post,
    path = "/resume/{task_id}",
    params(
        ("task_id" = Uuid, Path, description = "Task id with an outstanding approval"),
        ("approver_id" = String, Query, description = "Caller identity, checked against the request's role authorization"),
        ("approver_role" = String, Query, description = "Role the caller is acting under (developer/team_lead/operator)"),
    ),
    responses(
        (status = 200, description = "Workflow resumed"),
        (status = 400, description = "Task has no outstanding approval"),
        (status = 403, description = "approver_role is not authorized for this approval's risk level"),
    ),
    tag = "orchestrator"
)]
async fn resume(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
    Query(params): Query<ResumeParams>,
) -> Result<StatusCode, ApiError> {
    state.services.resume(task_id, &params.approver_id, &params.approver_role).await?;
    Ok(StatusCode::OK)
}

#[derive(Debug, Deserialize)]
struct CancelParams {
    #[serde(default = "default_cancel_reason")]
    reason: String,
    #[serde(default = "default_cancelled_by")]
    cancelled_by: String,
}

fn default_cancel_reason() -> String {
    "cancelled via API".to_string()
}

fn default_cancelled_by() -> String {
    "api".to_string()
}

#[utoipa::path(
    delete,
    path = "/workflow/{task_id}",
    params(
        ("task_id" = Uuid, Path, description = "Task id to cancel"),
        ("reason" = Option<String>, Query, description = "Cancellation reason"),
        ("cancelled_by" = Option<String>, Query, description = "Caller identity"),
    ),
    responses((status = 200, description = "Workflow cancelled, locks released")),
    tag = "orchestrator"
)]
async fn cancel_workflow(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
    Query(params): Query<CancelParams>,
) -> Result<StatusCode, ApiError> {
    state.services.cancel(task_id, &params.reason, &params.cancelled_by).await?;
    Ok(StatusCode::OK)
}

#[derive(Debug, Deserialize)]
struct RetryFromParams {
    max_retries: Option<u32>,
}

async fn retry_from_step(
    State(state): State<AppState>,
    Path((task_id, step_id)): Path<(Uuid, String)>,
    Query(params): Query<RetryFromParams>,
) -> Result<StatusCode, ApiError> {
    state.services.retry_from_step(task_id, &step_id, params.max_retries).await?;
    Ok(StatusCode::OK)
}

#[derive(Debug, Deserialize)]
struct EventsParams {
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    offset: i64,
    #[serde(default)]
    action: Option<String>,
}

#[utoipa::path(
    get,
    path = "/workflow/{task_id}/events",
    params(
        ("task_id" = Uuid, Path, description = "Task id"),
        ("offset" = Option<i64>, Query, description = "Sequence number to read after"),
        ("limit" = Option<usize>, Query, description = "Max events to return"),
        ("action" = Option<String>, Query, description = "Filter by event action"),
    ),
    responses((status = 200, description = "Hash-chained domain event log")),
    tag = "orchestrator"
)]
async fn list_events(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
    Query(params): Query<EventsParams>,
) -> Json<Value> {
    let events = state
        .services
        .events(task_id, params.offset, params.limit.unwrap_or(usize::MAX), params.action.as_deref())
        .await;
    Json(json!({ "events": events }))
}

#[derive(Debug, Deserialize)]
struct ExportParams {
    #[serde(default = "default_export_format")]
    format: String,
}

fn default_export_format() -> String {
    "json".to_string()
}

async fn export_events(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
    Query(params): Query<ExportParams>,
) -> Result<Response, ApiError> {
    let events = state.services.events(task_id, 0, usize::MAX, None).await;
    match params.format.as_str() {
        "json" => Ok(Json(json!({ "events": events })).into_response()),
        "csv" => {
            let mut csv = String::from("seq,action,actor,timestamp,hash\n");
            for event in &events {
                csv.push_str(&format!(
                    "{},{},{},{},{}\n",
                    event.seq, event.action, event.actor, event.timestamp.to_rfc3339(), event.hash
                ));
            }
            Ok(([(axum::http::header::CONTENT_TYPE, "text/csv")], csv).into_response())
        }
        other => Err(OrchestratorError::Validation(format!("unsupported export format '{other}'")).into()),
    }
}

#[utoipa::path(
    post,
    path = "/workflow/{task_id}/replay",
    params(("task_id" = Uuid, Path, description = "Task id")),
    responses(
        (status = 200, description = "Hash chain verified intact"),
        (status = 500, description = "Tampering detected; response names the offending sequence number"),
    ),
    tag = "orchestrator"
)]
async fn replay_workflow(State(state): State<AppState>, Path(task_id): Path<Uuid>) -> Result<StatusCode, ApiError> {
    state.services.replay(task_id).await?;
    Ok(StatusCode::OK)
}

async fn state_at(
    State(state): State<AppState>,
    Path((task_id, timestamp)): Path<(Uuid, DateTime<Utc>)>,
) -> Result<Json<crate::runtime::TaskSummaryState>, ApiError> {
    Ok(Json(state.services.state_at(task_id, timestamp).await?))
}

async fn list_snapshots(State(state): State<AppState>, Path(task_id): Path<Uuid>) -> Json<Value> {
    let snapshots = state.services.snapshots(task_id).await;
    Json(json!({ "snapshots": snapshots }))
}

#[derive(Debug, Deserialize)]
struct AnnotateRequest {
    author: String,
    comment: String,
}

async fn annotate(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
    Json(req): Json<AnnotateRequest>,
) -> Result<StatusCode, ApiError> {
    state.services.annotate(task_id, &req.author, &req.comment).await?;
    Ok(StatusCode::OK)
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
struct ChatRequest {
    session_id: String,
    message: String,
}

#[derive(Debug, Serialize)]
struct ChatResponse {
    intent: crate::intake::Intent,
    referenced_id: Option<Uuid>,
}

#[utoipa::path(
    post,
    path = "/chat",
    request_body = ChatRequest,
    responses((status = 200, description = "Classified intent, with an approval decision applied if recognized")),
    tag = "orchestrator"
)]
async fn chat(State(state): State<AppState>, Json(req): Json<ChatRequest>) -> Result<Json<ChatResponse>, ApiError> {
    let classified = state.intake.classify(&req.session_id, &req.message).await;

    if classified.intent == crate::intake::Intent::ApprovalDecision {
        if let (Some(request_id), Some(decision)) = (classified.referenced_id, classified.decision) {
            let approval_decision = match decision {
                crate::intake::WebhookDecisionLabel::Approve => ApprovalDecision::Approved,
                crate::intake::WebhookDecisionLabel::Reject => ApprovalDecision::Rejected,
            };
            state
                .services
                .resolve_approval(request_id, approval_decision, &req.session_id, "developer", None)
                .await?;
        }
    }

    Ok(Json(ChatResponse {
        intent: classified.intent,
        referenced_id: classified.referenced_id,
    }))
}

#[utoipa::path(
    post,
    path = "/webhooks/{channel}",
    params(("channel" = String, Path, description = "Source-control or chat channel the webhook secret is scoped to")),
    responses(
        (status = 200, description = "Verified and processed (or a harmless no-op: duplicate, unresolvable, or already settled)"),
        (status = 403, description = "Signature verification failed"),
    ),
    tag = "orchestrator"
)]
async fn webhook(
    State(state): State<AppState>,
    Path(channel): Path<String>,
    headers: axum::http::HeaderMap,
    body: axum::body::Bytes,
) -> Result<StatusCode, ApiError> {
    let raw_body = String::from_utf8_lossy(&body).to_string();

    let signature = header_str(&headers, "x-signature").unwrap_or_default();
    let timestamp: i64 = header_str(&headers, "x-timestamp").and_then(|v| v.parse().ok()).unwrap_or(0);
    let event_id = header_str(&headers, "x-event-id")
        .and_then(|v| Uuid::parse_str(&v).ok())
        .unwrap_or_else(Uuid::now_v7);

    let verify_headers = WebhookHeaders { signature, timestamp, event_id };
    let outcome = state
        .webhooks
        .verify(&channel, &verify_headers, &raw_body)
        .await
        .map_err(webhook_error_to_api)?;

    if outcome == VerifyOutcome::Duplicate {
        return Ok(StatusCode::OK);
    }

    let payload: WebhookPayload = serde_json::from_str(&raw_body).unwrap_or_default();

    let request_id = payload
        .comment_body
        .as_deref()
        .and_then(crate::webhook::extract_request_id)
        .or(match &payload.external_ref {
            Some(external_ref) => state.services.hitl.by_external_ref(external_ref).await.map(|r| r.request_id),
            None => None,
        });

    let Some(request_id) = request_id else {
        // Nothing to act on: log and no-op per §4.9's unresolvable-request case.
        tracing::warn!(channel = %channel, "webhook carried no resolvable request id");
        return Ok(StatusCode::OK);
    };

    let Some(decision) = crate::webhook::derive_decision(&payload) else {
        tracing::info!(channel = %channel, %request_id, "webhook carried no actionable decision");
        return Ok(StatusCode::OK);
    };

    let approval_decision = match decision {
        crate::webhook::WebhookDecision::Approve => ApprovalDecision::Approved,
        crate::webhook::WebhookDecision::Reject => ApprovalDecision::Rejected,
    };

    match state
        .services
        .resolve_approval(request_id, approval_decision, &channel, "operator", None)
        .await
    {
        Ok(()) => Ok(StatusCode::OK),
        // Already resolved / no longer suspended: the spec treats this as a
        // log-and-no-op, not a client error, since the webhook is racing
        // against a direct `/resume` call or the expiry sweeper.
        Err(OrchestratorError::Validation(reason)) => {
            tracing::info!(%request_id, %reason, "webhook resolution raced an already-settled request");
            Ok(StatusCode::OK)
        }
        Err(other) => Err(other.into()),
    }
}

fn header_str(headers: &axum::http::HeaderMap, name: &str) -> Option<String> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_string)
}

fn webhook_error_to_api(err: WebhookError) -> ApiError {
    let mapped = match err {
        WebhookError::UnknownChannel(c) => OrchestratorError::NotFound(format!("channel {c}")),
        WebhookError::BadSignature => OrchestratorError::Authorization("bad webhook signature".to_string()),
        WebhookError::StaleTimestamp => OrchestratorError::Validation("webhook timestamp skew exceeds tolerance".to_string()),
        WebhookError::UnresolvableRequest => OrchestratorError::Validation("no resolvable request id".to_string()),
        WebhookError::NoDecision => OrchestratorError::Validation("no actionable decision in payload".to_string()),
    };
    ApiError(mapped)
}

#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, description = "Liveness and registered-agent count")),
    tag = "orchestrator"
)]
async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(state.services.health().await)
}

async fn metrics_tokens(State(state): State<AppState>) -> Json<Value> {
    Json(state.services.metrics_tokens().await)
}
