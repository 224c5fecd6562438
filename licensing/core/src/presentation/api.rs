// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! HTTP API
//!
//! | Method | Path | Use case |
//! |--------|------|----------|
//! | GET | `/health` | liveness |
//! | POST | `/webhooks/applications` | submission intake |
//! | GET | `/applications` | listing (`?status=`) |
//! | POST | `/applications/{id}/approve` | Approve |
//! | POST | `/applications/{id}/reject` | Reject |
//! | POST | `/applications/{id}/cancel` | Cancel |
//! | GET | `/applications/{id}/histories` | history (`?limit=&cursor=`) |
//! | POST | `/licenses/{id}/revoke` | Revoke |
//!
//! `{id}` is the percent-encoded application sort key. Every per-application
//! route accepts `?userId=` naming the owner; it defaults to the caller.
//!
//! The caller's identity arrives in `X-User-Id` and the role claim in
//! `X-User-Role`, both set by the upstream authorizer.

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::application::commands::{ApplicationCommandUseCase, CommandOutcome, CommandRequest};
use crate::application::error::CommandError;
use crate::application::intake::SubmitApplicationUseCase;
use crate::application::queries::ApplicationQueryService;
use crate::domain::actor::{Actor, ActorRole};
use crate::domain::application::Application;
use crate::domain::history::{HistoryEntry, HistoryPage, PageRequest};

pub const HEADER_USER_ID: &str = "x-user-id";
pub const HEADER_USER_ROLE: &str = "x-user-role";
pub const HEADER_SIGNATURE: &str = "x-signature";

pub struct AppState {
    pub submissions: Arc<dyn SubmitApplicationUseCase>,
    pub commands: Arc<dyn ApplicationCommandUseCase>,
    pub queries: Arc<dyn ApplicationQueryService>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(
        submissions: Arc<dyn SubmitApplicationUseCase>,
        commands: Arc<dyn ApplicationCommandUseCase>,
        queries: Arc<dyn ApplicationQueryService>,
    ) -> Self {
        Self {
            submissions,
            commands,
            queries,
            start_time: Instant::now(),
        }
    }
}

pub fn app(state: AppState, request_timeout: Duration) -> Router {
    let routes = Router::new()
        .route("/health", get(health_handler))
        .route("/webhooks/applications", post(submit_handler))
        .route("/applications", get(list_applications_handler))
        .route("/applications/{id}/approve", post(approve_handler))
        .route("/applications/{id}/reject", post(reject_handler))
        .route("/applications/{id}/cancel", post(cancel_handler))
        .route("/applications/{id}/histories", get(list_history_handler))
        .route("/licenses/{id}/revoke", post(revoke_handler));

    with_http_layers(routes, request_timeout).with_state(Arc::new(state))
}

/// Request tracing, and a 408 once `request_timeout` elapses
fn with_http_layers<S>(router: Router<S>, request_timeout: Duration) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    router
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, request_timeout))
}

// ============================================================================
// Errors
// ============================================================================

/// [`CommandError`] rendered as an HTTP response
#[derive(Debug)]
pub struct ApiError(pub CommandError);

impl From<CommandError> for ApiError {
    fn from(err: CommandError) -> Self {
        Self(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            CommandError::Validation(_) | CommandError::InvalidTransition { .. } => StatusCode::BAD_REQUEST,
            CommandError::Unauthenticated => StatusCode::UNAUTHORIZED,
            CommandError::AccessDenied(_) => StatusCode::FORBIDDEN,
            CommandError::NotFound(_) => StatusCode::NOT_FOUND,
            CommandError::Conflict(_) => StatusCode::CONFLICT,
            CommandError::Dependency(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut body = json!({ "error": self.0.code() });

        // Dependency details stay in the logs
        body["message"] = if self.0.is_user_facing() {
            json!(self.0.to_string())
        } else {
            json!("Internal server error")
        };
        if let CommandError::InvalidTransition { current, .. } = &self.0 {
            body["currentStatus"] = json!(current);
        }

        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

// ============================================================================
// Request / response shapes
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerQuery {
    pub user_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryQuery {
    pub limit: Option<usize>,
    pub cursor: Option<String>,
    pub user_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResponse {
    pub application: Application,
    pub history: HistoryEntry,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

impl From<CommandOutcome> for CommandResponse {
    fn from(outcome: CommandOutcome) -> Self {
        Self {
            application: outcome.application,
            history: outcome.history,
            message_id: outcome.message_id.map(|id| id.0),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ApplicationList {
    pub applications: Vec<Application>,
}

// ============================================================================
// Boundary helpers
// ============================================================================

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Resolve the caller once; the role claim is never re-read downstream
fn actor_from_headers(headers: &HeaderMap) -> Option<Actor> {
    let id = header(headers, HEADER_USER_ID)?;
    Some(Actor::new(id, ActorRole::from_claim(header(headers, HEADER_USER_ROLE))))
}

fn command_request(id: String, owner: OwnerQuery, headers: &HeaderMap, body: String) -> CommandRequest {
    CommandRequest {
        sort_key: id,
        owner_id: owner.user_id,
        actor_id: header(headers, HEADER_USER_ID).map(str::to_string),
        actor_role: ActorRole::from_claim(header(headers, HEADER_USER_ROLE)),
        body: (!body.trim().is_empty()).then_some(body),
    }
}

// ============================================================================
// Handlers
// ============================================================================

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "uptime_seconds": state.start_time.elapsed().as_secs(),
    }))
}

async fn submit_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<Application>), ApiError> {
    let application = state
        .submissions
        .submit(&body, header(&headers, HEADER_SIGNATURE))
        .await
        .inspect_err(log_dependency_failure)?;
    Ok((StatusCode::CREATED, Json(application)))
}

async fn list_applications_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
    headers: HeaderMap,
) -> ApiResult<ApplicationList> {
    let applications = state
        .queries
        .list_applications(actor_from_headers(&headers), query.status.as_deref())
        .await
        .inspect_err(log_dependency_failure)?;
    Ok(Json(ApplicationList { applications }))
}

async fn list_history_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<HistoryQuery>,
    headers: HeaderMap,
) -> ApiResult<HistoryPage> {
    let page = PageRequest::new(query.limit, query.cursor);
    let history = state
        .queries
        .list_history(actor_from_headers(&headers), &id, query.user_id.as_deref(), page)
        .await
        .inspect_err(log_dependency_failure)?;
    Ok(Json(history))
}

async fn approve_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(owner): Query<OwnerQuery>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<CommandResponse> {
    let outcome = state.commands.approve(command_request(id, owner, &headers, body)).await?;
    Ok(Json(outcome.into()))
}

async fn reject_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(owner): Query<OwnerQuery>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<CommandResponse> {
    let outcome = state.commands.reject(command_request(id, owner, &headers, body)).await?;
    Ok(Json(outcome.into()))
}

async fn cancel_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(owner): Query<OwnerQuery>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<CommandResponse> {
    let outcome = state.commands.cancel(command_request(id, owner, &headers, body)).await?;
    Ok(Json(outcome.into()))
}

async fn revoke_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(owner): Query<OwnerQuery>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<CommandResponse> {
    let outcome = state.commands.revoke(command_request(id, owner, &headers, body)).await?;
    Ok(Json(outcome.into()))
}

/// Command handlers log their own failures; queries and intake are logged here
fn log_dependency_failure(err: &CommandError) {
    if let CommandError::Dependency(detail) = err {
        error!(error = %detail, "Request failed on a dependency");
    }
}
