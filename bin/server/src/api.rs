//! HTTP API for workflows, executions, credentials and webhooks.
//!
//! There is no authentication; the acting user comes from the optional
//! `x-user-id` header and is recorded as author or trigger.

use crate::error::ApiError;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use flowforge_core::{ExecutionId, UserId, WorkflowId};
use flowforge_engine::{Engine, EngineError, ExecutionRequest, WorkflowDraft};
use flowforge_integration::{Credential, CredentialData, CredentialError, CredentialResolver};
use flowforge_workflow::{Execution, ExecutionSummary, Workflow, WorkflowVersion};
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use std::fmt::Display;
use std::str::FromStr;
use tower_http::trace::TraceLayer;

/// Header naming the acting user.
pub const USER_HEADER: &str = "x-user-id";

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
    pub credentials: CredentialResolver,
}

/// Builds the API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/workflows/{id}", get(get_workflow).put(save_workflow))
        .route("/api/workflows/{id}/versions", get(list_versions))
        .route("/api/workflows/{id}/rollback/{version}", post(rollback))
        .route("/api/workflows/{id}/execute", post(execute))
        .route("/api/workflows/{id}/executions", get(list_executions))
        .route(
            "/api/executions/{id}",
            get(get_execution).delete(delete_execution),
        )
        .route("/api/executions/{id}/retry", post(retry_execution))
        .route("/api/executions/{id}/cancel", post(cancel_execution))
        .route("/api/credentials", post(store_credential))
        .route("/webhook/{workflow_id}/{*path}", post(webhook))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Converts engine and vault reports into API errors.
trait IntoApi<T> {
    fn api(self) -> Result<T, ApiError>;
}

impl<T> IntoApi<T> for flowforge_core::Result<T, EngineError> {
    fn api(self) -> Result<T, ApiError> {
        self.map_err(|report| ApiError::from(report.current_context()))
    }
}

impl<T> IntoApi<T> for flowforge_core::Result<T, CredentialError> {
    fn api(self) -> Result<T, ApiError> {
        self.map_err(|report| ApiError::from(report.current_context()))
    }
}

fn parse<T>(raw: &str) -> Result<T, ApiError>
where
    T: FromStr,
    T::Err: Display,
{
    raw.parse().map_err(ApiError::bad_request)
}

fn acting_user(headers: &HeaderMap) -> Result<Option<UserId>, ApiError> {
    let Some(value) = headers.get(USER_HEADER) else {
        return Ok(None);
    };
    let raw = value
        .to_str()
        .map_err(|_| ApiError::bad_request("x-user-id is not valid text"))?;
    parse(raw).map(Some)
}

/// An empty body is an empty object.
fn payload(body: &Bytes) -> Result<JsonValue, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(json!({}));
    }
    serde_json::from_slice(body).map_err(ApiError::bad_request)
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Started {
    execution_id: ExecutionId,
}

fn started(execution_id: ExecutionId) -> (StatusCode, Json<Started>) {
    (StatusCode::ACCEPTED, Json(Started { execution_id }))
}

async fn health() -> Json<JsonValue> {
    Json(json!({ "status": "ok" }))
}

async fn get_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Workflow>, ApiError> {
    let workflow = state.engine.get_workflow(parse(&id)?).await.api()?;
    Ok(Json(workflow))
}

async fn save_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(draft): Json<WorkflowDraft>,
) -> Result<Json<Workflow>, ApiError> {
    let author = acting_user(&headers)?;
    let workflow = state
        .engine
        .save_workflow(parse(&id)?, draft, author)
        .await
        .api()?;
    Ok(Json(workflow))
}

async fn list_versions(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<WorkflowVersion>>, ApiError> {
    let versions = state.engine.list_versions(parse(&id)?).await.api()?;
    Ok(Json(versions))
}

async fn rollback(
    State(state): State<AppState>,
    Path((id, version)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Json<Workflow>, ApiError> {
    let author = acting_user(&headers)?;
    let workflow = state
        .engine
        .rollback_workflow(parse(&id)?, parse(&version)?, author)
        .await
        .api()?;
    Ok(Json(workflow))
}

async fn execute(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<Started>), ApiError> {
    let mut request = ExecutionRequest::manual(parse(&id)?, payload(&body)?);
    if let Some(user) = acting_user(&headers)? {
        request = request.by(user);
    }
    let execution_id = state.engine.execute_workflow(request).await.api()?;
    Ok(started(execution_id))
}

async fn list_executions(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<ExecutionSummary>>, ApiError> {
    let executions = state.engine.list_executions(parse(&id)?).await.api()?;
    Ok(Json(executions))
}

async fn get_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Execution>, ApiError> {
    let execution = state.engine.get_execution(parse(&id)?).await.api()?;
    Ok(Json(execution))
}

async fn retry_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<(StatusCode, Json<Started>), ApiError> {
    let user = acting_user(&headers)?;
    let execution_id = state
        .engine
        .retry_execution(parse(&id)?, user)
        .await
        .api()?;
    Ok(started(execution_id))
}

async fn cancel_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Execution>, ApiError> {
    let execution = state.engine.cancel_execution(parse(&id)?).await.api()?;
    Ok(Json(execution))
}

async fn delete_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.engine.delete_execution(parse(&id)?).await.api()?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct NewCredential {
    name: String,
    provider: String,
    data: CredentialData,
}

async fn store_credential(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<NewCredential>,
) -> Result<(StatusCode, Json<Credential>), ApiError> {
    let owner = acting_user(&headers)?
        .ok_or_else(|| ApiError::bad_request("x-user-id is required to store credentials"))?;
    let credential = state
        .credentials
        .seal(owner, &body.name, &body.provider, &body.data)
        .await
        .api()?;
    Ok((StatusCode::CREATED, Json(credential)))
}

async fn webhook(
    State(state): State<AppState>,
    Path((workflow_id, path)): Path<(String, String)>,
    body: Bytes,
) -> Result<(StatusCode, Json<Started>), ApiError> {
    let execution_id = state
        .engine
        .webhook(parse(&workflow_id)?, &path, payload(&body)?)
        .await
        .api()?;
    Ok(started(execution_id))
}
