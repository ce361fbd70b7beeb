use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{MethodRouter, get, post, put},
};
use serde::{Deserialize, Serialize};
use tracing::error;

use super::calculator::{CalculateOptions, ProgressSnapshot};
use super::models::*;
use super::service::TaskService;
use super::updater::{UpdateOptions, UpdateOutcome};
use crate::config::WebSocketSection;
use crate::errors::ProgressError;

/// Header carrying the caller's company for `/api/companies/current`.
pub const COMPANY_HEADER: &str = "x-company-id";

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub service: TaskService,
    pub websocket: WebSocketSection,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateCompanyRequest {
    pub name: String,
    pub category: Option<CompanyCategory>,
    #[serde(default)]
    pub is_demo: bool,
}

#[derive(Deserialize)]
pub struct CreateTaskRequest {
    pub company_id: i64,
    pub title: String,
    pub task_type: String,
}

#[derive(Deserialize)]
pub struct TaskListQuery {
    pub company_id: Option<i64>,
}

#[derive(Deserialize)]
pub struct SaveResponseRequest {
    pub value: String,
    pub status: Option<FieldStatus>,
}

#[derive(Serialize)]
pub struct SaveResponseResult {
    pub response: FormResponse,
    /// `None` when the recompute failed; the response is saved regardless.
    pub progress: Option<TaskSummary>,
}

#[derive(Deserialize, Default)]
pub struct CalculateQuery {
    #[serde(default)]
    pub debug: bool,
}

#[derive(Serialize)]
pub struct SubmitResponse {
    pub task: Task,
    pub company: Company,
    pub tabs_changed: bool,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Forbidden(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<ProgressError> for ApiError {
    fn from(err: ProgressError) -> Self {
        let msg = err.to_string();
        match err {
            ProgressError::TaskNotFound { .. } | ProgressError::CompanyNotFound { .. } => {
                ApiError::NotFound(msg)
            }
            ProgressError::UnknownField { .. }
            | ProgressError::WrongTaskType { .. }
            | ProgressError::BadRequest(_) => ApiError::BadRequest(msg),
            ProgressError::DemoOnly { .. } => ApiError::Forbidden(msg),
            ProgressError::TaskLocked { .. } | ProgressError::TaskIncomplete { .. } => {
                ApiError::Conflict(msg)
            }
            ProgressError::Database(ref source) => {
                error!(error = ?source, "database failure");
                ApiError::Internal(msg)
            }
        }
    }
}

fn parse_task_type(raw: &str) -> Result<TaskType, ApiError> {
    TaskType::from_str(raw).map_err(ApiError::BadRequest)
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/companies", get(list_companies).post(create_company))
        .route("/api/companies/current", get(current_company))
        .route("/api/companies/{id}", get(get_company))
        .route(
            "/api/companies/{id}/unlock-file-vault",
            post(unlock_file_vault),
        )
        .route("/api/tasks", get(list_tasks).post(create_task))
        .route("/api/tasks/{id}", get(get_task))
        .route("/api/tasks/{id}/responses", get(list_responses))
        .route("/api/tasks/{id}/responses/{field_key}", put(save_response))
        .route(
            "/api/tasks/{id}/progress",
            get(calculate_progress).post(update_progress),
        )
        .route("/api/tasks/{id}/submit", post(submit_task))
        .route("/api/forms/{task_type}/fields", get(list_fields))
        .route("/api/forms/{task_type}/groups", get(list_field_groups))
        .route(
            "/api/ky3p/apply-demo-data/{task_id}",
            post(
                |State(state): State<SharedState>, Path(task_id): Path<i64>| async move {
                    apply_demo(state, task_id, TaskType::Ky3p).await
                },
            ),
        )
        .route(
            "/api/kyb/demo-autofill/{task_id}",
            demo_autofill(TaskType::CompanyKyb),
        )
        .route("/api/ky3p/demo-autofill/{task_id}", demo_autofill(TaskType::Ky3p))
        .route(
            "/api/open-banking/demo-autofill/{task_id}",
            demo_autofill(TaskType::OpenBanking),
        )
        .route("/health", get(health_check))
}

/// GET previews the demo values, POST writes them.
fn demo_autofill(task_type: TaskType) -> MethodRouter<SharedState> {
    get(
        move |State(state): State<SharedState>, Path(task_id): Path<i64>| async move {
            preview_demo(state, task_id, task_type).await
        },
    )
    .post(
        move |State(state): State<SharedState>, Path(task_id): Path<i64>| async move {
            apply_demo(state, task_id, task_type).await
        },
    )
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn list_companies(
    State(state): State<SharedState>,
) -> Result<Json<Vec<Company>>, ApiError> {
    Ok(Json(state.service.list_companies().await?))
}

async fn create_company(
    State(state): State<SharedState>,
    Json(req): Json<CreateCompanyRequest>,
) -> Result<(StatusCode, Json<Company>), ApiError> {
    let company = state
        .service
        .create_company(
            req.name,
            req.category.unwrap_or(CompanyCategory::FinTech),
            req.is_demo,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(company)))
}

async fn current_company(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Result<Json<Company>, ApiError> {
    let raw = headers
        .get(COMPANY_HEADER)
        .ok_or_else(|| ApiError::BadRequest(format!("missing {} header", COMPANY_HEADER)))?;
    let id = raw
        .to_str()
        .ok()
        .and_then(|v| v.trim().parse::<i64>().ok())
        .ok_or_else(|| ApiError::BadRequest(format!("invalid {} header", COMPANY_HEADER)))?;
    Ok(Json(state.service.get_company(id).await?))
}

async fn get_company(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<Json<Company>, ApiError> {
    Ok(Json(state.service.get_company(id).await?))
}

async fn unlock_file_vault(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<Json<Company>, ApiError> {
    Ok(Json(state.service.unlock_file_vault(id).await?))
}

async fn list_tasks(
    State(state): State<SharedState>,
    Query(query): Query<TaskListQuery>,
) -> Result<Json<Vec<Task>>, ApiError> {
    Ok(Json(state.service.list_tasks(query.company_id).await?))
}

async fn create_task(
    State(state): State<SharedState>,
    Json(req): Json<CreateTaskRequest>,
) -> Result<(StatusCode, Json<Task>), ApiError> {
    let task_type = parse_task_type(&req.task_type)?;
    if req.title.trim().is_empty() {
        return Err(ApiError::BadRequest("title is required".into()));
    }
    let task = state
        .service
        .create_task(req.company_id, req.title, task_type)
        .await?;
    Ok((StatusCode::CREATED, Json(task)))
}

async fn get_task(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<Json<Task>, ApiError> {
    Ok(Json(state.service.get_task(id).await?))
}

async fn list_responses(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<Json<Vec<FormResponse>>, ApiError> {
    Ok(Json(state.service.list_responses(id).await?))
}

async fn save_response(
    State(state): State<SharedState>,
    Path((id, field_key)): Path<(i64, String)>,
    Json(req): Json<SaveResponseRequest>,
) -> Result<Json<SaveResponseResult>, ApiError> {
    let (response, outcome) = state
        .service
        .record_response(id, field_key, req.value, req.status)
        .await?;
    Ok(Json(SaveResponseResult {
        response,
        progress: outcome.as_ref().map(|o| TaskSummary::from(o.task())),
    }))
}

async fn calculate_progress(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Query(query): Query<CalculateQuery>,
) -> Result<Json<ProgressSnapshot>, ApiError> {
    let snap = state
        .service
        .calculate(id, CalculateOptions { debug: query.debug })
        .await?;
    Ok(Json(snap))
}

async fn update_progress(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(options): Json<UpdateOptions>,
) -> Result<Json<UpdateOutcome>, ApiError> {
    Ok(Json(state.service.update_progress(id, options).await?))
}

async fn submit_task(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<Json<SubmitResponse>, ApiError> {
    let result = state.service.submit(id).await?;
    Ok(Json(SubmitResponse {
        task: result.task,
        company: result.company,
        tabs_changed: result.tabs_changed,
    }))
}

async fn list_fields(
    State(state): State<SharedState>,
    Path(task_type): Path<String>,
) -> Result<Json<Vec<FieldDefinition>>, ApiError> {
    let task_type = parse_task_type(&task_type)?;
    Ok(Json(state.service.field_definitions(task_type).await?))
}

async fn list_field_groups(
    State(state): State<SharedState>,
    Path(task_type): Path<String>,
) -> Result<Json<Vec<FieldGroupSummary>>, ApiError> {
    let task_type = parse_task_type(&task_type)?;
    Ok(Json(state.service.field_groups(task_type).await?))
}

async fn preview_demo(
    state: SharedState,
    task_id: i64,
    task_type: TaskType,
) -> Result<Json<BTreeMap<String, String>>, ApiError> {
    Ok(Json(state.service.demo_values(task_id, task_type).await?))
}

async fn apply_demo(
    state: SharedState,
    task_id: i64,
    task_type: TaskType,
) -> Result<Json<UpdateOutcome>, ApiError> {
    Ok(Json(state.service.apply_demo_data(task_id, task_type).await?))
}
