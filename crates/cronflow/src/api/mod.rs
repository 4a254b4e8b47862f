use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::Value;
use uuid::Uuid;

use crate::api::models::{
    paged_jobs, CreateJobRequest, DeleteJobQuery, ErrorBody, JobView, ListRunsQuery, PageQuery,
    UpdateJobRequest,
};
use crate::jobs::error::JobsError;
use crate::jobs::manager::Manager;
use crate::jobs::model::{Page, Paged, Run, RunEvent};

pub mod models;

#[derive(Clone)]
pub struct ApiState {
    pub manager: Manager,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/jobs", get(list_jobs).post(create_job))
        .route(
            "/jobs/:id",
            get(get_job).patch(update_job).delete(delete_job),
        )
        .route("/jobs/:id/trigger", post(trigger_job))
        .route("/jobs/:id/pause", post(pause_job))
        .route("/jobs/:id/resume", post(resume_job))
        .route("/runs", get(list_runs))
        .route("/runs/:id", get(get_run))
        .route("/runs/:id/events", get(list_run_events))
        .route("/runs/:id/cancel", post(cancel_run))
        .route("/health", get(health))
        .with_state(state)
}

/// `JobsError` rendered as `{"error": "..."}` with a matching status code.
pub struct ApiError(pub JobsError);

impl From<JobsError> for ApiError {
    fn from(e: JobsError) -> Self {
        Self(e)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            JobsError::Validation(_) | JobsError::Serde(_) => StatusCode::BAD_REQUEST,
            JobsError::NotFound { .. } => StatusCode::NOT_FOUND,
            JobsError::Conflict(_) => StatusCode::CONFLICT,
            JobsError::Closed => StatusCode::SERVICE_UNAVAILABLE,
            JobsError::Database(_) | JobsError::Migrate(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self.0, "request failed");
        }
        (
            status,
            Json(ErrorBody {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn decode<T: serde::de::DeserializeOwned>(body: Value) -> ApiResult<T> {
    serde_json::from_value(body).map_err(|e| ApiError(JobsError::validation(e.to_string())))
}

// ----------------------------
// Jobs
// ----------------------------

pub async fn create_job(
    State(state): State<ApiState>,
    Json(body): Json<Value>,
) -> ApiResult<(StatusCode, Json<JobView>)> {
    let req: CreateJobRequest = decode(body)?;
    let job = state.manager.create_job(req.into_new_job()?).await?;
    Ok((StatusCode::CREATED, Json(job.into())))
}

pub async fn list_jobs(
    State(state): State<ApiState>,
    Query(q): Query<PageQuery>,
) -> ApiResult<Json<Paged<JobView>>> {
    let page = state
        .manager
        .list_jobs(Page::jobs(q.offset, q.limit))
        .await?;
    Ok(Json(paged_jobs(page)))
}

pub async fn get_job(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<JobView>> {
    Ok(Json(state.manager.get_job(id).await?.into()))
}

pub async fn update_job(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    Json(body): Json<Value>,
) -> ApiResult<Json<JobView>> {
    let req: UpdateJobRequest = decode(body)?;
    let current = state.manager.get_job(id).await?;
    let patch = req.into_patch(&current)?;
    Ok(Json(state.manager.update_job(id, patch).await?.into()))
}

pub async fn delete_job(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    Query(q): Query<DeleteJobQuery>,
) -> ApiResult<StatusCode> {
    state.manager.delete_job(id, q.cancel_active).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn trigger_job(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> ApiResult<(StatusCode, Json<Run>)> {
    let run = state.manager.trigger_job(id).await?;
    Ok((StatusCode::CREATED, Json(run)))
}

pub async fn pause_job(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<JobView>> {
    Ok(Json(state.manager.pause_job(id).await?.into()))
}

pub async fn resume_job(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<JobView>> {
    Ok(Json(state.manager.resume_job(id).await?.into()))
}

// ----------------------------
// Runs
// ----------------------------

pub async fn list_runs(
    State(state): State<ApiState>,
    Query(q): Query<ListRunsQuery>,
) -> ApiResult<Json<Paged<Run>>> {
    let page = state
        .manager
        .list_runs(q.job_id, Page::jobs(q.offset, q.limit))
        .await?;
    Ok(Json(page))
}

pub async fn get_run(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Run>> {
    Ok(Json(state.manager.get_run(id).await?))
}

pub async fn list_run_events(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    Query(q): Query<PageQuery>,
) -> ApiResult<Json<Paged<RunEvent>>> {
    let page = state
        .manager
        .list_run_events(id, Page::events(q.offset, q.limit))
        .await?;
    Ok(Json(page))
}

pub async fn cancel_run(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Run>> {
    Ok(Json(state.manager.cancel_run(id).await?))
}

pub async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}
