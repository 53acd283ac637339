use axum::Json;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use simcost::SimulationConfig;
use std::sync::Arc;

use crate::api::error::{ApiError, ApiResult};
use crate::api::owner::Owner;
use crate::model::{JobStatus, SimulationJob};
use crate::server::bootstrap::ServerContext;
use crate::server::validator::{SimulationRequest, SizingHint};
use crate::{JobId, OwnerId};

pub const IDEMPOTENCY_HEADER: &str = "idempotency-key";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmittedView {
    pub job_id: JobId,
    pub status: JobStatus,
    pub estimated_cost: f64,
    /// Hours.
    pub estimated_runtime: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_reason: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchView {
    pub backend: String,
    pub queue: String,
    pub timeout_seconds: u64,
    pub nodes: u32,
}

/// Projection of a job returned to its owner.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobView {
    pub job_id: JobId,
    pub owner_id: OwnerId,
    pub status: JobStatus,
    pub config: SimulationConfig,
    pub sizing: SizingHint,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub progress: Option<f64>,
    pub estimated_cost: f64,
    pub estimated_runtime_hours: f64,
    pub estimated_storage_gb: f64,
    pub current_cost: Option<f64>,
    pub dispatch: Option<DispatchView>,
    pub results_location: Option<String>,
    pub cancel_requested: bool,
    pub status_reason: Option<String>,
}

impl From<SimulationJob> for JobView {
    fn from(job: SimulationJob) -> Self {
        Self {
            dispatch: job.dispatch.map(|record| DispatchView {
                backend: record.backend,
                queue: record.queue,
                timeout_seconds: record.timeout_seconds,
                nodes: record.nodes,
            }),
            job_id: job.job_id,
            owner_id: job.owner_id,
            status: job.status,
            config: job.config,
            sizing: job.sizing,
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
            progress: job.progress,
            estimated_cost: job.estimated_cost,
            estimated_runtime_hours: job.estimated_runtime_hours,
            estimated_storage_gb: job.estimated_storage_gb,
            current_cost: job.current_cost,
            results_location: job.results_location,
            cancel_requested: job.cancel_requested,
            status_reason: job.status_reason,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub status: Option<JobStatus>,
}

pub fn body<T>(payload: Result<Json<T>, JsonRejection>) -> ApiResult<T> {
    payload
        .map(|Json(value)| value)
        .map_err(|rejection| ApiError::invalid("body", rejection.body_text()))
}

pub fn query<T>(query: Result<Query<T>, QueryRejection>) -> ApiResult<T> {
    query
        .map(|Query(value)| value)
        .map_err(|rejection| ApiError::invalid("query", rejection.body_text()))
}

/// Creates a job and answers `201` once it is stored, whatever the dispatch outcome.
/// `status` is SUBMITTED normally, CREATED while the backend is unreachable (the monitor
/// dispatches it later) and FAILED when the backend refused the job, with `statusReason`.
pub async fn submit(
    State(ctx): State<Arc<ServerContext>>,
    Owner(owner): Owner,
    headers: HeaderMap,
    payload: Result<Json<SimulationRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<SubmittedView>)> {
    let request = body(payload)?;
    let idempotency_key = headers
        .get(IDEMPOTENCY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .map(str::to_string);
    let job = ctx
        .service
        .submit(&owner, &request, idempotency_key, Utc::now())
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(SubmittedView {
            job_id: job.job_id,
            status: job.status,
            estimated_cost: job.estimated_cost,
            estimated_runtime: job.estimated_runtime_hours,
            status_reason: job.status_reason,
        }),
    ))
}

pub async fn list(
    State(ctx): State<Arc<ServerContext>>,
    Owner(owner): Owner,
    params: Result<Query<ListQuery>, QueryRejection>,
) -> ApiResult<Json<Vec<JobView>>> {
    let params = query(params)?;
    let jobs = ctx.service.list(&owner, params.status).await?;
    Ok(Json(jobs.into_iter().map(JobView::from).collect()))
}

pub async fn get(
    State(ctx): State<Arc<ServerContext>>,
    Owner(owner): Owner,
    Path(job_id): Path<JobId>,
) -> ApiResult<Json<JobView>> {
    let job = ctx.service.get(&owner, &job_id).await?;
    Ok(Json(job.into()))
}

pub async fn cancel(
    State(ctx): State<Arc<ServerContext>>,
    Owner(owner): Owner,
    Path(job_id): Path<JobId>,
) -> ApiResult<Json<JobView>> {
    let job = ctx.service.cancel(&owner, &job_id).await?;
    Ok(Json(job.into()))
}

pub async fn delete(
    State(ctx): State<Arc<ServerContext>>,
    Owner(owner): Owner,
    Path(job_id): Path<JobId>,
) -> ApiResult<StatusCode> {
    ctx.service.delete(&owner, &job_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
