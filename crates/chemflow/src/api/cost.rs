use axum::Json;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Query, State};
use simcost::{ComparisonRow, CostEstimate};
use std::sync::Arc;

use crate::api::error::ApiResult;
use crate::api::owner::Owner;
use crate::api::simulations::{body, query};
use crate::server::bootstrap::ServerContext;
use crate::server::service::CompareQuery;
use crate::server::validator::SimulationRequest;

pub async fn estimate(
    State(ctx): State<Arc<ServerContext>>,
    _owner: Owner,
    payload: Result<Json<SimulationRequest>, JsonRejection>,
) -> ApiResult<Json<CostEstimate>> {
    let request = body(payload)?;
    Ok(Json(ctx.service.estimate(&request)?))
}

pub async fn compare(
    State(ctx): State<Arc<ServerContext>>,
    _owner: Owner,
    params: Result<Query<CompareQuery>, QueryRejection>,
) -> ApiResult<Json<Vec<ComparisonRow>>> {
    let params = query(params)?;
    Ok(Json(ctx.service.compare(&params)?))
}
