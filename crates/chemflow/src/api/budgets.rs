use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::sync::Arc;

use crate::api::error::ApiResult;
use crate::api::owner::Owner;
use crate::api::simulations::body;
use crate::model::{Budget, BudgetPeriod, BudgetStatus, BudgetUsage};
use crate::server::bootstrap::ServerContext;
use crate::server::budget::BudgetRequest;
use crate::BudgetId;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetView {
    pub budget_id: BudgetId,
    pub name: String,
    pub amount: f64,
    pub period: &'static str,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub alert_threshold: f64,
    pub status: BudgetStatus,
    pub alert_enabled: bool,
    pub current_usage: f64,
    pub percent_used: f64,
    pub remaining: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<(Budget, BudgetUsage)> for BudgetView {
    fn from((budget, usage): (Budget, BudgetUsage)) -> Self {
        Self {
            budget_id: budget.budget_id,
            name: budget.name,
            amount: budget.amount,
            period: match budget.period {
                BudgetPeriod::Monthly => "MONTHLY",
                BudgetPeriod::Custom { .. } => "CUSTOM",
            },
            period_start: usage.period_start,
            period_end: usage.period_end,
            alert_threshold: budget.alert_threshold,
            status: budget.status,
            alert_enabled: budget.alert_enabled,
            current_usage: usage.current_usage,
            percent_used: usage.percent_used,
            remaining: usage.remaining,
            created_at: budget.created_at,
            updated_at: budget.updated_at,
        }
    }
}

pub async fn create(
    State(ctx): State<Arc<ServerContext>>,
    Owner(owner): Owner,
    payload: Result<Json<BudgetRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<BudgetView>)> {
    let request = body(payload)?;
    let budget = ctx.budgets.create(&owner, request, Utc::now()).await?;
    Ok((StatusCode::CREATED, Json(budget.into())))
}

pub async fn list(
    State(ctx): State<Arc<ServerContext>>,
    Owner(owner): Owner,
) -> ApiResult<Json<Vec<BudgetView>>> {
    let budgets = ctx.budgets.list(&owner, Utc::now()).await?;
    Ok(Json(budgets.into_iter().map(BudgetView::from).collect()))
}

pub async fn get(
    State(ctx): State<Arc<ServerContext>>,
    Owner(owner): Owner,
    Path(budget_id): Path<BudgetId>,
) -> ApiResult<Json<BudgetView>> {
    let budget = ctx.budgets.get(&owner, &budget_id, Utc::now()).await?;
    Ok(Json(budget.into()))
}

pub async fn update(
    State(ctx): State<Arc<ServerContext>>,
    Owner(owner): Owner,
    Path(budget_id): Path<BudgetId>,
    payload: Result<Json<BudgetRequest>, JsonRejection>,
) -> ApiResult<Json<BudgetView>> {
    let request = body(payload)?;
    let budget = ctx
        .budgets
        .update(&owner, &budget_id, request, Utc::now())
        .await?;
    Ok(Json(budget.into()))
}

pub async fn delete(
    State(ctx): State<Arc<ServerContext>>,
    Owner(owner): Owner,
    Path(budget_id): Path<BudgetId>,
) -> ApiResult<StatusCode> {
    ctx.budgets.delete(&owner, &budget_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
